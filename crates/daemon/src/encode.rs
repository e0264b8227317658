//! Encode driver: one supervised transcode attempt.
//!
//! Resolves the output location, gates on free disk, probes the input,
//! picks a corruption-tolerance strategy, then runs ffmpeg with a progress
//! tap, a stall watchdog, and an overall deadline. A verified output is
//! published atomically; every failure path removes the temp artifact.

use crate::diag;
use crate::media::{tail_of, MediaError, MediaToolkit};
use crate::metrics::SharedMetrics;
use crate::store::{Task, TaskStore};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stm_config::{FfmpegConfig, SharedConfig};
use sysinfo::Disks;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Suffix of the in-flight encode artifact next to the final output.
pub const TEMP_SUFFIX: &str = ".stm_tmp";

/// Period of the stall watchdog check.
const STALL_CHECK_PERIOD: Duration = Duration::from_secs(30);

/// Upper bound on the retained encoder stderr tail.
const STDERR_TAIL_LIMIT: usize = 64 * 1024;

/// Progress writes are throttled to every this many percentage points...
const PROGRESS_WRITE_DELTA: f64 = 5.0;
/// ...or every this long, whichever comes first.
const PROGRESS_WRITE_INTERVAL: Duration = Duration::from_secs(5);

/// Error type for one encode attempt
#[derive(Debug, Error)]
pub enum EncodeError {
    /// No configured input root contains the source
    #[error("no input/output pair matches {0}")]
    NoPairForSource(PathBuf),

    /// Output directory preparation failed
    #[error("failed to create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The target filesystem could not be identified
    #[error("disk space check failed: no mount found for {0}")]
    DiskUnknown(PathBuf),

    /// The free-space gate rejected the attempt
    #[error("disk space low: {available_gb:.2} GiB available, {required_gb} GiB required")]
    DiskSpace { available_gb: f64, required_gb: u64 },

    /// Input probe failed; the message keeps the probe's own wording
    #[error(transparent)]
    Probe(MediaError),

    /// The encoder process could not be started
    #[error("failed to start encoder: {0}")]
    Spawn(std::io::Error),

    /// The encode exceeded its deadline
    #[error("encoder timeout after {timeout:?}; stderr: {stderr}")]
    Timeout { timeout: Duration, stderr: String },

    /// The watchdog killed a silent encoder
    #[error("progress stalled for {silent_secs}s (pid {pid:?}); stderr: {stderr}")]
    Stalled {
        silent_secs: u64,
        pid: Option<u32>,
        stderr: String,
    },

    /// The encoder exited with a failure status
    #[error("encoder exited with {status}; stderr: {stderr}")]
    ExitStatus { status: String, stderr: String },

    /// Post-encode verification rejected the temp output
    #[error("output verification failed: {0}")]
    OutputVerify(MediaError),

    /// The rename into place failed
    #[error("failed to publish output {path}: {source}")]
    Publish {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// What a successful attempt produced.
#[derive(Debug, Clone)]
pub struct EncodeOutcome {
    pub output_path: PathBuf,
    pub repair_mode: String,
}

/// How a supervised encoder run ended.
enum EncodeEnd {
    Exited(std::process::ExitStatus),
    TimedOut,
    Stalled { silent_secs: u64 },
}

/// Executes single transcode attempts. Cheap to clone per worker.
#[derive(Clone)]
pub struct EncodeDriver {
    config: SharedConfig,
    store: TaskStore,
    media: Arc<dyn MediaToolkit>,
    metrics: SharedMetrics,
    ffmpeg_bin: PathBuf,
}

impl EncodeDriver {
    pub fn new(
        config: SharedConfig,
        store: TaskStore,
        media: Arc<dyn MediaToolkit>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            config,
            store,
            media,
            metrics,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
        }
    }

    /// Override the encoder binary (tests use a stand-in script).
    pub fn with_ffmpeg_bin(mut self, bin: PathBuf) -> Self {
        self.ffmpeg_bin = bin;
        self
    }

    /// Run one attempt for `task`.
    pub async fn encode(&self, task: &Task) -> Result<EncodeOutcome, EncodeError> {
        let input = PathBuf::from(&task.source_path);

        let output_base = self
            .config
            .output_base_for(&input)
            .ok_or_else(|| EncodeError::NoPairForSource(input.clone()))?;
        let output_path = self.config.apply_output_extension(&output_base);

        let output_dir = output_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&output_dir).map_err(|source| EncodeError::OutputDir {
            path: output_dir.clone(),
            source,
        })?;

        let system = self.config.system();
        self.check_disk_space(&output_dir, system.min_disk_space_gb)?;

        let cfg = self.config.ffmpeg();
        let probe_timeout = Duration::from_secs(cfg.probe_timeout_seconds);

        self.media
            .probe(&input, probe_timeout, cfg.verify_decode_seconds)
            .await
            .map_err(EncodeError::Probe)?;

        let duration = match self.media.duration(&input, probe_timeout).await {
            Ok(d) => d,
            Err(e) => {
                // Without a duration the deadline falls back to the
                // configured ceiling and no percentage is derived.
                warn!(task_id = task.id, error = %e, "duration query failed");
                0.0
            }
        };

        let repair_mode = self.select_corrupt_strategy(&input, &cfg).await;
        if let Err(e) = self.store.update_repair_mode(task.id, &repair_mode).await {
            warn!(task_id = task.id, error = %e, "failed to record repair mode");
        }

        let temp_path = temp_output_path(&output_path);
        let result = self
            .attempt(task, &input, &output_path, &temp_path, duration, &repair_mode, &cfg)
            .await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&temp_path).await;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        task: &Task,
        input: &Path,
        output_path: &Path,
        temp_path: &Path,
        duration: f64,
        repair_mode: &str,
        cfg: &FfmpegConfig,
    ) -> Result<EncodeOutcome, EncodeError> {
        self.run_encoder(task, input, temp_path, duration, repair_mode, cfg)
            .await?;

        if cfg.strict_check {
            self.verify_output(temp_path, cfg).await?;
        }

        // Publish atomically; a stale final output is removed and the
        // rename retried once.
        if tokio::fs::rename(temp_path, output_path).await.is_err() {
            let _ = tokio::fs::remove_file(output_path).await;
            tokio::fs::rename(temp_path, output_path)
                .await
                .map_err(|source| EncodeError::Publish {
                    path: output_path.to_path_buf(),
                    source,
                })?;
        }

        info!(
            task_id = task.id,
            output = %output_path.display(),
            "output published"
        );

        Ok(EncodeOutcome {
            output_path: output_path.to_path_buf(),
            repair_mode: repair_mode.to_string(),
        })
    }

    async fn run_encoder(
        &self,
        task: &Task,
        input: &Path,
        temp_path: &Path,
        duration: f64,
        repair_mode: &str,
        cfg: &FfmpegConfig,
    ) -> Result<(), EncodeError> {
        let discard_corrupt = cfg.discard_corrupt || !repair_mode.is_empty();
        let args = build_encoder_args(cfg, discard_corrupt, repair_mode, input, temp_path);
        debug!(task_id = task.id, ?args, "starting encoder");

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EncodeError::Spawn)?;
        let pid = child.id();

        let started = Instant::now();
        // Seconds since `started` at which progress was last seen
        let last_progress = Arc::new(AtomicU64::new(0));
        let stderr_tail = Arc::new(std::sync::Mutex::new(String::new()));

        let stderr_handle = child.stderr.take().map(|stderr| {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut buf = tail.lock().unwrap_or_else(|e| e.into_inner());
                    buf.push_str(&line);
                    buf.push('\n');
                    if buf.len() > STDERR_TAIL_LIMIT {
                        let mut excess = buf.len() - STDERR_TAIL_LIMIT;
                        while !buf.is_char_boundary(excess) {
                            excess += 1;
                        }
                        buf.drain(..excess);
                    }
                }
            })
        });

        let progress_handle = child.stdout.take().map(|stdout| {
            let store = self.store.clone();
            let last = last_progress.clone();
            let task_id = task.id;
            tokio::spawn(async move {
                tap_progress(stdout, store, task_id, duration, started, last).await;
            })
        });

        // Watchdog: flag the encode once progress has been silent too long
        let stall_after = Duration::from_secs(cfg.progress_stall_minutes * 60);
        let (stall_tx, mut stall_rx) = mpsc::channel::<u64>(1);
        let watchdog_handle = {
            let last = last_progress.clone();
            let input = input.to_path_buf();
            let output = temp_path.to_path_buf();
            let task_id = task.id;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(STALL_CHECK_PERIOD);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await; // first tick fires immediately
                loop {
                    ticker.tick().await;
                    let elapsed = started.elapsed().as_secs();
                    if let Some(silent) =
                        stalled_for(elapsed, last.load(Ordering::Relaxed), stall_after)
                    {
                        diag::log_stall_diagnostics(task_id, pid, &input, &output, silent);
                        let _ = stall_tx.send(silent).await;
                        return;
                    }
                }
            })
        };

        let deadline = compute_encode_deadline(duration, cfg);
        let timeout_sleep = tokio::time::sleep(deadline);
        tokio::pin!(timeout_sleep);

        let end = loop {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => break EncodeEnd::Exited(status),
                        Err(source) => return Err(EncodeError::Spawn(source)),
                    }
                }
                _ = &mut timeout_sleep => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    break EncodeEnd::TimedOut;
                }
                Some(silent_secs) = stall_rx.recv() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    break EncodeEnd::Stalled { silent_secs };
                }
            }
        };

        watchdog_handle.abort();
        if let Some(handle) = progress_handle {
            let _ = handle.await;
        }
        if let Some(handle) = stderr_handle {
            let _ = handle.await;
        }

        let stderr = {
            let buf = stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
            tail_of(&buf, 500)
        };

        match end {
            EncodeEnd::Exited(status) if status.success() => Ok(()),
            EncodeEnd::Exited(status) => Err(EncodeError::ExitStatus {
                status: status.to_string(),
                stderr,
            }),
            EncodeEnd::TimedOut => Err(EncodeError::Timeout {
                timeout: deadline,
                stderr,
            }),
            EncodeEnd::Stalled { silent_secs } => Err(EncodeError::Stalled {
                silent_secs,
                pid,
                stderr,
            }),
        }
    }

    async fn verify_output(&self, temp_path: &Path, cfg: &FfmpegConfig) -> Result<(), EncodeError> {
        let probe_timeout = Duration::from_secs(cfg.probe_timeout_seconds);

        self.media
            .probe(temp_path, probe_timeout, 0)
            .await
            .map_err(EncodeError::OutputVerify)?;

        if cfg.verify_decode_seconds > 0 {
            self.media
                .decode_strict(temp_path, probe_timeout, 0, cfg.verify_decode_seconds)
                .await
                .map_err(EncodeError::OutputVerify)?;

            if cfg.verify_tail_seek_seconds > 0 {
                self.media
                    .decode_strict(
                        temp_path,
                        probe_timeout,
                        cfg.verify_tail_seek_seconds,
                        cfg.verify_decode_seconds,
                    )
                    .await
                    .map_err(EncodeError::OutputVerify)?;
            }
        }

        Ok(())
    }

    /// Pick the corruption-tolerance strategy for this input.
    async fn select_corrupt_strategy(&self, input: &Path, cfg: &FfmpegConfig) -> String {
        match cfg.corrupt_strategy.as_str() {
            "discard" | "cfr" => return cfg.corrupt_strategy.clone(),
            "auto" => {}
            // Anything unexpected degrades to the safest strategy
            _ => return "cfr".to_string(),
        }

        if cfg.corrupt_probe_seconds == 0 {
            debug!("corruption sampling disabled, defaulting to cfr");
            return "cfr".to_string();
        }

        // Sampling needs at least the sample window plus spin-up slack
        let mut timeout = Duration::from_secs(cfg.probe_timeout_seconds);
        let needed = Duration::from_secs(u64::from(cfg.corrupt_probe_seconds) + 5);
        if needed > timeout {
            timeout = needed;
        }

        match self
            .media
            .count_decoder_errors(input, timeout, cfg.corrupt_probe_seconds)
            .await
        {
            Err(e) => {
                warn!(input = %input.display(), error = %e, "corruption sampling failed, degrading to cfr");
                "cfr".to_string()
            }
            Ok(count) => {
                let threshold = cfg.corrupt_error_threshold.max(1);
                if count >= threshold {
                    info!(
                        input = %input.display(),
                        count, threshold, "decoder errors over threshold, re-timing to cfr"
                    );
                    "cfr".to_string()
                } else {
                    debug!(input = %input.display(), count, threshold, "dropping corrupt packets only");
                    "discard".to_string()
                }
            }
        }
    }

    fn check_disk_space(&self, dir: &Path, min_gb: u64) -> Result<(), EncodeError> {
        let available = available_disk_space(dir)
            .ok_or_else(|| EncodeError::DiskUnknown(dir.to_path_buf()))?;
        self.metrics.disk_space_available_bytes.set(available as f64);

        let available_gb = available as f64 / 1024.0 / 1024.0 / 1024.0;
        if available_gb < min_gb as f64 {
            return Err(EncodeError::DiskSpace {
                available_gb,
                required_gb: min_gb,
            });
        }
        debug!(dir = %dir.display(), available_gb, "disk gate passed");
        Ok(())
    }
}

/// Free bytes on the filesystem holding `path` (longest mount-point match).
pub fn available_disk_space(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    let path_str = path.to_string_lossy();

    let mut best: Option<u64> = None;
    let mut best_len = 0usize;
    for disk in disks.list() {
        let mount = disk.mount_point().to_string_lossy();
        let matches = if mount == "/" {
            path_str.starts_with('/')
        } else {
            path_str == mount || path_str.starts_with(&format!("{mount}/"))
        };
        if matches && mount.len() >= best_len {
            best_len = mount.len();
            best = Some(disk.available_space());
        }
    }
    best
}

/// The in-flight artifact path: the final path with the temp suffix appended.
pub fn temp_output_path(output_path: &Path) -> PathBuf {
    let mut os = output_path.as_os_str().to_owned();
    os.push(TEMP_SUFFIX);
    PathBuf::from(os)
}

/// Build the full encoder argument list for one attempt.
pub fn build_encoder_args(
    cfg: &FfmpegConfig,
    discard_corrupt: bool,
    repair_mode: &str,
    input: &Path,
    temp_output: &Path,
) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-progress".to_string(),
        "pipe:1".to_string(),
    ];
    if discard_corrupt {
        args.push("-fflags".to_string());
        args.push("+discardcorrupt".to_string());
        args.push("-err_detect".to_string());
        args.push("ignore_err".to_string());
    }
    args.extend([
        "-i".to_string(),
        input.display().to_string(),
        "-c:v".to_string(),
        cfg.codec.clone(),
        "-preset".to_string(),
        cfg.preset.clone(),
        "-crf".to_string(),
        cfg.crf.to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-c:a".to_string(),
        cfg.audio.clone(),
        "-b:a".to_string(),
        cfg.audio_bitrate.clone(),
    ]);
    if repair_mode == "cfr" {
        let fps = if cfg.output_fps > 0 { cfg.output_fps } else { 30 };
        args.push("-fps_mode".to_string());
        args.push("cfr".to_string());
        args.push("-r".to_string());
        args.push(fps.to_string());
    }
    args.extend([
        "-movflags".to_string(),
        "+faststart".to_string(),
        temp_output.display().to_string(),
    ]);
    args
}

/// The encode deadline: the configured ceiling, or the duration-derived
/// bound when that is longer.
pub fn compute_encode_deadline(duration_secs: f64, cfg: &FfmpegConfig) -> Duration {
    let mut deadline = Duration::from_secs(cfg.max_duration_hours * 3600);
    if duration_secs > 0.0 && cfg.duration_factor > 0.0 {
        let candidate = Duration::from_secs_f64(duration_secs * cfg.duration_factor)
            + Duration::from_secs(cfg.duration_extra_minutes * 60);
        if candidate > deadline {
            deadline = candidate;
        }
    }
    deadline
}

/// Microseconds of encoded output from one `out_time_ms=` progress record.
pub fn parse_progress_line(line: &str) -> Option<i64> {
    let value = line.strip_prefix("out_time_ms=")?;
    value.trim().parse::<i64>().ok()
}

/// Percentage of the input encoded so far, clamped to [0, 100].
pub fn compute_progress(out_time_us: i64, duration_secs: f64) -> f64 {
    let out_secs = out_time_us as f64 / 1_000_000.0;
    (out_secs / duration_secs * 100.0).clamp(0.0, 100.0)
}

/// Whether the progress column is due for a write.
pub fn should_write_progress(progress: f64, last_written: f64, since_last_write: Duration) -> bool {
    progress - last_written >= PROGRESS_WRITE_DELTA || since_last_write >= PROGRESS_WRITE_INTERVAL
}

/// Seconds of silence, if the watchdog threshold has been exceeded.
pub fn stalled_for(elapsed_secs: u64, last_progress_secs: u64, stall_after: Duration) -> Option<u64> {
    let silent = elapsed_secs.saturating_sub(last_progress_secs);
    if silent > stall_after.as_secs() {
        Some(silent)
    } else {
        None
    }
}

/// Read the encoder's machine progress stream, refreshing the watchdog
/// timestamp on every record and writing throttled percentage updates.
/// A failed write never aborts the encode.
async fn tap_progress(
    stdout: tokio::process::ChildStdout,
    store: TaskStore,
    task_id: i64,
    duration_secs: f64,
    started: Instant,
    last_progress: Arc<AtomicU64>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut last_written = 0.0f64;
    let mut last_write = Instant::now();

    while let Ok(Some(line)) = lines.next_line().await {
        let Some(out_time_us) = parse_progress_line(&line) else {
            continue;
        };

        last_progress.store(started.elapsed().as_secs(), Ordering::Relaxed);

        if duration_secs <= 0.0 {
            continue;
        }

        let progress = compute_progress(out_time_us, duration_secs);
        if should_write_progress(progress, last_written, last_write.elapsed()) {
            if let Err(e) = store.update_progress(task_id, progress).await {
                debug!(task_id, error = %e, "progress write failed");
            }
            last_written = progress;
            last_write = Instant::now();
            debug!(task_id, progress, "encode progress");
        }
    }
}
