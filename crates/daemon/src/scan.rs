//! Scanner module: reconciles watched directories with the task store.
//!
//! Walks each configured input root on a fixed interval (or on operator
//! demand), creating tasks for new files, resetting tasks whose source
//! fingerprint changed, and re-queueing completed tasks whose outputs went
//! missing. With strict checking enabled a verification pass probes every
//! completed output and requeues the corrupt ones.

use crate::media::MediaToolkit;
use crate::store::{StoreError, Task, TaskStatus, TaskStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use stm_config::{FfmpegConfig, SharedConfig};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Directory names never descended into, besides the configured trash name.
pub const IGNORED_DIRS: &[&str] = &["@eaDir", "#recycle", ".DS_Store"];

/// Batch size for paging completed tasks during output verification.
const VERIFY_BATCH_SIZE: i64 = 200;

/// Error type for scan passes
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Counters from one scan pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub new: usize,
    pub updated: usize,
    pub skipped: usize,
    /// Completed outputs probed successfully
    pub verified: usize,
    /// Completed tasks requeued for a missing output
    pub missing: usize,
    /// Completed tasks requeued for a corrupt output
    pub requeued: usize,
    /// The pass was cancelled before finishing
    pub cancelled: bool,
}

enum FileAction {
    New,
    Updated,
    Skipped,
}

/// Directory scanner. Cheap to clone; shares the store and config handles.
#[derive(Clone)]
pub struct Scanner {
    config: SharedConfig,
    store: TaskStore,
    media: Arc<dyn MediaToolkit>,
}

impl Scanner {
    pub fn new(config: SharedConfig, store: TaskStore, media: Arc<dyn MediaToolkit>) -> Self {
        Self {
            config,
            store,
            media,
        }
    }

    /// Run one full scan pass over every configured pair, then (with strict
    /// checking on) the output verification pass. Cancellation is a normal
    /// early return.
    pub async fn scan(&self, cancel: &CancellationToken) -> Result<ScanSummary, ScanError> {
        let pairs = self.config.pairs();
        info!(pairs = pairs.len(), "scan started");
        let started = std::time::Instant::now();

        let mut summary = ScanSummary::default();
        for pair in &pairs {
            self.scan_directory(cancel, &pair.input, &pair.output, &mut summary)
                .await;
            if summary.cancelled {
                info!("scan cancelled");
                return Ok(summary);
            }
        }

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            new = summary.new,
            updated = summary.updated,
            skipped = summary.skipped,
            "scan finished"
        );

        self.verify_completed_outputs(cancel, &mut summary).await?;
        Ok(summary)
    }

    async fn scan_directory(
        &self,
        cancel: &CancellationToken,
        input_root: &Path,
        output_root: &Path,
        summary: &mut ScanSummary,
    ) {
        if !input_root.exists() {
            warn!(input = %input_root.display(), "input root missing, skipping");
            return;
        }

        let trash = self.config.trash_dir_name();
        let exclude = self.config.ffmpeg().exclude_patterns;

        let walker = WalkDir::new(input_root).into_iter().filter_entry(|entry| {
            if entry.file_type().is_dir() && entry.depth() > 0 {
                if let Some(name) = entry.file_name().to_str() {
                    if should_skip_dir(name, &trash) {
                        debug!(dir = %entry.path().display(), "skipping system directory");
                        return false;
                    }
                }
            }
            true
        });

        for entry in walker {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                return;
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "walk entry failed");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy();
            if should_skip_file(&name, &exclude) {
                continue;
            }
            if !self.config.is_video_file(entry.path()) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "stat failed");
                    continue;
                }
            };
            let mtime = metadata
                .modified()
                .map(system_time_to_millis)
                .unwrap_or(0);
            let size = metadata.len() as i64;

            let rel = match entry.path().strip_prefix(input_root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };

            match self
                .process_file(entry.path(), &rel, output_root, mtime, size)
                .await
            {
                Ok(FileAction::New) => summary.new += 1,
                Ok(FileAction::Updated) => summary.updated += 1,
                Ok(FileAction::Skipped) => summary.skipped += 1,
                Err(e) => {
                    // The file will be seen again on the next pass
                    warn!(path = %entry.path().display(), error = %e, "store error, file skipped");
                }
            }
        }
    }

    async fn process_file(
        &self,
        full_path: &Path,
        rel_path: &Path,
        output_root: &Path,
        mtime: i64,
        size: i64,
    ) -> Result<FileAction, StoreError> {
        let full = full_path.to_string_lossy().to_string();
        let mut task = self.store.get_by_path(&full).await?;

        // Early releases stored root-relative paths; rewrite on sight
        if task.is_none() {
            let rel = rel_path.to_string_lossy().to_string();
            if let Some(legacy) = self.store.get_by_path(&rel).await? {
                info!(old = %rel, new = %full, "migrating legacy task path");
                self.store.update_path(legacy.id, &full).await?;
                task = self.store.get_by_path(&full).await?;
            }
        }

        let task = match task {
            None => {
                self.store.create(&full, mtime, size).await?;
                info!(path = %full, size_mb = size as f64 / 1024.0 / 1024.0, "new file discovered");
                return Ok(FileAction::New);
            }
            Some(task) => task,
        };

        // A changed fingerprint means a different file under the same name
        if task.source_mtime != mtime || task.source_size != size {
            self.store.reset_to_pending(&full, mtime, size).await?;
            info!(path = %full, "source changed, task reset");
            return Ok(FileAction::Updated);
        }

        if task.status == TaskStatus::Completed {
            let base = output_root.join(rel_path);
            let target = self.config.apply_output_extension(&base);
            if target.exists() {
                return Ok(FileAction::Skipped);
            }
            // Outputs produced before the extension override existed are
            // still accepted at the original extension
            if target != base && base.exists() {
                return Ok(FileAction::Skipped);
            }
            self.store.reset_to_pending(&full, mtime, size).await?;
            info!(path = %full, "output lost, task reset");
            return Ok(FileAction::Updated);
        }

        Ok(FileAction::Skipped)
    }

    /// Probe every completed output, requeueing tasks whose output is
    /// missing or fails a decode check.
    async fn verify_completed_outputs(
        &self,
        cancel: &CancellationToken,
        summary: &mut ScanSummary,
    ) -> Result<(), ScanError> {
        let cfg = self.config.ffmpeg();
        if !cfg.strict_check {
            return Ok(());
        }

        info!("verifying completed outputs");
        let mut offset = 0i64;
        loop {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                return Ok(());
            }

            let tasks = self
                .store
                .get_all(Some(TaskStatus::Completed), VERIFY_BATCH_SIZE, offset)
                .await?;
            if tasks.is_empty() {
                break;
            }

            for task in &tasks {
                if cancel.is_cancelled() {
                    summary.cancelled = true;
                    return Ok(());
                }
                self.verify_one(task, &cfg, summary).await;
            }

            offset += tasks.len() as i64;
        }

        info!(
            verified = summary.verified,
            missing = summary.missing,
            requeued = summary.requeued,
            "output verification finished"
        );
        Ok(())
    }

    async fn verify_one(&self, task: &Task, cfg: &FfmpegConfig, summary: &mut ScanSummary) {
        let source = PathBuf::from(&task.source_path);
        let Some(base) = self.config.output_base_for(&source) else {
            return;
        };
        let primary = self.config.apply_output_extension(&base);

        let check_path = if primary.exists() {
            primary
        } else if primary != base && base.exists() {
            base
        } else {
            if self
                .reset_for_recode(task, "output missing, queued for re-encode")
                .await
            {
                summary.missing += 1;
            }
            return;
        };

        let probe_timeout = Duration::from_secs(cfg.probe_timeout_seconds);
        let mut check = self.media.probe(&check_path, probe_timeout, 0).await;
        if check.is_ok() && cfg.verify_decode_seconds > 0 {
            check = self
                .media
                .decode_strict(&check_path, probe_timeout, 0, cfg.verify_decode_seconds)
                .await;
            if check.is_ok() && cfg.verify_tail_seek_seconds > 0 {
                check = self
                    .media
                    .decode_strict(
                        &check_path,
                        probe_timeout,
                        cfg.verify_tail_seek_seconds,
                        cfg.verify_decode_seconds,
                    )
                    .await;
            }
        }

        match check {
            Ok(()) => summary.verified += 1,
            Err(e) => {
                warn!(output = %check_path.display(), error = %e, "completed output failed verification");
                // Reset first: a failed delete must not strand a completed
                // task pointing at a corrupt file. The next encode
                // overwrites whatever is left behind.
                if !self
                    .reset_for_recode(task, "output corrupt, queued for re-encode")
                    .await
                {
                    return;
                }
                summary.requeued += 1;
                if let Err(e) = std::fs::remove_file(&check_path) {
                    warn!(output = %check_path.display(), error = %e, "could not remove corrupt output");
                }
            }
        }
    }

    /// Reset a task for re-encoding with a log note, refreshing the
    /// fingerprint from disk. Returns false when the source is unreadable.
    async fn reset_for_recode(&self, task: &Task, reason: &str) -> bool {
        let metadata = match std::fs::metadata(&task.source_path) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %task.source_path, error = %e, "source unreadable, not resetting");
                return false;
            }
        };
        let mtime = metadata
            .modified()
            .map(system_time_to_millis)
            .unwrap_or(0);
        let size = metadata.len() as i64;

        if let Err(e) = self
            .store
            .reset_to_pending(&task.source_path, mtime, size)
            .await
        {
            warn!(path = %task.source_path, error = %e, "reset failed");
            return false;
        }
        if let Err(e) = self
            .store
            .update_status(task.id, TaskStatus::Pending, reason)
            .await
        {
            warn!(path = %task.source_path, error = %e, "reset note failed");
        }
        true
    }

    /// Scan immediately, then on every interval tick until cancelled.
    /// Operator-triggered scans run through `scan` directly on their own
    /// uncancelled token.
    pub async fn run_periodically(&self, cancel: CancellationToken) {
        let interval_minutes = self.config.system().scan_interval_minutes;
        info!(interval_minutes, "periodic scanning started");

        if let Err(e) = self.scan(&cancel).await {
            warn!(error = %e, "scan failed");
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(interval_minutes * 60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the immediate tick was handled above

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("periodic scanning stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.scan(&cancel).await {
                        warn!(error = %e, "scan failed");
                    }
                }
            }
        }
    }
}

/// Directories that are never walked.
pub fn should_skip_dir(name: &str, trash_dir: &str) -> bool {
    name == trash_dir || IGNORED_DIRS.contains(&name)
}

/// Files that are never considered.
pub fn should_skip_file(name: &str, exclude_patterns: &[String]) -> bool {
    if name.starts_with("SYNOPHOTO_") || name.starts_with('.') {
        return true;
    }
    if name.ends_with(".tmp") || name.ends_with(".part") || name.ends_with(".lock") {
        return true;
    }
    exclude_patterns
        .iter()
        .any(|pattern| !pattern.is_empty() && name.contains(pattern.as_str()))
}

fn system_time_to_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaError;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use stm_config::Config;
    use tempfile::TempDir;

    /// Toolkit stub: fails checks for registered paths, passes the rest.
    #[derive(Default)]
    struct StubMedia {
        corrupt: Mutex<HashSet<PathBuf>>,
    }

    impl StubMedia {
        fn mark_corrupt(&self, path: &Path) {
            self.corrupt.lock().unwrap().insert(path.to_path_buf());
        }

        fn is_corrupt(&self, path: &Path) -> bool {
            self.corrupt.lock().unwrap().contains(path)
        }
    }

    #[async_trait]
    impl MediaToolkit for StubMedia {
        async fn probe(
            &self,
            path: &Path,
            _timeout: Duration,
            _decode_seconds: u32,
        ) -> Result<(), MediaError> {
            if self.is_corrupt(path) {
                Err(MediaError::StreamCheck("stub corrupt".to_string()))
            } else {
                Ok(())
            }
        }

        async fn decode_strict(
            &self,
            path: &Path,
            _timeout: Duration,
            _seek_seconds: u32,
            _decode_seconds: u32,
        ) -> Result<(), MediaError> {
            if self.is_corrupt(path) {
                Err(MediaError::Decode("stub corrupt".to_string()))
            } else {
                Ok(())
            }
        }

        async fn count_decoder_errors(
            &self,
            _path: &Path,
            _timeout: Duration,
            _sample_seconds: u32,
        ) -> Result<u32, MediaError> {
            Ok(0)
        }

        async fn duration(&self, _path: &Path, _timeout: Duration) -> Result<f64, MediaError> {
            Ok(60.0)
        }
    }

    struct Fixture {
        _dir: TempDir,
        input: PathBuf,
        output: PathBuf,
        store: TaskStore,
        media: Arc<StubMedia>,
        scanner: Scanner,
    }

    async fn fixture() -> Fixture {
        fixture_with(|_| {}).await
    }

    async fn fixture_with(tweak: impl FnOnce(&mut Config)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&output).unwrap();

        let mut config = Config::parse_toml("").unwrap();
        config.path.pairs = vec![stm_config::DirectoryPair {
            input: input.clone(),
            output: output.clone(),
        }];
        config.ffmpeg.extensions = vec![".mp4".to_string(), ".mkv".to_string()];
        config.ffmpeg.strict_check = false;
        tweak(&mut config);
        config.validate().unwrap();

        let store = TaskStore::open(&dir.path().join("tasks.db")).await.unwrap();
        let media = Arc::new(StubMedia::default());
        let scanner = Scanner::new(SharedConfig::new(config), store.clone(), media.clone());

        Fixture {
            _dir: dir,
            input,
            output,
            store,
            media,
            scanner,
        }
    }

    fn write_file(path: &Path, len: usize) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![0u8; len]).unwrap();
    }

    #[tokio::test]
    async fn test_new_file_becomes_pending_task() {
        let fx = fixture().await;
        let video = fx.input.join("a/b/video.mp4");
        write_file(&video, 1024);

        let summary = fx.scanner.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.new, 1);
        assert_eq!(summary.updated, 0);

        let task = fx
            .store
            .get_by_path(&video.to_string_lossy())
            .await
            .unwrap()
            .expect("task created");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.source_size, 1024);
        assert_eq!(task.retry_count, 0);
        let expected_mtime =
            system_time_to_millis(std::fs::metadata(&video).unwrap().modified().unwrap());
        assert_eq!(task.source_mtime, expected_mtime);
    }

    #[tokio::test]
    async fn test_rescan_of_unchanged_tree_changes_nothing() {
        let fx = fixture().await;
        write_file(&fx.input.join("v.mp4"), 100);

        fx.scanner.scan(&CancellationToken::new()).await.unwrap();
        let before = fx.store.get_all(None, 100, 0).await.unwrap();

        let summary = fx.scanner.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.new, 0);
        assert_eq!(summary.updated, 0);
        assert_eq!(summary.skipped, 1);

        let after = fx.store.get_all(None, 100, 0).await.unwrap();
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.status, a.status);
            assert_eq!(b.source_mtime, a.source_mtime);
        }
    }

    #[tokio::test]
    async fn test_changed_fingerprint_resets_task() {
        let fx = fixture().await;
        let video = fx.input.join("v.mp4");
        write_file(&video, 100);
        fx.scanner.scan(&CancellationToken::new()).await.unwrap();

        let task = fx
            .store
            .get_by_path(&video.to_string_lossy())
            .await
            .unwrap()
            .unwrap();
        fx.store
            .update_status(task.id, TaskStatus::Completed, "transcode complete")
            .await
            .unwrap();

        // Same name, different content
        write_file(&video, 200);
        let summary = fx.scanner.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.updated, 1);

        let task = fx.store.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.source_size, 200);
        assert_eq!(task.retry_count, 0);
        assert!(task.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_skip_rules() {
        let fx = fixture().await;
        write_file(&fx.input.join("keep.mp4"), 10);
        write_file(&fx.input.join(".hidden.mp4"), 10);
        write_file(&fx.input.join("SYNOPHOTO_THUMB.mp4"), 10);
        write_file(&fx.input.join("partial.mp4.tmp"), 10);
        write_file(&fx.input.join("downloading.part"), 10);
        write_file(&fx.input.join("held.lock"), 10);
        write_file(&fx.input.join("notes.txt"), 10);
        write_file(&fx.input.join("@eaDir/thumb.mp4"), 10);
        write_file(&fx.input.join("#recycle/old.mp4"), 10);
        write_file(&fx.input.join(".stm_trash/gone.mp4"), 10);
        write_file(&fx.input.join(".cache/deep/video.mp4"), 10);

        let summary = fx.scanner.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.new, 1);

        let tasks = fx.store.get_all(None, 100, 0).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].source_path.ends_with("keep.mp4"));
    }

    #[tokio::test]
    async fn test_exclude_patterns_filter_by_substring() {
        let fx = fixture_with(|c| {
            c.ffmpeg.exclude_patterns = vec!["sample".to_string()];
        })
        .await;
        write_file(&fx.input.join("movie.mp4"), 10);
        write_file(&fx.input.join("movie.sample.mp4"), 10);

        let summary = fx.scanner.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.new, 1);
    }

    #[tokio::test]
    async fn test_completed_task_with_output_present_is_skipped() {
        let fx = fixture().await;
        let video = fx.input.join("v.mp4");
        write_file(&video, 100);
        fx.scanner.scan(&CancellationToken::new()).await.unwrap();

        let task = fx
            .store
            .get_by_path(&video.to_string_lossy())
            .await
            .unwrap()
            .unwrap();
        fx.store
            .update_status(task.id, TaskStatus::Completed, "transcode complete")
            .await
            .unwrap();
        write_file(&fx.output.join("v.mp4"), 50);

        fx.scanner.scan(&CancellationToken::new()).await.unwrap();
        let task = fx.store.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_vanished_output_resets_completed_task() {
        let fx = fixture().await;
        let video = fx.input.join("v.mp4");
        write_file(&video, 100);
        fx.scanner.scan(&CancellationToken::new()).await.unwrap();

        let task = fx
            .store
            .get_by_path(&video.to_string_lossy())
            .await
            .unwrap()
            .unwrap();
        let fingerprint = (task.source_mtime, task.source_size);
        fx.store
            .update_status(task.id, TaskStatus::Completed, "transcode complete")
            .await
            .unwrap();
        // No file at /out/v.mp4

        let summary = fx.scanner.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.updated, 1);

        let task = fx.store.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.completed_at.is_none());
        assert_eq!((task.source_mtime, task.source_size), fingerprint);
    }

    #[tokio::test]
    async fn test_pre_override_output_still_counts_as_present() {
        let fx = fixture_with(|c| {
            c.ffmpeg.output_extension = ".mp4".to_string();
        })
        .await;
        let video = fx.input.join("v.mkv");
        write_file(&video, 100);
        fx.scanner.scan(&CancellationToken::new()).await.unwrap();

        let task = fx
            .store
            .get_by_path(&video.to_string_lossy())
            .await
            .unwrap()
            .unwrap();
        fx.store
            .update_status(task.id, TaskStatus::Completed, "transcode complete")
            .await
            .unwrap();
        // Output exists only at the original extension
        write_file(&fx.output.join("v.mkv"), 50);

        fx.scanner.scan(&CancellationToken::new()).await.unwrap();
        let task = fx.store.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_legacy_relative_path_is_migrated() {
        let fx = fixture().await;
        let video = fx.input.join("a/v.mp4");
        write_file(&video, 100);

        // An old release stored the root-relative path
        fx.store.create("a/v.mp4", 1, 1).await.unwrap();

        fx.scanner.scan(&CancellationToken::new()).await.unwrap();

        assert!(fx.store.get_by_path("a/v.mp4").await.unwrap().is_none());
        let migrated = fx
            .store
            .get_by_path(&video.to_string_lossy())
            .await
            .unwrap()
            .expect("path rewritten");
        // The fingerprint changed against the stale record, so the task
        // was also reset with fresh metadata
        assert_eq!(migrated.source_size, 100);
        let tasks = fx.store.get_all(None, 100, 0).await.unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_scan_returns_early() {
        let fx = fixture().await;
        write_file(&fx.input.join("v.mp4"), 100);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = fx.scanner.scan(&cancel).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.new, 0);
        assert!(fx.store.get_all(None, 100, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verify_pass_requeues_missing_output() {
        let fx = fixture_with(|c| {
            c.ffmpeg.strict_check = true;
            // Narrow extension set: the .mkv source is not re-enumerated,
            // so only the verification pass can notice the lost output
            c.ffmpeg.extensions = vec![".mp4".to_string()];
        })
        .await;
        let video = fx.input.join("v.mkv");
        write_file(&video, 100);

        let task = fx
            .store
            .create(&video.to_string_lossy(), 1, 100)
            .await
            .unwrap();
        fx.store
            .update_status(task.id, TaskStatus::Completed, "transcode complete")
            .await
            .unwrap();

        let summary = fx.scanner.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.missing, 1);

        let task = fx.store.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.log_text(), "output missing, queued for re-encode");
    }

    #[tokio::test]
    async fn test_verify_pass_resets_and_removes_corrupt_output() {
        let fx = fixture_with(|c| {
            c.ffmpeg.strict_check = true;
        })
        .await;
        let video = fx.input.join("v.mp4");
        write_file(&video, 100);
        fx.scanner.scan(&CancellationToken::new()).await.unwrap();

        let task = fx
            .store
            .get_by_path(&video.to_string_lossy())
            .await
            .unwrap()
            .unwrap();
        fx.store
            .update_status(task.id, TaskStatus::Completed, "transcode complete")
            .await
            .unwrap();

        let output = fx.output.join("v.mp4");
        write_file(&output, 50);
        fx.media.mark_corrupt(&output);

        let summary = fx.scanner.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.requeued, 1);

        let task = fx.store.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.log_text(), "output corrupt, queued for re-encode");
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_verify_pass_passes_healthy_outputs() {
        let fx = fixture_with(|c| {
            c.ffmpeg.strict_check = true;
        })
        .await;
        let video = fx.input.join("v.mp4");
        write_file(&video, 100);
        fx.scanner.scan(&CancellationToken::new()).await.unwrap();

        let task = fx
            .store
            .get_by_path(&video.to_string_lossy())
            .await
            .unwrap()
            .unwrap();
        fx.store
            .update_status(task.id, TaskStatus::Completed, "transcode complete")
            .await
            .unwrap();
        write_file(&fx.output.join("v.mp4"), 50);

        let summary = fx.scanner.scan(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.verified, 1);
        assert_eq!(summary.requeued, 0);

        let task = fx.store.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn test_should_skip_dir() {
        assert!(should_skip_dir(".stm_trash", ".stm_trash"));
        assert!(should_skip_dir("@eaDir", ".stm_trash"));
        assert!(should_skip_dir("#recycle", ".stm_trash"));
        assert!(should_skip_dir(".DS_Store", ".stm_trash"));
        assert!(!should_skip_dir("movies", ".stm_trash"));
        // The trash name follows configuration
        assert!(should_skip_dir(".custom_trash", ".custom_trash"));
        assert!(!should_skip_dir(".stm_trash_other", ".stm_trash"));
    }

    #[test]
    fn test_should_skip_file() {
        let none: &[String] = &[];
        assert!(should_skip_file("SYNOPHOTO_THUMB_M.mp4", none));
        assert!(should_skip_file(".hidden.mp4", none));
        assert!(should_skip_file("v.mp4.tmp", none));
        assert!(should_skip_file("v.part", none));
        assert!(should_skip_file("v.lock", none));
        assert!(!should_skip_file("movie.mp4", none));

        let patterns = vec!["trailer".to_string()];
        assert!(should_skip_file("movie.trailer.mp4", &patterns));
        assert!(!should_skip_file("movie.mp4", &patterns));
    }
}
