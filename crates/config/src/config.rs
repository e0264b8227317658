//! Core configuration structures, validation, and the shared handle

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading or writing the config file
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value failed validation
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// System-level settings: work window, concurrency, scheduling cadence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemConfig {
    /// Hour of day the work window opens (0-23)
    #[serde(default)]
    pub work_start: u8,
    /// Hour of day the work window closes (0-23)
    #[serde(default)]
    pub work_end: u8,
    /// Maximum concurrent workers (1-10)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Minutes between directory scans
    #[serde(default = "default_scan_interval_minutes")]
    pub scan_interval_minutes: u64,
    /// Seconds between scheduler ticks
    #[serde(default = "default_scheduler_interval_seconds")]
    pub scheduler_interval_seconds: u64,
    /// Capacity of the task dispatch queue
    #[serde(default = "default_task_queue_size")]
    pub task_queue_size: usize,
    /// Minimum free disk space required before an encode starts (GiB)
    #[serde(default = "default_min_disk_space_gb")]
    pub min_disk_space_gb: u64,
}

fn default_max_workers() -> usize {
    2
}

fn default_scan_interval_minutes() -> u64 {
    30
}

fn default_scheduler_interval_seconds() -> u64 {
    10
}

fn default_task_queue_size() -> usize {
    10
}

fn default_min_disk_space_gb() -> u64 {
    5
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            work_start: 0,
            work_end: 0,
            max_workers: default_max_workers(),
            scan_interval_minutes: default_scan_interval_minutes(),
            scheduler_interval_seconds: default_scheduler_interval_seconds(),
            task_queue_size: default_task_queue_size(),
            min_disk_space_gb: default_min_disk_space_gb(),
        }
    }
}

/// One watched input directory and the output root it mirrors into
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectoryPair {
    pub input: PathBuf,
    pub output: PathBuf,
}

/// Filesystem layout: watched pairs, trash name, store location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathConfig {
    /// Input/output directory pairs
    #[serde(default)]
    pub pairs: Vec<DirectoryPair>,
    /// Basename of the per-directory trash folder
    #[serde(default = "default_trash_dir")]
    pub trash: String,
    /// Task store database file
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
}

fn default_trash_dir() -> String {
    ".stm_trash".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/stm.db")
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            pairs: Vec::new(),
            trash: default_trash_dir(),
            database: default_database_path(),
        }
    }
}

/// Encoder and verification settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FfmpegConfig {
    /// Video codec passed to the encoder
    #[serde(default = "default_codec")]
    pub codec: String,
    /// Encoder preset
    #[serde(default = "default_preset")]
    pub preset: String,
    /// Constant rate factor
    #[serde(default = "default_crf")]
    pub crf: u32,
    /// Audio codec
    #[serde(default = "default_audio")]
    pub audio: String,
    /// Audio bitrate (encoder syntax, e.g. "128k")
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
    /// Force all outputs to this extension (empty keeps the source extension)
    #[serde(default)]
    pub output_extension: String,
    /// Seconds of strict head decode during output verification (0 disables)
    #[serde(default = "default_verify_decode_seconds")]
    pub verify_decode_seconds: u32,
    /// Seek offset for the strict tail decode during verification (0 disables)
    #[serde(default)]
    pub verify_tail_seek_seconds: u32,
    /// Always pass the discard-corrupt flags regardless of repair mode
    #[serde(default)]
    pub discard_corrupt: bool,
    /// Corruption-tolerance strategy: auto, discard, or cfr
    #[serde(default = "default_corrupt_strategy")]
    pub corrupt_strategy: String,
    /// Seconds of sample decode used by the auto strategy (0 disables sampling)
    #[serde(default = "default_corrupt_probe_seconds")]
    pub corrupt_probe_seconds: u32,
    /// Decoder-error line count at which auto picks cfr
    #[serde(default = "default_corrupt_error_threshold")]
    pub corrupt_error_threshold: u32,
    /// Output frame rate when re-timing to constant frame rate
    #[serde(default = "default_output_fps")]
    pub output_fps: u32,
    /// Accepted video file extensions (with or without leading dot)
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Substring filters applied to file names during scanning
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// Verify inputs before encoding and outputs after encoding
    #[serde(default = "default_strict_check")]
    pub strict_check: bool,
    /// Timeout for each probe sub-invocation (seconds)
    #[serde(default = "default_probe_timeout_seconds")]
    pub probe_timeout_seconds: u64,
    /// Minutes of progress silence before the stall watchdog kills an encode
    #[serde(default = "default_progress_stall_minutes")]
    pub progress_stall_minutes: u64,
    /// Floor of the encode deadline (hours)
    #[serde(default = "default_max_duration_hours")]
    pub max_duration_hours: u64,
    /// Deadline multiplier applied to the input duration
    #[serde(default = "default_duration_factor")]
    pub duration_factor: f64,
    /// Extra minutes added on top of the duration-derived deadline
    #[serde(default = "default_duration_extra_minutes")]
    pub duration_extra_minutes: u64,
}

fn default_codec() -> String {
    "libx265".to_string()
}

fn default_preset() -> String {
    "medium".to_string()
}

fn default_crf() -> u32 {
    28
}

fn default_audio() -> String {
    "aac".to_string()
}

fn default_audio_bitrate() -> String {
    "128k".to_string()
}

fn default_verify_decode_seconds() -> u32 {
    2
}

fn default_corrupt_strategy() -> String {
    "auto".to_string()
}

fn default_corrupt_probe_seconds() -> u32 {
    30
}

fn default_corrupt_error_threshold() -> u32 {
    5
}

fn default_output_fps() -> u32 {
    30
}

fn default_extensions() -> Vec<String> {
    [".mp4", ".mkv", ".avi", ".mov", ".wmv", ".flv", ".ts", ".m2ts"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_strict_check() -> bool {
    true
}

fn default_probe_timeout_seconds() -> u64 {
    30
}

fn default_progress_stall_minutes() -> u64 {
    10
}

fn default_max_duration_hours() -> u64 {
    2
}

fn default_duration_factor() -> f64 {
    2.0
}

fn default_duration_extra_minutes() -> u64 {
    15
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            codec: default_codec(),
            preset: default_preset(),
            crf: default_crf(),
            audio: default_audio(),
            audio_bitrate: default_audio_bitrate(),
            output_extension: String::new(),
            verify_decode_seconds: default_verify_decode_seconds(),
            verify_tail_seek_seconds: 0,
            discard_corrupt: false,
            corrupt_strategy: default_corrupt_strategy(),
            corrupt_probe_seconds: default_corrupt_probe_seconds(),
            corrupt_error_threshold: default_corrupt_error_threshold(),
            output_fps: default_output_fps(),
            extensions: default_extensions(),
            exclude_patterns: Vec::new(),
            strict_check: default_strict_check(),
            probe_timeout_seconds: default_probe_timeout_seconds(),
            progress_stall_minutes: default_progress_stall_minutes(),
            max_duration_hours: default_max_duration_hours(),
            duration_factor: default_duration_factor(),
            duration_extra_minutes: default_duration_extra_minutes(),
        }
    }
}

/// Retention settings for the two-phase cleaner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleaningConfig {
    /// Days after completion before the source moves to trash
    #[serde(default = "default_soft_delete_days")]
    pub soft_delete_days: i64,
    /// Days in trash before permanent deletion
    #[serde(default = "default_hard_delete_days")]
    pub hard_delete_days: i64,
    /// Cron expression for the cleaning run (5-field, local time)
    #[serde(default = "default_cleaning_cron")]
    pub cron: String,
}

fn default_soft_delete_days() -> i64 {
    7
}

fn default_hard_delete_days() -> i64 {
    14
}

fn default_cleaning_cron() -> String {
    "0 10 * * *".to_string()
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            soft_delete_days: default_soft_delete_days(),
            hard_delete_days: default_hard_delete_days(),
            cron: default_cleaning_cron(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file; console-only when unset
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Path the config was loaded from; target of persist-back
    #[serde(skip)]
    pub config_path: PathBuf,
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub path: PathConfig,
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
    #[serde(default)]
    pub cleaning: CleaningConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from a TOML file, apply environment overrides,
    /// and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path)?;
        let mut config = Self::parse_toml(&content)?;
        config.config_path = path.as_ref().to_path_buf();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string. Does not validate.
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - STM_MAX_WORKERS -> system.max_workers
    /// - STM_INPUT_PATH -> path.pairs[0].input
    /// - STM_OUTPUT_PATH -> path.pairs[0].output
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("STM_MAX_WORKERS") {
            if let Ok(workers) = val.parse::<usize>() {
                self.system.max_workers = workers;
            }
        }

        let input = env::var("STM_INPUT_PATH").ok().filter(|v| !v.is_empty());
        let output = env::var("STM_OUTPUT_PATH").ok().filter(|v| !v.is_empty());

        match self.path.pairs.first_mut() {
            Some(pair) => {
                if let Some(input) = input {
                    pair.input = PathBuf::from(input);
                }
                if let Some(output) = output {
                    pair.output = PathBuf::from(output);
                }
            }
            None => {
                // Env-only deployments configure a single pair this way
                if let (Some(input), Some(output)) = (input, output) {
                    self.path.pairs.push(DirectoryPair {
                        input: PathBuf::from(input),
                        output: PathBuf::from(output),
                    });
                }
            }
        }
    }

    /// Validate the configuration, normalizing values and filling defaults
    /// for zeroed numeric fields.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.system.work_start > 23 {
            return Err(ConfigError::Invalid(
                "work_start must be between 0 and 23".to_string(),
            ));
        }
        if self.system.work_end > 23 {
            return Err(ConfigError::Invalid(
                "work_end must be between 0 and 23".to_string(),
            ));
        }
        // Equal start and end means the window never closes
        if self.system.work_start == self.system.work_end {
            self.system.work_start = 0;
            self.system.work_end = 0;
        }

        if self.system.max_workers < 1 || self.system.max_workers > 10 {
            return Err(ConfigError::Invalid(
                "max_workers must be between 1 and 10".to_string(),
            ));
        }

        if self.system.scheduler_interval_seconds == 0 {
            self.system.scheduler_interval_seconds = default_scheduler_interval_seconds();
        }
        if self.system.scan_interval_minutes == 0 {
            self.system.scan_interval_minutes = default_scan_interval_minutes();
        }
        if self.system.task_queue_size == 0 {
            self.system.task_queue_size = default_task_queue_size();
        }
        if self.system.min_disk_space_gb == 0 {
            self.system.min_disk_space_gb = default_min_disk_space_gb();
        }

        if self.path.pairs.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one input/output directory pair is required".to_string(),
            ));
        }
        for (i, pair) in self.path.pairs.iter().enumerate() {
            if pair.input.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "pair {} has an empty input directory",
                    i + 1
                )));
            }
            if pair.output.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "pair {} has an empty output directory",
                    i + 1
                )));
            }
            if pair.input == pair.output {
                return Err(ConfigError::Invalid(format!(
                    "pair {} uses the same directory for input and output: {}",
                    i + 1,
                    pair.input.display()
                )));
            }
        }

        if self.path.trash.trim().is_empty() {
            self.path.trash = default_trash_dir();
        }

        if self.cleaning.soft_delete_days < 0 {
            return Err(ConfigError::Invalid(
                "soft_delete_days cannot be negative".to_string(),
            ));
        }
        if self.cleaning.hard_delete_days < self.cleaning.soft_delete_days {
            return Err(ConfigError::Invalid(
                "hard_delete_days must be >= soft_delete_days".to_string(),
            ));
        }
        if self.cleaning.cron.trim().is_empty() {
            self.cleaning.cron = default_cleaning_cron();
        }

        let strategy = self.ffmpeg.corrupt_strategy.trim().to_lowercase();
        match strategy.as_str() {
            "" => self.ffmpeg.corrupt_strategy = default_corrupt_strategy(),
            "auto" | "discard" | "cfr" => self.ffmpeg.corrupt_strategy = strategy,
            other => {
                return Err(ConfigError::Invalid(format!(
                    "corrupt_strategy must be auto, discard, or cfr (got {other:?})"
                )));
            }
        }

        if self.ffmpeg.probe_timeout_seconds == 0 {
            self.ffmpeg.probe_timeout_seconds = default_probe_timeout_seconds();
        }
        if self.ffmpeg.progress_stall_minutes == 0 {
            self.ffmpeg.progress_stall_minutes = default_progress_stall_minutes();
        }
        if self.ffmpeg.max_duration_hours == 0 {
            self.ffmpeg.max_duration_hours = default_max_duration_hours();
        }
        if self.ffmpeg.duration_factor <= 0.0 {
            self.ffmpeg.duration_factor = default_duration_factor();
        }
        if self.ffmpeg.output_fps == 0 {
            self.ffmpeg.output_fps = default_output_fps();
        }
        if self.ffmpeg.extensions.is_empty() {
            self.ffmpeg.extensions = default_extensions();
        }

        if self.log.level.trim().is_empty() {
            self.log.level = default_log_level();
        }

        Ok(())
    }

    /// Persist the configuration back to its file atomically
    /// (temp file then rename).
    pub fn save(&self) -> Result<(), ConfigError> {
        if self.config_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "config path is unknown, cannot save".to_string(),
            ));
        }

        let data = toml::to_string_pretty(self)?;
        let tmp_path = self.config_path.with_extension("toml.tmp");
        fs::write(&tmp_path, data)?;
        if let Err(e) = fs::rename(&tmp_path, &self.config_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }

    /// Check whether a file has one of the accepted video extensions
    /// (case-insensitive).
    pub fn is_video_file(&self, path: &Path) -> bool {
        let ext = match path.extension().and_then(|e| e.to_str()) {
            Some(e) => format!(".{}", e.to_lowercase()),
            None => return false,
        };
        self.ffmpeg.extensions.iter().any(|allowed| {
            let allowed = allowed.to_lowercase();
            if allowed.starts_with('.') {
                ext == allowed
            } else {
                ext == format!(".{allowed}")
            }
        })
    }

    /// Rewrite a path to carry the configured output extension.
    /// With no override configured, the path is returned unchanged.
    pub fn apply_output_extension(&self, path: &Path) -> PathBuf {
        let ext = self.ffmpeg.output_extension.trim();
        if ext.is_empty() {
            return path.to_path_buf();
        }
        let ext = ext.trim_start_matches('.');
        let mut out = path.to_path_buf();
        out.set_extension(ext);
        out
    }

    /// Locate the directory pair whose input root contains `input`, and
    /// return the mirrored path under the paired output root (before any
    /// extension override).
    pub fn output_base_for(&self, input: &Path) -> Option<PathBuf> {
        for pair in &self.path.pairs {
            if let Ok(rel) = input.strip_prefix(&pair.input) {
                return Some(pair.output.join(rel));
            }
        }
        None
    }

    /// Relative form of `input` under its matching input root, if any.
    pub fn relative_to_input_root(&self, input: &Path) -> Option<PathBuf> {
        for pair in &self.path.pairs {
            if let Ok(rel) = input.strip_prefix(&pair.input) {
                return Some(rel.to_path_buf());
            }
        }
        None
    }
}

/// Shared, reader/writer-locked configuration handle.
///
/// All accessors copy values out so callers never observe a mid-mutation
/// state. Mutations (directory pairs) take the write lock.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Config>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Config> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Config> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn system(&self) -> SystemConfig {
        self.read().system.clone()
    }

    pub fn ffmpeg(&self) -> FfmpegConfig {
        self.read().ffmpeg.clone()
    }

    pub fn cleaning(&self) -> CleaningConfig {
        self.read().cleaning.clone()
    }

    pub fn log(&self) -> LogConfig {
        self.read().log.clone()
    }

    pub fn pairs(&self) -> Vec<DirectoryPair> {
        self.read().path.pairs.clone()
    }

    pub fn trash_dir_name(&self) -> String {
        self.read().path.trash.clone()
    }

    pub fn database_path(&self) -> PathBuf {
        self.read().path.database.clone()
    }

    pub fn is_video_file(&self, path: &Path) -> bool {
        self.read().is_video_file(path)
    }

    pub fn apply_output_extension(&self, path: &Path) -> PathBuf {
        self.read().apply_output_extension(path)
    }

    pub fn output_base_for(&self, input: &Path) -> Option<PathBuf> {
        self.read().output_base_for(input)
    }

    pub fn relative_to_input_root(&self, input: &Path) -> Option<PathBuf> {
        self.read().relative_to_input_root(input)
    }

    /// Register a new directory pair after checking it does not clash with
    /// an existing one and that both directories exist on disk.
    pub fn add_pair(&self, input: &Path, output: &Path) -> Result<(), ConfigError> {
        if input.as_os_str().is_empty() || output.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "input and output directories are required".to_string(),
            ));
        }
        if input == output {
            return Err(ConfigError::Invalid(format!(
                "input and output directory cannot be the same: {}",
                input.display()
            )));
        }
        if !input.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "input directory does not exist: {}",
                input.display()
            )));
        }
        if !output.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "output directory does not exist: {}",
                output.display()
            )));
        }

        let mut config = self.write();
        if config.path.pairs.iter().any(|p| p.input == input) {
            return Err(ConfigError::Invalid(format!(
                "input directory is already watched: {}",
                input.display()
            )));
        }
        config.path.pairs.push(DirectoryPair {
            input: input.to_path_buf(),
            output: output.to_path_buf(),
        });
        Ok(())
    }

    /// Remove the pair keyed by its input directory. The last remaining
    /// pair cannot be removed.
    pub fn remove_pair(&self, input: &Path) -> Result<(), ConfigError> {
        let mut config = self.write();
        let before = config.path.pairs.len();
        let remaining: Vec<DirectoryPair> = config
            .path
            .pairs
            .iter()
            .filter(|p| p.input != input)
            .cloned()
            .collect();

        if remaining.len() == before {
            return Err(ConfigError::Invalid(format!(
                "no such directory pair: {}",
                input.display()
            )));
        }
        if remaining.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one watched directory must remain".to_string(),
            ));
        }
        config.path.pairs = remaining;
        Ok(())
    }

    /// Persist the current configuration snapshot to disk.
    pub fn save(&self) -> Result<(), ConfigError> {
        // Clone under the read lock, serialize outside of it
        let snapshot = self.read().clone();
        snapshot.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all stm-related env vars
    fn clear_env_vars() {
        env::remove_var("STM_MAX_WORKERS");
        env::remove_var("STM_INPUT_PATH");
        env::remove_var("STM_OUTPUT_PATH");
    }

    fn minimal_toml() -> String {
        r#"
[[path.pairs]]
input = "/in"
output = "/out"
"#
        .to_string()
    }

    fn valid_config() -> Config {
        let mut config = Config::parse_toml(&minimal_toml()).expect("valid TOML");
        config.validate().expect("valid config");
        config
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("empty TOML should parse");

        assert_eq!(config.system.max_workers, 2);
        assert_eq!(config.system.scheduler_interval_seconds, 10);
        assert_eq!(config.system.task_queue_size, 10);
        assert_eq!(config.system.min_disk_space_gb, 5);
        assert_eq!(config.path.trash, ".stm_trash");
        assert_eq!(config.ffmpeg.probe_timeout_seconds, 30);
        assert_eq!(config.ffmpeg.verify_decode_seconds, 2);
        assert_eq!(config.ffmpeg.corrupt_strategy, "auto");
        assert_eq!(config.ffmpeg.corrupt_probe_seconds, 30);
        assert_eq!(config.ffmpeg.corrupt_error_threshold, 5);
        assert_eq!(config.ffmpeg.output_fps, 30);
        assert_eq!(config.ffmpeg.progress_stall_minutes, 10);
        assert_eq!(config.ffmpeg.max_duration_hours, 2);
        assert!((config.ffmpeg.duration_factor - 2.0).abs() < 0.0001);
        assert_eq!(config.ffmpeg.duration_extra_minutes, 15);
        assert_eq!(config.cleaning.cron, "0 10 * * *");
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_validate_requires_a_pair() {
        let mut config = Config::parse_toml("").expect("parses");
        let err = config.validate().expect_err("no pairs must fail");
        assert!(err.to_string().contains("directory pair"));
    }

    #[test]
    fn test_validate_rejects_same_input_output() {
        let mut config = Config::parse_toml(
            r#"
[[path.pairs]]
input = "/media"
output = "/media"
"#,
        )
        .expect("parses");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_hours_and_workers() {
        let mut config = valid_config();
        config.system.work_start = 24;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.system.max_workers = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.system.max_workers = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_normalizes_equal_window_to_always_on() {
        let mut config = valid_config();
        config.system.work_start = 9;
        config.system.work_end = 9;
        config.validate().expect("valid");
        assert_eq!(config.system.work_start, 0);
        assert_eq!(config.system.work_end, 0);
    }

    #[test]
    fn test_validate_rejects_hard_delete_before_soft() {
        let mut config = valid_config();
        config.cleaning.soft_delete_days = 10;
        config.cleaning.hard_delete_days = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_corrupt_strategy() {
        let mut config = valid_config();
        config.ffmpeg.corrupt_strategy = "maybe".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides_max_workers() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = valid_config();
        env::set_var("STM_MAX_WORKERS", "7");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.system.max_workers, 7);
    }

    #[test]
    fn test_env_overrides_rewrite_first_pair() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = valid_config();
        env::set_var("STM_INPUT_PATH", "/srv/in");
        env::set_var("STM_OUTPUT_PATH", "/srv/out");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.path.pairs[0].input, PathBuf::from("/srv/in"));
        assert_eq!(config.path.pairs[0].output, PathBuf::from("/srv/out"));
    }

    #[test]
    fn test_env_overrides_create_pair_when_none_configured() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::parse_toml("").expect("parses");
        env::set_var("STM_INPUT_PATH", "/srv/in");
        env::set_var("STM_OUTPUT_PATH", "/srv/out");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.path.pairs.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_load_round_trip() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, minimal_toml()).unwrap();

        let mut config = Config::load(&path).expect("loads");
        config.system.max_workers = 4;
        config.ffmpeg.output_extension = ".mp4".to_string();
        config.save().expect("saves");

        let reloaded = Config::load(&path).expect("reloads");
        assert_eq!(reloaded.system.max_workers, 4);
        assert_eq!(reloaded.ffmpeg.output_extension, ".mp4");
        assert_eq!(reloaded.path.pairs, config.path.pairs);
        assert_eq!(reloaded.cleaning, config.cleaning);
    }

    #[test]
    fn test_is_video_file_case_insensitive() {
        let config = valid_config();
        assert!(config.is_video_file(Path::new("/media/movie.mkv")));
        assert!(config.is_video_file(Path::new("/media/movie.MKV")));
        assert!(config.is_video_file(Path::new("/media/movie.Mp4")));
        assert!(!config.is_video_file(Path::new("/media/movie.srt")));
        assert!(!config.is_video_file(Path::new("/media/movie")));
    }

    #[test]
    fn test_extensions_accepted_with_or_without_dot() {
        let mut config = valid_config();
        config.ffmpeg.extensions = vec!["mkv".to_string(), ".mp4".to_string()];
        assert!(config.is_video_file(Path::new("/a/b.mkv")));
        assert!(config.is_video_file(Path::new("/a/b.mp4")));
        assert!(!config.is_video_file(Path::new("/a/b.avi")));
    }

    #[test]
    fn test_apply_output_extension_disabled_keeps_path() {
        let config = valid_config();
        let path = Path::new("/out/a/b/video.mkv");
        assert_eq!(config.apply_output_extension(path), path);
    }

    #[test]
    fn test_apply_output_extension_rewrites() {
        let mut config = valid_config();
        config.ffmpeg.output_extension = ".mp4".to_string();
        assert_eq!(
            config.apply_output_extension(Path::new("/out/video.mkv")),
            PathBuf::from("/out/video.mp4")
        );
        // Extensions configured without a dot behave the same
        config.ffmpeg.output_extension = "mp4".to_string();
        assert_eq!(
            config.apply_output_extension(Path::new("/out/video.mkv")),
            PathBuf::from("/out/video.mp4")
        );
    }

    #[test]
    fn test_output_base_for_picks_matching_pair() {
        let mut config = valid_config();
        config.path.pairs = vec![
            DirectoryPair {
                input: PathBuf::from("/in/a"),
                output: PathBuf::from("/out/a"),
            },
            DirectoryPair {
                input: PathBuf::from("/in"),
                output: PathBuf::from("/out"),
            },
        ];

        assert_eq!(
            config.output_base_for(Path::new("/in/a/x/v.mkv")),
            Some(PathBuf::from("/out/a/x/v.mkv"))
        );
        assert_eq!(
            config.output_base_for(Path::new("/in/y/v.mkv")),
            Some(PathBuf::from("/out/y/v.mkv"))
        );
        assert_eq!(config.output_base_for(Path::new("/elsewhere/v.mkv")), None);
    }

    #[test]
    fn test_shared_config_remove_last_pair_rejected() {
        let shared = SharedConfig::new(valid_config());
        let err = shared.remove_pair(Path::new("/in")).expect_err("must fail");
        assert!(err.to_string().contains("must remain"));
    }

    #[test]
    fn test_shared_config_add_pair_checks_directories() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&output).unwrap();

        let shared = SharedConfig::new(valid_config());
        shared.add_pair(&input, &output).expect("adds");
        assert_eq!(shared.pairs().len(), 2);

        // Duplicate input rejected
        assert!(shared.add_pair(&input, &output).is_err());
        // Missing directory rejected
        assert!(shared
            .add_pair(&dir.path().join("missing"), &output)
            .is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Applying the output-extension override twice is the same as
        // applying it once.
        #[test]
        fn prop_apply_output_extension_idempotent(
            stem in "[a-zA-Z0-9_-]{1,20}",
            src_ext in prop_oneof![Just("mkv"), Just("mp4"), Just("avi"), Just("ts")],
            override_ext in prop_oneof![Just(""), Just("mp4"), Just(".mp4"), Just("mkv")],
        ) {
            let mut config = valid_config();
            config.ffmpeg.output_extension = override_ext.to_string();

            let path = PathBuf::from(format!("/out/{stem}.{src_ext}"));
            let once = config.apply_output_extension(&path);
            let twice = config.apply_output_extension(&once);
            prop_assert_eq!(once, twice);
        }

        // The configured extension always wins when an override is set.
        #[test]
        fn prop_apply_output_extension_forces_extension(
            stem in "[a-zA-Z0-9_-]{1,20}",
            src_ext in prop_oneof![Just("mkv"), Just("avi"), Just("ts")],
        ) {
            let mut config = valid_config();
            config.ffmpeg.output_extension = ".mp4".to_string();

            let path = PathBuf::from(format!("/out/{stem}.{src_ext}"));
            let out = config.apply_output_extension(&path);
            prop_assert_eq!(out.extension().and_then(|e| e.to_str()), Some("mp4"));
        }
    }
}
