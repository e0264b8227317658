//! Two-phase retention cleaner.
//!
//! On a cron schedule (daily by default): sources of sufficiently old
//! completed tasks move into a trash directory co-located with the file,
//! and trash entries past their own age limit are deleted for good. The
//! archived name carries a deletion timestamp so the second phase never
//! depends on the store.

use crate::metrics::SharedMetrics;
use crate::store::{StoreError, TaskStore};
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDateTime, TimeZone, Utc};
use cron::Schedule;
use serde::Serialize;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use stm_config::SharedConfig;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Timestamp format embedded in archived names, local time.
pub const TRASH_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Separator between the original name and the deletion timestamp.
const DELETED_MARKER: &str = "_del_";

/// Error type for cleaner operations
#[derive(Debug, Error)]
pub enum CleanError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid trash entry name: {0}")]
    InvalidName(String),

    #[error("no such trash entry: {0}")]
    NotFound(String),
}

/// One archived file, as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct TrashFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub delete_time: DateTime<Local>,
    /// Days until the hard-delete phase removes it
    pub days_left: i64,
}

/// Retention cleaner. Cheap to clone; shares the store and config handles.
#[derive(Clone)]
pub struct Cleaner {
    config: SharedConfig,
    store: TaskStore,
    metrics: SharedMetrics,
}

impl Cleaner {
    pub fn new(config: SharedConfig, store: TaskStore, metrics: SharedMetrics) -> Self {
        Self {
            config,
            store,
            metrics,
        }
    }

    /// Run one cleaning pass immediately, then on every cron fire until
    /// cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let expr = self.config.cleaning().cron;
        let schedule = match Schedule::from_str(&normalize_cron(&expr)) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(cron = %expr, error = %e, "invalid cleaning schedule, cleaner disabled");
                return;
            }
        };
        info!(cron = %expr, "cleaner started");

        self.run_cleaning().await;

        loop {
            let Some(next) = schedule.upcoming(Local).next() else {
                warn!("cleaning schedule has no future fire times, cleaner stopped");
                return;
            };
            let wait = (next - Local::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            debug!(next = %next, "next cleaning run scheduled");

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cleaner stopped");
                    return;
                }
                _ = tokio::time::sleep(wait) => self.run_cleaning().await,
            }
        }
    }

    /// One full cleaning run. Per-file errors are logged and skipped, a
    /// failed phase never aborts the other.
    pub async fn run_cleaning(&self) {
        info!("cleaning run started");
        match self.soft_delete_pass().await {
            Ok(moved) => info!(moved, "soft-delete phase finished"),
            Err(e) => warn!(error = %e, "soft-delete phase failed"),
        }
        match self.hard_delete_pass().await {
            Ok(deleted) => info!(deleted, "hard-delete phase finished"),
            Err(e) => warn!(error = %e, "hard-delete phase failed"),
        }
    }

    /// Phase 1: move sources of old completed tasks into the trash.
    pub async fn soft_delete_pass(&self) -> Result<usize, CleanError> {
        let cleaning = self.config.cleaning();
        let cutoff = Utc::now() - ChronoDuration::days(cleaning.soft_delete_days);
        let tasks = self.store.get_completed_before(cutoff).await?;
        if tasks.is_empty() {
            debug!("nothing to soft-delete");
            return Ok(0);
        }

        let trash_name = self.config.trash_dir_name();
        let mut moved = 0;
        for task in tasks {
            let source = PathBuf::from(&task.source_path);
            if !source.exists() {
                continue;
            }
            match move_to_trash(&source, &trash_name) {
                Ok(dest) => {
                    moved += 1;
                    self.metrics.files_soft_deleted.inc();
                    info!(source = %source.display(), dest = %dest.display(), "source moved to trash");
                }
                Err(e) => {
                    warn!(source = %source.display(), error = %e, "trash move failed");
                }
            }
        }
        Ok(moved)
    }

    /// Phase 2: permanently delete trash entries past the retention age.
    pub async fn hard_delete_pass(&self) -> Result<usize, CleanError> {
        let cleaning = self.config.cleaning();
        let cutoff = Local::now() - ChronoDuration::days(cleaning.hard_delete_days);

        let mut deleted = 0;
        for entry in self.trash_files()? {
            if entry.delete_time < cutoff {
                if let Err(e) = std::fs::remove_file(&entry.path) {
                    warn!(path = %entry.path.display(), error = %e, "hard delete failed");
                    continue;
                }
                deleted += 1;
                self.metrics.files_hard_deleted.inc();
                info!(name = %entry.name, "trash entry permanently deleted");
            }
        }
        Ok(deleted)
    }

    /// Every archived file across all trash directories, with its parsed
    /// deletion time and remaining days.
    pub fn trash_files(&self) -> Result<Vec<TrashFile>, CleanError> {
        let trash_name = self.config.trash_dir_name();
        let hard_delete_days = self.config.cleaning().hard_delete_days;

        let mut roots: HashSet<PathBuf> = HashSet::new();
        for pair in self.config.pairs() {
            roots.insert(pair.input);
        }

        let mut files = Vec::new();
        for root in roots {
            if !root.exists() {
                continue;
            }
            // Soft delete co-locates trash with each source's parent, so
            // trash directories can sit at any depth under the root.
            for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let in_trash = entry
                    .path()
                    .parent()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy() == trash_name.as_str())
                    .unwrap_or(false);
                if !in_trash {
                    continue;
                }

                let metadata = match entry.metadata() {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                let fallback: DateTime<Local> = metadata
                    .modified()
                    .map(DateTime::<Local>::from)
                    .unwrap_or_else(|_| Local::now());

                let name = entry.file_name().to_string_lossy().to_string();
                let delete_time = parse_deletion_time(&name, fallback);
                let days_left = (delete_time + ChronoDuration::days(hard_delete_days)
                    - Local::now())
                .num_days()
                .max(0);

                files.push(TrashFile {
                    name,
                    path: entry.path().to_path_buf(),
                    size: metadata.len(),
                    delete_time,
                    days_left,
                });
            }
        }
        Ok(files)
    }

    /// Delete a named trash entry immediately. The name must be a bare
    /// file name and resolve inside a trash directory.
    pub fn delete_trash_file(&self, filename: &str) -> Result<(), CleanError> {
        let mut components = Path::new(filename).components();
        let is_bare_name = matches!(
            (components.next(), components.next()),
            (Some(std::path::Component::Normal(_)), None)
        );
        if !is_bare_name {
            return Err(CleanError::InvalidName(filename.to_string()));
        }

        let entry = self
            .trash_files()?
            .into_iter()
            .find(|f| f.name == filename)
            .ok_or_else(|| CleanError::NotFound(filename.to_string()))?;

        // The entry came from a trash walk, but re-check the resolved path
        // before deleting on an operator's behalf.
        let trash_dir = entry
            .path
            .parent()
            .ok_or_else(|| CleanError::InvalidName(filename.to_string()))?;
        let resolved = entry.path.canonicalize()?;
        let trash_resolved = trash_dir.canonicalize()?;
        if !resolved.starts_with(&trash_resolved) {
            return Err(CleanError::InvalidName(filename.to_string()));
        }

        std::fs::remove_file(&resolved)?;
        info!(name = %filename, "trash entry deleted on request");
        Ok(())
    }
}

/// The cron crate wants a seconds field; operator expressions are plain
/// 5-field cron.
fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Move `src` into `<parent>/<trash_name>/<name>_del_<timestamp>`.
/// Same-filesystem renames are preferred; a cross-device move falls back
/// to copy + verify + fsync + delete.
pub fn move_to_trash(src: &Path, trash_name: &str) -> io::Result<PathBuf> {
    let parent = src.parent().unwrap_or_else(|| Path::new("."));
    let trash_dir = parent.join(trash_name);
    std::fs::create_dir_all(&trash_dir)?;

    let file_name = src
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"))?
        .to_string_lossy();
    let stamp = Local::now().format(TRASH_TIMESTAMP_FORMAT);
    let dest = trash_dir.join(format!("{file_name}{DELETED_MARKER}{stamp}"));

    match std::fs::rename(src, &dest) {
        Ok(()) => Ok(dest),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            debug!(src = %src.display(), "cross-device move, copying");
            copy_and_delete(src, &dest)?;
            Ok(dest)
        }
        Err(e) => Err(e),
    }
}

/// Copy with size verification and fsync, removing the partial copy on any
/// failure, then delete the source.
pub fn copy_and_delete(src: &Path, dest: &Path) -> io::Result<()> {
    let result = (|| -> io::Result<()> {
        let mut src_file = std::fs::File::open(src)?;
        let mut dest_file = std::fs::File::create(dest)?;
        let written = io::copy(&mut src_file, &mut dest_file)?;

        let expected = src_file.metadata()?.len();
        if written != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("short copy: expected {expected} bytes, wrote {written}"),
            ));
        }
        dest_file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(dest);
        return Err(e);
    }
    std::fs::remove_file(src)?;
    Ok(())
}

/// Deletion time parsed from the `_del_` suffix, falling back to the
/// file's mtime when absent or malformed.
pub fn parse_deletion_time(filename: &str, fallback: DateTime<Local>) -> DateTime<Local> {
    let Some(idx) = filename.rfind(DELETED_MARKER) else {
        return fallback;
    };
    let stamp = &filename[idx + DELETED_MARKER.len()..];
    match NaiveDateTime::parse_from_str(stamp, TRASH_TIMESTAMP_FORMAT) {
        Ok(naive) => Local
            .from_local_datetime(&naive)
            .earliest()
            .unwrap_or(fallback),
        Err(_) => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::store::TaskStatus;
    use stm_config::Config;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        input: PathBuf,
        store: TaskStore,
        cleaner: Cleaner,
    }

    async fn fixture(soft_days: i64, hard_days: i64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&output).unwrap();

        let mut config = Config::parse_toml("").unwrap();
        config.path.pairs = vec![stm_config::DirectoryPair {
            input: input.clone(),
            output,
        }];
        config.cleaning.soft_delete_days = soft_days;
        config.cleaning.hard_delete_days = hard_days;
        config.validate().unwrap();

        let store = TaskStore::open(&dir.path().join("tasks.db")).await.unwrap();
        let cleaner = Cleaner::new(
            SharedConfig::new(config),
            store.clone(),
            Metrics::new().unwrap(),
        );

        Fixture {
            _dir: dir,
            input,
            store,
            cleaner,
        }
    }

    async fn seed_completed(fx: &Fixture, name: &str) -> PathBuf {
        let path = fx.input.join(name);
        std::fs::write(&path, b"payload").unwrap();
        let task = fx
            .store
            .create(&path.to_string_lossy(), 1, 7)
            .await
            .unwrap();
        fx.store
            .update_status(task.id, TaskStatus::Completed, "transcode complete")
            .await
            .unwrap();
        path
    }

    fn stamp(offset_days: i64) -> String {
        (Local::now() - ChronoDuration::days(offset_days))
            .format(TRASH_TIMESTAMP_FORMAT)
            .to_string()
    }

    #[tokio::test]
    async fn test_soft_delete_moves_aged_source_into_trash() {
        let fx = fixture(0, 0).await;
        let source = seed_completed(&fx, "v.mp4").await;

        let moved = fx.cleaner.soft_delete_pass().await.unwrap();
        assert_eq!(moved, 1);
        assert!(!source.exists());

        let trash_dir = fx.input.join(".stm_trash");
        let entries: Vec<_> = std::fs::read_dir(&trash_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1);
        let archived = entries[0].file_name().to_string_lossy().to_string();
        assert!(archived.starts_with("v.mp4_del_"));
        assert_eq!(
            std::fs::read(entries[0].path()).unwrap(),
            b"payload".to_vec()
        );
    }

    #[tokio::test]
    async fn test_soft_delete_respects_completion_age() {
        // Week-long retention: a just-completed task is untouched
        let fx = fixture(7, 14).await;
        let source = seed_completed(&fx, "v.mp4").await;

        let moved = fx.cleaner.soft_delete_pass().await.unwrap();
        assert_eq!(moved, 0);
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_soft_delete_skips_vanished_sources() {
        let fx = fixture(0, 0).await;
        let source = seed_completed(&fx, "v.mp4").await;
        std::fs::remove_file(&source).unwrap();

        let moved = fx.cleaner.soft_delete_pass().await.unwrap();
        assert_eq!(moved, 0);
    }

    #[tokio::test]
    async fn test_hard_delete_removes_expired_entries_only() {
        let fx = fixture(7, 14).await;
        let trash_dir = fx.input.join(".stm_trash");
        std::fs::create_dir_all(&trash_dir).unwrap();

        let expired = trash_dir.join(format!("old.mp4_del_{}", stamp(15)));
        let fresh = trash_dir.join(format!("new.mp4_del_{}", stamp(2)));
        std::fs::write(&expired, b"x").unwrap();
        std::fs::write(&fresh, b"x").unwrap();

        let deleted = fx.cleaner.hard_delete_pass().await.unwrap();
        assert_eq!(deleted, 1);
        assert!(!expired.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn test_hard_delete_reaches_nested_trash_dirs() {
        let fx = fixture(7, 14).await;
        let nested = fx.input.join("shows/s01/.stm_trash");
        std::fs::create_dir_all(&nested).unwrap();
        let entry = nested.join(format!("ep.mkv_del_{}", stamp(20)));
        std::fs::write(&entry, b"x").unwrap();

        let deleted = fx.cleaner.hard_delete_pass().await.unwrap();
        assert_eq!(deleted, 1);
        assert!(!entry.exists());
    }

    #[tokio::test]
    async fn test_soft_then_immediate_hard_delete_removes_the_file() {
        let fx = fixture(0, 0).await;
        let source = seed_completed(&fx, "v.mp4").await;

        assert_eq!(fx.cleaner.soft_delete_pass().await.unwrap(), 1);
        assert_eq!(fx.cleaner.hard_delete_pass().await.unwrap(), 1);

        assert!(!source.exists());
        assert!(fx.cleaner.trash_files().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_trash_reports_days_left() {
        let fx = fixture(7, 14).await;
        let trash_dir = fx.input.join(".stm_trash");
        std::fs::create_dir_all(&trash_dir).unwrap();
        std::fs::write(
            trash_dir.join(format!("a.mp4_del_{}", stamp(4))),
            b"abc",
        )
        .unwrap();

        let files = fx.cleaner.trash_files().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 3);
        // Archived 4 days ago with 14-day retention
        assert!((9..=10).contains(&files[0].days_left), "{}", files[0].days_left);
    }

    #[tokio::test]
    async fn test_delete_trash_file_by_name() {
        let fx = fixture(7, 14).await;
        let trash_dir = fx.input.join(".stm_trash");
        std::fs::create_dir_all(&trash_dir).unwrap();
        let name = format!("a.mp4_del_{}", stamp(1));
        std::fs::write(trash_dir.join(&name), b"x").unwrap();

        fx.cleaner.delete_trash_file(&name).unwrap();
        assert!(!trash_dir.join(&name).exists());
    }

    #[tokio::test]
    async fn test_delete_trash_file_rejects_traversal() {
        let fx = fixture(7, 14).await;
        for name in ["../escape.mp4", "a/b.mp4", "..", "/etc/passwd"] {
            let err = fx.cleaner.delete_trash_file(name).expect_err("must fail");
            assert!(matches!(err, CleanError::InvalidName(_)), "name: {name}");
        }
    }

    #[tokio::test]
    async fn test_delete_trash_file_missing_entry() {
        let fx = fixture(7, 14).await;
        let err = fx
            .cleaner
            .delete_trash_file("nothing.mp4_del_20250101_000000")
            .expect_err("must fail");
        assert!(matches!(err, CleanError::NotFound(_)));
    }

    #[test]
    fn test_copy_and_delete_verifies_and_removes_source() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        let dest = dir.path().join("dest.bin");
        std::fs::write(&src, vec![7u8; 4096]).unwrap();

        copy_and_delete(&src, &dest).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dest).unwrap().len(), 4096);
    }

    #[test]
    fn test_parse_deletion_time_round_trip() {
        let fallback = Local::now();
        let time = parse_deletion_time("video.mp4_del_20260105_120000", fallback);
        assert_eq!(
            time.format(TRASH_TIMESTAMP_FORMAT).to_string(),
            "20260105_120000"
        );
    }

    #[test]
    fn test_parse_deletion_time_uses_last_marker() {
        let fallback = Local::now();
        // An original name that itself contains the marker
        let time = parse_deletion_time("odd_del_name.mp4_del_20260105_120000", fallback);
        assert_eq!(
            time.format(TRASH_TIMESTAMP_FORMAT).to_string(),
            "20260105_120000"
        );
    }

    #[test]
    fn test_parse_deletion_time_falls_back() {
        let fallback = Local::now() - ChronoDuration::days(3);
        assert_eq!(parse_deletion_time("no-marker.mp4", fallback), fallback);
        assert_eq!(
            parse_deletion_time("bad.mp4_del_notatimestamp", fallback),
            fallback
        );
    }

    #[test]
    fn test_normalize_cron_adds_seconds_field() {
        assert_eq!(normalize_cron("0 10 * * *"), "0 0 10 * * *");
        assert_eq!(normalize_cron("0 0 10 * * *"), "0 0 10 * * *");
    }

    #[test]
    fn test_default_schedule_parses() {
        assert!(Schedule::from_str(&normalize_cron("0 10 * * *")).is_ok());
    }
}
