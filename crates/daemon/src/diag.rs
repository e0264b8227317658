//! Stall diagnostics: mount-table and /proc excerpts logged before the
//! watchdog kills a silent encoder.

use std::path::Path;
use tracing::info;

/// One row of the OS mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub source: String,
    pub target: String,
    pub fstype: String,
    pub options: String,
}

/// Find the mount whose target is the longest prefix of `path`.
pub fn find_mount_info(path: &Path) -> Option<MountInfo> {
    let data = std::fs::read_to_string("/proc/self/mounts").ok()?;
    parse_mounts(&data, path)
}

/// Longest-prefix match over a mount table in /proc/self/mounts format.
pub fn parse_mounts(data: &str, path: &Path) -> Option<MountInfo> {
    let path_str = path.to_string_lossy();
    let mut best: Option<MountInfo> = None;
    let mut best_len = 0usize;

    for line in data.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }

        let target = unescape_mount_field(fields[1]);
        let matches = if target == "/" {
            path_str.starts_with('/')
        } else {
            path_str == target || path_str.starts_with(&format!("{target}/"))
        };

        if matches && target.len() > best_len {
            best_len = target.len();
            best = Some(MountInfo {
                source: unescape_mount_field(fields[0]),
                target,
                fstype: fields[2].to_string(),
                options: fields[3].to_string(),
            });
        }
    }

    best
}

/// The mount table escapes whitespace in paths as octal sequences.
pub fn unescape_mount_field(value: &str) -> String {
    value
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

/// A bounded excerpt of a /proc file, empty when unreadable.
fn read_proc_snippet(path: &Path, max_len: usize) -> String {
    let Ok(data) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let text = data.trim();
    if max_len > 0 && text.len() > max_len {
        let mut end = max_len;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    } else {
        text.to_string()
    }
}

/// Emit the full stall diagnostic record for a silent encoder child.
pub fn log_stall_diagnostics(
    task_id: i64,
    pid: Option<u32>,
    input: &Path,
    output: &Path,
    silent_for_secs: u64,
) {
    info!(
        task_id,
        pid,
        silent_for_secs,
        input = %input.display(),
        output = %output.display(),
        "encoder stall detected"
    );

    if let Some(mount) = find_mount_info(input) {
        info!(
            task_id,
            source = %mount.source,
            target = %mount.target,
            fstype = %mount.fstype,
            options = %mount.options,
            "input mount"
        );
    }
    if let Some(mount) = find_mount_info(output) {
        info!(
            task_id,
            source = %mount.source,
            target = %mount.target,
            fstype = %mount.fstype,
            options = %mount.options,
            "output mount"
        );
    }

    match std::fs::metadata(input) {
        Ok(meta) => info!(task_id, size = meta.len(), "input file stat"),
        Err(e) => info!(task_id, error = %e, "input file stat failed"),
    }

    let Some(pid) = pid else {
        return;
    };
    let proc_root = Path::new("/proc").join(pid.to_string());
    let wchan = read_proc_snippet(&proc_root.join("wchan"), 200);
    if !wchan.is_empty() {
        info!(task_id, wchan = %wchan, "encoder wait channel");
    }
    let status = read_proc_snippet(&proc_root.join("status"), 600);
    if !status.is_empty() {
        info!(task_id, status = %status, "encoder proc status");
    }
    let io = read_proc_snippet(&proc_root.join("io"), 400);
    if !io.is_empty() {
        info!(task_id, io = %io, "encoder proc io");
    }
}
