//! Classifier module for categorizing encode failures.
//!
//! Every failed attempt is mapped to a human-readable category and a
//! transient flag; the worker retries transient failures while the retry
//! budget lasts and parks everything else as failed.

/// Triggers that indicate the encoder or a probe stopped making progress.
const STALL_TRIGGERS: &[&str] = &["progress stalled", "encoder timeout", "probe timeout"];

/// Triggers that indicate the mount or underlying IO path misbehaved
/// (matched case-insensitively).
const MOUNT_IO_TRIGGERS: &[&str] = &[
    "input/output error",
    "i/o error",
    "stale file handle",
    "operation timed out",
    "connection reset",
    "connection timed out",
    "permission denied",
    "no such file",
    "broken pipe",
];

/// Triggers that indicate the source itself is corrupt or unsupported
/// (matched case-insensitively).
const SOURCE_CORRUPT_TRIGGERS: &[&str] = &[
    "file check failed",
    "decode test failed",
    "invalid nal",
    "moov atom not found",
    "invalid data found",
    "corrupt",
];

/// Category and retry policy for one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Short label for operators
    pub category: &'static str,
    /// Whether another attempt is worth making
    pub transient: bool,
}

/// Classify a failure message.
///
/// The match order mirrors the retry policy: stalls and bad outputs are
/// retried, infrastructure trouble is retried, everything that points at
/// the source file itself is terminal.
pub fn classify_error(message: &str) -> Classification {
    let lower = message.to_lowercase();

    if STALL_TRIGGERS.iter().any(|t| lower.contains(t)) {
        return Classification {
            category: "IO/process stall",
            transient: true,
        };
    }

    if lower.contains("output verification failed") {
        return Classification {
            category: "corrupt output, retry",
            transient: true,
        };
    }

    if MOUNT_IO_TRIGGERS.iter().any(|t| lower.contains(t)) {
        return Classification {
            category: "mount/IO issue",
            transient: true,
        };
    }

    if lower.contains("disk space") {
        return Classification {
            category: "out of disk",
            transient: false,
        };
    }

    if SOURCE_CORRUPT_TRIGGERS.iter().any(|t| lower.contains(t)) {
        return Classification {
            category: "source corrupt / unsupported",
            transient: false,
        };
    }

    Classification {
        category: "unknown",
        transient: false,
    }
}
