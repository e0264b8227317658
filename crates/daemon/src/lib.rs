//! stm daemon core
//!
//! Background service that watches media directories, transcodes every
//! discovered video through an external encoder, and keeps a durable,
//! auditable record of each file's state.

pub mod classify;
pub mod cleaner;
pub mod diag;
pub mod encode;
pub mod logging;
pub mod media;
pub mod metrics;
pub mod scan;
pub mod server;
pub mod store;
pub mod worker;

pub use classify::{classify_error, Classification};
pub use cleaner::{CleanError, Cleaner, TrashFile};
pub use encode::{
    build_encoder_args, compute_encode_deadline, EncodeDriver, EncodeError, EncodeOutcome,
};
pub use media::{count_error_lines, Ffmpeg, MediaError, MediaToolkit, ERROR_LINE_MARKERS};
pub use metrics::{Metrics, MetricsError, SharedMetrics};
pub use scan::{ScanError, Scanner, ScanSummary};
pub use server::{create_router, run_server, AppState, ServerError};
pub use store::{Stats, StoreError, Task, TaskStatus, TaskStore, MAX_ATTEMPTS};
pub use worker::{is_within_window, WorkerPool, WorkerStatus};
