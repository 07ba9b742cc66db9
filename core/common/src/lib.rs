//! Common utilities and types shared across InvoiceDrop modules.
//!
//! This module provides the error taxonomy, remote path handling and the
//! progress reporting contract used by the storage backend and the CLI.

pub mod error;
pub mod progress;
pub mod types;

pub use error::{Error, Result, UploadStage};
pub use progress::{progress_fn, FnProgress, NoOpProgress, ProgressCallback, UploadProgress};
pub use types::RemotePath;
