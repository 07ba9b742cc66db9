//! OneDrive storage backend for InvoiceDrop.
//!
//! Credential acquisition, single-request and chunked uploads, whole-file
//! retries and directory batches, plus the configuration they share.
//!
//! # Design Principles
//! - Credentials are requested per operation, never held across files
//! - Chunks are sent strictly in order, one at a time
//! - Progress observers are advisory; cancellation uses a token
//! - Unified error semantics through `invoicedrop_common::Error`

pub mod batch;
pub mod config;
pub mod onedrive;
pub mod retry;

pub use batch::{collect_files, BatchReport, BatchUploader, FailedUpload};
pub use config::{AppConfig, AuthConfig, RetrySettings, UploadConfig};
pub use onedrive::{
    CredentialManager, FileCacheStore, GraphAuthBackend, UploadManager, UploadOutcome,
    UploadStrategy,
};
pub use retry::{RetryConfig, RetryExecutor};
