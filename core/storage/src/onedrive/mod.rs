//! OneDrive backend for InvoiceDrop.
//!
//! This module provides:
//! - OAuth2 credentials with a persisted token cache and device code fallback
//! - Direct uploads for small files
//! - Chunked upload sessions for large files

pub mod auth;
pub mod cache;
pub mod client;
pub mod upload;

pub use auth::{
    AuthState, AuthorizationBackend, Credential, CredentialManager, DeviceAuthorization,
    DeviceCodePrompt, ExchangeError, GraphAuthBackend, LogPrompt, TokenGrant, TokenSource,
};
pub use cache::{CacheStore, CachedAccount, FileCacheStore, MemoryCacheStore, TokenCache};
pub use client::{ContentRange, DriveItem, GraphEndpoints};
pub use upload::{UploadManager, UploadOutcome, UploadSession, UploadStrategy};
