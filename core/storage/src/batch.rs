//! Directory uploads.
//!
//! Every file gets a fresh credential and is retried from scratch on
//! transient failures. A failed file does not stop the batch, except for
//! authentication or configuration failures, which would fail every
//! remaining file the same way.

use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use invoicedrop_common::{Error, ProgressCallback, RemotePath, Result, UploadProgress};

use crate::onedrive::{CredentialManager, UploadManager, UploadOutcome};
use crate::retry::{RetryConfig, RetryExecutor};

/// A file that could not be uploaded.
#[derive(Debug)]
pub struct FailedUpload {
    pub path: PathBuf,
    pub error: Error,
}

/// Outcome of a directory upload.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub uploaded: Vec<UploadOutcome>,
    pub failed: Vec<FailedUpload>,
    /// Files never attempted because the batch was stopped.
    pub skipped: Vec<PathBuf>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.uploaded.iter().map(|o| o.bytes_uploaded).sum()
    }
}

/// Regular files directly inside `dir` whose extension is in `extensions`,
/// sorted by path.
///
/// Extensions compare case-insensitively, with or without a leading dot. An
/// empty filter accepts every file.
pub fn collect_files(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::NotFound(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    let wanted: Vec<String> = extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect();

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let matches = wanted.is_empty()
            || path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| wanted.contains(&e.to_ascii_lowercase()))
                .unwrap_or(false);
        if matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Uploads files with per-file credentials and whole-file retries.
pub struct BatchUploader {
    credentials: Arc<CredentialManager>,
    uploads: Arc<UploadManager>,
    retry: RetryExecutor,
    max_concurrent: usize,
}

impl BatchUploader {
    pub fn new(
        credentials: Arc<CredentialManager>,
        uploads: Arc<UploadManager>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            credentials,
            uploads,
            retry: RetryExecutor::new(retry),
            max_concurrent: 1,
        }
    }

    /// Upload up to `max` files at once. Chunks of one file stay sequential.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Upload one file into `folder` under its base name.
    ///
    /// A new credential is acquired for every attempt; a retried attempt
    /// starts over with a new session.
    pub async fn upload_one(
        &self,
        local_file: &Path,
        folder: &RemotePath,
        progress: &dyn ProgressCallback<UploadProgress>,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome> {
        let destination = UploadManager::destination_for(folder, local_file)?;
        let destination = &destination;

        self.retry
            .execute(|attempt| async move {
                if attempt > 0 {
                    info!(
                        "Retrying upload of {} (attempt {})",
                        local_file.display(),
                        attempt + 1
                    );
                }
                let credential = self.credentials.acquire_token_cancellable(cancel).await?;
                self.uploads
                    .upload_file(
                        credential.access_token(),
                        local_file,
                        destination,
                        progress,
                        cancel,
                    )
                    .await
            })
            .await
    }

    /// Upload every matching file in `dir` into `folder`.
    ///
    /// Only fails outright if the directory cannot be listed; per-file
    /// failures are collected in the report.
    pub async fn upload_directory(
        &self,
        dir: &Path,
        folder: &RemotePath,
        extensions: &[String],
        progress: &dyn ProgressCallback<UploadProgress>,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let files = collect_files(dir, extensions)?;
        info!(
            "Uploading {} files from {} to {}",
            files.len(),
            dir.display(),
            folder
        );

        let batch_cancel = cancel.child_token();
        let batch_cancel = &batch_cancel;

        let mut results: Vec<(PathBuf, Option<Result<UploadOutcome>>)> = stream::iter(files)
            .map(|path| async move {
                if batch_cancel.is_cancelled() {
                    return (path, None);
                }
                let result = self.upload_one(&path, folder, progress, batch_cancel).await;
                if let Err(Error::Authentication(_) | Error::Configuration(_)) = &result {
                    warn!("Stopping batch: credentials unavailable");
                    batch_cancel.cancel();
                }
                (path, Some(result))
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        let mut report = BatchReport::default();
        for (path, result) in results {
            match result {
                Some(Ok(outcome)) => report.uploaded.push(outcome),
                Some(Err(error)) => {
                    error!("Failed to upload {}: {}", path.display(), error);
                    report.failed.push(FailedUpload { path, error });
                }
                None => report.skipped.push(path),
            }
        }

        info!(
            "Batch finished: {} uploaded, {} failed, {} skipped",
            report.uploaded.len(),
            report.failed.len(),
            report.skipped.len()
        );
        Ok(report)
    }
}
