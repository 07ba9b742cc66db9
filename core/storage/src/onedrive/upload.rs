//! File uploads to OneDrive.
//!
//! Files below the size threshold go up in a single PUT. Larger files use a
//! resumable upload session: chunks are read sequentially and sent strictly
//! in byte order, each only after the previous one was acknowledged. A
//! rejected chunk ends the upload; the abandoned session is left to expire
//! on the server.

use bytes::Bytes;
use reqwest::{header, Client, StatusCode};
use std::path::Path;
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use invoicedrop_common::{
    Error, ProgressCallback, RemotePath, Result, UploadProgress, UploadStage,
};

use super::client::{
    chunk_count, ContentRange, CreateSessionRequest, DriveItem, GraphEndpoints,
    UploadSessionResponse,
};
use crate::config::UploadConfig;

/// How a file is sent, chosen once from its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    /// One authenticated PUT carrying the whole file.
    Direct,
    /// Resumable session with byte-range chunks.
    Chunked,
}

impl UploadStrategy {
    /// `Direct` for sizes strictly below `threshold`, `Chunked` otherwise.
    pub fn select(size_bytes: u64, threshold: u64) -> Self {
        if size_bytes < threshold {
            UploadStrategy::Direct
        } else {
            UploadStrategy::Chunked
        }
    }
}

impl std::fmt::Display for UploadStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadStrategy::Direct => write!(f, "direct upload"),
            UploadStrategy::Chunked => write!(f, "upload session"),
        }
    }
}

/// Server-side resumable session and the offset it has acknowledged.
#[derive(Debug, Clone)]
pub struct UploadSession {
    session_url: String,
    total_size: u64,
    bytes_committed: u64,
    chunk_size: u64,
}

impl UploadSession {
    pub fn new(session_url: impl Into<String>, total_size: u64, chunk_size: u64) -> Self {
        Self {
            session_url: session_url.into(),
            total_size,
            bytes_committed: 0,
            chunk_size,
        }
    }

    pub fn session_url(&self) -> &str {
        &self.session_url
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn bytes_committed(&self) -> u64 {
        self.bytes_committed
    }

    pub fn chunk_count(&self) -> u64 {
        chunk_count(self.total_size, self.chunk_size)
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_committed >= self.total_size
    }

    /// Length of the next chunk: a full chunk, or whatever remains.
    pub fn next_chunk_len(&self) -> u64 {
        self.chunk_size
            .min(self.total_size.saturating_sub(self.bytes_committed))
    }

    /// Range for a chunk of `len` bytes starting at the committed offset.
    pub fn next_range(&self, len: u64) -> Option<ContentRange> {
        ContentRange::for_chunk(self.bytes_committed, len, self.total_size)
    }

    /// Advance the committed offset past an acknowledged chunk.
    fn commit(&mut self, range: &ContentRange) {
        debug_assert_eq!(range.start, self.bytes_committed);
        self.bytes_committed += range.byte_len();
    }
}

/// Result of a successful upload.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub strategy: UploadStrategy,
    pub destination: RemotePath,
    pub bytes_uploaded: u64,
    /// Item metadata, when the final response carried it.
    pub item: Option<DriveItem>,
}

/// Uploads local files to path-addressed locations in the user's drive.
///
/// The manager never obtains or refreshes tokens; callers pass a bearer
/// token acquired for the current operation.
pub struct UploadManager {
    http: Client,
    endpoints: GraphEndpoints,
    config: UploadConfig,
}

impl UploadManager {
    /// Create an upload manager.
    ///
    /// # Errors
    /// - `Configuration` for a misaligned chunk size or invalid API base
    pub fn new(config: UploadConfig) -> Result<Self> {
        config.validate()?;

        let http = Client::builder()
            .user_agent(concat!("InvoiceDrop/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoints: GraphEndpoints::new(config.api_base.clone()),
            config,
        })
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn select_strategy(&self, size_bytes: u64) -> UploadStrategy {
        UploadStrategy::select(size_bytes, self.config.small_file_threshold)
    }

    /// Remote path for `local_file` inside `folder`, using only the file's
    /// base name.
    pub fn destination_for(folder: &RemotePath, local_file: &Path) -> Result<RemotePath> {
        let name = local_file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "Cannot derive a remote name from {}",
                    local_file.display()
                ))
            })?;
        folder.join(name)
    }

    /// Upload a file, choosing the strategy from its current size.
    ///
    /// For direct uploads a single progress observation is emitted on
    /// success.
    pub async fn upload_file(
        &self,
        token: &str,
        local_file: &Path,
        destination: &RemotePath,
        progress: &dyn ProgressCallback<UploadProgress>,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled { bytes_committed: 0 });
        }

        let size = file_size(local_file).await?;
        match self.select_strategy(size) {
            UploadStrategy::Direct => {
                let outcome = self.upload_direct(token, local_file, destination).await?;
                progress.on_progress(&UploadProgress {
                    file_name: remote_name(destination)?.to_string(),
                    bytes_committed: outcome.bytes_uploaded,
                    total_bytes: outcome.bytes_uploaded,
                    chunk_index: 1,
                    chunk_count: 1,
                });
                Ok(outcome)
            }
            UploadStrategy::Chunked => {
                self.upload_chunked(token, local_file, destination, progress, cancel)
                    .await
            }
        }
    }

    /// Upload the whole file with one PUT.
    ///
    /// Succeeds on 200 or 201. Any other status is returned as
    /// `UploadRejected`; there is no retry and no fallback to a session.
    pub async fn upload_direct(
        &self,
        token: &str,
        local_file: &Path,
        destination: &RemotePath,
    ) -> Result<UploadOutcome> {
        let name = remote_name(destination)?;
        let content = fs::read(local_file).await?;
        let size = content.len() as u64;
        let url = self.endpoints.content_url(destination);

        let response = self
            .http
            .put(&url)
            .bearer_auth(token)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(content)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to upload {}: {}", name, e)))?;

        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            let item = response.json::<DriveItem>().await.ok();
            info!(
                "Successfully uploaded {} to OneDrive at {}",
                name, destination
            );
            Ok(UploadOutcome {
                strategy: UploadStrategy::Direct,
                destination: destination.clone(),
                bytes_uploaded: size,
                item,
            })
        } else {
            let body = response.text().await.unwrap_or_default();
            error!(
                "Failed to upload {} to OneDrive: {} - {}",
                name,
                status.as_u16(),
                body
            );
            Err(Error::UploadRejected {
                stage: UploadStage::Direct,
                status: status.as_u16(),
                body,
                bytes_committed: 0,
            })
        }
    }

    /// Upload through a resumable session, one chunk at a time.
    ///
    /// # Errors
    /// - `UploadRejected` with stage `SessionCreation` if no session was
    ///   created; no chunk is sent in that case
    /// - `UploadRejected` with stage `Chunk` at the first rejected chunk,
    ///   carrying the bytes committed before it
    /// - `LocalFileTruncated` if the file ends before its declared size
    /// - `Cancelled` if `cancel` fires between chunks
    pub async fn upload_chunked(
        &self,
        token: &str,
        local_file: &Path,
        destination: &RemotePath,
        progress: &dyn ProgressCallback<UploadProgress>,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome> {
        let name = remote_name(destination)?;
        let total_size = file_size(local_file).await?;
        if total_size == 0 {
            return Err(Error::InvalidInput(format!(
                "Cannot open an upload session for empty file {}",
                local_file.display()
            )));
        }

        // No session is created for an unreadable file.
        let mut file = File::open(local_file).await?;
        let mut session = self.create_session(token, destination, total_size).await?;
        let count = session.chunk_count();
        let mut item = None;
        let mut index = 0u64;

        while !session.is_complete() {
            if cancel.is_cancelled() {
                warn!(
                    "Upload of {} cancelled after {}/{} bytes",
                    name,
                    session.bytes_committed(),
                    total_size
                );
                return Err(Error::Cancelled {
                    bytes_committed: session.bytes_committed(),
                });
            }

            let wanted = session.next_chunk_len();
            let chunk = read_chunk(&mut file, wanted).await?;
            if (chunk.len() as u64) < wanted {
                error!(
                    "{} ended at {} bytes, expected {}",
                    local_file.display(),
                    session.bytes_committed() + chunk.len() as u64,
                    total_size
                );
                return Err(Error::LocalFileTruncated {
                    expected: total_size,
                    actual: session.bytes_committed() + chunk.len() as u64,
                });
            }

            let Some(range) = session.next_range(chunk.len() as u64) else {
                return Err(Error::LocalFileTruncated {
                    expected: total_size,
                    actual: session.bytes_committed(),
                });
            };
            index += 1;

            let response = self
                .http
                .put(session.session_url())
                .header(header::CONTENT_LENGTH, range.byte_len().to_string())
                .header(header::CONTENT_RANGE, range.to_string())
                .body(chunk)
                .send()
                .await
                .map_err(|e| {
                    Error::Network(format!(
                        "Failed to upload chunk {}-{} of {} ({} bytes committed): {}",
                        range.start,
                        range.end,
                        name,
                        session.bytes_committed(),
                        e
                    ))
                })?;

            let status = response.status();
            match status {
                StatusCode::OK | StatusCode::CREATED => {
                    item = response.json::<DriveItem>().await.ok();
                }
                StatusCode::ACCEPTED => {}
                _ => {
                    let body = response.text().await.unwrap_or_default();
                    error!(
                        "Failed to upload chunk {}-{} of {}: {} - {}",
                        range.start,
                        range.end,
                        name,
                        status.as_u16(),
                        body
                    );
                    return Err(Error::UploadRejected {
                        stage: UploadStage::Chunk { index, count },
                        status: status.as_u16(),
                        body,
                        bytes_committed: session.bytes_committed(),
                    });
                }
            }

            session.commit(&range);
            debug!(
                "Uploaded {}/{} bytes of {} (chunk {}/{})",
                session.bytes_committed(),
                total_size,
                name,
                index,
                count
            );
            progress.on_progress(&UploadProgress {
                file_name: name.to_string(),
                bytes_committed: session.bytes_committed(),
                total_bytes: total_size,
                chunk_index: index,
                chunk_count: count,
            });
        }

        info!("Finished uploading {} to OneDrive at {}", name, destination);
        Ok(UploadOutcome {
            strategy: UploadStrategy::Chunked,
            destination: destination.clone(),
            bytes_uploaded: session.bytes_committed(),
            item,
        })
    }

    /// Create a rename-on-conflict upload session for `destination`.
    async fn create_session(
        &self,
        token: &str,
        destination: &RemotePath,
        total_size: u64,
    ) -> Result<UploadSession> {
        let name = remote_name(destination)?;
        let url = self.endpoints.create_session_url(destination);

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&CreateSessionRequest::rename_on_conflict(name))
            .send()
            .await
            .map_err(|e| {
                Error::Network(format!("Failed to create upload session for {}: {}", name, e))
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            error!(
                "Failed to create upload session for {}: {} - {}",
                name,
                status.as_u16(),
                body
            );
            return Err(Error::UploadRejected {
                stage: UploadStage::SessionCreation,
                status: status.as_u16(),
                body,
                bytes_committed: 0,
            });
        }

        let created: UploadSessionResponse = response.json().await.map_err(|e| {
            Error::Serialization(format!("Invalid upload session response: {}", e))
        })?;
        url::Url::parse(&created.upload_url).map_err(|e| {
            Error::Serialization(format!("Invalid upload session URL: {}", e))
        })?;

        debug!(
            "Upload session for {} expires at {:?}",
            name, created.expiration_date_time
        );
        Ok(UploadSession::new(
            created.upload_url,
            total_size,
            self.config.chunk_size as u64,
        ))
    }
}

fn remote_name(destination: &RemotePath) -> Result<&str> {
    destination.name().ok_or_else(|| {
        Error::InvalidInput("Destination must name a file, not the drive root".to_string())
    })
}

async fn file_size(local_file: &Path) -> Result<u64> {
    let metadata = fs::metadata(local_file).await?;
    if !metadata.is_file() {
        return Err(Error::InvalidInput(format!(
            "{} is not a regular file",
            local_file.display()
        )));
    }
    Ok(metadata.len())
}

/// Read up to `len` bytes, stopping early only at end of file.
async fn read_chunk(file: &mut File, len: u64) -> Result<Bytes> {
    let mut buffer = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut buffer).await?;
    Ok(Bytes::from(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CHUNK_ALIGNMENT, SMALL_FILE_THRESHOLD};
    use proptest::prelude::*;

    #[test]
    fn test_strategy_threshold() {
        assert_eq!(UploadStrategy::select(0, SMALL_FILE_THRESHOLD), UploadStrategy::Direct);
        assert_eq!(
            UploadStrategy::select(SMALL_FILE_THRESHOLD - 1, SMALL_FILE_THRESHOLD),
            UploadStrategy::Direct
        );
        assert_eq!(
            UploadStrategy::select(SMALL_FILE_THRESHOLD, SMALL_FILE_THRESHOLD),
            UploadStrategy::Chunked
        );
        assert_eq!(
            UploadStrategy::select(5 * 1024 * 1024, SMALL_FILE_THRESHOLD),
            UploadStrategy::Chunked
        );
    }

    fn planned_ranges(total: u64, chunk_size: u64) -> Vec<ContentRange> {
        let mut session = UploadSession::new("https://upload.example/s", total, chunk_size);
        let mut ranges = Vec::new();
        while !session.is_complete() {
            let range = session.next_range(session.next_chunk_len()).unwrap();
            session.commit(&range);
            ranges.push(range);
        }
        ranges
    }

    #[test]
    fn test_five_mib_plan() {
        let ranges = planned_ranges(5 * 1024 * 1024, CHUNK_ALIGNMENT as u64);
        assert_eq!(ranges.len(), 16);
        assert_eq!(ranges[0].to_string(), "bytes 0-327679/5242880");
        assert_eq!(ranges[15].to_string(), "bytes 4915200-5242879/5242880");
    }

    #[test]
    fn test_final_chunk_is_short() {
        let total = 4 * 1024 * 1024 + 100;
        let ranges = planned_ranges(total, CHUNK_ALIGNMENT as u64);
        assert_eq!(ranges.len(), 13);
        let last = ranges.last().unwrap();
        assert_eq!(last.byte_len(), total - 12 * CHUNK_ALIGNMENT as u64);
        assert_eq!(last.end, total - 1);
    }

    #[test]
    fn test_destination_uses_base_name() {
        let folder = RemotePath::parse("/Invoices").unwrap();
        let dest =
            UploadManager::destination_for(&folder, Path::new("Data/attachments/Q1 bill.pdf"))
                .unwrap();
        assert_eq!(dest.to_string_path(), "/Invoices/Q1 bill.pdf");
        assert!(UploadManager::destination_for(&folder, Path::new("/")).is_err());
    }

    #[test]
    fn test_manager_rejects_misaligned_chunks() {
        let config = UploadConfig {
            chunk_size: 100_000,
            ..UploadConfig::default()
        };
        assert!(matches!(UploadManager::new(config), Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_stalled_session_never_reports_success() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "uploadUrl": format!("{}/upload/stalled", server.uri())
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(202))
            .expect(0)
            .mount(&server)
            .await;

        // A zero chunk size can never advance the committed offset.
        let config = UploadConfig {
            api_base: server.uri(),
            chunk_size: 0,
            ..UploadConfig::default()
        };
        let manager = UploadManager {
            http: Client::new(),
            endpoints: GraphEndpoints::new(config.api_base.clone()),
            config,
        };

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("big.pdf");
        std::fs::write(&local, vec![1u8; 1000]).unwrap();

        let err = manager
            .upload_chunked(
                "token",
                &local,
                &RemotePath::parse("/Invoices/big.pdf").unwrap(),
                &invoicedrop_common::NoOpProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::LocalFileTruncated {
                expected: 1000,
                actual: 0
            }
        ));
    }

    #[tokio::test]
    async fn test_read_chunk_stops_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![7u8; 1000]).unwrap();

        let mut file = File::open(&path).await.unwrap();
        assert_eq!(read_chunk(&mut file, 600).await.unwrap().len(), 600);
        assert_eq!(read_chunk(&mut file, 600).await.unwrap().len(), 400);
        assert!(read_chunk(&mut file, 600).await.unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn prop_ranges_are_contiguous_and_cover_the_file(
            total in 1u64..20_000_000,
            chunk_size in 1u64..2_000_000,
        ) {
            let ranges = planned_ranges(total, chunk_size);

            prop_assert_eq!(ranges.len() as u64, chunk_count(total, chunk_size));
            prop_assert_eq!(ranges[0].start, 0);
            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[1].start, pair[0].end + 1);
            }
            for range in &ranges {
                prop_assert!(range.start <= range.end);
                prop_assert!(range.byte_len() <= chunk_size);
                prop_assert_eq!(range.total, total);
            }
            prop_assert_eq!(ranges.last().unwrap().end, total - 1);
        }
    }
}
