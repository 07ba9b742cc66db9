//! Microsoft Graph drive endpoints and wire types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use invoicedrop_common::RemotePath;

/// Conflict behavior requested for upload sessions: never overwrite.
pub const CONFLICT_BEHAVIOR: &str = "rename";

/// Path-addressed endpoints of the signed-in user's drive.
#[derive(Debug, Clone)]
pub struct GraphEndpoints {
    api_base: String,
}

impl GraphEndpoints {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn item_url(&self, path: &RemotePath, action: &str) -> String {
        format!("{}/me/drive/root:{}:/{}", self.api_base, path.escaped(), action)
    }

    /// Single-request content upload URL.
    pub fn content_url(&self, path: &RemotePath) -> String {
        self.item_url(path, "content")
    }

    /// Upload session creation URL.
    pub fn create_session_url(&self, path: &RemotePath) -> String {
        self.item_url(path, "createUploadSession")
    }
}

/// Drive item returned once an upload completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub web_url: Option<String>,
}

/// Body of an upload session creation request.
#[derive(Debug, Serialize)]
pub struct CreateSessionRequest<'a> {
    item: SessionItem<'a>,
}

#[derive(Debug, Serialize)]
struct SessionItem<'a> {
    #[serde(rename = "@microsoft.graph.conflictBehavior")]
    conflict_behavior: &'a str,
    name: &'a str,
}

impl<'a> CreateSessionRequest<'a> {
    /// Session for `name` that renames on collision.
    pub fn rename_on_conflict(name: &'a str) -> Self {
        Self {
            item: SessionItem {
                conflict_behavior: CONFLICT_BEHAVIOR,
                name,
            },
        }
    }
}

/// Response to upload session creation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSessionResponse {
    pub upload_url: String,
    #[serde(default)]
    pub expiration_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_expected_ranges: Vec<String>,
}

/// Inclusive byte range of one chunk, rendered as a `Content-Range` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ContentRange {
    /// Range of `len` bytes starting at `start`. `None` for an empty chunk.
    pub fn for_chunk(start: u64, len: u64, total: u64) -> Option<Self> {
        if len == 0 {
            return None;
        }
        Some(Self {
            start,
            end: start + len - 1,
            total,
        })
    }

    /// Number of bytes covered.
    pub fn byte_len(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Number of chunks needed for `total` bytes.
pub fn chunk_count(total: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total.div_ceil(chunk_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_url_escapes_path() {
        let endpoints = GraphEndpoints::new("https://graph.microsoft.com/v1.0/");
        let path = RemotePath::parse("/Invoices/a.pdf").unwrap();
        assert_eq!(
            endpoints.content_url(&path),
            "https://graph.microsoft.com/v1.0/me/drive/root:/Invoices/a.pdf:/content"
        );

        let spaced = RemotePath::parse("/Invoice Data/b c.json").unwrap();
        assert_eq!(
            endpoints.create_session_url(&spaced),
            "https://graph.microsoft.com/v1.0/me/drive/root:/Invoice%20Data/b%20c.json:/createUploadSession"
        );
    }

    #[test]
    fn test_create_session_body() {
        let body = serde_json::to_value(CreateSessionRequest::rename_on_conflict("big file.pdf"))
            .unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "item": {
                    "@microsoft.graph.conflictBehavior": "rename",
                    "name": "big file.pdf"
                }
            })
        );
    }

    #[test]
    fn test_session_response_parsing() {
        let json = r#"{
            "uploadUrl": "https://sn3302.up.1drv.com/up/fe6987415ace7X4e1eF866337",
            "expirationDateTime": "2015-01-29T09:21:55.523Z",
            "nextExpectedRanges": ["0-"]
        }"#;
        let session: UploadSessionResponse = serde_json::from_str(json).unwrap();
        assert!(session.upload_url.starts_with("https://sn3302"));
        assert!(session.expiration_date_time.is_some());
        assert_eq!(session.next_expected_ranges, vec!["0-"]);
    }

    #[test]
    fn test_content_range_rendering() {
        let range = ContentRange::for_chunk(327_680, 327_680, 5_242_880).unwrap();
        assert_eq!(range.to_string(), "bytes 327680-655359/5242880");
        assert_eq!(range.byte_len(), 327_680);
        assert!(ContentRange::for_chunk(0, 0, 10).is_none());
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(5 * 1024 * 1024, 320 * 1024), 16);
        assert_eq!(chunk_count(4 * 1024 * 1024, 320 * 1024), 13);
        assert_eq!(chunk_count(320 * 1024, 320 * 1024), 1);
        assert_eq!(chunk_count(0, 320 * 1024), 0);
    }

    #[test]
    fn test_drive_item_parsing() {
        let json = r#"{"id": "01BYE5RZ", "name": "a.pdf", "size": 1048576, "webUrl": "https://onedrive.live.com/a.pdf", "file": {}}"#;
        let item: DriveItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.size, Some(1_048_576));
        assert_eq!(item.web_url.as_deref(), Some("https://onedrive.live.com/a.pdf"));
    }
}
