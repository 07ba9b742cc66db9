//! Integration tests for directory uploads with cached credentials.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use invoicedrop_common::{Error, NoOpProgress, RemotePath};
use invoicedrop_storage::config::{AuthConfig, UploadConfig};
use invoicedrop_storage::onedrive::{
    CachedAccount, CredentialManager, GraphAuthBackend, MemoryCacheStore, TokenCache,
    UploadManager,
};
use invoicedrop_storage::{BatchUploader, RetryConfig};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn auth_config(dir: &TempDir) -> AuthConfig {
    AuthConfig {
        client_id: "test-client".to_string(),
        cache_path: dir.path().join("token_cache.json"),
        ..AuthConfig::default()
    }
}

/// Credential manager whose cache holds a live token, so no identity
/// endpoint is ever contacted.
fn cached_credentials(config: AuthConfig) -> Arc<CredentialManager> {
    let mut account = CachedAccount::new(&config.client_id, &config.authority);
    account.access_token = Some("cached-token".to_string());
    account.refresh_token = Some("refresh".to_string());
    account.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
    account.scopes = config.scopes.clone();

    let mut cache = TokenCache::empty();
    cache.upsert(account);
    let store = Arc::new(MemoryCacheStore::with_blob(cache.serialize().unwrap()));
    let backend = Arc::new(GraphAuthBackend::new(&config).unwrap());
    Arc::new(CredentialManager::new(config, backend, store).unwrap())
}

fn uploader(server: &MockServer, dir: &TempDir) -> BatchUploader {
    let uploads = UploadManager::new(UploadConfig {
        api_base: server.uri(),
        ..UploadConfig::default()
    })
    .unwrap();
    let retry = RetryConfig::new(2)
        .with_initial_delay(Duration::from_millis(10))
        .with_jitter(false);
    BatchUploader::new(cached_credentials(auth_config(dir)), Arc::new(uploads), retry)
}

#[tokio::test]
async fn test_directory_upload_retries_transient_failures() {
    let server = MockServer::start().await;
    let cache_dir = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    std::fs::write(source.path().join("a.pdf"), b"first invoice").unwrap();
    std::fs::write(source.path().join("b.pdf"), b"second invoice").unwrap();
    std::fs::write(source.path().join("notes.txt"), b"ignored").unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    Mock::given(method("PUT"))
        .and(path("/me/drive/root:/Invoices/a.pdf:/content"))
        .and(header("authorization", "Bearer cached-token"))
        .respond_with(move |_req: &Request| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(503)
            } else {
                ResponseTemplate::new(201)
            }
        })
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/me/drive/root:/Invoices/b.pdf:/content"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let report = uploader(&server, &cache_dir)
        .with_max_concurrent(2)
        .upload_directory(
            source.path(),
            &RemotePath::parse("/Invoices").unwrap(),
            &["pdf".to_string()],
            &NoOpProgress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.uploaded.len(), 2);
    assert_eq!(report.bytes_uploaded(), 13 + 14);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rejected_file_is_not_retried() {
    let server = MockServer::start().await;
    let cache_dir = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    std::fs::write(source.path().join("a.pdf"), b"invoice").unwrap();

    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(403).set_body_string("accessDenied"))
        .expect(1)
        .mount(&server)
        .await;

    let report = uploader(&server, &cache_dir)
        .upload_directory(
            source.path(),
            &RemotePath::parse("/Invoices").unwrap(),
            &[],
            &NoOpProgress,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!report.is_success());
    assert_eq!(report.failed.len(), 1);
    assert!(matches!(
        report.failed[0].error,
        Error::UploadRejected { status: 403, .. }
    ));
}

#[tokio::test]
async fn test_cancelled_batch_skips_files() {
    let server = MockServer::start().await;
    let cache_dir = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    std::fs::write(source.path().join("a.pdf"), b"invoice").unwrap();
    std::fs::write(source.path().join("b.pdf"), b"invoice").unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = uploader(&server, &cache_dir)
        .upload_directory(
            source.path(),
            &RemotePath::parse("/Invoices").unwrap(),
            &[],
            &NoOpProgress,
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(report.skipped.len(), 2);
    assert!(report.uploaded.is_empty());
    assert!(server.received_requests().await.unwrap().is_empty());
}
