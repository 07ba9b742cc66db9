//! Persisted token cache.
//!
//! The cache is a versioned JSON blob holding the refresh material for the
//! signed-in account. Callers treat it as opaque: they deserialize it, hand
//! it to the credential manager, and write it back only when
//! [`TokenCache::has_state_changed`] reports a mutation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::fs;
use uuid::Uuid;

use invoicedrop_common::{Error, Result};

/// Current cache blob format version.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Access tokens expiring within this window are not reused.
const EXPIRY_MARGIN_MINUTES: i64 = 5;

/// Refresh material and last access token for one signed-in account.
#[derive(Clone, Serialize, Deserialize)]
pub struct CachedAccount {
    /// Local identifier assigned when the account first signed in.
    pub account_id: String,
    /// Client the tokens were issued to.
    pub client_id: String,
    /// Authority that issued the tokens.
    pub authority: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Scopes the access token was granted for.
    #[serde(default)]
    pub scopes: Vec<String>,
    pub last_refresh: DateTime<Utc>,
}

impl CachedAccount {
    /// Create a fresh account entry for a client and authority.
    pub fn new(client_id: impl Into<String>, authority: impl Into<String>) -> Self {
        Self {
            account_id: Uuid::new_v4().to_string(),
            client_id: client_id.into(),
            authority: authority.into(),
            refresh_token: None,
            access_token: None,
            expires_at: None,
            scopes: Vec::new(),
            last_refresh: Utc::now(),
        }
    }

    /// Whether the cached access token can be reused for `scopes` right now.
    ///
    /// Tokens within five minutes of expiry, or without a known expiry, are
    /// never reused.
    pub fn has_usable_access_token(&self, scopes: &[String]) -> bool {
        let Some(expires_at) = self.expires_at else {
            return false;
        };
        if self.access_token.is_none()
            || expires_at < Utc::now() + Duration::minutes(EXPIRY_MARGIN_MINUTES)
        {
            return false;
        }
        scopes
            .iter()
            .all(|wanted| self.scopes.iter().any(|granted| scope_matches(granted, wanted)))
    }
}

impl fmt::Debug for CachedAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedAccount")
            .field("account_id", &self.account_id)
            .field("client_id", &self.client_id)
            .field("authority", &self.authority)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_access_token", &self.access_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Compare scopes ignoring case and an optional resource prefix
/// (`https://graph.microsoft.com/Files.ReadWrite` matches `Files.ReadWrite`).
pub(crate) fn scope_matches(granted: &str, wanted: &str) -> bool {
    fn short(scope: &str) -> &str {
        scope.rsplit('/').next().unwrap_or(scope)
    }
    short(granted).eq_ignore_ascii_case(short(wanted))
}

#[derive(Serialize, Deserialize)]
struct CacheDocument {
    version: u32,
    #[serde(default)]
    accounts: Vec<CachedAccount>,
}

/// In-memory token cache with change tracking.
#[derive(Debug, Default)]
pub struct TokenCache {
    accounts: Vec<CachedAccount>,
    changed: bool,
}

impl TokenCache {
    /// An empty cache (no accounts, unchanged).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a persisted blob. An empty or whitespace-only blob is an empty
    /// cache.
    ///
    /// # Errors
    /// - `Configuration` if the blob is not a cache document or has an
    ///   unsupported version. A corrupt cache is never treated as empty.
    pub fn deserialize(blob: &[u8]) -> Result<Self> {
        if blob.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::empty());
        }

        let document: CacheDocument = serde_json::from_slice(blob)
            .map_err(|e| Error::Configuration(format!("Token cache is corrupt: {}", e)))?;

        if document.version != CACHE_FORMAT_VERSION {
            return Err(Error::Configuration(format!(
                "Unsupported token cache version {} (expected {})",
                document.version, CACHE_FORMAT_VERSION
            )));
        }

        Ok(Self {
            accounts: document.accounts,
            changed: false,
        })
    }

    /// Serialize to the persisted blob format.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let document = CacheDocument {
            version: CACHE_FORMAT_VERSION,
            accounts: self.accounts.clone(),
        };
        serde_json::to_vec_pretty(&document)
            .map_err(|e| Error::Serialization(format!("Failed to serialize token cache: {}", e)))
    }

    /// Whether the cache was mutated since it was loaded or last persisted.
    pub fn has_state_changed(&self) -> bool {
        self.changed
    }

    /// Record that the current state has been written to storage.
    pub fn mark_persisted(&mut self) {
        self.changed = false;
    }

    pub fn accounts(&self) -> &[CachedAccount] {
        &self.accounts
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// The account signed in for a client at an authority, if any.
    pub fn find_account(&self, client_id: &str, authority: &str) -> Option<&CachedAccount> {
        self.accounts
            .iter()
            .find(|a| a.client_id == client_id && a.authority == authority)
    }

    /// Insert or replace the account for the entry's client and authority.
    pub fn upsert(&mut self, account: CachedAccount) {
        self.accounts
            .retain(|a| !(a.client_id == account.client_id && a.authority == account.authority));
        self.accounts.push(account);
        self.changed = true;
    }

    /// Remove every account.
    pub fn clear(&mut self) {
        if !self.accounts.is_empty() {
            self.accounts.clear();
            self.changed = true;
        }
    }
}

/// Storage boundary for the cache blob.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Read the blob. `Ok(None)` means nothing has been persisted yet.
    async fn load(&self) -> Result<Option<Vec<u8>>>;

    /// Replace the persisted blob.
    async fn save(&self, blob: &[u8]) -> Result<()>;
}

/// Cache blob stored in a single file, replaced atomically on save.
pub struct FileCacheStore {
    path: PathBuf,
}

impl FileCacheStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "token_cache".to_string());
        self.path
            .with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn load(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path).await {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Configuration(format!(
                "Token cache {} is unreadable: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn save(&self, blob: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        // Write beside the target, then rename over it.
        let temp = self.temp_path();
        fs::write(&temp, blob).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        if let Err(e) = fs::rename(&temp, &self.path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// In-memory cache store that counts saves.
#[derive(Default)]
pub struct MemoryCacheStore {
    blob: Mutex<Option<Vec<u8>>>,
    saves: AtomicUsize,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `blob`.
    pub fn with_blob(blob: Vec<u8>) -> Self {
        Self {
            blob: Mutex::new(Some(blob)),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of completed saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Current blob, if any.
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.blob.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn load(&self) -> Result<Option<Vec<u8>>> {
        let blob = self
            .blob
            .lock()
            .map_err(|_| Error::Configuration("Token cache lock poisoned".to_string()))?;
        Ok(blob.clone())
    }

    async fn save(&self, blob: &[u8]) -> Result<()> {
        let mut stored = self
            .blob
            .lock()
            .map_err(|_| Error::Configuration("Token cache lock poisoned".to_string()))?;
        *stored = Some(blob.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
