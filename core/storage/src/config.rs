//! Configuration for credential acquisition and uploads.
//!
//! All settings are explicit values handed to the managers at construction.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use invoicedrop_common::{Error, RemotePath, Result};

use crate::retry::RetryConfig;

/// Default Microsoft identity platform authority (multi-tenant).
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com/common";
/// Microsoft Graph API base URL.
pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";
/// Application scopes requested by default.
pub const DEFAULT_SCOPES: &[&str] = &["Mail.Read", "Files.ReadWrite"];
/// Files strictly smaller than this are uploaded with a single PUT.
pub const SMALL_FILE_THRESHOLD: u64 = 4 * 1024 * 1024;
/// Graph requires upload session chunks to be multiples of 320 KiB.
pub const CHUNK_ALIGNMENT: usize = 320 * 1024;
/// Default upload session chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = CHUNK_ALIGNMENT;
/// Default remote folder for uploads.
pub const DEFAULT_FOLDER: &str = "/Invoices";
/// Environment variable overriding the OAuth2 client ID.
pub const CLIENT_ID_ENV: &str = "INVOICEDROP_CLIENT_ID";

const APP_DIR: &str = "invoicedrop";

/// Directory holding the configuration file and token cache.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// OAuth2 settings for the Credential Manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Application (client) ID registered with the identity platform.
    pub client_id: String,
    /// Authority URL, e.g. `https://login.microsoftonline.com/common`.
    pub authority: String,
    /// Application scopes. Fixed for the lifetime of the process.
    pub scopes: Vec<String>,
    /// Where the token cache blob is persisted.
    pub cache_path: PathBuf,
    /// Upper bound on waiting for the operator during device authorization.
    pub device_flow_timeout_secs: Option<u64>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            authority: DEFAULT_AUTHORITY.to_string(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            cache_path: default_config_dir().join("token_cache.json"),
            device_flow_timeout_secs: None,
        }
    }
}

impl AuthConfig {
    /// Token endpoint derived from the authority.
    pub fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority.trim_end_matches('/'))
    }

    /// Device authorization endpoint derived from the authority.
    pub fn device_authorization_url(&self) -> String {
        format!(
            "{}/oauth2/v2.0/devicecode",
            self.authority.trim_end_matches('/')
        )
    }

    /// Timeout for the interactive flow, if any.
    pub fn device_flow_timeout(&self) -> Option<Duration> {
        self.device_flow_timeout_secs.map(Duration::from_secs)
    }

    /// Validate the settings.
    ///
    /// # Errors
    /// - Empty client ID
    /// - Empty scope set
    /// - Authority that is not an absolute URL
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "Missing client ID (set auth.client_id or {})",
                CLIENT_ID_ENV
            )));
        }
        if self.scopes.is_empty() {
            return Err(Error::Configuration("No scopes configured".to_string()));
        }
        url::Url::parse(&self.authority)
            .map_err(|e| Error::Configuration(format!("Invalid authority URL: {}", e)))?;
        Ok(())
    }
}

/// Settings for the Upload Manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Graph API base URL.
    pub api_base: String,
    /// Size at or above which the chunked session strategy is used.
    pub small_file_threshold: u64,
    /// Chunk size for upload sessions; a multiple of [`CHUNK_ALIGNMENT`].
    pub chunk_size: usize,
    /// Remote folder used when no folder is given.
    pub default_folder: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            api_base: GRAPH_API_BASE.to_string(),
            small_file_threshold: SMALL_FILE_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            default_folder: DEFAULT_FOLDER.to_string(),
        }
    }
}

impl UploadConfig {
    /// Validate the settings.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size % CHUNK_ALIGNMENT != 0 {
            return Err(Error::Configuration(format!(
                "Chunk size {} is not a non-zero multiple of {} bytes",
                self.chunk_size, CHUNK_ALIGNMENT
            )));
        }
        url::Url::parse(&self.api_base)
            .map_err(|e| Error::Configuration(format!("Invalid API base URL: {}", e)))?;
        RemotePath::parse(&self.default_folder)
            .map_err(|e| Error::Configuration(format!("Invalid default folder: {}", e)))?;
        Ok(())
    }

    /// The default folder as a remote path.
    pub fn default_folder_path(&self) -> Result<RemotePath> {
        RemotePath::parse(&self.default_folder)
    }
}

/// Whole-file retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        RetryConfig::new(settings.max_retries)
            .with_initial_delay(Duration::from_millis(settings.initial_delay_ms))
            .with_max_delay(Duration::from_millis(settings.max_delay_ms))
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub auth: AuthConfig,
    pub upload: UploadConfig,
    pub retry: RetrySettings,
    /// Files uploaded concurrently by batch operations.
    pub max_concurrent_uploads: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            auth: AuthConfig::default(),
            upload: UploadConfig::default(),
            retry: RetrySettings::default(),
            max_concurrent_uploads: 1,
        }
    }
}

impl AppConfig {
    /// Default configuration file location.
    pub fn default_path() -> PathBuf {
        default_config_dir().join("config.json")
    }

    /// Load configuration from a JSON file.
    ///
    /// An absent file yields the defaults. Environment overrides are applied
    /// afterwards. The result is not validated.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                Error::Configuration(format!(
                    "Failed to parse config {}: {}",
                    path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(Error::Configuration(format!(
                    "Failed to read config {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(client_id) = lookup(CLIENT_ID_ENV).filter(|v| !v.trim().is_empty()) {
            self.auth.client_id = client_id;
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.auth.validate()?;
        self.upload.validate()?;
        if self.max_concurrent_uploads == 0 {
            return Err(Error::Configuration(
                "max_concurrent_uploads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.upload.small_file_threshold, 4 * 1024 * 1024);
        assert_eq!(config.upload.chunk_size, 327_680);
        assert_eq!(config.auth.scopes, vec!["Mail.Read", "Files.ReadWrite"]);
        assert_eq!(config.max_concurrent_uploads, 1);
    }

    #[test]
    fn test_missing_client_id_is_configuration_error() {
        let config = AppConfig::default();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_endpoints_from_authority() {
        let auth = AuthConfig {
            authority: "https://login.microsoftonline.com/contoso/".to_string(),
            ..AuthConfig::default()
        };
        assert_eq!(
            auth.token_url(),
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/token"
        );
        assert_eq!(
            auth.device_authorization_url(),
            "https://login.microsoftonline.com/contoso/oauth2/v2.0/devicecode"
        );
    }

    #[test]
    fn test_chunk_size_must_be_aligned() {
        let mut upload = UploadConfig::default();
        upload.chunk_size = 256 * 1024;
        assert!(matches!(upload.validate(), Err(Error::Configuration(_))));

        upload.chunk_size = 0;
        assert!(upload.validate().is_err());

        upload.chunk_size = 3 * CHUNK_ALIGNMENT;
        assert!(upload.validate().is_ok());
    }

    #[test]
    fn test_env_override_client_id() {
        let mut config = AppConfig::default();
        config.apply_env_overrides(|key| {
            (key == CLIENT_ID_ENV).then(|| "11111111-2222".to_string())
        });
        assert_eq!(config.auth.client_id, "11111111-2222");

        config.apply_env_overrides(|_| Some("   ".to_string()));
        assert_eq!(config.auth.client_id, "11111111-2222");
    }

    #[test]
    fn test_load_absent_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("missing.json")).unwrap();
        assert_eq!(config.upload.default_folder, DEFAULT_FOLDER);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"auth": {"client_id": "abc"}, "upload": {"default_folder": "/Invoices/InvoiceData"}}"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.upload.default_folder, "/Invoices/InvoiceData");
        assert_eq!(config.upload.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.auth.authority, DEFAULT_AUTHORITY);
    }

    #[test]
    fn test_load_corrupt_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            AppConfig::load(&path),
            Err(Error::Configuration(_))
        ));
    }
}
