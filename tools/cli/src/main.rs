//! InvoiceDrop CLI - Upload invoices and attachments to OneDrive.
//!
//! Signs in with the device code flow, keeps the token cache on disk and
//! uploads single files or whole directories.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use invoicedrop_common::{ProgressCallback, RemotePath, UploadProgress};
use invoicedrop_storage::onedrive::{DeviceAuthorization, DeviceCodePrompt};
use invoicedrop_storage::{
    AppConfig, BatchUploader, CredentialManager, FileCacheStore, GraphAuthBackend, RetryConfig,
    UploadManager,
};

#[derive(Parser)]
#[command(name = "invoicedrop")]
#[command(about = "InvoiceDrop - Upload invoices to OneDrive")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: user config directory).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Give up on interactive sign-in after this many seconds.
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Open the verification page in a browser during sign-in.
    #[arg(long, global = true)]
    open_browser: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and cache the credentials.
    Login,

    /// Forget all cached credentials.
    Logout,

    /// Upload a single file.
    Upload {
        /// Local file to upload.
        #[arg(short, long)]
        file: PathBuf,

        /// Remote folder (default from configuration).
        #[arg(long)]
        folder: Option<String>,
    },

    /// Upload every matching file in a directory.
    UploadDir {
        /// Local directory to upload from.
        #[arg(short, long)]
        dir: PathBuf,

        /// Remote folder (default from configuration).
        #[arg(long)]
        folder: Option<String>,

        /// File extensions to include; repeat for several (default: all).
        #[arg(short, long = "ext")]
        extensions: Vec<String>,
    },

    /// Show the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    if let Some(timeout) = cli.timeout {
        config.auth.device_flow_timeout_secs = Some(timeout);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current chunk");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Login => cmd_login(&config, cli.open_browser, &cancel).await,

        Commands::Logout => cmd_logout(&config).await,

        Commands::Upload { file, folder } => {
            cmd_upload(&config, cli.open_browser, &file, folder.as_deref(), &cancel).await
        }

        Commands::UploadDir {
            dir,
            folder,
            extensions,
        } => {
            cmd_upload_dir(
                &config,
                cli.open_browser,
                &dir,
                folder.as_deref(),
                &extensions,
                &cancel,
            )
            .await
        }

        Commands::Config => cmd_config(&config, &config_path),
    }
}

/// Prints device code instructions to the terminal.
struct TerminalPrompt {
    open_browser: bool,
}

impl DeviceCodePrompt for TerminalPrompt {
    fn present(&self, authorization: &DeviceAuthorization) {
        eprintln!("\n{}\n", authorization.instructions());
        if self.open_browser {
            let page = authorization
                .verification_uri_complete
                .as_deref()
                .unwrap_or(&authorization.verification_uri);
            if let Err(e) = open::that(page) {
                warn!("Could not open a browser: {}", e);
            }
        }
    }
}

/// One progress bar per file being uploaded.
struct UploadBars {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl UploadBars {
    fn new() -> Result<Self> {
        let style = ProgressStyle::default_bar()
            .template("[{elapsed:>6}] {bar:40.cyan/blue} {bytes:>10}/{total_bytes:10} {msg}")?
            .progress_chars("##-");
        Ok(Self {
            multi: MultiProgress::new(),
            style,
            bars: Mutex::new(HashMap::new()),
        })
    }

    fn clear(&self) {
        if let Ok(mut bars) = self.bars.lock() {
            for (_, bar) in bars.drain() {
                bar.finish_and_clear();
            }
        }
    }
}

impl ProgressCallback<UploadProgress> for UploadBars {
    fn on_progress(&self, progress: &UploadProgress) {
        let Ok(mut bars) = self.bars.lock() else {
            return;
        };
        let bar = bars.entry(progress.file_name.clone()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(progress.total_bytes));
            bar.set_style(self.style.clone());
            bar.set_message(progress.file_name.clone());
            bar
        });
        bar.set_length(progress.total_bytes);
        bar.set_position(progress.bytes_committed);
        if progress.bytes_committed >= progress.total_bytes {
            bar.finish();
        }
    }
}

fn credential_manager(config: &AppConfig, open_browser: bool) -> Result<Arc<CredentialManager>> {
    let backend = GraphAuthBackend::new(&config.auth).context("Failed to set up sign-in")?;
    let store = FileCacheStore::new(&config.auth.cache_path);
    let manager = CredentialManager::new(config.auth.clone(), Arc::new(backend), Arc::new(store))
        .context("Invalid authentication settings")?
        .with_prompt(Arc::new(TerminalPrompt { open_browser }));
    Ok(Arc::new(manager))
}

fn batch_uploader(config: &AppConfig, open_browser: bool) -> Result<BatchUploader> {
    config.validate().context("Invalid configuration")?;
    let uploads = UploadManager::new(config.upload.clone()).context("Invalid upload settings")?;
    Ok(BatchUploader::new(
        credential_manager(config, open_browser)?,
        Arc::new(uploads),
        RetryConfig::from(&config.retry),
    )
    .with_max_concurrent(config.max_concurrent_uploads))
}

fn remote_folder(config: &AppConfig, folder: Option<&str>) -> Result<RemotePath> {
    match folder {
        Some(folder) => RemotePath::parse(folder).context("Invalid remote folder"),
        None => config
            .upload
            .default_folder_path()
            .context("Invalid default folder"),
    }
}

/// Sign in, interactively if the cache cannot be used.
async fn cmd_login(config: &AppConfig, open_browser: bool, cancel: &CancellationToken) -> Result<()> {
    let credentials = credential_manager(config, open_browser)?;
    let credential = credentials
        .acquire_token_cancellable(cancel)
        .await
        .context("Sign-in failed")?;

    println!("Signed in via {}.", credential.source);
    if let Some(expires_at) = credential.expires_at {
        println!("  Token valid until: {}", expires_at);
    }
    println!("  Cache: {}", config.auth.cache_path.display());

    Ok(())
}

/// Remove cached credentials.
async fn cmd_logout(config: &AppConfig) -> Result<()> {
    let credentials = credential_manager(config, false)?;
    credentials.sign_out().await.context("Failed to clear token cache")?;
    println!("Signed out.");
    Ok(())
}

/// Upload one file.
async fn cmd_upload(
    config: &AppConfig,
    open_browser: bool,
    file: &Path,
    folder: Option<&str>,
    cancel: &CancellationToken,
) -> Result<()> {
    let folder = remote_folder(config, folder)?;
    info!("Uploading {} to {}", file.display(), folder);

    let uploader = batch_uploader(config, open_browser)?;
    let bars = UploadBars::new()?;
    let result = uploader.upload_one(file, &folder, &bars, cancel).await;
    bars.clear();
    let outcome = result.with_context(|| format!("Failed to upload {}", file.display()))?;

    println!(
        "Uploaded {} ({} bytes, {})",
        outcome.destination, outcome.bytes_uploaded, outcome.strategy
    );
    if let Some(item) = outcome.item {
        if item.name != outcome.destination.name().unwrap_or_default() {
            println!("  Stored as: {}", item.name);
        }
        if let Some(url) = item.web_url {
            println!("  Link: {}", url);
        }
    }

    Ok(())
}

/// Upload a directory.
async fn cmd_upload_dir(
    config: &AppConfig,
    open_browser: bool,
    dir: &Path,
    folder: Option<&str>,
    extensions: &[String],
    cancel: &CancellationToken,
) -> Result<()> {
    let folder = remote_folder(config, folder)?;
    let uploader = batch_uploader(config, open_browser)?;
    let bars = UploadBars::new()?;
    let result = uploader
        .upload_directory(dir, &folder, extensions, &bars, cancel)
        .await;
    bars.clear();
    let report = result.with_context(|| format!("Failed to upload {}", dir.display()))?;

    for outcome in &report.uploaded {
        println!("  [OK]      {} ({} bytes)", outcome.destination, outcome.bytes_uploaded);
    }
    for failure in &report.failed {
        println!("  [FAILED]  {}: {}", failure.path.display(), failure.error);
    }
    for skipped in &report.skipped {
        println!("  [SKIPPED] {}", skipped.display());
    }
    println!(
        "{} uploaded ({} bytes), {} failed, {} skipped",
        report.uploaded.len(),
        report.bytes_uploaded(),
        report.failed.len(),
        report.skipped.len()
    );

    if !report.is_success() {
        anyhow::bail!("Some files were not uploaded");
    }
    Ok(())
}

/// Print the effective configuration.
fn cmd_config(config: &AppConfig, path: &Path) -> Result<()> {
    println!("Configuration file: {}", path.display());
    println!("{}", serde_json::to_string_pretty(config)?);
    if let Err(e) = config.validate() {
        println!("\nWarning: {}", e);
    }
    Ok(())
}
