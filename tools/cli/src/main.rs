//! graphdrive CLI - command line access to a OneDrive through Microsoft Graph.
//!
//! Settings (app registration, scopes, refresh token) live in a JSON file.
//! The refresh token rotates on every sign-in and is written back after
//! each command.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

use graphdrive_client::{
    AuthState, AuthorizationPrompt, ConflictBehavior, Metadata, OneDrive, Settings,
};
use graphdrive_common::{DrivePath, SecretString};

const SETTINGS_FILE: &str = "Settings.json";

#[derive(Parser)]
#[command(name = "graphdrive")]
#[command(about = "graphdrive - OneDrive from the command line")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Settings file (default: ./Settings.json, then the user config dir).
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and show drive information.
    Login {
        /// Forget the stored refresh token and sign in interactively.
        #[arg(long)]
        reset: bool,
    },

    /// List a remote folder.
    Ls {
        /// Remote folder (default: root).
        #[arg(default_value = "/")]
        dir: String,
    },

    /// Show metadata of a remote item.
    Stat {
        /// Remote path.
        path: String,
    },

    /// Download one remote file.
    Get {
        /// Remote file.
        source: String,

        /// Local destination (default: the remote file name).
        dest: Option<PathBuf>,
    },

    /// Upload one local file.
    Put {
        /// Local file.
        source: PathBuf,

        /// Remote destination path.
        dest: String,

        /// What to do if the destination exists.
        #[arg(long, value_enum, default_value = "replace")]
        on_conflict: OnConflict,
    },

    /// Upload several local files into a remote folder.
    Push {
        /// Remote folder.
        #[arg(short, long, default_value = "/")]
        remote: String,

        /// Local files.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Download the files of a remote folder.
    Pull {
        /// Remote folder.
        remote: String,

        /// Local folder.
        #[arg(default_value = ".")]
        local: PathBuf,

        /// Download only the file with this name.
        #[arg(long)]
        only: Option<String>,
    },

    /// Create a remote folder.
    Mkdir {
        /// Parent folder.
        parent: String,

        /// Name of the new folder.
        name: String,
    },

    /// Move a remote item into another folder.
    Mv {
        /// Item to move.
        from: String,

        /// Destination folder.
        to: String,
    },

    /// Delete a remote item.
    Rm {
        /// Remote path.
        path: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OnConflict {
    Fail,
    Replace,
    Rename,
}

impl From<OnConflict> for ConflictBehavior {
    fn from(value: OnConflict) -> Self {
        match value {
            OnConflict::Fail => ConflictBehavior::Fail,
            OnConflict::Replace => ConflictBehavior::Replace,
            OnConflict::Rename => ConflictBehavior::Rename,
        }
    }
}

/// Sends the user to the browser and reads the redirect URL back from stdin.
struct TerminalPrompt;

#[async_trait]
impl AuthorizationPrompt for TerminalPrompt {
    async fn authorize(&self, authorize_url: &Url) -> graphdrive_common::Result<String> {
        println!("Sign in to OneDrive in your browser:\n\n  {}\n", authorize_url);
        if let Err(e) = open::that(authorize_url.as_str()) {
            warn!("Could not open a browser: {}", e);
        }
        println!("Paste the URL you were redirected to (or just the code):");

        let mut line = String::new();
        BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;

        Ok(line.trim().to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings_path = resolve_settings_path(cli.settings)?;
    let mut settings = Settings::load(&settings_path)
        .await
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;

    if let Commands::Login { reset: true } = cli.command {
        settings.refresh_token = SecretString::default();
    }

    let drive = OneDrive::new(settings).context("Failed to create drive client")?;
    let result = run(&drive, cli.command).await;

    // Persist even if the command failed; a rejected token is stored empty.
    if drive.credentials_changed().await {
        drive
            .settings_snapshot()
            .await
            .save(&settings_path)
            .await
            .context("Failed to save settings")?;
    }

    if result.is_err() && drive.state().await == AuthState::Unauthenticated {
        return result.context("Signed out; the next run starts an interactive login");
    }
    result
}

fn resolve_settings_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let local = PathBuf::from(SETTINGS_FILE);
    if local.exists() {
        return Ok(local);
    }

    let config_dir = dirs::config_dir().context("No user config directory on this platform")?;
    Ok(config_dir.join("graphdrive").join(SETTINGS_FILE))
}

fn remote_path(raw: &str) -> Result<DrivePath> {
    DrivePath::parse(raw).with_context(|| format!("Invalid remote path: {}", raw))
}

async fn run(drive: &OneDrive, command: Commands) -> Result<()> {
    let info = drive
        .connect(&TerminalPrompt)
        .await
        .context("Failed to connect to OneDrive")?;

    match command {
        Commands::Login { .. } => {
            println!("Signed in.");
            println!("Drive:     {}", info.id);
            if let Some(kind) = &info.drive_type {
                println!("Type:      {}", kind);
            }
            if let Some(quota) = &info.quota {
                if let (Some(used), Some(total)) = (quota.used, quota.total) {
                    println!("Used:      {} of {} bytes", used, total);
                }
            }
            Ok(())
        }

        Commands::Ls { dir } => cmd_ls(drive, &dir).await,

        Commands::Stat { path } => cmd_stat(drive, &path).await,

        Commands::Get { source, dest } => cmd_get(drive, &source, dest).await,

        Commands::Put {
            source,
            dest,
            on_conflict,
        } => cmd_put(drive, &source, &dest, on_conflict.into()).await,

        Commands::Push { remote, files } => {
            let remote = remote_path(&remote)?;
            let uploaded = drive.upload_files(&files, &remote).await?;
            println!("Uploaded {} file(s) to {}", uploaded.len(), remote);
            Ok(())
        }

        Commands::Pull {
            remote,
            local,
            only,
        } => {
            let remote = remote_path(&remote)?;
            let written = drive
                .download_folder(&remote, &local, only.as_deref())
                .await?;
            println!("Downloaded {} file(s) to {}", written.len(), local.display());
            Ok(())
        }

        Commands::Mkdir { parent, name } => {
            let folder = drive
                .make_dir(&remote_path(&parent)?, &name)
                .await
                .context("Failed to create folder")?;
            println!("Folder created: {} ({})", folder.name, folder.id);
            Ok(())
        }

        Commands::Mv { from, to } => {
            let moved = drive
                .move_item(&remote_path(&from)?, &remote_path(&to)?)
                .await
                .context("Failed to move item")?;
            println!("Moved {} to {}", moved.name, to);
            Ok(())
        }

        Commands::Rm { path } => {
            drive
                .delete(&remote_path(&path)?)
                .await
                .context("Failed to delete item")?;
            println!("Deleted: {}", path);
            Ok(())
        }
    }
}

/// List folder contents.
async fn cmd_ls(drive: &OneDrive, dir: &str) -> Result<()> {
    let listing = drive
        .list(&remote_path(dir)?)
        .await
        .context("Failed to list folder")?;

    if listing.is_empty() {
        println!("Folder is empty.");
        return Ok(());
    }

    println!("Contents of {}:", dir);
    for folder in &listing.folders {
        println!("  [DIR]  {}/", folder.name);
    }
    for file in &listing.files {
        let size_str = file.size.map(|s| format!("{} bytes", s)).unwrap_or_default();
        println!("  [FILE] {} ({})", file.name, size_str);
    }

    Ok(())
}

async fn cmd_stat(drive: &OneDrive, path: &str) -> Result<()> {
    let meta = drive
        .get_metadata(&remote_path(path)?)
        .await
        .context("Failed to get metadata")?;
    print_metadata(&meta);
    Ok(())
}

fn print_metadata(meta: &Metadata) {
    println!("Name:      {}", meta.name);
    println!("ID:        {}", meta.id);
    println!("Kind:      {}", if meta.is_folder { "folder" } else { "file" });
    if let Some(size) = meta.size {
        println!("Size:      {} bytes", size);
    }
    if let Some(modified) = meta.modified {
        println!("Modified:  {}", modified.to_rfc3339());
    }
    if let Some(parent) = &meta.parent_path {
        println!("Parent:    {}", parent);
    }
    if let Some(mime) = &meta.mime_type {
        println!("MIME type: {}", mime);
    }
    if let Some(hash) = &meta.hash {
        println!("Hash:      {}", hash);
    }
    if let Some(children) = meta.child_count {
        println!("Children:  {}", children);
    }
}

/// Download a single file.
async fn cmd_get(drive: &OneDrive, source: &str, dest: Option<PathBuf>) -> Result<()> {
    let source = remote_path(source)?;
    let dest = match dest {
        Some(dest) => dest,
        None => PathBuf::from(source.name().context("Cannot download the drive root")?),
    };

    info!("Downloading {} to {}", source, dest.display());

    let content = drive
        .download(&source)
        .await
        .context("Failed to download file")?;

    tokio::fs::write(&dest, &content)
        .await
        .with_context(|| format!("Failed to write {}", dest.display()))?;

    println!("File downloaded: {} ({} bytes)", dest.display(), content.len());

    Ok(())
}

/// Upload a single file.
async fn cmd_put(
    drive: &OneDrive,
    source: &Path,
    dest: &str,
    conflict: ConflictBehavior,
) -> Result<()> {
    info!("Uploading {} as {}", source.display(), dest);

    let content = tokio::fs::read(source)
        .await
        .context("Failed to read source file")?;

    let meta = drive
        .upload_with(&remote_path(dest)?, content, conflict)
        .await
        .context("Failed to upload file")?;

    println!("File uploaded: {} ({} bytes)", meta.name, meta.size.unwrap_or(0));

    Ok(())
}
