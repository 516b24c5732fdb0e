//! cryptmirror - Encrypting mirror filesystem
//!
//! Usage:
//!   cryptmirror <root> <mount_point>   - Mount the decrypted view of <root>
//!
//! Files under <root> are stored as ciphertext blobs; clients of the
//! mountpoint read and write plaintext.

use anyhow::{Context, Result};
use clap::Parser;
use cryptmirror::{config::Config, crypto::ContentCipher, fs::MirrorCryptFs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "cryptmirror")]
#[command(author = "cryptmirror Contributors")]
#[command(version)]
#[command(about = "Encrypting mirror filesystem using FUSE")]
struct Cli {
    /// Directory tree holding the encrypted files
    root: PathBuf,

    /// Where to expose the decrypted view
    mount_point: PathBuf,

    /// Encryption password (prompted interactively when not supplied)
    #[arg(long)]
    password: Option<String>,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Configuration file path (built-in defaults when absent)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(expand_tilde(path))?,
        None => Config::default(),
    };
    config.validate()?;

    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("invalid root directory {:?}", cli.root))?;

    let password = Zeroizing::new(match cli.password {
        Some(p) => p,
        None => rpassword::prompt_password("Enter encryption password: ")
            .context("failed to read password")?,
    });

    let cipher = Arc::new(ContentCipher::new(
        password.as_bytes(),
        config.encryption.clone(),
    )?);

    let fs = MirrorCryptFs::new(root.clone(), cipher)?;

    // Operation paths are applied relative to the root from here on
    std::env::set_current_dir(&root).context("can't enter root of underlying filesystem")?;

    let mut options = vec![
        fuser::MountOption::FSName(config.mount.fs_name.clone()),
        fuser::MountOption::AutoUnmount,
    ];

    if cli.allow_other || config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    info!(
        "Mounting encrypted mirror of {:?} at {:?}",
        root, cli.mount_point
    );

    fuser::mount2(fs, &cli.mount_point, &options).context("mount failed")?;

    Ok(())
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if path.starts_with("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(path.strip_prefix("~").unwrap());
        }
    }
    path.to_path_buf()
}
