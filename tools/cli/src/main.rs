//! Capsule CLI - Command line interface for capsule containers.
//!
//! Every command opens the container, performs one operation and closes it
//! again, so the footer is rewritten on each run.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use zeroize::Zeroizing;

use capsule_common::TaskContext;
use capsule_container::{BatchReport, Container, ContainerConfig, FileQuery, FileRecord, ItemStatus};
use capsule_crypto::{password_recovery_token, resolve_token, KdfParams};

#[derive(Parser)]
#[command(name = "capsule")]
#[command(about = "Capsule - Single-file encrypted containers")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON file with container settings.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// KDF preset overriding the config: interactive, moderate or sensitive.
    #[arg(short, long, global = true)]
    kdf: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new, empty container.
    Create {
        /// Path of the container file.
        container: PathBuf,

        /// Display name stored in the header.
        #[arg(short, long)]
        name: String,

        /// Extension recorded for the container.
        #[arg(short, long, default_value = "cap")]
        extension: String,
    },

    /// Show container statistics.
    Info { container: PathBuf },

    /// List a directory.
    Ls {
        container: PathBuf,

        /// Directory path inside the container.
        #[arg(default_value = "/")]
        dir: String,
    },

    /// Create a directory.
    Mkdir {
        container: PathBuf,

        /// Name of the new directory.
        name: String,

        /// Parent directory path.
        #[arg(short, long, default_value = "/")]
        parent: String,
    },

    /// Remove an empty directory.
    Rmdir {
        container: PathBuf,

        /// Directory path inside the container.
        dir: String,
    },

    /// Import files from disk.
    Add {
        container: PathBuf,

        /// Files to import.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Destination directory path.
        #[arg(short, long, default_value = "/")]
        dir: String,
    },

    /// Extract files to disk.
    Extract {
        container: PathBuf,

        /// File ids to extract.
        #[arg(required = true)]
        ids: Vec<u64>,

        /// Output directory.
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// Delete a file and its note.
    Rm { container: PathBuf, id: u64 },

    /// Search files by name and attributes.
    Find {
        container: PathBuf,

        /// Substring of the file name.
        #[arg(short, long)]
        name: Option<String>,

        /// Exact extension, with or without the dot.
        #[arg(short, long)]
        extension: Option<String>,

        /// Compare case-sensitively.
        #[arg(long)]
        match_case: bool,

        /// Only files stored encrypted.
        #[arg(long)]
        encrypted: bool,

        /// Only files with a note attached.
        #[arg(long)]
        with_note: bool,
    },

    /// Attach a note to a file.
    NoteAdd {
        container: PathBuf,

        /// Owning file id.
        file_id: u64,

        /// File holding the note contents.
        source: PathBuf,

        /// Note type tag.
        #[arg(short = 't', long = "type", default_value = "text")]
        note_type: String,
    },

    /// Print a note.
    NoteShow { container: PathBuf, id: u64 },

    /// Store a file encrypted.
    Encrypt { container: PathBuf, id: u64 },

    /// Store a file in plain form.
    Decrypt { container: PathBuf, id: u64 },

    /// Change the container password.
    Passwd { container: PathBuf },

    /// Derive a recovery token from a password.
    RecoveryToken,

    /// Recover the password held by a token.
    ResolveToken { token: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref(), cli.kdf.as_deref())?;

    match cli.command {
        Commands::Create {
            container,
            name,
            extension,
        } => cmd_create(&container, &name, &extension, config),

        Commands::Info { container } => cmd_info(&container, config),

        Commands::Ls { container, dir } => cmd_ls(&container, &dir, config),

        Commands::Mkdir {
            container,
            name,
            parent,
        } => cmd_mkdir(&container, &name, &parent, config),

        Commands::Rmdir { container, dir } => cmd_rmdir(&container, &dir, config),

        Commands::Add {
            container,
            files,
            dir,
        } => cmd_add(&container, files, &dir, config).await,

        Commands::Extract { container, ids, out } => {
            cmd_extract(&container, ids, out, config).await
        }

        Commands::Rm { container, id } => cmd_rm(&container, id, config),

        Commands::Find {
            container,
            name,
            extension,
            match_case,
            encrypted,
            with_note,
        } => {
            let query = FileQuery {
                name,
                extension,
                match_case,
                encrypted_only: encrypted,
                has_note_only: with_note,
            };
            cmd_find(&container, &query, config)
        }

        Commands::NoteAdd {
            container,
            file_id,
            source,
            note_type,
        } => cmd_note_add(&container, file_id, &source, &note_type, config),

        Commands::NoteShow { container, id } => cmd_note_show(&container, id, config),

        Commands::Encrypt { container, id } => cmd_set_encryption(&container, id, true, config).await,

        Commands::Decrypt { container, id } => {
            cmd_set_encryption(&container, id, false, config).await
        }

        Commands::Passwd { container } => cmd_passwd(&container, config).await,

        Commands::RecoveryToken => cmd_recovery_token(),

        Commands::ResolveToken { token } => cmd_resolve_token(&token),
    }
}

/// Prompt for password securely.
fn prompt_password(prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(Zeroizing::new(password.into_bytes()))
}

/// Prompt twice and require a non-empty match.
fn prompt_new_password(prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
    let password = prompt_password(prompt)?;
    let confirm = prompt_password("Confirm password: ")?;

    if *password != *confirm {
        anyhow::bail!("Passwords do not match");
    }
    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }
    Ok(password)
}

fn load_config(path: Option<&Path>, kdf: Option<&str>) -> Result<ContainerConfig> {
    let mut config = match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            ContainerConfig::from_json(&json).context("Invalid config file")?
        }
        None => ContainerConfig::default(),
    };
    if let Some(preset) = kdf {
        config.kdf_params = KdfParams::from_preset(preset)?;
    }
    config.validate().context("Invalid config")?;
    Ok(config)
}

fn open_container(path: &Path, config: ContainerConfig) -> Result<Container<File>> {
    let password = prompt_password("Enter password: ")?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Container::open(file, &password, config).context("Failed to open container")
}

fn close_container(container: Container<File>) -> Result<()> {
    container.close().context("Failed to close container")?;
    Ok(())
}

/// Run chunked work off the async runtime.
///
/// Ctrl-C cancels the shared token; the work observes it at the next chunk.
/// Byte progress is echoed to stderr.
async fn run_cancellable<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(TaskContext) -> T + Send + 'static,
{
    let token = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
    let ctx = TaskContext::new(token.clone()).with_progress(tx);

    let progress = tokio::spawn(async move {
        let mut total = 0u64;
        while let Some(n) = rx.recv().await {
            total += n;
            eprint!("\r  {} bytes", total);
        }
        if total > 0 {
            eprintln!();
        }
    });

    let ctrl_c = token.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling after the current chunk");
            ctrl_c.cancel();
        }
    });

    let result = tokio::task::spawn_blocking(move || work(ctx))
        .await
        .context("Worker task failed")?;
    watcher.abort();
    // The sender was dropped with the context, so this ends.
    let _ = progress.await;
    Ok(result)
}

fn print_report(report: &BatchReport) {
    for outcome in &report.outcomes {
        match &outcome.status {
            ItemStatus::Imported { id } => println!("  [OK]   {} -> id {}", outcome.item, id),
            ItemStatus::Extracted { path } => {
                println!("  [OK]   {} -> {}", outcome.item, path.display())
            }
            ItemStatus::Failed { error } => println!("  [FAIL] {}: {}", outcome.item, error),
            ItemStatus::Skipped => println!("  [SKIP] {}", outcome.item),
        }
    }
    println!(
        "{} succeeded, {} failed, {} skipped",
        report.succeeded(),
        report.failed(),
        report.skipped()
    );
    if let Some(reason) = &report.aborted {
        println!("Stopped early: {}", reason);
    }
}

fn print_file(file: &FileRecord, dir: &str) {
    let note = file
        .note()
        .map(|n| format!(", note {}", n))
        .unwrap_or_default();
    println!(
        "  [FILE] {:>4}  {}{} ({} bytes{}{})",
        file.id,
        dir,
        file.display_name(),
        file.size,
        if file.file_encrypted { ", encrypted" } else { "" },
        note
    );
}

/// Create a new container.
fn cmd_create(path: &Path, name: &str, extension: &str, config: ContainerConfig) -> Result<()> {
    info!("Creating new container: {}", name);

    let password = prompt_new_password("Enter password: ")?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let container = Container::create(file, name, extension, &password, config)
        .context("Failed to create container")?;
    let region = container.payload_start();
    close_container(container)?;

    println!("Container created successfully!");
    println!("  Name: {}", name);
    println!("  Location: {}", path.display());
    println!("  Header region: {} bytes", region);

    Ok(())
}

/// Show container statistics.
fn cmd_info(path: &Path, config: ContainerConfig) -> Result<()> {
    let container = open_container(path, config)?;
    let header = container.header();
    let stats = &header.vault;

    println!("Container Information:");
    println!("  Name: {}.{}", stats.vault_name, stats.vault_extension);
    println!("  Created: {}", stats.trusted_timestamp.to_rfc3339());
    println!("  Files: {}", stats.amount_of_files);
    println!("  Directories: {}", header.map.directories.len());
    println!("  Notes: {}", header.map.notes.len());
    println!("  Payload bytes: {}", stats.file_size);
    println!("  Header: {} bytes", stats.header_size);
    println!("  Header region: {} bytes", container.payload_start());
    println!("  Encrypt new files: {}", stats.is_vault_encrypted);
    println!("  Session: {}", container.session_log().session_id());

    let errors = container.session_log().error_log().lines().count();
    if errors > 0 {
        println!("  Logged errors: {}", errors);
    }

    close_container(container)
}

/// List directory contents.
fn cmd_ls(path: &Path, dir: &str, config: ContainerConfig) -> Result<()> {
    let container = open_container(path, config)?;
    let id = container.resolve_dir_path(dir).context("Invalid directory path")?;

    {
        let (dirs, files) = container.list_directory(id).context("Failed to list directory")?;
        if dirs.is_empty() && files.is_empty() {
            println!("Directory is empty.");
        } else {
            println!("Contents of {}:", container.directory_path(id));
            for sub in dirs {
                println!("  [DIR]  {:>4}  {}/", sub.id, sub.name);
            }
            for file in files {
                print_file(file, "");
            }
        }
    }

    close_container(container)
}

/// Create a directory.
fn cmd_mkdir(path: &Path, name: &str, parent: &str, config: ContainerConfig) -> Result<()> {
    info!("Creating directory: {}", name);

    let mut container = open_container(path, config)?;
    let parent_id = container
        .resolve_dir_path(parent)
        .context("Invalid parent path")?;
    let id = container
        .create_directory(name, parent_id)
        .context("Failed to create directory")?;
    let full = container.directory_path(id);
    close_container(container)?;

    println!("Directory created: {} (id {})", full, id);
    Ok(())
}

/// Remove an empty directory.
fn cmd_rmdir(path: &Path, dir: &str, config: ContainerConfig) -> Result<()> {
    let mut container = open_container(path, config)?;
    let id = container.resolve_dir_path(dir).context("Invalid directory path")?;
    let outcome = container
        .remove_directory(id)
        .context("Failed to remove directory")?;
    close_container(container)?;

    if outcome.removed() {
        println!("Directory removed: {}", dir);
    } else {
        println!("Directory kept: {}", outcome.message());
    }
    Ok(())
}

/// Import files.
async fn cmd_add(path: &Path, files: Vec<PathBuf>, dir: &str, config: ContainerConfig) -> Result<()> {
    let mut container = open_container(path, config)?;
    let parent = container.resolve_dir_path(dir).context("Invalid destination path")?;
    info!("Importing {} file(s) into {}", files.len(), dir);

    let (container, report) = run_cancellable(move |ctx| {
        let report = container.import_files(&files, parent, &ctx);
        (container, report)
    })
    .await?;
    close_container(container)?;

    print_report(&report);
    Ok(())
}

/// Extract files.
async fn cmd_extract(path: &Path, ids: Vec<u64>, out: PathBuf, config: ContainerConfig) -> Result<()> {
    std::fs::create_dir_all(&out)
        .with_context(|| format!("Failed to create {}", out.display()))?;
    let mut container = open_container(path, config)?;
    info!("Extracting {} file(s) to {}", ids.len(), out.display());

    let (container, report) = run_cancellable(move |ctx| {
        let report = container.extract_files(&ids, &out, &ctx);
        (container, report)
    })
    .await?;
    close_container(container)?;

    print_report(&report);
    Ok(())
}

/// Delete a file.
fn cmd_rm(path: &Path, id: u64, config: ContainerConfig) -> Result<()> {
    info!("Removing file {}", id);

    let mut container = open_container(path, config)?;
    container.delete_file(id).context("Failed to remove file")?;
    close_container(container)?;

    println!("File removed: {}", id);
    Ok(())
}

/// Search files.
fn cmd_find(path: &Path, query: &FileQuery, config: ContainerConfig) -> Result<()> {
    let container = open_container(path, config)?;

    {
        let found = container.find_files(query);
        if found.is_empty() {
            println!("No matching files.");
        } else {
            println!("{} match(es):", found.len());
            for file in found {
                let dir = container.directory_path(file.path);
                print_file(file, &dir);
            }
        }
    }

    close_container(container)
}

/// Attach a note.
fn cmd_note_add(
    path: &Path,
    file_id: u64,
    source: &Path,
    note_type: &str,
    config: ContainerConfig,
) -> Result<()> {
    let bytes = std::fs::read(source)
        .with_context(|| format!("Failed to read {}", source.display()))?;

    let mut container = open_container(path, config)?;
    let id = container
        .add_note(file_id, note_type, &bytes)
        .context("Failed to add note")?;
    close_container(container)?;

    println!("Note {} attached to file {} ({} bytes)", id, file_id, bytes.len());
    Ok(())
}

/// Print a note.
fn cmd_note_show(path: &Path, id: u64, config: ContainerConfig) -> Result<()> {
    let mut container = open_container(path, config)?;
    let bytes = container.read_note(id).context("Failed to read note")?;
    close_container(container)?;

    println!("{}", String::from_utf8_lossy(&bytes));
    Ok(())
}

/// Switch a file between encrypted and plain storage.
async fn cmd_set_encryption(path: &Path, id: u64, encrypted: bool, config: ContainerConfig) -> Result<()> {
    let mut container = open_container(path, config)?;

    let (container, result) = run_cancellable(move |ctx| {
        let result = container.set_file_encryption(id, encrypted, &ctx);
        (container, result)
    })
    .await?;
    let outcome = result.context("Failed to change file encryption");
    close_container(container)?;
    outcome?;

    println!(
        "File {} is now stored {}",
        id,
        if encrypted { "encrypted" } else { "plain" }
    );
    Ok(())
}

/// Change the container password.
async fn cmd_passwd(path: &Path, config: ContainerConfig) -> Result<()> {
    info!("Changing container password");

    let mut container = open_container(path, config)?;
    let new_password = prompt_new_password("Enter new password: ")?;

    let (container, result) = run_cancellable(move |ctx| {
        let result = container.change_password(&new_password, &ctx);
        (container, result)
    })
    .await?;
    let outcome = result.context("Failed to change password");
    close_container(container)?;
    outcome?;

    println!("Password changed successfully!");
    Ok(())
}

fn cmd_recovery_token() -> Result<()> {
    let password = prompt_password("Enter password: ")?;
    println!("{}", password_recovery_token(&password));
    Ok(())
}

fn cmd_resolve_token(token: &str) -> Result<()> {
    let password = resolve_token(token).context("Invalid recovery token")?;
    println!("{}", String::from_utf8_lossy(password.as_bytes()));
    Ok(())
}
