//! # backup-home CLI
//!
//! Archives a home directory and uploads the archive.
//!
//! ## Usage
//! ```bash
//! # Back up $HOME and copy it to a sync tool remote
//! backup-home -d drive:backups
//!
//! # Show what would happen
//! backup-home -d drive:backups --preview
//!
//! # Upload over SFTP, verifying the server key
//! backup-home --ssh --ssh-host nas.local --ssh-remote-path /srv/backups \
//!     --known-hosts ~/.ssh/known_hosts
//!
//! # Only build the archive
//! backup-home --backup-only --backup-path /tmp/home.tar.gz
//! ```

use backup_home::utils::format_bytes;
use backup_home::{
    BackupBuilder, BackupError, BackupReport, HostKeyPolicy, Result, SshConfig, Telemetry,
    TelemetryEvent, TracingTelemetry, UploadMode,
};
use clap::Parser;
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// backup-home - snapshot a home directory and ship it somewhere safe
#[derive(Parser, Debug)]
#[command(name = "backup-home")]
#[command(version)]
#[command(about = "Back up a home directory into one compressed archive and upload it")]
#[command(long_about = None)]
struct Cli {
    /// Directory to back up (defaults to the home directory)
    #[arg(short, long)]
    source: Option<PathBuf>,

    /// Sync tool destination, e.g. "drive:" or "gdrive:backup/home"
    #[arg(short, long)]
    destination: Option<String>,

    /// Local archive path (defaults to <temp dir>/<user>.<ext>)
    #[arg(long)]
    backup_path: Option<PathBuf>,

    /// Compression level 0-9; other values fall back to 6
    #[arg(short, long, default_value_t = 6, allow_negative_numbers = true)]
    compression: i64,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Print the plan and exit
    #[arg(long)]
    preview: bool,

    /// Abort on the first unreadable file instead of skipping it
    #[arg(long)]
    strict: bool,

    /// Build the archive but do not upload it
    #[arg(long)]
    skip_upload: bool,

    /// Keep the local archive after a successful upload
    #[arg(long)]
    keep_backup: bool,

    /// Archive everything, ignoring the default exclusion patterns
    #[arg(long)]
    ignore_excludes: bool,

    /// Only create the local archive
    #[arg(long)]
    backup_only: bool,

    /// Rebuild the archive even if one already exists
    #[arg(long)]
    overwrite: bool,

    /// Extra exclusion pattern (repeatable)
    #[arg(long = "exclude", value_name = "PATTERN")]
    excludes: Vec<String>,

    /// Number of archive workers (defaults to the CPU count)
    #[arg(long)]
    workers: Option<usize>,

    /// Upload over SFTP instead of the sync tool
    #[arg(long)]
    ssh: bool,

    /// SSH server
    #[arg(long)]
    ssh_host: Option<String>,

    /// SSH port
    #[arg(long, default_value_t = 22)]
    ssh_port: u16,

    /// SSH user (defaults to the current user)
    #[arg(long)]
    ssh_user: Option<String>,

    /// SSH password
    #[arg(long, env = "BACKUP_HOME_SSH_PASSWORD", hide_env_values = true)]
    ssh_password: Option<String>,

    /// SSH private key file
    #[arg(long)]
    ssh_key: Option<PathBuf>,

    /// Remote base directory for SFTP uploads
    #[arg(long, default_value = "backups")]
    ssh_remote_path: String,

    /// Verify the SSH server against this known_hosts file
    #[arg(long)]
    known_hosts: Option<PathBuf>,

    /// Print the report (or the plan with --preview) as JSON
    #[arg(long)]
    json: bool,
}

/// Telemetry that draws upload progress as a bar and logs everything else
struct CliTelemetry {
    inner: TracingTelemetry,
    bar: Mutex<Option<ProgressBar>>,
    show_bar: bool,
}

impl CliTelemetry {
    fn new(show_bar: bool) -> Self {
        Self {
            inner: TracingTelemetry,
            bar: Mutex::new(None),
            show_bar,
        }
    }

    fn bar_for(&self, total: u64) -> ProgressBar {
        let mut slot = self.bar.lock();
        slot.get_or_insert_with(|| {
            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} Uploading [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            pb
        })
        .clone()
    }
}

impl Telemetry for CliTelemetry {
    fn record(&self, event: TelemetryEvent) {
        if !self.show_bar {
            self.inner.record(event);
            return;
        }
        match &event {
            TelemetryEvent::TransferProgress(snapshot) => {
                self.bar_for(snapshot.total).set_position(snapshot.transferred);
            }
            TelemetryEvent::TransferCompleted(_) => {
                if let Some(pb) = self.bar.lock().take() {
                    pb.finish_and_clear();
                }
                self.inner.record(event);
            }
            _ => self.inner.record(event),
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(cli.verbose)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

/// Check flag combinations before anything is touched
fn validate(cli: &Cli) -> Result<()> {
    let uploading = !(cli.skip_upload || cli.backup_only);
    if uploading && !cli.ssh && cli.destination.as_deref().map_or(true, |d| d.trim().is_empty()) {
        return Err(BackupError::config(
            "a destination is required (use --destination, --ssh, --skip-upload or --backup-only)",
        ));
    }
    if cli.ssh && uploading && cli.ssh_host.as_deref().map_or(true, |h| h.trim().is_empty()) {
        return Err(BackupError::config("--ssh-host is required with --ssh"));
    }
    if cli.workers == Some(0) {
        return Err(BackupError::config("--workers must be at least 1"));
    }
    Ok(())
}

fn upload_mode(cli: &Cli) -> UploadMode {
    if cli.skip_upload || cli.backup_only {
        return UploadMode::None;
    }
    if cli.ssh {
        let mut config = SshConfig::new(cli.ssh_host.clone().unwrap_or_default());
        config.port = cli.ssh_port;
        if let Some(user) = &cli.ssh_user {
            config.user = user.clone();
        }
        config.password = cli.ssh_password.clone();
        config.key_file = cli.ssh_key.clone();
        config.remote_base = cli.ssh_remote_path.clone();
        if let Some(known_hosts) = &cli.known_hosts {
            config.host_key_policy = HostKeyPolicy::KnownHosts(known_hosts.clone());
        }
        return UploadMode::Secure(config);
    }
    UploadMode::Sync {
        destination: cli.destination.clone().unwrap_or_default(),
    }
}

fn run(cli: Cli) -> Result<()> {
    validate(&cli)?;

    let source = match cli.source.clone().or_else(dirs::home_dir) {
        Some(source) => source,
        None => return Err(BackupError::config("cannot determine the home directory; pass --source")),
    };

    let show_bar = !cli.verbose && !cli.json && std::io::stderr().is_terminal();
    let telemetry: Arc<dyn Telemetry> = Arc::new(CliTelemetry::new(show_bar));

    let mut builder = BackupBuilder::new(source)
        .compression_level(cli.compression)
        .skip_on_error(!cli.strict)
        .keep_backup(cli.keep_backup || cli.backup_only)
        .ignore_excludes(cli.ignore_excludes)
        .overwrite(cli.overwrite)
        .upload(upload_mode(&cli))
        .telemetry(telemetry);
    if let Some(path) = &cli.backup_path {
        builder = builder.output(path);
    }
    if let Some(workers) = cli.workers {
        builder = builder.workers(workers);
    }
    for pattern in &cli.excludes {
        builder = builder.exclude(pattern.as_str());
    }
    let job = builder.build()?;

    if cli.preview {
        let plan = job.plan();
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&plan)?);
        } else {
            println!("{}", "Preview (nothing will be written)".blue().bold());
            print!("{}", plan);
        }
        return Ok(());
    }

    if !cli.json {
        println!("{}", "Starting backup...".blue().bold());
    }
    let start = Instant::now();
    let report = job.run()?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report, start.elapsed());
    }
    Ok(())
}

fn print_summary(report: &BackupReport, elapsed: Duration) {
    let archive = &report.archive;
    println!("{} Backup complete", "✓".green().bold());
    println!("  Archive: {}", archive.path.display().to_string().cyan());
    println!("  Size: {}", format_bytes(archive.size).cyan());
    if archive.reused {
        println!("  Files: {}", "existing archive reused".yellow());
    } else {
        println!("  Files: {}", archive.stats.files_in_archive().to_string().cyan());
        println!("  Excluded: {}", archive.stats.excluded.to_string().cyan());
        if archive.stats.files_skipped > 0 {
            println!("  Skipped: {} files", archive.stats.files_skipped.to_string().yellow());
        }
        if archive.stats.files_padded > 0 {
            println!("  Incomplete: {} files", archive.stats.files_padded.to_string().yellow());
        }
    }
    println!("  SHA-256: {}", archive.sha256.dimmed());
    if let Some(upload) = &report.upload {
        println!("  Uploaded to: {}", upload.location.cyan());
    }
    if report.local_archive_kept {
        println!("  Local copy: {}", "kept".cyan());
    } else {
        println!("  Local copy: {}", "removed".cyan());
    }
    let rounded = Duration::from_millis(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
    println!("  Time: {}", format_duration(rounded).to_string().cyan());
}
