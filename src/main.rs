//! Subversion Backup Tool
//!
//! Takes full and differential `svnadmin dump` backups of a repository,
//! recording progress in a per-repository control file.

// svnbackup/src/main.rs
mod backup;
mod config;
mod control;
mod errors;
mod lock;
mod logging;
mod repository;
mod utils;

use backup::BackupMode;
use clap::{ArgAction, Args, Parser, Subcommand};
use config::{ConfigSources, load_backup_config};
use errors::{BackupError, EX_OK, EX_USAGE};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "svnbackup",
    version,
    about = "Full and differential backups of Subversion repositories"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding lock files, control files and dumps
    #[arg(short = 'b', long, global = true)]
    backup_root: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase logging verbosity (repeatable)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dump every revision up to the current head.
    Full(RepositoryArgs),
    /// Dump the revisions added since the last recorded backup.
    Diff(RepositoryArgs),
    /// Record the current head in the control file without dumping.
    BuildControlOnly(RepositoryArgs),
}

#[derive(Args, Debug)]
struct RepositoryArgs {
    /// Path to the repository to back up
    repository: PathBuf,
}

impl Cli {
    fn into_sources(self) -> ConfigSources {
        let (mode, args) = match self.command {
            Commands::Full(args) => (BackupMode::Full, args),
            Commands::Diff(args) => (BackupMode::Diff, args),
            Commands::BuildControlOnly(args) => (BackupMode::BuildControlOnly, args),
        };
        ConfigSources {
            repository: args.repository,
            mode: Some(mode),
            verbosity: self.verbose,
            cli_backup_root: self.backup_root,
            cli_config_path: self.config,
            ..ConfigSources::default()
        }
        .with_env()
    }
}

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(if e.use_stderr() { EX_USAGE } else { EX_OK });
        }
    };

    match run_app(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_retryable() => {
            eprintln!("svnbackup: {e}; another backup may be running, try again later");
            ExitCode::from(e.exit_code())
        }
        Err(e) => {
            eprintln!("svnbackup: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run_app(cli: Cli) -> Result<(), BackupError> {
    let config = load_backup_config(cli.into_sources())
        .map_err(|e| BackupError::Usage(format!("{e:#}")))?;
    logging::init_logging(config.log_format, config.verbosity);

    info!(
        mode = config.mode.as_str(),
        repository = %config.repository.display(),
        backup_root = %config.backup_root.display(),
        "starting backup"
    );
    let report = backup::run_backup_flow(&config).await?;
    match &report.dump {
        Some(dump) => info!(
            identity = %report.identity,
            artifact = %dump.artifact.display(),
            range = %dump.range,
            "backup completed"
        ),
        None => info!(
            identity = %report.identity,
            control = %report.control_file.display(),
            revision = report.head_revision,
            "control file updated"
        ),
    }
    Ok(())
}
