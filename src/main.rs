mod error;
mod logging;
mod mail_destination;
mod mail_source;
mod message;
mod migrator;
mod settings;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use crate::error::MigrationError;
use crate::migrator::{MigrationStats, Migrator};

/// Move every message from one mailbox account to another.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Environment file to load instead of ./.env
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,

    /// Log debug detail
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = load_env(&cli) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }
    if let Err(e) = logging::init(cli.verbose) {
        eprintln!("cannot install logger: {}", e);
        return ExitCode::FAILURE;
    }

    match run().await {
        Ok(stats) => ExitCode::from(stats.exit_code()),
        Err(e) => {
            error!("Migration failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_env(cli: &Cli) -> Result<(), String> {
    match &cli.env_file {
        Some(path) => dotenvy::from_path(path)
            .map_err(|e| format!("cannot load env file {}: {}", path.display(), e)),
        None => {
            // A missing ./.env is fine; the environment may be complete
            // on its own.
            let _ = dotenvy::dotenv();
            Ok(())
        }
    }
}

async fn run() -> Result<MigrationStats, MigrationError> {
    info!("Starting email migration...");

    let source_config = settings::load_source_config();
    let dest_config = settings::load_destination_config();
    settings::validate_config(&source_config, &dest_config)?;

    let migrator = Migrator::new(source_config, dest_config)?;
    let stats = migrator.migrate().await?;

    match stats.duration_seconds() {
        Some(seconds) => info!(
            "Migration summary: total={} successful={} failed={} duration={:.1}s",
            stats.total_emails, stats.successful_emails, stats.failed_emails, seconds
        ),
        None => info!(
            "Migration summary: total={} successful={} failed={}",
            stats.total_emails, stats.successful_emails, stats.failed_emails
        ),
    }

    Ok(stats)
}
