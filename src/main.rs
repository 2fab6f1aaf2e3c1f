use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{ArgGroup, Parser, Subcommand};
use plugin_sync::config::Config;
use plugin_sync::engine::{self, EngineSettings, SyncEngine, EXIT_FAILED, EXIT_USAGE};
use plugin_sync::feed::http::HttpFeedSource;
use plugin_sync::store::SqliteStore;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Mirror a vulnerability plugin feed into a local store.
#[derive(Parser)]
#[command(name = "plugin-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(global = true, short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Write logs to this file instead of stderr
    #[arg(global = true, long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize plugins from the feed
    #[command(subcommand)]
    Sync(SyncCommand),
}

#[derive(Subcommand)]
enum SyncCommand {
    /// Walk the whole feed
    Full,

    /// Only plugins modified on or after a date
    #[command(group(ArgGroup::new("window").required(true).args(["since", "since_last_sync"])))]
    Incremental {
        /// Lower bound, inclusive (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date_arg)]
        since: Option<NaiveDate>,

        /// Use the latest modification date already in the store
        #[arg(long)]
        since_last_sync: bool,
    },
}

fn parse_date_arg(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default = if verbose { "plugin_sync=debug" } else { "plugin_sync=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create log file: {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose, cli.log_file.as_deref()) {
        eprintln!("error: {:#}", e);
        return ExitCode::from(EXIT_FAILED);
    }

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "plugin-sync failed");
            eprintln!("error: {:#}", e);
            ExitCode::from(EXIT_FAILED)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let Commands::Sync(command) = cli.command;

    // Reject a future --since before touching config, network or store.
    if let SyncCommand::Incremental { since: Some(since), .. } = &command {
        if let Err(e) = engine::check_since(*since) {
            eprintln!("error: {}", e);
            return Ok(EXIT_USAGE);
        }
    }

    // Keys saved in .env only fill variables the environment leaves unset.
    Config::import_dotenv();
    let config = Config::load(&cli.config)?;

    let credentials = Config::feed_credentials();
    if credentials.is_none() {
        tracing::info!("no feed credentials configured, requesting anonymously");
    }
    let source = Arc::new(HttpFeedSource::new(&config.feed, credentials.as_ref())?);
    let store = Arc::new(
        SqliteStore::open(&config.store)
            .with_context(|| format!("Failed to open plugin store at {}", config.store.path))?,
    );
    let engine = SyncEngine::new(source, store, EngineSettings::from_config(&config));

    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping at the next page boundary");
            cancel.cancel();
        }
    });

    let result = match command {
        SyncCommand::Full => engine.full_sync().await,
        SyncCommand::Incremental { since: Some(since), .. } => engine.incremental_sync(since).await,
        SyncCommand::Incremental { since: None, .. } => engine.incremental_since_watermark().await,
    };

    match result {
        Ok(report) => {
            println!(
                "{} sync completed in {:.1}s: {}",
                report.mode,
                report.elapsed.as_secs_f64(),
                report.summary
            );
            Ok(report.exit_code())
        }
        Err(failure) => {
            eprintln!("sync failed: {}", failure.error);
            if let Some(cursor) = &failure.resume_from {
                eprintln!("resume from offset {} (page {})", cursor.offset, cursor.page_index);
            }
            println!("partial: {}", failure.summary);
            Ok(failure.exit_code())
        }
    }
}
