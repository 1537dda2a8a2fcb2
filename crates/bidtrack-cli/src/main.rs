use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bidtrack_storage::{EntityStore, MemoryStore, PgEntityStore};
use bidtrack_sync::{scheduler_from_settings, Settings, SettingsOverrides};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "bidtrack")]
#[command(about = "Track marketplace auctions and their outcomes in PostgreSQL")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// YAML settings file merged over the built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    search_pattern: Option<String>,
    /// Lookahead window for active listings, in hours.
    #[arg(long, global = true)]
    auction_period: Option<u32>,
    /// Lookback window for completed listings, in hours.
    #[arg(long, global = true)]
    completed_period: Option<u32>,
    /// Minutes between cycle starts in daemon mode.
    #[arg(long, global = true)]
    polling_interval: Option<u64>,
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[arg(long, global = true)]
    db_host: Option<String>,
    #[arg(long, global = true)]
    db_port: Option<u16>,
    #[arg(long, global = true)]
    db_name: Option<String>,
    #[arg(long, global = true)]
    db_user: Option<String>,
    #[arg(long, global = true)]
    db_password: Option<String>,
    /// Replay listing snapshots from this directory.
    #[arg(long, global = true, conflicts_with = "feed_url")]
    fixture_dir: Option<PathBuf>,
    /// Pull listings from this JSON feed.
    #[arg(long, global = true)]
    feed_url: Option<String>,
    /// Reconcile into an in-process store instead of PostgreSQL.
    #[arg(long, global = true)]
    dry_run: bool,
}

impl GlobalArgs {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            search_pattern: self.search_pattern.clone(),
            auction_period_hours: self.auction_period,
            completed_period_hours: self.completed_period,
            polling_interval_minutes: self.polling_interval,
            log_level: self.log_level.clone(),
            db_host: self.db_host.clone(),
            db_port: self.db_port,
            db_name: self.db_name.clone(),
            db_user: self.db_user.clone(),
            db_password: self.db_password.clone(),
            fixture_dir: self.fixture_dir.clone(),
            feed_url: self.feed_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
enum Commands {
    /// Run one reconciliation cycle and exit.
    Run,
    /// Run cycles until interrupted.
    Daemon,
    /// Create tables and indexes, then exit.
    InitDb,
    /// Print tracked active auctions.
    Active,
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

/// Cancelled on SIGINT or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("stop signal received");
        trigger.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "SIGTERM handler unavailable; listening for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn dispatch(command: Commands, settings: &Settings, store: Arc<dyn EntityStore>) -> Result<()> {
    if command != Commands::Active {
        store
            .ensure_schema()
            .await
            .context("initializing database schema")?;
    }

    match command {
        Commands::InitDb => {
            println!("schema ready on {}:{}/{}", settings.database.host, settings.database.port, settings.database.name);
        }
        Commands::Run => {
            let scheduler = scheduler_from_settings(settings, store)?;
            let report = scheduler.run_once().await?;
            println!(
                "cycle complete: run_id={} active_seen={} inserted={} updated={} skipped={} finalized={} untracked={}",
                report.run_id,
                report.active.seen,
                report.active.inserted,
                report.active.updated,
                report.active.skipped + report.completed.skipped,
                report.completed.finalized,
                report.completed.untracked
            );
        }
        Commands::Daemon => {
            let scheduler = scheduler_from_settings(settings, store)?;
            let state = scheduler.run_continuous(shutdown_token()).await;
            info!(state = ?state, "daemon exited");
        }
        Commands::Active => {
            let auctions = store
                .list_active_auctions()
                .await
                .context("listing active auctions")?;
            for auction in &auctions {
                let price = auction
                    .current_price
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    auction.item_id,
                    auction.end_time.to_rfc3339(),
                    price,
                    auction.seller_user_id,
                    auction.title
                );
            }
            eprintln!("{} active auctions", auctions.len());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.global.config.as_deref(), &cli.global.overrides())?;
    init_tracing(&settings.log_filter());

    let command = cli.command.unwrap_or(Commands::Run);
    if cli.global.dry_run {
        warn!("dry run: reconciling into an in-process store; nothing is persisted");
        return dispatch(command, &settings, Arc::new(MemoryStore::new())).await;
    }

    let store = Arc::new(PgEntityStore::connect_lazy(&settings.store_settings()));
    let result = dispatch(command, &settings, store.clone()).await;
    store.close().await;
    result
}
