use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use fieldops_sync::config::{self, Config};
use fieldops_sync::monitor::{HttpProbe, NetworkMonitor};
use fieldops_sync::{EngineError, EntityKind, SyncEngine, SyncOutcome};

#[derive(Debug, Parser)]
#[command(author, version, about = "Offline sync service for field asset records")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch connectivity and sync on reconnect (default)
    Run,
    /// Push pending local work once and exit
    Sync {
        /// Only sync this kind (sign, support, collision, maintenance_job, traffic_count_work_order)
        #[arg(long)]
        kind: Option<EntityKind>,
    },
    /// Fetch server collections and merge them into local state
    Fetch {
        #[arg(long)]
        kind: Option<EntityKind>,
    },
    /// Print pending work per kind
    Status,
    /// Sign in and store the session token
    Login {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
    /// Print an example config file
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Run);
    if let Command::ExampleConfig = command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());

    let engine = Arc::new(SyncEngine::open(&cfg, &database_url).await?);
    engine.restore().await?;

    match command {
        Command::Run => run(engine, &cfg).await,
        Command::Sync { kind } => sync_once(&engine, kind).await,
        Command::Fetch { kind } => fetch(&engine, kind).await,
        Command::Status => status(&engine).await,
        Command::Login { username, password } => match engine.login(&username, &password).await {
            Ok(()) => {
                println!("Signed in as {username}");
                Ok(())
            }
            Err(EngineError::Gateway(err)) => {
                bail!(err.user_message().unwrap_or_else(|| err.to_string()))
            }
            Err(err) => Err(err.into()),
        },
        Command::ExampleConfig => Ok(()),
    }
}

async fn run(engine: Arc<SyncEngine>, cfg: &Config) -> Result<()> {
    if cfg.sync.fetch_on_start {
        engine.fetch_all_kinds().await;
    }

    let monitor = Arc::new(NetworkMonitor::new(engine.orchestrator()));
    if cfg.sync.on_reconnect {
        let probe = HttpProbe::new(
            reqwest::Url::parse(&cfg.api.base_url)?,
            Duration::from_secs(cfg.api.timeout_secs),
        )?;
        monitor
            .start(Arc::new(probe), Duration::from_millis(cfg.app.poll_interval_ms))
            .await;
    }

    // Periodic fetch-and-merge
    let fetch_task = (cfg.app.fetch_interval_secs > 0).then(|| {
        let engine = engine.clone();
        let every = Duration::from_secs(cfg.app.fetch_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !engine.is_authenticated().await {
                    continue;
                }
                engine.fetch_all_kinds().await;
            }
        })
    });

    info!("sync service running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    monitor.stop().await;
    if let Some(task) = fetch_task {
        task.abort();
    }
    while engine.is_syncing() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if let Some(err) = engine.persist_error().await {
        warn!(%err, "last snapshot write failed");
    }
    Ok(())
}

async fn sync_once(engine: &SyncEngine, kind: Option<EntityKind>) -> Result<()> {
    let before = engine.pending_counts().await;
    if !before.has_pending() {
        println!("Nothing to sync");
        return Ok(());
    }
    match engine.sync_now(kind).await {
        Ok(SyncOutcome::Completed(report)) => {
            println!("{}", report.summary());
            if let Some(notice) = &report.notice {
                println!("{notice}");
            }
            for id in &report.failed {
                error!(%id, "left pending");
            }
            Ok(())
        }
        Ok(SyncOutcome::AlreadySyncing) => {
            println!("A sync is already running");
            Ok(())
        }
        Err(EngineError::NotAuthenticated) => bail!("not signed in; run `login` first"),
        Err(err) => Err(err.into()),
    }
}

async fn fetch(engine: &SyncEngine, kind: Option<EntityKind>) -> Result<()> {
    match kind {
        Some(kind) => {
            let count = engine.fetch_and_merge(kind).await?;
            println!("{kind}: {count}");
        }
        None => {
            for (kind, result) in engine.fetch_all_kinds().await {
                match result {
                    Ok(count) => println!("{kind}: {count}"),
                    Err(err) => println!("{kind}: failed ({err})"),
                }
            }
        }
    }
    Ok(())
}

async fn status(engine: &SyncEngine) -> Result<()> {
    println!(
        "{:<26} {:>7} {:>7} {:>7} {:>7}",
        "kind", "creates", "updates", "deletes", "images"
    );
    for kind in EntityKind::ALL {
        let c = engine.pending_counts_for(kind).await;
        println!(
            "{:<26} {:>7} {:>7} {:>7} {:>7}",
            kind.as_str(),
            c.creates,
            c.updates,
            c.deletes,
            c.images
        );
    }
    let total = engine.pending_counts().await;
    println!("total pending: {}", total.total());
    if !engine.is_authenticated().await {
        println!("not signed in");
    }
    Ok(())
}
