use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "forwarder-bot")]
#[command(about = "Crash-safe Telegram message forwarder", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: FORWARDER_CONFIG_PATH or ~/.forwarder/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the forwarder: resume pending deliveries, then forward new messages until SIGINT/SIGTERM.
    Run {
        /// Config file path (default: FORWARDER_CONFIG_PATH or ~/.forwarder/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Print delivery statistics and the checkpoint from the database.
    Status {
        /// Config file path (default: FORWARDER_CONFIG_PATH or ~/.forwarder/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// List deliveries that failed permanently.
    Failed {
        /// Config file path (default: FORWARDER_CONFIG_PATH or ~/.forwarder/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Print records as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("forwarder-bot {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run { config }) => {
            if let Err(e) = run_forwarder(config).await {
                log::error!("forwarder failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Status { config }) => {
            if let Err(e) = run_status(config).await {
                log::error!("status failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Failed { config, json }) => {
            if let Err(e) = run_failed(config, json).await {
                log::error!("listing failed deliveries: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(forwarder::config::default_config_path);
    let dir = forwarder::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_forwarder(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, path) = forwarder::config::load_config(config_path)?;
    let settings = forwarder::config::Settings::from_config(&config, &path)
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    log::info!(
        "starting forwarder (database {})",
        settings.db_path.display()
    );
    forwarder::forwarder::run_forwarder(settings).await?;
    Ok(())
}

/// Open the database named by the config without creating it.
async fn open_existing_store(
    config_path: Option<PathBuf>,
) -> anyhow::Result<forwarder::store::Store> {
    let (config, path) = forwarder::config::load_config(config_path)?;
    let db_path = forwarder::config::resolve_db_path(&config, &path);
    if !db_path.exists() {
        anyhow::bail!(
            "database not found at {} (has the forwarder run yet?)",
            db_path.display()
        );
    }
    let store = forwarder::store::Store::open(&db_path, 1)
        .await
        .with_context(|| format!("opening {}", db_path.display()))?;
    Ok(store)
}

async fn run_status(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let store = open_existing_store(config_path).await?;
    let stats = store.stats().await?;
    store.close().await;
    println!("messages:          {}", stats.messages);
    println!("pending:           {}", stats.pending);
    println!("delivered:         {}", stats.delivered);
    println!("failed-permanent:  {}", stats.failed_permanent);
    println!(
        "checkpoint:        {}",
        stats
            .checkpoint
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    println!(
        "last delivered at: {}",
        stats
            .last_delivered_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    Ok(())
}

async fn run_failed(config_path: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let store = open_existing_store(config_path).await?;
    let records = store.list_failed().await?;
    if json {
        store.close().await;
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        store.close().await;
        println!("no failed deliveries");
        return Ok(());
    }
    for r in &records {
        let siblings = store.records_for(&r.message_id).await?;
        let delivered = siblings
            .iter()
            .filter(|s| s.status == forwarder::store::DeliveryStatus::Delivered)
            .count();
        println!(
            "{} -> {}  attempts={}  last={}  delivered={}/{}  error={}",
            r.message_id,
            r.target_id,
            r.attempts,
            r.last_attempt_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
            delivered,
            siblings.len(),
            r.last_error.as_deref().unwrap_or("-")
        );
    }
    store.close().await;
    Ok(())
}
