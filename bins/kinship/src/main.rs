//! Kinship command-line front end.
//!
//! `ingest` replays the ledger from a JSON-RPC node into the RocksDB cluster
//! index, checkpointing as it goes. `lookup`, `clusters`, and `status` read
//! the index back; `label` names the cluster of an address.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use kinship_cluster::{ChangeMode, ClusterEngine, ClusterStore};
use kinship_core::constants::Network;
use kinship_core::types::Address;
use kinship_ingest::{
    ClusterIndex, IngestConfig, LedgerWalker, NodeScriptDecoder, RpcLedgerSource, WalkerConfig,
};

/// Address clustering by ledger replay.
#[derive(Parser, Debug)]
#[command(name = "kinship", version, about = "Cluster ledger addresses by common ownership")]
struct Cli {
    /// Config file (TOML, YAML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for the cluster index
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Ledger network (mainnet, testnet, regtest)
    #[arg(long, global = true)]
    network: Option<Network>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay the ledger into the cluster index.
    Ingest(IngestArgs),
    /// Show the cluster an address belongs to.
    Lookup(LookupArgs),
    /// List stored clusters with their members.
    Clusters(ClustersArgs),
    /// Name the cluster an address belongs to.
    Label(LabelArgs),
    /// Show the resume height and the last run.
    Status,
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// JSON-RPC endpoint of the ledger node
    #[arg(long)]
    rpc_url: Option<String>,

    /// RPC user
    #[arg(long)]
    rpc_user: Option<String>,

    /// RPC password
    #[arg(long)]
    rpc_password: Option<String>,

    /// First height to replay (default: stored resume height)
    #[arg(long)]
    from: Option<u64>,

    /// Last height to replay, inclusive (default: node tip)
    #[arg(long)]
    to: Option<u64>,

    /// Change heuristic ("none" or "fresh-output")
    #[arg(long)]
    change_heuristic: Option<ChangeMode>,

    /// Ignore stored clusters and start from an empty index
    #[arg(long)]
    fresh: bool,
}

#[derive(Args, Debug)]
struct LookupArgs {
    /// Address to look up
    address: String,

    /// Member page, starting at 1
    #[arg(long, default_value_t = 1)]
    page: usize,
}

#[derive(Args, Debug)]
struct LabelArgs {
    /// Any address of the cluster
    address: String,

    /// New cluster label
    name: String,
}

#[derive(Args, Debug)]
struct ClustersArgs {
    /// Maximum number of clusters to list
    #[arg(long)]
    limit: Option<usize>,
}

impl Cli {
    /// Layer command-line overrides over the file/environment config.
    fn load_config(&self) -> Result<IngestConfig> {
        let mut cfg = IngestConfig::load(self.config.as_deref()).context("loading config")?;
        if let Some(dir) = &self.data_dir {
            cfg.data_dir = dir.clone();
        }
        if let Some(network) = self.network {
            // Follow the network's port unless an endpoint was configured.
            if cfg.rpc_url == IngestConfig::default().rpc_url {
                cfg.rpc_url = format!("http://127.0.0.1:{}", network.default_rpc_port());
            }
            cfg.network = network;
        }
        if let Some(level) = &self.log_level {
            cfg.log_level = level.clone();
        }
        if let Commands::Ingest(args) = &self.command {
            if let Some(url) = &args.rpc_url {
                cfg.rpc_url = url.clone();
            }
            if args.rpc_user.is_some() {
                cfg.rpc_user = args.rpc_user.clone();
            }
            if args.rpc_password.is_some() {
                cfg.rpc_password = args.rpc_password.clone();
            }
            cfg.start_height = args.from.or(cfg.start_height);
            cfg.end_height = args.to.or(cfg.end_height);
            if let Some(mode) = args.change_heuristic {
                cfg.change_heuristic = mode;
            }
        }
        cfg.validate().context("invalid configuration")?;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    init_logging(&config.log_level, &cli.log_format);

    info!("kinship v{}", env!("CARGO_PKG_VERSION"));
    info!("network: {}", config.network);
    info!("db_path: {:?}", config.db_path());

    match cli.command {
        Commands::Ingest(args) => ingest(config, args.fresh).await,
        Commands::Lookup(args) => lookup(&config, &args),
        Commands::Clusters(args) => clusters(&config, &args),
        Commands::Label(args) => label(&config, &args),
        Commands::Status => status(&config),
    }
}

/// Replay the ledger and persist the resulting clusters.
async fn ingest(config: IngestConfig, fresh: bool) -> Result<()> {
    let db_path = config.db_path();
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("creating {}", db_path.display()))?;
    let index = ClusterIndex::open(&db_path).context("opening cluster index")?;

    let (store, resume) = match index.load().context("loading stored clusters")? {
        Some((store, next)) if !fresh => (store, next),
        _ => (ClusterStore::new(), 0),
    };
    let start = config.start_height.unwrap_or(resume);
    if start > resume {
        warn!(start, resume, "starting past the resume height; heights in between are not clustered");
    }
    info!(
        start,
        clusters = store.cluster_count(),
        addresses = store.address_count(),
        change = %config.change_heuristic,
        "starting ingest"
    );

    let source = RpcLedgerSource::connect(
        &config.rpc_url,
        config.rpc_user.as_deref(),
        config.rpc_password.as_deref(),
        config.fetch_timeout(),
    )
    .context("connecting to ledger node")?;
    info!("rpc endpoint: {}", source.endpoint());

    let engine = ClusterEngine::new(store).with_change(config.change_heuristic.heuristic());
    let mut walker = LedgerWalker::new(
        Arc::new(source),
        Arc::new(NodeScriptDecoder),
        engine,
        WalkerConfig::from(&config),
    )
    .starting_at(start);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, stopping at the next block boundary");
                shutdown_tx.send_replace(true);
            }
            Err(e) => error!("failed to install Ctrl+C handler: {}", e),
        }
    });

    let result = walker
        .run_with_checkpoints(config.end_height, shutdown_rx, |store, next| {
            index.checkpoint(store, next)
        })
        .await;

    match result {
        Ok(summary) => {
            index
                .checkpoint(walker.engine().store(), summary.next_height)
                .context("persisting clusters")?;
            index.record_run(&summary).context("recording run")?;
            index.flush().context("flushing cluster index")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Err(e) => {
            if let Some(height) = e.resume_height() {
                // Re-applying a partially applied block leaves the partition unchanged.
                index
                    .checkpoint(walker.engine().store(), height)
                    .context("persisting clusters after failure")?;
                index.flush().context("flushing cluster index")?;
                error!(resume = height, "ingest stopped: {}", e);
            }
            Err(e).context("ingest failed")
        }
    }
}

fn lookup(config: &IngestConfig, args: &LookupArgs) -> Result<()> {
    let index = open_existing(config)?;
    let address = Address::new(args.address.trim());
    match index.lookup(&address, args.page)? {
        Some(info) => {
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
        None => bail!("address not found: {address}"),
    }
}

fn clusters(config: &IngestConfig, args: &ClustersArgs) -> Result<()> {
    let index = open_existing(config)?;
    let records = index.clusters(args.limit)?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

fn label(config: &IngestConfig, args: &LabelArgs) -> Result<()> {
    let index = open_existing(config)?;
    let address = Address::new(args.address.trim());
    let name = args.name.trim();
    if name.is_empty() {
        bail!("label must not be empty");
    }
    match index.set_label(&address, name).context("labelling cluster")? {
        Some(id) => {
            index.flush().context("flushing cluster index")?;
            let members = index.lookup(&address, 1)?.map(|info| info.cluster_member_count);
            let out = serde_json::json!({
                "cluster": id.0,
                "label": name,
                "members": members,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        None => bail!("address not found: {address}"),
    }
}

fn status(config: &IngestConfig) -> Result<()> {
    let index = open_existing(config)?;
    let status = serde_json::json!({
        "network": config.network.to_string(),
        "next_height": index.next_height()?,
        "identities": index.identity_count()?,
        "last_run": index.last_run()?,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Open the index for reading, refusing to create an empty one.
fn open_existing(config: &IngestConfig) -> Result<ClusterIndex> {
    let db_path = config.db_path();
    if !db_path.exists() {
        bail!(
            "no cluster index at {} (run `kinship ingest` first)",
            db_path.display()
        );
    }
    ClusterIndex::open(&db_path).context("opening cluster index")
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output. Any other value
/// defaults to human-readable text. Logs go to stderr so stdout stays JSON.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
