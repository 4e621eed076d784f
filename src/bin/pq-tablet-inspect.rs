//! pq-tablet-inspect - print the persisted transaction state of a tablet
//!
//! ## Usage
//!
//! ```bash
//! # Inspect tablet 1 under ./data
//! pq-tablet-inspect --data-dir ./data --tablet-id 1
//!
//! # Same, as JSON
//! pq-tablet-inspect --data-dir ./data --tablet-id 1 --json
//!
//! # Use the settings of a tablet config file
//! pq-tablet-inspect --config tablet.toml
//! ```

use clap::Parser;
use pq_tablet::config::defaults::DEFAULT_LOG_LEVEL;
use pq_tablet::storage::{
    decode_json, read_json, FileTxStore, TxStore, CONFIG_KEY, SUPPORTIVE_KEY_PREFIX, TX_INFO_KEY,
    TX_KEY_PREFIX,
};
use pq_tablet::supportive::SupportiveOwnership;
use pq_tablet::transaction::record::{TabletTxInfo, TxRecord};
use pq_tablet::{TabletConfig, TabletId, TopicConfig};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, error};

/// Print the persisted transaction state of a PQ tablet
#[derive(Parser, Debug)]
#[command(name = "pq-tablet-inspect")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tablet config file; its data_dir and tablet_id are used
    #[arg(short, long, env = "PQ_TABLET_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory holding the tablet stores
    #[arg(long, env = "PQ_TABLET_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Tablet whose store to open
    #[arg(long, env = "PQ_TABLET_ID")]
    tablet_id: Option<TabletId>,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    /// Log filter
    #[arg(long, default_value = DEFAULT_LOG_LEVEL, env = "PQ_TABLET_LOG_LEVEL")]
    log_level: String,
}

#[derive(Debug, Serialize)]
struct Report {
    tablet_id: TabletId,
    store_dir: PathBuf,
    info: Option<TabletTxInfo>,
    config: Option<TopicConfig>,
    transactions: Vec<TxRecord>,
    supportive: Vec<SupportiveOwnership>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => TabletConfig::from_file(path)?,
        None => TabletConfig::default(),
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(tablet_id) = args.tablet_id {
        config.tablet_id = tablet_id;
    }

    let store_dir = config.store_dir();
    if !store_dir.exists() {
        error!(dir = %store_dir.display(), "No tablet store found");
        return Err(format!("no tablet store at {}", store_dir.display()).into());
    }
    debug!(dir = %store_dir.display(), "Opening tablet store");

    let report = load(&config, store_dir).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text(&report);
    }
    Ok(())
}

async fn load(config: &TabletConfig, store_dir: PathBuf) -> pq_tablet::Result<Report> {
    let store = FileTxStore::open(&store_dir)?;

    let info: Option<TabletTxInfo> = read_json(&store, TX_INFO_KEY).await?;
    let topic: Option<TopicConfig> = read_json(&store, CONFIG_KEY).await?;

    let mut transactions = Vec::new();
    for (key, bytes) in store.read_prefix(TX_KEY_PREFIX).await? {
        transactions.push(decode_json::<TxRecord>(&key, &bytes)?);
    }
    let mut supportive = Vec::new();
    for (key, bytes) in store.read_prefix(SUPPORTIVE_KEY_PREFIX).await? {
        supportive.push(decode_json::<SupportiveOwnership>(&key, &bytes)?);
    }

    Ok(Report {
        tablet_id: config.tablet_id,
        store_dir,
        info,
        config: topic,
        transactions,
        supportive,
    })
}

fn print_text(report: &Report) {
    println!("Tablet {} ({})", report.tablet_id, report.store_dir.display());

    match &report.info {
        Some(info) => {
            println!(
                "  executed up to: step {} tx {}",
                info.exec_step, info.exec_tx_id
            );
            println!("  plan step:      {}", info.plan_step);
            println!("  state:          {:?}", info.tablet_state);
            println!("  tx writes:      {}", info.tx_writes.len());
        }
        None => println!("  no transaction index"),
    }

    match &report.config {
        Some(config) => println!(
            "  topic:          {} (version {}, {} partitions)",
            config.path,
            config.version,
            config.partitions.len()
        ),
        None => println!("  topic:          bootstrap configuration"),
    }

    println!("  transactions:   {}", report.transactions.len());
    for tx in &report.transactions {
        let step = tx
            .step
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        let outcome = tx
            .outcome
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "    tx {:>8}  step {:>8}  {:<12} outcome {:<8} acks {}/{}",
            tx.tx_id,
            step,
            tx.state.to_string(),
            outcome,
            tx.acks.len(),
            tx.receivers.len()
        );
    }

    println!("  supportive:     {}", report.supportive.len());
    for owner in &report.supportive {
        println!(
            "    partition {} <- {} owned by {} ({})",
            owner.supportive_partition, owner.parent_partition, owner.owner, owner.write_id
        );
    }
}
