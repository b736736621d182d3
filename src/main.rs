//! Consensus Notary CLI (`notary`)
//!
//! Validates configuration files and runs a local double-spend scenario
//! against the in-memory consensus log.

use clap::{Parser, Subcommand};
use consensus_notary::config::NotaryConfig;
use consensus_notary::identity::{Keypair, KeypairSigner, TransactionSigner};
use consensus_notary::log::{InMemoryLog, OrderedLog};
use consensus_notary::notary::{NotaryService, NotarySettings, Verdict};
use consensus_notary::spend::{CandidateTransaction, StateRef, TxId};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "consensus_notary=info,notary=info";

#[derive(Parser, Debug)]
#[command(name = "notary", version, about = "Consensus-log notary conflict detector")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a JSON config file and print what it resolves to
    CheckConfig {
        path: PathBuf,
    },
    /// Notarize two transactions racing for the same state on an in-memory log
    Demo {
        /// Config file supplying keys and timing; a fresh key is used otherwise
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write the final ledger snapshot here
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let args = Args::parse();

    match args.command {
        Command::CheckConfig { path } => check_config(path),
        Command::Demo { config, snapshot } => run_demo(config, snapshot).await,
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn check_config(path: PathBuf) -> Result<(), Box<dyn Error>> {
    let config = NotaryConfig::load(&path)?;

    println!("account:          {}", config.account_id);
    println!("notary key:       {}", config.operator_key.public_key());
    match config.topic_id {
        Some(topic) => println!("topic:            {}", topic),
        None => println!("topic:            (created at startup)"),
    }
    if let Some(key) = &config.submit_key {
        println!("submit key:       {}", key.public_key());
    }
    println!("network:          {:?}", config.network);
    println!("poll interval:    {:?}", config.poll_interval);
    match config.wait_timeout {
        Some(timeout) => println!("wait timeout:     {:?}", timeout),
        None => println!("wait timeout:     none"),
    }
    println!("max message size: {} bytes", config.max_message_size);
    Ok(())
}

async fn run_demo(
    config: Option<PathBuf>,
    snapshot: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let (signer, settings) = match config {
        Some(path) => {
            let config = NotaryConfig::load(&path)?;
            (config.signer(), config.settings())
        }
        None => (
            KeypairSigner::new(Keypair::generate()),
            NotarySettings::new().with_poll_interval(Duration::from_millis(100)),
        ),
    };
    tracing::info!(notary = %signer.public_key(), "starting demo notary");

    let log: Arc<dyn OrderedLog> =
        Arc::new(InMemoryLog::new().with_max_message_size(settings.max_message_size));
    let service = NotaryService::builder(log, Arc::new(signer), settings)
        .start()
        .await?;
    let notary = service.notary();

    let hash_a = TxId::digest(b"genesis A");
    let hash_b = TxId::digest(b"genesis B");

    let t1 = CandidateTransaction::new(
        TxId::digest(b"T1"),
        vec![StateRef::new(hash_a, 0)],
        vec![],
    );
    let t2 = CandidateTransaction::new(
        TxId::digest(b"T2"),
        vec![StateRef::new(hash_a, 0), StateRef::new(hash_b, 0)],
        vec![],
    );

    for txn in [&t1, &t2] {
        match notary.notarize(txn).await? {
            Verdict::Approved(sig) => {
                println!("{} approved, signed by {}", txn.id(), sig.by())
            }
            Verdict::Rejected(report) => println!("{} rejected: {}", txn.id(), report),
        }
    }

    if let Some(path) = snapshot {
        let bytes = notary.ledger().snapshot().to_bytes()?;
        std::fs::write(&path, bytes)?;
        println!("ledger snapshot written to {}", path.display());
    }

    let stats = notary.stats();
    println!(
        "approved {} / rejected {} / failed {}",
        stats.approved, stats.rejected, stats.failed
    );

    service.stop().await;
    Ok(())
}
