use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use phishblock_anchor::anchor::ethereum::EthereumLedger;
use phishblock_anchor::anchor::ChainAnchorer;
use phishblock_anchor::config::{Cli, Commands, Settings};
use phishblock_anchor::error::{AnchorError, Result};
use phishblock_anchor::guard;
use phishblock_anchor::pipeline::AnchoringPipeline;
use phishblock_anchor::server::{self, AppState};
use phishblock_anchor::snapshot::HttpSnapshotter;
use phishblock_anchor::state::memory::MemoryReportStore;
use phishblock_anchor::state::repository::PgReportStore;
use phishblock_anchor::state::{Database, ReportStore};
use phishblock_anchor::storage::ipfs::IpfsStore;
use phishblock_anchor::storage::pinata::PinataStore;
use phishblock_anchor::storage::web3storage::Web3Storage;
use phishblock_anchor::storage::{ContentStore, FallbackUploader};

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("phishblock_anchor={},info", cli.settings.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = cli.settings;

    match cli.command {
        Commands::Serve => {
            let hook_secret = settings
                .hook_secret
                .clone()
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| AnchorError::InvalidConfig("HOOK_SECRET is not set".to_string()))?;
            let store = open_store(&settings).await?;
            let pipeline = build_pipeline(&settings, store)?;
            let state = AppState {
                pipeline: Arc::new(pipeline),
                hook_secret,
            };
            server::serve(state, &settings.listen.to_string()).await
        }
        Commands::Run { id } => {
            let store = open_store(&settings).await?;
            let outcome = build_pipeline(&settings, store)?.run(&id).await?;
            print_json(&outcome)
        }
        Commands::Resume { id } => {
            let store = open_store(&settings).await?;
            let outcome = build_pipeline(&settings, store)?.resume(&id).await?;
            print_json(&outcome)
        }
        Commands::Reconcile => {
            let store = open_store(&settings).await?;
            let cleared = guard::reconcile(store.as_ref()).await?;
            print_json(&cleared)
        }
        Commands::CheckTx { hash, report_id } => {
            let ledger = EthereumLedger::new(settings.ethereum_readonly()?)?;
            let inspection = ledger.inspect(&hash).await?;
            print_json(&inspection)?;

            if !inspection.reference_matches {
                return Err(AnchorError::Ledger(format!(
                    "On-chain reference does not match keccak256({})",
                    inspection.report_id
                )));
            }
            match report_id {
                Some(expected) if expected != inspection.report_id => {
                    Err(AnchorError::Ledger(format!(
                        "Transaction anchors {}, expected {expected}",
                        inspection.report_id
                    )))
                }
                _ => Ok(()),
            }
        }
    }
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn ReportStore>> {
    match settings.database_url.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(url) => {
            let db = Database::connect(url).await?;
            db.migrate().await?;
            info!("Connected to PostgreSQL report store");
            Ok(Arc::new(PgReportStore::new(db)))
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory report store");
            Ok(Arc::new(MemoryReportStore::new()))
        }
    }
}

fn build_uploader(settings: &Settings) -> Result<FallbackUploader> {
    let mut stores: Vec<Box<dyn ContentStore>> =
        vec![Box::new(Web3Storage::new(settings.web3_storage())?)];
    if let Some(pinata) = settings.pinata() {
        stores.push(Box::new(PinataStore::new(pinata)?));
    }
    if let Some(ipfs) = settings.ipfs() {
        stores.push(Box::new(IpfsStore::new(ipfs)?));
    }
    Ok(FallbackUploader::new(stores))
}

fn build_pipeline(settings: &Settings, store: Arc<dyn ReportStore>) -> Result<AnchoringPipeline> {
    let ledger = Arc::new(EthereumLedger::new(settings.ethereum()?)?);
    let anchorer = ChainAnchorer::new(
        ledger,
        &settings.explorer_tx_url,
        settings.confirmation_timeout(),
    );
    let snapshotter = Arc::new(HttpSnapshotter::new(
        settings.snapshot_timeout(),
        settings.snapshot_max_bytes,
    )?);
    let uploader = build_uploader(settings)?;
    info!(providers = ?uploader.provider_names(), "Content stores configured");

    AnchoringPipeline::new(store, anchorer, snapshotter, uploader, settings.pipeline()?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
