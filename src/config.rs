/// Command-line and environment configuration.
///
/// Every setting can come from a flag or its environment variable; `.env` is
/// loaded first by `main`. Conversion into the typed component configs is
/// where required-but-absent values are rejected, so subcommands that never
/// touch the ledger (e.g. `reconcile`) run without ledger credentials.
use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::anchor::ethereum::EthereumConfig;
use crate::error::{AnchorError, Result};
use crate::pipeline::PipelineConfig;
use crate::storage::ipfs::IpfsConfig;
use crate::storage::pinata::PinataConfig;
use crate::storage::web3storage::Web3StorageConfig;
use crate::storage::GatewayConfig;

#[derive(Parser, Debug)]
#[command(name = "phishblock-anchor")]
#[command(about = "Anchors and archives community-verified phishing reports")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Serve the trigger hook and repair endpoints
    Serve,
    /// Run the pipeline for one report
    Run { id: String },
    /// Finish a report whose transaction is already recorded
    Resume { id: String },
    /// Clear leases that expired mid-run
    Reconcile,
    /// Decode an anchor transaction and check it against its report id
    CheckTx {
        hash: String,
        /// Expected report id
        #[arg(long)]
        report_id: Option<String>,
    },
}

#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// EVM JSON-RPC endpoint
    #[arg(long, env = "RPC_URL", global = true)]
    pub rpc_url: Option<String>,

    /// Signing key for anchor transactions (hex)
    #[arg(long, env = "PRIVATE_KEY", global = true, hide_env_values = true)]
    pub private_key: Option<String>,

    /// Anchoring contract address
    #[arg(long, env = "CONTRACT_ADDRESS", global = true)]
    pub contract_address: Option<String>,

    /// Chain id (80002 is Polygon Amoy)
    #[arg(long, env = "CHAIN_ID", default_value = "80002", global = true)]
    pub chain_id: u64,

    /// Network name used in logs
    #[arg(long, env = "NETWORK_NAME", default_value = "Polygon Amoy", global = true)]
    pub network_name: String,

    /// Explorer base for transaction links
    #[arg(
        long,
        env = "EXPLORER_TX_URL",
        default_value = "https://amoy.polygonscan.com/tx",
        global = true
    )]
    pub explorer_tx_url: String,

    /// Confirmations required before a transaction counts as final
    #[arg(long, env = "CONFIRMATIONS", default_value = "1", global = true)]
    pub confirmations: u64,

    /// Seconds to wait for confirmation
    #[arg(long, env = "CONFIRMATION_TIMEOUT_SECS", default_value = "180", global = true)]
    pub confirmation_timeout_secs: u64,

    /// Milliseconds between receipt polls
    #[arg(long, env = "RECEIPT_POLL_MS", default_value = "2000", global = true)]
    pub receipt_poll_ms: u64,

    /// Web3.Storage API base
    #[arg(
        long,
        env = "WEB3_STORAGE_API_URL",
        default_value = "https://api.web3.storage",
        global = true
    )]
    pub web3_storage_api_url: String,

    /// Web3.Storage API token
    #[arg(long, env = "WEB3_STORAGE_TOKEN", global = true, hide_env_values = true)]
    pub web3_storage_token: Option<String>,

    /// Pinata API base
    #[arg(
        long,
        env = "PINATA_API_URL",
        default_value = "https://api.pinata.cloud",
        global = true
    )]
    pub pinata_api_url: String,

    /// Pinata JWT; the fallback store is disabled without it
    #[arg(long, env = "PINATA_JWT", global = true, hide_env_values = true)]
    pub pinata_jwt: Option<String>,

    /// Kubo API endpoint of a local IPFS node, tried last
    #[arg(long, env = "IPFS_API_URL", global = true)]
    pub ipfs_api_url: Option<String>,

    /// Primary gateway base for retrieval links
    #[arg(
        long,
        env = "IPFS_GATEWAY",
        default_value = "https://gateway.pinata.cloud/ipfs",
        global = true
    )]
    pub ipfs_gateway: String,

    /// Backup gateway base for retrieval links
    #[arg(long, env = "BACKUP_GATEWAY", default_value = "https://w3s.link/ipfs", global = true)]
    pub backup_gateway: String,

    /// Upvotes needed before a report is anchored
    #[arg(long, env = "VOTE_THRESHOLD", default_value = "10", global = true)]
    pub vote_threshold: i64,

    /// Snapshot fetch timeout in seconds
    #[arg(long, env = "SNAPSHOT_TIMEOUT_SECS", default_value = "15", global = true)]
    pub snapshot_timeout_secs: u64,

    /// Snapshot body budget in bytes
    #[arg(long, env = "SNAPSHOT_MAX_BYTES", default_value = "8192", global = true)]
    pub snapshot_max_bytes: usize,

    /// Lease lifetime in seconds
    #[arg(long, env = "LEASE_TTL_SECS", default_value = "600", global = true)]
    pub lease_ttl_secs: u64,

    /// PostgreSQL URL; an in-memory store is used when absent
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080", global = true)]
    pub listen: SocketAddr,

    /// Bearer secret for the hook and repair endpoints
    #[arg(long, env = "HOOK_SECRET", global = true, hide_env_values = true)]
    pub hook_secret: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AnchorError::InvalidConfig(format!("{name} is not set")))
}

impl Settings {
    pub fn pipeline(&self) -> Result<PipelineConfig> {
        if self.vote_threshold < 1 {
            return Err(AnchorError::InvalidConfig(
                "VOTE_THRESHOLD must be at least 1".to_string(),
            ));
        }
        Ok(PipelineConfig {
            vote_threshold: self.vote_threshold,
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            gateways: GatewayConfig {
                primary: self.ipfs_gateway.clone(),
                backup: self.backup_gateway.clone(),
            },
        })
    }

    /// Ledger config for submitting anchors.
    pub fn ethereum(&self) -> Result<EthereumConfig> {
        let mut config = self.ethereum_readonly()?;
        config.private_key_hex = required(&self.private_key, "PRIVATE_KEY")?.to_string();
        Ok(config)
    }

    /// Ledger config for read-only inspection; no signing key needed.
    pub fn ethereum_readonly(&self) -> Result<EthereumConfig> {
        Ok(EthereumConfig {
            rpc_url: required(&self.rpc_url, "RPC_URL")?.to_string(),
            network: self.network_name.clone(),
            private_key_hex: String::new(),
            contract_address: required(&self.contract_address, "CONTRACT_ADDRESS")?.to_string(),
            chain_id: self.chain_id,
            confirmations: self.confirmations.max(1),
            poll_interval: Duration::from_millis(self.receipt_poll_ms),
        })
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot_timeout_secs)
    }

    /// The primary store is always configured; it fails at upload time
    /// when its token is missing, so the fallback still gets a turn.
    pub fn web3_storage(&self) -> Web3StorageConfig {
        Web3StorageConfig {
            api_url: self.web3_storage_api_url.clone(),
            token: self.web3_storage_token.clone().unwrap_or_default(),
        }
    }

    pub fn pinata(&self) -> Option<PinataConfig> {
        self.pinata_jwt
            .as_deref()
            .filter(|jwt| !jwt.trim().is_empty())
            .map(|jwt| PinataConfig {
                api_url: self.pinata_api_url.clone(),
                jwt: jwt.trim().to_string(),
            })
    }

    pub fn ipfs(&self) -> Option<IpfsConfig> {
        self.ipfs_api_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .map(|url| IpfsConfig {
                api_url: url.trim().to_string(),
            })
    }
}
