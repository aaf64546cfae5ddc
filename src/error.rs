use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnchorError {
    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Transaction {tx_id} not confirmed within {waited_secs}s")]
    ConfirmationTimeout { tx_id: String, waited_secs: u64 },

    #[error("Transaction {0} reverted")]
    TransactionReverted(String),

    #[error("{provider} upload failed: {message}")]
    Storage { provider: String, message: String },

    /// Every configured content store rejected the upload.
    /// Holds `(provider, message)` in the order the stores were tried.
    #[error("{}", describe_attempts(.0))]
    ArchiveFailed(Vec<(String, String)>),

    #[error("Database error: {0}")]
    Database(String),

    /// The run's lease expired or was taken over before it finished.
    #[error("Lease on report {0} was lost mid-run")]
    LeaseLost(String),

    #[error("Report not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn describe_attempts(attempts: &[(String, String)]) -> String {
    if attempts.is_empty() {
        return "No content stores configured".to_string();
    }
    attempts
        .iter()
        .map(|(provider, message)| format!("{provider}: {message}"))
        .collect::<Vec<_>>()
        .join(" | ")
}

impl From<serde_json::Error> for AnchorError {
    fn from(e: serde_json::Error) -> Self {
        AnchorError::Serialization(e.to_string())
    }
}

impl From<sqlx::Error> for AnchorError {
    fn from(e: sqlx::Error) -> Self {
        AnchorError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AnchorError>;
