use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Invalid transition: {event} is not allowed while {state}")]
    InvalidTransition { state: String, event: String },
    #[error("Insufficient balance on {account}: {available} available, {requested} requested")]
    InsufficientLedgerBalance {
        account: String,
        available: u32,
        requested: u32,
    },
    #[error("Stale transition: {event} no longer applies, engagement is already {state}")]
    StaleTransition { state: String, event: String },
    #[error("Payment {payment} already reconciled as {status}")]
    ReconciliationReplay { payment: String, status: String },
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Concurrent update on {id}: expected version {expected}")]
    ConcurrentConflict { id: String, expected: u64 },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Races the core resolves locally instead of failing the caller.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Self::StaleTransition { .. } | Self::ReconciliationReplay { .. }
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::InternalError(Box::new(err))
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for EngineError {
    fn from(err: rocksdb::Error) -> Self {
        Self::InternalError(Box::new(err))
    }
}
