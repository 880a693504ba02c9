use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Unknown client key")]
    UnknownClient,

    #[error("Transaction not found: {0}")]
    NotFound(String),

    #[error("Transaction has expired")]
    Expired,

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Verification mismatch, {remaining_attempts} attempt(s) remaining")]
    VerificationMismatch { remaining_attempts: u32 },

    #[error("Verification attempts exhausted")]
    AttemptsExhausted,

    #[error("Verification provider error: {0}")]
    ExternalService(String),

    #[error("Concurrent update conflict on transaction {0}")]
    ConcurrencyConflict(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
