use thiserror::Error;

/// Error taxonomy for the content store.
///
/// `Validation`, `Unavailable` and `NotFound` surface to callers.
/// `TransientFetch` and `BackupRun` are contained by the components that
/// produce them and only show up in logs and `BackupStatus`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("primary store unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("fallback fetch failed: {0}")]
    TransientFetch(String),

    #[error("backup run failed: {0}")]
    BackupRun(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
