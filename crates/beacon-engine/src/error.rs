use beacon_store::StoreError;

/// Failures surfaced by domain collaborators. The dispatcher turns these
/// into `{success:false, error}` results; none of them end a connection.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no active session")]
    NoActiveSession,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage failure: {0}")]
    Store(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            other => Self::Store(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
