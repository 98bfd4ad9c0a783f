//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every account is unavailable (or the pool is empty) and auto fallback
    /// is disabled. Carries a JSON summary of the pool counts.
    #[error("no account available: {0}")]
    NoAccountAvailable(String),

    /// Invalid settings update.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] session_store::Error),
}

impl Error {
    /// Whether this is a configuration problem (rejected admin input) rather
    /// than an operational failure.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::Store(session_store::Error::Config(_))
        )
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
