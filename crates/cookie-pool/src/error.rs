//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No cookie left to try for this request
    #[error("cookie pool exhausted: {0}")]
    Exhausted(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
