//! Error types for the Forge notebook server.

/// Server error type.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Forge core error (protocol, kernel client, provider registry).
    #[error("core error: {0}")]
    Core(#[from] forge_core::Error),

    /// No cell at the given position.
    #[error("no cell at index {0}")]
    CellNotFound(usize),

    /// A cell is already executing on this session's kernel.
    #[error("execution already in progress")]
    ExecutionInProgress,

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid operation requested of the session.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
