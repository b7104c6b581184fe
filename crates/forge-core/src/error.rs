//! Error types for forge-core.

use thiserror::Error;

/// Result type for forge-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in forge-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// IPC communication error with a worker process (either channel).
    #[error("IPC error: {0}")]
    Ipc(String),

    /// The worker could not be reached and could not be respawned.
    #[error("backend down: {0}")]
    BackendDown(String),

    /// A cell execution was already in flight when another was requested.
    #[error("a cell is already running")]
    AlreadyRunning,

    /// Execution was aborted by user request (interrupt/reset).
    #[error("execution aborted")]
    Aborted,

    /// Invalid operation requested of the kernel client or session.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type for remote bridge operations.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Errors from driving the remote bridge (SSH deploy + tunnel).
#[derive(Debug, Error)]
pub enum RemoteError {
    /// SSH authentication failed (wrong password / rejected key).
    #[error("SSH authentication failed for {user}@{host}")]
    SshAuth { user: String, host: String },

    /// The configured or probed private key is not usable (missing, or
    /// rejected by the agent).
    #[error("SSH key not available: {0}")]
    KeyNotInAgent(String),

    /// Remote host rejected the connection on authorization grounds distinct
    /// from authentication (e.g. account disabled).
    #[error("permission denied connecting to {0}")]
    PermissionDenied(String),

    /// TCP/SSH handshake did not complete within the connect timeout.
    #[error("connection to {0} timed out")]
    ConnectTimeout(String),

    /// Staging or starting the worker on the remote host failed.
    #[error("deployment failed: {0}")]
    DeploymentFailure(String),

    /// Forwarded local-forward tunnel never became ready.
    #[error("tunnel did not become ready: {0}")]
    TunnelNotReady(String),

    /// Underlying IO error spawning `ssh`/`scp`.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by a `GPUProvider` implementation.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Provider rejected the request for lack of valid credentials (HTTP 401).
    #[error("authentication failed for provider {0}")]
    Auth(String),

    /// Account has insufficient funds to complete the request (HTTP 402).
    #[error("insufficient funds for provider {0}")]
    InsufficientFunds(String),

    /// Requested resource does not exist (HTTP 404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Provider-side failure that a caller may choose to retry (HTTP 5xx).
    #[error("service error ({status}): {message}")]
    ServiceError { status: u16, message: String },

    /// Provider is not configured (missing API key) for the requested call.
    #[error("provider {0} is not configured")]
    NotConfigured(String),

    /// Transport-level failure talking to the provider's API.
    #[error("transport error: {0}")]
    Transport(String),
}
