//! Forge notebook server.
//!
//! Provides the WebSocket/HTTP server that turns a Kernel Client and a
//! Session into a live, multi-client notebook.
//!
//! # Architecture
//!
//! - **Session**: in-memory notebook state plus the broadcast channel every
//!   connected client subscribes to.
//! - **Protocol**: client/server message types.
//! - **Routes**: HTTP and WebSocket handlers, the request-dispatching hub.
//!
//! LSP, a dependency graph, and an embedded browser frontend are not part
//! of this crate: the execution core is exactly the Worker
//! Process / Kernel Client / Session / Notebook Server / Remote Bridge /
//! Provider Registry components. System-metrics collection, package
//! listing, file browsing, LSP completion, and an AI-assistant chat would
//! live behind their own request/response handlers outside that core.

pub mod error;
pub mod protocol;
pub mod routes;
pub mod session;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use forge_core::{Endpoints, KernelClient, Notebook, ProviderRegistry};

pub use error::{ServerError, ServerResult};
pub use protocol::{ClientMessage, ServerMessage};
pub use routes::{create_router, AppState};
pub use session::{Session, SessionHandle};

/// Default local command/event ports (local 5555/5556; tunneled
/// 15555/15556 by convention).
pub const LOCAL_CMD_PORT: u16 = 5555;
pub const LOCAL_EVENT_PORT: u16 = 5556;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub open_browser: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            open_browser: false,
        }
    }
}

/// Locate the `forge-worker` binary: first a sibling of the running
/// executable (the layout `cargo build`/`cargo install` produce), then
/// `$PATH`.
fn resolve_worker_binary() -> ServerResult<PathBuf> {
    let exe_name = if cfg!(windows) { "forge-worker.exe" } else { "forge-worker" };

    if let Ok(current) = std::env::current_exe() {
        if let Some(dir) = current.parent() {
            let sibling = dir.join(exe_name);
            if sibling.is_file() {
                return Ok(sibling);
            }
        }
    }

    which::which(exe_name)
        .map_err(|e| ServerError::InvalidOperation(format!("forge-worker binary not found: {e}")))
}

/// Start the Forge server for a notebook at `notebook_path`. Creates an
/// empty notebook if none exists yet at that path.
pub async fn serve(notebook_path: impl AsRef<Path>, config: ServerConfig) -> ServerResult<()> {
    let path = notebook_path.as_ref();

    let session = if path.exists() {
        Session::load(path)?
    } else {
        let notebook = Notebook::empty(path.to_path_buf());
        notebook.save(None)?;
        Session::new(notebook)
    };
    let session = session.into_handle();

    let worker_binary = resolve_worker_binary()?;
    let endpoints = Endpoints {
        cmd_addr: format!("127.0.0.1:{LOCAL_CMD_PORT}").parse().unwrap(),
        event_addr: format!("127.0.0.1:{LOCAL_EVENT_PORT}").parse().unwrap(),
        local_worker_binary: Some(worker_binary),
    };
    let kernel = Arc::new(KernelClient::new(endpoints));

    let providers = Arc::new(
        ProviderRegistry::load()
            .map_err(|e| ServerError::InvalidOperation(format!("failed to load provider registry: {e}")))?,
    );

    let state = Arc::new(AppState {
        session,
        kernel,
        providers,
        pod_monitors: tokio::sync::Mutex::new(std::collections::HashMap::new()),
    });
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|_| ServerError::InvalidOperation(format!("invalid address: {}:{}", config.host, config.port)))?;

    tracing::info!("starting forge server at http://{addr}");
    if config.open_browser {
        tracing::info!("open http://{addr} in your browser");
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal");
            let _ = shutdown_tx.send(());
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        })
        .await?;

    tracing::info!("server shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3000);
        assert!(!config.open_browser);
    }
}
