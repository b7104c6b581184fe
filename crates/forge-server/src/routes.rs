//! HTTP and WebSocket routes for the Forge notebook server.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::extract::ws::{Message, WebSocket};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex as TokioMutex;
use tower_http::cors::CorsLayer;

use forge_core::{GPUProvider, KernelClient, NormalizedStatus, Output, PodMonitor, PodStatusUpdate, ProviderRegistry};

use crate::error::ServerError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::SessionHandle;

/// Application state shared across handlers.
///
/// There is no separate `kill_handle` field here:
/// `KernelClient` already owns worker lifecycle end to end (spawn, ping,
/// interrupt escalation, reset) and exposes `kill_handle()` to whoever needs
/// it directly, so a duplicate field in `AppState` would just be dead state.
pub struct AppState {
    pub session: SessionHandle,
    pub kernel: Arc<KernelClient>,
    pub providers: Arc<ProviderRegistry>,
    /// One `PodMonitor` per provider name, built lazily on first `/pods`
    /// poll and reused for the lifetime of the server.
    pub pod_monitors: TokioMutex<HashMap<String, Arc<PodMonitor>>>,
}

/// Look up (or build) the `PodMonitor` bound to `provider`, wired to
/// broadcast every update to all connected clients via the session's
/// broadcast channel, the same fan-out `NotebookUpdated`/`KernelRestarted`
/// use.
async fn pod_monitor_for(state: &Arc<AppState>, provider: Arc<dyn GPUProvider>) -> Arc<PodMonitor> {
    let name = provider.name().to_string();
    let mut monitors = state.pod_monitors.lock().await;
    if let Some(monitor) = monitors.get(&name) {
        return monitor.clone();
    }

    let session = state.session.clone();
    let callback = Arc::new(move |update: PodStatusUpdate| {
        let session = session.clone();
        tokio::spawn(async move {
            session.read().await.broadcast(ServerMessage::PodStatusUpdate {
                pod_id: update.pod_id,
                name: update.name,
                status: update.status.to_string(),
                ssh_connection: update.ssh_connection,
                ip: update.ip,
                gpu_name: update.gpu_name,
                gpu_count: update.gpu_count,
                price_hr: update.price_hr,
            });
        });
    });

    let monitor = Arc::new(PodMonitor::new(provider, callback));
    monitors.insert(name, monitor.clone());
    monitor
}

/// Create the router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/api/state", get(state_handler))
        .route("/pods", get(pods_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Current notebook snapshot, same payload a client gets on connect.
async fn state_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let notebook = state.session.read().await.snapshot();
    Json(ServerMessage::NotebookData { notebook })
}

/// Read-only snapshot of the active provider's pods, exposed for
/// connection-time display, the same role `/api/state` plays for the
/// notebook. Returns an empty list if no provider is active. As a side
/// effect, starts (or confirms already-running) a `PodMonitor` for every
/// non-terminal pod in the page, so clients that never issue an explicit
/// "watch this pod" request still see `pod_status_update` events arrive
/// over the websocket once something has looked the pod up.
async fn pods_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(provider) = state.providers.active() else {
        return Json(serde_json::json!({ "pods": [], "total": 0 }));
    };

    match provider.get_pods(None, 100, 0) {
        Ok(page) => {
            let monitor = pod_monitor_for(&state, provider).await;
            for pod in &page.pods {
                if !NormalizedStatus::normalize(&pod.status).is_terminal() {
                    monitor.start(pod.id.clone());
                }
            }
            Json(serde_json::to_value(page).unwrap_or(serde_json::Value::Null))
        }
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_websocket(socket, state))
}

type Sender = Arc<TokioMutex<SplitSink<WebSocket, Message>>>;

/// Drive one client connection: forward the session's broadcast stream and
/// dispatch inbound messages. Each inbound message is handled in its own
/// spawned task so a long-streaming `execute_cell` never blocks a later
/// `interrupt_kernel` from reaching the Kernel Client.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (sink, mut stream) = socket.split();
    let sender: Sender = Arc::new(TokioMutex::new(sink));

    let mut rx = state.session.read().await.subscribe();

    send_message(&sender, &ServerMessage::NotebookData {
        notebook: state.session.read().await.snapshot(),
    })
    .await;

    let forward_sender = sender.clone();
    let forward_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if !send_message(&forward_sender, &msg).await {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => {
                    let state = state.clone();
                    let sender = sender.clone();
                    tokio::spawn(async move {
                        handle_client_message(msg, state, sender).await;
                    });
                }
                Err(e) => {
                    tracing::warn!("failed to parse client message: {e} (input: {text})");
                    send_message(&sender, &ServerMessage::Error {
                        message: format!("invalid message: {e}"),
                    })
                    .await;
                }
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!("websocket error: {e}");
                break;
            }
            _ => {}
        }
    }

    forward_task.abort();
}

/// Returns `false` if the connection is gone, so callers can stop forwarding.
async fn send_message(sender: &Sender, msg: &ServerMessage) -> bool {
    let Ok(json) = serde_json::to_string(msg) else {
        return true;
    };
    let mut sink = sender.lock().await;
    sink.send(Message::Text(json.into())).await.is_ok()
}

async fn handle_client_message(msg: ClientMessage, state: Arc<AppState>, sender: Sender) {
    match msg {
        ClientMessage::ExecuteCell { cell_index } => {
            execute_cell(state, sender, cell_index).await;
        }

        ClientMessage::AddCell { index, kind, source, full } => {
            let result = state.session.write().await.add_cell(index, kind, source, full);
            if let Err(e) = result {
                send_message(&sender, &ServerMessage::Error { message: e.to_string() }).await;
            }
        }

        ClientMessage::DeleteCell { index } => {
            let result = state.session.write().await.delete_cell(index);
            if let Err(e) = result {
                send_message(&sender, &ServerMessage::Error { message: e.to_string() }).await;
            }
        }

        ClientMessage::MoveCell { from, to } => {
            let result = state.session.write().await.move_cell(from, to);
            if let Err(e) = result {
                send_message(&sender, &ServerMessage::Error { message: e.to_string() }).await;
            }
        }

        ClientMessage::UpdateCell { cell_index, source } => {
            let result = state.session.write().await.update_cell_source(cell_index, source);
            if let Err(e) = result {
                send_message(&sender, &ServerMessage::Error { message: e.to_string() }).await;
            }
        }

        ClientMessage::InterruptKernel { cell_index } => {
            // The completion this interrupt provokes is observed by whatever
            // task is already forwarding `execute_cell`'s event stream; we
            // never synthesize one here.
            if let Err(e) = state.kernel.interrupt(cell_index).await {
                send_message(&sender, &ServerMessage::Error { message: e.to_string() }).await;
            }
        }

        ClientMessage::ResetKernel => {
            reset_kernel(state, sender).await;
        }

        ClientMessage::LoadNotebook => {
            let notebook = state.session.read().await.snapshot();
            send_message(&sender, &ServerMessage::NotebookData { notebook }).await;
        }

        ClientMessage::SaveNotebook => {
            let result = state.session.read().await.save(None);
            match result {
                Ok(()) => {
                    let path = state.session.read().await.path().display().to_string();
                    send_message(&sender, &ServerMessage::NotebookSaved { path }).await;
                }
                Err(e) => {
                    send_message(&sender, &ServerMessage::Error { message: e.to_string() }).await;
                }
            }
        }
    }
}

async fn execute_cell(state: Arc<AppState>, sender: Sender, cell_index: u64) {
    let source = {
        let session = state.session.read().await;
        session.cell_source(cell_index as usize)
    };
    let source = match source {
        Ok(s) => s,
        Err(e) => {
            send_message(&sender, &ServerMessage::Error { message: e.to_string() }).await;
            return;
        }
    };

    let mut events = match state.kernel.execute(cell_index, source).await {
        Ok(events) => events,
        Err(forge_core::Error::AlreadyRunning) => {
            send_message(&sender, &ServerMessage::Error { message: ServerError::ExecutionInProgress.to_string() }).await;
            return;
        }
        Err(e) => {
            send_message(&sender, &ServerMessage::Error { message: e.to_string() }).await;
            return;
        }
    };

    state.session.write().await.set_executing(true);
    let mut outputs: Vec<Output> = Vec::new();

    while let Some(event) = events.recv().await {
        use forge_core::WorkerEvent;

        match event {
            WorkerEvent::ExecutionStart { execution_count, .. } => {
                send_message(&sender, &ServerMessage::ExecutionStart { cell_index, execution_count }).await;
            }

            WorkerEvent::Stream { name, text, is_progress, .. } => {
                outputs.push(Output::Stream { name: convert_stream_name(name), text: text.clone() });
                send_message(&sender, &ServerMessage::StreamOutput { cell_index, name, text, is_progress }).await;
            }

            WorkerEvent::ExecuteResult { execution_count, data_json, .. } => {
                let data = decode_data_json(&data_json);
                outputs.push(Output::ExecuteResult { execution_count, data: decode_data_map(&data_json) });
                send_message(&sender, &ServerMessage::ExecuteResult { cell_index, execution_count, data }).await;
            }

            WorkerEvent::DisplayData { data_json, .. } => {
                let data = decode_data_json(&data_json);
                outputs.push(Output::DisplayData { data: decode_data_map(&data_json) });
                send_message(&sender, &ServerMessage::DisplayData { cell_index, data }).await;
            }

            WorkerEvent::ExecutionError { error, .. } => {
                outputs.push(Output::Error {
                    ename: error.ename.clone(),
                    evalue: error.evalue.clone(),
                    traceback: error.traceback.clone(),
                });
                send_message(&sender, &ServerMessage::ExecutionError { cell_index, error }).await;
            }

            WorkerEvent::ExecutionComplete { result, .. } => {
                {
                    let mut session = state.session.write().await;
                    let _ = session.apply_execution_result(cell_index, outputs, &result);
                    session.set_executing(false);
                }
                state.kernel.mark_idle().await;
                send_message(&sender, &ServerMessage::ExecutionComplete { cell_index, result }).await;
                return;
            }

            WorkerEvent::Heartbeat { .. } => {}
        }
    }

    // Event channel closed without an `ExecutionComplete` (worker crashed
    // mid-stream with no synthesized completion upstream); don't leave the
    // session stuck thinking a cell is still running.
    state.session.write().await.set_executing(false);
}

async fn reset_kernel(state: Arc<AppState>, sender: Sender) {
    if let Err(e) = state.kernel.reset().await {
        send_message(&sender, &ServerMessage::Error { message: e.to_string() }).await;
        return;
    }

    let mut session = state.session.write().await;
    session.clear_all_outputs();
    let notebook = session.snapshot();
    session.broadcast(ServerMessage::KernelRestarted);
    session.broadcast(ServerMessage::NotebookUpdated { notebook });
}

fn convert_stream_name(name: forge_core::StreamName) -> forge_core::OutputStreamName {
    match name {
        forge_core::StreamName::Stdout => forge_core::OutputStreamName::Stdout,
        forge_core::StreamName::Stderr => forge_core::OutputStreamName::Stderr,
    }
}

/// `data_json` is a UTF-8 JSON encoding of a MIME-type -> payload map
/// (`forge_core::protocol::WorkerEvent::ExecuteResult` doc comment); decode
/// once as a generic `Value` for the outbound wire message...
fn decode_data_json(data_json: &[u8]) -> serde_json::Value {
    serde_json::from_slice(data_json).unwrap_or(serde_json::Value::Null)
}

/// ...and a second time as the typed map `Output` persists in the notebook
/// document. Small payloads, not worth sharing the parse between the two.
fn decode_data_map(data_json: &[u8]) -> HashMap<String, serde_json::Value> {
    serde_json::from_slice(data_json).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_handler_reports_ok() {
        let Json(value) = health_handler().await;
        assert_eq!(value["status"], "ok");
    }

    #[test]
    fn stream_name_conversion_matches_variant() {
        assert!(matches!(
            convert_stream_name(forge_core::StreamName::Stderr),
            forge_core::OutputStreamName::Stderr
        ));
    }

    #[tokio::test]
    async fn pods_handler_empty_without_active_provider() {
        let temp = tempfile::TempDir::new().unwrap();
        let notebook = forge_core::Notebook::empty(temp.path().join("nb.json"));
        let session = crate::session::Session::new(notebook).into_handle();
        let endpoints = forge_core::Endpoints {
            cmd_addr: "127.0.0.1:1".parse().unwrap(),
            event_addr: "127.0.0.1:1".parse().unwrap(),
            local_worker_binary: None,
        };
        let state = Arc::new(AppState {
            session,
            kernel: Arc::new(KernelClient::new(endpoints)),
            providers: Arc::new(ProviderRegistry::load().unwrap()),
            pod_monitors: TokioMutex::new(HashMap::new()),
        });

        let Json(value) = pods_handler(State(state)).await;
        assert_eq!(value["total"], 0);
    }

    #[tokio::test]
    async fn pod_monitor_is_built_once_per_provider() {
        let provider: Arc<dyn GPUProvider> = Arc::new(forge_core::LocalProcessProvider::new());

        let temp = tempfile::TempDir::new().unwrap();
        let notebook = forge_core::Notebook::empty(temp.path().join("nb.json"));
        let session = crate::session::Session::new(notebook).into_handle();
        let endpoints = forge_core::Endpoints {
            cmd_addr: "127.0.0.1:1".parse().unwrap(),
            event_addr: "127.0.0.1:1".parse().unwrap(),
            local_worker_binary: None,
        };
        let state = Arc::new(AppState {
            session,
            kernel: Arc::new(KernelClient::new(endpoints)),
            providers: Arc::new(ProviderRegistry::load().unwrap()),
            pod_monitors: TokioMutex::new(HashMap::new()),
        });

        let first = pod_monitor_for(&state, provider.clone()).await;
        let second = pod_monitor_for(&state, provider).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(state.pod_monitors.lock().await.len(), 1);
    }
}
