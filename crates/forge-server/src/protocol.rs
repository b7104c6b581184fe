//! WebSocket protocol messages for the Forge notebook server.
//!
//! A single `#[serde(tag = "type", rename_all = "snake_case")]` envelope
//! covering the full message set: cell CRUD
//! (`AddCell`/`DeleteCell`/`MoveCell`/`UpdateCell`), execution control
//! (`ExecuteCell`/`InterruptKernel`/`ResetKernel`), persistence
//! (`LoadNotebook`/`SaveNotebook`), and the server-pushed events
//! (`PodStatusUpdate`, `KernelRestarted`, streamed execution output).
//!
//! Cells are addressed by their position in `Notebook::cells`
//! (`cell_index: u64`), matching the worker protocol's addressing rather
//! than by `CellId` — the identifier exists to survive edits, not to name a
//! slot on the wire.

use serde::{Deserialize, Serialize};

use forge_core::{CellKind, ErrorInfo, ExecutionResultInfo, Notebook, StreamName};

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Run the cell at `cell_index` through the Kernel Client.
    ExecuteCell { cell_index: u64 },

    /// Insert a new cell of `kind` at `index`. `full` restores a
    /// previously-serialized cell verbatim instead
    /// of generating a fresh identifier.
    AddCell {
        index: usize,
        kind: CellKind,
        source: String,
        #[serde(default)]
        full: Option<forge_core::Cell>,
    },

    /// Remove the cell at `index`.
    DeleteCell { index: usize },

    /// Move the cell at `from` to `to`.
    MoveCell { from: usize, to: usize },

    /// Edit a cell's source in place, no broadcast.
    UpdateCell { cell_index: usize, source: String },

    /// Abort the cell matching `cell_index`, or whichever is running if
    /// `cell_index` is absent.
    InterruptKernel { cell_index: Option<u64> },

    /// Tear down and respawn the worker, clearing all outputs.
    ResetKernel,

    /// Return the current snapshot to the caller only (no broadcast).
    LoadNotebook,

    /// Persist the session's notebook to disk.
    SaveNotebook,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full notebook snapshot, sent on connect and after structural edits.
    NotebookData { notebook: Notebook },

    /// Structural edit broadcast to every connected client.
    NotebookUpdated { notebook: Notebook },

    /// Acknowledges a completed `save_notebook`.
    NotebookSaved { path: String },

    /// A cell began executing.
    ExecutionStart { cell_index: u64, execution_count: u64 },

    /// Incremental stdout/stderr for a running cell.
    StreamOutput {
        cell_index: u64,
        name: StreamName,
        text: String,
        is_progress: bool,
    },

    /// The last expression's displayable value.
    ExecuteResult {
        cell_index: u64,
        execution_count: u64,
        data: serde_json::Value,
    },

    /// A side-effect display payload (e.g. a captured figure).
    DisplayData { cell_index: u64, data: serde_json::Value },

    /// An uncaught exception, shell non-zero exit, or interrupt.
    ExecutionError { cell_index: u64, error: ErrorInfo },

    /// Terminal event for one `execute_cell`.
    ExecutionComplete { cell_index: u64, result: ExecutionResultInfo },

    /// The kernel was torn down and respawned (explicit reset).
    KernelRestarted,

    /// Normalized pod status, polled by the Provider Registry's monitor.
    PodStatusUpdate {
        pod_id: String,
        name: String,
        status: String,
        ssh_connection: Option<String>,
        ip: Option<String>,
        gpu_name: String,
        gpu_count: u32,
        price_hr: f64,
    },

    /// Generic error report not tied to a specific cell (malformed request,
    /// I/O failure on save, etc).
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_tag_is_snake_case() {
        let msg = ClientMessage::ExecuteCell { cell_index: 3 };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"execute_cell\""));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientMessage::ExecuteCell { cell_index } => assert_eq!(cell_index, 3),
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn server_message_outbound_tags_use_expected_names() {
        let cases: Vec<(ServerMessage, &str)> = vec![
            (ServerMessage::KernelRestarted, "kernel_restarted"),
            (ServerMessage::NotebookSaved { path: "nb.json".into() }, "notebook_saved"),
            (ServerMessage::Error { message: "oops".into() }, "error"),
        ];
        for (msg, tag) in cases {
            let json = serde_json::to_string(&msg).unwrap();
            assert!(json.contains(&format!("\"type\":\"{tag}\"")), "{json}");
        }
    }

    #[test]
    fn interrupt_kernel_accepts_missing_cell_index() {
        let json = r#"{"type":"interrupt_kernel","cell_index":null}"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(parsed, ClientMessage::InterruptKernel { cell_index: None }));
    }
}
