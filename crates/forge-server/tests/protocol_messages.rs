//! Integration tests for the WebSocket protocol message types.
//!
//! Exercises every `ClientMessage`/`ServerMessage` variant's JSON shape end
//! to end: each variant is serialized, checked for its expected `type` tag,
//! and deserialized back to confirm the discriminant survives the round trip.

use forge_core::{CellKind, ErrorInfo, ExecutionResultInfo, ExecutionStatus, Notebook, StreamName};
use forge_server::protocol::{ClientMessage, ServerMessage};

#[test]
fn test_all_client_messages_serialize() {
    let messages = vec![
        ClientMessage::ExecuteCell { cell_index: 0 },
        ClientMessage::AddCell {
            index: 0,
            kind: CellKind::Code,
            source: "x = 1".to_string(),
            full: None,
        },
        ClientMessage::DeleteCell { index: 0 },
        ClientMessage::MoveCell { from: 0, to: 1 },
        ClientMessage::UpdateCell { cell_index: 0, source: "y = 2".to_string() },
        ClientMessage::InterruptKernel { cell_index: Some(3) },
        ClientMessage::InterruptKernel { cell_index: None },
        ClientMessage::ResetKernel,
        ClientMessage::LoadNotebook,
        ClientMessage::SaveNotebook,
    ];

    for msg in messages {
        let json = serde_json::to_string(&msg).expect("failed to serialize");

        let msg_type = match &msg {
            ClientMessage::ExecuteCell { .. } => "execute_cell",
            ClientMessage::AddCell { .. } => "add_cell",
            ClientMessage::DeleteCell { .. } => "delete_cell",
            ClientMessage::MoveCell { .. } => "move_cell",
            ClientMessage::UpdateCell { .. } => "update_cell",
            ClientMessage::InterruptKernel { .. } => "interrupt_kernel",
            ClientMessage::ResetKernel => "reset_kernel",
            ClientMessage::LoadNotebook => "load_notebook",
            ClientMessage::SaveNotebook => "save_notebook",
        };
        assert!(
            json.contains(&format!("\"type\":\"{msg_type}\"")),
            "message type '{msg_type}' not found in JSON: {json}"
        );

        let parsed: ClientMessage = serde_json::from_str(&json).expect("failed to deserialize");
        assert_eq!(
            std::mem::discriminant(&msg),
            std::mem::discriminant(&parsed),
            "variant mismatch for {msg_type}"
        );
    }
}

#[test]
fn test_all_server_messages_serialize() {
    let notebook = Notebook::empty(std::path::PathBuf::from("notebook.json"));
    let messages = vec![
        ServerMessage::NotebookData { notebook: notebook.clone() },
        ServerMessage::NotebookUpdated { notebook: notebook.clone() },
        ServerMessage::NotebookSaved { path: "notebook.json".to_string() },
        ServerMessage::ExecutionStart { cell_index: 0, execution_count: 1 },
        ServerMessage::StreamOutput {
            cell_index: 0,
            name: StreamName::Stdout,
            text: "hello\n".to_string(),
            is_progress: false,
        },
        ServerMessage::ExecuteResult {
            cell_index: 0,
            execution_count: 1,
            data: serde_json::json!({"text/plain": "1"}),
        },
        ServerMessage::DisplayData {
            cell_index: 0,
            data: serde_json::json!({"text/plain": "figure"}),
        },
        ServerMessage::ExecutionError {
            cell_index: 0,
            error: ErrorInfo {
                ename: "ValueError".to_string(),
                evalue: "bad value".to_string(),
                traceback: vec!["line 1".to_string()],
            },
        },
        ServerMessage::ExecutionComplete {
            cell_index: 0,
            result: ExecutionResultInfo {
                status: ExecutionStatus::Ok,
                execution_count: 1,
                execution_time_ms: 12,
                error: None,
            },
        },
        ServerMessage::KernelRestarted,
        ServerMessage::PodStatusUpdate {
            pod_id: "pod-1".to_string(),
            name: "training".to_string(),
            status: "active".to_string(),
            ssh_connection: Some("ssh user@host".to_string()),
            ip: Some("10.0.0.1".to_string()),
            gpu_name: "A100".to_string(),
            gpu_count: 1,
            price_hr: 1.5,
        },
        ServerMessage::Error { message: "oops".to_string() },
    ];

    for msg in messages {
        let json = serde_json::to_string(&msg).expect("failed to serialize");

        let msg_type = match &msg {
            ServerMessage::NotebookData { .. } => "notebook_data",
            ServerMessage::NotebookUpdated { .. } => "notebook_updated",
            ServerMessage::NotebookSaved { .. } => "notebook_saved",
            ServerMessage::ExecutionStart { .. } => "execution_start",
            ServerMessage::StreamOutput { .. } => "stream_output",
            ServerMessage::ExecuteResult { .. } => "execute_result",
            ServerMessage::DisplayData { .. } => "display_data",
            ServerMessage::ExecutionError { .. } => "execution_error",
            ServerMessage::ExecutionComplete { .. } => "execution_complete",
            ServerMessage::KernelRestarted => "kernel_restarted",
            ServerMessage::PodStatusUpdate { .. } => "pod_status_update",
            ServerMessage::Error { .. } => "error",
        };
        assert!(
            json.contains(&format!("\"type\":\"{msg_type}\"")),
            "message type '{msg_type}' not found in JSON: {json}"
        );

        let parsed: ServerMessage = serde_json::from_str(&json).expect("failed to deserialize");
        assert_eq!(
            std::mem::discriminant(&msg),
            std::mem::discriminant(&parsed),
            "variant mismatch for {msg_type}"
        );
    }
}

#[test]
fn add_cell_round_trips_a_full_cell_for_undo() {
    let cell = forge_core::Cell::new_code("z = 3".to_string());
    let msg = ClientMessage::AddCell {
        index: 0,
        kind: CellKind::Code,
        source: String::new(),
        full: Some(cell.clone()),
    };

    let json = serde_json::to_string(&msg).unwrap();
    let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
    match parsed {
        ClientMessage::AddCell { full: Some(restored), .. } => {
            assert_eq!(restored.id, cell.id);
            assert_eq!(restored.source, cell.source);
        }
        other => panic!("expected AddCell with a restored cell, got {other:?}"),
    }
}
