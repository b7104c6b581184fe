//! Integration tests driving a real `forge-worker` subprocess through
//! `KernelClient`: an infinite loop can be killed and a normal cell
//! completes under process isolation. The worker is a real TCP-addressed
//! subprocess, so these tests exercise the whole
//! spawn/execute/interrupt/reset path end to end.

use std::net::{SocketAddr, TcpListener};

use forge_core::{Endpoints, ExecutionStatus, KernelClient, WorkerEvent};

/// Binds to an ephemeral port, reads back the OS-assigned port, then drops
/// the listener so the worker process can bind it instead.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind ephemeral port");
    listener.local_addr().unwrap().port()
}

fn test_endpoints() -> Endpoints {
    let cmd_addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
    let event_addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
    Endpoints {
        cmd_addr,
        event_addr,
        local_worker_binary: Some(env!("CARGO_BIN_EXE_forge-worker").into()),
    }
}

async fn drain_until_complete(rx: &mut tokio::sync::mpsc::Receiver<WorkerEvent>) -> WorkerEvent {
    loop {
        match rx.recv().await {
            Some(event @ WorkerEvent::ExecutionComplete { .. }) => return event,
            Some(_) => continue,
            None => panic!("event channel closed before execution_complete"),
        }
    }
}

#[tokio::test]
async fn normal_execution_completes_ok() {
    let client = KernelClient::new(test_endpoints());

    let mut rx = client.execute(0, "1 + 1".to_string()).await.unwrap();
    let complete = drain_until_complete(&mut rx).await;

    match complete {
        WorkerEvent::ExecutionComplete { result, .. } => {
            assert_eq!(result.status, ExecutionStatus::Ok);
        }
        other => panic!("expected ExecutionComplete, got {other:?}"),
    }
}

#[tokio::test]
async fn namespace_persists_across_executions() {
    let client = KernelClient::new(test_endpoints());

    let mut rx = client.execute(0, "x = 41".to_string()).await.unwrap();
    drain_until_complete(&mut rx).await;
    client.mark_idle().await;

    let mut rx = client.execute(1, "x + 1".to_string()).await.unwrap();

    let mut saw_result = false;
    loop {
        match rx.recv().await {
            Some(WorkerEvent::ExecuteResult { data_json, .. }) => {
                let value: serde_json::Value = serde_json::from_slice(&data_json).unwrap();
                assert_eq!(value["text/plain"], "42");
                saw_result = true;
            }
            Some(WorkerEvent::ExecutionComplete { result, .. }) => {
                assert_eq!(result.status, ExecutionStatus::Ok);
                break;
            }
            Some(_) => continue,
            None => panic!("event channel closed before execution_complete"),
        }
    }
    assert!(saw_result, "expected an execute_result carrying the persisted value of x");
}

#[tokio::test]
async fn uncaught_exception_reports_error_status() {
    let client = KernelClient::new(test_endpoints());

    let mut rx = client.execute(0, "raise ValueError('boom')".to_string()).await.unwrap();
    let complete = drain_until_complete(&mut rx).await;

    match complete {
        WorkerEvent::ExecutionComplete { result, .. } => {
            assert_eq!(result.status, ExecutionStatus::Error);
            let error = result.error.expect("error result carries error info");
            assert_eq!(error.ename, "ValueError");
        }
        other => panic!("expected ExecutionComplete, got {other:?}"),
    }
}

#[tokio::test]
async fn shell_escape_cell_captures_stdout() {
    let client = KernelClient::new(test_endpoints());

    let mut rx = client.execute(0, "!echo hello-from-shell".to_string()).await.unwrap();

    let mut saw_stream = false;
    loop {
        match rx.recv().await {
            Some(WorkerEvent::Stream { text, .. }) => {
                if text.contains("hello-from-shell") {
                    saw_stream = true;
                }
            }
            Some(WorkerEvent::ExecutionComplete { result, .. }) => {
                assert_eq!(result.status, ExecutionStatus::Ok);
                break;
            }
            Some(_) => continue,
            None => panic!("event channel closed before execution_complete"),
        }
    }
    assert!(saw_stream, "expected the shell command's stdout to be streamed back");
}

/// A cell with no statement-chunk boundary inside its loop body can't be interrupted
/// cooperatively, so the kernel client must escalate to a hard kill once
/// `ESCALATION_TIMEOUT` elapses, and the worker must come back for the next
/// cell.
#[tokio::test]
async fn infinite_loop_is_killed_by_interrupt_escalation() {
    let client = KernelClient::new(test_endpoints());

    let mut rx = client.execute(0, "while True:\n    pass".to_string()).await.unwrap();

    // Give the worker a moment to actually enter the loop before interrupting.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    client.interrupt(Some(0)).await.unwrap();

    let complete = drain_until_complete(&mut rx).await;
    match complete {
        WorkerEvent::ExecutionComplete { result, .. } => {
            assert_eq!(result.status, ExecutionStatus::Error);
        }
        other => panic!("expected ExecutionComplete, got {other:?}"),
    }

    // A fresh cell on the same client must still work: escalation respawns
    // the worker rather than leaving the client stuck.
    let mut rx = client.execute(1, "1 + 1".to_string()).await.unwrap();
    let complete = drain_until_complete(&mut rx).await;
    match complete {
        WorkerEvent::ExecutionComplete { result, .. } => {
            assert_eq!(result.status, ExecutionStatus::Ok);
        }
        other => panic!("expected ExecutionComplete, got {other:?}"),
    }
}

#[tokio::test]
async fn reset_kernel_clears_execution_counter() {
    let client = KernelClient::new(test_endpoints());

    let mut rx = client.execute(0, "1".to_string()).await.unwrap();
    drain_until_complete(&mut rx).await;
    client.mark_idle().await;

    client.reset().await.unwrap();

    let mut rx = client.execute(0, "1".to_string()).await.unwrap();
    let complete = drain_until_complete(&mut rx).await;
    match complete {
        WorkerEvent::ExecutionComplete { result, .. } => {
            assert_eq!(result.execution_count, 1, "execution counter should restart from 1 after reset");
        }
        other => panic!("expected ExecutionComplete, got {other:?}"),
    }
}
