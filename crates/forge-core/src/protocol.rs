//! Worker protocol: the command channel (request/reply) and event channel
//! (worker → client publish).
//!
//! Both channels share one framing: a 4-byte little-endian length prefix
//! followed by a `bincode`-encoded message, with a 100MB sanity cap on
//! decode size, carried over TCP sockets rather than stdio pipes so the
//! exact same framing works whether the worker is local (loopback) or
//! remote (through an SSH-forwarded tunnel).
//!
//! The worker side (blocking, single-threaded) uses [`write_message`] /
//! [`read_message`] over `std::io`. The client side (`forge-core::kernel`)
//! uses [`write_message_async`] / [`read_message_async`] over
//! `tokio::io`.

use std::io::{Read, Write};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reject absurdly large frames before allocating a buffer for them.
pub const MAX_MESSAGE_BYTES: u32 = 100 * 1024 * 1024;

/// Commands sent from the client (Kernel Client or, during bring-up, a
/// liveness probe) to the worker over the command channel. Strictly
/// request/reply, one outstanding request at a time.
#[derive(Debug, Clone, Encode, Decode)]
pub enum WorkerCommand {
    /// Liveness probe.
    Ping,

    /// Run `code` as cell `cell_index`, stamped with `execution_count`.
    /// The reply is sent only after the cell completes; progress is
    /// reported entirely on the event channel.
    ExecuteCell {
        code: String,
        cell_index: u64,
        execution_count: u64,
    },

    /// Abort the currently running cell if it matches `cell_index` (or if
    /// `cell_index` is `None`); a no-op otherwise.
    Interrupt { cell_index: Option<u64> },

    /// Drain and exit.
    Shutdown,
}

/// Reply to a `WorkerCommand`. Every command gets exactly one reply.
#[derive(Debug, Clone, Encode, Decode)]
pub enum WorkerReply {
    /// `Ping` / `ExecuteCell` / `Interrupt` / `Shutdown` succeeded.
    Ok { pid: u32 },

    /// The command itself was malformed or could not be serviced; the
    /// worker remains alive.
    Error { message: String },
}

/// Also carries `serde` derives (unlike `WorkerCommand`/`WorkerEvent`,
/// which only cross the bincode-framed worker channels): this type is
/// embedded verbatim in `forge_server::protocol::ServerMessage`, the
/// JSON-framed client-facing envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Encode, Decode, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Encode, Decode, Serialize, Deserialize)]
pub struct ExecutionResultInfo {
    pub status: ExecutionStatus,
    pub execution_count: u64,
    pub execution_time_ms: u64,
    pub error: Option<ErrorInfo>,
}

/// Events published by the worker on the event channel during and between
/// `ExecuteCell` commands.
#[derive(Debug, Clone, Encode, Decode)]
pub enum WorkerEvent {
    /// Emitted before running any user code for a cell.
    ExecutionStart { cell_index: u64, execution_count: u64 },

    /// Incremental stdout/stderr. `is_progress` is set for a `\r`-terminated
    /// segment that should replace the previous progress tick rather than
    /// append.
    Stream {
        cell_index: u64,
        name: StreamName,
        text: String,
        is_progress: bool,
    },

    /// The last expression's displayable value. `data_json` is a UTF-8 JSON
    /// encoding of a `HashMap<String, serde_json::Value>` (MIME type ->
    /// payload), carried as an opaque byte blob across the wire rather than
    /// teaching `bincode` to encode arbitrary `serde_json::Value`.
    ExecuteResult {
        cell_index: u64,
        execution_count: u64,
        data_json: Vec<u8>,
    },

    /// A side-effect output (e.g. a captured figure), same `data_json`
    /// convention as `ExecuteResult`.
    DisplayData { cell_index: u64, data_json: Vec<u8> },

    /// An uncaught exception (or shell non-zero exit, or interrupt).
    ExecutionError { cell_index: u64, error: ErrorInfo },

    /// Terminal event for a cell execution. Exactly one per `ExecuteCell`.
    ExecutionComplete {
        cell_index: u64,
        result: ExecutionResultInfo,
    },

    /// Emitted at most every 5s while idle so the client can detect death.
    Heartbeat { ts_unix_ms: u64 },
}

/// Write a message to a blocking writer using length-prefixed bincode
/// encoding. Used worker-side.
pub fn write_message<W: Write, T: Encode>(writer: &mut W, message: &T) -> Result<()> {
    let config = bincode::config::standard();
    let bytes = bincode::encode_to_vec(message, config)
        .map_err(|e| Error::Serialization(format!("failed to encode message: {e}")))?;

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("failed to write message length: {e}")))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("failed to write message body: {e}")))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("failed to flush stream: {e}")))?;

    Ok(())
}

/// Read a message from a blocking reader using length-prefixed bincode
/// encoding. Used worker-side.
pub fn read_message<R: Read, T: Decode<()>>(reader: &mut R) -> Result<T> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| Error::Ipc(format!("failed to read message length: {e}")))?;
    let len = u32::from_le_bytes(len_bytes);

    if len > MAX_MESSAGE_BYTES {
        return Err(Error::Ipc(format!("message too large: {len} bytes")));
    }

    let mut bytes = vec![0u8; len as usize];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("failed to read message body: {e}")))?;

    let config = bincode::config::standard();
    let (message, _) = bincode::decode_from_slice(&bytes, config)
        .map_err(|e| Error::Serialization(format!("failed to decode message: {e}")))?;

    Ok(message)
}

/// Async counterpart of [`write_message`], used client-side by
/// `forge-core::kernel` over `tokio::net::TcpStream`.
pub async fn write_message_async<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Encode,
{
    use tokio::io::AsyncWriteExt;

    let config = bincode::config::standard();
    let bytes = bincode::encode_to_vec(message, config)
        .map_err(|e| Error::Serialization(format!("failed to encode message: {e}")))?;

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| Error::Ipc(format!("failed to write message length: {e}")))?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| Error::Ipc(format!("failed to write message body: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Ipc(format!("failed to flush stream: {e}")))?;

    Ok(())
}

/// Async counterpart of [`read_message`].
pub async fn read_message_async<R, T>(reader: &mut R) -> Result<T>
where
    R: tokio::io::AsyncRead + Unpin,
    T: Decode<()>,
{
    use tokio::io::AsyncReadExt;

    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| Error::Ipc(format!("failed to read message length: {e}")))?;
    let len = u32::from_le_bytes(len_bytes);

    if len > MAX_MESSAGE_BYTES {
        return Err(Error::Ipc(format!("message too large: {len} bytes")));
    }

    let mut bytes = vec![0u8; len as usize];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| Error::Ipc(format!("failed to read message body: {e}")))?;

    let config = bincode::config::standard();
    let (message, _) = bincode::decode_from_slice(&bytes, config)
        .map_err(|e| Error::Serialization(format!("failed to decode message: {e}")))?;

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn command_roundtrip() {
        let cmd = WorkerCommand::ExecuteCell {
            code: "x = 1\nx + 1".to_string(),
            cell_index: 0,
            execution_count: 1,
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &cmd).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: WorkerCommand = read_message(&mut cursor).unwrap();

        match decoded {
            WorkerCommand::ExecuteCell {
                code,
                cell_index,
                execution_count,
            } => {
                assert_eq!(code, "x = 1\nx + 1");
                assert_eq!(cell_index, 0);
                assert_eq!(execution_count, 1);
            }
            _ => panic!("wrong command type"),
        }
    }

    #[test]
    fn interrupt_roundtrip_with_and_without_target() {
        for cmd in [
            WorkerCommand::Interrupt { cell_index: Some(3) },
            WorkerCommand::Interrupt { cell_index: None },
        ] {
            let mut buf = Vec::new();
            write_message(&mut buf, &cmd).unwrap();
            let mut cursor = Cursor::new(buf);
            let _decoded: WorkerCommand = read_message(&mut cursor).unwrap();
        }
    }

    #[test]
    fn event_roundtrip() {
        let event = WorkerEvent::ExecutionComplete {
            cell_index: 2,
            result: ExecutionResultInfo {
                status: ExecutionStatus::Error,
                execution_count: 5,
                execution_time_ms: 12,
                error: Some(ErrorInfo {
                    ename: "ZeroDivisionError".to_string(),
                    evalue: "division by zero".to_string(),
                    traceback: vec!["line 1".to_string()],
                }),
            },
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &event).unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded: WorkerEvent = read_message(&mut cursor).unwrap();

        match decoded {
            WorkerEvent::ExecutionComplete { cell_index, result } => {
                assert_eq!(cell_index, 2);
                assert_eq!(result.status, ExecutionStatus::Error);
                assert_eq!(result.error.unwrap().ename, "ZeroDivisionError");
            }
            _ => panic!("wrong event type"),
        }
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_MESSAGE_BYTES + 1).to_le_bytes());
        let mut cursor = Cursor::new(buf);
        let result: Result<WorkerCommand> = read_message(&mut cursor);
        assert!(matches!(result, Err(Error::Ipc(_))));
    }

    #[tokio::test]
    async fn async_roundtrip_over_duplex_stream() {
        let (mut client, mut worker) = tokio::io::duplex(4096);

        let cmd = WorkerCommand::Ping;
        write_message_async(&mut client, &cmd).await.unwrap();
        let decoded: WorkerCommand = read_message_async(&mut worker).await.unwrap();
        assert!(matches!(decoded, WorkerCommand::Ping));
    }
}
