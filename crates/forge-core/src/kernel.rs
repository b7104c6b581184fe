//! The in-server façade that owns the worker's command/event channels and
//! serializes execution.
//!
//! `KernelClient::execute` returns a lazy, finite, non-restartable stream of
//! [`WorkerEvent`]s terminated by `ExecutionComplete`, rather than one final
//! value. The
//! kill handle is guarded separately from the execute-in-progress lock so
//! an interrupt or a hard kill can always reach the worker even while a
//! cell is mid-execution.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::protocol::{
    read_message_async, write_message_async, ErrorInfo, ExecutionResultInfo, ExecutionStatus,
    WorkerCommand, WorkerEvent, WorkerReply,
};

/// `idle → spawning → ready → running → {ready | draining}`.
/// `draining` occurs on interrupt escalation or reset, leading back to
/// `spawning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    Idle,
    Spawning,
    Ready,
    Running,
    Draining,
}

impl std::fmt::Display for KernelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Spawning => "spawning",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Draining => "draining",
        };
        write!(f, "{s}")
    }
}

/// Where the command/event channels currently point. Local endpoints spawn
/// and own a child process directly; remote endpoints are a forwarded SSH
/// tunnel owned by `RemoteBridge`, which is responsible for tearing down its
/// own child process on disconnect (this struct only holds the socket
/// addresses).
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub cmd_addr: SocketAddr,
    pub event_addr: SocketAddr,
    /// `None` for remote endpoints: the worker's lifecycle is owned by
    /// `RemoteBridge`/the pod, not by this client.
    pub local_worker_binary: Option<std::path::PathBuf>,
}

struct SpawnedWorker {
    cmd: BufWriterHalf,
    cmd_reader: BufReaderHalf,
}

type BufWriterHalf = BufWriter<tokio::net::tcp::OwnedWriteHalf>;
type BufReaderHalf = BufReader<tokio::net::tcp::OwnedReadHalf>;
type EventReader = BufReader<TcpStream>;

/// Holds the worker's single, long-lived event connection so it can be
/// handed out to one `execute()` call at a time and handed back afterward,
/// the same "clonable out from under the lock" shape as [`KillHandle`].
/// The worker accepts exactly one event connection for its whole lifetime
/// (`forge-worker::main`), so this must be reused across cells rather than
/// reconnected per cell.
#[derive(Clone)]
struct EventReaderHandle {
    inner: Arc<Mutex<Option<EventReader>>>,
}

impl EventReaderHandle {
    fn empty() -> Self {
        Self { inner: Arc::new(Mutex::new(None)) }
    }

    async fn set(&self, reader: Option<EventReader>) {
        *self.inner.lock().await = reader;
    }

    async fn take(&self) -> Option<EventReader> {
        self.inner.lock().await.take()
    }
}

/// Thread-safe kill handle clonable out from under the execute-in-progress
/// lock, so interrupt can reach the worker without contending with the
/// Session's write lock.
#[derive(Clone)]
pub struct KillHandle {
    inner: Arc<Mutex<Option<Child>>>,
}

impl KillHandle {
    fn empty() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    async fn set(&self, child: Option<Child>) {
        *self.inner.lock().await = child;
    }

    /// Forcibly terminate the worker process, if any is tracked (no-op for
    /// remote endpoints, where the pod owns the process).
    pub async fn kill(&self) {
        if let Some(mut child) = self.inner.lock().await.take() {
            let _ = child.kill().await;
        }
    }
}

const ESCALATION_TIMEOUT: Duration = Duration::from_secs(5);
const PING_TIMEOUT: Duration = Duration::from_secs(2);
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The in-server façade that owns the worker's channels. One instance per `Session`.
pub struct KernelClient {
    endpoints: ArcSwap<Endpoints>,
    worker: Mutex<Option<SpawnedWorker>>,
    event_reader: EventReaderHandle,
    spawn_lock: Mutex<()>,
    state: Mutex<KernelState>,
    current_kill: KillHandle,
    execution_count: AtomicU64,
}

impl KernelClient {
    pub fn new(endpoints: Endpoints) -> Self {
        Self {
            endpoints: ArcSwap::from_pointee(endpoints),
            worker: Mutex::new(None),
            event_reader: EventReaderHandle::empty(),
            spawn_lock: Mutex::new(()),
            state: Mutex::new(KernelState::Idle),
            current_kill: KillHandle::empty(),
            execution_count: AtomicU64::new(0),
        }
    }

    pub fn current_state(&self) -> KernelState {
        // Best-effort snapshot; exact value is racy by nature of being a
        // live state machine.
        self.state.try_lock().map(|g| *g).unwrap_or(KernelState::Running)
    }

    /// A handle the Session can hold onto across the write lock boundary so
    /// `interrupt_kernel` can reach the worker without waiting on execute.
    pub fn kill_handle(&self) -> KillHandle {
        self.current_kill.clone()
    }

    /// Atomically point this client at new endpoints (used by `RemoteBridge`
    /// on connect/disconnect). Does not touch any worker already spawned
    /// against the old endpoints; callers should `reset()` first if one
    /// should be torn down.
    pub fn swap_endpoints(&self, endpoints: Endpoints) {
        self.endpoints.store(Arc::new(endpoints));
    }

    pub fn endpoints(&self) -> Arc<Endpoints> {
        self.endpoints.load_full()
    }

    /// Ensure a worker is alive and responding to `Ping`, spawning or
    /// respawning one if not. Idempotent under concurrent callers via
    /// `spawn_lock`.
    async fn ensure_ready(&self) -> Result<()> {
        let _guard = self.spawn_lock.lock().await;

        if self.probe_alive().await {
            return Ok(());
        }

        *self.state.lock().await = KernelState::Spawning;
        self.spawn_worker().await?;
        *self.state.lock().await = KernelState::Ready;
        Ok(())
    }

    async fn probe_alive(&self) -> bool {
        let mut worker = self.worker.lock().await;
        let Some(spawned) = worker.as_mut() else {
            return false;
        };

        let ping = write_message_async(&mut spawned.cmd, &WorkerCommand::Ping);
        let probe = tokio::time::timeout(PING_TIMEOUT, async {
            ping.await?;
            read_message_async::<_, WorkerReply>(&mut spawned.cmd_reader).await
        })
        .await;

        matches!(probe, Ok(Ok(WorkerReply::Ok { .. })))
    }

    async fn spawn_worker(&self) -> Result<()> {
        let endpoints = self.endpoints.load_full();

        self.current_kill.kill().await;
        *self.worker.lock().await = None;

        let child = if let Some(binary) = &endpoints.local_worker_binary {
            let child = Command::new(binary)
                .arg("--cmd-port")
                .arg(endpoints.cmd_addr.port().to_string())
                .arg("--event-port")
                .arg(endpoints.event_addr.port().to_string())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| Error::Ipc(format!("failed to spawn worker process: {e}")))?;
            Some(child)
        } else {
            // Remote endpoints: the worker is already running on the pod;
            // nothing to spawn here, only to connect to. The kill handle
            // stays empty: the pod owns its own lifecycle.
            None
        };

        let cmd_stream = Self::connect_with_retry(endpoints.cmd_addr).await?;
        let (cmd_read, cmd_write) = cmd_stream.into_split();

        // The worker accepts exactly one event connection for its whole
        // lifetime, so it must be opened once here (alongside the command
        // connection) and reused by every `execute()` call, never reopened
        // per cell.
        let event_stream = Self::connect_with_retry(endpoints.event_addr).await?;
        self.event_reader.set(Some(BufReader::new(event_stream))).await;

        self.current_kill.set(child).await;

        *self.worker.lock().await = Some(SpawnedWorker {
            cmd: BufWriter::new(cmd_write),
            cmd_reader: BufReader::new(cmd_read),
        });

        Ok(())
    }

    async fn connect_with_retry(addr: SocketAddr) -> Result<TcpStream> {
        let mut last_err = None;
        for attempt in 0..20u32 {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(50 * (attempt as u64 + 1))).await;
                }
            }
        }
        Err(Error::Ipc(format!(
            "failed to connect to worker at {addr}: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Run `source` as `cell_index`, returning a bounded channel of events
    /// terminated by exactly one `ExecutionComplete`. Consumers
    /// receive on this channel like a stream; a background task owns the
    /// worker's event socket and forwards into it.
    ///
    /// The channel has a small capacity; a superseded `Stream { is_progress:
    /// true, .. }` tick is dropped under backpressure rather than queued, but
    /// boundary events (`ExecutionStart`/`ExecuteResult`/`DisplayData`/
    /// `ExecutionError`/`ExecutionComplete`) are never dropped.
    pub async fn execute(
        &self,
        cell_index: u64,
        source: String,
    ) -> Result<mpsc::Receiver<WorkerEvent>> {
        {
            let state = *self.state.lock().await;
            if state == KernelState::Running {
                return Err(Error::AlreadyRunning);
            }
        }

        if self.ensure_ready().await.is_err() {
            let (tx, rx) = mpsc::channel(2);
            send_synth_error(&tx, cell_index, "BackendDown", "worker unreachable").await;
            *self.state.lock().await = KernelState::Ready;
            return Ok(rx);
        }

        *self.state.lock().await = KernelState::Running;
        let execution_count = self.execution_count.fetch_add(1, Ordering::SeqCst) + 1;

        let mut worker = self.worker.lock().await;
        let spawned = worker.as_mut().ok_or_else(|| Error::BackendDown("no worker".into()))?;

        let sent = write_message_async(
            &mut spawned.cmd,
            &WorkerCommand::ExecuteCell {
                code: source,
                cell_index,
                execution_count,
            },
        )
        .await;
        drop(worker);

        if sent.is_err() {
            let (tx, rx) = mpsc::channel(2);
            send_synth_error(&tx, cell_index, "BackendDown", "failed to send command").await;
            *self.state.lock().await = KernelState::Ready;
            return Ok(rx);
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let event_addr = self.endpoints.load_full().event_addr;
        match self.event_reader.take().await {
            Some(reader) => {
                tokio::spawn(forward_events(reader, cell_index, tx, self.event_reader.clone(), event_addr));
            }
            None => {
                send_synth_error(&tx, cell_index, "BackendDown", "event channel unavailable").await;
                *self.state.lock().await = KernelState::Ready;
            }
        }

        Ok(rx)
    }

    /// Mark execution finished, returning to `Ready`. Called by the
    /// session-layer forwarder once it observes `ExecutionComplete`.
    pub async fn mark_idle(&self) {
        let mut state = self.state.lock().await;
        if *state == KernelState::Running {
            *state = KernelState::Ready;
        }
    }

    /// Send `interrupt` out-of-band, then escalate to a tear-down/respawn if
    /// the worker hasn't completed within `ESCALATION_TIMEOUT`.
    /// Returns once either the worker acknowledges or escalation has fired;
    /// the actual `execution_complete{status=error}` still arrives on the
    /// execute's own event stream.
    ///
    /// A no-op, returning `Ok(())` without touching the worker, when no cell
    /// is currently running: otherwise the command would sit in the
    /// worker's interrupt channel and abort whichever cell runs next.
    pub async fn interrupt(&self, cell_index: Option<u64>) -> Result<()> {
        if *self.state.lock().await != KernelState::Running {
            return Ok(());
        }

        {
            let mut worker = self.worker.lock().await;
            if let Some(spawned) = worker.as_mut() {
                let _ = write_message_async(&mut spawned.cmd, &WorkerCommand::Interrupt { cell_index })
                    .await;
            } else {
                return Ok(());
            }
        }

        let deadline = tokio::time::sleep(ESCALATION_TIMEOUT);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    self.escalate_interrupt().await;
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {
                    if *self.state.lock().await != KernelState::Running {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn escalate_interrupt(&self) {
        *self.state.lock().await = KernelState::Draining;
        self.current_kill.kill().await;
        let mut worker = self.worker.lock().await;
        *worker = None;
        drop(worker);
        self.event_reader.set(None).await;
        *self.state.lock().await = KernelState::Idle;
    }

    /// Tear down the worker and respawn a fresh one, clearing the internal
    /// execution counter.
    pub async fn reset(&self) -> Result<()> {
        *self.state.lock().await = KernelState::Draining;
        self.current_kill.kill().await;
        *self.worker.lock().await = None;
        self.event_reader.set(None).await;
        self.execution_count.store(0, Ordering::SeqCst);

        *self.state.lock().await = KernelState::Spawning;
        self.spawn_worker().await?;
        *self.state.lock().await = KernelState::Ready;
        Ok(())
    }
}

/// Drain events for one cell off the worker's single, long-lived event
/// connection, then hand the connection back for the next cell to reuse
/// (or, if the connection died, try to reopen it so the worker doesn't
/// lose its event stream for the rest of the session).
async fn forward_events(
    mut reader: EventReader,
    cell_index: u64,
    tx: mpsc::Sender<WorkerEvent>,
    event_reader: EventReaderHandle,
    event_addr: SocketAddr,
) {
    let mut pending_progress: Option<WorkerEvent> = None;

    let healthy = loop {
        let event: Result<WorkerEvent> = read_message_async(&mut reader).await;
        let event = match event {
            Ok(e) => e,
            Err(_) => {
                let _ = flush_pending(&tx, &mut pending_progress).await;
                send_synth_error(&tx, cell_index, "ConnectionLost", "event stream closed").await;
                break false;
            }
        };

        let is_progress_tick = matches!(
            &event,
            WorkerEvent::Stream { is_progress: true, .. }
        );

        if is_progress_tick {
            pending_progress = Some(event);
            if tx.capacity() == 0 {
                // Under backpressure: coalesce by keeping only the latest
                // tick, never queuing a second one.
                continue;
            }
            if flush_pending(&tx, &mut pending_progress).await.is_err() {
                break true;
            }
            continue;
        }

        if flush_pending(&tx, &mut pending_progress).await.is_err() {
            break true;
        }

        let is_complete = matches!(event, WorkerEvent::ExecutionComplete { .. });
        if tx.send(event).await.is_err() {
            break true;
        }
        if is_complete {
            break true;
        }
    };

    if healthy {
        event_reader.set(Some(reader)).await;
    } else if let Ok(stream) = KernelClient::connect_with_retry(event_addr).await {
        event_reader.set(Some(BufReader::new(stream))).await;
    }
}

async fn flush_pending(
    tx: &mpsc::Sender<WorkerEvent>,
    pending: &mut Option<WorkerEvent>,
) -> std::result::Result<(), ()> {
    if let Some(event) = pending.take() {
        if tx.send(event).await.is_err() {
            return Err(());
        }
    }
    Ok(())
}

/// Send the reconnect-policy pair the client synthesizes for a cell whose
/// completion went missing: an `execution_error` followed by an
/// `execution_complete`. Best-effort; a full channel here means the
/// receiver already gave up.
async fn send_synth_error(tx: &mpsc::Sender<WorkerEvent>, cell_index: u64, ename: &str, evalue: &str) {
    let error = ErrorInfo {
        ename: ename.to_string(),
        evalue: evalue.to_string(),
        traceback: Vec::new(),
    };
    let _ = tx
        .send(WorkerEvent::ExecutionError { cell_index, error: error.clone() })
        .await;
    let _ = tx
        .send(WorkerEvent::ExecutionComplete {
            cell_index,
            result: ExecutionResultInfo {
                status: ExecutionStatus::Error,
                execution_count: 0,
                execution_time_ms: 0,
                error: Some(error),
            },
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_state_display() {
        assert_eq!(KernelState::Idle.to_string(), "idle");
        assert_eq!(KernelState::Draining.to_string(), "draining");
    }

    #[tokio::test]
    async fn execute_while_running_is_already_running() {
        let endpoints = Endpoints {
            cmd_addr: "127.0.0.1:1".parse().unwrap(),
            event_addr: "127.0.0.1:1".parse().unwrap(),
            local_worker_binary: None,
        };
        let client = KernelClient::new(endpoints);
        *client.state.lock().await = KernelState::Running;

        let result = client.execute(0, "1+1".to_string()).await;
        assert!(matches!(result, Err(Error::AlreadyRunning)));
    }

    #[tokio::test]
    async fn interrupt_while_idle_is_a_no_op() {
        let endpoints = Endpoints {
            cmd_addr: "127.0.0.1:1".parse().unwrap(),
            event_addr: "127.0.0.1:1".parse().unwrap(),
            local_worker_binary: None,
        };
        let client = KernelClient::new(endpoints);
        assert_eq!(client.current_state(), KernelState::Idle);

        client.interrupt(None).await.unwrap();
        assert_eq!(client.current_state(), KernelState::Idle, "an idle interrupt must not spawn or touch a worker");
    }
}
