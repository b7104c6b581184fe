//! `forge-worker`: the persistent per-kernel process spawned by
//! `forge-core::kernel::KernelClient`.
//!
//! Binds two loopback TCP listeners, one for the command channel and one
//! for the event channel, matching `KernelClient::spawn_worker`'s
//! `--cmd-port`/`--event-port` invocation. A dedicated thread owns the
//! embedded interpreter for the whole process lifetime; the command-reading
//! loop stays on the main thread so an `Interrupt` can be read and acted on
//! while a cell is mid-execution, instead of blocking that same thread
//! inside the interpreter call.

mod classify;
mod interpreter;
mod plotting;
mod runtime_module;
mod shell;

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use forge_core::protocol::{read_message, write_message, WorkerCommand, WorkerEvent, WorkerReply};

use interpreter::CellInterpreter;

#[derive(Parser, Debug)]
#[command(name = "forge-worker", about = "Executes notebook cells for one kernel")]
struct Args {
    /// Loopback port to accept the command channel connection on.
    #[arg(long)]
    cmd_port: u16,

    /// Loopback port to accept the event channel connection on.
    #[arg(long)]
    event_port: u16,
}

struct ExecJob {
    code: String,
    cell_index: u64,
    execution_count: u64,
}

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let pid = std::process::id();

    let cmd_addr: SocketAddr = ([127, 0, 0, 1], args.cmd_port).into();
    let event_addr: SocketAddr = ([127, 0, 0, 1], args.event_port).into();

    tracing::info!(pid, %cmd_addr, %event_addr, "worker listening");

    let cmd_listener = TcpListener::bind(cmd_addr)?;
    let event_listener = TcpListener::bind(event_addr)?;

    let (cmd_stream, _) = cmd_listener.accept()?;
    let (event_stream, _) = event_listener.accept()?;
    drop(cmd_listener);
    drop(event_listener);

    let cmd_reader = cmd_stream.try_clone()?;
    let cmd_writer = Arc::new(Mutex::new(cmd_stream));

    let (event_tx, event_rx) = mpsc::channel::<WorkerEvent>();
    let (exec_tx, exec_rx) = mpsc::channel::<ExecJob>();
    let (interrupt_tx, interrupt_rx) = mpsc::channel::<Option<u64>>();

    let busy = Arc::new(AtomicBool::new(false));
    // Cell index of whatever job is currently assigned to the interpreter
    // thread, or `-1` when idle. Lets `Interrupt` tell a live cell from a
    // stale or mistargeted one without racing the interpreter thread itself.
    let running_cell = Arc::new(AtomicI64::new(-1));

    spawn_event_writer(event_stream, event_rx);
    spawn_heartbeat(event_tx.clone(), Arc::clone(&busy));
    spawn_interpreter_thread(
        exec_rx,
        interrupt_rx,
        event_tx,
        Arc::clone(&cmd_writer),
        Arc::clone(&busy),
        Arc::clone(&running_cell),
        pid,
    );

    run_command_loop(cmd_reader, cmd_writer, exec_tx, interrupt_tx, busy, running_cell, pid)
}

/// Reads commands off the command channel forever. `Ping`/`Interrupt`/
/// `Shutdown` are serviced inline; `ExecuteCell` is handed to the
/// interpreter thread so this loop keeps reading: interrupt
/// needs to reach the worker without waiting for the running cell.
fn run_command_loop(
    mut reader: TcpStream,
    writer: Arc<Mutex<TcpStream>>,
    exec_tx: mpsc::Sender<ExecJob>,
    interrupt_tx: mpsc::Sender<Option<u64>>,
    busy: Arc<AtomicBool>,
    running_cell: Arc<AtomicI64>,
    pid: u32,
) -> anyhow::Result<()> {
    loop {
        let command: WorkerCommand = match read_message(&mut reader) {
            Ok(cmd) => cmd,
            Err(_) => {
                tracing::info!("command channel closed, exiting");
                return Ok(());
            }
        };

        match command {
            WorkerCommand::Ping => {
                reply(&writer, WorkerReply::Ok { pid });
            }
            WorkerCommand::ExecuteCell { code, cell_index, execution_count } => {
                if busy.swap(true, Ordering::SeqCst) {
                    reply(
                        &writer,
                        WorkerReply::Error { message: "a cell is already executing".to_string() },
                    );
                    continue;
                }
                running_cell.store(cell_index as i64, Ordering::SeqCst);
                let _ = exec_tx.send(ExecJob { code, cell_index, execution_count });
            }
            WorkerCommand::Interrupt { cell_index } => {
                // A no-op unless a cell is actually running and it's the one
                // being targeted (or the caller didn't target a specific
                // one): otherwise this would sit in `interrupt_rx` and abort
                // whichever cell runs next.
                let current = running_cell.load(Ordering::SeqCst);
                let targets_running = current >= 0
                    && cell_index.is_none_or(|idx| idx as i64 == current);
                if targets_running {
                    let _ = interrupt_tx.send(cell_index);
                }
                reply(&writer, WorkerReply::Ok { pid });
            }
            WorkerCommand::Shutdown => {
                reply(&writer, WorkerReply::Ok { pid });
                tracing::info!("received shutdown, exiting");
                return Ok(());
            }
        }
    }
}

fn reply(writer: &Arc<Mutex<TcpStream>>, message: WorkerReply) {
    if let Ok(mut guard) = writer.lock() {
        let _ = write_message(&mut *guard, &message);
    }
}

fn spawn_interpreter_thread(
    exec_rx: mpsc::Receiver<ExecJob>,
    interrupt_rx: mpsc::Receiver<Option<u64>>,
    event_tx: mpsc::Sender<WorkerEvent>,
    cmd_writer: Arc<Mutex<TcpStream>>,
    busy: Arc<AtomicBool>,
    running_cell: Arc<AtomicI64>,
    pid: u32,
) {
    std::thread::spawn(move || {
        let interp = CellInterpreter::new();

        while let Ok(job) = exec_rx.recv() {
            let _ = event_tx.send(WorkerEvent::ExecutionStart {
                cell_index: job.cell_index,
                execution_count: job.execution_count,
            });

            let outcome = interp.execute_cell(
                &job.code,
                job.cell_index,
                job.execution_count,
                &event_tx,
                &interrupt_rx,
            );

            let _ = event_tx.send(WorkerEvent::ExecutionComplete {
                cell_index: job.cell_index,
                result: outcome.result,
            });

            reply(&cmd_writer, WorkerReply::Ok { pid });
            running_cell.store(-1, Ordering::SeqCst);
            busy.store(false, Ordering::SeqCst);
        }
    });
}

fn spawn_event_writer(stream: TcpStream, event_rx: mpsc::Receiver<WorkerEvent>) {
    std::thread::spawn(move || {
        let mut stream = stream;
        while let Ok(event) = event_rx.recv() {
            if write_message(&mut stream, &event).is_err() {
                break;
            }
        }
    });
}

/// Emits `Heartbeat` at most every `HEARTBEAT_INTERVAL` while no cell is
/// executing, so the client side can detect a wedged or dead worker even
/// between cell runs.
fn spawn_heartbeat(event_tx: mpsc::Sender<WorkerEvent>, busy: Arc<AtomicBool>) {
    std::thread::spawn(move || loop {
        std::thread::sleep(HEARTBEAT_INTERVAL);
        if busy.load(Ordering::SeqCst) {
            continue;
        }
        let ts_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        if event_tx.send(WorkerEvent::Heartbeat { ts_unix_ms }).is_err() {
            return;
        }
    });
}
