//! Embedded interpreter wrapper: one `rustpython_vm::Interpreter` and one
//! persistent `Scope` per worker process, executed entirely from the thread
//! that owns them.
//!
//! Follows RustPython's own embedding convention: build an `Interpreter`
//! once with `with_init`, then call `.enter(|vm| ...)` once per unit of
//! work, reusing the same `Scope` (and so the same globals dict) across
//! every cell.

use std::sync::mpsc::Receiver;
use std::time::Instant;

use rustpython_vm::compiler::Mode;
use rustpython_vm::scope::Scope;
use rustpython_vm::{Interpreter, PyResult, VirtualMachine};

use forge_core::protocol::{ErrorInfo, ExecutionResultInfo, ExecutionStatus, StreamName, WorkerEvent};

use crate::{classify, plotting, runtime_module, shell};

const CELL_SOURCE_NAME: &str = "<cell>";

const BOOTSTRAP: &str = r#"
import sys as _forge_sys
import _forge_runtime as _forge_rt

class _ForgeStream:
    def __init__(self, name):
        self._name = name
    def write(self, text):
        if text:
            _forge_rt.emit_stream(self._name, text)
    def flush(self):
        pass
    def isatty(self):
        return False

_forge_sys.stdout = _ForgeStream("stdout")
_forge_sys.stderr = _ForgeStream("stderr")

def display(mime, data):
    _forge_rt.display(mime, data)

class ShellCommandError(Exception):
    pass

def _forge_run_shell(command):
    code = _forge_rt.run_shell(command)
    if code != 0:
        raise ShellCommandError("command `" + command + "` exited with status " + str(code))

def _forge_encode_floats(values):
    return "\x1f".join(repr(float(v)) for v in values)

class _ForgePlot:
    """Tiny matplotlib-alike: draws onto a figure captured and emitted as
    `image/png` once the cell finishes, instead of requiring a real
    plotting library inside the interpreter."""

    def figure(self, *args, **kwargs):
        _forge_rt.plot_new_figure()
        return self

    def title(self, text, *args, **kwargs):
        _forge_rt.plot_title(str(text))

    def plot(self, x, y=None, *args, **kwargs):
        if y is None:
            y = x
            x = list(range(len(y)))
        _forge_rt.plot_line(_forge_encode_floats(x), _forge_encode_floats(y))

    def scatter(self, x, y, *args, **kwargs):
        _forge_rt.plot_scatter(_forge_encode_floats(x), _forge_encode_floats(y))

    def bar(self, labels, values, *args, **kwargs):
        labels = list(labels)
        _forge_rt.plot_bar(len(labels), _forge_encode_floats(values))

    def show(self, *args, **kwargs):
        pass

    def close(self, *args, **kwargs):
        _forge_rt.plot_close_all()

forge_plot = _ForgePlot()
"#;

/// Outcome of running one cell, already shaped for `WorkerEvent::ExecutionComplete`.
pub struct CellOutcome {
    pub result: ExecutionResultInfo,
}

/// Owns the embedded interpreter and its persistent global namespace.
/// Confined to a single OS thread for its entire lifetime: RustPython's
/// reference-counted `PyObjectRef`s are not `Send`, so every call into
/// `vm` happens from the thread that constructed this value.
pub struct CellInterpreter {
    interpreter: Interpreter,
    scope: Scope,
}

impl CellInterpreter {
    pub fn new() -> Self {
        let interpreter = Interpreter::with_init(Default::default(), |vm| {
            vm.add_native_modules(rustpython_stdlib::get_module_inits());
            vm.add_native_module("_forge_runtime".to_owned(), Box::new(runtime_module::make_module));
        });

        let scope = interpreter.enter(|vm| {
            let scope = vm.new_scope_with_builtins();
            run_str(vm, &scope, BOOTSTRAP, "<bootstrap>")
                .expect("bootstrap namespace setup must not fail");
            scope
        });

        Self { interpreter, scope }
    }

    /// Execute one cell, streaming `Stream`/`ExecuteResult`/`DisplayData`
    /// events through `events` and checking `interrupts` between top-level
    /// statement chunks.
    pub fn execute_cell(
        &self,
        code: &str,
        cell_index: u64,
        execution_count: u64,
        events: &std::sync::mpsc::Sender<WorkerEvent>,
        interrupts: &Receiver<Option<u64>>,
    ) -> CellOutcome {
        let started = Instant::now();

        if shell::is_whole_cell_shell(code) {
            return self.run_whole_cell_shell(code, cell_index, execution_count, events, started);
        }

        let rewritten = rewrite_shell_escapes(code);
        let chunks = classify::split_top_level_statements(&rewritten);

        let (statement_chunks, tail_expression) = match chunks.split_last() {
            Some((last, rest)) if classify_tail(last) == classify::LastLine::Expression => {
                (rest.to_vec(), Some(last.clone()))
            }
            _ => (chunks, None),
        };

        self.interpreter.enter(|vm| {
            runtime_module::with_stream_sink(
                |stream, text| {
                    let _ = events.send(stream_event(cell_index, stream, text));
                },
                || {
                    for chunk in &statement_chunks {
                        if was_interrupted(interrupts, cell_index) {
                            return self.finish_interrupted(cell_index, execution_count, started, events);
                        }
                        if let Err(exc) = run_str(vm, &self.scope, chunk, CELL_SOURCE_NAME) {
                            return self.finish_error(vm, exc, cell_index, execution_count, started, events);
                        }
                    }

                    if was_interrupted(interrupts, cell_index) {
                        return self.finish_interrupted(cell_index, execution_count, started, events);
                    }

                    let mut result_value = None;
                    if let Some(expr) = &tail_expression {
                        match eval_str(vm, &self.scope, expr, CELL_SOURCE_NAME) {
                            Ok(value) => result_value = Some(value),
                            Err(exc) => {
                                return self.finish_error(
                                    vm,
                                    exc,
                                    cell_index,
                                    execution_count,
                                    started,
                                    events,
                                );
                            }
                        }
                    }

                    self.finish_ok(vm, result_value, cell_index, execution_count, started, events)
                },
            )
        })
    }

    fn run_whole_cell_shell(
        &self,
        code: &str,
        cell_index: u64,
        execution_count: u64,
        events: &std::sync::mpsc::Sender<WorkerEvent>,
        started: Instant,
    ) -> CellOutcome {
        let command = code.trim_start().trim_start_matches('!');
        let outcome = shell::run_shell_command(command, |stream, text, is_progress| {
            let _ = events.send(WorkerEvent::Stream { cell_index, name: stream, text, is_progress });
        });

        emit_captured_figures(cell_index, events);

        let elapsed = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(outcome) if outcome.success => CellOutcome {
                result: ExecutionResultInfo {
                    status: ExecutionStatus::Ok,
                    execution_count,
                    execution_time_ms: elapsed,
                    error: None,
                },
            },
            Ok(outcome) => {
                let code = outcome.exit_code.unwrap_or(-1);
                let error = ErrorInfo {
                    ename: "ShellCommandError".to_string(),
                    evalue: format!("command exited with status {code}"),
                    traceback: vec![format!("!{command}")],
                };
                let _ = events.send(WorkerEvent::ExecutionError { cell_index, error: error.clone() });
                CellOutcome {
                    result: ExecutionResultInfo {
                        status: ExecutionStatus::Error,
                        execution_count,
                        execution_time_ms: elapsed,
                        error: Some(error),
                    },
                }
            }
            Err(io_err) => {
                let error = ErrorInfo {
                    ename: "OSError".to_string(),
                    evalue: io_err.to_string(),
                    traceback: Vec::new(),
                };
                let _ = events.send(WorkerEvent::ExecutionError { cell_index, error: error.clone() });
                CellOutcome {
                    result: ExecutionResultInfo {
                        status: ExecutionStatus::Error,
                        execution_count,
                        execution_time_ms: elapsed,
                        error: Some(error),
                    },
                }
            }
        }
    }

    fn finish_interrupted(
        &self,
        cell_index: u64,
        execution_count: u64,
        started: Instant,
        events: &std::sync::mpsc::Sender<WorkerEvent>,
    ) -> CellOutcome {
        emit_captured_figures(cell_index, events);

        let error = ErrorInfo {
            ename: "KeyboardInterrupt".to_string(),
            evalue: "Execution interrupted by user".to_string(),
            traceback: Vec::new(),
        };
        let _ = events.send(WorkerEvent::ExecutionError { cell_index, error: error.clone() });
        CellOutcome {
            result: ExecutionResultInfo {
                status: ExecutionStatus::Error,
                execution_count,
                execution_time_ms: started.elapsed().as_millis() as u64,
                error: Some(error),
            },
        }
    }

    fn finish_error(
        &self,
        vm: &VirtualMachine,
        exc: rustpython_vm::builtins::PyBaseExceptionRef,
        cell_index: u64,
        execution_count: u64,
        started: Instant,
        events: &std::sync::mpsc::Sender<WorkerEvent>,
    ) -> CellOutcome {
        let (ename, evalue, traceback) = runtime_module::describe_exception(vm, exc);
        emit_captured_figures(cell_index, events);
        let error = ErrorInfo { ename, evalue, traceback };
        let _ = events.send(WorkerEvent::ExecutionError { cell_index, error: error.clone() });
        CellOutcome {
            result: ExecutionResultInfo {
                status: ExecutionStatus::Error,
                execution_count,
                execution_time_ms: started.elapsed().as_millis() as u64,
                error: Some(error),
            },
        }
    }

    fn finish_ok(
        &self,
        vm: &VirtualMachine,
        result_value: Option<rustpython_vm::PyObjectRef>,
        cell_index: u64,
        execution_count: u64,
        started: Instant,
        events: &std::sync::mpsc::Sender<WorkerEvent>,
    ) -> CellOutcome {
        for entry in runtime_module::drain_display_entries() {
            if let Ok(bytes) = serde_json::to_vec(&entry.data_json) {
                let _ = events.send(WorkerEvent::DisplayData { cell_index, data_json: bytes });
            }
        }
        emit_captured_figures(cell_index, events);

        if let Some(value) = result_value {
            if !vm.is_none(&value) {
                if let Ok(repr) = value.repr(vm) {
                    let mut data = std::collections::HashMap::new();
                    data.insert(
                        "text/plain".to_string(),
                        serde_json::Value::String(repr.as_str().to_string()),
                    );
                    if let Ok(bytes) = serde_json::to_vec(&data) {
                        let _ = events.send(WorkerEvent::ExecuteResult {
                            cell_index,
                            execution_count,
                            data_json: bytes,
                        });
                    }
                }
            }
        }

        CellOutcome {
            result: ExecutionResultInfo {
                status: ExecutionStatus::Ok,
                execution_count,
                execution_time_ms: started.elapsed().as_millis() as u64,
                error: None,
            },
        }
    }
}

fn rewrite_shell_escapes(source: &str) -> String {
    source
        .lines()
        .map(|line| shell::rewrite_shell_escape_line(line).unwrap_or_else(|| line.to_string()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whether `chunk` — a single top-level statement/expression unit, possibly
/// spanning several physical lines (a block body or a bracketed
/// continuation) — should be re-evaluated as an expression rather than run
/// as a statement. Classifies the chunk as a whole: a multi-line chunk's
/// final physical line in isolation can look like a bare expression (e.g.
/// the closing `]` of a multi-line list literal) even though the chunk is
/// an assignment, so the keyword/assignment/call scan has to see the whole
/// chunk, not just its last line.
fn classify_tail(chunk: &str) -> classify::LastLine {
    classify::classify_last_line(chunk)
}

fn was_interrupted(interrupts: &Receiver<Option<u64>>, cell_index: u64) -> bool {
    let mut hit = false;
    while let Ok(target) = interrupts.try_recv() {
        if target.is_none() || target == Some(cell_index) {
            hit = true;
        }
    }
    hit
}

/// Capture every figure left open by the cell and emit one `DisplayData`
/// per figure, regardless of how the cell finished.
fn emit_captured_figures(cell_index: u64, events: &std::sync::mpsc::Sender<WorkerEvent>) {
    for captured in plotting::capture_and_clear_open_figures() {
        if let Ok(bytes) = serde_json::to_vec(&captured.data) {
            let _ = events.send(WorkerEvent::DisplayData { cell_index, data_json: bytes });
        }
    }
}

fn stream_event(cell_index: u64, name: StreamName, text: String) -> WorkerEvent {
    let is_progress = text.ends_with('\r') && !text.ends_with("\r\n");
    WorkerEvent::Stream { cell_index, name, text, is_progress }
}

fn run_str(vm: &VirtualMachine, scope: &Scope, source: &str, path: &str) -> PyResult<()> {
    let code = vm
        .compile(source, Mode::Exec, path.to_owned())
        .map_err(|e| vm.new_syntax_error(&e, Some(source)))?;
    vm.run_code_obj(code, scope.clone())?;
    Ok(())
}

fn eval_str(
    vm: &VirtualMachine,
    scope: &Scope,
    source: &str,
    path: &str,
) -> PyResult<rustpython_vm::PyObjectRef> {
    let code = vm
        .compile(source, Mode::Eval, path.to_owned())
        .map_err(|e| vm.new_syntax_error(&e, Some(source)))?;
    vm.run_code_obj(code, scope.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_statement_executes_without_error() {
        let interp = CellInterpreter::new();
        let (event_tx, event_rx) = std::sync::mpsc::channel();
        let (_interrupt_tx, interrupt_rx) = std::sync::mpsc::channel();

        let outcome = interp.execute_cell("x = 1\nx + 1", 0, 1, &event_tx, &interrupt_rx);
        assert_eq!(outcome.result.status, ExecutionStatus::Ok);

        let mut saw_result = false;
        while let Ok(event) = event_rx.try_recv() {
            if matches!(event, WorkerEvent::ExecuteResult { .. }) {
                saw_result = true;
            }
        }
        assert!(saw_result);
    }

    #[test]
    fn forge_plot_draw_emits_display_data() {
        let _guard = plotting::TEST_LOCK.lock().unwrap();
        plotting::close_all();

        let interp = CellInterpreter::new();
        let (event_tx, event_rx) = std::sync::mpsc::channel();
        let (_interrupt_tx, interrupt_rx) = std::sync::mpsc::channel();

        let outcome = interp.execute_cell(
            "forge_plot.plot([0, 1, 2], [0, 1, 0])",
            0,
            1,
            &event_tx,
            &interrupt_rx,
        );
        assert_eq!(outcome.result.status, ExecutionStatus::Ok);

        let mut saw_png = false;
        while let Ok(event) = event_rx.try_recv() {
            if let WorkerEvent::DisplayData { data_json, .. } = event {
                let data: std::collections::HashMap<String, serde_json::Value> =
                    serde_json::from_slice(&data_json).unwrap();
                saw_png |= data.contains_key("image/png");
            }
        }
        assert!(saw_png);

        // The figure was captured and cleared; a second cell with no
        // drawing produces no further DisplayData.
        let (event_tx2, event_rx2) = std::sync::mpsc::channel();
        interp.execute_cell("1 + 1", 1, 2, &event_tx2, &interrupt_rx);
        let mut saw_second_png = false;
        while let Ok(event) = event_rx2.try_recv() {
            if matches!(event, WorkerEvent::DisplayData { .. }) {
                saw_second_png = true;
            }
        }
        assert!(!saw_second_png);
    }

    #[test]
    fn namespace_persists_across_executions() {
        let interp = CellInterpreter::new();
        let (event_tx, _event_rx) = std::sync::mpsc::channel();
        let (_interrupt_tx, interrupt_rx) = std::sync::mpsc::channel();

        interp.execute_cell("a = 41", 0, 1, &event_tx, &interrupt_rx);
        let outcome = interp.execute_cell("a + 1", 1, 2, &event_tx, &interrupt_rx);
        assert_eq!(outcome.result.status, ExecutionStatus::Ok);
    }

    #[test]
    fn uncaught_exception_reports_error() {
        let interp = CellInterpreter::new();
        let (event_tx, event_rx) = std::sync::mpsc::channel();
        let (_interrupt_tx, interrupt_rx) = std::sync::mpsc::channel();

        let outcome = interp.execute_cell("1 / 0", 0, 1, &event_tx, &interrupt_rx);
        assert_eq!(outcome.result.status, ExecutionStatus::Error);
        assert_eq!(outcome.result.error.unwrap().ename, "ZeroDivisionError");

        let mut saw_error_event = false;
        while let Ok(event) = event_rx.try_recv() {
            if matches!(event, WorkerEvent::ExecutionError { .. }) {
                saw_error_event = true;
            }
        }
        assert!(saw_error_event);
    }

    #[test]
    fn multiline_bracketed_assignment_binds_name() {
        let interp = CellInterpreter::new();
        let (event_tx, _event_rx) = std::sync::mpsc::channel();
        let (_interrupt_tx, interrupt_rx) = std::sync::mpsc::channel();

        let outcome = interp.execute_cell(
            "y = 5\nx = [\n    1,\n    2,\n]",
            0,
            1,
            &event_tx,
            &interrupt_rx,
        );
        assert_eq!(outcome.result.status, ExecutionStatus::Ok);

        let outcome2 = interp.execute_cell("x", 1, 2, &event_tx, &interrupt_rx);
        assert_eq!(outcome2.result.status, ExecutionStatus::Ok);
    }

    #[test]
    fn interrupt_before_execution_aborts_immediately() {
        let interp = CellInterpreter::new();
        let (event_tx, _event_rx) = std::sync::mpsc::channel();
        let (interrupt_tx, interrupt_rx) = std::sync::mpsc::channel();
        interrupt_tx.send(None).unwrap();

        let outcome = interp.execute_cell("x = 1\ny = 2", 0, 1, &event_tx, &interrupt_rx);
        assert_eq!(outcome.result.status, ExecutionStatus::Error);
        assert_eq!(outcome.result.error.unwrap().ename, "KeyboardInterrupt");
    }
}
