//! The `_forge_runtime` native module injected into the interpreter's
//! builtins. User code never imports it directly; a bootstrap script run
//! once at interpreter startup (see `interpreter::bootstrap`) monkeypatches
//! `sys.stdout`/`sys.stderr` to route through `emit_stream`, and the
//! shell-escape rewriter (`shell::rewrite_shell_escape_line`) targets
//! `run_shell` by its injected top-level name `_forge_run_shell`.
//!
//! Uses the same `#[pymodule]` shape RustPython itself uses to implement
//! its own standard library modules (e.g. `rustpython-stdlib`'s `itertools`,
//! `json`), the idiomatic way to extend an embedded interpreter with
//! host-side callbacks rather than hand-building `PyObject`s.

use std::cell::RefCell;
use std::collections::HashMap;

use rustpython_vm::builtins::PyBaseExceptionRef;
use rustpython_vm::VirtualMachine;

use forge_core::StreamName;

/// One entry recorded by a call to `display(...)`: a MIME-type -> JSON-value
/// mapping, captured for emission as a `display_data` event once the cell
/// returns. Covers arbitrary user-triggered display payloads; captured
/// figures from the `forge_plot` shim are collected separately (see
/// `crate::plotting`).
pub struct DisplayEntry {
    pub data_json: HashMap<String, serde_json::Value>,
}

thread_local! {
    static STREAM_SINK: RefCell<Option<Box<dyn FnMut(StreamName, String)>>> = const { RefCell::new(None) };
    static DISPLAY_SINK: RefCell<Vec<DisplayEntry>> = const { RefCell::new(Vec::new()) };
}

/// Install the callback invoked by `emit_stream` for the duration of `f`.
pub fn with_stream_sink<F: FnMut(StreamName, String), R>(sink: F, f: impl FnOnce() -> R) -> R {
    STREAM_SINK.with(|cell| *cell.borrow_mut() = Some(Box::new(sink)));
    let result = f();
    STREAM_SINK.with(|cell| *cell.borrow_mut() = None);
    result
}

/// Drain and return every `display(...)` call recorded since the last drain.
pub fn drain_display_entries() -> Vec<DisplayEntry> {
    DISPLAY_SINK.with(|cell| std::mem::take(&mut *cell.borrow_mut()))
}

#[rustpython_vm::pymodule]
mod _forge_runtime {
    use super::{DisplayEntry, DISPLAY_SINK, STREAM_SINK};
    use crate::shell;
    use forge_core::StreamName;
    use rustpython_vm::builtins::PyStrRef;
    use rustpython_vm::{PyObjectRef, PyResult, VirtualMachine};
    use std::collections::HashMap;

    /// Route text written to the patched `sys.stdout`/`sys.stderr` to the
    /// host-side event channel. `name` is `"stdout"` or `"stderr"`.
    #[pyfunction]
    fn emit_stream(name: PyStrRef, text: PyStrRef) {
        let stream = if name.as_str() == "stderr" {
            StreamName::Stderr
        } else {
            StreamName::Stdout
        };
        STREAM_SINK.with(|cell| {
            if let Some(sink) = cell.borrow_mut().as_mut() {
                sink(stream, text.as_str().to_string());
            }
        });
    }

    /// Record a side-effect display payload.
    /// `mime` is a MIME type string (`"text/plain"`, `"image/png"`, ...);
    /// `data` is either a string or a JSON-decodable string, stored as-is.
    #[pyfunction]
    fn display(mime: PyStrRef, data: PyStrRef) {
        let mut map = HashMap::new();
        map.insert(
            mime.as_str().to_string(),
            serde_json::Value::String(data.as_str().to_string()),
        );
        DISPLAY_SINK.with(|cell| cell.borrow_mut().push(DisplayEntry { data_json: map }));
    }

    /// Backing function for `_forge_run_shell`, the name the shell-escape
    /// rewriter targets. Streams output through `emit_stream` and
    /// returns the exit code; the Python-level wrapper in the bootstrap
    /// script turns a non-zero code into a `ShellCommandError` so the
    /// exception's class name is `ShellCommandError` (a `RuntimeError`
    /// raised from the Rust side would report `ename == "RuntimeError"`).
    #[pyfunction]
    fn run_shell(command: PyStrRef, vm: &VirtualMachine) -> PyResult<PyObjectRef> {
        let command_text = command.as_str().to_string();
        let outcome = shell::run_shell_command(&command_text, |stream, text, _progress| {
            emit_stream(
                vm.ctx.new_str(stream_name(stream)).into(),
                vm.ctx.new_str(text).into(),
            );
        })
        .map_err(|e| vm.new_os_error(format!("failed to run shell command: {e}")))?;

        let code = if outcome.success { 0 } else { outcome.exit_code.unwrap_or(-1) };
        Ok(vm.ctx.new_int(code).into())
    }

    fn stream_name(stream: StreamName) -> &'static str {
        match stream {
            StreamName::Stdout => "stdout",
            StreamName::Stderr => "stderr",
        }
    }

    /// `\x1f`-delimited floats, as produced by the bootstrap's
    /// `_forge_encode_floats` helper. Empty segments are skipped so a
    /// trailing separator doesn't introduce a spurious `0.0`.
    fn parse_floats(s: &str, vm: &VirtualMachine) -> PyResult<Vec<f64>> {
        s.split('\u{1f}')
            .filter(|segment| !segment.is_empty())
            .map(|segment| {
                segment
                    .parse::<f64>()
                    .map_err(|e| vm.new_value_error(format!("invalid float in plot data: {e}")))
            })
            .collect()
    }

    /// `forge_plot.figure()`: start a new blank figure.
    #[pyfunction]
    fn plot_new_figure() {
        crate::plotting::new_figure();
    }

    /// `forge_plot.title(text)`: attach a title to the current figure.
    #[pyfunction]
    fn plot_title(text: PyStrRef) {
        crate::plotting::set_title(text.as_str());
    }

    /// `forge_plot.plot(x, y)`, backed by `\x1f`-joined float strings built
    /// on the Python side (no native `Vec<f64>` argument extraction, since
    /// nothing in this dependency stack exercises that rustpython-vm path).
    #[pyfunction]
    fn plot_line(xs: PyStrRef, ys: PyStrRef, vm: &VirtualMachine) -> PyResult<()> {
        let xs = parse_floats(xs.as_str(), vm)?;
        let ys = parse_floats(ys.as_str(), vm)?;
        crate::plotting::plot_line(&xs, &ys);
        Ok(())
    }

    /// `forge_plot.scatter(x, y)`.
    #[pyfunction]
    fn plot_scatter(xs: PyStrRef, ys: PyStrRef, vm: &VirtualMachine) -> PyResult<()> {
        let xs = parse_floats(xs.as_str(), vm)?;
        let ys = parse_floats(ys.as_str(), vm)?;
        crate::plotting::plot_scatter(&xs, &ys);
        Ok(())
    }

    /// `forge_plot.bar(labels, values)`. `label_count` is the number of bars
    /// (label text itself isn't rasterized, so only the count matters).
    #[pyfunction]
    fn plot_bar(label_count: usize, values: PyStrRef, vm: &VirtualMachine) -> PyResult<()> {
        let values = parse_floats(values.as_str(), vm)?;
        crate::plotting::plot_bar(label_count, &values);
        Ok(())
    }

    /// `forge_plot.close('all')`: discard open figures without capturing.
    #[pyfunction]
    fn plot_close_all() {
        crate::plotting::close_all();
    }
}

pub use _forge_runtime::make_module;

/// Convert an uncaught Python exception into `(ename, evalue, traceback)`,
/// matching `Output::Error`'s shape.
pub fn describe_exception(
    vm: &VirtualMachine,
    exc: PyBaseExceptionRef,
) -> (String, String, Vec<String>) {
    let ename = exc.class().name().to_string();
    let evalue = vm
        .to_str(exc.as_object())
        .map(|s| s.as_str().to_string())
        .unwrap_or_default();

    let mut traceback = Vec::new();
    let mut writer = Vec::new();
    if vm.write_exception(&mut writer, &exc).is_ok() {
        let text = String::from_utf8_lossy(&writer);
        traceback = text.lines().map(|l| l.to_string()).collect();
    }
    if traceback.is_empty() {
        traceback.push(format!("{ename}: {evalue}"));
    }

    (ename, evalue, traceback)
}
