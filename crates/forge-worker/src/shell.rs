//! Shell-escape execution: `!cmd` lines and whole-cell `!` shell mode.
//! A subprocess's stdout/stderr is read incrementally and
//! flushed as complete `stream` events on `\n`, while a trailing `\r`-only
//! segment is flushed as a progress update that replaces rather than appends
//! to the previous partial line.

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};

use forge_core::StreamName;

/// Outcome of running a shell command: exit status plus whether anything was
/// written to the error channel, so the caller can build an `error` output.
pub struct ShellOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
}

/// Run `command` through the platform's default shell, forwarding
/// stdout/stderr line-by-line through `on_stream`. A `\r`-terminated
/// segment without a trailing `\n` is reported with `is_progress = true`,
/// so a caller can coalesce carriage-return progress bars instead of
/// appending each update as a new line.
pub fn run_shell_command<F>(command: &str, mut on_stream: F) -> std::io::Result<ShellOutcome>
where
    F: FnMut(StreamName, String, bool),
{
    let mut child = if cfg!(windows) {
        Command::new("cmd")
            .arg("/C")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?
    } else {
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Two short-lived reader threads feed one channel so stdout/stderr
    // segments are forwarded as they arrive without giving either stream a
    // mutable alias into `on_stream` from more than one thread at a time.
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::scope(|scope| {
        if let Some(stdout) = stdout {
            let tx = tx.clone();
            scope.spawn(move || forward_stream(stdout, StreamName::Stdout, tx));
        }
        if let Some(stderr) = stderr {
            let tx = tx.clone();
            scope.spawn(move || forward_stream(stderr, StreamName::Stderr, tx));
        }
        drop(tx);
        for (name, text, is_progress) in rx {
            on_stream(name, text, is_progress);
        }
    });

    let status = child.wait()?;
    Ok(ShellOutcome {
        success: status.success(),
        exit_code: status.code(),
    })
}

fn forward_stream<R: Read>(
    reader: R,
    name: StreamName,
    tx: std::sync::mpsc::Sender<(StreamName, String, bool)>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match read_segment(&mut reader, &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let (text, is_progress) = decode_segment(&buf);
                if !text.is_empty() && tx.send((name, text, is_progress)).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

/// Read up to (and including) the next `\n` or `\r`, whichever comes first.
fn read_segment<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    let mut total = 0;
    loop {
        let available = match reader.fill_buf() {
            Ok(b) => b,
            Err(e) => return Err(e),
        };
        if available.is_empty() {
            return Ok(total);
        }
        if let Some(pos) = available.iter().position(|&b| b == b'\n' || b == b'\r') {
            buf.extend_from_slice(&available[..=pos]);
            let consumed = pos + 1;
            reader.consume(consumed);
            return Ok(total + consumed);
        }
        let len = available.len();
        buf.extend_from_slice(available);
        reader.consume(len);
        total += len;
    }
}

fn decode_segment(buf: &[u8]) -> (String, bool) {
    let text = String::from_utf8_lossy(buf).into_owned();
    let is_progress = text.ends_with('\r') && !text.ends_with("\r\n");
    (text, is_progress)
}

/// Rewrite a single `!cmd` line (possibly indented) into a call on the
/// injected shell helper. Returns `None` if `line` is not a
/// shell-escape line.
pub fn rewrite_shell_escape_line(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    let indent = &line[..line.len() - trimmed.len()];
    let command = trimmed.strip_prefix('!')?;
    Some(format!(
        "{indent}_forge_run_shell({command:?})",
        command = command.trim()
    ))
}

/// Whole-cell shell mode: the first non-blank character of the cell is `!`.
pub fn is_whole_cell_shell(source: &str) -> bool {
    source.trim_start().starts_with('!')
}
