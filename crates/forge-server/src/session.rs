//! Notebook session management.
//!
//! Holds the authoritative notebook document plus a broadcast channel for
//! fanning server messages out to every connected client, and a
//! single-writer `executing` flag to guard the one-cell-at-a-time rule.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use forge_core::{Cell, CellKind, ExecutionResultInfo, Notebook, Output};

use crate::error::{ServerError, ServerResult};
use crate::protocol::ServerMessage;

/// Capacity for the broadcast channel. 256 messages is generous for normal
/// notebook traffic; if a client falls behind, older messages are dropped
/// rather than applying backpressure to the whole session.
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// Authoritative in-memory model of one open notebook. Cells are
/// addressed by position; `Cell::id` is the identifier that survives edits.
pub struct Session {
    notebook: Notebook,
    tx: broadcast::Sender<ServerMessage>,
    executing: bool,
}

/// `Session` is always shared behind a single-writer lock; callers that need
/// to hold a reference across an `.await` (the route handlers) use this
/// alias.
pub type SessionHandle = Arc<RwLock<Session>>;

impl Session {
    pub fn new(notebook: Notebook) -> Self {
        let (tx, _rx) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        Self { notebook, tx, executing: false }
    }

    /// Load a notebook from disk and wrap it in a fresh session.
    pub fn load(path: impl Into<PathBuf>) -> ServerResult<Self> {
        let notebook = Notebook::load(path.into())?;
        Ok(Self::new(notebook))
    }

    pub fn into_handle(self) -> SessionHandle {
        Arc::new(RwLock::new(self))
    }

    /// Subscribe a new client to this session's broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.tx.subscribe()
    }

    /// Broadcast a message to every subscribed client. A lagging or absent
    /// receiver is not an error; fan-out is best-effort.
    pub fn broadcast(&self, message: ServerMessage) {
        let _ = self.tx.send(message);
    }

    pub fn is_executing(&self) -> bool {
        self.executing
    }

    pub fn set_executing(&mut self, executing: bool) {
        self.executing = executing;
    }

    /// Immutable view used on client connect and `load_notebook`.
    pub fn snapshot(&self) -> Notebook {
        self.notebook.clone()
    }

    pub fn path(&self) -> &Path {
        &self.notebook.path
    }

    /// Source of the cell at `index`, for handing off to the kernel client.
    pub fn cell_source(&self, index: usize) -> ServerResult<String> {
        self.notebook
            .cells
            .get(index)
            .map(|cell| cell.source.clone())
            .ok_or(ServerError::CellNotFound(index))
    }

    /// In-place edit; no persistence (saves are explicit) and no broadcast.
    pub fn update_cell_source(&mut self, index: usize, source: String) -> ServerResult<()> {
        let cell = self
            .notebook
            .cells
            .get_mut(index)
            .ok_or(ServerError::CellNotFound(index))?;
        cell.source = source;
        Ok(())
    }

    /// Insert at `index`; `full` restores a previously-serialized cell
    /// verbatim (used for undo of a delete), otherwise a fresh identifier is
    /// generated. Auto-saves and broadcasts the updated snapshot.
    pub fn add_cell(
        &mut self,
        index: usize,
        kind: CellKind,
        source: String,
        full: Option<Cell>,
    ) -> ServerResult<()> {
        let cell = full.unwrap_or_else(|| match kind {
            CellKind::Code => Cell::new_code(source),
            CellKind::Markdown => Cell::new_markdown(source),
        });

        let index = index.min(self.notebook.cells.len());
        self.notebook.cells.insert(index, cell);
        self.save_and_broadcast()
    }

    /// Remove the cell at `index`. Auto-saves and broadcasts.
    pub fn delete_cell(&mut self, index: usize) -> ServerResult<()> {
        if index >= self.notebook.cells.len() {
            return Err(ServerError::CellNotFound(index));
        }
        self.notebook.cells.remove(index);
        self.save_and_broadcast()
    }

    /// Reorder the cell at `from` to `to`. Auto-saves and broadcasts.
    pub fn move_cell(&mut self, from: usize, to: usize) -> ServerResult<()> {
        if from >= self.notebook.cells.len() || to >= self.notebook.cells.len() {
            return Err(ServerError::CellNotFound(from.max(to)));
        }
        let cell = self.notebook.cells.remove(from);
        self.notebook.cells.insert(to, cell);
        self.save_and_broadcast()
    }

    /// Wipe outputs and execution counts for code cells only.
    /// Called as part of `reset_kernel`.
    pub fn clear_all_outputs(&mut self) {
        for cell in &mut self.notebook.cells {
            cell.clear_output_state();
        }
    }

    /// Store the outputs and execution count produced by a completed
    /// `execute_cell`. `outputs` is the accumulated list of
    /// stream/result/display/error events observed for this run, in order.
    pub fn apply_execution_result(
        &mut self,
        cell_index: u64,
        outputs: Vec<Output>,
        result: &ExecutionResultInfo,
    ) -> ServerResult<()> {
        let cell = self
            .notebook
            .cells
            .get_mut(cell_index as usize)
            .ok_or(ServerError::CellNotFound(cell_index as usize))?;
        cell.outputs = outputs;
        cell.execution_count = Some(result.execution_count);
        Ok(())
    }

    /// Persist to `path`, or the notebook's own path if `None`. Atomic
    /// write-to-temp-then-rename, implemented in
    /// `forge_core::notebook::Notebook::save`.
    pub fn save(&self, path: Option<&Path>) -> ServerResult<()> {
        self.notebook.save(path)?;
        Ok(())
    }

    fn save_and_broadcast(&mut self) -> ServerResult<()> {
        self.save(None)?;
        self.broadcast(ServerMessage::NotebookUpdated { notebook: self.notebook.clone() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        let temp = tempfile::TempDir::new().unwrap();
        let notebook = Notebook::empty(temp.path().join("nb.json"));
        Session::new(notebook)
    }

    #[test]
    fn add_then_delete_cell_round_trips_length() {
        let mut session = session();
        session.add_cell(0, CellKind::Code, "x = 1".to_string(), None).unwrap();
        assert_eq!(session.snapshot().cells.len(), 1);

        session.delete_cell(0).unwrap();
        assert_eq!(session.snapshot().cells.len(), 0);
    }

    #[test]
    fn move_cell_reorders() {
        let mut session = session();
        session.add_cell(0, CellKind::Code, "a".to_string(), None).unwrap();
        session.add_cell(1, CellKind::Code, "b".to_string(), None).unwrap();
        session.move_cell(0, 1).unwrap();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.cells[0].source, "b");
        assert_eq!(snapshot.cells[1].source, "a");
    }

    #[test]
    fn delete_cell_out_of_range_is_cell_not_found() {
        let mut session = session();
        let err = session.delete_cell(0).unwrap_err();
        assert!(matches!(err, ServerError::CellNotFound(0)));
    }

    #[test]
    fn update_cell_source_does_not_broadcast() {
        let mut session = session();
        session.add_cell(0, CellKind::Code, "a".to_string(), None).unwrap();
        let mut rx = session.subscribe();

        session.update_cell_source(0, "b".to_string()).unwrap();
        assert_eq!(session.snapshot().cells[0].source, "b");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn clear_all_outputs_only_touches_code_cells() {
        let mut session = session();
        session.add_cell(0, CellKind::Markdown, "# hi".to_string(), None).unwrap();
        session.add_cell(1, CellKind::Code, "1+1".to_string(), None).unwrap();
        session.notebook.cells[1].outputs.push(Output::Stream {
            name: forge_core::OutputStreamName::Stdout,
            text: "hi".to_string(),
        });
        session.notebook.cells[1].execution_count = Some(1);

        session.clear_all_outputs();
        assert!(session.notebook.cells[1].outputs.is_empty());
        assert_eq!(session.notebook.cells[1].execution_count, None);
    }
}
