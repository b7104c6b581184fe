//! The persisted notebook document: cells, outputs, and the on-disk schema.
//!
//! `Notebook` is the type
//! `Session` loads from and saves to disk; `Cell`/`Output` are also embedded
//! verbatim in outbound server messages (`forge_server::protocol`).

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Default schema version written by this crate.
pub const NBFORMAT: u32 = 4;
pub const NBFORMAT_MINOR: u32 = 0;

/// Opaque, stable cell identifier. Generated on first materialization and
/// preserved across save/load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(pub String);

impl CellId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for CellId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cell kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    Code,
    Markdown,
}

/// Stream name for `Output::Stream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// A single unit of cell output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    /// Incremental stdout/stderr text.
    Stream { name: StreamName, text: String },

    /// The value of the cell's last (displayable) expression.
    ExecuteResult {
        execution_count: u64,
        data: HashMap<String, Value>,
    },

    /// A side-effect display (e.g. a captured figure).
    DisplayData { data: HashMap<String, Value> },

    /// An uncaught error.
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

/// One cell in the notebook.
///
/// `outputs`/`execution_count` are logically meaningless for markdown cells;
/// rather than split `Cell` into a per-kind sum type, the struct keeps one
/// shape for both kinds (matching the wire format, where every cell record
/// looks the same regardless of `cell_type`) and the fields are defaulted /
/// skipped-on-serialize-when-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub id: CellId,
    #[serde(rename = "cell_type")]
    pub kind: CellKind,
    #[serde(deserialize_with = "deserialize_source")]
    pub source: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<Output>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u64>,

    /// Per-cell fields this crate doesn't know about (e.g. `collapsed`,
    /// `jupyter`), preserved verbatim across load/save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Cell {
    pub fn new_code(source: impl Into<String>) -> Self {
        Self {
            id: CellId::new(),
            kind: CellKind::Code,
            source: source.into(),
            metadata: Map::new(),
            outputs: Vec::new(),
            execution_count: None,
            extra: Map::new(),
        }
    }

    pub fn new_markdown(source: impl Into<String>) -> Self {
        Self {
            id: CellId::new(),
            kind: CellKind::Markdown,
            source: source.into(),
            metadata: Map::new(),
            outputs: Vec::new(),
            execution_count: None,
            extra: Map::new(),
        }
    }

    /// Reset to the post-load, never-executed state (used by `reset_kernel`'s
    /// effect on `clear_all_outputs`, and `load` for markdown cells).
    pub fn clear_output_state(&mut self) {
        if self.kind == CellKind::Code {
            self.outputs.clear();
            self.execution_count = None;
        }
    }
}

/// Accept either a single JSON string or an array of strings for `source`,
/// normalizing either representation to a single string. List elements
/// already carry their own trailing `\n` (the nbformat convention), so they
/// are concatenated directly rather than re-joined with an extra separator.
fn deserialize_source<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SourceRepr {
        One(String),
        Many(Vec<String>),
    }

    match SourceRepr::deserialize(deserializer)? {
        SourceRepr::One(s) => Ok(s),
        SourceRepr::Many(lines) => Ok(lines.join("")),
    }
}

/// The full notebook document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notebook {
    pub cells: Vec<Cell>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "default_nbformat")]
    pub nbformat: u32,
    #[serde(default)]
    pub nbformat_minor: u32,

    /// Top-level fields this crate doesn't know about, preserved verbatim
    /// across load/save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,

    /// Not part of the wire format; carried alongside by `Session`.
    #[serde(skip)]
    pub path: PathBuf,
}

fn default_nbformat() -> u32 {
    NBFORMAT
}

impl Notebook {
    /// A fresh, empty notebook at `path`.
    pub fn empty(path: PathBuf) -> Self {
        Self {
            cells: Vec::new(),
            metadata: Map::new(),
            nbformat: NBFORMAT,
            nbformat_minor: NBFORMAT_MINOR,
            extra: Map::new(),
            path,
        }
    }

    /// Load from a JSON file at `path`. Missing cell identifiers are
    /// generated fresh.
    pub fn load(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)?;
        let mut value: Value = serde_json::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        if let Some(cells) = value.get_mut("cells").and_then(Value::as_array_mut) {
            for cell in cells.iter_mut() {
                let has_id = cell
                    .get("id")
                    .and_then(Value::as_str)
                    .is_some_and(|s| !s.is_empty());
                if !has_id {
                    if let Some(obj) = cell.as_object_mut() {
                        obj.insert("id".to_string(), Value::String(CellId::new().0));
                    }
                }
            }
        }

        let mut notebook: Notebook = serde_json::from_value(value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        notebook.path = path;
        Ok(notebook)
    }

    /// Serialize and atomically write to `path` (or the notebook's own path
    /// if `path` is `None`).
    pub fn save(&self, path: Option<&std::path::Path>) -> std::io::Result<()> {
        let target = path.unwrap_or(&self.path);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        crate::paths::atomic_write(target, json.as_bytes(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_accepts_string_or_list() {
        let json = r#"{
            "id": "abc",
            "cell_type": "code",
            "source": ["x = 1\n", "x + 1"]
        }"#;
        let cell: Cell = serde_json::from_str(json).unwrap();
        assert_eq!(cell.source, "x = 1\nx + 1");

        let json2 = r#"{"id": "def", "cell_type": "code", "source": "y = 2"}"#;
        let cell2: Cell = serde_json::from_str(json2).unwrap();
        assert_eq!(cell2.source, "y = 2");
    }

    #[test]
    fn missing_id_generated_on_load() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("nb.json");
        std::fs::write(
            &path,
            r#"{"cells": [{"cell_type": "code", "source": "1+1"}], "metadata": {}, "nbformat": 4, "nbformat_minor": 0}"#,
        )
        .unwrap();

        let nb = Notebook::load(&path).unwrap();
        assert_eq!(nb.cells.len(), 1);
        assert!(!nb.cells[0].id.0.is_empty());
    }

    #[test]
    fn round_trip_preserves_ids_and_order() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("nb.json");
        let mut nb = Notebook::empty(path.clone());
        nb.cells.push(Cell::new_code("a = 1"));
        nb.cells.push(Cell::new_markdown("# title"));
        nb.cells.push(Cell::new_code("a + 1"));
        let ids: Vec<_> = nb.cells.iter().map(|c| c.id.clone()).collect();

        nb.save(None).unwrap();
        let loaded = Notebook::load(&path).unwrap();

        let loaded_ids: Vec<_> = loaded.cells.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, loaded_ids);
    }

    #[test]
    fn unrecognized_metadata_round_trips() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("nb.json");
        std::fs::write(
            &path,
            r#"{"cells": [], "metadata": {"custom_field": 42}, "nbformat": 4, "nbformat_minor": 0, "unknown_top_level": true}"#,
        )
        .unwrap();

        let nb = Notebook::load(&path).unwrap();
        assert_eq!(nb.metadata.get("custom_field").unwrap(), 42);
        assert_eq!(nb.extra.get("unknown_top_level").unwrap(), true);

        nb.save(None).unwrap();
        let reloaded = Notebook::load(&path).unwrap();
        assert_eq!(reloaded.extra.get("unknown_top_level").unwrap(), true);
    }

    #[test]
    fn unrecognized_cell_field_round_trips() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("nb.json");
        std::fs::write(
            &path,
            r#"{"cells": [{"id": "abc", "cell_type": "code", "source": "1+1", "collapsed": true, "jupyter": {"source_hidden": false}}], "metadata": {}, "nbformat": 4, "nbformat_minor": 0}"#,
        )
        .unwrap();

        let nb = Notebook::load(&path).unwrap();
        assert_eq!(nb.cells[0].extra.get("collapsed").unwrap(), true);
        assert!(nb.cells[0].extra.get("jupyter").is_some());

        nb.save(None).unwrap();
        let reloaded = Notebook::load(&path).unwrap();
        assert_eq!(reloaded.cells[0].extra.get("collapsed").unwrap(), true);
    }

    #[test]
    fn markdown_cell_never_serializes_outputs() {
        let mut cell = Cell::new_markdown("hello");
        cell.execution_count = None;
        let json = serde_json::to_string(&cell).unwrap();
        assert!(!json.contains("outputs"));
        assert!(!json.contains("execution_count"));
    }
}
