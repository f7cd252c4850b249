//! Undo/redo history using compressed document snapshots
//!
//! Each entry is the complete node set of the document, serialized to JSON
//! and compressed with zstd. Restoring an entry clears the document and
//! re-imports the snapshot with its original ids.

use std::collections::VecDeque;

use serde_json::Value;

use crate::document::FlowDocument;
use crate::error::{FlowGraphError, Result};
use crate::import::{ImportOptions, ImportResult};
use crate::settings::FlowSettings;

impl FlowDocument {
    /// Complete node set including changed credentials
    pub fn snapshot(&self) -> Vec<Value> {
        self.create_complete_node_set(true)
    }

    /// Replace the document contents with a snapshot
    ///
    /// The active workspace is kept when it still exists afterwards.
    pub fn restore_snapshot(&mut self, records: Vec<Value>) -> Result<ImportResult> {
        let active = self.active_workspace().map(str::to_string);
        self.clear();
        let result = self.import_value(Value::Array(records), ImportOptions::default())?;
        if let Some(id) = active {
            if self.workspace(&id).is_some() || self.subflow(&id).is_some() {
                self.set_active_workspace(Some(id));
            }
        }
        Ok(result)
    }
}

/// Bounded stack of compressed snapshots
pub struct HistoryStack {
    /// Compressed snapshots (zstd)
    snapshots: VecDeque<Vec<u8>>,
    /// Current position in the stack
    current: usize,
    max_snapshots: usize,
    compression_level: i32,
}

impl HistoryStack {
    pub fn new(max_snapshots: usize, compression_level: i32) -> Self {
        Self {
            snapshots: VecDeque::new(),
            current: 0,
            max_snapshots: max_snapshots.max(1),
            compression_level,
        }
    }

    /// Stack sized by `history_depth` and `history_compression_level`
    pub fn from_settings(settings: &FlowSettings) -> Self {
        Self::new(settings.history_depth, settings.history_compression_level)
    }

    /// Record the current state of the document
    ///
    /// This truncates any redo history.
    pub fn push(&mut self, doc: &FlowDocument) -> Result<()> {
        self.push_records(&doc.snapshot())
    }

    pub fn push_records(&mut self, records: &[Value]) -> Result<()> {
        let json = serde_json::to_vec(records)?;
        let compressed = zstd::encode_all(&json[..], self.compression_level)
            .map_err(|e| FlowGraphError::Compression(e.to_string()))?;

        while self.snapshots.len() > self.current + 1 {
            self.snapshots.pop_back();
        }
        self.snapshots.push_back(compressed);
        self.current = self.snapshots.len() - 1;

        while self.snapshots.len() > self.max_snapshots {
            self.snapshots.pop_front();
            self.current = self.current.saturating_sub(1);
        }
        Ok(())
    }

    /// Move back one snapshot
    pub fn undo(&mut self) -> Option<Result<Vec<Value>>> {
        if !self.can_undo() {
            return None;
        }
        self.current -= 1;
        Some(self.decompress(self.current))
    }

    /// Move forward one snapshot
    pub fn redo(&mut self) -> Option<Result<Vec<Value>>> {
        if !self.can_redo() {
            return None;
        }
        self.current += 1;
        Some(self.decompress(self.current))
    }

    /// Step back and restore the previous snapshot into `doc`
    ///
    /// Returns false when there is nothing to undo.
    pub fn undo_into(&mut self, doc: &mut FlowDocument) -> Result<bool> {
        match self.undo() {
            Some(records) => {
                doc.restore_snapshot(records?)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn redo_into(&mut self, doc: &mut FlowDocument) -> Result<bool> {
        match self.redo() {
            Some(records) => {
                doc.restore_snapshot(records?)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn current(&self) -> Option<Result<Vec<Value>>> {
        if self.snapshots.is_empty() {
            None
        } else {
            Some(self.decompress(self.current))
        }
    }

    pub fn can_undo(&self) -> bool {
        self.current > 0
    }

    pub fn can_redo(&self) -> bool {
        self.current + 1 < self.snapshots.len()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
        self.current = 0;
    }

    /// Total compressed size of all snapshots
    pub fn compressed_size(&self) -> usize {
        self.snapshots.iter().map(Vec::len).sum()
    }

    fn decompress(&self, index: usize) -> Result<Vec<Value>> {
        let compressed = self
            .snapshots
            .get(index)
            .ok_or_else(|| FlowGraphError::not_found("Snapshot", index.to_string()))?;
        let json = zstd::decode_all(&compressed[..])
            .map_err(|e| FlowGraphError::Compression(e.to_string()))?;
        Ok(serde_json::from_slice(&json)?)
    }
}

impl Default for HistoryStack {
    fn default() -> Self {
        Self::from_settings(&FlowSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_document, test_registry};
    use crate::types::{Node, Workspace};
    use serde_json::json;

    fn sample_flow() -> Value {
        json!([
            {"id": "t1", "type": "tab", "label": "Flow 1", "env": [{"name": "A", "value": "1"}]},
            {"id": "t2", "type": "tab", "label": "Flow 2", "locked": true},
            {"id": "sf1", "type": "subflow", "name": "Doubler", "info": "",
             "in": [{"x": 40, "y": 40, "wires": [{"id": "f1"}]}],
             "out": [{"x": 300, "y": 40, "wires": [{"id": "f1", "port": 0}]}]},
            {"id": "f1", "type": "function", "z": "sf1", "x": 150, "y": 40,
             "func": "msg.payload *= 2; return msg;", "wires": [[]]},
            {"id": "b1", "type": "mqtt-broker", "z": "t1", "broker": "localhost", "port": 1883},
            {"id": "n1", "type": "inject", "z": "t1", "x": 100, "y": 80, "g": "g1", "wires": [["i1"]]},
            {"id": "i1", "type": "subflow:sf1", "z": "t1", "x": 260, "y": 80, "wires": [["j1"]]},
            {"id": "j1", "type": "junction", "z": "t1", "x": 360, "y": 80, "wires": [["m1"]]},
            {"id": "m1", "type": "mqtt out", "z": "t1", "x": 460, "y": 80, "broker": "b1", "wires": []},
            {"id": "g1", "type": "group", "z": "t1", "name": "Inputs", "nodes": ["n1"],
             "x": 60, "y": 40, "w": 100, "h": 80, "style": {"label": true}},
            {"id": "x1", "type": "mystery", "z": "t2", "x": 10, "y": 10, "secret": 42, "wires": [["x2"]]},
            {"id": "x2", "type": "debug", "z": "t2", "x": 200, "y": 10, "wires": []}
        ])
    }

    #[test]
    fn test_export_import_round_trip() {
        let mut doc = test_document();
        doc.import_value(sample_flow(), ImportOptions::default())
            .unwrap();
        let exported = doc.create_complete_node_set(false);

        let mut fresh = FlowDocument::new(test_registry());
        fresh
            .import_value(Value::Array(exported.clone()), ImportOptions::default())
            .unwrap();

        assert_eq!(fresh.create_complete_node_set(false), exported);
        assert_eq!(fresh.links().count(), doc.links().count());
        assert_eq!(fresh.get_node("x1").unwrap().property("secret"), None);
        assert!(fresh.get_node("x1").unwrap().is_unknown());
    }

    #[test]
    fn test_restore_snapshot_replaces_contents() {
        let mut doc = test_document();
        doc.import_value(sample_flow(), ImportOptions::default())
            .unwrap();
        doc.set_active_workspace(Some("t1".into()));
        let snapshot = doc.snapshot();

        doc.remove_node("m1");
        doc.add_workspace(Workspace::new("t9", "Scratch")).unwrap();
        doc.restore_snapshot(snapshot.clone()).unwrap();

        assert!(doc.workspace("t9").is_none());
        assert!(doc.get_node("m1").is_some());
        assert_eq!(doc.active_workspace(), Some("t1"));
        assert_eq!(doc.snapshot(), snapshot);
    }

    #[test]
    fn test_undo_redo_document() {
        let mut doc = test_document();
        let mut history = HistoryStack::from_settings(doc.settings());
        doc.add_workspace(Workspace::new("t1", "Flow 1")).unwrap();
        history.push(&doc).unwrap();

        doc.add_node(Node::new("n1", "inject").on("t1").at(100.0, 100.0))
            .unwrap();
        history.push(&doc).unwrap();

        assert!(history.undo_into(&mut doc).unwrap());
        assert!(doc.get_node("n1").is_none());
        assert!(doc.workspace("t1").is_some());
        assert!(!history.undo_into(&mut doc).unwrap());

        assert!(history.redo_into(&mut doc).unwrap());
        assert_eq!(doc.get_node("n1").unwrap().x, 100.0);
        assert!(!history.can_redo());
    }

    fn records(label: &str) -> Vec<Value> {
        vec![json!({"id": "t1", "type": "tab", "label": label})]
    }

    #[test]
    fn test_push_truncates_redo() {
        let mut stack = HistoryStack::new(10, 3);
        stack.push_records(&records("first")).unwrap();
        stack.push_records(&records("second")).unwrap();
        stack.undo();

        stack.push_records(&records("third")).unwrap();
        assert!(!stack.can_redo());
        assert_eq!(stack.current().unwrap().unwrap(), records("third"));
    }

    #[test]
    fn test_depth_is_bounded() {
        let mut stack = HistoryStack::new(3, 1);
        for i in 0..5 {
            stack.push_records(&records(&format!("flow {}", i))).unwrap();
        }
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.current().unwrap().unwrap(), records("flow 4"));

        stack.undo();
        let oldest = stack.undo().unwrap().unwrap();
        assert_eq!(oldest, records("flow 2"));
        assert!(!stack.can_undo());
        assert!(stack.compressed_size() > 0);
    }
}
