//! Flow Graph - in-memory model of node-wired flows
//!
//! This crate holds the editable representation of a flow document: nodes,
//! links, tabs (workspaces) and subflows, together with the structural
//! transformations performed on it:
//!
//! - Graph mutation with cascading removal and config-node bookkeeping
//! - Export to and import from the flat interchange JSON format, including id
//!   remapping, config-node deduplication and subflow cycle detection
//! - Subflow port editing, selection-to-subflow conversion and deletion
//! - Three-way diff, conflict detection and merge of flow snapshots
//! - Compressed snapshot-based undo/redo
//!
//! # Architecture
//!
//! - `FlowDocument`: entity store and mutation API; import, export, diff and
//!   validation add their operations to it from their own modules
//! - `TypeRegistry`: node type definitions grouped into node sets
//! - `EventSink`: observer channel for document and registry events
//!
//! # Example
//!
//! ```ignore
//! use flow_graph::{FlowBuilder, FlowDocument, ImportOptions, TypeRegistry};
//!
//! let mut doc = FlowDocument::new(TypeRegistry::new());
//! let flow = FlowBuilder::new()
//!     .tab("t1", "Flow 1")
//!     .node("n1", "inject", (100.0, 100.0))
//!     .node("n2", "debug", (300.0, 100.0))
//!     .wire("n1", 0, "n2")
//!     .build_value();
//! doc.import_value(flow, ImportOptions::default())?;
//! ```

pub mod builder;
pub mod convert;
pub mod descriptor;
pub mod diff;
pub mod document;
pub mod error;
pub mod events;
pub mod import;
pub mod registry;
pub mod settings;
pub mod subflow;
pub mod types;
pub mod undo;
pub mod validation;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types
pub use builder::FlowBuilder;
pub use descriptor::{CredentialKind, PropertyDefinition, TypeDefinition};
pub use diff::{generate_diff, identify_conflicts, FlowDiff, MergeReport, ParsedFlows, Resolution};
pub use document::{FlowDocument, LinkFilter, NodeFilter, RemovedEntities};
pub use error::{ErrorCode, FlowGraphError, Result};
pub use events::{EventSink, FlowEvent, NullEventSink, VecEventSink};
pub use import::{ImportOptions, ImportResult, ImportWarning};
pub use registry::{NodeSet, TypeRegistry};
pub use settings::FlowSettings;
pub use subflow::{ConvertResult, SubflowChange, SubflowOperations};
pub use types::{Group, Junction, Link, Node, NodeId, PortRole, Subflow, SubflowPort, Workspace};
pub use undo::HistoryStack;
pub use validation::{validate_document, NodeValidator, ValidationError};
