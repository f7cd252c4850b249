//! Event types for document changes
//!
//! Events are sent from the document (or registry) to any observer, such as
//! a palette, sidebar or persistence layer, to report structural changes.

use serde::{Deserialize, Serialize};

/// Trait for sending flow events
///
/// This abstracts over the transport mechanism (channel, callback list, etc.)
/// allowing the document to be used in different contexts.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be sent (e.g., channel closed)
    fn send(&self, event: FlowEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// Events emitted while editing a flow document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FlowEvent {
    /// A node or config node was added
    #[serde(rename_all = "camelCase")]
    NodeAdded { node_id: String, node_type: String },

    /// A node or config node was removed
    #[serde(rename_all = "camelCase")]
    NodeRemoved { node_id: String, node_type: String },

    #[serde(rename_all = "camelCase")]
    WorkspaceAdded { workspace_id: String },

    #[serde(rename_all = "camelCase")]
    WorkspaceRemoved { workspace_id: String },

    #[serde(rename_all = "camelCase")]
    SubflowAdded { subflow_id: String },

    /// Ports or metadata of a subflow template changed
    #[serde(rename_all = "camelCase")]
    SubflowChanged { subflow_id: String },

    #[serde(rename_all = "camelCase")]
    SubflowRemoved { subflow_id: String },

    #[serde(rename_all = "camelCase")]
    NodeSetAdded { set_id: String },

    #[serde(rename_all = "camelCase")]
    NodeSetRemoved { set_id: String },

    #[serde(rename_all = "camelCase")]
    NodeSetEnabled { set_id: String },

    #[serde(rename_all = "camelCase")]
    NodeSetDisabled { set_id: String },

    #[serde(rename_all = "camelCase")]
    NodeTypeAdded { node_type: String },

    #[serde(rename_all = "camelCase")]
    NodeTypeRemoved { node_type: String },

    /// The document's unsaved-changes state flipped
    DirtyChanged { dirty: bool },

    /// The document was cleared; observers should drop all derived state
    Cleared,

    /// Non-fatal problems collected during an import, flushed once
    ImportWarnings { warnings: Vec<String> },
}

/// Send an event, logging instead of failing if the sink is gone
pub(crate) fn emit(sink: &dyn EventSink, event: FlowEvent) {
    if let Err(e) = sink.send(event) {
        log::warn!("Dropped flow event: {}", e);
    }
}

/// A no-op event sink that discards all events
///
/// Useful for testing or when events aren't needed.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: FlowEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
pub struct VecEventSink {
    events: std::sync::Mutex<Vec<FlowEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<FlowEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: FlowEvent) -> Result<(), EventError> {
        let mut events = self.events.lock().map_err(|_| EventError {
            message: "Event buffer poisoned".to_string(),
        })?;
        events.push(event);
        Ok(())
    }
}
