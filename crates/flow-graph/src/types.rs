//! Core types for flow documents
//!
//! These types define the live entities of a flow document: nodes, links,
//! workspaces (tabs), subflow templates with their ports, groups and junctions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unique identifier for a node, tab, subflow, port, group or junction
pub type NodeId = String;

/// Property bag holding a node's declared properties
pub type Properties = Map<String, Value>;

/// Type prefix used by subflow instances (`subflow:<template id>`)
pub const SUBFLOW_TYPE_PREFIX: &str = "subflow:";

/// Node type given to placeholders for unresolvable types
pub const UNKNOWN_TYPE: &str = "unknown";

/// Generate a fresh entity id (16 hex characters)
pub fn new_id() -> NodeId {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Build the instance type string for a subflow template
pub fn subflow_instance_type(subflow_id: &str) -> String {
    format!("{}{}", SUBFLOW_TYPE_PREFIX, subflow_id)
}

/// Extract the template id from a `subflow:<id>` type string
pub fn subflow_id_from_type(node_type: &str) -> Option<&str> {
    node_type
        .strip_prefix(SUBFLOW_TYPE_PREFIX)
        .filter(|id| !id.is_empty())
}

/// Credential values of a node
///
/// `saved` is the last-known persisted baseline. Export only includes the
/// fields that differ from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// Current values (including `has_<field>` flags for passwords)
    pub values: Properties,
    /// Baseline as last loaded from or saved to the runtime
    pub saved: Properties,
}

impl Credentials {
    /// Create credentials with the given values and an empty baseline
    pub fn new(values: Properties) -> Self {
        Self {
            values,
            saved: Properties::new(),
        }
    }

    /// Set the baseline the export diff is computed against
    pub fn with_saved(mut self, saved: Properties) -> Self {
        self.saved = saved;
        self
    }
}

/// A node instance in a flow (ordinary node or config node)
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Node type (references a TypeDefinition, `subflow:<id>` or `unknown`)
    pub node_type: String,
    /// Owning workspace or subflow; `None` for global config nodes
    pub z: Option<NodeId>,
    /// Canvas position
    pub x: f64,
    pub y: f64,
    /// Number of input ports
    pub inputs: usize,
    /// Number of output ports
    pub outputs: usize,
    /// Output port indices, derived from `outputs` when added
    pub ports: Vec<usize>,
    /// Declared properties (keys from the type's defaults)
    pub properties: Properties,
    /// Secret fields
    pub credentials: Option<Credentials>,
    /// Nodes using this config node
    pub users: Vec<NodeId>,
    /// Original record of an unknown-type node, kept for lossless export
    pub original: Option<Properties>,
    /// JSON snapshot of each declared property at import time
    pub config_snapshot: BTreeMap<String, String>,
    /// Instance index for subflow instances
    pub instance_index: Option<usize>,
    /// Containing group
    pub group: Option<NodeId>,
    /// Needs redraw
    pub dirty: bool,
    /// Edited since last deploy
    pub changed: bool,
    /// Result of the last validation pass
    pub valid: bool,
}

impl Node {
    /// Create a new node with no properties
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            z: None,
            x: 0.0,
            y: 0.0,
            inputs: 0,
            outputs: 0,
            ports: Vec::new(),
            properties: Properties::new(),
            credentials: None,
            users: Vec::new(),
            original: None,
            config_snapshot: BTreeMap::new(),
            instance_index: None,
            group: None,
            dirty: false,
            changed: false,
            valid: true,
        }
    }

    /// Place the node on a workspace or subflow
    pub fn on(mut self, z: impl Into<String>) -> Self {
        self.z = Some(z.into());
        self
    }

    /// Set the canvas position
    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.x = x;
        self.y = y;
        self
    }

    /// Set the output count
    pub fn with_outputs(mut self, outputs: usize) -> Self {
        self.outputs = outputs;
        self
    }

    /// Set a property value
    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Get a property value
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Get a property as a string
    pub fn property_str(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(|v| v.as_str())
    }

    /// The node's `name` property, if set
    pub fn name(&self) -> Option<&str> {
        self.property_str("name").filter(|n| !n.is_empty())
    }

    /// Whether this is a placeholder for an unresolvable type
    pub fn is_unknown(&self) -> bool {
        self.node_type == UNKNOWN_TYPE
    }

    /// Template id if this node is a subflow instance
    pub fn subflow_template(&self) -> Option<&str> {
        subflow_id_from_type(&self.node_type)
    }

    /// Whether the node lives on the given workspace/subflow
    pub fn is_on(&self, z: &str) -> bool {
        self.z.as_deref() == Some(z)
    }
}

/// A directed edge from an output port to a node's input
///
/// Endpoints are entity ids: nodes, junctions or subflow port ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    /// Source entity ID
    pub source: NodeId,
    /// Source output index
    pub source_port: usize,
    /// Target entity ID
    pub target: NodeId,
}

impl Link {
    /// Create a new link
    pub fn new(source: impl Into<String>, source_port: usize, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_port,
            target: target.into(),
        }
    }

    /// Whether either endpoint is the given entity
    pub fn touches(&self, id: &str) -> bool {
        self.source == id || self.target == id
    }
}

/// A workspace (tab)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Workspace {
    /// Unique identifier
    pub id: NodeId,
    /// Tab label
    pub label: String,
    /// Whether the tab is disabled at runtime
    pub disabled: bool,
    /// Whether edits are blocked
    pub locked: bool,
    /// Description
    pub info: String,
    /// Other properties carried through import/export untouched
    pub extra: Properties,
}

impl Workspace {
    /// Create a new workspace
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            ..Self::default()
        }
    }
}

/// Role of a subflow port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortRole {
    Input,
    Output,
    Status,
}

/// A subflow port pseudo-node
///
/// Ports have real ids from creation so links can reference them directly.
#[derive(Debug, Clone, PartialEq)]
pub struct SubflowPort {
    pub id: NodeId,
    pub role: PortRole,
    /// Position within the port list (always 0 for status)
    pub index: usize,
    /// Owning subflow
    pub z: NodeId,
    pub x: f64,
    pub y: f64,
}

impl SubflowPort {
    /// Create a new port on the given subflow
    pub fn new(
        id: impl Into<String>,
        role: PortRole,
        index: usize,
        subflow_id: impl Into<String>,
        position: (f64, f64),
    ) -> Self {
        Self {
            id: id.into(),
            role,
            index,
            z: subflow_id.into(),
            x: position.0,
            y: position.1,
        }
    }
}

/// A subflow template
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Subflow {
    pub id: NodeId,
    pub name: String,
    pub info: String,
    /// Input ports (0 or 1)
    pub in_ports: Vec<SubflowPort>,
    /// Output ports, contiguous by index
    pub out_ports: Vec<SubflowPort>,
    /// Optional status port
    pub status_port: Option<SubflowPort>,
    pub changed: bool,
    pub dirty: bool,
    pub valid: bool,
    /// Other properties carried through import/export untouched
    pub extra: Properties,
}

impl Subflow {
    /// Create a new empty subflow template
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            valid: true,
            ..Self::default()
        }
    }

    /// All ports (inputs, outputs, status)
    pub fn ports(&self) -> impl Iterator<Item = &SubflowPort> {
        self.in_ports
            .iter()
            .chain(self.out_ports.iter())
            .chain(self.status_port.iter())
    }

    /// Find a port by ID
    pub fn find_port(&self, port_id: &str) -> Option<&SubflowPort> {
        self.ports().find(|p| p.id == port_id)
    }
}

/// A visual group of nodes on a workspace or subflow
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Group {
    pub id: NodeId,
    pub z: Option<NodeId>,
    pub name: String,
    /// Member ids (nodes, junctions or nested groups)
    pub nodes: Vec<NodeId>,
    /// Parent group
    pub parent: Option<NodeId>,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub style: Value,
    pub extra: Properties,
}

/// A wire junction: one input, one output
#[derive(Debug, Clone, PartialEq)]
pub struct Junction {
    pub id: NodeId,
    pub z: Option<NodeId>,
    pub x: f64,
    pub y: f64,
    pub group: Option<NodeId>,
}

/// Borrowed view of anything a link can attach to
#[derive(Debug, Clone, Copy)]
pub enum Endpoint<'a> {
    Node(&'a Node),
    Junction(&'a Junction),
    Port(&'a SubflowPort),
}

impl<'a> Endpoint<'a> {
    /// Entity id
    pub fn id(&self) -> &'a str {
        match self {
            Self::Node(n) => &n.id,
            Self::Junction(j) => &j.id,
            Self::Port(p) => &p.id,
        }
    }

    /// Owning workspace or subflow
    pub fn z(&self) -> Option<&'a str> {
        match self {
            Self::Node(n) => n.z.as_deref(),
            Self::Junction(j) => j.z.as_deref(),
            Self::Port(p) => Some(&p.z),
        }
    }

    pub fn x(&self) -> f64 {
        match self {
            Self::Node(n) => n.x,
            Self::Junction(j) => j.x,
            Self::Port(p) => p.x,
        }
    }

    pub fn y(&self) -> f64 {
        match self {
            Self::Node(n) => n.y,
            Self::Junction(j) => j.y,
            Self::Port(p) => p.y,
        }
    }

    /// Whether this endpoint is a subflow port pseudo-node
    pub fn is_port(&self) -> bool {
        matches!(self, Self::Port(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subflow_type_helpers() {
        assert_eq!(subflow_instance_type("abc"), "subflow:abc");
        assert_eq!(subflow_id_from_type("subflow:abc"), Some("abc"));
        assert_eq!(subflow_id_from_type("subflow:"), None);
        assert_eq!(subflow_id_from_type("inject"), None);
    }

    #[test]
    fn test_new_id_is_unique() {
        let a = new_id();
        let b = new_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_node_builder_methods() {
        let node = Node::new("n1", "inject")
            .on("t1")
            .at(100.0, 50.0)
            .with_outputs(2)
            .with_property("name", serde_json::json!("tick"));

        assert!(node.is_on("t1"));
        assert_eq!(node.name(), Some("tick"));
        assert_eq!(node.outputs, 2);
        assert!(!node.is_unknown());
        assert!(node.subflow_template().is_none());
    }

    #[test]
    fn test_subflow_ports_iteration() {
        let mut sf = Subflow::new("sf1", "My Subflow");
        sf.in_ports
            .push(SubflowPort::new("p-in", PortRole::Input, 0, "sf1", (10.0, 10.0)));
        sf.out_ports
            .push(SubflowPort::new("p-out", PortRole::Output, 0, "sf1", (200.0, 10.0)));
        sf.status_port = Some(SubflowPort::new("p-st", PortRole::Status, 0, "sf1", (200.0, 60.0)));

        assert_eq!(sf.ports().count(), 3);
        assert_eq!(sf.find_port("p-st").map(|p| p.role), Some(PortRole::Status));
    }

    #[test]
    fn test_link_serialization() {
        let link = Link::new("a", 1, "b");
        let json = serde_json::to_string(&link).unwrap();
        assert!(json.contains("sourcePort")); // camelCase
        assert!(link.touches("b"));
        assert!(!link.touches("c"));
    }
}
