//! Node type registry
//!
//! Maps node type strings to their [`TypeDefinition`]s and tracks the node
//! sets (one package's worth of types) the definitions belong to.
//!
//! # Usage
//!
//! ```ignore
//! use flow_graph::{TypeRegistry, NodeSet, TypeDefinition};
//!
//! let mut registry = TypeRegistry::new();
//! registry.add_node_set(NodeSet::new("node-red", "common", vec!["inject".into()]));
//! registry.register_node_type(TypeDefinition::new("inject", "common").with_outputs(1));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::descriptor::{TypeDefinition, CORE_NAMESPACE, SUBFLOWS_CATEGORY};
use crate::error::{FlowGraphError, Result};
use crate::events::{emit, EventSink, FlowEvent, NullEventSink};
use crate::types::SUBFLOW_TYPE_PREFIX;

/// One package's worth of node types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSet {
    /// `<module>/<name>`
    pub id: String,
    /// Owning module (package)
    pub module: String,
    /// Set name within the module
    pub name: String,
    /// Types provided by this set
    pub types: Vec<String>,
    pub enabled: bool,
    /// Whether any of its types has been registered
    #[serde(default)]
    pub added: bool,
}

impl NodeSet {
    /// Create an enabled set; the id is derived from module and name
    pub fn new(module: impl Into<String>, name: impl Into<String>, types: Vec<String>) -> Self {
        let module = module.into();
        let name = name.into();
        Self {
            id: format!("{}/{}", module, name),
            module,
            name,
            types,
            enabled: true,
            added: false,
        }
    }
}

/// Registry of node types and the node sets providing them
pub struct TypeRegistry {
    definitions: HashMap<String, TypeDefinition>,
    node_sets: HashMap<String, NodeSet>,
    /// Sets in the order they were listed
    node_list: Vec<String>,
    type_to_set: HashMap<String, String>,
    /// module -> set name -> set id
    modules: HashMap<String, HashMap<String, String>>,
    events: Arc<dyn EventSink>,
}

impl TypeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            definitions: HashMap::new(),
            node_sets: HashMap::new(),
            node_list: Vec::new(),
            type_to_set: HashMap::new(),
            modules: HashMap::new(),
            events: Arc::new(NullEventSink),
        }
    }

    /// Route registry events to the given sink
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub(crate) fn set_event_sink(&mut self, events: Arc<dyn EventSink>) {
        self.events = events;
    }

    // =========================================================================
    // Node sets
    // =========================================================================

    /// Replace the node list and index every set in it
    pub fn set_node_list(&mut self, sets: Vec<NodeSet>) {
        self.node_list.clear();
        for set in sets {
            self.add_node_set(set);
        }
    }

    /// The sets in listing order
    pub fn node_list(&self) -> Vec<&NodeSet> {
        self.node_list
            .iter()
            .filter_map(|id| self.node_sets.get(id))
            .collect()
    }

    /// Index a node set and its types
    pub fn add_node_set(&mut self, mut set: NodeSet) {
        set.added = false;
        for node_type in &set.types {
            self.type_to_set.insert(node_type.clone(), set.id.clone());
        }
        self.modules
            .entry(set.module.clone())
            .or_default()
            .insert(set.name.clone(), set.id.clone());
        if !self.node_list.contains(&set.id) {
            self.node_list.push(set.id.clone());
        }

        let set_id = set.id.clone();
        self.node_sets.insert(set_id.clone(), set);
        emit(self.events.as_ref(), FlowEvent::NodeSetAdded { set_id });
    }

    /// Remove a node set and drop its types from the type index
    pub fn remove_node_set(&mut self, set_id: &str) -> Option<NodeSet> {
        let set = self.node_sets.remove(set_id)?;
        for node_type in &set.types {
            self.type_to_set.remove(node_type);
        }
        if let Some(sets) = self.modules.get_mut(&set.module) {
            sets.remove(&set.name);
            if sets.is_empty() {
                self.modules.remove(&set.module);
            }
        }
        self.node_list.retain(|id| id != set_id);

        emit(
            self.events.as_ref(),
            FlowEvent::NodeSetRemoved {
                set_id: set.id.clone(),
            },
        );
        Some(set)
    }

    pub fn enable_node_set(&mut self, set_id: &str) -> Result<()> {
        let set = self
            .node_sets
            .get_mut(set_id)
            .ok_or_else(|| FlowGraphError::not_found("Node set", set_id))?;
        set.enabled = true;
        emit(
            self.events.as_ref(),
            FlowEvent::NodeSetEnabled {
                set_id: set_id.to_string(),
            },
        );
        Ok(())
    }

    pub fn disable_node_set(&mut self, set_id: &str) -> Result<()> {
        let set = self
            .node_sets
            .get_mut(set_id)
            .ok_or_else(|| FlowGraphError::not_found("Node set", set_id))?;
        set.enabled = false;
        emit(
            self.events.as_ref(),
            FlowEvent::NodeSetDisabled {
                set_id: set_id.to_string(),
            },
        );
        Ok(())
    }

    pub fn node_set(&self, set_id: &str) -> Option<&NodeSet> {
        self.node_sets.get(set_id)
    }

    /// The set providing a node type
    pub fn node_set_for_type(&self, node_type: &str) -> Option<&NodeSet> {
        self.type_to_set
            .get(node_type)
            .and_then(|id| self.node_sets.get(id))
    }

    /// Set name -> set id for every set of a module
    pub fn module(&self, module: &str) -> Option<&HashMap<String, String>> {
        self.modules.get(module)
    }

    // =========================================================================
    // Node types
    // =========================================================================

    /// Bind a definition to its type
    ///
    /// Unless the definition belongs to the synthetic `subflows` category, the
    /// owning set is marked added and enabled, and the definition gets that
    /// set's translation namespace.
    pub fn register_node_type(&mut self, mut definition: TypeDefinition) {
        if definition.category != SUBFLOWS_CATEGORY {
            let set = self
                .type_to_set
                .get(&definition.node_type)
                .and_then(|id| self.node_sets.get_mut(id));
            match set {
                Some(set) => {
                    set.added = true;
                    set.enabled = true;
                    definition.set = Some(set.id.clone());
                    definition.namespace = Some(if set.module == CORE_NAMESPACE {
                        CORE_NAMESPACE.to_string()
                    } else {
                        set.id.clone()
                    });
                }
                None => log::debug!(
                    "Registering node type '{}' without a node set",
                    definition.node_type
                ),
            }
        }

        let node_type = definition.node_type.clone();
        self.definitions.insert(node_type.clone(), definition);
        emit(self.events.as_ref(), FlowEvent::NodeTypeAdded { node_type });
    }

    /// Remove a node type; only subflow instance types may be removed
    pub fn remove_node_type(&mut self, node_type: &str) -> Result<()> {
        if !node_type.starts_with(SUBFLOW_TYPE_PREFIX) {
            return Err(FlowGraphError::InvalidOperation(format!(
                "Attempt to remove node type '{}' that is not a subflow",
                node_type
            )));
        }
        self.definitions.remove(node_type);
        emit(
            self.events.as_ref(),
            FlowEvent::NodeTypeRemoved {
                node_type: node_type.to_string(),
            },
        );
        Ok(())
    }

    /// Get the definition of a node type
    pub fn get_node_type(&self, node_type: &str) -> Option<&TypeDefinition> {
        self.definitions.get(node_type)
    }

    pub(crate) fn get_node_type_mut(&mut self, node_type: &str) -> Option<&mut TypeDefinition> {
        self.definitions.get_mut(node_type)
    }

    /// Check if a node type is registered
    pub fn has_node_type(&self, node_type: &str) -> bool {
        self.definitions.contains_key(node_type)
    }

    /// List all registered node type strings
    pub fn node_types(&self) -> Vec<&str> {
        self.definitions.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
