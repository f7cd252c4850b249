//! Flow document: entity store and graph mutation API
//!
//! `FlowDocument` owns every live entity of one flow document and keeps the
//! referential invariants between them:
//! - every link endpoint exists and shares the same `z`
//! - config node `users` lists only name live nodes
//! - removing a node removes its links and exclusive config nodes
//! - removing a workspace removes everything on it
//!
//! Import, export, subflow operations and diff/merge build on top of this
//! API in their own modules.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::descriptor::{TypeDefinition, TypeLabel, SUBFLOWS_CATEGORY};
use crate::error::{FlowGraphError, Result};
use crate::events::{emit, EventSink, FlowEvent, NullEventSink};
use crate::registry::TypeRegistry;
use crate::settings::FlowSettings;
use crate::types::{
    subflow_instance_type, Endpoint, Group, Junction, Link, Node, NodeId, Subflow, Workspace,
};
use crate::validation::{NodeValidator, RequiredPropertyValidator};

/// Entities removed by a cascading operation
///
/// Callers use this to build undo history entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemovedEntities {
    pub nodes: Vec<Node>,
    pub links: Vec<Link>,
    pub groups: Vec<Group>,
    pub junctions: Vec<Junction>,
    pub workspaces: Vec<Workspace>,
    pub subflows: Vec<Subflow>,
}

impl RemovedEntities {
    /// Append everything from another result
    pub fn merge(&mut self, other: RemovedEntities) {
        self.nodes.extend(other.nodes);
        self.links.extend(other.links);
        self.groups.extend(other.groups);
        self.junctions.extend(other.junctions);
        self.workspaces.extend(other.workspaces);
        self.subflows.extend(other.subflows);
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.links.is_empty()
            && self.groups.is_empty()
            && self.junctions.is_empty()
            && self.workspaces.is_empty()
            && self.subflows.is_empty()
    }
}

/// Node query: every set field must match
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub z: Option<NodeId>,
    pub node_type: Option<String>,
}

impl NodeFilter {
    /// Nodes on the given workspace or subflow
    pub fn on(z: impl Into<String>) -> Self {
        Self {
            z: Some(z.into()),
            node_type: None,
        }
    }

    /// Nodes of the given type
    pub fn of_type(node_type: impl Into<String>) -> Self {
        Self {
            z: None,
            node_type: Some(node_type.into()),
        }
    }

    pub fn and_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }

    fn matches(&self, node: &Node) -> bool {
        if let Some(z) = &self.z {
            if node.z.as_ref() != Some(z) {
                return false;
            }
        }
        if let Some(node_type) = &self.node_type {
            if &node.node_type != node_type {
                return false;
            }
        }
        true
    }
}

/// Match on one end of a link
#[derive(Debug, Clone, Default)]
pub struct EndpointFilter {
    pub id: Option<NodeId>,
    pub z: Option<NodeId>,
}

/// Link query: every set field must match
#[derive(Debug, Clone, Default)]
pub struct LinkFilter {
    pub source: Option<EndpointFilter>,
    pub target: Option<EndpointFilter>,
    pub source_port: Option<usize>,
}

impl LinkFilter {
    /// Links leaving the given entity
    pub fn from_source(id: impl Into<String>) -> Self {
        Self {
            source: Some(EndpointFilter {
                id: Some(id.into()),
                z: None,
            }),
            ..Self::default()
        }
    }

    /// Links entering the given entity
    pub fn to_target(id: impl Into<String>) -> Self {
        Self {
            target: Some(EndpointFilter {
                id: Some(id.into()),
                z: None,
            }),
            ..Self::default()
        }
    }

    /// Links whose source lives on the given workspace or subflow
    pub fn source_on(z: impl Into<String>) -> Self {
        Self {
            source: Some(EndpointFilter {
                id: None,
                z: Some(z.into()),
            }),
            ..Self::default()
        }
    }

    pub fn with_source_port(mut self, port: usize) -> Self {
        self.source_port = Some(port);
        self
    }
}

/// The live flow document
pub struct FlowDocument {
    pub(crate) nodes: Vec<Node>,
    pub(crate) config_nodes: IndexMap<NodeId, Node>,
    pub(crate) links: Vec<Link>,
    pub(crate) workspaces: IndexMap<NodeId, Workspace>,
    pub(crate) workspaces_order: Vec<NodeId>,
    pub(crate) subflows: IndexMap<NodeId, Subflow>,
    pub(crate) groups: IndexMap<NodeId, Group>,
    pub(crate) junctions: IndexMap<NodeId, Junction>,
    registry: TypeRegistry,
    settings: FlowSettings,
    events: Arc<dyn EventSink>,
    validator: Arc<dyn NodeValidator>,
    active_workspace: Option<NodeId>,
    pub(crate) default_workspace: Option<NodeId>,
    dirty: bool,
}

impl FlowDocument {
    /// Create an empty document over the given registry
    pub fn new(registry: TypeRegistry) -> Self {
        Self {
            nodes: Vec::new(),
            config_nodes: IndexMap::new(),
            links: Vec::new(),
            workspaces: IndexMap::new(),
            workspaces_order: Vec::new(),
            subflows: IndexMap::new(),
            groups: IndexMap::new(),
            junctions: IndexMap::new(),
            registry,
            settings: FlowSettings::default(),
            events: Arc::new(NullEventSink),
            validator: Arc::new(RequiredPropertyValidator),
            active_workspace: None,
            default_workspace: None,
            dirty: false,
        }
    }

    pub fn with_settings(mut self, settings: FlowSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Route document and registry events to the given sink
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.registry.set_event_sink(events.clone());
        self.events = events;
        self
    }

    /// Replace the node validation collaborator
    pub fn with_validator(mut self, validator: Arc<dyn NodeValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut TypeRegistry {
        &mut self.registry
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    pub(crate) fn validator(&self) -> Arc<dyn NodeValidator> {
        self.validator.clone()
    }

    pub(crate) fn emit(&self, event: FlowEvent) {
        emit(self.events.as_ref(), event);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Get a node or config node by id (config nodes are checked first)
    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.config_nodes
            .get(id)
            .or_else(|| self.nodes.iter().find(|n| n.id == id))
    }

    pub fn get_node_mut(&mut self, id: &str) -> Option<&mut Node> {
        if self.config_nodes.contains_key(id) {
            return self.config_nodes.get_mut(id);
        }
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn is_config_node(&self, id: &str) -> bool {
        self.config_nodes.contains_key(id)
    }

    pub fn workspace(&self, id: &str) -> Option<&Workspace> {
        self.workspaces.get(id)
    }

    pub fn workspace_mut(&mut self, id: &str) -> Option<&mut Workspace> {
        self.workspaces.get_mut(id)
    }

    pub fn subflow(&self, id: &str) -> Option<&Subflow> {
        self.subflows.get(id)
    }

    pub fn subflow_mut(&mut self, id: &str) -> Option<&mut Subflow> {
        self.subflows.get_mut(id)
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.get(id)
    }

    pub fn junction(&self, id: &str) -> Option<&Junction> {
        self.junctions.get(id)
    }

    /// Ordinary nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.iter()
    }

    pub fn config_nodes(&self) -> impl Iterator<Item = &Node> {
        self.config_nodes.values()
    }

    pub fn subflows(&self) -> impl Iterator<Item = &Subflow> {
        self.subflows.values()
    }

    /// Workspaces in tab order
    pub fn workspaces(&self) -> impl Iterator<Item = &Workspace> {
        self.workspaces_order
            .iter()
            .filter_map(|id| self.workspaces.get(id))
    }

    pub fn workspace_order(&self) -> &[NodeId] {
        &self.workspaces_order
    }

    /// Reorder tabs; ids not naming a workspace are ignored, missing ones keep
    /// their relative order at the end
    pub fn set_workspace_order(&mut self, order: Vec<NodeId>) {
        let mut next: Vec<NodeId> = order
            .into_iter()
            .filter(|id| self.workspaces.contains_key(id))
            .collect();
        for id in &self.workspaces_order {
            if !next.contains(id) {
                next.push(id.clone());
            }
        }
        self.workspaces_order = next;
        self.set_dirty(true);
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn junctions(&self) -> impl Iterator<Item = &Junction> {
        self.junctions.values()
    }

    pub fn filter_nodes(&self, filter: &NodeFilter) -> Vec<&Node> {
        self.nodes.iter().filter(|n| filter.matches(n)).collect()
    }

    pub fn filter_links(&self, filter: &LinkFilter) -> Vec<&Link> {
        self.links
            .iter()
            .filter(|link| {
                filter
                    .source
                    .as_ref()
                    .map_or(true, |f| self.endpoint_matches(&link.source, f))
                    && filter
                        .target
                        .as_ref()
                        .map_or(true, |f| self.endpoint_matches(&link.target, f))
                    && filter.source_port.map_or(true, |p| link.source_port == p)
            })
            .collect()
    }

    fn endpoint_matches(&self, id: &str, filter: &EndpointFilter) -> bool {
        if let Some(wanted) = &filter.id {
            if wanted != id {
                return false;
            }
        }
        if let Some(z) = &filter.z {
            if self.endpoint(id).and_then(|e| e.z()) != Some(z.as_str()) {
                return false;
            }
        }
        true
    }

    /// Resolve anything a link may attach to: node, junction or subflow port
    pub fn endpoint(&self, id: &str) -> Option<Endpoint<'_>> {
        if let Some(node) = self.nodes.iter().find(|n| n.id == id) {
            return Some(Endpoint::Node(node));
        }
        if let Some(junction) = self.junctions.get(id) {
            return Some(Endpoint::Junction(junction));
        }
        self.subflows
            .values()
            .find_map(|sf| sf.find_port(id))
            .map(Endpoint::Port)
    }

    /// Whether any entity already uses this id
    pub fn id_in_use(&self, id: &str) -> bool {
        self.workspaces.contains_key(id)
            || self.subflows.contains_key(id)
            || self.groups.contains_key(id)
            || self.get_node(id).is_some()
            || self.endpoint(id).is_some()
    }

    /// Instances of a subflow template
    pub fn subflow_instances(&self, subflow_id: &str) -> Vec<&Node> {
        let instance_type = subflow_instance_type(subflow_id);
        self.filter_nodes(&NodeFilter::of_type(instance_type))
    }

    pub fn type_definition(&self, node: &Node) -> Option<&TypeDefinition> {
        self.registry.get_node_type(&node.node_type)
    }

    /// Display label: the node's name, else its type's label
    pub fn node_label(&self, node: &Node) -> String {
        if let Some(name) = node.name() {
            return name.to_string();
        }
        match self.type_definition(node).map(|d| &d.label) {
            Some(TypeLabel::Static(label)) => label.clone(),
            Some(TypeLabel::SubflowName(id)) => self
                .subflows
                .get(id)
                .map(|sf| sf.name.clone())
                .unwrap_or_else(|| node.node_type.clone()),
            None => node.node_type.clone(),
        }
    }

    /// Declared properties holding config node references, with the id they
    /// currently resolve to
    pub(crate) fn config_references(&self, node: &Node) -> Vec<(String, NodeId)> {
        let Some(def) = self.type_definition(node) else {
            return Vec::new();
        };
        def.config_properties()
            .filter(|(_, config_type)| {
                self.registry
                    .get_node_type(config_type)
                    .map_or(false, |d| d.is_config())
            })
            .filter_map(|(prop, _)| {
                let id = node.property_str(prop)?;
                self.config_nodes
                    .contains_key(id)
                    .then(|| (prop.to_string(), id.to_string()))
            })
            .collect()
    }

    pub fn active_workspace(&self) -> Option<&str> {
        self.active_workspace.as_deref()
    }

    /// Set the workspace or subflow being edited
    pub fn set_active_workspace(&mut self, id: Option<NodeId>) {
        self.active_workspace = id;
    }

    /// The subflow being edited, if the active workspace is one
    pub fn active_subflow(&self) -> Option<&Subflow> {
        self.active_workspace
            .as_deref()
            .and_then(|id| self.subflows.get(id))
    }

    pub fn default_workspace(&self) -> Option<&str> {
        self.default_workspace.as_deref()
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        if self.dirty != dirty {
            self.dirty = dirty;
            self.emit(FlowEvent::DirtyChanged { dirty });
        }
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Add a node; config-category types go to the config store
    pub fn add_node(&mut self, node: Node) -> Result<()> {
        self.insert_node(node, 0)
    }

    /// Add a node, widening `outputs` to cover `wire_count` declared wires
    pub(crate) fn insert_node(&mut self, mut node: Node, wire_count: usize) -> Result<()> {
        if self.id_in_use(&node.id) {
            return Err(FlowGraphError::InvalidOperation(format!(
                "Node id '{}' is already in use",
                node.id
            )));
        }
        if self.type_definition(&node).map_or(false, |d| d.is_config()) {
            return self.add_config_node(node);
        }

        node.outputs = node.outputs.max(wire_count);
        node.ports = (0..node.outputs).collect();
        node.dirty = true;

        let is_instance = node.subflow_template().is_some()
            || self
                .type_definition(&node)
                .map_or(false, |d| d.category == SUBFLOWS_CATEGORY);
        if is_instance && node.instance_index.is_none() {
            let last = self
                .nodes
                .iter()
                .filter_map(|n| n.instance_index)
                .max()
                .unwrap_or(0);
            node.instance_index = Some(last + 1);
        }

        self.attach_config_users(&node);
        self.emit(FlowEvent::NodeAdded {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
        });
        self.nodes.push(node);
        self.set_dirty(true);
        Ok(())
    }

    /// Add a node to the config store regardless of its type's category
    ///
    /// Used for unknown-type placeholders that look like config nodes.
    pub fn add_config_node(&mut self, node: Node) -> Result<()> {
        if self.id_in_use(&node.id) {
            return Err(FlowGraphError::InvalidOperation(format!(
                "Node id '{}' is already in use",
                node.id
            )));
        }
        self.attach_config_users(&node);
        self.emit(FlowEvent::NodeAdded {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
        });
        self.config_nodes.insert(node.id.clone(), node);
        self.set_dirty(true);
        Ok(())
    }

    fn attach_config_users(&mut self, node: &Node) {
        for (_, config_id) in self.config_references(node) {
            if let Some(config) = self.config_nodes.get_mut(&config_id) {
                if !config.users.contains(&node.id) {
                    config.users.push(node.id.clone());
                }
            }
        }
    }

    /// Re-scan a stored node's config references and register it as a user
    pub fn update_config_node_users(&mut self, node_id: &str) {
        if let Some(node) = self.get_node(node_id).cloned() {
            self.attach_config_users(&node);
        }
    }

    /// Detach `user_id` from a config node it no longer references
    ///
    /// Exclusive config nodes are removed along with what they reference.
    pub(crate) fn release_config_node(
        &mut self,
        config_id: &str,
        user_id: &str,
    ) -> RemovedEntities {
        let mut removed = RemovedEntities::default();
        let exclusive = self
            .config_nodes
            .get(config_id)
            .and_then(|c| self.registry.get_node_type(&c.node_type))
            .map_or(false, |d| d.exclusive);
        if exclusive {
            if let Some(config) = self.config_nodes.get(config_id).cloned() {
                log::debug!(
                    "Removing exclusive config node '{}' with user '{}'",
                    config_id,
                    user_id
                );
                let nested = self.remove_node(config_id);
                removed.nodes.push(config);
                removed.merge(nested);
            }
        } else if let Some(config) = self.config_nodes.get_mut(config_id) {
            config.users.retain(|u| u != user_id);
        }
        removed
    }

    /// Remove a node or config node
    ///
    /// For ordinary nodes, every link touching the node is removed and each
    /// referenced config node is either removed too (exclusive) or detached.
    /// The result holds the removed links and cascaded config nodes; the node
    /// itself is not included.
    pub fn remove_node(&mut self, id: &str) -> RemovedEntities {
        let mut removed = RemovedEntities::default();
        let node = match self.config_nodes.shift_remove(id) {
            Some(node) => node,
            None => match self.nodes.iter().position(|n| n.id == id) {
                Some(index) => self.nodes.remove(index),
                None => return removed,
            },
        };

        let (gone, kept): (Vec<Link>, Vec<Link>) = std::mem::take(&mut self.links)
            .into_iter()
            .partition(|l| l.touches(id));
        self.links = kept;
        removed.links = gone;

        for (_, config_id) in self.config_references(&node) {
            removed.merge(self.release_config_node(&config_id, id));
        }

        if let Some(group_id) = &node.group {
            if let Some(group) = self.groups.get_mut(group_id) {
                group.nodes.retain(|member| member != id);
            }
        }

        if let Some(hook) = self
            .type_definition(&node)
            .and_then(|d| d.on_remove.clone())
        {
            hook.call(&node);
        }

        self.emit(FlowEvent::NodeRemoved {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
        });
        self.set_dirty(true);
        removed
    }

    /// Move a node to another workspace or subflow
    pub(crate) fn move_node_to(&mut self, id: &str, z: &str) {
        if let Some(node) = self.get_node_mut(id) {
            node.z = Some(z.to_string());
            node.dirty = true;
        }
    }

    // =========================================================================
    // Links
    // =========================================================================

    pub fn add_link(&mut self, link: Link) {
        self.links.push(link);
        self.set_dirty(true);
    }

    /// Remove one matching link; returns whether it was present
    pub fn remove_link(&mut self, link: &Link) -> bool {
        match self.links.iter().position(|l| l == link) {
            Some(index) => {
                self.links.remove(index);
                self.set_dirty(true);
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Workspaces
    // =========================================================================

    pub fn add_workspace(&mut self, workspace: Workspace) -> Result<()> {
        if self.id_in_use(&workspace.id) {
            return Err(FlowGraphError::InvalidOperation(format!(
                "Workspace id '{}' is already in use",
                workspace.id
            )));
        }
        let workspace_id = workspace.id.clone();
        self.workspaces_order.push(workspace_id.clone());
        self.workspaces.insert(workspace_id.clone(), workspace);
        self.emit(FlowEvent::WorkspaceAdded { workspace_id });
        self.set_dirty(true);
        Ok(())
    }

    /// Remove a workspace and everything on it
    pub fn remove_workspace(&mut self, id: &str) -> Result<RemovedEntities> {
        let workspace = self
            .workspaces
            .shift_remove(id)
            .ok_or_else(|| FlowGraphError::not_found("Workspace", id))?;
        self.workspaces_order.retain(|w| w != id);

        let mut removed = self.remove_z_contents(id);
        removed.workspaces.push(workspace);

        if self.active_workspace.as_deref() == Some(id) {
            self.active_workspace = None;
        }
        if self.default_workspace.as_deref() == Some(id) {
            self.default_workspace = None;
        }
        log::debug!(
            "Removed workspace '{}' with {} nodes and {} links",
            id,
            removed.nodes.len(),
            removed.links.len()
        );
        self.emit(FlowEvent::WorkspaceRemoved {
            workspace_id: id.to_string(),
        });
        self.set_dirty(true);
        Ok(removed)
    }

    /// Remove every node, config node, junction and group owned by `z`
    pub(crate) fn remove_z_contents(&mut self, z: &str) -> RemovedEntities {
        let mut removed = RemovedEntities::default();
        let ids: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.is_on(z))
            .chain(self.config_nodes.values().filter(|n| n.is_on(z)))
            .map(|n| n.id.clone())
            .collect();
        for id in ids {
            // May already be gone through an exclusive cascade
            let Some(node) = self.get_node(&id).cloned() else {
                continue;
            };
            let result = self.remove_node(&id);
            removed.nodes.push(node);
            removed.merge(result);
        }

        let junction_ids: Vec<NodeId> = self
            .junctions
            .values()
            .filter(|j| j.z.as_deref() == Some(z))
            .map(|j| j.id.clone())
            .collect();
        for id in junction_ids {
            removed.merge(self.remove_junction(&id));
        }

        removed.groups = self.remove_groups_on(z);
        removed
    }

    // =========================================================================
    // Subflows
    // =========================================================================

    /// Register a subflow template and its `subflow:<id>` instance type
    ///
    /// With `create_new_ids`, a name clash is resolved by appending ` (2)`,
    /// ` (3)`, ... until the name is unique.
    pub fn add_subflow(&mut self, mut subflow: Subflow, create_new_ids: bool) {
        if create_new_ids {
            let base = subflow.name.clone();
            let mut candidate = base.clone();
            let mut copy = 1;
            while self.subflows.values().any(|sf| sf.name == candidate) {
                copy += 1;
                candidate = format!("{} ({})", base, copy);
            }
            subflow.name = candidate;
        }

        let mut definition =
            TypeDefinition::new(subflow_instance_type(&subflow.id), SUBFLOWS_CATEGORY)
                .with_default("name", serde_json::Value::String(String::new()))
                .with_inputs(subflow.in_ports.len())
                .with_outputs(subflow.out_ports.len());
        definition.label = TypeLabel::SubflowName(subflow.id.clone());
        self.registry.register_node_type(definition);

        let subflow_id = subflow.id.clone();
        self.subflows.insert(subflow_id.clone(), subflow);
        self.emit(FlowEvent::SubflowAdded { subflow_id });
        self.set_dirty(true);
    }

    /// Remove a subflow template and its instance type (no cascade)
    pub fn remove_subflow(&mut self, id: &str) -> Option<Subflow> {
        let subflow = self.subflows.shift_remove(id)?;
        if let Err(e) = self.registry.remove_node_type(&subflow_instance_type(id)) {
            log::warn!("Failed to remove subflow type for '{}': {}", id, e);
        }
        self.emit(FlowEvent::SubflowRemoved {
            subflow_id: id.to_string(),
        });
        self.set_dirty(true);
        Some(subflow)
    }

    /// Whether `subflow_id` contains an instance of `candidate_id`, directly or
    /// through nested subflows
    pub fn subflow_contains(&self, subflow_id: &str, candidate_id: &str) -> bool {
        let mut visited = HashSet::new();
        self.subflow_contains_inner(subflow_id, candidate_id, &mut visited)
    }

    fn subflow_contains_inner(
        &self,
        subflow_id: &str,
        candidate_id: &str,
        visited: &mut HashSet<String>,
    ) -> bool {
        if !visited.insert(subflow_id.to_string()) {
            return false;
        }
        self.nodes
            .iter()
            .filter(|n| n.is_on(subflow_id))
            .filter_map(|n| n.subflow_template())
            .any(|inner| {
                inner == candidate_id || self.subflow_contains_inner(inner, candidate_id, visited)
            })
    }

    /// Everything reachable from `seed` over links, in either direction
    ///
    /// The seed comes first; ids are deduplicated.
    pub fn get_all_flow_nodes(&self, seed: &str) -> Vec<NodeId> {
        if self.endpoint(seed).is_none() {
            return Vec::new();
        }
        let mut visited: HashSet<NodeId> = HashSet::from([seed.to_string()]);
        let mut result = vec![seed.to_string()];
        let mut queue = VecDeque::from([seed.to_string()]);

        while let Some(current) = queue.pop_front() {
            for link in self.links.iter().filter(|l| l.touches(&current)) {
                let other = if link.source == current {
                    &link.target
                } else {
                    &link.source
                };
                if visited.insert(other.clone()) {
                    result.push(other.clone());
                    queue.push_back(other.clone());
                }
            }
        }
        result
    }

    // =========================================================================
    // Groups and junctions
    // =========================================================================

    /// Add a group; member nodes and junctions are pointed at it
    pub fn add_group(&mut self, group: Group) {
        for member in &group.nodes {
            if let Some(node) = self.get_node_mut(member) {
                node.group = Some(group.id.clone());
            } else if let Some(junction) = self.junctions.get_mut(member) {
                junction.group = Some(group.id.clone());
            }
        }
        self.groups.insert(group.id.clone(), group);
        self.set_dirty(true);
    }

    /// Remove a group, leaving its members in place
    pub fn remove_group(&mut self, id: &str) -> Option<Group> {
        let group = self.groups.shift_remove(id)?;
        for member in &group.nodes {
            if let Some(node) = self.get_node_mut(member) {
                node.group = None;
            } else if let Some(junction) = self.junctions.get_mut(member) {
                junction.group = None;
            } else if let Some(child) = self.groups.get_mut(member) {
                child.parent = None;
            }
        }
        if let Some(parent) = group.parent.as_ref().and_then(|p| self.groups.get_mut(p)) {
            parent.nodes.retain(|m| m != id);
        }
        self.set_dirty(true);
        Some(group)
    }

    /// Remove every group on `z`, innermost first
    fn remove_groups_on(&mut self, z: &str) -> Vec<Group> {
        let mut ordered: Vec<NodeId> = self
            .groups
            .values()
            .filter(|g| g.z.as_deref() == Some(z) && g.parent.is_none())
            .map(|g| g.id.clone())
            .collect();
        let mut i = 0;
        while i < ordered.len() {
            let nested: Vec<NodeId> = self
                .groups
                .get(&ordered[i])
                .map(|g| {
                    g.nodes
                        .iter()
                        .filter(|m| self.groups.contains_key(*m) && !ordered.contains(*m))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            ordered.extend(nested);
            i += 1;
        }
        // Groups whose parent is missing
        for group in self.groups.values() {
            if group.z.as_deref() == Some(z) && !ordered.contains(&group.id) {
                ordered.push(group.id.clone());
            }
        }

        ordered
            .iter()
            .rev()
            .filter_map(|id| self.remove_group(id))
            .collect()
    }

    pub fn add_junction(&mut self, junction: Junction) {
        self.junctions.insert(junction.id.clone(), junction);
        self.set_dirty(true);
    }

    /// Remove a junction and every link touching it
    pub fn remove_junction(&mut self, id: &str) -> RemovedEntities {
        let mut removed = RemovedEntities::default();
        let Some(junction) = self.junctions.shift_remove(id) else {
            return removed;
        };
        let (gone, kept): (Vec<Link>, Vec<Link>) = std::mem::take(&mut self.links)
            .into_iter()
            .partition(|l| l.touches(id));
        self.links = kept;
        removed.links = gone;

        if let Some(group) = junction.group.as_ref().and_then(|g| self.groups.get_mut(g)) {
            group.nodes.retain(|m| m != id);
        }
        removed.junctions.push(junction);
        self.set_dirty(true);
        removed
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Reset every collection
    ///
    /// Subflow instance types are unregistered and observers receive a
    /// single `Cleared` event.
    pub fn clear(&mut self) {
        let subflow_ids: Vec<NodeId> = self.subflows.keys().cloned().collect();
        for id in subflow_ids {
            if let Err(e) = self.registry.remove_node_type(&subflow_instance_type(&id)) {
                log::warn!("Failed to remove subflow type for '{}': {}", id, e);
            }
        }

        self.nodes.clear();
        self.config_nodes.clear();
        self.links.clear();
        self.workspaces.clear();
        self.workspaces_order.clear();
        self.subflows.clear();
        self.groups.clear();
        self.junctions.clear();
        self.active_workspace = None;
        self.default_workspace = None;

        self.emit(FlowEvent::Cleared);
        self.set_dirty(false);
    }
}
