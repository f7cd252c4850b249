//! Import of interchange JSON into a live document
//!
//! Import runs in strictly ordered phases, each relying on ids resolved by
//! the one before:
//!
//! 1. pre-scan for unknown types
//! 2. subflow cycle guard (fails before anything is mutated)
//! 3. tabs and subflow templates (equivalent templates are reused)
//! 4. default tab fallback
//! 5. config nodes, with deduplication
//! 6. ordinary nodes, subflow instances, placeholders, junctions and groups
//! 7. wires and reference lists
//! 8. subflow port wiring
//!
//! Parse and structural errors abort the import. Everything else is collected
//! as [`ImportWarning`]s and reported once when the import completes.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Map, Value};

use crate::convert::coordinate;
use crate::document::FlowDocument;
use crate::error::{ErrorCode, FlowGraphError, Result};
use crate::events::FlowEvent;
use crate::types::{
    new_id, subflow_id_from_type, subflow_instance_type, Credentials, Group, Junction, Link, Node,
    NodeId, PortRole, Subflow, SubflowPort, Workspace, SUBFLOW_TYPE_PREFIX, UNKNOWN_TYPE,
};

pub(crate) type Record = Map<String, Value>;

/// Record types that are not nodes
const STRUCTURAL_TYPES: &[&str] = &["tab", "workspace", "subflow", "group", "junction"];

/// Array-valued properties holding node ids, per node type
const REFERENCE_LISTS: &[(&str, &str)] = &[
    ("catch", "scope"),
    ("status", "scope"),
    ("link in", "links"),
    ("link out", "links"),
];

/// Import options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Give every imported entity a fresh id (paste semantics)
    pub create_new_ids: bool,
}

impl ImportOptions {
    pub fn with_new_ids() -> Self {
        Self {
            create_new_ids: true,
        }
    }
}

/// Non-fatal anomaly found during import
#[derive(Debug, Clone, PartialEq)]
pub enum ImportWarning {
    /// Types with no registered definition
    UnknownTypes(Vec<String>),
    /// A wire joined entities on different workspaces and was dropped
    CrossWorkspaceLink { source: NodeId, target: NodeId },
    /// A subflow instance names a template that does not exist
    UnresolvedSubflow { node_id: NodeId, subflow_id: NodeId },
    /// Records referenced an unknown workspace and were placed on a new one
    MissingWorkspace { z: NodeId },
}

impl std::fmt::Display for ImportWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTypes(types) => {
                write!(f, "Imported unrecognised types: {}", types.join(", "))
            }
            Self::CrossWorkspaceLink { source, target } => write!(
                f,
                "Dropped wire '{}' -> '{}' between workspaces",
                source, target
            ),
            Self::UnresolvedSubflow {
                node_id,
                subflow_id,
            } => write!(
                f,
                "Node '{}' is an instance of unknown subflow '{}'",
                node_id, subflow_id
            ),
            Self::MissingWorkspace { z } => {
                write!(f, "Workspace '{}' not found; nodes moved to a new tab", z)
            }
        }
    }
}

/// What an import added to the document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportResult {
    /// Nodes and config nodes, by their new ids
    pub nodes: Vec<NodeId>,
    pub links: Vec<Link>,
    pub workspaces: Vec<NodeId>,
    pub subflows: Vec<NodeId>,
    pub groups: Vec<NodeId>,
    pub junctions: Vec<NodeId>,
    /// Tab synthesized for records whose workspace could not be found
    pub missing_workspace: Option<NodeId>,
    pub warnings: Vec<ImportWarning>,
}

/// A subflow template created by this import, kept for port wiring
struct ImportedSubflow {
    old_id: NodeId,
    id: NodeId,
    record: Record,
}

/// Id maps and accumulated output of one import
#[derive(Default)]
struct ImportContext {
    options: ImportOptions,
    found_workspace: bool,
    workspace_map: HashMap<NodeId, NodeId>,
    subflow_map: HashMap<NodeId, NodeId>,
    /// Incoming subflows matched to an existing template; their bodies are skipped
    blacklist: HashSet<NodeId>,
    node_map: HashMap<NodeId, NodeId>,
    subflows: Vec<ImportedSubflow>,
    /// New entity id and its raw `wires`
    wired: Vec<(NodeId, Value)>,
    result: ImportResult,
}

impl ImportContext {
    fn is_blacklisted(&self, record: &Record) -> bool {
        field_str(record, "z").map_or(false, |z| self.blacklist.contains(z))
    }

    fn remap(&self, id: &str) -> Option<&NodeId> {
        self.node_map.get(id)
    }
}

// =============================================================================
// Record helpers
// =============================================================================

fn field_str<'a>(record: &'a Record, key: &str) -> Option<&'a str> {
    record.get(key).and_then(Value::as_str)
}

fn field_f64(record: &Record, key: &str) -> Option<f64> {
    record.get(key).and_then(Value::as_f64)
}

fn field_usize(record: &Record, key: &str) -> Option<usize> {
    record
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
}

fn record_id(record: &Record) -> &str {
    field_str(record, "id").unwrap_or_default()
}

fn record_type(record: &Record) -> &str {
    field_str(record, "type").unwrap_or_default()
}

pub(crate) fn position(record: &Record) -> (f64, f64) {
    (
        field_f64(record, "x").unwrap_or_default(),
        field_f64(record, "y").unwrap_or_default(),
    )
}

/// Everything in `record` except the given keys
fn extra_fields(record: &Record, known: &[&str]) -> Map<String, Value> {
    record
        .iter()
        .filter(|(key, _)| !known.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Port objects of a subflow record's `in` or `out` list
pub(crate) fn port_records<'a>(
    record: &'a Record,
    key: &str,
) -> impl Iterator<Item = &'a Record> {
    record
        .get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

/// `{id, port}` entries of a port's `wires`
pub(crate) fn port_wires(port: &Record) -> impl Iterator<Item = (&str, usize)> {
    port.get("wires")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .filter_map(|wire| {
            let id = field_str(wire, "id")?;
            Some((id, field_usize(wire, "port").unwrap_or(0)))
        })
}

/// Replace every string that names a mapped id
fn remap_ids(value: &Value, ids: &HashMap<NodeId, NodeId>) -> Value {
    match value {
        Value::String(s) => {
            if let Some(mapped) = ids.get(s) {
                return json!(mapped);
            }
            match subflow_id_from_type(s).and_then(|template| ids.get(template)) {
                Some(mapped) => json!(subflow_instance_type(mapped)),
                None => value.clone(),
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| remap_ids(v, ids)).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), remap_ids(v, ids)))
                .collect(),
        ),
        _ => value.clone(),
    }
}

fn into_records(value: Value) -> Result<Vec<Record>> {
    let items = match value {
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        other => {
            return Err(FlowGraphError::invalid_flow(format!(
                "expected an array of records, found {}",
                other
            )))
        }
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Object(record)
                if field_str(&record, "id").is_some() && field_str(&record, "type").is_some() =>
            {
                Ok(record)
            }
            _ => Err(FlowGraphError::invalid_flow(format!(
                "record {} has no string id and type",
                index
            ))),
        })
        .collect()
}

// =============================================================================
// Import
// =============================================================================

impl FlowDocument {
    /// Import interchange JSON text; an empty string imports nothing
    pub fn import_str(&mut self, json: &str, options: ImportOptions) -> Result<ImportResult> {
        if json.trim().is_empty() {
            return Ok(ImportResult::default());
        }
        let value: Value = serde_json::from_str(json).map_err(FlowGraphError::parse)?;
        self.import_value(value, options)
    }

    /// Import an already-parsed array of records (or a single record)
    pub fn import_value(&mut self, value: Value, options: ImportOptions) -> Result<ImportResult> {
        let records = into_records(value)?;
        let unknown_types = self.scan_unknown_types(&records);
        self.check_subflow_cycles(&records)?;

        let mut ctx = ImportContext {
            options,
            ..ImportContext::default()
        };
        if !unknown_types.is_empty() {
            log::warn!("Importing unrecognised types: {}", unknown_types.join(", "));
            ctx.result
                .warnings
                .push(ImportWarning::UnknownTypes(unknown_types));
        }
        let into_subflow = self.active_subflow().is_some();

        for record in &records {
            match record_type(record) {
                "tab" | "workspace" => self.import_workspace(record, &mut ctx)?,
                "subflow" => self.import_subflow(record, &records, &mut ctx),
                _ => {}
            }
        }
        self.ensure_default_workspace(&mut ctx)?;
        self.import_config_nodes(&records, &mut ctx)?;
        self.import_nodes(&records, &mut ctx)?;
        self.import_groups(&records, &mut ctx)?;
        self.import_wires(&mut ctx);
        self.remap_reference_lists(&ctx, into_subflow);
        self.wire_subflow_ports(&mut ctx);

        for id in ctx.result.nodes.clone() {
            self.validate_node(&id);
        }
        for id in ctx.result.subflows.clone() {
            self.validate_subflow(&id);
        }

        log::info!(
            "Imported {} nodes, {} links, {} workspaces, {} subflows",
            ctx.result.nodes.len(),
            ctx.result.links.len(),
            ctx.result.workspaces.len(),
            ctx.result.subflows.len()
        );
        if !ctx.result.warnings.is_empty() {
            let warnings = ctx.result.warnings.iter().map(|w| w.to_string()).collect();
            self.emit(FlowEvent::ImportWarnings { warnings });
        }
        self.set_dirty(true);
        Ok(ctx.result)
    }

    fn scan_unknown_types(&self, records: &[Record]) -> Vec<String> {
        let mut unknown: Vec<String> = Vec::new();
        for record in records {
            let node_type = record_type(record);
            if STRUCTURAL_TYPES.contains(&node_type)
                || node_type.starts_with(SUBFLOW_TYPE_PREFIX)
                || self.registry().has_node_type(node_type)
            {
                continue;
            }
            if !unknown.iter().any(|t| t == node_type) {
                unknown.push(node_type.to_string());
            }
        }
        unknown
    }

    /// Reject subflow instances that would make a template contain itself
    fn check_subflow_cycles(&self, records: &[Record]) -> Result<()> {
        let input_subflows: HashSet<&str> = records
            .iter()
            .filter(|r| record_type(r) == "subflow")
            .map(record_id)
            .collect();

        let mut input_children: HashMap<&str, Vec<&str>> = HashMap::new();
        for record in records {
            if let (Some(z), Some(template)) = (
                field_str(record, "z"),
                subflow_id_from_type(record_type(record)),
            ) {
                if input_subflows.contains(z) {
                    input_children.entry(z).or_default().push(template);
                }
            }
        }

        let active = self.active_subflow().map(|sf| sf.id.as_str());
        for record in records {
            let Some(template) = subflow_id_from_type(record_type(record)) else {
                continue;
            };
            let parent = match field_str(record, "z") {
                Some(z) if input_subflows.contains(z) || self.subflow(z).is_some() => Some(z),
                _ => active,
            };
            let Some(parent) = parent else {
                continue;
            };
            if template == parent {
                return Err(FlowGraphError::structural(
                    ErrorCode::SubflowSelfReference,
                    format!("Cannot add subflow '{}' to itself", template),
                ));
            }
            if self.contains_across(template, parent, &input_children) {
                return Err(FlowGraphError::structural(
                    ErrorCode::CircularSubflowReference,
                    format!(
                        "Cannot add subflow '{}' to '{}': circular reference",
                        template, parent
                    ),
                ));
            }
        }
        Ok(())
    }

    /// `subflow_contains` over the document plus not-yet-imported records
    fn contains_across(
        &self,
        from: &str,
        target: &str,
        input_children: &HashMap<&str, Vec<&str>>,
    ) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from.to_string()];
        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let children = self
                .nodes()
                .filter(|n| n.is_on(&current))
                .filter_map(|n| n.subflow_template())
                .chain(
                    input_children
                        .get(current.as_str())
                        .into_iter()
                        .flatten()
                        .copied(),
                );
            for child in children {
                if child == target {
                    return true;
                }
                stack.push(child.to_string());
            }
        }
        false
    }

    fn fresh_id(&self, old_id: &str, ctx: &ImportContext) -> NodeId {
        if ctx.options.create_new_ids || old_id.is_empty() || self.id_in_use(old_id) {
            new_id()
        } else {
            old_id.to_string()
        }
    }

    // =========================================================================
    // Tabs and subflow templates
    // =========================================================================

    fn import_workspace(&mut self, record: &Record, ctx: &mut ImportContext) -> Result<()> {
        ctx.found_workspace = true;
        let old_id = record_id(record);
        if !ctx.options.create_new_ids && self.workspace(old_id).is_some() {
            ctx.workspace_map
                .insert(old_id.to_string(), old_id.to_string());
            return Ok(());
        }

        let id = self.fresh_id(old_id, ctx);
        let label = field_str(record, "label")
            .map(str::to_string)
            .unwrap_or_else(|| {
                self.settings()
                    .workspace_label_for(self.workspace_order().len() + 1)
            });
        let workspace = Workspace {
            id: id.clone(),
            label,
            disabled: record.get("disabled").and_then(Value::as_bool).unwrap_or(false),
            locked: record.get("locked").and_then(Value::as_bool).unwrap_or(false),
            info: field_str(record, "info").unwrap_or_default().to_string(),
            extra: extra_fields(record, &["id", "type", "label", "disabled", "locked", "info"]),
        };
        if self.default_workspace.is_none() {
            self.default_workspace = Some(id.clone());
        }
        self.add_workspace(workspace)?;
        ctx.workspace_map.insert(old_id.to_string(), id.clone());
        ctx.result.workspaces.push(id);
        Ok(())
    }

    fn import_subflow(&mut self, record: &Record, records: &[Record], ctx: &mut ImportContext) {
        let old_id = record_id(record).to_string();
        let body: Vec<&Record> = records
            .iter()
            .filter(|r| field_str(r, "z") == Some(old_id.as_str()))
            .filter(|r| !STRUCTURAL_TYPES.contains(&record_type(r)))
            .filter(|r| {
                !self
                    .registry()
                    .get_node_type(record_type(r))
                    .map_or(false, |d| d.is_config())
            })
            .collect();

        if let Some(existing) = self.find_matching_subflow(record, &body, &ctx.subflow_map) {
            log::debug!(
                "Subflow '{}' matches existing subflow '{}'",
                old_id,
                existing
            );
            ctx.blacklist.insert(old_id.clone());
            ctx.subflow_map.insert(old_id, existing);
            return;
        }

        let id = self.fresh_id(&old_id, ctx);
        let mut subflow = Subflow::new(id.clone(), field_str(record, "name").unwrap_or_default());
        subflow.info = field_str(record, "info").unwrap_or_default().to_string();
        subflow.in_ports = port_records(record, "in")
            .take(1)
            .map(|p| SubflowPort::new(new_id(), PortRole::Input, 0, id.clone(), position(p)))
            .collect();
        subflow.out_ports = port_records(record, "out")
            .enumerate()
            .map(|(i, p)| SubflowPort::new(new_id(), PortRole::Output, i, id.clone(), position(p)))
            .collect();
        subflow.status_port = record
            .get("status")
            .and_then(Value::as_object)
            .map(|p| SubflowPort::new(new_id(), PortRole::Status, 0, id.clone(), position(p)));
        subflow.extra = extra_fields(
            record,
            &["id", "type", "name", "info", "in", "out", "status"],
        );

        self.add_subflow(subflow, ctx.options.create_new_ids);
        ctx.subflow_map.insert(old_id.clone(), id.clone());
        ctx.result.subflows.push(id.clone());
        ctx.subflows.push(ImportedSubflow {
            old_id,
            id,
            record: record.clone(),
        });
    }

    /// Find an existing template structurally equal to an incoming one
    ///
    /// Candidate ids are renumbered onto the existing template's ids (body
    /// nodes paired in order) before comparing the converted records.
    fn find_matching_subflow(
        &self,
        record: &Record,
        body: &[&Record],
        subflow_map: &HashMap<NodeId, NodeId>,
    ) -> Option<NodeId> {
        let name = field_str(record, "name").unwrap_or_default();
        let info = field_str(record, "info").unwrap_or_default();
        let in_count = port_records(record, "in").count().min(1);
        let out_count = port_records(record, "out").count();

        for existing in self.subflows() {
            if existing.name != name
                || existing.info != info
                || existing.in_ports.len() != in_count
                || existing.out_ports.len() != out_count
            {
                continue;
            }
            let members: Vec<&Node> = self.nodes().filter(|n| n.is_on(&existing.id)).collect();
            if members.len() != body.len() {
                continue;
            }

            let mut ids = subflow_map.clone();
            ids.insert(record_id(record).to_string(), existing.id.clone());
            for (candidate, member) in body.iter().zip(&members) {
                ids.insert(record_id(candidate).to_string(), member.id.clone());
            }

            let nodes_match = body.iter().zip(&members).all(|(candidate, member)| {
                let remapped = remap_ids(&Value::Object((*candidate).clone()), &ids);
                let normalized = remapped
                    .as_object()
                    .map(|r| self.normalize_node_record(r));
                normalized.as_ref() == Some(&self.convert_node(member, false))
            });
            if !nodes_match {
                continue;
            }

            let expected = self.convert_subflow(existing);
            let remapped = remap_ids(&Value::Object(record.clone()), &ids);
            let ports_match = ["in", "out", "status"].iter().all(|key| {
                normalize_ports(remapped.get(*key)) == normalize_ports(expected.get(*key))
            });
            if ports_match {
                return Some(existing.id.clone());
            }
        }
        None
    }

    /// Reduce a raw node record to what `convert_node` would write for it
    fn normalize_node_record(&self, record: &Record) -> Value {
        let mut normalized = Map::new();
        let definition = self.registry().get_node_type(record_type(record));
        for key in ["id", "type", "z", "g"] {
            if let Some(value) = record.get(key) {
                normalized.insert(key.to_string(), value.clone());
            }
        }
        match definition {
            Some(def) => {
                for name in def.defaults.keys() {
                    if let Some(value) = record.get(name) {
                        normalized.insert(name.clone(), value.clone());
                    }
                }
            }
            None => {
                for (key, value) in record {
                    if !["x", "y", "z", "id", "wires"].contains(&key.as_str()) {
                        normalized.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        let (x, y) = position(record);
        normalized.insert("x".into(), coordinate(x));
        normalized.insert("y".into(), coordinate(y));
        normalized.insert(
            "wires".into(),
            record.get("wires").cloned().unwrap_or_else(|| json!([])),
        );
        Value::Object(normalized)
    }

    fn ensure_default_workspace(&mut self, ctx: &mut ImportContext) -> Result<()> {
        if ctx.found_workspace
            || self.active_workspace().is_some()
            || self.default_workspace().is_some()
        {
            return Ok(());
        }
        let id = new_id();
        let label = self
            .settings()
            .workspace_label_for(self.workspace_order().len() + 1);
        self.add_workspace(Workspace::new(id.clone(), label))?;
        self.default_workspace = Some(id.clone());
        self.set_active_workspace(Some(id.clone()));
        ctx.result.workspaces.push(id);
        Ok(())
    }

    /// Map an incoming `z` onto the document
    ///
    /// Order: imported subflows, imported tabs, existing tabs and subflows,
    /// then the active tab when pasting, then a placeholder tab created once
    /// per import. A missing `z` stays global when `global` is set.
    fn resolve_z(
        &mut self,
        z: Option<&str>,
        global: bool,
        ctx: &mut ImportContext,
    ) -> Result<Option<NodeId>> {
        let Some(z) = z else {
            if global {
                return Ok(None);
            }
            return Ok(self
                .active_workspace()
                .or_else(|| self.default_workspace())
                .map(str::to_string));
        };
        if let Some(mapped) = ctx.subflow_map.get(z).or_else(|| ctx.workspace_map.get(z)) {
            return Ok(Some(mapped.clone()));
        }
        if self.workspace(z).is_some() || self.subflow(z).is_some() {
            return Ok(Some(z.to_string()));
        }
        if ctx.options.create_new_ids {
            if let Some(active) = self.active_workspace() {
                return Ok(Some(active.to_string()));
            }
        }
        if let Some(missing) = &ctx.result.missing_workspace {
            return Ok(Some(missing.clone()));
        }

        let id = new_id();
        let label = self.settings().missing_workspace_label.clone();
        log::warn!("Workspace '{}' not found, creating '{}'", z, label);
        self.add_workspace(Workspace::new(id.clone(), label))?;
        ctx.result.workspaces.push(id.clone());
        ctx.result.missing_workspace = Some(id.clone());
        ctx.result
            .warnings
            .push(ImportWarning::MissingWorkspace { z: z.to_string() });
        Ok(Some(id))
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Build a node from a record using its type's declared properties
    ///
    /// Config references are rewritten through `node_map`.
    fn build_node(
        &self,
        record: &Record,
        id: &str,
        node_type: &str,
        z: Option<NodeId>,
        node_map: &HashMap<NodeId, NodeId>,
    ) -> Node {
        let (x, y) = position(record);
        let mut node = Node::new(id, node_type).at(x, y);
        node.z = z;
        node.changed = false;

        let Some(def) = self.registry().get_node_type(node_type) else {
            return node;
        };
        node.inputs = field_usize(record, "inputs").unwrap_or(def.inputs);
        node.outputs = field_usize(record, "outputs").unwrap_or(def.outputs);

        for (name, prop) in &def.defaults {
            let Some(value) = record.get(name) else {
                continue;
            };
            let value = match (&prop.config_type, value.as_str()) {
                (Some(_), Some(old)) => node_map
                    .get(old)
                    .map(|new| json!(new))
                    .unwrap_or_else(|| value.clone()),
                _ => value.clone(),
            };
            node.config_snapshot.insert(name.clone(), value.to_string());
            node.properties.insert(name.clone(), value);
        }

        if let Some(incoming) = record.get("credentials").and_then(Value::as_object) {
            let values: Map<String, Value> = incoming
                .iter()
                .filter(|(key, _)| {
                    def.credentials.contains_key(key.as_str())
                        || key
                            .strip_prefix("has_")
                            .map_or(false, |k| def.credentials.contains_key(k))
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if !values.is_empty() {
                node.credentials = Some(Credentials::new(values));
            }
        }
        node
    }

    /// Whether two nodes have the same type and equal declared properties
    pub fn compare_nodes(&self, a: &Node, b: &Node) -> bool {
        if a.node_type != b.node_type {
            return false;
        }
        let Some(def) = self.type_definition(a) else {
            return false;
        };
        def.defaults
            .keys()
            .all(|name| a.properties.get(name) == b.properties.get(name))
    }

    fn import_config_nodes(&mut self, records: &[Record], ctx: &mut ImportContext) -> Result<()> {
        let mut pending: Vec<(&Record, NodeId, Option<NodeId>)> = Vec::new();
        for record in records {
            let is_config = self
                .registry()
                .get_node_type(record_type(record))
                .map_or(false, |d| d.is_config());
            if !is_config || ctx.is_blacklisted(record) {
                continue;
            }
            let old_id = record_id(record);
            let z = self.resolve_z(field_str(record, "z"), true, ctx)?;

            if let Some(existing) = self.find_equivalent_config(record, old_id, z.as_deref(), ctx) {
                log::debug!("Reusing config node '{}' for '{}'", existing, old_id);
                ctx.node_map.insert(old_id.to_string(), existing);
                continue;
            }
            let id = self.fresh_id(old_id, ctx);
            ctx.node_map.insert(old_id.to_string(), id.clone());
            pending.push((record, id, z));
        }

        // Config nodes may reference each other, so ids are all assigned first
        let first = ctx.result.nodes.len();
        for (record, id, z) in pending {
            let node = self.build_node(record, &id, record_type(record), z, &ctx.node_map);
            self.insert_node(node, 0)?;
            ctx.result.nodes.push(id);
        }
        // A config node may have been added before the config node it uses
        for id in ctx.result.nodes[first..].to_vec() {
            self.update_config_node_users(&id);
        }
        Ok(())
    }

    /// An existing config node the record can be merged into
    fn find_equivalent_config(
        &self,
        record: &Record,
        old_id: &str,
        z: Option<&str>,
        ctx: &ImportContext,
    ) -> Option<NodeId> {
        let same_id = self.config_nodes.get(old_id);
        if let Some(existing) = same_id {
            if existing.z.as_deref() == z {
                return Some(existing.id.clone());
            }
        } else if !ctx.options.create_new_ids {
            return None;
        }
        let candidate = self.build_node(
            record,
            old_id,
            record_type(record),
            z.map(str::to_string),
            &ctx.node_map,
        );
        self.config_nodes
            .values()
            .find(|c| c.z.as_deref() == z && self.compare_nodes(c, &candidate))
            .map(|c| c.id.clone())
    }

    fn import_nodes(&mut self, records: &[Record], ctx: &mut ImportContext) -> Result<()> {
        for record in records {
            let node_type = record_type(record);
            if node_type == "junction" {
                if !ctx.is_blacklisted(record) {
                    self.import_junction(record, ctx)?;
                }
                continue;
            }
            let is_config = self
                .registry()
                .get_node_type(node_type)
                .map_or(false, |d| d.is_config());
            if STRUCTURAL_TYPES.contains(&node_type) || is_config || ctx.is_blacklisted(record) {
                continue;
            }

            let old_id = record_id(record).to_string();
            let id = self.fresh_id(&old_id, ctx);
            let wires = record.get("wires").cloned().unwrap_or(Value::Null);
            let wire_count = wires.as_array().map_or(0, Vec::len);

            if let Some(template) = subflow_id_from_type(node_type) {
                let resolved = ctx
                    .subflow_map
                    .get(template)
                    .cloned()
                    .or_else(|| self.subflow(template).map(|sf| sf.id.clone()))
                    .and_then(|sf_id| {
                        self.subflow(&sf_id)
                            .map(|sf| (sf_id, sf.in_ports.len(), sf.out_ports.len()))
                    });
                match resolved {
                    Some((sf_id, inputs, outputs)) => {
                        let z = self.resolve_z(field_str(record, "z"), false, ctx)?;
                        let instance_type = subflow_instance_type(&sf_id);
                        let mut node =
                            self.build_node(record, &id, &instance_type, z, &ctx.node_map);
                        node.inputs = inputs;
                        node.outputs = outputs;
                        self.insert_node(node, 0)?;
                    }
                    None => {
                        ctx.result.warnings.push(ImportWarning::UnresolvedSubflow {
                            node_id: old_id.clone(),
                            subflow_id: template.to_string(),
                        });
                        if !self.import_placeholder(record, &id, ctx)? {
                            ctx.node_map.insert(old_id, id.clone());
                            ctx.result.nodes.push(id);
                            continue;
                        }
                    }
                }
            } else if self.registry().has_node_type(node_type) {
                let z = self.resolve_z(field_str(record, "z"), false, ctx)?;
                let node = self.build_node(record, &id, node_type, z, &ctx.node_map);
                self.insert_node(node, wire_count)?;
            } else if !self.import_placeholder(record, &id, ctx)? {
                ctx.node_map.insert(old_id, id.clone());
                ctx.result.nodes.push(id);
                continue;
            }

            ctx.node_map.insert(old_id, id.clone());
            ctx.wired.push((id.clone(), wires));
            ctx.result.nodes.push(id);
        }
        Ok(())
    }

    /// Add an `unknown` node carrying the original record
    ///
    /// Records with a position become drawable nodes; the rest are treated
    /// as config-like. Returns whether the placeholder is drawable.
    fn import_placeholder(
        &mut self,
        record: &Record,
        id: &str,
        ctx: &mut ImportContext,
    ) -> Result<bool> {
        let drawable = field_f64(record, "x").is_some() && field_f64(record, "y").is_some();
        let z = self.resolve_z(field_str(record, "z"), !drawable, ctx)?;
        let (x, y) = position(record);

        let mut node = Node::new(id, UNKNOWN_TYPE)
            .at(x, y)
            .with_property("name", json!(record_type(record)));
        node.z = z;
        node.original = Some(extra_fields(record, &["x", "y", "z", "id", "wires"]));

        if drawable {
            let wire_count = record.get("wires").and_then(Value::as_array).map_or(0, Vec::len);
            node.inputs = field_usize(record, "inputs").unwrap_or(0);
            node.outputs = field_usize(record, "outputs").unwrap_or(wire_count);
            self.insert_node(node, wire_count)?;
        } else {
            self.add_config_node(node)?;
        }
        Ok(drawable)
    }

    fn import_junction(&mut self, record: &Record, ctx: &mut ImportContext) -> Result<()> {
        let old_id = record_id(record).to_string();
        let id = self.fresh_id(&old_id, ctx);
        let (x, y) = position(record);
        let z = self.resolve_z(field_str(record, "z"), false, ctx)?;
        self.add_junction(Junction {
            id: id.clone(),
            z,
            x,
            y,
            group: None,
        });
        ctx.node_map.insert(old_id, id.clone());
        ctx.wired
            .push((id.clone(), record.get("wires").cloned().unwrap_or(Value::Null)));
        ctx.result.junctions.push(id);
        Ok(())
    }

    fn import_groups(&mut self, records: &[Record], ctx: &mut ImportContext) -> Result<()> {
        let groups: Vec<&Record> = records
            .iter()
            .filter(|r| record_type(r) == "group" && !ctx.is_blacklisted(r))
            .collect();
        // Members may be nested groups, so every group id is assigned first
        for record in &groups {
            let old_id = record_id(record);
            let id = self.fresh_id(old_id, ctx);
            ctx.node_map.insert(old_id.to_string(), id);
        }

        for record in groups {
            let Some(id) = ctx.remap(record_id(record)).cloned() else {
                continue;
            };
            let z = self.resolve_z(field_str(record, "z"), false, ctx)?;
            let nodes = record
                .get("nodes")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .filter_map(|member| ctx.remap(member).cloned())
                .collect();
            let (x, y) = position(record);
            let group = Group {
                id: id.clone(),
                z,
                name: field_str(record, "name").unwrap_or_default().to_string(),
                nodes,
                parent: field_str(record, "g").and_then(|g| ctx.remap(g).cloned()),
                x,
                y,
                w: field_f64(record, "w").unwrap_or_default(),
                h: field_f64(record, "h").unwrap_or_default(),
                style: record.get("style").cloned().unwrap_or_else(|| json!({})),
                extra: extra_fields(
                    record,
                    &["id", "type", "z", "name", "nodes", "g", "x", "y", "w", "h", "style"],
                ),
            };
            self.add_group(group);
            ctx.result.groups.push(id);
        }
        Ok(())
    }

    // =========================================================================
    // Wiring
    // =========================================================================

    fn import_wires(&mut self, ctx: &mut ImportContext) {
        for (source, wires) in std::mem::take(&mut ctx.wired) {
            let Value::Array(ports) = wires else {
                continue;
            };
            let source_z = self
                .endpoint(&source)
                .and_then(|e| e.z())
                .map(str::to_string);

            for (port, targets) in ports.iter().enumerate() {
                let targets: Vec<&Value> = match targets {
                    Value::Array(items) => items.iter().collect(),
                    single => vec![single],
                };
                for old_target in targets.into_iter().filter_map(Value::as_str) {
                    let Some(target) = ctx.remap(old_target).cloned() else {
                        log::debug!("Wire target '{}' is not part of this import", old_target);
                        continue;
                    };
                    let Some(target_z) = self.endpoint(&target).map(|e| e.z().map(str::to_string))
                    else {
                        continue;
                    };
                    if target_z != source_z {
                        log::warn!(
                            "Dropping wire '{}' -> '{}': endpoints are on different workspaces",
                            source,
                            target
                        );
                        ctx.result.warnings.push(ImportWarning::CrossWorkspaceLink {
                            source: source.clone(),
                            target,
                        });
                        continue;
                    }
                    let link = Link::new(source.clone(), port, target);
                    self.add_link(link.clone());
                    ctx.result.links.push(link);
                }
            }
        }
    }

    /// Remap `scope`/`links` id lists of the imported nodes
    fn remap_reference_lists(&mut self, ctx: &ImportContext, into_subflow: bool) {
        for id in &ctx.result.nodes {
            let Some(node) = self.get_node(id) else {
                continue;
            };
            let Some(prop) = REFERENCE_LISTS
                .iter()
                .find(|(node_type, _)| *node_type == node.node_type)
                .map(|(_, prop)| *prop)
            else {
                continue;
            };
            let Some(Value::Array(items)) = node.properties.get(prop) else {
                continue;
            };

            let mut remapped: Vec<Value> = items
                .iter()
                .map(|item| match item.as_str().and_then(|s| ctx.remap(s)) {
                    Some(mapped) => json!(mapped),
                    None => item.clone(),
                })
                .collect();
            if into_subflow && node.node_type == "link out" {
                let z = node.z.clone();
                remapped.retain(|item| {
                    item.as_str()
                        .and_then(|target| self.get_node(target))
                        .map_or(false, |target| target.z == z)
                });
            }
            if let Some(node) = self.get_node_mut(id) {
                node.properties.insert(prop.to_string(), Value::Array(remapped));
            }
        }
    }

    fn wire_subflow_ports(&mut self, ctx: &mut ImportContext) {
        for imported in std::mem::take(&mut ctx.subflows) {
            let Some(subflow) = self.subflow(&imported.id).cloned() else {
                continue;
            };
            let in_port = subflow.in_ports.first().map(|p| p.id.clone());
            let mut links = Vec::new();

            if let (Some(port_id), Some(port)) =
                (&in_port, port_records(&imported.record, "in").next())
            {
                for (target, _) in port_wires(port) {
                    if let Some(target) = ctx.remap(target) {
                        links.push(Link::new(port_id.clone(), 0, target.clone()));
                    }
                }
            }

            let outputs = port_records(&imported.record, "out")
                .zip(subflow.out_ports.iter())
                .chain(
                    imported
                        .record
                        .get("status")
                        .and_then(Value::as_object)
                        .zip(subflow.status_port.as_ref()),
                );
            for (port, target) in outputs {
                for (source, source_port) in port_wires(port) {
                    let source = if source == imported.old_id {
                        in_port.clone().map(|id| (id, 0))
                    } else {
                        ctx.remap(source).map(|id| (id.clone(), source_port))
                    };
                    if let Some((source, source_port)) = source {
                        links.push(Link::new(source, source_port, target.id.clone()));
                    }
                }
            }

            for link in links {
                self.add_link(link.clone());
                ctx.result.links.push(link);
            }
        }
    }
}

fn normalize_ports(ports: Option<&Value>) -> Value {
    let normalize = |port: &Value| {
        let Some(port) = port.as_object() else {
            return port.clone();
        };
        let (x, y) = position(port);
        json!({
            "x": coordinate(x),
            "y": coordinate(y),
            "wires": port.get("wires").cloned().unwrap_or_else(|| json!([])),
        })
    };
    match ports {
        Some(Value::Array(items)) => Value::Array(items.iter().map(normalize).collect()),
        Some(port @ Value::Object(_)) => normalize(port),
        _ => Value::Null,
    }
}
