//! Three-way diff and merge of flow snapshots
//!
//! A diff compares a baseline snapshot (the last deployed flows) with a
//! candidate (local edits or the remote copy). Two diffs over the same
//! baseline are checked for conflicts, and once every conflict has a
//! resolution the remote side is merged into the live document.
//!
//! Snapshots are flat interchange record lists as produced by
//! [`FlowDocument::create_complete_node_set`].

use std::collections::{BTreeSet, HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{FlowDocument, RemovedEntities};
use crate::error::{FlowGraphError, Result};
use crate::import::{port_records, port_wires, position, ImportOptions, ImportResult};
use crate::subflow::SubflowOperations;
use crate::types::{new_id, Link, NodeId, PortRole, SubflowPort};

/// A tab or subflow record with the records it owns
#[derive(Debug, Clone, PartialEq)]
pub struct FlowEntry {
    pub record: Value,
    pub nodes: Vec<Value>,
}

/// A flat record list partitioned by owner
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFlows {
    /// Every record by id
    pub all: IndexMap<NodeId, Value>,
    pub tab_order: Vec<NodeId>,
    pub tabs: IndexMap<NodeId, FlowEntry>,
    pub subflows: IndexMap<NodeId, FlowEntry>,
    /// Records owned by neither a tab nor a subflow of the same list
    pub globals: Vec<Value>,
}

impl ParsedFlows {
    /// Partition a flat record list
    pub fn parse(records: &[Value]) -> Self {
        let mut parsed = ParsedFlows::default();
        for record in records {
            let Some(id) = record_id(record) else {
                continue;
            };
            parsed.all.insert(id.to_string(), record.clone());
            let entry = || FlowEntry {
                record: record.clone(),
                nodes: Vec::new(),
            };
            match record_type(record) {
                Some("tab") => {
                    parsed.tab_order.push(id.to_string());
                    parsed.tabs.insert(id.to_string(), entry());
                }
                Some("subflow") => {
                    parsed.subflows.insert(id.to_string(), entry());
                }
                _ => {}
            }
        }

        for record in records {
            if matches!(record_type(record), Some("tab") | Some("subflow")) {
                continue;
            }
            let owner = record.get("z").and_then(Value::as_str);
            if let Some(tab) = owner.and_then(|z| parsed.tabs.get_mut(z)) {
                tab.nodes.push(record.clone());
            } else if let Some(subflow) = owner.and_then(|z| parsed.subflows.get_mut(z)) {
                subflow.nodes.push(record.clone());
            } else {
                parsed.globals.push(record.clone());
            }
        }
        parsed
    }

    /// Owner (`z`) of a record, if it has one
    pub fn parent_of(&self, id: &str) -> Option<&str> {
        self.all.get(id)?.get("z")?.as_str()
    }
}

/// Difference between a baseline and a candidate snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowDiff {
    pub current_config: ParsedFlows,
    pub new_config: ParsedFlows,
    pub added: BTreeSet<NodeId>,
    pub deleted: BTreeSet<NodeId>,
    pub changed: BTreeSet<NodeId>,
}

impl FlowDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.changed.is_empty()
    }
}

/// Compare two snapshots record by record
pub fn generate_diff(baseline: &[Value], candidate: &[Value]) -> FlowDiff {
    let current_config = ParsedFlows::parse(baseline);
    let new_config = ParsedFlows::parse(candidate);
    let mut diff = FlowDiff::default();

    for (id, record) in &current_config.all {
        match new_config.all.get(id) {
            None => {
                diff.deleted.insert(id.clone());
            }
            Some(candidate) if candidate != record => {
                diff.changed.insert(id.clone());
            }
            Some(_) => {}
        }
    }
    for id in new_config.all.keys() {
        if !current_config.all.contains_key(id) {
            diff.added.insert(id.clone());
        }
    }

    diff.current_config = current_config;
    diff.new_config = new_config;
    diff
}

/// Ids whose local and remote edits cannot both be applied
///
/// Both diffs must share a baseline.
pub fn identify_conflicts(local: &FlowDiff, remote: &FlowDiff) -> BTreeSet<NodeId> {
    let mut conflicts = BTreeSet::new();
    for id in local.current_config.all.keys() {
        let local_changed = local.changed.contains(id);
        let remote_changed = remote.changed.contains(id);
        if (local_changed && remote.deleted.contains(id))
            || (local.deleted.contains(id) && remote_changed)
        {
            conflicts.insert(id.clone());
        } else if local_changed
            && remote_changed
            && local.new_config.all.get(id) != remote.new_config.all.get(id)
        {
            conflicts.insert(id.clone());
        }
    }

    let added_into_deleted = |added: &FlowDiff, deleting: &FlowDiff| {
        added
            .added
            .iter()
            .filter(|id| {
                added
                    .new_config
                    .parent_of(id)
                    .map_or(false, |z| deleting.deleted.contains(z))
            })
            .cloned()
            .collect::<Vec<_>>()
    };
    conflicts.extend(added_into_deleted(local, remote));
    conflicts.extend(added_into_deleted(remote, local));

    if !conflicts.is_empty() {
        log::debug!("Identified {} merge conflicts", conflicts.len());
    }
    conflicts
}

/// Which side of a conflict to keep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Local,
    Remote,
}

/// What a merge did to the document
#[derive(Debug, Default)]
pub struct MergeReport {
    pub removed: RemovedEntities,
    /// Entities updated in place from their remote version
    pub updated: Vec<NodeId>,
    pub imported: ImportResult,
    /// Remote deletions that could not be applied
    pub skipped: Vec<NodeId>,
}

fn record_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

fn record_type(record: &Value) -> Option<&str> {
    record.get("type").and_then(Value::as_str)
}

/// `(port, target)` pairs of a record's `wires`
fn wire_targets(record: &Value) -> Vec<(usize, String)> {
    let Some(Value::Array(ports)) = record.get("wires") else {
        return Vec::new();
    };
    ports
        .iter()
        .enumerate()
        .flat_map(|(port, targets)| {
            targets
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .map(move |target| (port, target.to_string()))
        })
        .collect()
}

impl FlowDocument {
    /// Apply the remote side of a diff to the document
    ///
    /// Every conflict between `local` and `remote` must have an entry in
    /// `resolutions`, otherwise nothing is touched. Non-conflicting edits take
    /// the remote version; ids resolved as [`Resolution::Local`] are left
    /// alone.
    pub fn merge_diff(
        &mut self,
        local: &FlowDiff,
        remote: &FlowDiff,
        resolutions: &HashMap<NodeId, Resolution>,
    ) -> Result<MergeReport> {
        let unresolved: Vec<NodeId> = identify_conflicts(local, remote)
            .into_iter()
            .filter(|id| !resolutions.contains_key(id))
            .collect();
        if !unresolved.is_empty() {
            return Err(FlowGraphError::UnresolvedConflicts(unresolved));
        }

        let keep_local = |id: &str| resolutions.get(id) == Some(&Resolution::Local);
        let mut report = MergeReport::default();

        for id in remote.deleted.iter().filter(|id| !keep_local(id.as_str())) {
            self.remove_merged(id, &mut report);
        }

        let mut queued: Vec<Value> = Vec::new();
        let mut rewire: Vec<NodeId> = Vec::new();
        for id in remote.changed.iter().filter(|id| !keep_local(id.as_str())) {
            let Some(record) = remote.new_config.all.get(id) else {
                continue;
            };
            if self.merge_in_place(id, record, &mut report) {
                report.updated.push(id.clone());
            } else {
                queued.push(record.clone());
            }
            rewire.push(id.clone());
        }
        for id in remote.added.iter().filter(|id| !keep_local(id.as_str())) {
            if local.added.contains(id) || self.id_in_use(id) {
                continue;
            }
            if let Some(record) = remote.new_config.all.get(id) {
                queued.push(record.clone());
                rewire.push(id.clone());
            }
        }

        if !queued.is_empty() {
            // Owners before the records they own
            let rank = |record: &Value| match record_type(record) {
                Some("tab") => 0,
                Some("subflow") => 1,
                _ => 2,
            };
            queued.sort_by_key(rank);
            report.imported = self.import_value(Value::Array(queued), ImportOptions::default())?;
        }

        // Config nodes referenced by updated nodes may only exist now
        for id in &report.updated {
            self.update_config_node_users(id);
        }

        for id in &rewire {
            let Some(record) = remote.new_config.all.get(id) else {
                continue;
            };
            if self.subflow(id).is_some() {
                self.rewire_subflow_ports(id, record);
            } else {
                self.rewire_from_record(id, record);
            }
        }

        let removed = &report.removed;
        log::info!(
            "Merged remote changes: {} updated, {} imported; removed {} nodes, {} links, \
             {} groups, {} junctions, {} workspaces, {} subflows",
            report.updated.len(),
            report.imported.nodes.len(),
            removed.nodes.len(),
            removed.links.len(),
            removed.groups.len(),
            removed.junctions.len(),
            removed.workspaces.len(),
            removed.subflows.len()
        );
        self.set_dirty(true);
        Ok(report)
    }

    fn remove_merged(&mut self, id: &str, report: &mut MergeReport) {
        if self.workspace(id).is_some() {
            match self.remove_workspace(id) {
                Ok(removed) => report.removed.merge(removed),
                Err(e) => {
                    log::warn!("Could not remove workspace '{}': {}", id, e);
                    report.skipped.push(id.to_string());
                }
            }
        } else if self.subflow(id).is_some() {
            match SubflowOperations::delete_subflow(self, id) {
                Ok(removed) => report.removed.merge(removed),
                Err(e) => {
                    log::warn!("Could not remove subflow '{}': {}", id, e);
                    report.skipped.push(id.to_string());
                }
            }
        } else if let Some(group) = self.remove_group(id) {
            report.removed.groups.push(group);
        } else if self.junction(id).is_some() {
            report.removed.merge(self.remove_junction(id));
        } else if let Some(node) = self.get_node(id).cloned() {
            let removed = self.remove_node(id);
            report.removed.nodes.push(node);
            report.removed.merge(removed);
        }
    }

    /// Copy position and declared properties of a remote record onto the live
    /// entity; returns false when no such entity exists
    ///
    /// Config nodes a merged node stops referencing are released, which
    /// removes exclusive ones.
    fn merge_in_place(&mut self, id: &str, record: &Value, report: &mut MergeReport) -> bool {
        let text = |key: &str| record.get(key).and_then(Value::as_str).map(str::to_string);
        let number = |key: &str| record.get(key).and_then(Value::as_f64);
        let flag = |key: &str| record.get(key).and_then(Value::as_bool);

        if let Some(workspace) = self.workspace_mut(id) {
            if let Some(label) = text("label") {
                workspace.label = label;
            }
            if let Some(info) = text("info") {
                workspace.info = info;
            }
            workspace.disabled = flag("disabled").unwrap_or(false);
            workspace.locked = flag("locked").unwrap_or(false);
        } else if let Some(subflow) = self.subflow_mut(id) {
            if let Some(name) = text("name") {
                subflow.name = name;
            }
            if let Some(info) = text("info") {
                subflow.info = info;
            }
            subflow.changed = true;
        } else if let Some(group) = self.groups.get_mut(id) {
            if let Some(name) = text("name") {
                group.name = name;
            }
            group.x = number("x").unwrap_or(group.x);
            group.y = number("y").unwrap_or(group.y);
            group.w = number("w").unwrap_or(group.w);
            group.h = number("h").unwrap_or(group.h);
            if let Some(style) = record.get("style") {
                group.style = style.clone();
            }
        } else if let Some(junction) = self.junctions.get_mut(id) {
            junction.x = number("x").unwrap_or(junction.x);
            junction.y = number("y").unwrap_or(junction.y);
        } else if let Some(node) = self.get_node(id) {
            let declared: Vec<String> = self
                .type_definition(node)
                .map(|d| d.defaults.keys().cloned().collect())
                .unwrap_or_default();
            let previous = self.config_references(node);
            let Some(node) = self.get_node_mut(id) else {
                return false;
            };
            node.x = number("x").unwrap_or(node.x);
            node.y = number("y").unwrap_or(node.y);
            if node.is_unknown() {
                if let (Some(original), Value::Object(fields)) = (node.original.as_mut(), record) {
                    for (key, value) in fields {
                        original.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in declared {
                if let Some(value) = record.get(&key) {
                    node.properties.insert(key, value.clone());
                }
            }
            node.changed = true;
            node.dirty = true;

            let current: Vec<NodeId> = self
                .get_node(id)
                .map(|n| self.config_references(n))
                .unwrap_or_default()
                .into_iter()
                .map(|(_, config_id)| config_id)
                .collect();
            for (_, config_id) in previous {
                if !current.contains(&config_id) {
                    let released = self.release_config_node(&config_id, id);
                    report.removed.merge(released);
                }
            }
            self.update_config_node_users(id);
            self.validate_node(id);
        } else {
            return false;
        }
        log::debug!("Merged remote version of '{}' in place", id);
        true
    }

    /// Replace the outgoing links of `id` with the wires of its remote record
    fn rewire_from_record(&mut self, id: &str, record: &Value) {
        if record.get("wires").is_none() {
            return;
        }
        let Some(source_z) = self.endpoint(id).map(|e| e.z().map(str::to_string)) else {
            return;
        };
        // Links into subflow ports are not part of `wires`
        let ports: HashSet<NodeId> = self
            .subflows
            .values()
            .flat_map(|sf| sf.ports().map(|p| p.id.clone()))
            .collect();
        self.links.retain(|l| l.source != id || ports.contains(&l.target));
        for (port, target) in wire_targets(record) {
            let target_z = self.endpoint(&target).map(|e| e.z().map(str::to_string));
            if target_z.as_ref() == Some(&source_z) {
                self.links.push(Link::new(id, port, target));
            } else {
                log::debug!("Skipping merged wire '{}' -> '{}'", id, target);
            }
        }
    }

    /// Rebuild a subflow's ports and port links from its remote record
    ///
    /// Ports keep their ids by position. Instance links from outputs that no
    /// longer exist are dropped.
    fn rewire_subflow_ports(&mut self, id: &str, record: &Value) {
        let Some(subflow) = self.subflow(id).cloned() else {
            return;
        };
        let current = self.convert_subflow(&subflow);
        if ["in", "out", "status"]
            .iter()
            .all(|key| current.get(*key) == record.get(*key))
        {
            return;
        }
        let Some(record) = record.as_object() else {
            return;
        };

        let reuse_id =
            |existing: Option<&SubflowPort>| existing.map_or_else(new_id, |p| p.id.clone());
        let in_ports: Vec<SubflowPort> = port_records(record, "in")
            .take(1)
            .map(|p| {
                let port = reuse_id(subflow.in_ports.first());
                SubflowPort::new(port, PortRole::Input, 0, id, position(p))
            })
            .collect();
        let out_ports: Vec<SubflowPort> = port_records(record, "out")
            .enumerate()
            .map(|(i, p)| {
                let port = reuse_id(subflow.out_ports.get(i));
                SubflowPort::new(port, PortRole::Output, i, id, position(p))
            })
            .collect();
        let status_record = record.get("status").and_then(Value::as_object);
        let status_port = status_record.map(|p| {
            let port = reuse_id(subflow.status_port.as_ref());
            SubflowPort::new(port, PortRole::Status, 0, id, position(p))
        });

        let old_ports: HashSet<&str> = subflow.ports().map(|p| p.id.as_str()).collect();
        self.links.retain(|l| {
            !old_ports.contains(l.source.as_str()) && !old_ports.contains(l.target.as_str())
        });

        let input = in_ports.first().map(|p| p.id.clone());
        let mut links = Vec::new();
        if let (Some(port_id), Some(port)) = (&input, port_records(record, "in").next()) {
            links.extend(port_wires(port).map(|(target, _)| Link::new(port_id.clone(), 0, target)));
        }
        let outputs = port_records(record, "out")
            .zip(out_ports.iter())
            .chain(status_record.zip(status_port.as_ref()));
        for (port, target) in outputs {
            for (source, source_port) in port_wires(port) {
                let source = if source == id {
                    input.clone().map(|port_id| (port_id, 0))
                } else {
                    Some((source.to_string(), source_port))
                };
                if let Some((source, source_port)) = source {
                    links.push(Link::new(source, source_port, target.id.clone()));
                }
            }
        }

        let output_count = out_ports.len();
        if let Some(live) = self.subflow_mut(id) {
            live.in_ports = in_ports;
            live.out_ports = out_ports;
            live.status_port = status_port;
            live.changed = true;
        }

        let inside = |end: &str| self.endpoint(end).and_then(|e| e.z()) == Some(id);
        let (kept, skipped): (Vec<Link>, Vec<Link>) = links
            .into_iter()
            .partition(|l| inside(l.source.as_str()) && inside(l.target.as_str()));
        if !skipped.is_empty() {
            log::debug!(
                "Skipping {} port wires of subflow '{}' with unknown endpoints",
                skipped.len(),
                id
            );
        }
        self.links.extend(kept);

        let instances: HashSet<NodeId> = self
            .subflow_instances(id)
            .into_iter()
            .map(|n| n.id.clone())
            .collect();
        self.links
            .retain(|l| !instances.contains(&l.source) || l.source_port < output_count);

        SubflowOperations::refresh_instances(self, id, true);
        log::debug!("Rebuilt ports of subflow '{}' from its remote version", id);
    }
}

/// Ids touched by either side of a diff
pub fn touched_ids(diff: &FlowDiff) -> HashSet<&str> {
    diff.added
        .iter()
        .chain(diff.deleted.iter())
        .chain(diff.changed.iter())
        .map(String::as_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FlowBuilder;
    use crate::testing::test_document;
    use crate::validation::validate_document;
    use serde_json::json;

    fn flow() -> Value {
        json!([
            {"id": "t1", "type": "tab", "label": "Flow 1"},
            {"id": "n1", "type": "inject", "z": "t1", "x": 100, "y": 100, "wires": [["n2"]]},
            {"id": "n2", "type": "debug", "z": "t1", "x": 300, "y": 100, "wires": []},
            {"id": "b1", "type": "mqtt-broker", "broker": "localhost"}
        ])
    }

    /// Subflow `sf1` wired `in -> f1 -> out[0]`, with instance `i1` on `t1`
    fn subflow_flow() -> Value {
        FlowBuilder::new()
            .subflow("sf1", "Doubler")
            .subflow_input((40.0, 40.0))
            .subflow_output((300.0, 40.0))
            .node("f1", "function", (150.0, 40.0))
            .input_wire("f1")
            .output_wire(0, "f1", 0)
            .tab("t1", "Flow 1")
            .node("i1", "subflow:sf1", (100.0, 100.0))
            .node("n2", "debug", (300.0, 100.0))
            .wire("i1", 0, "n2")
            .build_value()
    }

    fn broker_flow() -> Value {
        json!([
            {"id": "t1", "type": "tab", "label": "Flow 1"},
            {"id": "b1", "type": "mqtt-broker", "broker": "localhost"},
            {"id": "c1", "type": "tls-config", "cert": "a.pem"},
            {"id": "m1", "type": "mqtt out", "z": "t1", "x": 100, "y": 100, "broker": "b1", "wires": []},
            {"id": "h1", "type": "http request", "z": "t1", "x": 100, "y": 200, "tls": "c1", "wires": [[]]}
        ])
    }

    fn deploy(flow: Value) -> (FlowDocument, Vec<Value>) {
        let mut doc = test_document();
        doc.import_value(flow, ImportOptions::default()).unwrap();
        let baseline = doc.create_complete_node_set(false);
        (doc, baseline)
    }

    fn deployed() -> (FlowDocument, Vec<Value>) {
        deploy(flow())
    }

    fn record<'a>(records: &'a [Value], id: &str) -> &'a Value {
        records
            .iter()
            .find(|r| record_id(r) == Some(id))
            .unwrap()
    }

    fn edit(records: &[Value], id: &str, key: &str, value: Value) -> Vec<Value> {
        records
            .iter()
            .cloned()
            .map(|mut record| {
                if record_id(&record) == Some(id) {
                    record[key] = value.clone();
                }
                record
            })
            .collect()
    }

    fn without(records: &[Value], ids: &[&str]) -> Vec<Value> {
        records
            .iter()
            .filter(|r| !record_id(r).map_or(false, |id| ids.contains(&id)))
            .cloned()
            .collect()
    }

    #[test]
    fn test_parse_partitions_by_owner() {
        let records = flow().as_array().cloned().unwrap();
        let parsed = ParsedFlows::parse(&records);
        assert_eq!(parsed.all.len(), 4);
        assert_eq!(parsed.tab_order, vec!["t1"]);
        assert_eq!(parsed.tabs["t1"].nodes.len(), 2);
        assert_eq!(parsed.globals.len(), 1);
        assert_eq!(parsed.parent_of("n1"), Some("t1"));
    }

    #[test]
    fn test_diff_of_identical_snapshots_is_empty() {
        let (_, baseline) = deployed();
        let diff = generate_diff(&baseline, &baseline);
        assert!(diff.is_empty());
        assert!(touched_ids(&diff).is_empty());
    }

    #[test]
    fn test_diff_classifies_records() {
        let (_, baseline) = deployed();
        let mut candidate = without(&edit(&baseline, "n1", "x", json!(150)), &["n2"]);
        candidate.push(json!({"id": "n3", "type": "debug", "z": "t1"}));

        let diff = generate_diff(&baseline, &candidate);
        assert_eq!(diff.changed, BTreeSet::from(["n1".to_string()]));
        assert_eq!(diff.deleted, BTreeSet::from(["n2".to_string()]));
        assert_eq!(diff.added, BTreeSet::from(["n3".to_string()]));
    }

    #[test]
    fn test_local_change_conflicts_with_remote_delete() {
        let (_, baseline) = deployed();
        let local = generate_diff(&baseline, &edit(&baseline, "n1", "x", json!(150)));
        let remote = generate_diff(&baseline, &without(&baseline, &["n1"]));

        let conflicts = identify_conflicts(&local, &remote);
        assert_eq!(conflicts, BTreeSet::from(["n1".to_string()]));
        assert_eq!(identify_conflicts(&remote, &local), conflicts);
    }

    #[test]
    fn test_identical_changes_do_not_conflict() {
        let (_, baseline) = deployed();
        let edited = edit(&baseline, "n1", "x", json!(150));
        let local = generate_diff(&baseline, &edited);
        let remote = generate_diff(&baseline, &edited);
        assert!(identify_conflicts(&local, &remote).is_empty());

        let other = generate_diff(&baseline, &edit(&baseline, "n1", "x", json!(175)));
        assert_eq!(identify_conflicts(&local, &other).len(), 1);
    }

    #[test]
    fn test_add_into_deleted_flow_conflicts() {
        let (_, baseline) = deployed();
        let mut with_node = baseline.clone();
        with_node.push(json!({"id": "n9", "type": "debug", "z": "t1"}));
        let local = generate_diff(&baseline, &with_node);
        let remote = generate_diff(&baseline, &without(&baseline, &["t1", "n1", "n2"]));

        assert!(identify_conflicts(&local, &remote).contains("n9"));
    }

    #[test]
    fn test_merge_refuses_unresolved_conflicts() {
        let (mut doc, baseline) = deployed();
        doc.get_node_mut("n1").unwrap().x = 150.0;
        let local = generate_diff(&baseline, &doc.create_complete_node_set(false));
        let remote = generate_diff(&baseline, &without(&baseline, &["n1"]));

        let err = doc.merge_diff(&local, &remote, &HashMap::new()).unwrap_err();
        assert!(matches!(err, FlowGraphError::UnresolvedConflicts(ref ids) if ids == &["n1"]));
        assert!(doc.get_node("n1").is_some());
    }

    #[test]
    fn test_merge_resolution_choice() {
        let (mut doc, baseline) = deployed();
        doc.get_node_mut("n1").unwrap().x = 150.0;
        let local = generate_diff(&baseline, &doc.create_complete_node_set(false));
        let remote = generate_diff(&baseline, &without(&baseline, &["n1"]));

        let keep = HashMap::from([("n1".to_string(), Resolution::Local)]);
        doc.merge_diff(&local, &remote, &keep).unwrap();
        assert_eq!(doc.get_node("n1").unwrap().x, 150.0);

        let take = HashMap::from([("n1".to_string(), Resolution::Remote)]);
        let report = doc.merge_diff(&local, &remote, &take).unwrap();
        assert!(doc.get_node("n1").is_none());
        assert_eq!(report.removed.nodes[0].id, "n1");
        assert!(doc.links().all(|l| !l.touches("n1")));
    }

    #[test]
    fn test_merge_updates_in_place_and_imports_additions() {
        let (mut doc, baseline) = deployed();
        let local = generate_diff(&baseline, &doc.create_complete_node_set(false));

        let mut remote_set = edit(&baseline, "n1", "x", json!(200));
        remote_set = edit(&remote_set, "n1", "name", json!("tick"));
        remote_set = edit(&remote_set, "n1", "wires", json!([["n2", "n3"]]));
        remote_set.push(json!({"id": "n3", "type": "debug", "z": "t1", "x": 300, "y": 200, "wires": []}));
        let remote = generate_diff(&baseline, &remote_set);

        let report = doc.merge_diff(&local, &remote, &HashMap::new()).unwrap();
        assert_eq!(report.updated, vec!["n1"]);
        assert_eq!(report.imported.nodes, vec!["n3"]);

        let n1 = doc.get_node("n1").unwrap();
        assert_eq!(n1.x, 200.0);
        assert_eq!(n1.property_str("name"), Some("tick"));
        assert!(doc.links().any(|l| *l == Link::new("n1", 0, "n2")));
        assert!(doc.links().any(|l| *l == Link::new("n1", 0, "n3")));
        assert_eq!(doc.links().count(), 2);

        let merged = generate_diff(&remote_set, &doc.create_complete_node_set(false));
        assert!(merged.added.is_empty() && merged.deleted.is_empty());
    }

    #[test]
    fn test_merge_remote_tab_deletion_cascades() {
        let (mut doc, baseline) = deployed();
        let local = generate_diff(&baseline, &baseline);
        let mut remote_set = without(&baseline, &["t1", "n1", "n2"]);
        remote_set.push(json!({"id": "t2", "type": "tab", "label": "Flow 2"}));
        remote_set.push(json!({"id": "n5", "type": "inject", "z": "t2", "x": 10, "y": 10, "wires": [[]]}));
        let remote = generate_diff(&baseline, &remote_set);

        let report = doc.merge_diff(&local, &remote, &HashMap::new()).unwrap();
        assert!(doc.workspace("t1").is_none());
        assert!(doc.get_node("n2").is_none());
        assert_eq!(report.removed.workspaces.len(), 1);
        assert!(doc.get_node("n5").unwrap().is_on("t2"));
        assert!(doc.get_node("b1").is_some());
    }

    #[test]
    fn test_remote_change_to_locally_deleted_node_reimports() {
        let (mut doc, baseline) = deployed();
        doc.remove_node("n2");
        let local = generate_diff(&baseline, &doc.create_complete_node_set(false));
        let remote = generate_diff(&baseline, &edit(&baseline, "n2", "x", json!(400)));

        let resolutions = HashMap::from([("n2".to_string(), Resolution::Remote)]);
        let report = doc.merge_diff(&local, &remote, &resolutions).unwrap();
        assert_eq!(report.imported.nodes, vec!["n2"]);
        assert_eq!(doc.get_node("n2").unwrap().x, 400.0);
    }

    #[test]
    fn test_merge_subflow_body_edit_keeps_port_links() {
        let (mut doc, baseline) = deploy(subflow_flow());
        let local = generate_diff(&baseline, &baseline);
        let remote_set = edit(&baseline, "f1", "x", json!(180));
        let remote = generate_diff(&baseline, &remote_set);

        let report = doc.merge_diff(&local, &remote, &HashMap::new()).unwrap();
        assert_eq!(report.updated, vec!["f1"]);

        let sf = doc.subflow("sf1").unwrap();
        let input = sf.in_ports[0].id.clone();
        let output = sf.out_ports[0].id.clone();
        assert!(doc.links().any(|l| *l == Link::new(input.clone(), 0, "f1")));
        assert!(doc.links().any(|l| *l == Link::new("f1", 0, output.clone())));
        assert_eq!(doc.get_node("f1").unwrap().x, 180.0);
        assert!(generate_diff(&remote_set, &doc.create_complete_node_set(false)).is_empty());
    }

    #[test]
    fn test_merge_subflow_port_wiring_change() {
        let (mut doc, baseline) = deploy(subflow_flow());
        let local = generate_diff(&baseline, &baseline);
        let mut inputs = record(&baseline, "sf1")["in"].clone();
        inputs[0]["wires"] = json!([]);
        let remote_set = edit(&baseline, "sf1", "in", inputs);
        let remote = generate_diff(&baseline, &remote_set);
        assert_eq!(remote.changed, BTreeSet::from(["sf1".to_string()]));

        let report = doc.merge_diff(&local, &remote, &HashMap::new()).unwrap();
        assert_eq!(report.updated, vec!["sf1"]);

        let sf = doc.subflow("sf1").unwrap();
        let input = sf.in_ports[0].id.clone();
        let output = sf.out_ports[0].id.clone();
        assert!(doc.links().all(|l| l.source != input));
        assert!(doc.links().any(|l| *l == Link::new("f1", 0, output.clone())));
        assert!(generate_diff(&remote_set, &doc.create_complete_node_set(false)).is_empty());
    }

    #[test]
    fn test_merge_subflow_output_added() {
        let (mut doc, baseline) = deploy(subflow_flow());
        let local = generate_diff(&baseline, &baseline);
        let mut outputs = record(&baseline, "sf1")["out"].clone();
        outputs
            .as_array_mut()
            .unwrap()
            .push(json!({"x": 300, "y": 120, "wires": [{"id": "f1", "port": 0}]}));
        let remote_set = edit(&baseline, "sf1", "out", outputs);
        let remote = generate_diff(&baseline, &remote_set);

        doc.merge_diff(&local, &remote, &HashMap::new()).unwrap();

        let sf = doc.subflow("sf1").unwrap();
        assert_eq!(sf.out_ports.len(), 2);
        assert!(doc.links().any(|l| *l == Link::new("f1", 0, sf.out_ports[1].id.clone())));
        assert_eq!(doc.convert_subflow(sf), *record(&remote_set, "sf1"));

        let instance = doc.get_node("i1").unwrap();
        assert_eq!(instance.outputs, 2);
        assert!(instance.changed);
        assert!(doc.links().any(|l| *l == Link::new("i1", 0, "n2")));
    }

    #[test]
    fn test_merge_subflow_output_removed_drops_instance_links() {
        let (mut doc, baseline) = deploy(subflow_flow());
        let local = generate_diff(&baseline, &baseline);
        let remote_set = edit(&baseline, "sf1", "out", json!([]));
        let remote = generate_diff(&baseline, &remote_set);

        doc.merge_diff(&local, &remote, &HashMap::new()).unwrap();

        assert!(doc.subflow("sf1").unwrap().out_ports.is_empty());
        assert_eq!(doc.get_node("i1").unwrap().outputs, 0);
        assert!(doc.links().all(|l| l.source != "i1"));
        assert!(doc.links().all(|l| l.source != "f1"));
        assert!(validate_document(&doc).is_empty());
    }

    #[test]
    fn test_merge_config_reference_swap() {
        let (mut doc, baseline) = deploy(broker_flow());
        assert_eq!(doc.get_node("b1").unwrap().users, vec!["m1".to_string()]);
        let local = generate_diff(&baseline, &baseline);
        let mut remote_set = edit(&baseline, "m1", "broker", json!("b2"));
        remote_set.push(json!({"id": "b2", "type": "mqtt-broker", "broker": "remote"}));
        let remote = generate_diff(&baseline, &remote_set);

        let report = doc.merge_diff(&local, &remote, &HashMap::new()).unwrap();
        assert_eq!(report.updated, vec!["m1"]);
        assert_eq!(report.imported.nodes, vec!["b2"]);
        assert!(doc.get_node("b1").unwrap().users.is_empty());
        assert_eq!(doc.get_node("b2").unwrap().users, vec!["m1".to_string()]);
        assert!(validate_document(&doc).is_empty());

        doc.remove_node("m1");
        assert!(doc.get_node("b1").unwrap().users.is_empty());
        assert!(doc.get_node("b2").unwrap().users.is_empty());
        assert!(validate_document(&doc).is_empty());
    }

    #[test]
    fn test_merge_reference_swap_removes_exclusive_config() {
        let (mut doc, baseline) = deploy(broker_flow());
        let local = generate_diff(&baseline, &baseline);
        let mut remote_set = edit(&baseline, "h1", "tls", json!("c2"));
        remote_set.push(json!({"id": "c2", "type": "tls-config", "cert": "b.pem"}));
        let remote = generate_diff(&baseline, &remote_set);

        let report = doc.merge_diff(&local, &remote, &HashMap::new()).unwrap();
        assert!(doc.get_node("c1").is_none());
        assert!(report.removed.nodes.iter().any(|n| n.id == "c1"));
        assert_eq!(doc.get_node("c2").unwrap().users, vec!["h1".to_string()]);
        assert!(validate_document(&doc).is_empty());
    }
}
