//! Conversion from live entities to interchange JSON
//!
//! The interchange format is a flat array of records. Ordinary nodes carry
//! their declared properties as top-level keys plus `x`, `y` and `wires`
//! (one array of target ids per output). Links are rebuilt into `wires` here
//! and back into [`Link`](crate::types::Link)s on import.

use std::collections::{HashSet, VecDeque};

use serde_json::{json, Map, Value};

use crate::descriptor::CredentialKind;
use crate::document::FlowDocument;
use crate::types::{Group, Junction, Node, NodeId, Subflow, Workspace};

/// JSON number for a coordinate; integral values are written as integers
pub(crate) fn coordinate(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

/// Which config nodes and subflows an exportable set already carries
#[derive(Default)]
struct ExportState {
    configs: HashSet<NodeId>,
    subflows: HashSet<NodeId>,
}

impl FlowDocument {
    fn is_subflow_port(&self, id: &str) -> bool {
        self.subflows.values().any(|sf| sf.find_port(id).is_some())
    }

    /// Project a node into its interchange record
    ///
    /// Only declared properties are written. Unknown-type nodes write back
    /// their original record instead. With `export_credentials`, credential
    /// fields that differ from the saved baseline are included.
    pub fn convert_node(&self, node: &Node, export_credentials: bool) -> Value {
        let mut record = Map::new();
        record.insert("id".into(), json!(node.id));
        record.insert("type".into(), json!(node.node_type));
        if let Some(z) = &node.z {
            record.insert("z".into(), json!(z));
        }

        let definition = self.type_definition(node);
        match (&node.original, definition) {
            (Some(original), _) if node.is_unknown() => {
                for (key, value) in original {
                    record.insert(key.clone(), value.clone());
                }
            }
            (_, Some(def)) => {
                for name in def.defaults.keys() {
                    if let Some(value) = node.properties.get(name) {
                        record.insert(name.clone(), value.clone());
                    }
                }
                if export_credentials {
                    if let Some(credentials) = self.changed_credentials(node) {
                        record.insert("credentials".into(), Value::Object(credentials));
                    }
                }
            }
            _ => {}
        }

        let is_config =
            self.is_config_node(&node.id) || definition.map_or(false, |d| d.is_config());
        if !is_config {
            record.insert("x".into(), coordinate(node.x));
            record.insert("y".into(), coordinate(node.y));
            if let Some(group) = &node.group {
                record.insert("g".into(), json!(group));
            }
            record.insert("wires".into(), self.wires_from(&node.id, node.outputs));
        }
        Value::Object(record)
    }

    /// `wires` array for an entity with `outputs` output ports
    fn wires_from(&self, id: &str, outputs: usize) -> Value {
        let mut wires: Vec<Vec<Value>> = vec![Vec::new(); outputs];
        for link in self.links.iter().filter(|l| l.source == id) {
            if self.is_subflow_port(&link.target) {
                continue;
            }
            if link.source_port >= wires.len() {
                wires.resize(link.source_port + 1, Vec::new());
            }
            wires[link.source_port].push(json!(link.target));
        }
        json!(wires)
    }

    /// Credential fields that differ from the saved baseline
    fn changed_credentials(&self, node: &Node) -> Option<Map<String, Value>> {
        let credentials = node.credentials.as_ref()?;
        let def = self.type_definition(node)?;
        let mut changed = Map::new();

        for (name, kind) in &def.credentials {
            let current = credentials.values.get(name);
            let include = match kind {
                CredentialKind::Password => {
                    let flag = format!("has_{}", name);
                    let has_now = credentials.values.get(&flag);
                    let has_saved = credentials.saved.get(&flag);
                    let flagged = has_now.and_then(Value::as_bool).unwrap_or(false);
                    has_now != has_saved || (flagged && current.map_or(false, is_truthy))
                }
                CredentialKind::Text => current.map_or(false, |v| {
                    !v.is_null() && Some(v) != credentials.saved.get(name)
                }),
            };
            if include {
                if let Some(value) = current {
                    changed.insert(name.clone(), value.clone());
                }
            }
        }
        (!changed.is_empty()).then_some(changed)
    }

    /// Project a subflow template into its interchange record
    pub fn convert_subflow(&self, subflow: &Subflow) -> Value {
        let mut record = subflow.extra.clone();
        record.insert("id".into(), json!(subflow.id));
        record.insert("type".into(), json!("subflow"));
        record.insert("name".into(), json!(subflow.name));
        record.insert("info".into(), json!(subflow.info));

        let inputs: Vec<Value> = subflow
            .in_ports
            .iter()
            .map(|port| {
                let wires: Vec<Value> = self
                    .links
                    .iter()
                    .filter(|l| l.source == port.id && !self.is_subflow_port(&l.target))
                    .map(|l| json!({ "id": l.target }))
                    .collect();
                json!({ "x": coordinate(port.x), "y": coordinate(port.y), "wires": wires })
            })
            .collect();
        record.insert("in".into(), json!(inputs));

        let outputs: Vec<Value> = subflow
            .out_ports
            .iter()
            .map(|port| self.port_record(subflow, &port.id, port.x, port.y))
            .collect();
        record.insert("out".into(), json!(outputs));

        if let Some(status) = &subflow.status_port {
            record.insert(
                "status".into(),
                self.port_record(subflow, &status.id, status.x, status.y),
            );
        }
        Value::Object(record)
    }

    /// Record for an output or status port: its inbound wires as `{id, port}`
    fn port_record(&self, subflow: &Subflow, port_id: &str, x: f64, y: f64) -> Value {
        let wires: Vec<Value> = self
            .links
            .iter()
            .filter(|l| l.target == port_id)
            .map(|l| {
                if self.is_subflow_port(&l.source) {
                    json!({ "id": subflow.id, "port": 0 })
                } else {
                    json!({ "id": l.source, "port": l.source_port })
                }
            })
            .collect();
        json!({ "x": coordinate(x), "y": coordinate(y), "wires": wires })
    }

    pub fn convert_workspace(&self, workspace: &Workspace) -> Value {
        let mut record = workspace.extra.clone();
        record.insert("id".into(), json!(workspace.id));
        record.insert("type".into(), json!("tab"));
        record.insert("label".into(), json!(workspace.label));
        record.insert("disabled".into(), json!(workspace.disabled));
        record.insert("info".into(), json!(workspace.info));
        if workspace.locked {
            record.insert("locked".into(), json!(true));
        }
        Value::Object(record)
    }

    pub fn convert_group(&self, group: &Group) -> Value {
        let mut record = group.extra.clone();
        record.insert("id".into(), json!(group.id));
        record.insert("type".into(), json!("group"));
        if let Some(z) = &group.z {
            record.insert("z".into(), json!(z));
        }
        record.insert("name".into(), json!(group.name));
        record.insert("style".into(), group.style.clone());
        record.insert("nodes".into(), json!(group.nodes));
        if let Some(parent) = &group.parent {
            record.insert("g".into(), json!(parent));
        }
        record.insert("x".into(), coordinate(group.x));
        record.insert("y".into(), coordinate(group.y));
        record.insert("w".into(), coordinate(group.w));
        record.insert("h".into(), coordinate(group.h));
        Value::Object(record)
    }

    pub fn convert_junction(&self, junction: &Junction) -> Value {
        let mut record = Map::new();
        record.insert("id".into(), json!(junction.id));
        record.insert("type".into(), json!("junction"));
        if let Some(z) = &junction.z {
            record.insert("z".into(), json!(z));
        }
        if let Some(group) = &junction.group {
            record.insert("g".into(), json!(group));
        }
        record.insert("x".into(), coordinate(junction.x));
        record.insert("y".into(), coordinate(junction.y));
        record.insert("wires".into(), self.wires_from(&junction.id, 1));
        Value::Object(record)
    }

    /// Export a selection as a self-contained fragment
    ///
    /// Subflow templates used by instances in the selection are inlined
    /// ahead of them (recursively), and referenced config nodes are pulled
    /// in unless their type is not exportable, in which case the reference
    /// is blanked.
    pub fn create_exportable_node_set(&self, ids: &[NodeId]) -> Vec<Value> {
        let mut state = ExportState::default();
        self.exportable_set(ids, &mut state).into()
    }

    fn exportable_set(&self, ids: &[NodeId], state: &mut ExportState) -> VecDeque<Value> {
        let mut out = VecDeque::new();
        for id in ids {
            if let Some(subflow) = self.subflows.get(id) {
                out.push_back(self.convert_subflow(subflow));
                continue;
            }
            if let Some(junction) = self.junctions.get(id) {
                out.push_back(self.convert_junction(junction));
                continue;
            }
            if let Some(group) = self.groups.get(id) {
                out.push_back(self.convert_group(group));
                continue;
            }
            let Some(node) = self.get_node(id) else {
                continue;
            };

            if let Some(subflow_id) = node.subflow_template() {
                if self.subflows.contains_key(subflow_id)
                    && state.subflows.insert(subflow_id.to_string())
                {
                    let body = self.subflow_body(subflow_id);
                    let inlined = self.exportable_set(&body, state);
                    for record in inlined.into_iter().rev() {
                        out.push_front(record);
                    }
                }
            }

            let mut record = self.convert_node(node, false);
            self.export_config_references(node, &mut record, state, &mut out);
            out.push_back(record);
        }
        out
    }

    /// Template id followed by everything that lives inside it
    fn subflow_body(&self, subflow_id: &str) -> Vec<NodeId> {
        std::iter::once(subflow_id.to_string())
            .chain(
                self.nodes
                    .iter()
                    .filter(|n| n.is_on(subflow_id))
                    .map(|n| n.id.clone()),
            )
            .chain(
                self.junctions
                    .values()
                    .filter(|j| j.z.as_deref() == Some(subflow_id))
                    .map(|j| j.id.clone()),
            )
            .chain(
                self.groups
                    .values()
                    .filter(|g| g.z.as_deref() == Some(subflow_id))
                    .map(|g| g.id.clone()),
            )
            .collect()
    }

    fn export_config_references(
        &self,
        node: &Node,
        record: &mut Value,
        state: &mut ExportState,
        out: &mut VecDeque<Value>,
    ) {
        let Some(def) = self.type_definition(node) else {
            return;
        };
        for (prop, config_type) in def.config_properties() {
            let Some(config) = node
                .property_str(prop)
                .and_then(|id| self.config_nodes.get(id))
            else {
                continue;
            };
            let exportable = self
                .registry()
                .get_node_type(config_type)
                .map_or(true, |d| d.is_exportable());
            if exportable {
                if state.configs.insert(config.id.clone()) {
                    let mut config_record = self.convert_node(config, false);
                    self.export_config_references(config, &mut config_record, state, out);
                    out.push_front(config_record);
                }
            } else if let Some(fields) = record.as_object_mut() {
                fields.insert(prop.to_string(), json!(""));
            }
        }
    }

    /// Full document snapshot
    ///
    /// Tabs (in tab order), subflows, config nodes, nodes, groups, junctions.
    pub fn create_complete_node_set(&self, export_credentials: bool) -> Vec<Value> {
        let mut records = Vec::new();
        records.extend(self.workspaces().map(|w| self.convert_workspace(w)));
        records.extend(self.subflows.values().map(|sf| self.convert_subflow(sf)));
        records.extend(
            self.config_nodes
                .values()
                .map(|n| self.convert_node(n, export_credentials)),
        );
        records.extend(
            self.nodes
                .iter()
                .map(|n| self.convert_node(n, export_credentials)),
        );
        records.extend(self.groups.values().map(|g| self.convert_group(g)));
        records.extend(self.junctions.values().map(|j| self.convert_junction(j)));
        records
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_document;
    use crate::types::{Credentials, Link, PortRole, SubflowPort};

    fn doc_with_flow() -> FlowDocument {
        let mut doc = test_document();
        doc.add_workspace(Workspace::new("t1", "Flow 1")).unwrap();
        doc.add_node(
            Node::new("n1", "inject")
                .on("t1")
                .at(100.0, 100.0)
                .with_outputs(1)
                .with_property("name", json!("tick")),
        )
        .unwrap();
        doc.add_node(Node::new("n2", "debug").on("t1").at(300.0, 100.0))
            .unwrap();
        doc.add_link(Link::new("n1", 0, "n2"));
        doc
    }

    #[test]
    fn test_convert_node_writes_declared_properties_and_wires() {
        let mut doc = doc_with_flow();
        doc.get_node_mut("n1")
            .unwrap()
            .properties
            .insert("runtime_only".into(), json!(1));

        let record = doc.convert_node(doc.get_node("n1").unwrap(), false);
        assert_eq!(record["id"], "n1");
        assert_eq!(record["name"], "tick");
        assert_eq!(record["x"], json!(100));
        assert_eq!(record["wires"], json!([["n2"]]));
        assert!(record.get("runtime_only").is_none());
        assert!(record.get("dirty").is_none());
    }

    #[test]
    fn test_config_node_has_no_position_or_wires() {
        let mut doc = test_document();
        doc.add_node(Node::new("b1", "mqtt-broker").with_property("broker", json!("localhost")))
            .unwrap();
        let record = doc.convert_node(doc.get_node("b1").unwrap(), false);
        assert!(record.get("x").is_none());
        assert!(record.get("wires").is_none());
        assert!(record.get("z").is_none());
    }

    #[test]
    fn test_unknown_node_round_trips_original() {
        let mut doc = test_document();
        let mut node = Node::new("u1", "unknown")
            .on("t1")
            .with_property("name", json!("mystery"));
        let mut original = Map::new();
        original.insert("type".into(), json!("mystery"));
        original.insert("secret_sauce".into(), json!({"a": 1}));
        node.original = Some(original);
        doc.add_node(node).unwrap();

        let record = doc.convert_node(doc.get_node("u1").unwrap(), false);
        assert_eq!(record["type"], "mystery");
        assert_eq!(record["secret_sauce"], json!({"a": 1}));
    }

    #[test]
    fn test_credentials_only_when_changed() {
        let mut doc = test_document();
        let mut values = Map::new();
        values.insert("user".into(), json!("alice"));
        values.insert("password".into(), json!("s3cret"));
        values.insert("has_password".into(), json!(true));
        let mut saved = Map::new();
        saved.insert("user".into(), json!("alice"));
        saved.insert("has_password".into(), json!(true));

        let mut node = Node::new("b1", "mqtt-broker");
        node.credentials = Some(Credentials::new(values).with_saved(saved));
        doc.add_node(node).unwrap();
        let node = doc.get_node("b1").unwrap();

        let record = doc.convert_node(node, true);
        assert_eq!(record["credentials"], json!({"password": "s3cret"}));
        assert!(doc.convert_node(node, false).get("credentials").is_none());
    }

    #[test]
    fn test_convert_subflow_ports() {
        let mut doc = test_document();
        let mut sf = Subflow::new("sf1", "SF");
        sf.in_ports
            .push(SubflowPort::new("in0", PortRole::Input, 0, "sf1", (50.0, 30.0)));
        sf.out_ports
            .push(SubflowPort::new("out0", PortRole::Output, 0, "sf1", (300.0, 30.0)));
        sf.out_ports
            .push(SubflowPort::new("out1", PortRole::Output, 1, "sf1", (300.0, 90.0)));
        doc.add_subflow(sf, false);
        doc.add_node(Node::new("f1", "function").on("sf1").with_outputs(1))
            .unwrap();
        doc.add_link(Link::new("in0", 0, "f1"));
        doc.add_link(Link::new("f1", 0, "out0"));
        doc.add_link(Link::new("in0", 0, "out1"));

        let record = doc.convert_subflow(doc.subflow("sf1").unwrap());
        assert_eq!(record["in"][0]["wires"], json!([{"id": "f1"}]));
        assert_eq!(record["out"][0]["wires"], json!([{"id": "f1", "port": 0}]));
        assert_eq!(record["out"][1]["wires"], json!([{"id": "sf1", "port": 0}]));

        // Port targets are not written into the node's own wires
        let f1 = doc.convert_node(doc.get_node("f1").unwrap(), false);
        assert_eq!(f1["wires"], json!([[]]));
    }

    #[test]
    fn test_exportable_set_pulls_in_subflow_and_config() {
        let mut doc = doc_with_flow();
        doc.add_node(Node::new("b1", "mqtt-broker").with_property("broker", json!("localhost")))
            .unwrap();
        doc.add_subflow(Subflow::new("sf1", "SF"), false);
        doc.add_node(
            Node::new("m1", "mqtt out")
                .on("sf1")
                .with_property("broker", json!("b1")),
        )
        .unwrap();
        doc.add_node(Node::new("i1", "subflow:sf1").on("t1")).unwrap();

        let set = doc.create_exportable_node_set(&["i1".to_string()]);
        let ids: Vec<_> = set.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["b1", "sf1", "m1", "i1"]);
    }

    #[test]
    fn test_non_exportable_config_is_blanked() {
        let mut doc = doc_with_flow();
        doc.add_node(Node::new("v1", "vault-store")).unwrap();
        doc.add_node(
            Node::new("r1", "vault read")
                .on("t1")
                .with_property("store", json!("v1")),
        )
        .unwrap();

        let set = doc.create_exportable_node_set(&["r1".to_string()]);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0]["store"], "");
    }

    #[test]
    fn test_complete_node_set_order() {
        let mut doc = doc_with_flow();
        doc.add_subflow(Subflow::new("sf1", "SF"), false);
        doc.add_node(Node::new("b1", "mqtt-broker")).unwrap();

        let set = doc.create_complete_node_set(true);
        let types: Vec<_> = set.iter().map(|r| r["type"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["tab", "subflow", "mqtt-broker", "inject", "debug"]);
    }

    #[test]
    fn test_coordinate() {
        assert_eq!(coordinate(100.0), json!(100));
        assert_eq!(coordinate(12.5), json!(12.5));
    }
}
