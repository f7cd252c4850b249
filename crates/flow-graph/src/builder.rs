//! Fluent builder for interchange JSON
//!
//! Produces the flat record list accepted by
//! [`FlowDocument::import_value`](crate::FlowDocument::import_value).

use serde_json::{json, Map, Value};

use crate::convert::coordinate;
use crate::error::Result;

/// Fluent builder for flow record lists
///
/// Nodes are placed on the most recently added tab or subflow.
///
/// # Example
///
/// ```ignore
/// let flow = FlowBuilder::new()
///     .tab("t1", "Flow 1")
///     .node("n1", "inject", (100.0, 100.0))
///     .node("n2", "debug", (300.0, 100.0))
///     .wire("n1", 0, "n2")
///     .build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct FlowBuilder {
    records: Vec<Map<String, Value>>,
    current_z: Option<String>,
}

impl FlowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tab; following nodes go on it
    pub fn tab(mut self, id: impl Into<String>, label: impl Into<String>) -> Self {
        let id = id.into();
        self.push(json!({"id": id, "type": "tab", "label": label.into()}));
        self.current_z = Some(id);
        self
    }

    /// Add a subflow template; following nodes go inside it
    pub fn subflow(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        self.push(json!({
            "id": id,
            "type": "subflow",
            "name": name.into(),
            "info": "",
            "in": [],
            "out": []
        }));
        self.current_z = Some(id);
        self
    }

    /// Add the input port of the last subflow
    pub fn subflow_input(mut self, position: (f64, f64)) -> Self {
        self.push_port("in", position);
        self
    }

    /// Append an output port to the last subflow
    pub fn subflow_output(mut self, position: (f64, f64)) -> Self {
        self.push_port("out", position);
        self
    }

    /// Wire the last subflow's input port to `target`
    pub fn input_wire(mut self, target: impl Into<String>) -> Self {
        let wire = json!({"id": target.into()});
        if let Some(port) = self.subflow_port("in", 0) {
            push_wire(port, wire);
        }
        self
    }

    /// Wire `(source, port)` to output port `index` of the last subflow
    pub fn output_wire(mut self, index: usize, source: impl Into<String>, port: usize) -> Self {
        let wire = json!({"id": source.into(), "port": port});
        if let Some(out) = self.subflow_port("out", index) {
            push_wire(out, wire);
        }
        self
    }

    /// Add a drawable node on the current tab or subflow
    pub fn node(
        mut self,
        id: impl Into<String>,
        node_type: impl Into<String>,
        position: (f64, f64),
    ) -> Self {
        let mut record = json!({
            "id": id.into(),
            "type": node_type.into(),
            "x": coordinate(position.0),
            "y": coordinate(position.1),
            "wires": []
        });
        if let Some(z) = &self.current_z {
            record["z"] = Value::String(z.clone());
        }
        self.push(record);
        self
    }

    /// Add a global config node
    pub fn config(mut self, id: impl Into<String>, node_type: impl Into<String>) -> Self {
        self.push(json!({"id": id.into(), "type": node_type.into()}));
        self
    }

    /// Add a junction on the current tab or subflow
    pub fn junction(self, id: impl Into<String>, position: (f64, f64)) -> Self {
        self.node(id, "junction", position)
    }

    /// Add a group around existing records
    pub fn group(mut self, id: impl Into<String>, members: &[&str]) -> Self {
        let mut record = json!({"id": id.into(), "type": "group", "nodes": members});
        if let Some(z) = &self.current_z {
            record["z"] = Value::String(z.clone());
        }
        self.push(record);
        self
    }

    /// Set a property on the most recently added record
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        if let Some(record) = self.records.last_mut() {
            record.insert(key.into(), value);
        }
        self
    }

    /// Set `z` on the most recently added record
    pub fn on(self, z: impl Into<String>) -> Self {
        self.with_property("z", Value::String(z.into()))
    }

    /// Wire output `port` of `source` to `target`
    pub fn wire(mut self, source: &str, port: usize, target: impl Into<String>) -> Self {
        let target = Value::String(target.into());
        let Some(index) = self
            .records
            .iter()
            .position(|r| r.get("id").and_then(Value::as_str) == Some(source))
        else {
            log::warn!("Cannot wire from unknown record '{}'", source);
            return self;
        };
        let wires = self.records[index]
            .entry("wires")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(ports) = wires {
            while ports.len() <= port {
                ports.push(Value::Array(Vec::new()));
            }
            if let Value::Array(targets) = &mut ports[port] {
                targets.push(target);
            }
        }
        self
    }

    pub fn build(self) -> Vec<Value> {
        self.records.into_iter().map(Value::Object).collect()
    }

    pub fn build_value(self) -> Value {
        Value::Array(self.build())
    }

    pub fn to_json_string(self) -> Result<String> {
        Ok(serde_json::to_string(&self.build_value())?)
    }

    fn push(&mut self, record: Value) {
        if let Value::Object(map) = record {
            self.records.push(map);
        }
    }

    fn last_subflow(&mut self) -> Option<&mut Map<String, Value>> {
        self.records
            .iter_mut()
            .rev()
            .find(|r| r.get("type").and_then(Value::as_str) == Some("subflow"))
    }

    fn push_port(&mut self, direction: &str, position: (f64, f64)) {
        let port = json!({"x": coordinate(position.0), "y": coordinate(position.1), "wires": []});
        if let Some(Value::Array(ports)) = self
            .last_subflow()
            .and_then(|subflow| subflow.get_mut(direction))
        {
            ports.push(port);
        }
    }

    fn subflow_port(&mut self, direction: &str, index: usize) -> Option<&mut Value> {
        self.last_subflow()?.get_mut(direction)?.get_mut(index)
    }
}

fn push_wire(port: &mut Value, wire: Value) {
    if let Some(Value::Array(wires)) = port.get_mut("wires") {
        wires.push(wire);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::ImportOptions;
    use crate::testing::test_document;
    use crate::types::Link;

    #[test]
    fn test_builder_produces_records() {
        let flow = FlowBuilder::new()
            .tab("t1", "Flow 1")
            .node("n1", "inject", (100.0, 100.0))
            .with_property("topic", json!("tick"))
            .node("n2", "debug", (300.0, 100.0))
            .wire("n1", 0, "n2")
            .build();

        assert_eq!(flow.len(), 3);
        assert_eq!(flow[0], json!({"id": "t1", "type": "tab", "label": "Flow 1"}));
        assert_eq!(flow[1]["z"], json!("t1"));
        assert_eq!(flow[1]["x"], json!(100));
        assert_eq!(flow[1]["wires"], json!([["n2"]]));
        assert_eq!(flow[1]["topic"], json!("tick"));
    }

    #[test]
    fn test_wire_pads_ports() {
        let flow = FlowBuilder::new()
            .tab("t1", "Flow 1")
            .node("f1", "function", (0.0, 0.0))
            .wire("f1", 2, "x")
            .build();
        assert_eq!(flow[1]["wires"], json!([[], [], ["x"]]));
    }

    #[test]
    fn test_subflow_ports_import() {
        let flow = FlowBuilder::new()
            .subflow("sf1", "Doubler")
            .subflow_input((40.0, 40.0))
            .subflow_output((300.0, 40.0))
            .node("f1", "function", (150.0, 40.0))
            .input_wire("f1")
            .output_wire(0, "f1", 0)
            .tab("t1", "Flow 1")
            .node("i1", "subflow:sf1", (100.0, 100.0))
            .config("b1", "mqtt-broker")
            .with_property("broker", json!("localhost"))
            .build_value();

        assert_eq!(flow[0]["in"][0]["wires"], json!([{"id": "f1"}]));
        assert_eq!(flow[0]["out"][0]["wires"], json!([{"id": "f1", "port": 0}]));

        let mut doc = test_document();
        let result = doc.import_value(flow, ImportOptions::default()).unwrap();
        assert_eq!(result.subflows, vec!["sf1"]);
        let sf = doc.subflow("sf1").unwrap();
        let input = sf.in_ports[0].id.clone();
        assert!(doc.links().any(|l| *l == Link::new(input.clone(), 0, "f1")));
        assert_eq!(doc.get_node("i1").unwrap().outputs, 1);
        assert!(doc.is_config_node("b1"));
    }
}
