//! Subflow structural operations
//!
//! Port editing, template creation, converting a selection into a subflow and
//! deleting a subflow with everything that depends on it. Every operation
//! returns a change description holding what an undo entry needs.

use std::collections::HashSet;

use serde_json::Value;

use crate::document::{FlowDocument, RemovedEntities};
use crate::error::{FlowGraphError, Result};
use crate::events::FlowEvent;
use crate::types::{
    new_id, subflow_instance_type, Link, Node, NodeId, PortRole, Subflow, SubflowPort,
};

/// Base position of the first input port
const PORT_ORIGIN: (f64, f64) = (50.0, 30.0);
/// Horizontal offset of output ports from the input column
const OUTPUT_COLUMN_OFFSET: f64 = 110.0;
/// Gap between a converted selection and the ports wired to it
const PORT_GAP: f64 = 80.0;
/// Margin kept between the subflow origin and converted nodes
const CONVERT_MARGIN: (f64, f64) = (140.0, 60.0);

/// `changed` flag of a subflow instance before an edit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceState {
    pub id: NodeId,
    pub changed: bool,
}

/// Result of a port edit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubflowChange {
    pub subflow_id: NodeId,
    pub added_ports: Vec<SubflowPort>,
    pub removed_ports: Vec<SubflowPort>,
    pub removed_links: Vec<Link>,
    /// Instance links whose source port was shifted down, as they were before
    pub shifted_links: Vec<Link>,
    pub previous_inputs: usize,
    pub previous_outputs: usize,
    /// Subflow `changed` flag before the edit
    pub was_changed: bool,
    pub instances: Vec<InstanceState>,
}

/// Result of converting a selection into a subflow
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertResult {
    pub subflow_id: NodeId,
    pub instance_id: NodeId,
    pub added_links: Vec<Link>,
    pub removed_links: Vec<Link>,
    /// Nodes moved into the subflow
    pub moved_nodes: Vec<NodeId>,
}

/// Operations on subflow templates
pub struct SubflowOperations;

impl SubflowOperations {
    // =========================================================================
    // Templates
    // =========================================================================

    /// Add an empty template named `"<prefix> N"`
    pub fn create_subflow(doc: &mut FlowDocument) -> NodeId {
        let id = new_id();
        let name = Self::next_subflow_name(doc);
        doc.add_subflow(Subflow::new(id.clone(), name), false);
        id
    }

    /// `"<prefix> N"` with N one past the highest existing number
    pub fn next_subflow_name(doc: &FlowDocument) -> String {
        let prefix = &doc.settings().subflow_name_prefix;
        let last = doc
            .subflows()
            .filter_map(|sf| {
                sf.name
                    .strip_prefix(prefix.as_str())?
                    .strip_prefix(' ')?
                    .parse::<usize>()
                    .ok()
            })
            .max()
            .unwrap_or(0);
        format!("{} {}", prefix, last + 1)
    }

    /// Propagate port counts to every instance and to the instance type
    ///
    /// Returns each instance's `changed` flag from before the refresh.
    pub fn refresh_instances(
        doc: &mut FlowDocument,
        subflow_id: &str,
        mark_changed: bool,
    ) -> Vec<InstanceState> {
        let Some((inputs, outputs)) = doc
            .subflow(subflow_id)
            .map(|sf| (sf.in_ports.len(), sf.out_ports.len()))
        else {
            return Vec::new();
        };
        let instance_type = subflow_instance_type(subflow_id);
        if let Some(def) = doc.registry_mut().get_node_type_mut(&instance_type) {
            def.inputs = inputs;
            def.outputs = outputs;
        }

        let mut states = Vec::new();
        for node in doc.nodes.iter_mut().filter(|n| n.node_type == instance_type) {
            states.push(InstanceState {
                id: node.id.clone(),
                changed: node.changed,
            });
            if mark_changed {
                node.changed = true;
            }
            node.inputs = inputs;
            node.outputs = outputs;
            node.ports = (0..outputs).collect();
            node.dirty = true;
        }

        doc.validate_subflow(subflow_id);
        doc.emit(FlowEvent::SubflowChanged {
            subflow_id: subflow_id.to_string(),
        });
        states
    }

    fn begin_change(doc: &mut FlowDocument, subflow_id: &str) -> Result<SubflowChange> {
        let subflow = doc
            .subflow_mut(subflow_id)
            .ok_or_else(|| FlowGraphError::not_found("Subflow", subflow_id))?;
        let change = SubflowChange {
            subflow_id: subflow_id.to_string(),
            previous_inputs: subflow.in_ports.len(),
            previous_outputs: subflow.out_ports.len(),
            was_changed: subflow.changed,
            ..SubflowChange::default()
        };
        subflow.changed = true;
        subflow.dirty = true;
        Ok(change)
    }

    fn finish_change(doc: &mut FlowDocument, mut change: SubflowChange) -> SubflowChange {
        change.instances = Self::refresh_instances(doc, &change.subflow_id, true);
        doc.set_dirty(true);
        change
    }

    /// First free port slot, scanning right by `port_spacing`
    fn available_port_position(subflow: &Subflow, is_input: bool, spacing: f64) -> (f64, f64) {
        let (mut x, y) = PORT_ORIGIN;
        if !is_input {
            x += OUTPUT_COLUMN_OFFSET;
        }
        while subflow
            .out_ports
            .iter()
            .chain(subflow.in_ports.iter())
            .any(|p| p.x == x && p.y == y)
        {
            x += spacing;
        }
        (x, y)
    }

    /// Remove links matching `predicate`, returning them
    fn take_links(doc: &mut FlowDocument, predicate: impl Fn(&Link) -> bool) -> Vec<Link> {
        let (removed, kept): (Vec<Link>, Vec<Link>) = std::mem::take(&mut doc.links)
            .into_iter()
            .partition(|l| predicate(l));
        doc.links = kept;
        removed
    }

    fn instance_ids(doc: &FlowDocument, subflow_id: &str) -> HashSet<NodeId> {
        doc.subflow_instances(subflow_id)
            .into_iter()
            .map(|n| n.id.clone())
            .collect()
    }

    // =========================================================================
    // Ports
    // =========================================================================

    /// Add the input port; a subflow has at most one
    pub fn add_input(doc: &mut FlowDocument, subflow_id: &str) -> Result<SubflowChange> {
        if doc.subflow(subflow_id).map_or(false, |sf| !sf.in_ports.is_empty()) {
            return Err(FlowGraphError::InvalidOperation(format!(
                "Subflow '{}' already has an input",
                subflow_id
            )));
        }
        let mut change = Self::begin_change(doc, subflow_id)?;
        let spacing = doc.settings().port_spacing;
        if let Some(subflow) = doc.subflow_mut(subflow_id) {
            let position = Self::available_port_position(subflow, true, spacing);
            let port = SubflowPort::new(new_id(), PortRole::Input, 0, subflow_id, position);
            subflow.in_ports.push(port.clone());
            change.added_ports.push(port);
        }
        Ok(Self::finish_change(doc, change))
    }

    /// Remove the input port with its links and every link into an instance
    pub fn remove_input(doc: &mut FlowDocument, subflow_id: &str) -> Result<SubflowChange> {
        let mut change = Self::begin_change(doc, subflow_id)?;
        let removed: Vec<SubflowPort> = doc
            .subflow_mut(subflow_id)
            .map(|sf| std::mem::take(&mut sf.in_ports))
            .unwrap_or_default();
        if removed.is_empty() {
            return Ok(Self::finish_change(doc, change));
        }

        let instances = Self::instance_ids(doc, subflow_id);
        let port_ids: HashSet<&str> = removed.iter().map(|p| p.id.as_str()).collect();
        change.removed_links = Self::take_links(doc, |l| {
            port_ids.contains(l.source.as_str()) || instances.contains(&l.target)
        });
        change.removed_ports = removed;
        Ok(Self::finish_change(doc, change))
    }

    /// Append an output port
    pub fn add_output(doc: &mut FlowDocument, subflow_id: &str) -> Result<SubflowChange> {
        let mut change = Self::begin_change(doc, subflow_id)?;
        let spacing = doc.settings().port_spacing;
        if let Some(subflow) = doc.subflow_mut(subflow_id) {
            let position = Self::available_port_position(subflow, false, spacing);
            let index = subflow.out_ports.len();
            let port = SubflowPort::new(new_id(), PortRole::Output, index, subflow_id, position);
            subflow.out_ports.push(port.clone());
            change.added_ports.push(port);
        }
        Ok(Self::finish_change(doc, change))
    }

    /// Remove output port `index` (the last one when `None`)
    ///
    /// Links into the port and instance links leaving that output are removed;
    /// instance links from higher outputs shift down by one so port indices
    /// stay contiguous.
    pub fn remove_output(
        doc: &mut FlowDocument,
        subflow_id: &str,
        index: Option<usize>,
    ) -> Result<SubflowChange> {
        let count = doc
            .subflow(subflow_id)
            .ok_or_else(|| FlowGraphError::not_found("Subflow", subflow_id))?
            .out_ports
            .len();
        let index = match index {
            Some(index) if index < count => index,
            Some(index) => {
                return Err(FlowGraphError::InvalidOperation(format!(
                    "Subflow '{}' has no output {}",
                    subflow_id, index
                )))
            }
            None if count == 0 => {
                return Err(FlowGraphError::InvalidOperation(format!(
                    "Subflow '{}' has no outputs",
                    subflow_id
                )))
            }
            None => count - 1,
        };

        let mut change = Self::begin_change(doc, subflow_id)?;
        let Some(port) = doc.subflow_mut(subflow_id).map(|sf| {
            let port = sf.out_ports.remove(index);
            for (i, remaining) in sf.out_ports.iter_mut().enumerate() {
                remaining.index = i;
            }
            port
        }) else {
            return Ok(change);
        };

        let instances = Self::instance_ids(doc, subflow_id);
        change.removed_links = Self::take_links(doc, |l| {
            l.target == port.id || (instances.contains(&l.source) && l.source_port == index)
        });
        for link in doc.links.iter_mut() {
            if instances.contains(&link.source) && link.source_port > index {
                change.shifted_links.push(link.clone());
                link.source_port -= 1;
            }
        }
        log::debug!(
            "Removed output {} of subflow '{}', shifted {} links",
            index,
            subflow_id,
            change.shifted_links.len()
        );
        change.removed_ports.push(port);
        Ok(Self::finish_change(doc, change))
    }

    /// Add the status port; a subflow has at most one
    pub fn add_status(doc: &mut FlowDocument, subflow_id: &str) -> Result<SubflowChange> {
        if doc.subflow(subflow_id).map_or(false, |sf| sf.status_port.is_some()) {
            return Err(FlowGraphError::InvalidOperation(format!(
                "Subflow '{}' already has a status output",
                subflow_id
            )));
        }
        let mut change = Self::begin_change(doc, subflow_id)?;
        if let Some(subflow) = doc.subflow_mut(subflow_id) {
            let (x, y) = PORT_ORIGIN;
            let bottom = subflow
                .ports()
                .map(|p| p.y)
                .fold(y, f64::max);
            let port = SubflowPort::new(
                new_id(),
                PortRole::Status,
                0,
                subflow_id,
                (x + OUTPUT_COLUMN_OFFSET, bottom + PORT_ORIGIN.1),
            );
            subflow.status_port = Some(port.clone());
            change.added_ports.push(port);
        }
        Ok(Self::finish_change(doc, change))
    }

    pub fn remove_status(doc: &mut FlowDocument, subflow_id: &str) -> Result<SubflowChange> {
        let mut change = Self::begin_change(doc, subflow_id)?;
        let Some(port) = doc.subflow_mut(subflow_id).and_then(|sf| sf.status_port.take()) else {
            return Ok(Self::finish_change(doc, change));
        };
        change.removed_links = Self::take_links(doc, |l| l.target == port.id);
        change.removed_ports.push(port);
        Ok(Self::finish_change(doc, change))
    }

    // =========================================================================
    // Conversion
    // =========================================================================

    /// Move a selection of nodes into a new subflow
    ///
    /// Links inside the selection are kept. Links entering it become the
    /// subflow input (only one source node may feed the selection). Links
    /// leaving it become outputs, one per distinct `(source, port)`, ordered
    /// by the source node's `y`. An instance of the new subflow takes the
    /// selection's place.
    pub fn convert_to_subflow(doc: &mut FlowDocument, ids: &[NodeId]) -> Result<ConvertResult> {
        let selected: Vec<Node> = ids
            .iter()
            .filter_map(|id| doc.nodes().find(|n| &n.id == id))
            .cloned()
            .collect();
        let Some(first) = selected.first() else {
            return Err(FlowGraphError::EmptySelection);
        };
        let z = first.z.clone();
        let selection: HashSet<&str> = selected.iter().map(|n| n.id.as_str()).collect();

        let mut inbound = Vec::new();
        let mut input_nodes: Vec<NodeId> = Vec::new();
        let mut outputs: Vec<(NodeId, usize, Vec<NodeId>)> = Vec::new();
        let mut removed_links = Vec::new();
        for link in doc.links() {
            let source_in = selection.contains(link.source.as_str());
            let target_in = selection.contains(link.target.as_str());
            if source_in && !target_in {
                match outputs
                    .iter_mut()
                    .find(|(s, p, _)| *s == link.source && *p == link.source_port)
                {
                    Some((_, _, targets)) => targets.push(link.target.clone()),
                    None => outputs.push((
                        link.source.clone(),
                        link.source_port,
                        vec![link.target.clone()],
                    )),
                }
                removed_links.push(link.clone());
            } else if !source_in && target_in {
                if !input_nodes.contains(&link.target) {
                    input_nodes.push(link.target.clone());
                }
                inbound.push(link.clone());
                removed_links.push(link.clone());
            }
        }
        if input_nodes.len() > 1 {
            return Err(FlowGraphError::MultipleInputs);
        }

        let node_y = |id: &str| selected.iter().find(|n| n.id == id).map_or(0.0, |n| n.y);
        outputs.sort_by(|a, b| node_y(a.0.as_str()).total_cmp(&node_y(b.0.as_str())));

        let settings = doc.settings().clone();
        let (half_w, half_h) = (settings.node_width / 2.0, settings.node_height / 2.0);
        let (mut min_x, mut min_y) = (f64::MAX, f64::MAX);
        let (mut max_x, mut max_y) = (f64::MIN, f64::MIN);
        for node in &selected {
            min_x = min_x.min(node.x - half_w);
            min_y = min_y.min(node.y - half_h);
            max_x = max_x.max(node.x + half_w);
            max_y = max_y.max(node.y + half_h);
        }
        let center = ((min_x + max_x) / 2.0, (min_y + max_y) / 2.0);
        let offset = (
            settings.snap(min_x - CONVERT_MARGIN.0),
            settings.snap(min_y - CONVERT_MARGIN.1),
        );

        let subflow_id = new_id();
        let mut subflow = Subflow::new(subflow_id.clone(), Self::next_subflow_name(doc));
        let position_of = |id: &str| selected.iter().find(|n| n.id == id).map(|n| (n.x, n.y));
        subflow.in_ports = input_nodes
            .iter()
            .filter_map(|id| position_of(id.as_str()))
            .map(|(x, y)| {
                SubflowPort::new(
                    new_id(),
                    PortRole::Input,
                    0,
                    subflow_id.clone(),
                    (x - half_w - PORT_GAP - offset.0, y - offset.1),
                )
            })
            .collect();
        subflow.out_ports = outputs
            .iter()
            .enumerate()
            .map(|(i, (source, _, _))| {
                let (x, y) = position_of(source.as_str()).unwrap_or(center);
                SubflowPort::new(
                    new_id(),
                    PortRole::Output,
                    i,
                    subflow_id.clone(),
                    (x + half_w + PORT_GAP - offset.0, y - offset.1),
                )
            })
            .collect();
        let in_port = subflow.in_ports.first().map(|p| p.id.clone());
        let out_ports: Vec<NodeId> = subflow.out_ports.iter().map(|p| p.id.clone()).collect();
        let (inputs, output_count) = (subflow.in_ports.len(), subflow.out_ports.len());
        doc.add_subflow(subflow, false);

        let instance_id = new_id();
        let mut instance = Node::new(instance_id.clone(), subflow_instance_type(&subflow_id))
            .at(settings.snap(center.0), settings.snap(center.1))
            .with_outputs(output_count)
            .with_property("name", Value::String(String::new()));
        instance.z = z;
        instance.inputs = inputs;
        instance.changed = true;
        doc.add_node(instance)?;

        for link in &removed_links {
            doc.remove_link(link);
        }

        let mut added_links = Vec::new();
        for link in &inbound {
            added_links.push(Link::new(
                link.source.clone(),
                link.source_port,
                instance_id.clone(),
            ));
        }
        for (i, (source, port, targets)) in outputs.iter().enumerate() {
            for target in targets {
                added_links.push(Link::new(instance_id.clone(), i, target.clone()));
            }
            added_links.push(Link::new(source.clone(), *port, out_ports[i].clone()));
        }
        if let (Some(port), Some(target)) = (&in_port, input_nodes.first()) {
            added_links.push(Link::new(port.clone(), 0, target.clone()));
        }
        for link in &added_links {
            doc.add_link(link.clone());
        }

        let moved_nodes: Vec<NodeId> = selected.iter().map(|n| n.id.clone()).collect();
        for node in &selected {
            doc.move_node_to(&node.id, &subflow_id);
            if let Some(moved) = doc.get_node_mut(&node.id) {
                moved.x -= offset.0;
                moved.y -= offset.1;
            }
            if let Some(group_id) = &node.group {
                if let Some(group) = doc.groups.get_mut(group_id) {
                    group.nodes.retain(|m| m != &node.id);
                }
                if let Some(moved) = doc.get_node_mut(&node.id) {
                    moved.group = None;
                }
            }
        }
        Self::cut_link_node_references(doc, &selection);

        doc.validate_subflow(&subflow_id);
        doc.validate_node(&instance_id);
        doc.set_dirty(true);
        log::debug!(
            "Converted {} nodes into subflow '{}'",
            moved_nodes.len(),
            subflow_id
        );

        Ok(ConvertResult {
            subflow_id,
            instance_id,
            added_links,
            removed_links,
            moved_nodes,
        })
    }

    /// Drop `link in`/`link out` references crossing the selection boundary
    fn cut_link_node_references(doc: &mut FlowDocument, selection: &HashSet<&str>) {
        for node in doc.nodes.iter_mut() {
            if node.node_type != "link in" && node.node_type != "link out" {
                continue;
            }
            let inside = selection.contains(node.id.as_str());
            if let Some(Value::Array(links)) = node.properties.get_mut("links") {
                links.retain(|target| {
                    target
                        .as_str()
                        .map_or(true, |t| selection.contains(t) == inside)
                });
            }
        }
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Delete a subflow, its instances and everything it owns
    ///
    /// Refused if any instance lives on a locked workspace.
    pub fn delete_subflow(doc: &mut FlowDocument, subflow_id: &str) -> Result<RemovedEntities> {
        let port_ids: Vec<NodeId> = doc
            .subflow(subflow_id)
            .ok_or_else(|| FlowGraphError::not_found("Subflow", subflow_id))?
            .ports()
            .map(|p| p.id.clone())
            .collect();

        let instances: Vec<Node> = doc
            .subflow_instances(subflow_id)
            .into_iter()
            .cloned()
            .collect();
        if let Some(locked) = instances
            .iter()
            .filter_map(|n| n.z.as_deref())
            .find(|z| doc.workspace(z).map_or(false, |w| w.locked))
        {
            return Err(FlowGraphError::Locked(locked.to_string()));
        }

        let mut removed = RemovedEntities::default();
        for instance in instances {
            removed.merge(doc.remove_node(&instance.id));
            removed.nodes.push(instance);
        }
        removed.merge(doc.remove_z_contents(subflow_id));
        removed
            .links
            .extend(Self::take_links(doc, |l| port_ids.iter().any(|p| l.touches(p))));
        if let Some(subflow) = doc.remove_subflow(subflow_id) {
            removed.subflows.push(subflow);
        }
        log::debug!(
            "Deleted subflow '{}' with {} nodes",
            subflow_id,
            removed.nodes.len()
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_document;
    use crate::types::{Group, Workspace};

    fn doc_with_subflow() -> FlowDocument {
        let mut doc = test_document();
        doc.add_workspace(Workspace::new("t1", "Flow 1")).unwrap();
        doc.add_subflow(Subflow::new("sf1", "SF"), false);
        doc
    }

    #[test]
    fn test_create_subflow_numbers_names() {
        let mut doc = test_document();
        let a = SubflowOperations::create_subflow(&mut doc);
        let b = SubflowOperations::create_subflow(&mut doc);
        assert_eq!(doc.subflow(&a).unwrap().name, "Subflow 1");
        assert_eq!(doc.subflow(&b).unwrap().name, "Subflow 2");

        doc.subflow_mut(&a).unwrap().name = "Subflow 7".into();
        assert_eq!(SubflowOperations::next_subflow_name(&doc), "Subflow 8");
    }

    #[test]
    fn test_single_input_port() {
        let mut doc = doc_with_subflow();
        let change = SubflowOperations::add_input(&mut doc, "sf1").unwrap();
        assert_eq!(change.previous_inputs, 0);
        assert_eq!(change.added_ports[0].x, 50.0);

        let err = SubflowOperations::add_input(&mut doc, "sf1").unwrap_err();
        assert!(matches!(err, FlowGraphError::InvalidOperation(_)));
        assert!(SubflowOperations::add_input(&mut doc, "nope").is_err());
    }

    #[test]
    fn test_port_placement_avoids_collisions() {
        let mut doc = doc_with_subflow();
        SubflowOperations::add_output(&mut doc, "sf1").unwrap();
        SubflowOperations::add_output(&mut doc, "sf1").unwrap();
        let sf = doc.subflow("sf1").unwrap();
        assert_eq!((sf.out_ports[0].x, sf.out_ports[0].y), (160.0, 30.0));
        assert_eq!((sf.out_ports[1].x, sf.out_ports[1].y), (215.0, 30.0));
    }

    #[test]
    fn test_instances_refreshed() {
        let mut doc = doc_with_subflow();
        doc.add_node(Node::new("i1", "subflow:sf1").on("t1")).unwrap();

        let change = SubflowOperations::add_output(&mut doc, "sf1").unwrap();
        assert_eq!(
            change.instances,
            vec![InstanceState {
                id: "i1".into(),
                changed: false
            }]
        );
        let instance = doc.get_node("i1").unwrap();
        assert_eq!(instance.outputs, 1);
        assert_eq!(instance.ports, vec![0]);
        assert!(instance.changed);
        assert_eq!(doc.registry().get_node_type("subflow:sf1").unwrap().outputs, 1);
        assert!(doc.subflow("sf1").unwrap().changed);
    }

    #[test]
    fn test_remove_output_reindexes_ports_and_links() {
        let mut doc = doc_with_subflow();
        for _ in 0..3 {
            SubflowOperations::add_output(&mut doc, "sf1").unwrap();
        }
        doc.add_node(Node::new("i1", "subflow:sf1").on("t1")).unwrap();
        doc.add_node(Node::new("d1", "debug").on("t1")).unwrap();
        doc.add_node(Node::new("d0", "debug").on("t1")).unwrap();
        doc.add_link(Link::new("i1", 1, "d1"));
        doc.add_link(Link::new("i1", 0, "d0"));

        let change = SubflowOperations::remove_output(&mut doc, "sf1", Some(0)).unwrap();

        let sf = doc.subflow("sf1").unwrap();
        let indices: Vec<_> = sf.out_ports.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(change.removed_links, vec![Link::new("i1", 0, "d0")]);
        assert_eq!(change.shifted_links, vec![Link::new("i1", 1, "d1")]);
        assert!(doc.links().any(|l| *l == Link::new("i1", 0, "d1")));
        assert_eq!(doc.get_node("i1").unwrap().outputs, 2);
    }

    #[test]
    fn test_remove_input_drops_instance_links() {
        let mut doc = doc_with_subflow();
        SubflowOperations::add_input(&mut doc, "sf1").unwrap();
        let port = doc.subflow("sf1").unwrap().in_ports[0].id.clone();
        doc.add_node(Node::new("f1", "function").on("sf1").with_outputs(1))
            .unwrap();
        doc.add_node(Node::new("n1", "inject").on("t1").with_outputs(1))
            .unwrap();
        doc.add_node(Node::new("i1", "subflow:sf1").on("t1")).unwrap();
        doc.add_link(Link::new(port.clone(), 0, "f1"));
        doc.add_link(Link::new("n1", 0, "i1"));

        let change = SubflowOperations::remove_input(&mut doc, "sf1").unwrap();
        assert_eq!(change.removed_links.len(), 2);
        assert_eq!(doc.links().count(), 0);
        assert_eq!(doc.get_node("i1").unwrap().inputs, 0);
    }

    #[test]
    fn test_status_port() {
        let mut doc = doc_with_subflow();
        SubflowOperations::add_status(&mut doc, "sf1").unwrap();
        assert!(SubflowOperations::add_status(&mut doc, "sf1").is_err());
        let port = doc.subflow("sf1").unwrap().status_port.clone().unwrap();
        doc.add_node(Node::new("f1", "function").on("sf1").with_outputs(1))
            .unwrap();
        doc.add_link(Link::new("f1", 0, port.id.clone()));

        let change = SubflowOperations::remove_status(&mut doc, "sf1").unwrap();
        assert_eq!(change.removed_ports, vec![port]);
        assert_eq!(change.removed_links.len(), 1);
        assert!(doc.subflow("sf1").unwrap().status_port.is_none());
    }

    fn selection_flow() -> FlowDocument {
        let mut doc = test_document();
        doc.add_workspace(Workspace::new("t1", "Flow 1")).unwrap();
        doc.add_node(Node::new("src", "inject").on("t1").at(100.0, 100.0).with_outputs(1))
            .unwrap();
        doc.add_node(Node::new("a", "function").on("t1").at(300.0, 100.0).with_outputs(1))
            .unwrap();
        doc.add_node(Node::new("b", "function").on("t1").at(500.0, 100.0).with_outputs(1))
            .unwrap();
        doc.add_node(Node::new("out1", "debug").on("t1").at(700.0, 60.0))
            .unwrap();
        doc.add_node(Node::new("out2", "debug").on("t1").at(700.0, 140.0))
            .unwrap();
        doc.add_link(Link::new("src", 0, "a"));
        doc.add_link(Link::new("a", 0, "b"));
        doc.add_link(Link::new("b", 0, "out1"));
        doc.add_link(Link::new("b", 0, "out2"));
        doc
    }

    #[test]
    fn test_convert_to_subflow() {
        let mut doc = selection_flow();
        let result =
            SubflowOperations::convert_to_subflow(&mut doc, &["a".into(), "b".into()]).unwrap();

        let sf = doc.subflow(&result.subflow_id).unwrap().clone();
        assert_eq!(sf.name, "Subflow 1");
        assert_eq!(sf.in_ports.len(), 1);
        // Two wires from the same output share one port
        assert_eq!(sf.out_ports.len(), 1);
        assert_eq!(result.removed_links.len(), 3);

        let instance = doc.get_node(&result.instance_id).unwrap();
        assert!(instance.is_on("t1"));
        assert_eq!((instance.x, instance.y), (400.0, 100.0));
        assert_eq!(instance.outputs, 1);

        let expected = [
            Link::new("src", 0, result.instance_id.clone()),
            Link::new(result.instance_id.clone(), 0, "out1"),
            Link::new(result.instance_id.clone(), 0, "out2"),
            Link::new(sf.in_ports[0].id.clone(), 0, "a"),
            Link::new("a", 0, "b"),
            Link::new("b", 0, sf.out_ports[0].id.clone()),
        ];
        for link in &expected {
            assert!(doc.links().any(|l| l == link), "missing {:?}", link);
        }
        assert_eq!(doc.links().count(), expected.len());
        assert!(doc.get_node("a").unwrap().is_on(&result.subflow_id));
        assert!(crate::validation::validate_document(&doc).is_empty());
    }

    #[test]
    fn test_convert_rejects_multiple_inputs() {
        let mut doc = selection_flow();
        doc.add_node(Node::new("src2", "inject").on("t1").with_outputs(1))
            .unwrap();
        doc.add_link(Link::new("src2", 0, "b"));
        let before = doc.links().count();

        let err =
            SubflowOperations::convert_to_subflow(&mut doc, &["a".into(), "b".into()]).unwrap_err();
        assert!(matches!(err, FlowGraphError::MultipleInputs));
        assert_eq!(doc.links().count(), before);
        assert_eq!(doc.subflows().count(), 0);

        let err = SubflowOperations::convert_to_subflow(&mut doc, &[]).unwrap_err();
        assert!(matches!(err, FlowGraphError::EmptySelection));
    }

    #[test]
    fn test_outputs_ordered_by_source_y() {
        let mut doc = test_document();
        doc.add_workspace(Workspace::new("t1", "Flow 1")).unwrap();
        doc.add_node(Node::new("low", "function").on("t1").at(0.0, 200.0).with_outputs(1))
            .unwrap();
        doc.add_node(Node::new("high", "function").on("t1").at(0.0, 20.0).with_outputs(1))
            .unwrap();
        doc.add_node(Node::new("d", "debug").on("t1").at(300.0, 0.0))
            .unwrap();
        doc.add_link(Link::new("low", 0, "d"));
        doc.add_link(Link::new("high", 0, "d"));

        let result =
            SubflowOperations::convert_to_subflow(&mut doc, &["low".into(), "high".into()])
                .unwrap();
        let sf = doc.subflow(&result.subflow_id).unwrap();
        let first_port = sf.out_ports[0].id.clone();
        assert!(doc.links().any(|l| *l == Link::new("high", 0, first_port.clone())));
    }

    #[test]
    fn test_delete_subflow_cascades() {
        let mut doc = doc_with_subflow();
        SubflowOperations::add_input(&mut doc, "sf1").unwrap();
        let port = doc.subflow("sf1").unwrap().in_ports[0].id.clone();
        doc.add_node(Node::new("f1", "function").on("sf1").with_outputs(1))
            .unwrap();
        doc.add_node(Node::new("c1", "mqtt-broker").on("sf1")).unwrap();
        doc.add_link(Link::new(port, 0, "f1"));
        doc.add_node(Node::new("i1", "subflow:sf1").on("t1")).unwrap();
        doc.add_node(Node::new("n1", "inject").on("t1").with_outputs(1))
            .unwrap();
        doc.add_link(Link::new("n1", 0, "i1"));
        doc.add_group(Group {
            id: "g1".into(),
            z: Some("sf1".into()),
            nodes: vec!["f1".into()],
            ..Group::default()
        });

        let removed = SubflowOperations::delete_subflow(&mut doc, "sf1").unwrap();
        assert_eq!(removed.subflows.len(), 1);
        assert_eq!(removed.nodes.len(), 3);
        assert_eq!(removed.groups.len(), 1);
        assert_eq!(removed.links.len(), 2);
        assert_eq!(doc.links().count(), 0);
        assert!(doc.get_node("n1").is_some());
        assert!(!doc.registry().has_node_type("subflow:sf1"));
    }

    #[test]
    fn test_delete_subflow_refused_on_locked_workspace() {
        let mut doc = doc_with_subflow();
        doc.workspace_mut("t1").unwrap().locked = true;
        doc.add_node(Node::new("i1", "subflow:sf1").on("t1")).unwrap();

        let err = SubflowOperations::delete_subflow(&mut doc, "sf1").unwrap_err();
        assert!(matches!(err, FlowGraphError::Locked(ref z) if z == "t1"));
        assert!(doc.subflow("sf1").is_some());
        assert!(doc.get_node("i1").is_some());
    }
}
