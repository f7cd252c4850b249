//! Validation for flow documents
//!
//! Two layers:
//! - [`NodeValidator`] is the per-node collaborator run after import remapping;
//!   it decides the node's `valid` flag.
//! - [`validate_document`] checks the structural invariants of the whole
//!   document and returns every violation found.

use std::collections::HashSet;

use serde_json::Value;

use crate::document::FlowDocument;
use crate::types::{Node, Subflow};

/// Validation error with location context
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// A link endpoint does not resolve to a node, junction or port
    DanglingLinkEndpoint {
        source: String,
        target: String,
        missing: String,
    },
    /// A link joins entities on different workspaces
    CrossWorkspaceLink { source: String, target: String },
    /// A config node lists a user that no longer exists
    DanglingUser { config_id: String, user_id: String },
    /// A config node lists a user that does not reference it
    StaleUser { config_id: String, user_id: String },
    /// Two entities share an id
    DuplicateId { id: String },
    /// A subflow contains an instance of itself
    SubflowSelfContainment { subflow_id: String },
    /// A node's `z` names neither a workspace nor a subflow
    UnknownOwner { node_id: String, z: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DanglingLinkEndpoint {
                source,
                target,
                missing,
            } => write!(
                f,
                "Link '{}' -> '{}' references unknown entity '{}'",
                source, target, missing
            ),
            Self::CrossWorkspaceLink { source, target } => {
                write!(f, "Link '{}' -> '{}' crosses workspaces", source, target)
            }
            Self::DanglingUser { config_id, user_id } => write!(
                f,
                "Config node '{}' lists unknown user '{}'",
                config_id, user_id
            ),
            Self::StaleUser { config_id, user_id } => write!(
                f,
                "Config node '{}' lists user '{}' that does not reference it",
                config_id, user_id
            ),
            Self::DuplicateId { id } => write!(f, "Id '{}' is used more than once", id),
            Self::SubflowSelfContainment { subflow_id } => {
                write!(f, "Subflow '{}' contains an instance of itself", subflow_id)
            }
            Self::UnknownOwner { node_id, z } => {
                write!(f, "Node '{}' is on unknown workspace '{}'", node_id, z)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Decides whether a node is valid once it is fully wired
pub trait NodeValidator: Send + Sync {
    fn validate_node(&self, doc: &FlowDocument, node: &Node) -> bool;

    fn validate_subflow(&self, _doc: &FlowDocument, _subflow: &Subflow) -> bool {
        true
    }
}

/// Default validator
///
/// A node is invalid if its type is unknown, a `required` property is
/// empty, or a config reference does not resolve to a config node.
pub struct RequiredPropertyValidator;

impl NodeValidator for RequiredPropertyValidator {
    fn validate_node(&self, doc: &FlowDocument, node: &Node) -> bool {
        let Some(def) = doc.type_definition(node) else {
            return false;
        };
        def.defaults.iter().all(|(name, prop)| {
            let value = node.property(name);
            if prop.required && is_empty(value) {
                return false;
            }
            match (&prop.config_type, value.and_then(|v| v.as_str())) {
                (Some(config_type), Some(id)) if !id.is_empty() => {
                    let is_config_type = doc
                        .registry()
                        .get_node_type(config_type)
                        .map_or(false, |d| d.is_config());
                    !is_config_type || doc.is_config_node(id)
                }
                _ => true,
            }
        })
    }
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        _ => false,
    }
}

impl FlowDocument {
    /// Run the validation collaborator on a node and store the result
    pub fn validate_node(&mut self, id: &str) -> bool {
        let validator = self.validator();
        let Some(valid) = self.get_node(id).map(|n| validator.validate_node(self, n)) else {
            return false;
        };
        if let Some(node) = self.get_node_mut(id) {
            node.valid = valid;
        }
        valid
    }

    /// Run the validation collaborator on a subflow template and store the result
    pub fn validate_subflow(&mut self, id: &str) -> bool {
        let validator = self.validator();
        let Some(valid) = self
            .subflow(id)
            .map(|sf| validator.validate_subflow(self, sf))
        else {
            return false;
        };
        if let Some(subflow) = self.subflow_mut(id) {
            subflow.valid = valid;
        }
        valid
    }
}

/// Check every structural invariant of a document
///
/// Returns all violations found (not just the first).
pub fn validate_document(doc: &FlowDocument) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    validate_links(doc, &mut errors);
    validate_users(doc, &mut errors);
    validate_unique_ids(doc, &mut errors);
    validate_owners(doc, &mut errors);

    for subflow in doc.subflows() {
        if doc.subflow_contains(&subflow.id, &subflow.id) {
            errors.push(ValidationError::SubflowSelfContainment {
                subflow_id: subflow.id.clone(),
            });
        }
    }

    errors
}

fn validate_links(doc: &FlowDocument, errors: &mut Vec<ValidationError>) {
    for link in doc.links() {
        let source = doc.endpoint(&link.source);
        let target = doc.endpoint(&link.target);
        match (source, target) {
            (Some(source), Some(target)) => {
                if source.z() != target.z() {
                    errors.push(ValidationError::CrossWorkspaceLink {
                        source: link.source.clone(),
                        target: link.target.clone(),
                    });
                }
            }
            (None, _) | (_, None) => {
                let missing = if source.is_none() {
                    &link.source
                } else {
                    &link.target
                };
                errors.push(ValidationError::DanglingLinkEndpoint {
                    source: link.source.clone(),
                    target: link.target.clone(),
                    missing: missing.clone(),
                });
            }
        }
    }
}

fn validate_users(doc: &FlowDocument, errors: &mut Vec<ValidationError>) {
    for config in doc.config_nodes() {
        for user in &config.users {
            let Some(node) = doc.get_node(user) else {
                errors.push(ValidationError::DanglingUser {
                    config_id: config.id.clone(),
                    user_id: user.clone(),
                });
                continue;
            };
            if doc.type_definition(node).is_some()
                && !doc
                    .config_references(node)
                    .iter()
                    .any(|(_, id)| *id == config.id)
            {
                errors.push(ValidationError::StaleUser {
                    config_id: config.id.clone(),
                    user_id: user.clone(),
                });
            }
        }
    }
}

fn validate_unique_ids(doc: &FlowDocument, errors: &mut Vec<ValidationError>) {
    let ids = doc
        .workspaces()
        .map(|w| &w.id)
        .chain(doc.subflows().map(|s| &s.id))
        .chain(doc.subflows().flat_map(|s| s.ports().map(|p| &p.id)))
        .chain(doc.nodes().map(|n| &n.id))
        .chain(doc.config_nodes().map(|n| &n.id))
        .chain(doc.groups().map(|g| &g.id))
        .chain(doc.junctions().map(|j| &j.id));

    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    for id in ids {
        if !seen.insert(id) && reported.insert(id) {
            errors.push(ValidationError::DuplicateId { id: id.clone() });
        }
    }
}

fn validate_owners(doc: &FlowDocument, errors: &mut Vec<ValidationError>) {
    for node in doc.nodes().chain(doc.config_nodes()) {
        if let Some(z) = &node.z {
            if doc.workspace(z).is_none() && doc.subflow(z).is_none() {
                errors.push(ValidationError::UnknownOwner {
                    node_id: node.id.clone(),
                    z: z.clone(),
                });
            }
        }
    }
}
