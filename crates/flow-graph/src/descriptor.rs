//! Node type definitions
//!
//! A `TypeDefinition` is the schema the registry holds for one node type:
//! declared properties (`defaults`), category, credential shape and port counts.
//! Every structural operation consults it to decide which properties to copy,
//! which ones reference config nodes, and how a node is exported.
//!
//! # Example
//!
//! ```ignore
//! use flow_graph::{TypeDefinition, CredentialKind};
//!
//! let broker = TypeDefinition::config("mqtt-broker")
//!     .with_default("broker", json!(""))
//!     .with_credential("password", CredentialKind::Password);
//!
//! let mqtt_out = TypeDefinition::new("mqtt out", "network")
//!     .with_inputs(1)
//!     .with_default("topic", json!(""))
//!     .with_config_property("broker", "mqtt-broker");
//! ```

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Node;

/// Category marking config node types
pub const CONFIG_CATEGORY: &str = "config";

/// Category used by the synthetic subflow instance types
pub const SUBFLOWS_CATEGORY: &str = "subflows";

/// Translation namespace of the core module
pub const CORE_NAMESPACE: &str = "node-red";

/// A declared property of a node type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDefinition {
    /// Default value
    pub value: Value,
    /// Config node type this property references, if any
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub config_type: Option<String>,
    /// Whether an empty value makes the node invalid
    #[serde(default)]
    pub required: bool,
}

impl PropertyDefinition {
    /// Plain value property
    pub fn value(value: Value) -> Self {
        Self {
            value,
            config_type: None,
            required: false,
        }
    }

    /// Property holding the id of a config node of the given type
    pub fn config_ref(config_type: impl Into<String>) -> Self {
        Self {
            value: Value::String(String::new()),
            config_type: Some(config_type.into()),
            required: false,
        }
    }
}

/// Shape of a credential field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialKind {
    Text,
    Password,
}

/// Label of a node type
///
/// Subflow instance labels follow the template's current name, so they are
/// resolved against the document instead of being copied at registration.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeLabel {
    Static(String),
    SubflowName(String),
}

/// Hook invoked with the node being removed
#[derive(Clone)]
pub struct RemoveHook(Arc<dyn Fn(&Node) + Send + Sync>);

impl RemoveHook {
    pub fn new(hook: impl Fn(&Node) + Send + Sync + 'static) -> Self {
        Self(Arc::new(hook))
    }

    pub fn call(&self, node: &Node) {
        (self.0)(node)
    }
}

impl fmt::Debug for RemoveHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RemoveHook")
    }
}

/// Complete definition of a node type
#[derive(Debug, Clone)]
pub struct TypeDefinition {
    /// Type identifier (e.g., "inject", "subflow:abc")
    pub node_type: String,
    /// Palette category; `config` marks config node types
    pub category: String,
    /// Display label
    pub label: TypeLabel,
    /// Declared properties in declaration order
    pub defaults: IndexMap<String, PropertyDefinition>,
    /// Declared credential fields
    pub credentials: IndexMap<String, CredentialKind>,
    /// Default input count
    pub inputs: usize,
    /// Default output count
    pub outputs: usize,
    /// Config node dies with its last user
    pub exclusive: bool,
    /// `Some(false)` keeps this config type out of exported selections
    pub exportable: Option<bool>,
    /// Owning node set id, bound at registration
    pub set: Option<String>,
    /// Translation namespace, bound at registration
    pub namespace: Option<String>,
    /// Called when a node of this type is removed
    pub on_remove: Option<RemoveHook>,
}

impl TypeDefinition {
    /// Create a definition with no properties
    pub fn new(node_type: impl Into<String>, category: impl Into<String>) -> Self {
        let node_type = node_type.into();
        Self {
            label: TypeLabel::Static(node_type.clone()),
            node_type,
            category: category.into(),
            defaults: IndexMap::new(),
            credentials: IndexMap::new(),
            inputs: 0,
            outputs: 0,
            exclusive: false,
            exportable: None,
            set: None,
            namespace: None,
            on_remove: None,
        }
    }

    /// Create a config node definition
    pub fn config(node_type: impl Into<String>) -> Self {
        Self::new(node_type, CONFIG_CATEGORY)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = TypeLabel::Static(label.into());
        self
    }

    pub fn with_inputs(mut self, inputs: usize) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: usize) -> Self {
        self.outputs = outputs;
        self
    }

    /// Declare a plain property
    pub fn with_default(mut self, name: impl Into<String>, value: Value) -> Self {
        self.defaults
            .insert(name.into(), PropertyDefinition::value(value));
        self
    }

    /// Declare a property that must not be empty
    pub fn with_required(mut self, name: impl Into<String>, value: Value) -> Self {
        let mut prop = PropertyDefinition::value(value);
        prop.required = true;
        self.defaults.insert(name.into(), prop);
        self
    }

    /// Declare a property referencing a config node
    pub fn with_config_property(
        mut self,
        name: impl Into<String>,
        config_type: impl Into<String>,
    ) -> Self {
        self.defaults
            .insert(name.into(), PropertyDefinition::config_ref(config_type));
        self
    }

    /// Declare a credential field
    pub fn with_credential(mut self, name: impl Into<String>, kind: CredentialKind) -> Self {
        self.credentials.insert(name.into(), kind);
        self
    }

    /// Mark as exclusive (config nodes only)
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Keep this type out of exported selections
    pub fn not_exportable(mut self) -> Self {
        self.exportable = Some(false);
        self
    }

    pub fn with_on_remove(mut self, hook: impl Fn(&Node) + Send + Sync + 'static) -> Self {
        self.on_remove = Some(RemoveHook::new(hook));
        self
    }

    /// Whether nodes of this type are config nodes
    pub fn is_config(&self) -> bool {
        self.category == CONFIG_CATEGORY
    }

    /// Whether config nodes of this type travel with exported selections
    pub fn is_exportable(&self) -> bool {
        self.exportable != Some(false)
    }

    /// Declared properties that reference config nodes, with the referenced type
    pub fn config_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.defaults.iter().filter_map(|(name, prop)| {
            prop.config_type
                .as_deref()
                .map(|config_type| (name.as_str(), config_type))
        })
    }

    /// Namespace a translation key with the owning set's namespace
    ///
    /// Keys that already carry a namespace (`ns:key`) are returned unchanged.
    pub fn translate_key(&self, key: &str) -> String {
        match &self.namespace {
            Some(ns) if !key.contains(':') => format!("{}:{}", ns, key),
            _ => key.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_properties() {
        let def = TypeDefinition::new("mqtt out", "network")
            .with_default("topic", json!(""))
            .with_config_property("broker", "mqtt-broker");

        let refs: Vec<_> = def.config_properties().collect();
        assert_eq!(refs, vec![("broker", "mqtt-broker")]);
        assert!(!def.is_config());
    }

    #[test]
    fn test_defaults_keep_declaration_order() {
        let def = TypeDefinition::new("change", "function")
            .with_default("name", json!(""))
            .with_default("rules", json!([]))
            .with_default("action", json!(""));

        let keys: Vec<_> = def.defaults.keys().cloned().collect();
        assert_eq!(keys, vec!["name", "rules", "action"]);
    }

    #[test]
    fn test_exportable_flag() {
        assert!(TypeDefinition::config("tls").is_exportable());
        assert!(!TypeDefinition::config("global-config")
            .not_exportable()
            .is_exportable());
    }

    #[test]
    fn test_translate_key() {
        let mut def = TypeDefinition::new("inject", "common");
        assert_eq!(def.translate_key("label.name"), "label.name");

        def.namespace = Some(CORE_NAMESPACE.to_string());
        assert_eq!(def.translate_key("label.name"), "node-red:label.name");
        assert_eq!(def.translate_key("other:label"), "other:label");
    }

    #[test]
    fn test_property_definition_serialization() {
        let prop = PropertyDefinition::config_ref("mqtt-broker");
        let json = serde_json::to_value(&prop).unwrap();
        assert_eq!(json["type"], "mqtt-broker");
    }
}
