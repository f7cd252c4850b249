//! Shared fixtures for unit tests

use std::sync::Arc;

use serde_json::json;

use crate::descriptor::{CredentialKind, TypeDefinition};
use crate::document::FlowDocument;
use crate::events::VecEventSink;
use crate::registry::{NodeSet, TypeRegistry};

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn types(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Registry with a small palette of core-like node types
pub(crate) fn test_registry() -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    registry.set_node_list(vec![
        NodeSet::new(
            "node-red",
            "common",
            types(&["inject", "debug", "link in", "link out", "catch"]),
        ),
        NodeSet::new("node-red", "function", types(&["function"])),
        NodeSet::new(
            "node-red",
            "network",
            types(&["mqtt-broker", "mqtt out", "tls-config", "http request"]),
        ),
        NodeSet::new("contrib-vault", "vault", types(&["vault-store", "vault read"])),
    ]);

    let definitions = vec![
        TypeDefinition::new("inject", "common")
            .with_outputs(1)
            .with_default("name", json!(""))
            .with_default("topic", json!(""))
            .with_default("payload", json!("")),
        TypeDefinition::new("debug", "common")
            .with_inputs(1)
            .with_default("name", json!(""))
            .with_default("active", json!(true)),
        TypeDefinition::new("function", "function")
            .with_inputs(1)
            .with_outputs(1)
            .with_default("name", json!(""))
            .with_default("func", json!("return msg;")),
        TypeDefinition::new("link in", "common")
            .with_outputs(1)
            .with_default("name", json!(""))
            .with_default("links", json!([])),
        TypeDefinition::new("link out", "common")
            .with_inputs(1)
            .with_default("name", json!(""))
            .with_default("links", json!([])),
        TypeDefinition::new("catch", "common")
            .with_outputs(1)
            .with_default("name", json!(""))
            .with_default("scope", json!(null)),
        TypeDefinition::config("mqtt-broker")
            .with_default("name", json!(""))
            .with_required("broker", json!(""))
            .with_default("port", json!(1883))
            .with_config_property("tls", "tls-config")
            .with_credential("user", CredentialKind::Text)
            .with_credential("password", CredentialKind::Password),
        TypeDefinition::new("mqtt out", "network")
            .with_inputs(1)
            .with_default("name", json!(""))
            .with_default("topic", json!(""))
            .with_config_property("broker", "mqtt-broker"),
        TypeDefinition::config("tls-config")
            .exclusive()
            .with_default("name", json!(""))
            .with_default("cert", json!("")),
        TypeDefinition::new("http request", "network")
            .with_inputs(1)
            .with_outputs(1)
            .with_default("name", json!(""))
            .with_default("url", json!(""))
            .with_config_property("tls", "tls-config"),
        TypeDefinition::config("vault-store")
            .not_exportable()
            .with_default("name", json!("")),
        TypeDefinition::new("vault read", "function")
            .with_inputs(1)
            .with_outputs(1)
            .with_default("name", json!(""))
            .with_config_property("store", "vault-store"),
    ];
    for definition in definitions {
        registry.register_node_type(definition);
    }
    registry
}

pub(crate) fn test_document() -> FlowDocument {
    init_logging();
    FlowDocument::new(test_registry())
}

pub(crate) fn document_with_events() -> (FlowDocument, Arc<VecEventSink>) {
    init_logging();
    let sink = Arc::new(VecEventSink::new());
    let doc = FlowDocument::new(test_registry()).with_event_sink(sink.clone());
    (doc, sink)
}
