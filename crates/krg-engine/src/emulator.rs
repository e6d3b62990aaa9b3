//! Emulated instances for offline preview
//!
//! Builds an example object of the composite type: the spec holds defaults
//! (or zero values), and any field another expression needs but nothing
//! provides is filled with a `<target.path>` placeholder. Every template is
//! rendered along the way, which proves the templates render at all.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    JSONSchemaProps, JSON,
};
use krg_core::rgd::SCHEMA_ROOT;
use krg_core::TypeIdentity;
use serde_json::{json, Value as JsonValue};

use crate::error::{CompileError, Result};
use crate::expression::{render, Bindings, FieldDescriptor, Reference};
use crate::graph::Node;

/// Example spec honoring defaults, with zero values elsewhere
pub fn emulate_spec(schema: &JSONSchemaProps) -> JsonValue {
    if let Some(properties) = &schema.properties {
        let map = properties
            .iter()
            .map(|(name, property)| (name.clone(), emulate_field(property)))
            .collect();
        return JsonValue::Object(map);
    }
    zero_value(schema)
}

fn emulate_field(schema: &JSONSchemaProps) -> JsonValue {
    // Nested objects carry `default: {}` only so that their children default
    if schema.properties.is_some() {
        return emulate_spec(schema);
    }
    match &schema.default {
        Some(JSON(value)) => value.clone(),
        None => zero_value(schema),
    }
}

fn zero_value(schema: &JSONSchemaProps) -> JsonValue {
    match schema.type_.as_deref() {
        Some("string") => json!(""),
        Some("integer") => json!(0),
        Some("number") => json!(0.0),
        Some("boolean") => json!(false),
        Some("array") => json!([]),
        _ => json!({}),
    }
}

/// Value standing in for a reference nothing provides statically
pub fn placeholder(reference: &Reference) -> JsonValue {
    JsonValue::String(format!("<{}>", reference))
}

/// Build the emulated instance and render every node against it
///
/// `nodes` must be given in topological order.
pub fn emulate_instance<'a>(
    identity: &TypeIdentity,
    spec_schema: &JSONSchemaProps,
    nodes: impl IntoIterator<Item = &'a Node>,
    status_fields: &[FieldDescriptor],
) -> Result<JsonValue> {
    let instance = json!({
        "apiVersion": identity.api_version(),
        "kind": identity.kind,
        "metadata": {
            "name": format!("{}-example", identity.kind.to_lowercase()),
            "namespace": "default",
        },
        "spec": emulate_spec(spec_schema),
    });

    let mut bindings = Bindings::new();
    bindings.insert(SCHEMA_ROOT.to_string(), instance);

    for node in nodes {
        fill_placeholders(&node.fields, &mut bindings);
        let rendered = node.render(&bindings).map_err(|source| CompileError::Expression {
            resource: node.id.clone(),
            source,
        })?;
        bindings.insert(node.id.clone(), rendered);
    }

    fill_placeholders(status_fields, &mut bindings);
    let mut status = JsonValue::Object(Default::default());
    for field in status_fields {
        let value = render(&JsonValue::String(field.source.clone()), &bindings).map_err(|e| {
            CompileError::InvalidStatusField {
                field: field.location.to_string(),
                message: e.to_string(),
            }
        })?;
        field.location.set(&mut status, value);
    }

    let mut instance = bindings.remove(SCHEMA_ROOT).unwrap_or_default();
    if let Some(obj) = instance.as_object_mut() {
        obj.insert("status".to_string(), status);
    }
    Ok(instance)
}

fn fill_placeholders(fields: &[FieldDescriptor], bindings: &mut Bindings) {
    for reference in fields.iter().flat_map(|f| &f.references) {
        let doc = bindings
            .entry(reference.target.clone())
            .or_insert_with(|| JsonValue::Object(Default::default()));
        if reference.path.lookup(doc).is_none() {
            reference.path.set(doc, placeholder(reference));
        }
    }
}
