//! CustomResourceDefinition synthesis for composite types

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceColumnDefinition, CustomResourceDefinition, CustomResourceDefinitionNames,
    CustomResourceDefinitionSpec, CustomResourceDefinitionVersion, CustomResourceSubresourceStatus,
    CustomResourceSubresources, CustomResourceValidation, JSONSchemaProps, JSONSchemaPropsOrArray,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use krg_core::TypeIdentity;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

fn typed(type_: &str) -> JSONSchemaProps {
    JSONSchemaProps {
        type_: Some(type_.to_string()),
        ..Default::default()
    }
}

fn free_form_object() -> JSONSchemaProps {
    JSONSchemaProps {
        x_kubernetes_preserve_unknown_fields: Some(true),
        ..typed("object")
    }
}

fn array_of(item: JSONSchemaProps) -> JSONSchemaProps {
    JSONSchemaProps {
        items: Some(JSONSchemaPropsOrArray::Schema(Box::new(item))),
        ..typed("array")
    }
}

/// Status fields every instance carries, whatever the RGD declares
pub fn builtin_status_properties() -> BTreeMap<String, JSONSchemaProps> {
    let condition = JSONSchemaProps {
        properties: Some(BTreeMap::from([
            ("type".to_string(), typed("string")),
            ("status".to_string(), typed("string")),
            ("reason".to_string(), typed("string")),
            ("message".to_string(), typed("string")),
            ("lastTransitionTime".to_string(), typed("string")),
        ])),
        ..typed("object")
    };
    let progress = JSONSchemaProps {
        properties: Some(BTreeMap::from([
            ("materialized".to_string(), typed("integer")),
            ("total".to_string(), typed("integer")),
        ])),
        ..typed("object")
    };

    BTreeMap::from([
        ("state".to_string(), typed("string")),
        ("conditions".to_string(), array_of(condition)),
        ("progress".to_string(), progress),
        ("resources".to_string(), array_of(free_form_object())),
    ])
}

/// Build the CRD serving `identity`
pub fn build_crd(
    identity: &TypeIdentity,
    spec_schema: JSONSchemaProps,
    status_schema: JSONSchemaProps,
    labels: BTreeMap<String, String>,
) -> CustomResourceDefinition {
    let root = JSONSchemaProps {
        properties: Some(BTreeMap::from([
            ("apiVersion".to_string(), typed("string")),
            ("kind".to_string(), typed("string")),
            ("metadata".to_string(), typed("object")),
            ("spec".to_string(), spec_schema),
            ("status".to_string(), status_schema),
        ])),
        ..typed("object")
    };

    let columns = vec![
        CustomResourceColumnDefinition {
            name: "State".to_string(),
            type_: "string".to_string(),
            json_path: ".status.state".to_string(),
            ..Default::default()
        },
        CustomResourceColumnDefinition {
            name: "Age".to_string(),
            type_: "date".to_string(),
            json_path: ".metadata.creationTimestamp".to_string(),
            ..Default::default()
        },
    ];

    CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(identity.crd_name()),
            labels: if labels.is_empty() { None } else { Some(labels) },
            ..Default::default()
        },
        spec: CustomResourceDefinitionSpec {
            group: identity.group.clone(),
            names: CustomResourceDefinitionNames {
                kind: identity.kind.clone(),
                list_kind: Some(format!("{}List", identity.kind)),
                plural: identity.plural(),
                singular: Some(identity.kind.to_lowercase()),
                ..Default::default()
            },
            scope: "Namespaced".to_string(),
            versions: vec![CustomResourceDefinitionVersion {
                name: identity.version.clone(),
                served: true,
                storage: true,
                schema: Some(CustomResourceValidation {
                    open_api_v3_schema: Some(root),
                }),
                subresources: Some(CustomResourceSubresources {
                    status: Some(CustomResourceSubresourceStatus(JsonValue::Object(
                        Default::default(),
                    ))),
                    ..Default::default()
                }),
                additional_printer_columns: Some(columns),
                ..Default::default()
            }],
            ..Default::default()
        },
        status: None,
    }
}
