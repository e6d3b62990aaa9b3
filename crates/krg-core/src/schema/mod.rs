//! Shorthand schema synthesis
//!
//! RGD authors describe the spec of their composite type with a compact
//! grammar instead of OpenAPI. This module turns that grammar into the
//! structural `JSONSchemaProps` a CustomResourceDefinition needs:
//!
//! ```yaml
//! spec:
//!   name: string | required=true
//!   replicas: integer | default=3 minimum=1
//!   ingress:
//!     enabled: boolean | default=false
//!     hosts: "[]string"
//! ```
//!
//! Only this direction exists; converting a structural schema back into the
//! shorthand is rejected with [`SchemaError::Unsupported`].

mod markers;
mod validator;

pub use markers::{parse_field, parse_markers, Marker, TypeToken};
pub use validator::{SpecValidator, ValidationResult};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    JSONSchemaProps, JSONSchemaPropsOrArray, JSONSchemaPropsOrBool, JSON,
};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::error::SchemaError;

/// Convert a shorthand spec description into a structural schema
pub fn to_structural_schema(
    shorthand: &BTreeMap<String, JsonValue>,
) -> Result<JSONSchemaProps, SchemaError> {
    to_structural_schema_with_types(shorthand, &BTreeMap::new())
}

/// Convert a shorthand description that may use named custom types
pub fn to_structural_schema_with_types(
    shorthand: &BTreeMap<String, JsonValue>,
    types: &BTreeMap<String, JsonValue>,
) -> Result<JSONSchemaProps, SchemaError> {
    let mut transformer = Transformer {
        types,
        resolving: Vec::new(),
    };
    transformer.build_object(shorthand.iter(), "")
}

/// The reverse direction is deliberately not implemented
pub fn from_structural_schema(
    _schema: &JSONSchemaProps,
) -> Result<BTreeMap<String, JsonValue>, SchemaError> {
    Err(SchemaError::Unsupported {
        operation: "converting a structural schema back to shorthand".to_string(),
    })
}

struct Transformer<'a> {
    types: &'a BTreeMap<String, JsonValue>,
    /// Custom types currently being expanded, for cycle detection
    resolving: Vec<String>,
}

impl Transformer<'_> {
    fn build_object<'v>(
        &mut self,
        fields: impl IntoIterator<Item = (&'v String, &'v JsonValue)>,
        prefix: &str,
    ) -> Result<JSONSchemaProps, SchemaError> {
        let mut properties = BTreeMap::new();
        let mut required = Vec::new();

        for (name, value) in fields {
            let path = join_path(prefix, name);
            let (schema, is_required) = match value {
                JsonValue::String(raw) => self.build_field(raw, &path)?,
                JsonValue::Object(nested) => (self.build_object(nested.iter(), &path)?, false),
                other => {
                    return Err(SchemaError::InvalidShorthand {
                        field: path,
                        message: format!("expected a type string or a nested map, got {}", other),
                    });
                }
            };
            if is_required {
                required.push(name.clone());
            }
            properties.insert(name.clone(), schema);
        }

        // An empty parent would fail its own required fields
        let has_defaults =
            required.is_empty() && properties.values().any(|p| p.default.is_some());

        Ok(JSONSchemaProps {
            type_: Some("object".to_string()),
            properties: Some(properties),
            required: if required.is_empty() {
                None
            } else {
                Some(required)
            },
            // Lets the API server apply nested defaults when the parent is omitted
            default: has_defaults.then(|| JSON(JsonValue::Object(Default::default()))),
            ..Default::default()
        })
    }

    /// Build one `type | markers` field, returning whether it is required
    fn build_field(&mut self, raw: &str, path: &str) -> Result<(JSONSchemaProps, bool), SchemaError> {
        let (token, markers) = parse_field(raw, path)?;
        let mut schema = self.schema_for_token(&token, path)?;
        let mut required = false;

        for marker in markers {
            match marker {
                Marker::Required(value) => required = value,
                Marker::Default(raw) => {
                    schema.default = Some(JSON(parse_default(&token, &raw, path)?));
                }
                Marker::Description(text) => schema.description = Some(text),
                Marker::Enum(values) => {
                    schema.enum_ = Some(parse_enum(&token, &values, path)?);
                }
                Marker::Minimum(n) => {
                    require_numeric(&token, "minimum", path)?;
                    schema.minimum = Some(n);
                }
                Marker::Maximum(n) => {
                    require_numeric(&token, "maximum", path)?;
                    schema.maximum = Some(n);
                }
                Marker::Nullable(value) => schema.nullable = Some(value),
            }
        }

        Ok((schema, required))
    }

    fn schema_for_token(&mut self, token: &TypeToken, path: &str) -> Result<JSONSchemaProps, SchemaError> {
        let typed = |t: &str| JSONSchemaProps {
            type_: Some(t.to_string()),
            ..Default::default()
        };

        Ok(match token {
            TypeToken::String => typed("string"),
            TypeToken::Integer => typed("integer"),
            TypeToken::Number => typed("number"),
            TypeToken::Boolean => typed("boolean"),
            TypeToken::Object => JSONSchemaProps {
                x_kubernetes_preserve_unknown_fields: Some(true),
                ..typed("object")
            },
            TypeToken::Array(inner) => JSONSchemaProps {
                items: Some(JSONSchemaPropsOrArray::Schema(Box::new(
                    self.schema_for_token(inner, path)?,
                ))),
                ..typed("array")
            },
            TypeToken::Map(inner) => JSONSchemaProps {
                additional_properties: Some(JSONSchemaPropsOrBool::Schema(Box::new(
                    self.schema_for_token(inner, path)?,
                ))),
                ..typed("object")
            },
            TypeToken::Custom(name) => self.resolve_custom(name, path)?,
        })
    }

    fn resolve_custom(&mut self, name: &str, path: &str) -> Result<JSONSchemaProps, SchemaError> {
        let definition = self
            .types
            .get(name)
            .ok_or_else(|| SchemaError::UnknownTypeToken {
                field: path.to_string(),
                token: name.to_string(),
            })?;

        if self.resolving.iter().any(|n| n == name) {
            return Err(SchemaError::CyclicType {
                name: name.to_string(),
            });
        }
        self.resolving.push(name.to_string());

        let result = match definition {
            JsonValue::String(raw) => self.build_field(raw, path).map(|(schema, _)| schema),
            JsonValue::Object(fields) => self.build_object(fields.iter(), path),
            other => Err(SchemaError::InvalidShorthand {
                field: path.to_string(),
                message: format!("custom type '{}' must be a type string or map, got {}", name, other),
            }),
        };

        self.resolving.pop();
        result
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn parse_default(token: &TypeToken, raw: &str, path: &str) -> Result<JsonValue, SchemaError> {
    let invalid = |message: String| SchemaError::InvalidDefault {
        field: path.to_string(),
        message,
    };

    match token {
        TypeToken::String => Ok(JsonValue::String(unquote(raw).to_string())),
        TypeToken::Integer => raw
            .parse::<i64>()
            .map(JsonValue::from)
            .map_err(|_| invalid(format!("'{}' is not an integer", raw))),
        TypeToken::Number => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .ok_or_else(|| invalid(format!("'{}' is not a number", raw))),
        TypeToken::Boolean => raw
            .parse::<bool>()
            .map(JsonValue::Bool)
            .map_err(|_| invalid(format!("'{}' is not a boolean", raw))),
        _ => serde_json::from_str(raw).map_err(|e| invalid(format!("'{}' is not valid JSON: {}", raw, e))),
    }
}

fn parse_enum(token: &TypeToken, values: &[String], path: &str) -> Result<Vec<JSON>, SchemaError> {
    values
        .iter()
        .map(|v| match token {
            TypeToken::String | TypeToken::Integer | TypeToken::Number => {
                parse_default(token, v, path).map(JSON)
            }
            _ => Err(SchemaError::InvalidMarker {
                field: path.to_string(),
                message: "enum is only valid for string, integer and number fields".to_string(),
            }),
        })
        .collect()
}

fn require_numeric(token: &TypeToken, marker: &str, path: &str) -> Result<(), SchemaError> {
    match token {
        TypeToken::Integer | TypeToken::Number => Ok(()),
        _ => Err(SchemaError::InvalidMarker {
            field: path.to_string(),
            message: format!("{} is only valid for integer and number fields", marker),
        }),
    }
}

fn unquote(raw: &str) -> &str {
    raw.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw)
}

/// Fill every absent field that has a schema default, recursively
pub fn apply_defaults(schema: &JSONSchemaProps, value: &mut JsonValue) {
    match value {
        JsonValue::Object(map) => {
            if let Some(properties) = &schema.properties {
                for (name, property) in properties {
                    if !map.contains_key(name) {
                        if let Some(JSON(default)) = &property.default {
                            map.insert(name.clone(), default.clone());
                        }
                    }
                    if let Some(child) = map.get_mut(name) {
                        apply_defaults(property, child);
                    }
                }
            }
            if let Some(JSONSchemaPropsOrBool::Schema(values)) = &schema.additional_properties {
                for child in map.values_mut() {
                    apply_defaults(values, child);
                }
            }
        }
        JsonValue::Array(items) => {
            if let Some(JSONSchemaPropsOrArray::Schema(item)) = &schema.items {
                for child in items {
                    apply_defaults(item, child);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shorthand(value: JsonValue) -> BTreeMap<String, JsonValue> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_required_and_default() {
        let schema = to_structural_schema(&shorthand(json!({
            "name": "string | required=true",
            "replicas": "integer | default=3",
        })))
        .unwrap();

        assert_eq!(schema.type_.as_deref(), Some("object"));
        assert_eq!(schema.required, Some(vec!["name".to_string()]));
        let props = schema.properties.as_ref().unwrap();
        assert_eq!(props["replicas"].type_.as_deref(), Some("integer"));
        assert_eq!(props["replicas"].default, Some(JSON(json!(3))));
        assert_eq!(props["name"].default, None);
        assert_eq!(schema.default, None);
    }

    #[test]
    fn test_defaults_applied_to_instance_spec() {
        let schema = to_structural_schema(&shorthand(json!({
            "name": "string | required=true",
            "replicas": "integer | default=3",
        })))
        .unwrap();

        let mut spec = json!({"name": "web"});
        apply_defaults(&schema, &mut spec);
        assert_eq!(spec, json!({"name": "web", "replicas": 3}));

        let mut explicit = json!({"name": "web", "replicas": 5});
        apply_defaults(&schema, &mut explicit);
        assert_eq!(explicit["replicas"], 5);
    }

    #[test]
    fn test_optional_parent_with_required_child_is_not_defaulted() {
        let schema = to_structural_schema(&shorthand(json!({
            "name": "string | required=true",
            "ingress": {
                "host": "string | required=true",
                "enabled": "boolean | default=false",
            },
        })))
        .unwrap();
        let props = schema.properties.as_ref().unwrap();
        assert_eq!(props["ingress"].default, None);

        let mut spec = json!({"name": "x"});
        apply_defaults(&schema, &mut spec);
        assert_eq!(spec, json!({"name": "x"}));
        assert!(SpecValidator::new(&schema).unwrap().validate(&spec).is_valid);

        let mut with_ingress = json!({"name": "x", "ingress": {"host": "example.com"}});
        apply_defaults(&schema, &mut with_ingress);
        assert_eq!(with_ingress["ingress"]["enabled"], false);
    }

    #[test]
    fn test_nested_objects_and_collections() {
        let schema = to_structural_schema(&shorthand(json!({
            "ingress": {
                "enabled": "boolean | default=false",
                "hosts": "[]string",
            },
            "labels": "map[string]string",
            "extra": "object",
        })))
        .unwrap();
        let props = schema.properties.unwrap();

        let ingress = &props["ingress"];
        assert_eq!(ingress.type_.as_deref(), Some("object"));
        assert_eq!(ingress.default, Some(JSON(json!({}))));
        let hosts = &ingress.properties.as_ref().unwrap()["hosts"];
        assert_eq!(hosts.type_.as_deref(), Some("array"));
        match &hosts.items {
            Some(JSONSchemaPropsOrArray::Schema(item)) => {
                assert_eq!(item.type_.as_deref(), Some("string"))
            }
            other => panic!("unexpected items: {:?}", other),
        }

        match &props["labels"].additional_properties {
            Some(JSONSchemaPropsOrBool::Schema(value)) => {
                assert_eq!(value.type_.as_deref(), Some("string"))
            }
            other => panic!("unexpected additionalProperties: {:?}", other),
        }
        assert_eq!(props["extra"].x_kubernetes_preserve_unknown_fields, Some(true));
    }

    #[test]
    fn test_nested_defaults_apply_through_empty_parent() {
        let schema = to_structural_schema(&shorthand(json!({
            "ingress": {"enabled": "boolean | default=false"},
        })))
        .unwrap();
        let mut spec = json!({});
        apply_defaults(&schema, &mut spec);
        assert_eq!(spec, json!({"ingress": {"enabled": false}}));
    }

    #[test]
    fn test_unknown_type_token() {
        let err = to_structural_schema(&shorthand(json!({"size": "strng"}))).unwrap_err();
        assert_eq!(
            err,
            SchemaError::UnknownTypeToken {
                field: "size".into(),
                token: "strng".into()
            }
        );
    }

    #[test]
    fn test_unknown_type_token_nested_path() {
        let err = to_structural_schema(&shorthand(json!({"db": {"size": "[]wat!"}}))).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownTypeToken { ref field, .. } if field == "db.size"));
    }

    #[test]
    fn test_invalid_default() {
        let err = to_structural_schema(&shorthand(json!({"replicas": "integer | default=three"})))
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidDefault { .. }));
    }

    #[test]
    fn test_non_string_leaf_is_rejected() {
        let err = to_structural_schema(&shorthand(json!({"replicas": 3}))).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidShorthand { .. }));
    }

    #[test]
    fn test_enum_and_bounds() {
        let schema = to_structural_schema(&shorthand(json!({
            "size": "string | enum=\"small,large\" default=small",
            "replicas": "integer | minimum=1 maximum=10",
        })))
        .unwrap();
        let props = schema.properties.unwrap();
        assert_eq!(
            props["size"].enum_,
            Some(vec![JSON(json!("small")), JSON(json!("large"))])
        );
        assert_eq!(props["size"].default, Some(JSON(json!("small"))));
        assert_eq!(props["replicas"].minimum, Some(1.0));
        assert_eq!(props["replicas"].maximum, Some(10.0));

        let err = to_structural_schema(&shorthand(json!({"name": "string | minimum=1"})))
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidMarker { .. }));
    }

    #[test]
    fn test_custom_types() {
        let types = shorthand(json!({
            "Port": "integer | minimum=1 maximum=65535",
            "Endpoint": {"host": "string | required=true", "port": "Port"},
        }));
        let schema = to_structural_schema_with_types(
            &shorthand(json!({"endpoints": "[]Endpoint"})),
            &types,
        )
        .unwrap();

        let endpoints = &schema.properties.unwrap()["endpoints"];
        let item = match &endpoints.items {
            Some(JSONSchemaPropsOrArray::Schema(item)) => item.clone(),
            other => panic!("unexpected items: {:?}", other),
        };
        assert_eq!(item.required, Some(vec!["host".to_string()]));
        assert_eq!(item.properties.unwrap()["port"].maximum, Some(65535.0));
    }

    #[test]
    fn test_cyclic_custom_types() {
        let types = shorthand(json!({"Node": {"next": "Node"}}));
        let err = to_structural_schema_with_types(&shorthand(json!({"head": "Node"})), &types)
            .unwrap_err();
        assert_eq!(err, SchemaError::CyclicType { name: "Node".into() });
    }

    #[test]
    fn test_reverse_direction_is_unsupported() {
        let err = from_structural_schema(&JSONSchemaProps::default()).unwrap_err();
        assert!(matches!(err, SchemaError::Unsupported { .. }));
        assert!(err.to_string().contains("not supported"));
    }
}
