//! Validation of instance specs against a synthesized schema

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaProps;
use serde_json::Value as JsonValue;

use crate::error::{SchemaError, ValidationErrorInfo};

/// Outcome of validating one document
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationErrorInfo>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    pub fn failure(errors: Vec<ValidationErrorInfo>) -> Self {
        Self {
            is_valid: false,
            errors,
        }
    }

    /// All errors joined on one line, for status messages
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Compiled validator for the spec of one composite type
pub struct SpecValidator {
    compiled: jsonschema::Validator,
}

impl std::fmt::Debug for SpecValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecValidator").finish_non_exhaustive()
    }
}

impl SpecValidator {
    pub fn new(schema: &JSONSchemaProps) -> Result<Self, SchemaError> {
        let mut json = serde_json::to_value(schema).map_err(|e| SchemaError::InvalidSchema {
            message: e.to_string(),
        })?;
        widen_nullable(&mut json);

        let compiled = jsonschema::validator_for(&json).map_err(|e| SchemaError::InvalidSchema {
            message: e.to_string(),
        })?;
        Ok(Self { compiled })
    }

    /// Validate a (defaulted) spec
    pub fn validate(&self, spec: &JsonValue) -> ValidationResult {
        if self.compiled.is_valid(spec) {
            return ValidationResult::success();
        }

        let errors = self
            .compiled
            .iter_errors(spec)
            .map(|e| {
                let path = e.instance_path.to_string();
                ValidationErrorInfo {
                    path: if path.is_empty() {
                        "(root)".to_string()
                    } else {
                        path
                    },
                    message: e.to_string().replace('"', "'"),
                }
            })
            .collect();

        ValidationResult::failure(errors)
    }
}

/// JSON Schema has no `nullable`; express it as a type union
fn widen_nullable(schema: &mut JsonValue) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };

    if obj.remove("nullable") == Some(JsonValue::Bool(true)) {
        if let Some(JsonValue::String(t)) = obj.get("type").cloned() {
            obj.insert("type".to_string(), serde_json::json!([t, "null"]));
        }
    }

    if let Some(JsonValue::Object(props)) = obj.get_mut("properties") {
        for child in props.values_mut() {
            widen_nullable(child);
        }
    }
    for key in ["items", "additionalProperties"] {
        if let Some(child) = obj.get_mut(key) {
            widen_nullable(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{apply_defaults, to_structural_schema};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn validator(shorthand: JsonValue) -> (JSONSchemaProps, SpecValidator) {
        let shorthand: BTreeMap<String, JsonValue> = serde_json::from_value(shorthand).unwrap();
        let schema = to_structural_schema(&shorthand).unwrap();
        let validator = SpecValidator::new(&schema).unwrap();
        (schema, validator)
    }

    #[test]
    fn test_missing_required_field() {
        let (schema, validator) = validator(json!({
            "name": "string | required=true",
            "replicas": "integer | default=3",
        }));
        let mut spec = json!({});
        apply_defaults(&schema, &mut spec);

        let result = validator.validate(&spec);
        assert!(!result.is_valid);
        assert!(result.summary().contains("name"));
    }

    #[test]
    fn test_valid_spec() {
        let (schema, validator) = validator(json!({
            "name": "string | required=true",
            "replicas": "integer | default=3 minimum=1",
        }));
        let mut spec = json!({"name": "web"});
        apply_defaults(&schema, &mut spec);
        assert!(validator.validate(&spec).is_valid);
    }

    #[test]
    fn test_type_mismatch_reports_path() {
        let (_, validator) = validator(json!({"replicas": "integer"}));
        let result = validator.validate(&json!({"replicas": "three"}));
        assert!(!result.is_valid);
        assert_eq!(result.errors[0].path, "/replicas");
    }

    #[test]
    fn test_nullable_accepts_null() {
        let (_, validator) = validator(json!({"owner": "string | nullable=true"}));
        assert!(validator.validate(&json!({"owner": null})).is_valid);

        let (_, strict) = self::validator(json!({"owner": "string"}));
        assert!(!strict.validate(&json!({"owner": null})).is_valid);
    }
}
