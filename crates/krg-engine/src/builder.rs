//! Compilation of a ResourceGraphDefinition into a `CompiledGraph`
//!
//! 1. synthesize the spec schema from the shorthand
//! 2. validate resource ids and templates
//! 3. extract references and build dependency edges
//! 4. reject cycles, compute the topological order
//! 5. derive the status schema, emulate an instance and build the CRD

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    JSONSchemaProps, JSONSchemaPropsOrArray, JSONSchemaPropsOrBool,
};
use krg_core::rgd::SCHEMA_ROOT;
use krg_core::schema::to_structural_schema_with_types;
use krg_core::status::RESERVED_STATUS_FIELDS;
use krg_core::{ResourceGraphDefinition, ResourceTemplate, SchemaError, SpecValidator, TypeIdentity};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::crd::{build_crd, builtin_status_properties};
use crate::dag::Dag;
use crate::emulator::emulate_instance;
use crate::error::{CompileError, Result};
use crate::expression::{condition_reference, extract_fields, FieldDescriptor, FieldPath, PathSegment, Reference};
use crate::graph::{CompiledGraph, Node};
use crate::suggestions::{suggest_field, suggest_resource};

/// Label put on generated CRDs naming the RGD they belong to
pub const CRD_OWNER_LABEL: &str = "krg.dev/resource-graph-definition-name";

/// Compiles RGDs; stateless and safe to share
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    /// Extra labels put on every generated CRD
    crd_labels: BTreeMap<String, String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_crd_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.crd_labels = labels;
        self
    }

    pub fn compile(&self, rgd: &ResourceGraphDefinition) -> Result<CompiledGraph> {
        let schema = &rgd.spec.schema;
        let identity = schema.identity();
        validate_identity(&identity)?;

        let spec_schema = to_structural_schema_with_types(&schema.spec, &schema.types)?;
        let validator = SpecValidator::new(&spec_schema)?;

        let mut dag = Dag::new();
        validate_ids(&rgd.spec.resources)?;
        for resource in &rgd.spec.resources {
            dag.add_node(&resource.id);
        }
        let declared: Vec<&str> = rgd.spec.resources.iter().map(|r| r.id.as_str()).collect();

        let mut nodes = Vec::with_capacity(rgd.spec.resources.len());
        for (index, resource) in rgd.spec.resources.iter().enumerate() {
            let node = compile_node(index, resource, &declared, &spec_schema)?;
            for &dep in &node.dependencies {
                dag.add_dependency(index, dep);
            }
            nodes.push(node);
        }

        let order = dag.topological_order().map_err(|cycle| CompileError::Cycle {
            members: cycle.iter().map(|&i| dag.id(i).to_string()).collect(),
        })?;

        let status_template = JsonValue::Object(
            schema
                .status
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let status_fields = compile_status(&status_template, &declared, &spec_schema)?;
        let status_schema = status_schema(&status_template);

        let emulated = emulate_instance(
            &identity,
            &spec_schema,
            order.iter().map(|&i| &nodes[i]),
            &status_fields,
        )?;

        let mut crd_labels = self.crd_labels.clone();
        crd_labels.insert(CRD_OWNER_LABEL.to_string(), rgd.name().to_string());
        let crd = build_crd(&identity, spec_schema.clone(), status_schema.clone(), crd_labels);

        let fingerprint = fingerprint(rgd);
        tracing::debug!(
            rgd = rgd.name(),
            kind = %identity,
            order = ?order.iter().map(|&i| dag.id(i)).collect::<Vec<_>>(),
            fingerprint = &fingerprint[..12],
            "compiled resource graph"
        );

        Ok(CompiledGraph {
            name: rgd.name().to_string(),
            generation: rgd.generation(),
            identity,
            spec_schema,
            status_schema,
            crd,
            emulated,
            nodes,
            order,
            status_fields,
            fingerprint,
            validator,
        })
    }
}

fn validate_identity(identity: &TypeIdentity) -> Result<()> {
    let invalid = |message: String| CompileError::Schema(SchemaError::InvalidSchema { message });

    if identity.version.is_empty() {
        return Err(invalid("schema.apiVersion is required".to_string()));
    }
    if !identity.kind.starts_with(|c: char| c.is_ascii_uppercase())
        || !identity.kind.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(invalid(format!(
            "schema.kind '{}' must be an UpperCamelCase identifier",
            identity.kind
        )));
    }
    if identity.group.is_empty() {
        return Err(invalid("schema.group must not be empty".to_string()));
    }
    Ok(())
}

fn validate_ids(resources: &[ResourceTemplate]) -> Result<()> {
    let mut seen = HashSet::new();
    for resource in resources {
        let id = resource.id.as_str();
        let invalid = |message: &str| CompileError::InvalidResourceId {
            id: id.to_string(),
            message: message.to_string(),
        };

        if id == SCHEMA_ROOT {
            return Err(invalid("'schema' is reserved for the instance itself"));
        }
        let mut chars = id.chars();
        if !chars.next().is_some_and(|c| c.is_ascii_lowercase()) {
            return Err(invalid("must start with a lowercase letter"));
        }
        if !chars.all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid("must be lowerCamelCase (letters and digits only)"));
        }
        if !seen.insert(id) {
            return Err(CompileError::DuplicateResourceId { id: id.to_string() });
        }
    }
    Ok(())
}

fn compile_node(
    index: usize,
    resource: &ResourceTemplate,
    declared: &[&str],
    spec_schema: &JSONSchemaProps,
) -> Result<Node> {
    let id = &resource.id;
    let invalid = |message: String| CompileError::InvalidTemplate {
        resource: id.clone(),
        message,
    };
    let expression_error = |source| CompileError::Expression {
        resource: id.clone(),
        source,
    };

    let template = &resource.template;
    if !template.is_object() {
        return Err(invalid("template must be a map".to_string()));
    }
    let literal = |field: &str| -> Result<String> {
        match template.get(field) {
            Some(JsonValue::String(s)) if !s.is_empty() && !s.contains("${") => Ok(s.clone()),
            _ => Err(invalid(format!("{} must be a literal string", field))),
        }
    };
    let identity = TypeIdentity::from_api_version(&literal("apiVersion")?, &literal("kind")?);
    if !template
        .pointer("/metadata/name")
        .is_some_and(JsonValue::is_string)
    {
        return Err(invalid("metadata.name is required".to_string()));
    }

    let fields = extract_fields(template).map_err(expression_error)?;
    let mut dependencies = BTreeSet::new();
    for reference in fields.iter().flat_map(|f| &f.references) {
        if reference.target == *id {
            return Err(invalid(format!(
                "the template references itself (${{{}}}); only readyWhen may do that",
                reference
            )));
        }
        if let Some(dep) = check_reference(id, reference, declared, spec_schema)? {
            dependencies.insert(dep);
        }
    }

    for condition in &resource.ready_when {
        let reference = condition_reference(condition).map_err(expression_error)?;
        if reference.target != *id && reference.target != SCHEMA_ROOT {
            return Err(invalid(format!(
                "readyWhen may only reference '{}' or schema, found ${{{}}}",
                id, reference
            )));
        }
        if reference.target == SCHEMA_ROOT {
            check_schema_path(id, &reference.path, spec_schema)?;
        }
    }

    for condition in &resource.include_when {
        let reference = condition_reference(condition).map_err(expression_error)?;
        if reference.target != SCHEMA_ROOT {
            return Err(invalid(format!(
                "includeWhen may only reference schema, found ${{{}}}",
                reference
            )));
        }
        check_schema_path(id, &reference.path, spec_schema)?;
    }

    Ok(Node {
        id: id.clone(),
        index,
        identity,
        template: template.clone(),
        dependencies,
        fields,
        ready_when: resource.ready_when.clone(),
        include_when: resource.include_when.clone(),
    })
}

/// Validate a reference; returns the node index for cross-resource ones
fn check_reference(
    resource: &str,
    reference: &Reference,
    declared: &[&str],
    spec_schema: &JSONSchemaProps,
) -> Result<Option<usize>> {
    if reference.target == SCHEMA_ROOT {
        check_schema_path(resource, &reference.path, spec_schema)?;
        return Ok(None);
    }
    match declared.iter().position(|d| *d == reference.target) {
        Some(index) => Ok(Some(index)),
        None => Err(CompileError::UndeclaredReference {
            resource: resource.to_string(),
            target: reference.target.clone(),
            suggestion: suggest_resource(&reference.target, declared),
        }),
    }
}

/// Check a `schema.*` path against the synthesized spec schema
fn check_schema_path(resource: &str, path: &FieldPath, spec_schema: &JSONSchemaProps) -> Result<()> {
    let unknown = |suggestion: Option<String>| CompileError::UnknownSchemaField {
        resource: resource.to_string(),
        path: format!("{}{}", SCHEMA_ROOT, path),
        suggestion,
    };

    let rest = match path.segments().split_first() {
        Some((PathSegment::Field(root), rest)) if root == "spec" => rest,
        Some((PathSegment::Field(root), _)) if root == "metadata" => return Ok(()),
        _ => {
            return Err(unknown(Some(
                "Instance fields are reachable as `schema.spec.*` or `schema.metadata.*`".to_string(),
            )));
        }
    };

    let mut current = spec_schema;
    let mut parent = format!("{}.spec", SCHEMA_ROOT);
    for segment in rest {
        if current.x_kubernetes_preserve_unknown_fields == Some(true) {
            return Ok(());
        }
        match segment {
            PathSegment::Field(name) => {
                if let Some(property) = current.properties.as_ref().and_then(|p| p.get(name)) {
                    current = property;
                } else if let Some(JSONSchemaPropsOrBool::Schema(values)) = &current.additional_properties {
                    current = &**values;
                } else {
                    let available: Vec<&str> = current
                        .properties
                        .as_ref()
                        .map(|p| p.keys().map(String::as_str).collect())
                        .unwrap_or_default();
                    return Err(unknown(suggest_field(&parent, name, &available)));
                }
                parent.push('.');
                parent.push_str(name);
            }
            PathSegment::Index(i) => {
                match &current.items {
                    Some(JSONSchemaPropsOrArray::Schema(item)) => current = &**item,
                    _ => return Err(unknown(Some(format!("`{}` is not a list", parent)))),
                }
                parent.push_str(&format!("[{}]", i));
            }
        }
    }
    Ok(())
}

fn compile_status(
    status: &JsonValue,
    declared: &[&str],
    spec_schema: &JSONSchemaProps,
) -> Result<Vec<FieldDescriptor>> {
    if let JsonValue::Object(map) = status {
        for name in map.keys() {
            if RESERVED_STATUS_FIELDS.contains(&name.as_str()) {
                return Err(CompileError::InvalidStatusField {
                    field: name.clone(),
                    message: "the name is reserved for controller-managed status".to_string(),
                });
            }
        }
    }
    check_status_leaves(status, &FieldPath::root())?;

    let fields = extract_fields(status).map_err(|e| CompileError::InvalidStatusField {
        field: "status".to_string(),
        message: e.to_string(),
    })?;
    for field in &fields {
        for reference in &field.references {
            check_reference(&format!("status{}", field.location), reference, declared, spec_schema)?;
        }
    }
    Ok(fields)
}

/// Status leaves must be expressions; there is nothing else to compute them from
fn check_status_leaves(value: &JsonValue, location: &FieldPath) -> Result<()> {
    match value {
        JsonValue::Object(map) => {
            for (name, child) in map {
                check_status_leaves(child, &location.child(PathSegment::Field(name.clone())))?;
            }
            Ok(())
        }
        JsonValue::String(s) if s.contains("${") => Ok(()),
        other => Err(CompileError::InvalidStatusField {
            field: location.to_string(),
            message: format!("expected a ${{...}} expression or a nested map, got {}", other),
        }),
    }
}

/// Status schema: standalone expressions may yield anything, interpolations yield strings
fn status_schema(status: &JsonValue) -> JSONSchemaProps {
    fn build(value: &JsonValue) -> JSONSchemaProps {
        match value {
            JsonValue::Object(map) => JSONSchemaProps {
                type_: Some("object".to_string()),
                properties: Some(map.iter().map(|(k, v)| (k.clone(), build(v))).collect()),
                ..Default::default()
            },
            JsonValue::String(s) if is_standalone(s) => JSONSchemaProps {
                x_kubernetes_preserve_unknown_fields: Some(true),
                ..Default::default()
            },
            _ => JSONSchemaProps {
                type_: Some("string".to_string()),
                ..Default::default()
            },
        }
    }

    let mut schema = build(status);
    let properties = schema.properties.get_or_insert_with(BTreeMap::new);
    properties.extend(builtin_status_properties());
    schema
}

fn is_standalone(s: &str) -> bool {
    s.starts_with("${") && s.ends_with('}') && s.matches("${").count() == 1
}

fn fingerprint(rgd: &ResourceGraphDefinition) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&rgd.spec).unwrap_or_default());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgd(resources: &str) -> ResourceGraphDefinition {
        let yaml = format!(
            r#"
apiVersion: krg.dev/v1alpha1
kind: ResourceGraphDefinition
metadata:
  name: webapp
  generation: 2
spec:
  schema:
    apiVersion: v1alpha1
    kind: WebApp
    spec:
      name: string | required=true
      replicas: integer | default=3
      ingress:
        enabled: boolean | default=false
    status:
      availableReplicas: ${{deployment.status.availableReplicas}}
      url: http://${{service.metadata.name}}
  resources:
{}
"#,
            resources
        );
        ResourceGraphDefinition::from_yaml(&yaml).unwrap()
    }

    const WEBAPP: &str = r#"
    - id: service
      template:
        apiVersion: v1
        kind: Service
        metadata:
          name: ${schema.spec.name}
        spec:
          selector: ${deployment.spec.selector.matchLabels}
    - id: deployment
      template:
        apiVersion: apps/v1
        kind: Deployment
        metadata:
          name: ${schema.spec.name}
        spec:
          replicas: ${schema.spec.replicas}
          selector:
            matchLabels:
              app: ${schema.spec.name}
      readyWhen:
        - ${deployment.status.ready}
    - id: ingress
      includeWhen:
        - ${schema.spec.ingress.enabled}
      template:
        apiVersion: networking.k8s.io/v1
        kind: Ingress
        metadata:
          name: ${schema.spec.name}
        spec:
          backend: ${service.metadata.name}
"#;

    #[test]
    fn test_compile_orders_by_dependency() {
        let graph = GraphBuilder::new().compile(&rgd(WEBAPP)).unwrap();
        assert_eq!(graph.topological_ids(), vec!["deployment", "service", "ingress"]);
        assert_eq!(graph.generation, 2);
        assert_eq!(graph.identity.crd_name(), "webapps.krg.dev");

        let service = graph.node("service").unwrap();
        assert_eq!(graph.dependency_ids(service), vec!["deployment"]);
        assert_eq!(service.identity.api_version(), "v1");
        assert!(graph.node("ingress").unwrap().is_conditional());
    }

    #[test]
    fn test_compile_is_stable() {
        let builder = GraphBuilder::new();
        let first = builder.compile(&rgd(WEBAPP)).unwrap();
        for _ in 0..5 {
            let again = builder.compile(&rgd(WEBAPP)).unwrap();
            assert_eq!(again.order, first.order);
            assert_eq!(again.fingerprint, first.fingerprint);
        }
    }

    #[test]
    fn test_undeclared_reference() {
        let err = GraphBuilder::new()
            .compile(&rgd(r#"
    - id: service
      template:
        apiVersion: v1
        kind: Service
        metadata:
          name: ${ghost.field}
"#))
            .unwrap_err();
        match err {
            CompileError::UndeclaredReference { resource, target, .. } => {
                assert_eq!(resource, "service");
                assert_eq!(target, "ghost");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = GraphBuilder::new()
            .compile(&rgd(r#"
    - id: service
      template:
        apiVersion: v1
        kind: Service
        metadata:
          name: ${deployment.metadata.name}
    - id: deployment
      template:
        apiVersion: apps/v1
        kind: Deployment
        metadata:
          name: ${service.metadata.name}
"#))
            .unwrap_err();
        assert_eq!(
            err,
            CompileError::Cycle {
                members: vec!["service".into(), "deployment".into()]
            }
        );
    }

    #[test]
    fn test_unknown_schema_field() {
        let err = GraphBuilder::new()
            .compile(&rgd(r#"
    - id: deployment
      template:
        apiVersion: apps/v1
        kind: Deployment
        metadata:
          name: ${schema.spec.nmae}
"#))
            .unwrap_err();
        match err {
            CompileError::UnknownSchemaField { path, suggestion, .. } => {
                assert_eq!(path, "schema.spec.nmae");
                assert!(suggestion.unwrap().contains("schema.spec.name"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_ids() {
        let template = "
      template:
        apiVersion: v1
        kind: ConfigMap
        metadata:
          name: x";
        for id in ["schema", "Config", "my-config"] {
            let err = GraphBuilder::new()
                .compile(&rgd(&format!("    - id: {}{}", id, template)))
                .unwrap_err();
            assert!(matches!(err, CompileError::InvalidResourceId { .. }), "{}", id);
        }

        let twice = format!("    - id: config{}\n    - id: config{}", template, template);
        assert_eq!(
            GraphBuilder::new().compile(&rgd(&twice)).unwrap_err(),
            CompileError::DuplicateResourceId { id: "config".into() }
        );
    }

    #[test]
    fn test_template_must_have_literal_kind_and_name() {
        let err = GraphBuilder::new()
            .compile(&rgd(r#"
    - id: config
      template:
        apiVersion: v1
        kind: ${schema.spec.name}
        metadata:
          name: x
"#))
            .unwrap_err();
        assert!(matches!(err, CompileError::InvalidTemplate { .. }));

        let err = GraphBuilder::new()
            .compile(&rgd(r#"
    - id: config
      template:
        apiVersion: v1
        kind: ConfigMap
"#))
            .unwrap_err();
        assert!(matches!(err, CompileError::InvalidTemplate { .. }));
    }

    #[test]
    fn test_self_reference_only_in_ready_when() {
        let err = GraphBuilder::new()
            .compile(&rgd(r#"
    - id: config
      template:
        apiVersion: v1
        kind: ConfigMap
        metadata:
          name: ${config.metadata.uid}
"#))
            .unwrap_err();
        assert!(matches!(err, CompileError::InvalidTemplate { .. }));
    }

    #[test]
    fn test_include_when_must_reference_schema() {
        let err = GraphBuilder::new()
            .compile(&rgd(r#"
    - id: config
      includeWhen:
        - ${other.status.ready}
      template:
        apiVersion: v1
        kind: ConfigMap
        metadata:
          name: x
"#))
            .unwrap_err();
        assert!(matches!(err, CompileError::InvalidTemplate { .. }));
    }

    #[test]
    fn test_status_schema_and_crd() {
        let graph = GraphBuilder::new().compile(&rgd(WEBAPP)).unwrap();
        let props = graph.status_schema.properties.as_ref().unwrap();

        assert_eq!(
            props["availableReplicas"].x_kubernetes_preserve_unknown_fields,
            Some(true)
        );
        assert_eq!(props["url"].type_.as_deref(), Some("string"));
        assert!(props.contains_key("state"));
        assert_eq!(
            graph.crd.metadata.labels.as_ref().unwrap()[CRD_OWNER_LABEL],
            "webapp"
        );
    }

    #[test]
    fn test_reserved_status_field() {
        let mut definition = rgd(WEBAPP);
        definition
            .spec
            .schema
            .status
            .insert("state".into(), JsonValue::String("${deployment.status.phase}".into()));
        let err = GraphBuilder::new().compile(&definition).unwrap_err();
        assert!(matches!(err, CompileError::InvalidStatusField { .. }));
    }

    #[test]
    fn test_emulated_instance() {
        let graph = GraphBuilder::new().compile(&rgd(WEBAPP)).unwrap();
        let emulated = &graph.emulated;

        assert_eq!(emulated["apiVersion"], "krg.dev/v1alpha1");
        assert_eq!(emulated["kind"], "WebApp");
        assert_eq!(emulated["spec"]["replicas"], 3);
        assert_eq!(emulated["spec"]["ingress"]["enabled"], false);
        insta::assert_snapshot!(
            emulated["status"]["availableReplicas"].as_str().unwrap(),
            @"<deployment.status.availableReplicas>"
        );
        assert_eq!(emulated["status"]["url"], "http://");
    }

    #[test]
    fn test_schema_error_is_reported() {
        let mut definition = rgd(WEBAPP);
        definition
            .spec
            .schema
            .spec
            .insert("size".into(), JsonValue::String("strng".into()));
        assert!(matches!(
            GraphBuilder::new().compile(&definition),
            Err(CompileError::Schema(SchemaError::UnknownTypeToken { .. }))
        ));
    }
}
