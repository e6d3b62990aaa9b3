//! Generate command - print the CRD or an example instance of an RGD

use clap::ValueEnum;
use krg_engine::CompiledGraph;
use serde_json::{Value as JsonValue, json};
use std::path::Path;

use crate::error::{CliError, Result};

/// Annotation recording the krg version that produced a document
pub const VERSION_ANNOTATION: &str = "krg.dev/version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Yaml,
    Json,
}

pub fn crd(file: &Path, output: OutputFormat) -> Result<()> {
    let graph = super::load_graph(file)?;
    let mut crd =
        serde_json::to_value(&graph.crd).map_err(|e| CliError::internal(e.to_string()))?;
    stamp_version(&mut crd);
    print!("{}", render(&crd, output)?);
    Ok(())
}

pub fn instance(file: &Path, output: OutputFormat) -> Result<()> {
    let graph = super::load_graph(file)?;
    print!("{}", render(&example_instance(&graph), output)?);
    Ok(())
}

/// Emulated instance without status, stamped with the generator version
fn example_instance(graph: &CompiledGraph) -> JsonValue {
    let mut instance = graph.emulated.clone();
    if let Some(object) = instance.as_object_mut() {
        object.remove("status");
    }
    stamp_version(&mut instance);
    instance
}

/// Record the generator version, keeping any annotations already present
fn stamp_version(document: &mut JsonValue) {
    document["metadata"]["annotations"][VERSION_ANNOTATION] = json!(env!("CARGO_PKG_VERSION"));
}

fn render(document: &JsonValue, output: OutputFormat) -> Result<String> {
    match output {
        OutputFormat::Yaml => {
            serde_yaml::to_string(document).map_err(|e| CliError::internal(e.to_string()))
        }
        OutputFormat::Json => serde_json::to_string_pretty(document)
            .map(|mut s| {
                s.push('\n');
                s
            })
            .map_err(|e| CliError::internal(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krg_core::ResourceGraphDefinition;
    use krg_engine::GraphBuilder;

    #[test]
    fn test_example_instance_has_no_status() {
        let rgd = ResourceGraphDefinition::from_yaml(
            r#"
apiVersion: krg.dev/v1alpha1
kind: ResourceGraphDefinition
metadata:
  name: bucket
spec:
  schema:
    apiVersion: v1alpha1
    kind: Bucket
    spec:
      size: integer | default=10
    status:
      configName: ${config.metadata.name}
  resources:
    - id: config
      template:
        apiVersion: v1
        kind: ConfigMap
        metadata:
          name: bucket
        data:
          size: ${schema.spec.size}
"#,
        )
        .unwrap();
        let graph = GraphBuilder::new().compile(&rgd).unwrap();

        let instance = example_instance(&graph);
        assert!(instance.get("status").is_none());
        assert_eq!(instance["spec"]["size"], 10);
        assert_eq!(
            instance["metadata"]["annotations"][VERSION_ANNOTATION],
            env!("CARGO_PKG_VERSION")
        );
    }

    #[test]
    fn test_stamp_keeps_existing_annotations() {
        let mut crd = json!({"metadata": {"name": "buckets.krg.dev", "annotations": {"a": "b"}}});
        stamp_version(&mut crd);
        assert_eq!(crd["metadata"]["annotations"]["a"], "b");
        assert_eq!(
            crd["metadata"]["annotations"][VERSION_ANNOTATION],
            env!("CARGO_PKG_VERSION")
        );
    }

    #[test]
    fn test_render_formats() {
        let document = json!({"kind": "Bucket"});
        assert_eq!(render(&document, OutputFormat::Yaml).unwrap(), "kind: Bucket\n");
        assert_eq!(
            render(&document, OutputFormat::Json).unwrap(),
            "{\n  \"kind\": \"Bucket\"\n}\n"
        );
    }
}
