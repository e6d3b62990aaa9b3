//! Integration tests for CLI commands

use std::io::Write;
use std::process::Command;

/// Helper to run the krg binary
fn krg(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_krg"))
        .args(args)
        .output()
        .expect("Failed to execute krg")
}

/// Get the path of a fixture file
fn fixture(name: &str) -> String {
    format!("{}/../../fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
}

mod generate_command {
    use super::*;

    #[test]
    fn test_generate_crd_yaml() {
        let output = krg(&["generate", "crd", "-f", &fixture("webapp.yaml")]);
        assert!(output.status.success(), "Expected success for valid RGD");

        let crd: serde_json::Value = serde_yaml::from_slice(&output.stdout).unwrap();
        assert_eq!(crd["kind"], "CustomResourceDefinition");
        assert_eq!(crd["metadata"]["name"], "webapps.krg.dev");
        assert_eq!(crd["spec"]["names"]["kind"], "WebApp");
        assert_eq!(
            crd["metadata"]["annotations"]["krg.dev/version"],
            env!("CARGO_PKG_VERSION")
        );

        let version = &crd["spec"]["versions"][0];
        assert_eq!(version["name"], "v1alpha1");
        let spec = &version["schema"]["openAPIV3Schema"]["properties"]["spec"];
        assert_eq!(spec["properties"]["replicas"]["default"], 3);
        assert_eq!(spec["required"][0], "name");
    }

    #[test]
    fn test_generate_crd_json() {
        let output = krg(&["generate", "crd", "-f", &fixture("webapp.yaml"), "-o", "json"]);
        assert!(output.status.success());

        let crd: serde_json::Value =
            serde_json::from_slice(&output.stdout).expect("Output should be valid JSON");
        assert_eq!(crd["spec"]["group"], "krg.dev");
    }

    #[test]
    fn test_generate_instance() {
        let output = krg(&["generate", "instance", "-f", &fixture("webapp.yaml")]);
        assert!(output.status.success());

        let instance: serde_json::Value = serde_yaml::from_slice(&output.stdout).unwrap();
        assert_eq!(instance["apiVersion"], "krg.dev/v1alpha1");
        assert_eq!(instance["kind"], "WebApp");
        assert_eq!(instance["spec"]["replicas"], 3);
        assert_eq!(instance["spec"]["withCache"], false);
        assert!(instance.get("status").is_none());
        assert_eq!(
            instance["metadata"]["annotations"]["krg.dev/version"],
            env!("CARGO_PKG_VERSION")
        );
    }
}

mod graph_command {
    use super::*;

    #[test]
    fn test_graph_prints_topological_order() {
        let output = krg(&["graph", "-f", &fixture("webapp.yaml")]);
        assert!(output.status.success());

        let stdout = String::from_utf8_lossy(&output.stdout);
        let database = stdout.find("1. database").expect("database listed first");
        let app = stdout.find(". app ").expect("app listed");
        assert!(database < app);
        assert!(stdout.contains("depends on: database"));
        assert!(stdout.contains("[conditional]"));
        assert!(stdout.contains("status.endpoint"));
        assert!(stdout.contains("3 resource(s) compiled"));
    }
}

mod errors {
    use super::*;

    #[test]
    fn test_undeclared_reference_fails_with_compile_code() {
        let output = krg(&["graph", "-f", &fixture("ghost-reference.yaml")]);
        assert_eq!(output.status.code(), Some(3));

        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("databse"));
        assert!(stderr.contains("database"), "Expected a suggestion: {}", stderr);
    }

    #[test]
    fn test_cycle_fails_with_compile_code() {
        let output = krg(&["generate", "crd", "-f", &fixture("cycle.yaml")]);
        assert_eq!(output.status.code(), Some(3));

        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("cycle"));
        assert!(output.stdout.is_empty());
    }

    #[test]
    fn test_missing_file() {
        let output = krg(&["graph", "-f", "/nonexistent/rgd.yaml"]);
        assert_eq!(output.status.code(), Some(5));
    }

    #[test]
    fn test_unparseable_definition() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "metadata: [not, a, map").unwrap();

        let output = krg(&["graph", "-f", file.path().to_str().unwrap()]);
        assert_eq!(output.status.code(), Some(2));
    }

    #[test]
    fn test_invalid_controller_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "workersPerType: 0").unwrap();

        let output = krg(&["controller", "--config", file.path().to_str().unwrap()]);
        assert_eq!(output.status.code(), Some(4));
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("worker"));
    }
}
