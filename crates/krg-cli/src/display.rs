//! Display formatting for CLI output

use console::style;
use krg_engine::{CompiledGraph, Node};

/// Print the compiled graph, one resource per line in topological order
pub fn print_graph(graph: &CompiledGraph) {
    println!(
        "{} {} {}",
        style("→").blue().bold(),
        style(&graph.identity).cyan(),
        style(format!("({})", graph.short_fingerprint())).dim()
    );
    println!();

    for (position, node) in graph.ordered_nodes().enumerate() {
        println!(
            "  {}. {} {}{}",
            position + 1,
            style(&node.id).bold(),
            style(format!("{}/{}", node.identity.api_version(), node.identity.kind)).dim(),
            markers(node)
        );
        let dependencies = graph.dependency_ids(node);
        if !dependencies.is_empty() {
            println!("     depends on: {}", dependencies.join(", "));
        }
    }

    if !graph.status_fields.is_empty() {
        println!();
        println!("{}", style("Status fields:").bold());
        for field in &graph.status_fields {
            println!("  status{} = {}", field.location, field.source);
        }
    }

    println!();
    println!(
        "{} {} resource(s) compiled",
        style("✓").green().bold(),
        graph.nodes.len()
    );
}

fn markers(node: &Node) -> String {
    let mut markers = Vec::new();
    if node.is_conditional() {
        markers.push("conditional");
    }
    if !node.ready_when.is_empty() {
        markers.push("readiness check");
    }
    if markers.is_empty() {
        String::new()
    } else {
        format!(" [{}]", markers.join(", "))
    }
}
