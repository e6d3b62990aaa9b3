//! CLI commands

pub mod controller;
pub mod generate;
pub mod graph;

use krg_core::ResourceGraphDefinition;
use krg_engine::{CompiledGraph, GraphBuilder};
use std::path::Path;

use crate::error::{CliError, Result};

/// Load a ResourceGraphDefinition file and compile it
pub fn load_graph(path: &Path) -> Result<CompiledGraph> {
    let rgd = ResourceGraphDefinition::from_file(path)?;
    if rgd.spec.schema.kind.is_empty() {
        return Err(CliError::definition_with_help(
            format!("{}: spec.schema.kind is empty", path.display()),
            "name the new type, e.g. `kind: WebApp`",
        ));
    }
    Ok(GraphBuilder::new().compile(&rgd)?)
}
