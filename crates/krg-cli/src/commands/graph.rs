//! Graph command - compile an RGD and show its resources in order

use std::path::Path;

use crate::display;
use crate::error::Result;

pub fn run(file: &Path) -> Result<()> {
    let graph = super::load_graph(file)?;
    display::print_graph(&graph);
    Ok(())
}
