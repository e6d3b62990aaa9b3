//! Arena-backed dependency graph
//!
//! Nodes live in a `Vec` in declaration order and edges are index sets, so
//! every traversal is deterministic for a given input order.

use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Colour {
    Unvisited,
    InProgress,
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct Dag {
    ids: Vec<String>,
    /// `dependencies[i]` holds the nodes `i` depends on
    dependencies: Vec<BTreeSet<usize>>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node and return its index
    pub fn add_node(&mut self, id: impl Into<String>) -> usize {
        self.ids.push(id.into());
        self.dependencies.push(BTreeSet::new());
        self.ids.len() - 1
    }

    /// Record that `node` depends on `on`
    pub fn add_dependency(&mut self, node: usize, on: usize) {
        self.dependencies[node].insert(on);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, index: usize) -> &str {
        &self.ids[index]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|x| x == id)
    }

    pub fn dependencies(&self, index: usize) -> &BTreeSet<usize> {
        &self.dependencies[index]
    }

    /// Nodes that depend on `index`
    pub fn dependents(&self, index: usize) -> BTreeSet<usize> {
        (0..self.len())
            .filter(|&n| self.dependencies[n].contains(&index))
            .collect()
    }

    /// First cycle found by a depth-first walk in declaration order
    ///
    /// Members are returned in encounter order, starting at the node the walk
    /// re-entered.
    pub fn find_cycle(&self) -> Option<Vec<usize>> {
        let mut colours = vec![Colour::Unvisited; self.len()];
        let mut stack = Vec::new();

        for start in 0..self.len() {
            if colours[start] == Colour::Unvisited {
                if let Some(cycle) = self.visit(start, &mut colours, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit(&self, node: usize, colours: &mut [Colour], stack: &mut Vec<usize>) -> Option<Vec<usize>> {
        colours[node] = Colour::InProgress;
        stack.push(node);

        for &dep in &self.dependencies[node] {
            match colours[dep] {
                Colour::InProgress => {
                    let from = stack.iter().position(|&n| n == dep).unwrap_or(0);
                    return Some(stack[from..].to_vec());
                }
                Colour::Unvisited => {
                    if let Some(cycle) = self.visit(dep, colours, stack) {
                        return Some(cycle);
                    }
                }
                Colour::Done => {}
            }
        }

        stack.pop();
        colours[node] = Colour::Done;
        None
    }

    /// Kahn's algorithm, ties broken by declaration order
    ///
    /// Returns the cycle when the graph is not a DAG.
    pub fn topological_order(&self) -> Result<Vec<usize>, Vec<usize>> {
        if let Some(cycle) = self.find_cycle() {
            return Err(cycle);
        }

        let mut remaining: Vec<usize> = self.dependencies.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.len()).filter(|&n| remaining[n] == 0).collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(node) = ready.pop_first() {
            order.push(node);
            for dependent in self.dependents(node) {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        Ok(order)
    }
}
