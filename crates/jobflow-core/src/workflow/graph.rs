//! Step graph analysis: reachability and cycle bounds.
//!
//! Uses `petgraph` to model step transitions as a directed graph. Strongly
//! connected components identify loops. Every cycle must pass through a step
//! with a `max_visits` bound so every run terminates: once the bounded steps
//! are removed, no cycle may remain.

use std::collections::{HashMap, HashSet};

use jobflow_types::workflow::WorkflowDefinition;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;

use super::definition::WorkflowError;

/// Result of analysing a definition's step graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphReport {
    /// Steps that no path from `start_at` reaches, in declaration order.
    pub unreachable: Vec<String>,
    /// Each bounded loop, as the step names of its component.
    pub loops: Vec<Vec<String>>,
}

/// Build the transition graph, keyed by step name.
fn build_graph(def: &WorkflowDefinition) -> (DiGraph<&str, ()>, HashMap<&str, NodeIndex>) {
    let mut graph = DiGraph::<&str, ()>::new();
    let index: HashMap<&str, NodeIndex> = def
        .steps
        .iter()
        .map(|s| (s.name.as_str(), graph.add_node(s.name.as_str())))
        .collect();

    for step in &def.steps {
        let from = index[step.name.as_str()];
        for target in step.successors() {
            if let Some(&to) = index.get(target) {
                graph.update_edge(from, to, ());
            }
        }
    }
    (graph, index)
}

fn is_loop(graph: &DiGraph<&str, ()>, component: &[NodeIndex]) -> bool {
    component.len() > 1
        || component
            .first()
            .is_some_and(|&n| graph.contains_edge(n, n))
}

fn sorted_names(graph: &DiGraph<&str, ()>, component: &[NodeIndex]) -> Vec<String> {
    let mut names: Vec<String> = component.iter().map(|&n| graph[n].to_string()).collect();
    names.sort();
    names
}

/// Analyse the step graph of a definition whose successors all resolve.
///
/// Fails with [`WorkflowError::UnboundedCycle`] when some cycle avoids every
/// step that declares `max_visits`.
pub fn analyze(def: &WorkflowDefinition) -> Result<GraphReport, WorkflowError> {
    let (graph, index) = build_graph(def);
    let bounded: HashSet<&str> = def
        .steps
        .iter()
        .filter(|s| s.max_visits.is_some())
        .map(|s| s.name.as_str())
        .collect();

    // Whatever loops survive without the bounded steps can spin forever.
    let unbounded = graph.filter_map(
        |_, &name| (!bounded.contains(name)).then_some(name),
        |_, &()| Some(()),
    );
    for component in tarjan_scc(&unbounded) {
        if is_loop(&unbounded, &component) {
            return Err(WorkflowError::UnboundedCycle(format!(
                "steps [{}] form a loop with no max_visits bound",
                sorted_names(&unbounded, &component).join(", ")
            )));
        }
    }

    let loops = tarjan_scc(&graph)
        .into_iter()
        .filter(|component| is_loop(&graph, component))
        .map(|component| sorted_names(&graph, &component))
        .collect();

    let mut unreachable = Vec::new();
    if let Some(&start) = index.get(def.start_at.as_str()) {
        let mut seen = vec![false; graph.node_count()];
        let mut dfs = Dfs::new(&graph, start);
        while let Some(node) = dfs.next(&graph) {
            seen[node.index()] = true;
        }
        unreachable = def
            .steps
            .iter()
            .filter(|s| !seen[index[s.name.as_str()].index()])
            .map(|s| s.name.clone())
            .collect();
    }

    Ok(GraphReport { unreachable, loops })
}
