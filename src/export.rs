//! Graph values handed to external serializers.
//!
//! The analysis never writes graph files itself; it exposes the call
//! graph and the final lock graph as plain labeled digraphs with a marked
//! root subset, ready for a GML/DOT writer or a visualizer.

use petgraph::graph::{Graph, NodeIndex};
use rustc_hash::FxHashMap;

use crate::analysis::callgraph::CallGraph;
use crate::detector::lock::state::LockState;
use crate::program::Program;

pub struct ExportGraph {
    pub graph: Graph<String, String>,
    pub roots: Vec<NodeIndex>,
}

impl ExportGraph {
    pub fn from_call_graph(program: &Program, call_graph: &CallGraph) -> Self {
        let mut graph = Graph::new();
        let mut nodes: FxHashMap<_, NodeIndex> = FxHashMap::default();
        for method in call_graph.methods() {
            nodes.insert(method, graph.add_node(program.describe_method(method)));
        }
        for (caller, callee, sites) in call_graph.edges() {
            let label = sites
                .iter()
                .map(|site| match site {
                    Some(point) => format!("+0x{:x}", point.offset),
                    None => "delegate".to_owned(),
                })
                .collect::<Vec<_>>()
                .join(",");
            graph.add_edge(nodes[&caller], nodes[&callee], label);
        }
        let roots = vec![nodes[&call_graph.entry()]];
        Self { graph, roots }
    }

    pub fn from_lock_state(program: &Program, state: &LockState) -> Self {
        let mut graph = Graph::new();
        let nodes: Vec<NodeIndex> = state
            .graph
            .vertices()
            .iter()
            .map(|vertex| graph.add_node(vertex.describe(program)))
            .collect();
        let position = |acq| {
            state
                .graph
                .vertices()
                .iter()
                .position(|v| v == acq)
                .expect("edge endpoint is a vertex")
        };
        for edge in state.graph.edges() {
            let label = format!("{} -> {}", edge.source.point, edge.target.point);
            graph.add_edge(
                nodes[position(&edge.source)],
                nodes[position(&edge.target)],
                label,
            );
        }
        let roots = state
            .roots
            .iter()
            .map(|root| nodes[position(root)])
            .collect();
        Self { graph, roots }
    }

    /// The same graph with every vertex label shortened for display.
    pub fn shortened(&self) -> Self {
        Self {
            graph: self.graph.map(|_, label| shorten_label(label), |_, label| label.clone()),
            roots: self.roots.clone(),
        }
    }
}

/// Final member segment of a `Namespace.Type::Method` label.
pub fn shorten_label(label: &str) -> String {
    let tail = label.rsplit("::").next().unwrap_or(label);
    tail.rsplit('.').next().unwrap_or(tail).to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_shorten_to_the_member() {
        assert_eq!(shorten_label("App.Deep.Main::Run"), "Run");
        assert_eq!(shorten_label("App.Deep.Main"), "Main");
        assert_eq!(shorten_label("Run"), "Run");
    }
}
