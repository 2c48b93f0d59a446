//! Deadlock detection over the lock acquisition graph.
//!
//! The interprocedural analysis produces a program-level lock graph; this
//! module extracts candidate deadlocks from it. A candidate is a minimal
//! 2-cycle: a DFS back edge u->v whose reverse ordering v->u is also
//! recorded. Candidates whose two entry paths are provably covered by a
//! common dominator lock are suppressed as false positives.

pub mod interproc;
pub(crate) mod intraproc;
pub mod report;
pub mod state;

use log::{debug, info};
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::{depth_first_search, Control, DfsEvent, EdgeRef};
use petgraph::Direction;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::detector::report::{Report, ReportContent};
use crate::program::Program;
use report::DeadlockDiagnosis;
use state::{LockAcquisition, LockState};

pub use interproc::{InterproceduralLockAnalysis, ProgramLockSummary};

struct LeadingSubgraph {
    nodes: FxHashSet<NodeIndex>,
    edges: Vec<(NodeIndex, NodeIndex)>,
}

pub struct DeadlockDetector<'p> {
    program: &'p Program,
}

impl<'p> DeadlockDetector<'p> {
    pub fn new(program: &'p Program) -> Self {
        Self { program }
    }

    pub fn detect(&self, state: &LockState) -> Vec<Report> {
        let vertices = state.graph.vertices();
        let mut graph: Graph<usize, ()> = Graph::new();
        let nodes: Vec<NodeIndex> = (0..vertices.len()).map(|i| graph.add_node(i)).collect();
        let position = |acq: &LockAcquisition| vertices.iter().position(|v| v == acq);
        for edge in state.graph.edges() {
            if let (Some(s), Some(t)) = (position(&edge.source), position(&edge.target)) {
                graph.add_edge(nodes[s], nodes[t], ());
            }
        }
        let root_nodes: Vec<NodeIndex> = state
            .roots
            .iter()
            .filter_map(|root| position(root))
            .map(|i| nodes[i])
            .collect();

        // Classify edges by a DFS forest grown from the roots.
        let mut back_edges: Vec<(NodeIndex, NodeIndex)> = Vec::new();
        let mut forward: FxHashSet<(NodeIndex, NodeIndex)> = FxHashSet::default();
        depth_first_search(&graph, root_nodes.iter().copied(), |event| {
            match event {
                DfsEvent::BackEdge(u, v) => back_edges.push((u, v)),
                DfsEvent::TreeEdge(u, v) | DfsEvent::CrossForwardEdge(u, v) => {
                    forward.insert((u, v));
                }
                _ => {}
            }
            Control::<()>::Continue
        });

        let lock_roots: FxHashSet<NodeIndex> = root_nodes.into_iter().collect();
        let mut seen: FxHashSet<(NodeIndex, NodeIndex)> = FxHashSet::default();
        let mut reports = Vec::new();
        for (u, v) in back_edges {
            // A candidate needs the reverse ordering recorded too.
            if graph.find_edge(v, u).is_none() {
                continue;
            }
            let key = if u < v { (u, v) } else { (v, u) };
            if !seen.insert(key) {
                continue;
            }
            let leading = self.leading_subgraph(&graph, &forward, u, v);
            if self.guarded(&leading, &lock_roots, u, v) {
                debug!(
                    "2-cycle between {} and {} suppressed by a common guard lock",
                    vertices[graph[u]].describe(self.program),
                    vertices[graph[v]].describe(self.program)
                );
                continue;
            }
            let first = &vertices[graph[u]];
            let second = &vertices[graph[v]];
            let leading_edges = leading
                .edges
                .iter()
                .map(|&(p, q)| {
                    (
                        vertices[graph[p]].describe(self.program),
                        vertices[graph[q]].describe(self.program),
                    )
                })
                .collect();
            let diagnosis = DeadlockDiagnosis::new(
                first.object.describe(self.program),
                first.point.describe(self.program),
                second.object.describe(self.program),
                second.point.describe(self.program),
                leading_edges,
            );
            reports.push(Report::Deadlock(ReportContent::new(
                "Deadlock".to_owned(),
                "Possibly".to_owned(),
                diagnosis,
                "The two locks are acquired in opposite orders on paths that \
                 may run concurrently; neither path holds a common guard lock."
                    .to_owned(),
            )));
        }
        info!("deadlock extraction: {} report(s)", reports.len());
        reports
    }

    /// Everything that must already be held to reach the cycle {u, v}:
    /// backward reachability over tree/forward/cross edges, excluding the
    /// cycle's own pair of edges.
    fn leading_subgraph(
        &self,
        graph: &Graph<usize, ()>,
        forward: &FxHashSet<(NodeIndex, NodeIndex)>,
        u: NodeIndex,
        v: NodeIndex,
    ) -> LeadingSubgraph {
        let excluded = |p: NodeIndex, q: NodeIndex| (p == u && q == v) || (p == v && q == u);
        let mut nodes: FxHashSet<NodeIndex> = [u, v].into_iter().collect();
        let mut queue: Vec<NodeIndex> = vec![u, v];
        while let Some(n) = queue.pop() {
            for edge in graph.edges_directed(n, Direction::Incoming) {
                let p = edge.source();
                if excluded(p, n) || !forward.contains(&(p, n)) {
                    continue;
                }
                if nodes.insert(p) {
                    queue.push(p);
                }
            }
        }
        let edges: Vec<(NodeIndex, NodeIndex)> = graph
            .edge_references()
            .map(|edge| (edge.source(), edge.target()))
            .filter(|&(p, q)| {
                nodes.contains(&p)
                    && nodes.contains(&q)
                    && forward.contains(&(p, q))
                    && !excluded(p, q)
            })
            .collect();
        LeadingSubgraph { nodes, edges }
    }

    /// Dominator-based guard test over the leading subgraph. A node's
    /// dominator set is the intersection of its predecessors' sets plus
    /// itself; lock roots dominate only themselves. If the sets of u and
    /// v intersect, every path into the cycle holds a common lock and the
    /// cycle cannot deadlock.
    fn guarded(
        &self,
        leading: &LeadingSubgraph,
        lock_roots: &FxHashSet<NodeIndex>,
        u: NodeIndex,
        v: NodeIndex,
    ) -> bool {
        let mut predecessors: FxHashMap<NodeIndex, Vec<NodeIndex>> = FxHashMap::default();
        for &(p, q) in &leading.edges {
            predecessors.entry(q).or_default().push(p);
        }
        let mut dominators: FxHashMap<NodeIndex, FxHashSet<NodeIndex>> = leading
            .nodes
            .iter()
            .map(|&n| {
                let set = if lock_roots.contains(&n) {
                    [n].into_iter().collect()
                } else {
                    leading.nodes.clone()
                };
                (n, set)
            })
            .collect();
        loop {
            let mut changed = false;
            for &n in &leading.nodes {
                if lock_roots.contains(&n) {
                    continue;
                }
                let Some(preds) = predecessors.get(&n) else {
                    continue;
                };
                let mut next: FxHashSet<NodeIndex> = dominators[&preds[0]].clone();
                for p in &preds[1..] {
                    let other = &dominators[p];
                    next.retain(|d| other.contains(d));
                }
                next.insert(n);
                if next != dominators[&n] {
                    dominators.insert(n, next);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        dominators[&u].intersection(&dominators[&v]).next().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::state::LockGraph;
    use super::*;
    use crate::analysis::heap::HeapObject;
    use crate::program::builder::ProgramBuilder;
    use crate::program::{MethodId, ProgramPoint, TypeId};

    fn acq(method: MethodId, offset: u32, ty: TypeId) -> LockAcquisition {
        LockAcquisition {
            point: ProgramPoint::new(method, offset),
            object: HeapObject::TypeOf(ty),
        }
    }

    fn two_lock_fixture() -> (crate::program::Program, MethodId, TypeId, TypeId) {
        let mut pb = ProgramBuilder::new();
        let a = pb.add_class("App.A");
        let b = pb.add_class("App.B");
        let holder = pb.add_class("App.Holder");
        let m = pb.declare_static_method(holder, "M", vec![], None);
        (pb.finish(), m, a, b)
    }

    #[test]
    fn opposed_orderings_are_reported() {
        let (program, m, ta, tb) = two_lock_fixture();
        let a = acq(m, 0, ta);
        let b = acq(m, 1, tb);
        let mut state = LockState::without_variables();
        state.roots = vec![a.clone(), b.clone()];
        let mut graph = LockGraph::default();
        graph.add_edge(a.clone(), b.clone());
        graph.add_edge(b.clone(), a.clone());
        state.graph = graph;

        let reports = DeadlockDetector::new(&program).detect(&state);
        assert_eq!(reports.len(), 1);
    }

    #[test]
    fn common_guard_suppresses_the_cycle() {
        let mut pb = ProgramBuilder::new();
        let ta = pb.add_class("App.A");
        let tb = pb.add_class("App.B");
        let tc = pb.add_class("App.C");
        let holder = pb.add_class("App.Holder");
        let m = pb.declare_static_method(holder, "M", vec![], None);
        let program = pb.finish();

        let a = acq(m, 0, ta);
        let b = acq(m, 1, tb);
        let c = acq(m, 2, tc);
        let mut state = LockState::without_variables();
        state.roots = vec![c.clone()];
        let mut graph = LockGraph::default();
        graph.add_edge(c.clone(), b.clone());
        graph.add_edge(b.clone(), a.clone());
        graph.add_edge(c.clone(), a.clone());
        graph.add_edge(a.clone(), b.clone());
        state.graph = graph;

        let reports = DeadlockDetector::new(&program).detect(&state);
        assert!(reports.is_empty());
    }

    #[test]
    fn one_directional_ordering_is_no_cycle() {
        let (program, m, ta, tb) = two_lock_fixture();
        let a = acq(m, 0, ta);
        let b = acq(m, 1, tb);
        let mut state = LockState::without_variables();
        state.roots = vec![a.clone()];
        let mut graph = LockGraph::default();
        graph.add_edge(a.clone(), b.clone());
        state.graph = graph;

        let reports = DeadlockDetector::new(&program).detect(&state);
        assert!(reports.is_empty());
    }
}
