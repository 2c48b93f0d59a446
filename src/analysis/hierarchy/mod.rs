//! Class hierarchy of the analyzed program.
//!
//! The hierarchy is a directed graph with an edge from every base class to
//! its derived classes and from every interface to its implementers. Call
//! resolution walks it downward to enumerate the concrete implementations
//! a virtual call site may dispatch to.

use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::Bfs;
use rustc_hash::FxHashMap;

use crate::program::{MethodId, Program, TypeId};

pub struct ClassHierarchy {
    graph: Graph<TypeId, ()>,
    nodes: FxHashMap<TypeId, NodeIndex>,
    // Resolution of a virtual method against a concrete receiver type is
    // hot during call-graph construction, so it is memoized.
    override_cache: FxHashMap<(TypeId, MethodId), Option<MethodId>>,
}

impl ClassHierarchy {
    pub fn new(program: &Program) -> Self {
        let mut graph = Graph::new();
        let mut nodes = FxHashMap::default();
        for ty in program.type_ids() {
            nodes.insert(ty, graph.add_node(ty));
        }
        for ty in program.type_ids() {
            let def = program.type_def(ty);
            if let Some(base) = def.base {
                graph.add_edge(nodes[&base], nodes[&ty], ());
            }
            for &interface in &def.interfaces {
                graph.add_edge(nodes[&interface], nodes[&ty], ());
            }
        }
        Self {
            graph,
            nodes,
            override_cache: FxHashMap::default(),
        }
    }

    /// All types substitutable for `ty`: itself plus every transitively
    /// derived class and interface implementer.
    pub fn subtypes(&self, ty: TypeId) -> Vec<TypeId> {
        let mut result = Vec::new();
        let mut bfs = Bfs::new(&self.graph, self.nodes[&ty]);
        while let Some(node) = bfs.next(&self.graph) {
            result.push(self.graph[node]);
        }
        result
    }

    /// Concrete methods a virtual call to `method` may dispatch to,
    /// considering every subtype of its declaring type. Non-virtual methods
    /// resolve to themselves. The result is sorted for determinism.
    pub fn method_implementations(&mut self, program: &Program, method: MethodId) -> Vec<MethodId> {
        if !program.method(method).is_virtual {
            return vec![method];
        }
        let declaring = program.method(method).declaring_type;
        let mut implementations = Vec::new();
        for ty in self.subtypes(declaring) {
            if program.type_def(ty).is_interface {
                continue;
            }
            if let Some(target) = self.resolve_virtual(program, ty, method) {
                if !program.method(target).is_abstract && !implementations.contains(&target) {
                    implementations.push(target);
                }
            }
        }
        implementations.sort();
        implementations
    }

    /// The implementation a call to `method` dispatches to on a receiver of
    /// exact type `receiver`: the matching declaration nearest in the base
    /// chain.
    pub fn resolve_virtual(
        &mut self,
        program: &Program,
        receiver: TypeId,
        method: MethodId,
    ) -> Option<MethodId> {
        for ty in program.base_chain(receiver) {
            if let Some(found) = self.declared_override(program, ty, method) {
                return Some(found);
            }
        }
        None
    }

    fn declared_override(
        &mut self,
        program: &Program,
        ty: TypeId,
        method: MethodId,
    ) -> Option<MethodId> {
        if let Some(&cached) = self.override_cache.get(&(ty, method)) {
            return cached;
        }
        let wanted = program.method(method);
        let found = program.type_def(ty).methods.iter().copied().find(|&m| {
            let candidate = program.method(m);
            !candidate.is_static
                && candidate.name == wanted.name
                && candidate.params == wanted.params
        });
        self.override_cache.insert((ty, method), found);
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::builder::ProgramBuilder;

    #[test]
    fn virtual_call_resolves_to_all_overrides() {
        let mut pb = ProgramBuilder::new();
        let shape = pb.add_class("App.Shape");
        let circle = pb.add_class_with_base("App.Circle", shape);
        let square = pb.add_class_with_base("App.Square", shape);
        let base_area = pb.declare_virtual_method(shape, "Area", vec![], None);
        let circle_area = pb.declare_virtual_method(circle, "Area", vec![], None);
        let program = pb.finish();

        let mut hierarchy = ClassHierarchy::new(&program);
        let targets = hierarchy.method_implementations(&program, base_area);
        // Square inherits the base implementation; Circle overrides it.
        assert_eq!(targets, vec![base_area, circle_area]);
        assert_eq!(
            hierarchy.resolve_virtual(&program, square, base_area),
            Some(base_area)
        );
        assert_eq!(
            hierarchy.resolve_virtual(&program, circle, base_area),
            Some(circle_area)
        );
    }

    #[test]
    fn interface_call_resolves_to_implementers() {
        let mut pb = ProgramBuilder::new();
        let reader = pb.add_interface("App.IReader");
        let file = pb.add_class("App.FileReader");
        pb.implement_interface(file, reader);
        let decl = pb.declare_abstract_method(reader, "Read", vec![], None);
        let implementation = pb.declare_virtual_method(file, "Read", vec![], None);
        let program = pb.finish();

        let mut hierarchy = ClassHierarchy::new(&program);
        assert_eq!(
            hierarchy.method_implementations(&program, decl),
            vec![implementation]
        );
    }

    #[test]
    fn non_virtual_resolves_to_itself() {
        let mut pb = ProgramBuilder::new();
        let helper = pb.add_class("App.Helper");
        let run = pb.declare_static_method(helper, "Run", vec![], None);
        let program = pb.finish();

        let mut hierarchy = ClassHierarchy::new(&program);
        assert_eq!(hierarchy.method_implementations(&program, run), vec![run]);
    }
}
