//! Call graph of reachable methods.
//!
//! Nodes are methods, an edge weight is the list of call sites in the
//! caller that may dispatch to the callee. A `None` call site marks an
//! edge synthesized by delegate resolution (there is no call instruction
//! linking a delegate's `Invoke` to its bound target).
//!
//! Two builders are provided. [`ChaCallGraphBuilder`] resolves virtual
//! calls by class-hierarchy analysis, sharpened by a forward type-stack
//! simulation of each method, resolves delegate constructions to their
//! function-pointer targets, and prunes instance methods of types that
//! are never constructed. [`NaiveCallGraphBuilder`] links every call to
//! its statically declared target only.

use std::collections::VecDeque;

use log::{debug, info};
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::{DfsPostOrder, EdgeRef, VisitMap};
use petgraph::Direction;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::hierarchy::ClassHierarchy;
use crate::cancel::CancellationToken;
use crate::error::AnalysisError;
use crate::program::{Instruction, MethodId, Opcode, Program, ProgramPoint, TypeId};

/// A call-site annotation on an edge; `None` for delegate-invoke edges.
pub type CallSite = Option<ProgramPoint>;

pub struct CallGraph {
    entry: MethodId,
    graph: Graph<MethodId, Vec<CallSite>>,
    nodes: FxHashMap<MethodId, NodeIndex>,
}

impl CallGraph {
    fn new(entry: MethodId) -> Self {
        let mut graph = Self {
            entry,
            graph: Graph::new(),
            nodes: FxHashMap::default(),
        };
        graph.ensure_node(entry);
        graph
    }

    pub fn entry(&self) -> MethodId {
        self.entry
    }

    fn ensure_node(&mut self, method: MethodId) -> NodeIndex {
        let graph = &mut self.graph;
        *self
            .nodes
            .entry(method)
            .or_insert_with(|| graph.add_node(method))
    }

    fn add_edge(&mut self, caller: MethodId, callee: MethodId, site: CallSite) {
        let from = self.ensure_node(caller);
        let to = self.ensure_node(callee);
        if let Some(edge) = self.graph.find_edge(from, to) {
            let sites = &mut self.graph[edge];
            if !sites.contains(&site) {
                sites.push(site);
            }
        } else {
            self.graph.add_edge(from, to, vec![site]);
        }
    }

    pub fn contains(&self, method: MethodId) -> bool {
        self.nodes.contains_key(&method)
    }

    pub fn method_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn methods(&self) -> impl Iterator<Item = MethodId> + '_ {
        self.graph.node_indices().map(move |n| self.graph[n])
    }

    /// Methods the call instruction at `site` may dispatch to.
    pub fn candidate_targets(&self, site: ProgramPoint) -> Vec<MethodId> {
        let Some(&node) = self.nodes.get(&site.method) else {
            return Vec::new();
        };
        let mut targets: Vec<MethodId> = self
            .graph
            .edges(node)
            .filter(|edge| edge.weight().contains(&Some(site)))
            .map(|edge| self.graph[edge.target()])
            .collect();
        targets.sort();
        targets.dedup();
        targets
    }

    pub fn callers(&self, method: MethodId) -> Vec<MethodId> {
        let Some(&node) = self.nodes.get(&method) else {
            return Vec::new();
        };
        let mut callers: Vec<MethodId> = self
            .graph
            .edges_directed(node, Direction::Incoming)
            .map(|edge| self.graph[edge.source()])
            .collect();
        callers.sort();
        callers.dedup();
        callers
    }

    pub fn callees(&self, method: MethodId) -> Vec<MethodId> {
        let Some(&node) = self.nodes.get(&method) else {
            return Vec::new();
        };
        let mut callees: Vec<MethodId> = self
            .graph
            .edges(node)
            .map(|edge| self.graph[edge.target()])
            .collect();
        callees.sort();
        callees.dedup();
        callees
    }

    /// Edges as `(caller, callee, sites)` triples, for export.
    pub fn edges(&self) -> impl Iterator<Item = (MethodId, MethodId, &[CallSite])> + '_ {
        self.graph.edge_references().map(move |edge| {
            (
                self.graph[edge.source()],
                self.graph[edge.target()],
                edge.weight().as_slice(),
            )
        })
    }

    /// Methods in DFS finish order from the entry (callees before their
    /// callers, up to cycles), remaining components appended in node order.
    /// Used to seed the interprocedural worklist.
    pub fn bottom_up_order(&self) -> Vec<MethodId> {
        let mut order = Vec::with_capacity(self.graph.node_count());
        let mut dfs = DfsPostOrder::new(&self.graph, self.nodes[&self.entry]);
        while let Some(node) = dfs.next(&self.graph) {
            order.push(self.graph[node]);
        }
        for node in self.graph.node_indices() {
            if !dfs.discovered.is_visited(&node) {
                dfs.move_to(node);
                while let Some(found) = dfs.next(&self.graph) {
                    order.push(self.graph[found]);
                }
            }
        }
        order
    }

    /// Targets of delegate-invoke edges whose delegate is one of the
    /// known threading callback types. These run on their own thread and
    /// become program roots alongside the entry method.
    pub fn delegate_thread_roots(&self, program: &Program) -> Vec<MethodId> {
        let mut roots = Vec::new();
        for method in self.methods() {
            let def = program.method(method);
            if def.name != "Invoke" || !program.is_threading_delegate(def.declaring_type) {
                continue;
            }
            for target in self.callees(method) {
                if !roots.contains(&target) {
                    roots.push(target);
                }
            }
        }
        roots.sort();
        roots
    }

    /// Reachable static constructors; they may run concurrently with any
    /// thread and are merged as program roots.
    pub fn static_initializers(&self, program: &Program) -> Vec<MethodId> {
        let mut roots: Vec<MethodId> = self
            .methods()
            .filter(|&m| {
                let def = program.method(m);
                def.is_static && def.is_constructor
            })
            .collect();
        roots.sort();
        roots
    }

    fn retain(&mut self, keep: &FxHashSet<MethodId>) {
        let mut graph = Graph::new();
        let mut nodes = FxHashMap::default();
        for node in self.graph.node_indices() {
            let method = self.graph[node];
            if keep.contains(&method) {
                nodes.insert(method, graph.add_node(method));
            }
        }
        for edge in self.graph.edge_references() {
            let source = self.graph[edge.source()];
            let target = self.graph[edge.target()];
            if let (Some(&from), Some(&to)) = (nodes.get(&source), nodes.get(&target)) {
                graph.add_edge(from, to, edge.weight().clone());
            }
        }
        self.graph = graph;
        self.nodes = nodes;
    }
}

/// What the type-stack simulation knows about one evaluation-stack slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SimValue {
    Type(TypeId),
    Function(MethodId),
    Unknown,
}

/// Forward type-stack simulation of one method body. Walks the
/// instruction stream linearly, calling `visit` with the stack as it
/// stands before each instruction. Best-effort only: control flow is
/// ignored and underflow reads as unknown, which degrades virtual-call
/// resolution to the declared type rather than failing.
fn simulate_stack<F>(program: &Program, method: MethodId, mut visit: F)
where
    F: FnMut(&Instruction, &[SimValue]),
{
    let def = program.method(method);
    let Some(body) = def.body.as_ref() else {
        return;
    };
    let mut stack: Vec<SimValue> = Vec::new();
    let pop = |stack: &mut Vec<SimValue>| stack.pop().unwrap_or(SimValue::Unknown);

    for instruction in &body.instructions {
        visit(instruction, &stack);
        match &instruction.opcode {
            Opcode::Nop
            | Opcode::Branch(_)
            | Opcode::Leave(_)
            | Opcode::EndFinally
            | Opcode::Return => {}
            Opcode::LoadConst | Opcode::UnaryOp => {
                if matches!(instruction.opcode, Opcode::UnaryOp) {
                    pop(&mut stack);
                }
                stack.push(SimValue::Unknown);
            }
            Opcode::LoadString => stack.push(SimValue::Type(program.well_known().string)),
            Opcode::LoadArg(index) => {
                let slot = *index as usize;
                let ty = if def.has_this() {
                    if slot == 0 {
                        Some(def.declaring_type)
                    } else {
                        def.params.get(slot - 1).copied()
                    }
                } else {
                    def.params.get(slot).copied()
                };
                stack.push(ty.map_or(SimValue::Unknown, SimValue::Type));
            }
            Opcode::LoadLocal(index) => {
                let ty = body.locals.get(*index as usize).copied();
                stack.push(ty.map_or(SimValue::Unknown, SimValue::Type));
            }
            Opcode::StoreLocal(_) | Opcode::Pop | Opcode::Throw | Opcode::BranchIf(_) => {
                pop(&mut stack);
            }
            Opcode::Switch(_) => {
                pop(&mut stack);
            }
            Opcode::LoadField(field) => {
                pop(&mut stack);
                stack.push(SimValue::Type(program.field(*field).ty));
            }
            Opcode::LoadStaticField(field) => {
                stack.push(SimValue::Type(program.field(*field).ty));
            }
            Opcode::StoreField(_) => {
                pop(&mut stack);
                pop(&mut stack);
            }
            Opcode::StoreStaticField(_) => {
                pop(&mut stack);
            }
            Opcode::LoadElement => {
                pop(&mut stack);
                let array = pop(&mut stack);
                let element = match array {
                    SimValue::Type(ty) => program.type_def(ty).element,
                    _ => None,
                };
                stack.push(element.map_or(SimValue::Unknown, SimValue::Type));
            }
            Opcode::StoreElement => {
                pop(&mut stack);
                pop(&mut stack);
                pop(&mut stack);
            }
            Opcode::LoadToken(_) => stack.push(SimValue::Type(program.well_known().type_type)),
            Opcode::LoadFunction(target) => stack.push(SimValue::Function(*target)),
            Opcode::NewObject(ctor) => {
                for _ in 0..program.method(*ctor).params.len() {
                    pop(&mut stack);
                }
                stack.push(SimValue::Type(program.method(*ctor).declaring_type));
            }
            Opcode::NewArray(element) => {
                pop(&mut stack);
                let array = program
                    .type_ids()
                    .find(|&ty| program.type_def(ty).element == Some(*element));
                stack.push(array.map_or(SimValue::Unknown, SimValue::Type));
            }
            Opcode::Call(target) | Opcode::CallVirtual(target) => {
                let callee = program.method(*target);
                for _ in 0..callee.arity() {
                    pop(&mut stack);
                }
                if let Some(ret) = callee.return_type {
                    stack.push(SimValue::Type(ret));
                }
            }
            Opcode::CastClass(ty) | Opcode::IsInstance(ty) => {
                pop(&mut stack);
                stack.push(SimValue::Type(*ty));
            }
            Opcode::Dup => {
                let top = stack.last().copied().unwrap_or(SimValue::Unknown);
                stack.push(top);
            }
            Opcode::BinaryOp => {
                pop(&mut stack);
                pop(&mut stack);
                stack.push(SimValue::Unknown);
            }
            Opcode::Unknown => stack.clear(),
        }
    }
}

/// One resolved call found while scanning a method body.
struct ResolvedCall {
    site: ProgramPoint,
    targets: Vec<MethodId>,
}

pub struct ChaCallGraphBuilder<'p> {
    program: &'p Program,
    hierarchy: ClassHierarchy,
    token: CancellationToken,
}

impl<'p> ChaCallGraphBuilder<'p> {
    pub fn new(program: &'p Program, token: CancellationToken) -> Self {
        Self {
            program,
            hierarchy: ClassHierarchy::new(program),
            token,
        }
    }

    pub fn build(mut self, entry: MethodId) -> Result<CallGraph, AnalysisError> {
        let mut graph = CallGraph::new(entry);
        let mut instantiated: FxHashSet<TypeId> = FxHashSet::default();
        let mut visited: FxHashSet<MethodId> = FxHashSet::default();
        let mut worklist: VecDeque<MethodId> = VecDeque::new();
        worklist.push_back(entry);
        visited.insert(entry);

        while let Some(method) = worklist.pop_front() {
            self.token.check()?;
            graph.ensure_node(method);
            self.enqueue_static_ctor(method, &mut worklist, &mut visited);
            let (calls, function_loads) = self.scan_method(method, &mut instantiated);
            for call in calls {
                for target in call.targets {
                    graph.add_edge(method, target, Some(call.site));
                    if visited.insert(target) {
                        worklist.push_back(target);
                    }
                }
            }
            // Function-pointer targets are explored even before any
            // delegate links them, so resolution below finds their nodes.
            for target in function_loads {
                if visited.insert(target) {
                    worklist.push_back(target);
                }
            }
        }

        self.resolve_delegates(&mut graph)?;
        self.prune_dead_instance_methods(&mut graph, &instantiated);
        info!(
            "call graph: {} reachable methods from {}",
            graph.method_count(),
            self.program.describe_method(entry)
        );
        Ok(graph)
    }

    fn enqueue_static_ctor(
        &self,
        method: MethodId,
        worklist: &mut VecDeque<MethodId>,
        visited: &mut FxHashSet<MethodId>,
    ) {
        let declaring = self.program.method(method).declaring_type;
        let cctor = self
            .program
            .type_def(declaring)
            .methods
            .iter()
            .copied()
            .find(|&m| {
                let def = self.program.method(m);
                def.is_static && def.is_constructor
            });
        if let Some(cctor) = cctor {
            if visited.insert(cctor) {
                worklist.push_back(cctor);
            }
        }
    }

    fn scan_method(
        &mut self,
        method: MethodId,
        instantiated: &mut FxHashSet<TypeId>,
    ) -> (Vec<ResolvedCall>, Vec<MethodId>) {
        // Receiver types are captured during the simulation and resolved
        // against the hierarchy afterwards.
        let mut direct: Vec<(ProgramPoint, MethodId)> = Vec::new();
        let mut virtuals: Vec<(ProgramPoint, MethodId, Option<TypeId>)> = Vec::new();
        let mut function_loads: Vec<MethodId> = Vec::new();
        let program = self.program;
        simulate_stack(program, method, |instruction, stack| {
            let site = ProgramPoint::new(method, instruction.offset);
            match instruction.opcode {
                Opcode::Call(target) => direct.push((site, target)),
                Opcode::NewObject(ctor) => {
                    instantiated.insert(program.method(ctor).declaring_type);
                    direct.push((site, ctor));
                }
                Opcode::CallVirtual(target) => {
                    let arity = program.method(target).arity();
                    let receiver = stack
                        .len()
                        .checked_sub(arity)
                        .and_then(|slot| stack.get(slot))
                        .and_then(|value| match value {
                            SimValue::Type(ty) => Some(*ty),
                            _ => None,
                        });
                    virtuals.push((site, target, receiver));
                }
                Opcode::LoadFunction(target) => function_loads.push(target),
                _ => {}
            }
        });

        let mut calls: Vec<ResolvedCall> = direct
            .into_iter()
            .map(|(site, target)| ResolvedCall {
                site,
                targets: vec![target],
            })
            .collect();
        for (site, declared, receiver) in virtuals {
            let targets = match receiver {
                Some(ty) => self.implementations_below(ty, declared),
                None => self.hierarchy.method_implementations(self.program, declared),
            };
            let targets = if targets.is_empty() {
                debug!(
                    "no implementation found for {} at {}",
                    self.program.describe_method(declared),
                    site
                );
                vec![declared]
            } else {
                targets
            };
            calls.push(ResolvedCall { site, targets });
        }
        (calls, function_loads)
    }

    /// Implementations of `declared` on receivers statically known to be
    /// of type `ty` or a subtype.
    fn implementations_below(&mut self, ty: TypeId, declared: MethodId) -> Vec<MethodId> {
        if !self.program.method(declared).is_virtual {
            return vec![declared];
        }
        let mut targets = Vec::new();
        for subtype in self.hierarchy.subtypes(ty) {
            if self.program.type_def(subtype).is_interface {
                continue;
            }
            if let Some(found) = self.hierarchy.resolve_virtual(self.program, subtype, declared) {
                if !self.program.method(found).is_abstract && !targets.contains(&found) {
                    targets.push(found);
                }
            }
        }
        targets.sort();
        targets
    }

    /// Link every delegate's `Invoke` to the function pointers it is
    /// constructed over, found by re-simulating each constructing method.
    fn resolve_delegates(&mut self, graph: &mut CallGraph) -> Result<(), AnalysisError> {
        let methods: Vec<MethodId> = graph.methods().collect();
        let mut links: Vec<(TypeId, MethodId)> = Vec::new();
        let program = self.program;
        for method in methods {
            self.token.check()?;
            simulate_stack(program, method, |instruction, stack| {
                if let Opcode::NewObject(ctor) = instruction.opcode {
                    let delegate = program.method(ctor).declaring_type;
                    if !program.type_def(delegate).is_delegate {
                        return;
                    }
                    // Delegate ctor arguments are (target, fnptr); the
                    // function pointer is on top.
                    if let Some(SimValue::Function(target)) = stack.last().copied() {
                        links.push((delegate, target));
                    }
                }
            });
        }
        for (delegate, target) in links {
            let invoke = self
                .program
                .type_def(delegate)
                .methods
                .iter()
                .copied()
                .find(|&m| self.program.method(m).name == "Invoke");
            if let Some(invoke) = invoke {
                debug!(
                    "delegate {} invokes {}",
                    self.program.type_def(delegate).name,
                    self.program.describe_method(target)
                );
                graph.add_edge(invoke, target, None);
            }
        }
        Ok(())
    }

    /// Instance methods of types never constructed anywhere reachable can
    /// never run; drop them.
    fn prune_dead_instance_methods(
        &self,
        graph: &mut CallGraph,
        instantiated: &FxHashSet<TypeId>,
    ) {
        let keep: FxHashSet<MethodId> = graph
            .methods()
            .filter(|&method| {
                let def = self.program.method(method);
                method == graph.entry()
                    || !def.has_this()
                    || instantiated.contains(&def.declaring_type)
            })
            .collect();
        if keep.len() != graph.method_count() {
            debug!(
                "pruning {} dead instance methods",
                graph.method_count() - keep.len()
            );
            graph.retain(&keep);
        }
    }
}

/// Cheap mode: every call resolves to its statically declared target.
pub struct NaiveCallGraphBuilder<'p> {
    program: &'p Program,
    token: CancellationToken,
}

impl<'p> NaiveCallGraphBuilder<'p> {
    pub fn new(program: &'p Program, token: CancellationToken) -> Self {
        Self { program, token }
    }

    pub fn build(self, entry: MethodId) -> Result<CallGraph, AnalysisError> {
        let mut graph = CallGraph::new(entry);
        let mut visited: FxHashSet<MethodId> = FxHashSet::default();
        let mut worklist: VecDeque<MethodId> = VecDeque::new();
        worklist.push_back(entry);
        visited.insert(entry);
        while let Some(method) = worklist.pop_front() {
            self.token.check()?;
            graph.ensure_node(method);
            let Some(body) = self.program.method(method).body.as_ref() else {
                continue;
            };
            for instruction in &body.instructions {
                let target = match instruction.opcode {
                    Opcode::Call(t) | Opcode::CallVirtual(t) | Opcode::NewObject(t) => t,
                    _ => continue,
                };
                graph.add_edge(
                    method,
                    target,
                    Some(ProgramPoint::new(method, instruction.offset)),
                );
                if visited.insert(target) {
                    worklist.push_back(target);
                }
            }
        }
        info!("naive call graph: {} reachable methods", graph.method_count());
        Ok(graph)
    }
}
