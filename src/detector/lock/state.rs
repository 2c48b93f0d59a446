//! Abstract state of the lock analysis.
//!
//! A [`LockState`] is the per-program-point lattice element: the stack of
//! currently-held acquisitions, the set of root acquisitions, the lock
//! graph accumulated so far, the waited-on objects, and the symbolic
//! variable state driving operand resolution. States are cloned at CFG
//! branches and merged at joins; the converged, compacted exit state of a
//! method is its summary.

use std::hash::{Hash, Hasher};

use log::debug;

use crate::analysis::heap::HeapObject;
use crate::program::{MethodId, Program, ProgramPoint};

/// One lock acquisition: the `Enter` site and the lock's symbolic
/// identity. Equality and hashing go through the heap object only, so
/// acquisitions of the same lock at different sites collapse into one
/// lock-graph vertex.
#[derive(Clone, Debug)]
pub struct LockAcquisition {
    pub point: ProgramPoint,
    pub object: HeapObject,
}

impl PartialEq for LockAcquisition {
    fn eq(&self, other: &Self) -> bool {
        self.object == other.object
    }
}

impl Eq for LockAcquisition {}

impl Hash for LockAcquisition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.object.hash(state);
    }
}

impl LockAcquisition {
    pub fn describe(&self, program: &Program) -> String {
        format!(
            "{} acquired at {}",
            self.object.describe(program),
            self.point.describe(program)
        )
    }
}

/// `source` may be held while `target` is acquired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockGraphEdge {
    pub source: LockAcquisition,
    pub target: LockAcquisition,
}

/// The mutable lock-ordering graph carried inside a [`LockState`].
///
/// Vertices are identified by acquisition equality and need removal with
/// edge reconnection during call-site splicing, so this is a small
/// dedicated adjacency structure; extraction converts it to a `petgraph`
/// graph. Insertion order is preserved, keeping runs deterministic.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LockGraph {
    vertices: Vec<LockAcquisition>,
    edges: Vec<LockGraphEdge>,
}

impl LockGraph {
    pub fn vertices(&self) -> &[LockAcquisition] {
        &self.vertices
    }

    pub fn edges(&self) -> &[LockGraphEdge] {
        &self.edges
    }

    pub fn add_vertex(&mut self, vertex: LockAcquisition) {
        if !self.vertices.contains(&vertex) {
            self.vertices.push(vertex);
        }
    }

    /// Self-loops are never a valid ordering; constructing one is a defect
    /// in the calling rule, not an input condition.
    pub fn add_edge(&mut self, source: LockAcquisition, target: LockAcquisition) {
        assert!(
            source != target,
            "self-loop lock ordering on {:?}",
            source.object
        );
        self.add_vertex(source.clone());
        self.add_vertex(target.clone());
        let edge = LockGraphEdge { source, target };
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    pub fn union(&mut self, other: &LockGraph) {
        for vertex in &other.vertices {
            self.add_vertex(vertex.clone());
        }
        for edge in &other.edges {
            if !self.edges.contains(edge) {
                self.edges.push(edge.clone());
            }
        }
    }

    pub fn out_targets(&self, vertex: &LockAcquisition) -> Vec<LockAcquisition> {
        self.edges
            .iter()
            .filter(|e| e.source == *vertex)
            .map(|e| e.target.clone())
            .collect()
    }

    /// Remove `vertex`, reconnecting each of its in-edge sources directly
    /// to each of its out-edge targets (skip-over). Used to short-circuit
    /// reentrant locks during call-site splicing.
    pub fn remove_vertex_reconnect(&mut self, vertex: &LockAcquisition) {
        let sources: Vec<LockAcquisition> = self
            .edges
            .iter()
            .filter(|e| e.target == *vertex && e.source != *vertex)
            .map(|e| e.source.clone())
            .collect();
        let targets: Vec<LockAcquisition> = self
            .edges
            .iter()
            .filter(|e| e.source == *vertex && e.target != *vertex)
            .map(|e| e.target.clone())
            .collect();
        self.edges
            .retain(|e| e.source != *vertex && e.target != *vertex);
        self.vertices.retain(|v| v != vertex);
        for source in &sources {
            for target in &targets {
                if source != target {
                    self.add_edge(source.clone(), target.clone());
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }
}

/// Symbolic evaluation stack and variable slots. `None` stands for a
/// non-reference or unknown value.
#[derive(Clone, Debug)]
pub struct VariableState {
    pub parameters: Vec<HeapObject>,
    pub locals: Vec<Option<HeapObject>>,
    pub stack: Vec<Option<HeapObject>>,
}

impl VariableState {
    pub fn new(program: &Program, method: MethodId) -> Self {
        let def = program.method(method);
        let mut parameters = Vec::with_capacity(def.arity());
        if def.has_this() {
            parameters.push(HeapObject::Parameter {
                method,
                index: 0,
                ty: def.declaring_type,
            });
        }
        let first = parameters.len() as u16;
        for (i, &ty) in def.params.iter().enumerate() {
            parameters.push(HeapObject::Parameter {
                method,
                index: first + i as u16,
                ty,
            });
        }
        let locals = def
            .body
            .as_ref()
            .map(|body| vec![None; body.locals.len()])
            .unwrap_or_default();
        Self {
            parameters,
            locals,
            stack: Vec::new(),
        }
    }

    pub fn push(&mut self, value: Option<HeapObject>) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Option<HeapObject> {
        self.stack.pop().flatten()
    }

    /// Stack slot `n` positions below the top, without popping.
    pub fn peek_at(&self, depth_from_top: usize) -> Option<&HeapObject> {
        let len = self.stack.len();
        len.checked_sub(depth_from_top + 1)
            .and_then(|slot| self.stack[slot].as_ref())
    }

    /// Join of two variable states. Slots holding different objects
    /// collapse to a fresh object typed at the least common ancestor,
    /// keyed to the join point.
    pub fn merge(&self, other: &Self, program: &Program, join: ProgramPoint) -> Self {
        let merge_slot = |a: &Option<HeapObject>, b: &Option<HeapObject>| match (a, b) {
            (Some(x), Some(y)) if x == y => Some(x.clone()),
            (Some(x), Some(y)) => Some(HeapObject::Generic {
                point: Some(join),
                ty: program.least_common_ancestor(x.ty(program), y.ty(program)),
            }),
            _ => None,
        };
        let locals = self
            .locals
            .iter()
            .zip(other.locals.iter())
            .map(|(a, b)| merge_slot(a, b))
            .collect();
        // Differing stack depths only arise on malformed flow; truncate to
        // the common depth.
        let stack = self
            .stack
            .iter()
            .zip(other.stack.iter())
            .map(|(a, b)| merge_slot(a, b))
            .collect();
        Self {
            parameters: self.parameters.clone(),
            locals,
            stack,
        }
    }

    /// Fixpoint comparison looks at parameters and the evaluation stack;
    /// locals are deliberately excluded (they stabilize with the stack).
    pub fn observably_equal(&self, other: &Self) -> bool {
        self.parameters == other.parameters && self.stack == other.stack
    }
}

#[derive(Clone, Debug)]
pub struct LockState {
    /// Currently-held acquisitions, bottom of stack first. Reentrant
    /// acquisitions push duplicate frames.
    pub locks: Vec<LockAcquisition>,
    /// Acquisitions taken with nothing held before them.
    pub roots: Vec<LockAcquisition>,
    pub graph: LockGraph,
    /// Objects passed to a monitor wait; recorded, not yet analyzed.
    pub waits: Vec<HeapObject>,
    /// `None` once compacted into a summary (locals and stack dropped).
    pub variables: Option<VariableState>,
}

impl LockState {
    pub fn new(program: &Program, method: MethodId) -> Self {
        Self {
            locks: Vec::new(),
            roots: Vec::new(),
            graph: LockGraph::default(),
            waits: Vec::new(),
            variables: Some(VariableState::new(program, method)),
        }
    }

    /// A state with no variable model, used for opaque passthrough
    /// summaries and the final program-level merge.
    pub fn without_variables() -> Self {
        Self {
            locks: Vec::new(),
            roots: Vec::new(),
            graph: LockGraph::default(),
            waits: Vec::new(),
            variables: None,
        }
    }

    pub fn top_lock(&self) -> Option<&LockAcquisition> {
        self.locks.last()
    }

    pub fn holds(&self, acquisition: &LockAcquisition) -> bool {
        self.locks.contains(acquisition)
    }

    /// Acquire a lock. A reentrant acquisition (same object already on the
    /// stack) pushes a duplicate frame but records no new vertex, edge or
    /// root.
    pub fn enter_lock(&mut self, acquisition: LockAcquisition) {
        if self.holds(&acquisition) {
            self.locks.push(acquisition);
            return;
        }
        self.graph.add_vertex(acquisition.clone());
        match self.locks.last() {
            Some(top) => {
                let top = top.clone();
                self.graph.add_edge(top, acquisition.clone());
            }
            None => {
                if !self.roots.contains(&acquisition) {
                    self.roots.push(acquisition.clone());
                }
            }
        }
        self.locks.push(acquisition);
    }

    /// Release a lock. An exit with nothing held releases a lock owned by
    /// a caller and is ignored here. The popped frame must match `object`,
    /// with one fallback: two identities both derived from a load of the
    /// same field are treated as the same lock. Anything else is
    /// unbalanced locking, an invariant violation.
    pub fn exit_lock(&mut self, program: &Program, object: &HeapObject, point: ProgramPoint) {
        let Some(top) = self.locks.last() else {
            debug!("lock exit with empty stack at {}", point.describe(program));
            return;
        };
        let matches = top.object == *object || same_field_load(program, &top.object, object);
        assert!(
            matches,
            "unbalanced lock exit at {}: held {:?}, released {:?}",
            point.describe(program),
            top.object,
            object
        );
        self.locks.pop();
    }

    pub fn record_wait(&mut self, object: HeapObject) {
        if !self.waits.contains(&object) {
            self.waits.push(object);
        }
    }

    /// Join of two or more states. The lock stack becomes the longest
    /// common prefix; everything recorded beyond it stays in the unioned
    /// graph. Roots, waits and graphs union; variables merge slot-wise.
    pub fn merge(program: &Program, join: ProgramPoint, states: &[&LockState]) -> LockState {
        assert!(!states.is_empty());
        let mut locks = states[0].locks.clone();
        for state in &states[1..] {
            let common = locks
                .iter()
                .zip(state.locks.iter())
                .take_while(|(a, b)| a == b)
                .count();
            if common < locks.len() {
                debug!(
                    "lock stacks diverge at {}; keeping common prefix of {}",
                    join.describe(program),
                    common
                );
                locks.truncate(common);
            }
        }
        let mut merged = LockState {
            locks,
            roots: Vec::new(),
            graph: LockGraph::default(),
            waits: Vec::new(),
            variables: None,
        };
        for state in states {
            for root in &state.roots {
                if !merged.roots.contains(root) {
                    merged.roots.push(root.clone());
                }
            }
            merged.graph.union(&state.graph);
            for wait in &state.waits {
                if !merged.waits.contains(wait) {
                    merged.waits.push(wait.clone());
                }
            }
        }
        merged.variables = match states.iter().map(|s| s.variables.as_ref()).collect::<Option<Vec<_>>>() {
            Some(all) => {
                let mut vars = all[0].clone();
                for other in &all[1..] {
                    vars = vars.merge(other, program, join);
                }
                Some(vars)
            }
            None => None,
        };
        merged
    }

    /// Release the variable model's bulk after the method converges; the
    /// parameter objects stay, call-site renaming needs them.
    pub fn compact(&mut self) {
        if let Some(vars) = &mut self.variables {
            vars.locals = Vec::new();
            vars.stack = Vec::new();
        }
    }

    /// Fixpoint equality. The accumulated graph is excluded: it grows
    /// monotonically under union and comparing it would never let states
    /// with loops converge structurally faster; depth, roots, waits and
    /// variables are what the transfer rules branch on.
    pub fn observably_equal(&self, other: &LockState) -> bool {
        if self.locks.len() != other.locks.len()
            || self.roots != other.roots
            || self.waits != other.waits
        {
            return false;
        }
        match (&self.variables, &other.variables) {
            (Some(a), Some(b)) => a.observably_equal(b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Summary change detection between fixpoint iterations. Unlike
    /// [`LockState::observably_equal`] this includes the graph: callers
    /// must be revisited when a callee records new orderings, even if its
    /// roots and stack depth are unchanged.
    pub fn summary_equals(&self, other: &LockState) -> bool {
        self.observably_equal(other) && self.graph == other.graph
    }
}

/// Both objects carry a creation point whose instruction loads the same
/// field.
fn same_field_load(program: &Program, a: &HeapObject, b: &HeapObject) -> bool {
    let field_of = |object: &HeapObject| {
        object
            .creation_point()
            .and_then(|point| point.instruction(program))
            .and_then(|instruction| instruction.opcode.loaded_field())
    };
    match (field_of(a), field_of(b)) {
        (Some(fa), Some(fb)) => fa == fb,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::builder::ProgramBuilder;
    use crate::program::{Opcode, TypeId};

    fn fixture() -> (crate::program::Program, MethodId, TypeId) {
        let mut pb = ProgramBuilder::new();
        let ty = pb.add_class("Test.Fixture");
        let method = pb.declare_static_method(ty, "M", vec![], None);
        pb.set_body(method, vec![], vec![Opcode::Return], vec![]);
        (pb.finish(), method, ty)
    }

    fn acquisition(method: MethodId, offset: u32, object: HeapObject) -> LockAcquisition {
        LockAcquisition {
            point: ProgramPoint::new(method, offset),
            object,
        }
    }

    #[test]
    fn nested_enters_record_root_and_edge() {
        let (program, method, ty) = fixture();
        let mut state = LockState::new(&program, method);
        let a = acquisition(method, 0, HeapObject::TypeOf(ty));
        let b = acquisition(
            method,
            1,
            HeapObject::Generic {
                point: Some(ProgramPoint::new(method, 1)),
                ty,
            },
        );
        state.enter_lock(a.clone());
        state.enter_lock(b.clone());
        assert_eq!(state.roots, vec![a.clone()]);
        assert_eq!(
            state.graph.edges(),
            &[LockGraphEdge {
                source: a.clone(),
                target: b.clone()
            }]
        );
        state.exit_lock(&program, &b.object, ProgramPoint::new(method, 2));
        state.exit_lock(&program, &a.object, ProgramPoint::new(method, 3));
        assert!(state.locks.is_empty());
    }

    #[test]
    fn reentrant_enter_adds_no_edge() {
        let (program, method, ty) = fixture();
        let mut state = LockState::new(&program, method);
        let a = acquisition(method, 0, HeapObject::TypeOf(ty));
        state.enter_lock(a.clone());
        state.enter_lock(acquisition(method, 1, HeapObject::TypeOf(ty)));
        assert_eq!(state.locks.len(), 2);
        assert!(state.graph.edges().is_empty());
        assert_eq!(state.roots, vec![a]);
    }

    #[test]
    #[should_panic(expected = "unbalanced lock exit")]
    fn mismatched_exit_panics() {
        let (program, method, ty) = fixture();
        let mut state = LockState::new(&program, method);
        state.enter_lock(acquisition(method, 0, HeapObject::TypeOf(ty)));
        let other = HeapObject::TypeOf(program.well_known().string);
        state.exit_lock(&program, &other, ProgramPoint::new(method, 1));
    }

    #[test]
    fn exit_with_empty_stack_is_ignored() {
        let (program, method, ty) = fixture();
        let mut state = LockState::new(&program, method);
        state.exit_lock(&program, &HeapObject::TypeOf(ty), ProgramPoint::new(method, 0));
        assert!(state.locks.is_empty());
        assert!(state.graph.is_empty());
    }

    #[test]
    fn merge_keeps_common_lock_prefix() {
        let (program, method, ty) = fixture();
        let a = acquisition(method, 0, HeapObject::TypeOf(ty));
        let b = acquisition(method, 1, HeapObject::TypeOf(program.well_known().string));
        let mut left = LockState::new(&program, method);
        left.enter_lock(a.clone());
        left.enter_lock(b.clone());
        let mut right = LockState::new(&program, method);
        right.enter_lock(a.clone());

        let join = ProgramPoint::new(method, 5);
        let merged = LockState::merge(&program, join, &[&left, &right]);
        assert_eq!(merged.locks, vec![a.clone()]);
        // The edge recorded beyond the prefix survives in the graph.
        assert_eq!(merged.graph.edges().len(), 1);
        assert_eq!(merged.roots, vec![a]);
    }

    #[test]
    fn remove_vertex_reconnects_through() {
        let (_, method, ty) = fixture();
        let mut pbty = |n: u32| {
            acquisition(
                method,
                n,
                HeapObject::Generic {
                    point: Some(ProgramPoint::new(method, n)),
                    ty,
                },
            )
        };
        let a = pbty(0);
        let b = pbty(1);
        let c = pbty(2);
        let mut graph = LockGraph::default();
        graph.add_edge(a.clone(), b.clone());
        graph.add_edge(b.clone(), c.clone());
        graph.remove_vertex_reconnect(&b);
        assert_eq!(graph.vertices(), &[a.clone(), c.clone()]);
        assert_eq!(
            graph.edges(),
            &[LockGraphEdge {
                source: a,
                target: c
            }]
        );
    }
}
