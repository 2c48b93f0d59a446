//! Whole-program lock analysis.
//!
//! Summaries are computed bottom-up over the call graph and recomputed
//! until they stabilize; a changed summary re-enqueues every caller.
//! Methods without an analyzable body are summarized as an opaque
//! passthrough, the union of their callees' summaries. The final
//! program-level state merges the summaries of every program root: the
//! entry method, resolved thread-entry delegates, and reachable static
//! initializers, which may all run concurrently.

use std::collections::VecDeque;

use log::{debug, info};
use rustc_hash::{FxHashMap, FxHashSet};

use super::intraproc::LockAnalysis;
use super::state::{LockAcquisition, LockGraph, LockState};
use crate::analysis::callgraph::CallGraph;
use crate::analysis::cfg::ControlFlowGraph;
use crate::analysis::dataflow::WorklistSolver;
use crate::analysis::heap::{HeapObject, TokenSource};
use crate::cancel::CancellationToken;
use crate::error::AnalysisError;
use crate::options::AnalysisOptions;
use crate::program::{MethodId, Program, ProgramPoint};

/// Memoized call-site renamings, keyed by (call site, callee object).
/// `None` keys belong to the final program-level merge. Memoization keeps
/// minted identities stable across fixpoint re-evaluations.
pub(crate) type RenameMemo = FxHashMap<(Option<ProgramPoint>, HeapObject), HeapObject>;

/// Outcome of the interprocedural fixpoint: the merged program-level
/// state and the methods treated as concurrent roots.
pub struct ProgramLockSummary {
    pub state: LockState,
    pub root_methods: Vec<MethodId>,
}

pub struct InterproceduralLockAnalysis<'p> {
    program: &'p Program,
    options: AnalysisOptions,
    token: CancellationToken,
    tokens: TokenSource,
    rename_memo: RenameMemo,
    site_objects: FxHashMap<ProgramPoint, HeapObject>,
    summaries: FxHashMap<MethodId, LockState>,
}

impl<'p> InterproceduralLockAnalysis<'p> {
    pub fn new(program: &'p Program, options: AnalysisOptions, token: CancellationToken) -> Self {
        Self {
            program,
            options,
            token,
            tokens: TokenSource::new(),
            rename_memo: RenameMemo::default(),
            site_objects: FxHashMap::default(),
            summaries: FxHashMap::default(),
        }
    }

    pub fn run(mut self, call_graph: &CallGraph) -> Result<ProgramLockSummary, AnalysisError> {
        let order = call_graph.bottom_up_order();
        let mut queue: VecDeque<MethodId> = order.iter().copied().collect();
        let mut queued: FxHashSet<MethodId> = order.into_iter().collect();

        while let Some(method) = queue.pop_front() {
            self.token.check()?;
            queued.remove(&method);
            let summary = self.compute_summary(call_graph, method)?;
            let changed = match self.summaries.get(&method) {
                Some(previous) => !previous.summary_equals(&summary),
                None => true,
            };
            if changed {
                debug!(
                    "summary of {} changed; re-enqueueing callers",
                    self.program.describe_method(method)
                );
                self.summaries.insert(method, summary);
                for caller in call_graph.callers(method) {
                    if queued.insert(caller) {
                        queue.push_back(caller);
                    }
                }
            }
        }

        let mut root_methods = vec![call_graph.entry()];
        for root in call_graph.delegate_thread_roots(self.program) {
            if !root_methods.contains(&root) {
                root_methods.push(root);
            }
        }
        for root in call_graph.static_initializers(self.program) {
            if !root_methods.contains(&root) {
                root_methods.push(root);
            }
        }

        let mut merged = LockState::without_variables();
        for &root in &root_methods {
            // Roots are merged once; their summaries are consumed here and
            // the table is dropped with the driver.
            if let Some(summary) = self.summaries.remove(&root) {
                compose_summary(
                    self.program,
                    self.options,
                    &mut self.tokens,
                    &mut self.rename_memo,
                    &mut merged,
                    None,
                    &summary,
                );
            }
        }
        self.summaries.clear();
        assert!(
            merged.locks.is_empty(),
            "program-level merge left locks held"
        );
        info!(
            "lock graph: {} vertices, {} edges, {} roots over {} concurrent entry points",
            merged.graph.vertices().len(),
            merged.graph.edges().len(),
            merged.roots.len(),
            root_methods.len()
        );
        Ok(ProgramLockSummary {
            state: merged,
            root_methods,
        })
    }

    /// One summary for `method`: the solved and compacted exit state if
    /// its body is analyzable, an opaque passthrough otherwise.
    fn compute_summary(
        &mut self,
        call_graph: &CallGraph,
        method: MethodId,
    ) -> Result<LockState, AnalysisError> {
        let def = self.program.method(method);
        let policy_opaque = self.options.contains(AnalysisOptions::IGNORE_SYSTEM_NAMESPACE)
            && self.program.is_system_type(def.declaring_type)
            && method != call_graph.entry();
        if def.has_body() && !policy_opaque {
            match ControlFlowGraph::new(self.program, method) {
                Ok(cfg) => {
                    let mut problem = LockAnalysis::new(
                        self.program,
                        self.options,
                        call_graph,
                        &self.summaries,
                        &mut self.tokens,
                        &mut self.rename_memo,
                        &mut self.site_objects,
                    );
                    let mut summary =
                        WorklistSolver::solve_summary(self.program, &cfg, &mut problem, &self.token)?;
                    assert!(
                        summary.locks.is_empty(),
                        "unbalanced locks at exit of {}",
                        self.program.describe_method(method)
                    );
                    summary.compact();
                    return Ok(summary);
                }
                Err(AnalysisError::Cancelled) => return Err(AnalysisError::Cancelled),
                Err(err) => {
                    debug!(
                        "treating {} as opaque: {}",
                        self.program.describe_method(method),
                        err
                    );
                }
            }
        }
        // Opaque passthrough: the union of the callees' summaries, with no
        // symbolic execution of the body.
        let mut state = LockState::without_variables();
        for callee in call_graph.callees(method) {
            if callee == method {
                continue;
            }
            if let Some(summary) = self.summaries.get(&callee) {
                compose_summary(
                    self.program,
                    self.options,
                    &mut self.tokens,
                    &mut self.rename_memo,
                    &mut state,
                    None,
                    summary,
                );
            }
        }
        Ok(state)
    }
}

/// Rename one callee object into the caller's frame. Bound parameters
/// take the actual argument; unaliased-family objects and point-less
/// generics pass through; everything else loses its provenance and
/// becomes a fresh unaliased identity (under `NO_ALIASING_AFTER_MERGE`)
/// or a point-less generic of the same type.
fn rename_object(
    program: &Program,
    options: AnalysisOptions,
    tokens: &mut TokenSource,
    memo: &mut RenameMemo,
    call: Option<(ProgramPoint, &[Option<HeapObject>])>,
    object: &HeapObject,
) -> HeapObject {
    match object {
        HeapObject::Parameter { index, .. } => {
            if let Some((_, args)) = call {
                if let Some(Some(actual)) = args.get(*index as usize) {
                    return actual.clone();
                }
            }
        }
        HeapObject::Unaliased { .. }
        | HeapObject::UnaliasedField(_)
        | HeapObject::TypeOf(_)
        | HeapObject::Generic { point: None, .. } => return object.clone(),
        HeapObject::Generic { point: Some(_), .. } => {}
    }
    let key = (call.map(|(point, _)| point), object.clone());
    if let Some(renamed) = memo.get(&key) {
        return renamed.clone();
    }
    let ty = object.ty(program);
    let renamed = if options.contains(AnalysisOptions::NO_ALIASING_AFTER_MERGE) {
        HeapObject::Unaliased {
            token: tokens.mint(),
            ty,
        }
    } else {
        HeapObject::Generic { point: None, ty }
    };
    memo.insert(key, renamed.clone());
    renamed
}

/// Splice a callee summary into the caller's state at a call site (or
/// with no site, for opaque passthrough and the program-level merge).
///
/// The callee's graph is renamed into the caller's frame; vertices that
/// coincide with a lock the caller already holds are short-circuited out
/// (in-edges reconnected to out-edges) so reentrant acquisitions never
/// produce self-orderings. If the caller holds locks, the callee's roots
/// hang off the caller's top-of-stack lock; otherwise they become roots
/// of the caller state.
pub(crate) fn compose_summary(
    program: &Program,
    options: AnalysisOptions,
    tokens: &mut TokenSource,
    memo: &mut RenameMemo,
    state: &mut LockState,
    call: Option<(ProgramPoint, &[Option<HeapObject>])>,
    summary: &LockState,
) {
    let mut rename =
        |object: &HeapObject| rename_object(program, options, tokens, memo, call, object);

    let mut renamed = LockGraph::default();
    for vertex in summary.graph.vertices() {
        renamed.add_vertex(LockAcquisition {
            point: vertex.point,
            object: rename(&vertex.object),
        });
    }
    for edge in summary.graph.edges() {
        let source = LockAcquisition {
            point: edge.source.point,
            object: rename(&edge.source.object),
        };
        let target = LockAcquisition {
            point: edge.target.point,
            object: rename(&edge.target.object),
        };
        // Conflated by renaming; not a recorded ordering.
        if source == target {
            continue;
        }
        renamed.add_edge(source, target);
    }
    let mut roots: Vec<LockAcquisition> = Vec::new();
    for root in &summary.roots {
        let root = LockAcquisition {
            point: root.point,
            object: rename(&root.object),
        };
        if !roots.contains(&root) {
            roots.push(root);
        }
    }
    let mut waits: Vec<HeapObject> = Vec::new();
    for wait in &summary.waits {
        waits.push(rename(wait));
    }

    let held = state.locks.clone();
    for lock in &held {
        if !renamed.vertices().contains(lock) {
            continue;
        }
        if let Some(position) = roots.iter().position(|root| root == lock) {
            // The callee re-enters a lock the caller holds; whatever it
            // acquires underneath attaches below the caller's stack.
            roots.remove(position);
            for successor in renamed.out_targets(lock) {
                if !roots.contains(&successor) && !state.holds(&successor) {
                    roots.push(successor);
                }
            }
        }
        renamed.remove_vertex_reconnect(lock);
    }

    state.graph.union(&renamed);
    match state.top_lock().cloned() {
        Some(top) => {
            for root in roots {
                if root != top && !state.holds(&root) {
                    state.graph.add_edge(top.clone(), root);
                }
            }
        }
        None => {
            for root in roots {
                if !state.roots.contains(&root) {
                    state.roots.push(root);
                }
            }
        }
    }
    for wait in waits {
        if !state.waits.contains(&wait) {
            state.waits.push(wait);
        }
    }
}
