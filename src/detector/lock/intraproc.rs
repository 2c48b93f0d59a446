//! Per-method lock analysis.
//!
//! A [`LockAnalysis`] is the dataflow problem solved once per method: a
//! symbolic variable/stack simulation layered with lock-state updates.
//! Monitor enter/exit/wait are recognized before the generic call rules;
//! ordinary calls splice in the callee's summary when one is available.

use log::debug;
use rustc_hash::FxHashMap;

use super::interproc::{compose_summary, RenameMemo};
use super::state::{LockAcquisition, LockState, VariableState};
use crate::analysis::callgraph::CallGraph;
use crate::analysis::dataflow::DataflowProblem;
use crate::analysis::heap::{HeapObject, TokenSource};
use crate::options::AnalysisOptions;
use crate::program::{MethodId, Opcode, Program, ProgramPoint};

pub(crate) struct LockAnalysis<'a> {
    program: &'a Program,
    options: AnalysisOptions,
    call_graph: &'a CallGraph,
    summaries: &'a FxHashMap<MethodId, LockState>,
    tokens: &'a mut TokenSource,
    rename_memo: &'a mut RenameMemo,
    /// Unaliased identities minted per site, memoized so re-evaluating a
    /// block during the fixpoint reproduces the same object.
    site_objects: &'a mut FxHashMap<ProgramPoint, HeapObject>,
}

fn vars(state: &mut LockState) -> &mut VariableState {
    state
        .variables
        .as_mut()
        .expect("variable state present during intraprocedural solve")
}

impl<'a> LockAnalysis<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        program: &'a Program,
        options: AnalysisOptions,
        call_graph: &'a CallGraph,
        summaries: &'a FxHashMap<MethodId, LockState>,
        tokens: &'a mut TokenSource,
        rename_memo: &'a mut RenameMemo,
        site_objects: &'a mut FxHashMap<ProgramPoint, HeapObject>,
    ) -> Self {
        Self {
            program,
            options,
            call_graph,
            summaries,
            tokens,
            rename_memo,
            site_objects,
        }
    }

    fn site_object(&mut self, point: ProgramPoint, ty: crate::program::TypeId) -> HeapObject {
        let tokens = &mut *self.tokens;
        self.site_objects
            .entry(point)
            .or_insert_with(|| HeapObject::Unaliased {
                token: tokens.mint(),
                ty,
            })
            .clone()
    }

    /// Identity of a field load under the active aliasing policy. Both
    /// policies key the identity by field, never by load site: the
    /// canonical lock region loads a field once for the enter and reloads
    /// it in the finally handler for the exit, and those two loads must
    /// resolve to the same lock.
    fn field_object(&mut self, point: ProgramPoint, field: crate::program::FieldId) -> HeapObject {
        let def = self.program.field(field);
        if self.options.contains(AnalysisOptions::NO_ALIASING) || def.is_read_only {
            HeapObject::UnaliasedField(field)
        } else {
            HeapObject::Generic {
                point: Some(point),
                ty: def.ty,
            }
        }
    }

    fn peek(state: &LockState, depth_from_top: usize) -> Option<HeapObject> {
        state
            .variables
            .as_ref()
            .and_then(|v| v.peek_at(depth_from_top))
            .cloned()
    }

    fn transfer_call(
        &mut self,
        point: ProgramPoint,
        declared: MethodId,
        is_new_object: bool,
        state: &mut LockState,
    ) {
        let program = self.program;
        if program.is_get_type_from_handle(declared) {
            // Leaves the typeof literal pushed by the preceding token load
            // untouched, so lock(typeof(T)) resolves to the type object.
            return;
        }
        if program.is_monitor_enter(declared) {
            let params = program.method(declared).params.len();
            let object = match Self::peek(state, params - 1) {
                Some(object) => object,
                None => {
                    debug!(
                        "unresolved monitor enter operand at {}",
                        point.describe(program)
                    );
                    self.site_object(point, program.well_known().object)
                }
            };
            for _ in 0..params {
                vars(state).pop();
            }
            state.enter_lock(LockAcquisition { point, object });
            return;
        }
        if program.is_monitor_exit(declared) {
            let object = Self::peek(state, 0);
            vars(state).pop();
            match object {
                Some(object) => state.exit_lock(program, &object, point),
                None => {
                    debug!(
                        "unresolved monitor exit operand at {}; releasing top",
                        point.describe(program)
                    );
                    state.locks.pop();
                }
            }
            return;
        }
        if program.is_monitor_wait(declared) {
            let params = program.method(declared).params.len();
            let object = Self::peek(state, params - 1);
            for _ in 0..params {
                vars(state).pop();
            }
            if let Some(object) = object {
                state.record_wait(object);
            }
            if program.method(declared).return_type.is_some() {
                vars(state).push(None);
            }
            return;
        }

        let callee_def = program.method(declared);
        let declared_params = callee_def.params.len();
        let new_object = is_new_object.then(|| HeapObject::Generic {
            point: Some(point),
            ty: callee_def.declaring_type,
        });

        // Positional argument binding for summary renaming: slot 0 is the
        // receiver. A constructor's receiver is the object being created.
        let args: Vec<Option<HeapObject>> = {
            let stack = &vars(state).stack;
            let on_stack = if is_new_object {
                declared_params
            } else {
                callee_def.arity()
            };
            let take = on_stack.min(stack.len());
            let mut args: Vec<Option<HeapObject>> = Vec::with_capacity(callee_def.arity());
            if is_new_object {
                args.push(new_object.clone());
            }
            for _ in 0..on_stack - take {
                args.push(None);
            }
            args.extend(stack[stack.len() - take..].iter().cloned());
            args
        };

        for callee in self.call_graph.candidate_targets(point) {
            // Self-recursive splices are skipped; with unbound-parameter
            // renaming they would mint new identities every iteration.
            if callee == point.method {
                continue;
            }
            if let Some(summary) = self.summaries.get(&callee) {
                compose_summary(
                    self.program,
                    self.options,
                    self.tokens,
                    self.rename_memo,
                    state,
                    Some((point, &args)),
                    summary,
                );
            }
        }

        let v = vars(state);
        let pops = if is_new_object {
            declared_params
        } else {
            callee_def.arity()
        };
        for _ in 0..pops {
            v.pop();
        }
        if let Some(new_object) = new_object {
            v.push(Some(new_object));
        } else if let Some(ret) = callee_def.return_type {
            v.push(Some(HeapObject::Generic {
                point: Some(point),
                ty: ret,
            }));
        }
    }
}

impl DataflowProblem for LockAnalysis<'_> {
    type State = LockState;

    fn initial_state(&mut self, entry: ProgramPoint) -> LockState {
        LockState::new(self.program, entry.method)
    }

    fn apply_rules(&mut self, point: ProgramPoint, state: &mut LockState) {
        let Some(instruction) = point.instruction(self.program) else {
            return;
        };
        match &instruction.opcode {
            Opcode::Nop
            | Opcode::Branch(_)
            | Opcode::Leave(_)
            | Opcode::EndFinally
            | Opcode::Return => {}
            Opcode::LoadConst | Opcode::LoadFunction(_) => vars(state).push(None),
            Opcode::LoadString => {
                let ty = self.program.well_known().string;
                vars(state).push(Some(HeapObject::Generic {
                    point: Some(point),
                    ty,
                }));
            }
            Opcode::LoadArg(index) => {
                let v = vars(state);
                let value = v.parameters.get(*index as usize).cloned();
                v.push(value);
            }
            Opcode::LoadLocal(index) => {
                let v = vars(state);
                let value = v.locals.get(*index as usize).cloned().flatten();
                v.push(value);
            }
            Opcode::StoreLocal(index) => {
                let v = vars(state);
                let value = v.pop();
                if let Some(slot) = v.locals.get_mut(*index as usize) {
                    *slot = value;
                }
            }
            Opcode::LoadField(field) => {
                vars(state).pop();
                let object = self.field_object(point, *field);
                vars(state).push(Some(object));
            }
            Opcode::LoadStaticField(field) => {
                let object = self.field_object(point, *field);
                vars(state).push(Some(object));
            }
            Opcode::StoreField(_) => {
                let v = vars(state);
                v.pop();
                v.pop();
            }
            Opcode::StoreStaticField(_) => {
                vars(state).pop();
            }
            Opcode::LoadElement => {
                let v = vars(state);
                v.pop();
                let array = v.pop();
                let ty = array
                    .map(|a| a.ty(self.program))
                    .and_then(|t| self.program.type_def(t).element)
                    .unwrap_or(self.program.well_known().object);
                vars(state).push(Some(HeapObject::Generic {
                    point: Some(point),
                    ty,
                }));
            }
            Opcode::StoreElement => {
                let v = vars(state);
                v.pop();
                v.pop();
                v.pop();
            }
            Opcode::LoadToken(ty) => vars(state).push(Some(HeapObject::TypeOf(*ty))),
            Opcode::NewArray(_) => {
                let v = vars(state);
                v.pop();
                let ty = self.program.well_known().object;
                v.push(Some(HeapObject::Generic {
                    point: Some(point),
                    ty,
                }));
            }
            Opcode::NewObject(ctor) => self.transfer_call(point, *ctor, true, state),
            Opcode::Call(target) | Opcode::CallVirtual(target) => {
                self.transfer_call(point, *target, false, state)
            }
            Opcode::CastClass(ty) | Opcode::IsInstance(ty) => {
                // Casting preserves object identity; only an unknown input
                // gains a typed placeholder.
                let v = vars(state);
                let value = v.pop();
                let ty = *ty;
                vars(state).push(value.or(Some(HeapObject::Generic {
                    point: Some(point),
                    ty,
                })));
            }
            Opcode::Dup => {
                let v = vars(state);
                let top = v.stack.last().cloned().unwrap_or(None);
                v.push(top);
            }
            Opcode::Pop | Opcode::Throw | Opcode::BranchIf(_) | Opcode::Switch(_) => {
                vars(state).pop();
            }
            Opcode::UnaryOp => {
                let v = vars(state);
                v.pop();
                v.push(None);
            }
            Opcode::BinaryOp => {
                let v = vars(state);
                v.pop();
                v.pop();
                v.push(None);
            }
            // CFG construction already rejected methods with unknown flow.
            Opcode::Unknown => {}
        }
    }

    fn merge_states(&mut self, join: ProgramPoint, states: &[&LockState]) -> LockState {
        LockState::merge(self.program, join, states)
    }

    fn clone_state(&self, state: &LockState) -> LockState {
        state.clone()
    }

    fn states_equal(&self, a: &LockState, b: &LockState) -> bool {
        a.observably_equal(b)
    }
}
