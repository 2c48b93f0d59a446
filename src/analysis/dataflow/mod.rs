//! Generic forward dataflow over a control-flow graph.
//!
//! A [`DataflowProblem`] supplies the lattice operations; the
//! [`WorklistSolver`] computes per-block out-states to a fixpoint.
//! Termination is the problem's obligation: the merge operator must be
//! monotonic over a finite-height lattice, otherwise the solver loops
//! forever, which is a defect in the problem, not a recoverable error.

use std::collections::VecDeque;

use log::trace;

use crate::analysis::cfg::ControlFlowGraph;
use crate::cancel::CancellationToken;
use crate::error::AnalysisError;
use crate::program::{Opcode, Program, ProgramPoint};

pub trait DataflowProblem {
    type State;

    /// State flowing into the method entry.
    fn initial_state(&mut self, entry: ProgramPoint) -> Self::State;

    /// Transfer function for one instruction, mutating the state in place.
    fn apply_rules(&mut self, point: ProgramPoint, state: &mut Self::State);

    /// Join of two or more incoming states at `join`.
    fn merge_states(&mut self, join: ProgramPoint, states: &[&Self::State]) -> Self::State;

    fn clone_state(&self, state: &Self::State) -> Self::State;

    fn states_equal(&self, a: &Self::State, b: &Self::State) -> bool;
}

/// Synthetic join point for the method-level exit merge.
pub fn method_exit_point(cfg: &ControlFlowGraph) -> ProgramPoint {
    ProgramPoint::new(cfg.method, u32::MAX)
}

pub struct WorklistSolver;

impl WorklistSolver {
    /// Per-block out-states at the fixpoint. `None` marks a block never
    /// reached (e.g. an exception handler with no rewired predecessor).
    pub fn solve<P: DataflowProblem>(
        cfg: &ControlFlowGraph,
        problem: &mut P,
        token: &CancellationToken,
    ) -> Result<Vec<Option<P::State>>, AnalysisError> {
        let blocks = cfg.blocks();
        let predecessors = cfg.predecessors();
        let mut out_states: Vec<Option<P::State>> = Vec::with_capacity(blocks.len());
        out_states.resize_with(blocks.len(), || None);

        let mut queue: VecDeque<usize> = cfg.reverse_postorder().into();
        let mut queued = vec![true; blocks.len()];

        while let Some(block) = queue.pop_front() {
            token.check()?;
            queued[block] = false;
            let block_entry = ProgramPoint::new(cfg.method, blocks[block].entry);

            let incoming: Vec<&P::State> = predecessors[block]
                .iter()
                .filter_map(|&pred| out_states[pred].as_ref())
                .collect();
            let mut state = if block == 0 {
                let initial = problem.initial_state(block_entry);
                if incoming.is_empty() {
                    initial
                } else {
                    let mut all: Vec<&P::State> = vec![&initial];
                    all.extend(incoming);
                    problem.merge_states(block_entry, &all)
                }
            } else if incoming.is_empty() {
                // Unreached so far; a predecessor change re-enqueues it.
                continue;
            } else if incoming.len() == 1 {
                problem.clone_state(incoming[0])
            } else {
                problem.merge_states(block_entry, &incoming)
            };

            for offset in blocks[block].entry..=blocks[block].exit {
                problem.apply_rules(ProgramPoint::new(cfg.method, offset), &mut state);
            }

            let changed = match &out_states[block] {
                Some(previous) => !problem.states_equal(previous, &state),
                None => true,
            };
            if changed {
                trace!("block {} of method #{} changed", block, cfg.method.0);
                for &successor in &blocks[block].successors {
                    let target = cfg.block_at_entry(successor).unwrap();
                    if !queued[target] {
                        queued[target] = true;
                        queue.push_back(target);
                    }
                }
                out_states[block] = Some(state);
            }
        }
        Ok(out_states)
    }

    /// Method-level summary: the merge of every state flowing out of a
    /// return block, joined at a synthetic exit point. Falls back to the
    /// initial state when no return block was reached.
    pub fn solve_summary<P: DataflowProblem>(
        program: &Program,
        cfg: &ControlFlowGraph,
        problem: &mut P,
        token: &CancellationToken,
    ) -> Result<P::State, AnalysisError> {
        let out_states = Self::solve(cfg, problem, token)?;
        let body = program
            .method(cfg.method)
            .body
            .as_ref()
            .expect("solved method has a body");
        let returning: Vec<&P::State> = cfg
            .blocks()
            .iter()
            .filter(|block| {
                body.instructions[block.exit as usize].opcode == Opcode::Return
            })
            .filter_map(|block| out_states[block.index].as_ref())
            .collect();
        let exit = method_exit_point(cfg);
        Ok(match returning.len() {
            0 => problem.initial_state(ProgramPoint::new(cfg.method, cfg.entry_block().entry)),
            1 => problem.clone_state(returning[0]),
            _ => problem.merge_states(exit, &returning),
        })
    }
}
