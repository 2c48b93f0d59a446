//! Control-flow graph of a single method.
//!
//! Normal control flow is reconstructed from the instruction stream and
//! the exception-handler table. `leave`-style exits out of protected
//! regions are rewired through their finally/fault handlers into ordinary
//! successor edges, so a single forward dataflow pass already accounts for
//! exception cleanup without a separate exceptional graph.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::AnalysisError;
use crate::program::{
    ExceptionHandler, FlowKind, HandlerKind, MethodBody, MethodId, Opcode, Program, TypeId,
};

/// A maximal sequential run of instructions with a single entry and a
/// single exit. Successors are the entry offsets of follow-on blocks.
#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub index: usize,
    /// Offset of the first instruction of the block.
    pub entry: u32,
    /// Offset of the last instruction of the block.
    pub exit: u32,
    pub successors: SmallVec<[u32; 2]>,
}

/// A single catch clause of a protected region.
#[derive(Clone, Debug)]
pub struct CatchClause {
    pub exception_type: TypeId,
    pub handler_start: u32,
    pub handler_end: u32,
}

/// A try region with its associated handlers, grouped by try start.
#[derive(Clone, Debug)]
pub struct ExceptionRegion {
    pub try_start: u32,
    pub try_end: u32,
    pub catches: SmallVec<[CatchClause; 1]>,
    pub finally: Option<(u32, u32)>,
    pub fault: Option<(u32, u32)>,
}

/// Control-flow graph of one method body. Block 0 is the unique entry;
/// every instruction belongs to exactly one block.
#[derive(Debug)]
pub struct ControlFlowGraph {
    pub method: MethodId,
    blocks: Vec<BasicBlock>,
    regions: Vec<ExceptionRegion>,
    entry_to_block: FxHashMap<u32, usize>,
}

impl ControlFlowGraph {
    pub fn new(program: &Program, method: MethodId) -> Result<Self, AnalysisError> {
        let body = program.method(method).body.as_ref().ok_or_else(|| {
            AnalysisError::MalformedMethod {
                method,
                detail: "no body".to_owned(),
            }
        })?;
        Self::from_body(method, body)
    }

    fn from_body(method: MethodId, body: &MethodBody) -> Result<Self, AnalysisError> {
        let len = body.instructions.len() as u32;
        let check_target = |target: u32| -> Result<u32, AnalysisError> {
            if target < len {
                Ok(target)
            } else {
                Err(AnalysisError::MalformedMethod {
                    method,
                    detail: format!("branch target 0x{:x} outside body", target),
                })
            }
        };

        // A block has to start at every branch destination and at every
        // try/handler/filter boundary.
        let mut barrier = vec![false; body.instructions.len()];
        for instruction in &body.instructions {
            for target in instruction.opcode.branch_targets() {
                barrier[check_target(target)? as usize] = true;
            }
        }
        for handler in &body.handlers {
            barrier[check_target(handler.try_start)? as usize] = true;
            barrier[check_target(handler.handler_start)? as usize] = true;
            if let HandlerKind::Filter { filter_start } = handler.kind {
                barrier[check_target(filter_start)? as usize] = true;
            }
        }

        let mut blocks: Vec<BasicBlock> = Vec::new();
        // Rewired successor for the terminal instruction of a finally or
        // fault handler that was inlined into normal control flow.
        let mut finally_target: FxHashMap<u32, u32> = FxHashMap::default();
        let mut block_entry = 0u32;

        for instruction in &body.instructions {
            let offset = instruction.offset;
            let next = offset + 1;
            let successors: SmallVec<[u32; 2]> = match instruction.opcode.flow() {
                FlowKind::Next | FlowKind::Call => {
                    if next < len && !barrier[next as usize] {
                        continue;
                    }
                    if next < len {
                        SmallVec::from_slice(&[next])
                    } else {
                        SmallVec::new()
                    }
                }
                FlowKind::Branch => {
                    let target = match instruction.opcode {
                        Opcode::Branch(t) | Opcode::Leave(t) => check_target(t)?,
                        _ => unreachable!(),
                    };
                    if let Opcode::Leave(_) = instruction.opcode {
                        Self::rewire_leave(body, offset, target, &mut finally_target)
                    } else {
                        SmallVec::from_slice(&[target])
                    }
                }
                FlowKind::CondBranch => {
                    let mut targets = SmallVec::new();
                    if next < len {
                        targets.push(next);
                    }
                    for target in instruction.opcode.branch_targets() {
                        targets.push(check_target(target)?);
                    }
                    targets
                }
                FlowKind::Return => {
                    if instruction.opcode == Opcode::EndFinally {
                        match finally_target.get(&offset) {
                            Some(&target) => SmallVec::from_slice(&[target]),
                            None => SmallVec::new(),
                        }
                    } else {
                        SmallVec::new()
                    }
                }
                FlowKind::Throw => SmallVec::new(),
                FlowKind::Unknown => {
                    return Err(AnalysisError::UnsupportedInstruction {
                        point: crate::program::ProgramPoint::new(method, offset),
                    })
                }
            };

            blocks.push(BasicBlock {
                index: blocks.len(),
                entry: block_entry,
                exit: offset,
                successors,
            });
            block_entry = next;
        }

        if block_entry < len {
            blocks.push(BasicBlock {
                index: blocks.len(),
                entry: block_entry,
                exit: len - 1,
                successors: SmallVec::new(),
            });
        }

        let entry_to_block = blocks
            .iter()
            .map(|block| (block.entry, block.index))
            .collect();

        Ok(Self {
            method,
            blocks,
            regions: Self::reconstruct_regions(&body.handlers),
            entry_to_block,
        })
    }

    /// Inline finally/fault cleanup into the normal successor graph: the
    /// leaving block falls into the innermost handler, each handler's
    /// terminal instruction is relinked to the next enclosing handler, and
    /// the outermost one to the leave's nominal target.
    fn rewire_leave(
        body: &MethodBody,
        leave_offset: u32,
        leave_target: u32,
        finally_target: &mut FxHashMap<u32, u32>,
    ) -> SmallVec<[u32; 2]> {
        let mut successors = SmallVec::from_slice(&[leave_target]);
        let mut last_handler_exit: Option<u32> = None;
        for handler in &body.handlers {
            if !matches!(handler.kind, HandlerKind::Finally | HandlerKind::Fault) {
                continue;
            }
            if handler.try_start <= leave_offset && leave_offset < handler.try_end {
                match last_handler_exit {
                    Some(exit) => {
                        finally_target.insert(exit, handler.handler_start);
                    }
                    None => {
                        successors = SmallVec::from_slice(&[handler.handler_start]);
                    }
                }
                let exit = handler.handler_end - 1;
                finally_target.insert(exit, leave_target);
                last_handler_exit = Some(exit);
            }
        }
        successors
    }

    fn reconstruct_regions(handlers: &[ExceptionHandler]) -> Vec<ExceptionRegion> {
        let mut regions: Vec<ExceptionRegion> = Vec::new();
        let mut by_try_start: FxHashMap<u32, usize> = FxHashMap::default();
        for handler in handlers {
            let index = *by_try_start.entry(handler.try_start).or_insert_with(|| {
                regions.push(ExceptionRegion {
                    try_start: handler.try_start,
                    try_end: handler.try_end,
                    catches: SmallVec::new(),
                    finally: None,
                    fault: None,
                });
                regions.len() - 1
            });
            let region = &mut regions[index];
            match handler.kind {
                HandlerKind::Catch(exception_type) => region.catches.push(CatchClause {
                    exception_type,
                    handler_start: handler.handler_start,
                    handler_end: handler.handler_end,
                }),
                HandlerKind::Finally => {
                    region.finally = Some((handler.handler_start, handler.handler_end))
                }
                HandlerKind::Fault => {
                    region.fault = Some((handler.handler_start, handler.handler_end))
                }
                // Filter clauses only force block boundaries.
                HandlerKind::Filter { .. } => {}
            }
        }
        regions
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn entry_block(&self) -> &BasicBlock {
        &self.blocks[0]
    }

    pub fn regions(&self) -> &[ExceptionRegion] {
        &self.regions
    }

    /// Block whose entry is exactly `offset`.
    pub fn block_at_entry(&self, offset: u32) -> Option<usize> {
        self.entry_to_block.get(&offset).copied()
    }

    /// Block containing `offset`.
    pub fn block_containing(&self, offset: u32) -> Option<usize> {
        match self.blocks.binary_search_by_key(&offset, |b| b.entry) {
            Ok(index) => Some(index),
            Err(0) => None,
            Err(insert) => {
                let candidate = &self.blocks[insert - 1];
                (offset <= candidate.exit).then_some(candidate.index)
            }
        }
    }

    /// Predecessor block indices, per block.
    pub fn predecessors(&self) -> Vec<Vec<usize>> {
        let mut predecessors = vec![Vec::new(); self.blocks.len()];
        for block in &self.blocks {
            for &successor in &block.successors {
                let target = self.entry_to_block[&successor];
                predecessors[target].push(block.index);
            }
        }
        predecessors
    }

    /// Blocks in reverse finish order of a depth-first traversal rooted at
    /// the entry (remaining blocks, e.g. exception handlers, follow as
    /// additional roots in index order). Seeding a worklist in this order
    /// approximates topological order and minimizes recomputation.
    pub fn reverse_postorder(&self) -> Vec<usize> {
        let mut finished = Vec::with_capacity(self.blocks.len());
        let mut visited = vec![false; self.blocks.len()];
        for root in 0..self.blocks.len() {
            if visited[root] {
                continue;
            }
            // Iterative DFS recording finish order.
            let mut stack = vec![(root, 0usize)];
            visited[root] = true;
            while let Some(&mut (block, ref mut next_child)) = stack.last_mut() {
                let successors = &self.blocks[block].successors;
                if *next_child < successors.len() {
                    let child = self.entry_to_block[&successors[*next_child]];
                    *next_child += 1;
                    if !visited[child] {
                        visited[child] = true;
                        stack.push((child, 0));
                    }
                } else {
                    finished.push(block);
                    stack.pop();
                }
            }
        }
        finished.reverse();
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::builder::ProgramBuilder;
    use crate::program::{ExceptionHandler, HandlerKind, MethodId, Opcode};

    fn build_method(opcodes: Vec<Opcode>, handlers: Vec<ExceptionHandler>) -> (crate::program::Program, MethodId) {
        let mut pb = ProgramBuilder::new();
        let ty = pb.add_class("Test.Fixture");
        let method = pb.declare_static_method(ty, "M", vec![], None);
        pb.set_body(method, vec![], opcodes, handlers);
        (pb.finish(), method)
    }

    #[test]
    fn straight_line_is_single_block() {
        let (program, method) = build_method(
            vec![Opcode::Nop, Opcode::LoadConst, Opcode::Pop, Opcode::Return],
            vec![],
        );
        let cfg = ControlFlowGraph::new(&program, method).unwrap();
        assert_eq!(cfg.blocks().len(), 1);
        assert!(cfg.blocks()[0].successors.is_empty());
        assert_eq!(cfg.blocks()[0].entry, 0);
        assert_eq!(cfg.blocks()[0].exit, 3);
    }

    #[test]
    fn diamond_blocks_and_predecessors() {
        // 0: const, 1: brif -> 4, 2: nop, 3: br -> 5, 4: nop, 5: ret
        let (program, method) = build_method(
            vec![
                Opcode::LoadConst,
                Opcode::BranchIf(4),
                Opcode::Nop,
                Opcode::Branch(5),
                Opcode::Nop,
                Opcode::Return,
            ],
            vec![],
        );
        let cfg = ControlFlowGraph::new(&program, method).unwrap();
        assert_eq!(cfg.blocks().len(), 4);
        assert_eq!(cfg.blocks()[0].successors.as_slice(), &[2, 4]);
        assert_eq!(cfg.blocks()[1].successors.as_slice(), &[5]);
        assert_eq!(cfg.blocks()[2].successors.as_slice(), &[5]);
        let preds = cfg.predecessors();
        assert_eq!(preds[3], vec![1, 2]);
        assert_eq!(cfg.block_containing(3), Some(1));
        assert_eq!(cfg.block_containing(5), Some(3));
    }

    #[test]
    fn leave_is_rewired_through_finally() {
        // try { 0: nop, 1: leave -> 5 } finally { 2: nop, 3: endfinally }
        // 4: nop (dead), 5: ret
        let (program, method) = build_method(
            vec![
                Opcode::Nop,
                Opcode::Leave(5),
                Opcode::Nop,
                Opcode::EndFinally,
                Opcode::Nop,
                Opcode::Return,
            ],
            vec![ExceptionHandler {
                kind: HandlerKind::Finally,
                try_start: 0,
                try_end: 2,
                handler_start: 2,
                handler_end: 4,
            }],
        );
        let cfg = ControlFlowGraph::new(&program, method).unwrap();
        // leave block -> finally entry, endfinally block -> leave target
        let leave_block = cfg.block_containing(1).unwrap();
        assert_eq!(cfg.blocks()[leave_block].successors.as_slice(), &[2]);
        let finally_block = cfg.block_containing(3).unwrap();
        assert_eq!(cfg.blocks()[finally_block].successors.as_slice(), &[5]);
    }

    #[test]
    fn unknown_opcode_is_unsupported() {
        let (program, method) = build_method(vec![Opcode::Unknown, Opcode::Return], vec![]);
        assert!(matches!(
            ControlFlowGraph::new(&program, method),
            Err(AnalysisError::UnsupportedInstruction { .. })
        ));
    }

    #[test]
    fn branch_outside_body_is_malformed() {
        let (program, method) = build_method(vec![Opcode::Branch(9)], vec![]);
        assert!(matches!(
            ControlFlowGraph::new(&program, method),
            Err(AnalysisError::MalformedMethod { .. })
        ));
    }

    #[test]
    fn region_reconstruction_groups_by_try_start() {
        let (program, method) = build_method(
            vec![
                Opcode::Nop,
                Opcode::Leave(6),
                Opcode::Pop,
                Opcode::Leave(6),
                Opcode::Nop,
                Opcode::EndFinally,
                Opcode::Return,
            ],
            vec![
                ExceptionHandler {
                    kind: HandlerKind::Catch(TypeId(0)),
                    try_start: 0,
                    try_end: 2,
                    handler_start: 2,
                    handler_end: 4,
                },
                ExceptionHandler {
                    kind: HandlerKind::Finally,
                    try_start: 0,
                    try_end: 2,
                    handler_start: 4,
                    handler_end: 6,
                },
            ],
        );
        let cfg = ControlFlowGraph::new(&program, method).unwrap();
        assert_eq!(cfg.regions().len(), 1);
        let region = &cfg.regions()[0];
        assert_eq!(region.catches.len(), 1);
        assert_eq!(region.finally, Some((4, 6)));
    }
}
