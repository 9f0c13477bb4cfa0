//! Ordering and insertion of parallel move groups.
//!
//! The walker and the dataflow resolver both produce sets of moves that
//! are conceptually parallel: all sources are read before any destination
//! is written. The resolver serializes each group so that no move
//! overwrites a register another pending move still reads, breaking
//! cycles through the source's spill slot, and splices the result into
//! the instruction stream through an [`InsertionBuffer`].

use crate::frame::SpillSlot;
use crate::ir::{Block, InsertionBuffer, InstData, Operand};
use crate::regalloc::context::LinearScan;
use crate::regalloc::interval::IntervalId;
use cranelift_entity::EntityRef;
use log::trace;

/// Where a pending move reads its value from.
#[derive(Clone, Copy, Debug)]
enum MoveSource {
    /// The location of an interval.
    Interval(IntervalId),
    /// A rematerialized constant.
    Const(i64),
    /// A spill slot, used after a cycle break retargets the source.
    Stack(SpillSlot),
}

/// One pending move into the location of `to`.
struct Mapping {
    from: MoveSource,
    to: IntervalId,
}

/// Collects mappings for one insertion point at a time and emits them in
/// a safe order when the insertion point changes.
pub(super) struct MoveResolver {
    mappings: Vec<Mapping>,
    insert: Option<(Block, usize)>,
    buffer: InsertionBuffer,
    /// Number of pending moves reading each register.
    blocked: Vec<u32>,
}

impl MoveResolver {
    pub(super) fn new(num_regs: usize) -> Self {
        Self {
            mappings: Vec::new(),
            insert: None,
            buffer: InsertionBuffer::new(),
            blocked: vec![0; num_regs],
        }
    }

    /// Direct the next mappings to be inserted before `index` in `block`.
    /// Pending mappings for a previous position are emitted first.
    pub(super) fn set_insert_position(
        &mut self,
        ls: &mut LinearScan,
        block: Block,
        index: usize,
    ) {
        if self.insert == Some((block, index)) {
            return;
        }
        if self.insert.is_some() && !self.mappings.is_empty() {
            self.resolve_mappings(ls);
        }
        self.insert = Some((block, index));
    }

    /// Record a move of `from`'s value into `to`'s location.
    pub(super) fn add_mapping(&mut self, ls: &LinearScan, from: IntervalId, to: IntervalId) {
        if ls.intervals[to].location.is_none() && ls.intervals.can_materialize(to) {
            // the destination is reconstructed from its constant at each
            // use; no move is needed
            return;
        }
        let from = match ls.intervals.materialized_value(from) {
            Some(value) => MoveSource::Const(value),
            None => MoveSource::Interval(from),
        };
        trace!(
            "mapping {:?} -> {}",
            from,
            ls.intervals.describe(to)
        );
        self.mappings.push(Mapping { from, to });
    }

    /// Emit all pending mappings and splice everything buffered so far
    /// into the function.
    pub(super) fn resolve_and_append(&mut self, ls: &mut LinearScan) {
        if !self.mappings.is_empty() {
            self.resolve_mappings(ls);
        }
        self.buffer.finish(&mut ls.func);
        self.insert = None;
    }

    fn resolve_mappings(&mut self, ls: &mut LinearScan) {
        debug_assert!(self.insert.is_some(), "no insertion position for mappings");

        for m in &self.mappings {
            if let MoveSource::Interval(src) = m.from {
                if let Some(r) = ls.intervals[src].location.as_reg() {
                    self.blocked[r.index()] += 1;
                }
            }
        }

        while !self.mappings.is_empty() {
            let mut progress = false;
            let mut i = 0;
            while i < self.mappings.len() {
                if self.processable(ls, i) {
                    let mapping = self.mappings.remove(i);
                    self.emit_mapping(ls, &mapping);
                    if let MoveSource::Interval(src) = mapping.from {
                        if let Some(r) = ls.intervals[src].location.as_reg() {
                            self.blocked[r.index()] -= 1;
                        }
                    }
                    progress = true;
                } else {
                    i += 1;
                }
            }
            if !progress {
                self.break_cycle(ls);
            }
        }
    }

    /// A mapping may be emitted when no pending move still reads its
    /// destination register. A destination read only by the mapping's own
    /// source is a self-move and always safe.
    fn processable(&self, ls: &LinearScan, index: usize) -> bool {
        let mapping = &self.mappings[index];
        let r = match ls.intervals[mapping.to].location.as_reg() {
            Some(r) => r,
            // Stack destinations are never sources of other mappings.
            None => return true,
        };
        if self.blocked[r.index()] == 0 {
            return true;
        }
        match mapping.from {
            MoveSource::Interval(src) => {
                self.blocked[r.index()] == 1
                    && ls.intervals[src].location.as_reg() == Some(r)
            }
            _ => false,
        }
    }

    /// All remaining mappings form one or more cycles. Park the value of
    /// one register source in its spill slot and retarget its mapping to
    /// read the slot, unblocking the register.
    fn break_cycle(&mut self, ls: &mut LinearScan) {
        let index = self
            .mappings
            .iter()
            .position(|m| {
                matches!(m.from, MoveSource::Interval(src)
                    if ls.intervals[src].location.is_reg())
            })
            .expect("a cycle always contains a register source");
        let src = match self.mappings[index].from {
            MoveSource::Interval(src) => src,
            _ => unreachable!(),
        };
        let r = ls.intervals[src].location.as_reg().expect("source is in a register");
        let slot = match ls.intervals.spill_slot(src) {
            Some(slot) => slot,
            None => {
                let kind = ls.intervals[src].kind;
                let slot = ls.frame.alloc_spill_slot(kind);
                ls.intervals.set_spill_slot(src, slot);
                slot
            }
        };
        trace!("breaking move cycle through {}", slot);
        let data = InstData::mov(Operand::Slot(slot), ls.intervals[src].operand);
        self.emit(ls, data);
        self.blocked[r.index()] -= 1;
        self.mappings[index].from = MoveSource::Stack(slot);
    }

    fn emit_mapping(&mut self, ls: &mut LinearScan, mapping: &Mapping) {
        let dst = ls.intervals[mapping.to].operand;
        let data = match mapping.from {
            MoveSource::Interval(src) => InstData::mov(dst, ls.intervals[src].operand),
            MoveSource::Const(value) => InstData::load_const(dst, value),
            MoveSource::Stack(slot) => InstData::mov(dst, Operand::Slot(slot)),
        };
        self.emit(ls, data);
    }

    fn emit(&mut self, ls: &mut LinearScan, data: InstData) {
        let (block, index) = self.insert.expect("insert position is set");
        if self.buffer.block() != Some(block) {
            self.buffer.finish(&mut ls.func);
            self.buffer.init(block);
        }
        let inst = ls.func.make_inst(data);
        self.buffer.append(index, inst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dominator_tree::DominatorTree;
    use crate::flowgraph::ControlFlowGraph;
    use crate::frame::FrameMap;
    use crate::ir::{Function, InstKind, ValueKind};
    use crate::loop_analysis::LoopAnalysis;
    use crate::regalloc::interval::Location;
    use crate::reginfo::{PhysReg, RegInfo};

    fn ordered_kinds(func: &Function, block: Block) -> Vec<String> {
        func.blocks[block]
            .insts
            .iter()
            .filter(|&&i| func.insts[i].id.is_none())
            .map(|&i| match &func.insts[i].kind {
                InstKind::Move { src, dst } => format!("{} <- {}", dst, src),
                InstKind::LoadConst { dst, value } => format!("{} <- #{}", dst, value),
                other => panic!("unexpected inserted instruction {:?}", other),
            })
            .collect()
    }

    #[test]
    fn swap_is_broken_through_memory() {
        let mut func = Function::new();
        let b0 = func.create_block();
        let v0 = func.new_value(ValueKind::Int);
        let v1 = func.new_value(ValueKind::Int);
        func.push_inst(b0, InstData::op(&[], &[v0.into(), v1.into()]));
        func.push_inst(b0, InstData::ret(None));
        let cfg = ControlFlowGraph::with_function(&func);
        let domtree = DominatorTree::with_function(&func, &cfg);
        let loops = LoopAnalysis::with_function(&func, &cfg, &domtree);
        let reginfo = RegInfo::new(2).with_int(&[0, 1]);
        let mut ls = LinearScan::new(&mut func, &reginfo, &cfg, &domtree, &loops, FrameMap::new());
        ls.number_instructions();
        ls.compute_local_live_sets();
        ls.compute_global_live_sets().unwrap();
        ls.build_intervals();
        let i0 = ls.interval_for(v0.into()).unwrap();
        let i1 = ls.interval_for(v1.into()).unwrap();
        ls.intervals[i0].location = Location::Reg(PhysReg::new(0));
        ls.intervals[i1].location = Location::Reg(PhysReg::new(1));

        let mut resolver = MoveResolver::new(2);
        resolver.set_insert_position(&mut ls, b0, 1);
        // each destination's register is the other mapping's source
        resolver.add_mapping(&ls, i0, i1);
        resolver.add_mapping(&ls, i1, i0);
        resolver.resolve_and_append(&mut ls);

        // v0 is parked in its slot, which unblocks r0 for the second
        // mapping; the retargeted first mapping reloads from the slot
        assert_eq!(
            ordered_kinds(&func, b0),
            vec!["ss0 <- v0", "v0 <- v1", "v1 <- ss0"]
        );
        assert_eq!(func.blocks[b0].insts.len(), 5);
    }

    #[test]
    fn chains_are_ordered_and_constants_reloaded() {
        let mut func = Function::new();
        let b0 = func.create_block();
        let v0 = func.new_value(ValueKind::Int);
        let v1 = func.new_value(ValueKind::Int);
        let v2 = func.new_value(ValueKind::Int);
        func.push_inst(b0, InstData::load_const(v0.into(), 9));
        func.push_inst(b0, InstData::op(&[], &[v1.into(), v2.into()]));
        func.push_inst(b0, InstData::ret(None));
        let cfg = ControlFlowGraph::with_function(&func);
        let domtree = DominatorTree::with_function(&func, &cfg);
        let loops = LoopAnalysis::with_function(&func, &cfg, &domtree);
        let reginfo = RegInfo::new(3).with_int(&[0, 1, 2]);
        let mut ls = LinearScan::new(&mut func, &reginfo, &cfg, &domtree, &loops, FrameMap::new());
        ls.number_instructions();
        ls.compute_local_live_sets();
        ls.compute_global_live_sets().unwrap();
        ls.build_intervals();
        let i0 = ls.interval_for(v0.into()).unwrap();
        let i1 = ls.interval_for(v1.into()).unwrap();
        let i2 = ls.interval_for(v2.into()).unwrap();
        ls.intervals[i1].location = Location::Reg(PhysReg::new(1));
        ls.intervals[i2].location = Location::Reg(PhysReg::new(2));

        let mut resolver = MoveResolver::new(3);
        resolver.set_insert_position(&mut ls, b0, 2);
        // v1 -> v2 must wait until v2's old value has moved on... except
        // v2's value goes nowhere, so the chain resolves head first
        resolver.add_mapping(&ls, i1, i2);
        // v0 is rematerializable: the mapping loads the constant
        resolver.add_mapping(&ls, i0, i1);
        resolver.resolve_and_append(&mut ls);

        // no cycle, no spill slot
        assert!(ls.frame.is_empty());
        drop(ls);
        assert_eq!(
            ordered_kinds(&func, b0),
            vec!["v2 <- v1", "v1 <- #9"]
        );
    }
}
