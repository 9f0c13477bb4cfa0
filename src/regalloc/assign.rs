//! Final operand rewriting.
//!
//! Every virtual operand occurrence is replaced by the location of the
//! split child covering its position: a register, a spill slot, or the
//! rematerialized constant. Moves that end up copying a location onto
//! itself are deleted, as are constant definitions whose value is
//! reconstructed at every use.

use crate::ir::{Operand, OperandVisitor};
use crate::regalloc::context::LinearScan;
use crate::regalloc::interval::{IntervalId, Intervals, Location, OperandMode};
use crate::result::{AllocError, AllocResult};
use crate::result::VerifierError;
use core::mem;
use cranelift_entity::EntityRef;
use log::trace;

pub(super) fn assign_locations(ls: &mut LinearScan) -> AllocResult<()> {
    for bi in 0..ls.func.layout.len() {
        let block = ls.func.layout[bi];
        let insts = mem::take(&mut ls.func.blocks[block].insts);
        let mut out = Vec::with_capacity(insts.len());
        for inst in insts {
            let (pos, state_pos, state_mode, direct) = match ls.func.insts[inst].id {
                Some(op_id) => {
                    // State observed at an unconditional jump describes the
                    // successor's entry, where a boundary move may already
                    // have retargeted the value.
                    let (state_pos, state_mode) = if ls.func.insts[inst].is_jump()
                        && ls.cfg.num_succs(block) == 1
                    {
                        (ls.block_from(ls.cfg.succs(block)[0]), OperandMode::Def)
                    } else {
                        (op_id, OperandMode::Use)
                    };
                    (op_id, state_pos, state_mode, false)
                }
                // Inserted moves name their split child directly.
                None => (0, 0, OperandMode::Use, true),
            };

            let LinearScan {
                ref mut func,
                ref mut intervals,
                num_phys,
                ..
            } = *ls;
            let mut visitor = AssignVisitor {
                intervals,
                num_phys: num_phys as usize,
                pos,
                state_pos,
                state_mode,
                direct,
                error: None,
                dead_const_def: false,
            };
            func.insts[inst].visit_operands(&mut visitor);
            if let Some(e) = visitor.error {
                return Err(AllocError::Verifier(e));
            }
            if visitor.dead_const_def {
                trace!("deleting dead constant definition at {:?}", ls.func.insts[inst].id);
                continue;
            }
            if let Some((dst, src)) = ls.func.insts[inst].as_move() {
                if dst == src {
                    continue;
                }
            }
            out.push(inst);
        }
        ls.func.blocks[block].insts = out;
    }
    Ok(())
}

/// Rewrites the operands of one instruction.
struct AssignVisitor<'a> {
    intervals: &'a mut Intervals,
    num_phys: usize,
    pos: u32,
    state_pos: u32,
    state_mode: OperandMode,
    direct: bool,
    error: Option<VerifierError>,
    /// Set when a definition's value is rematerialized at every use, so
    /// the defining instruction is dead.
    dead_const_def: bool,
}

impl AssignVisitor<'_> {
    fn resolve(&mut self, op: &mut Operand, pos: u32, mode: OperandMode, is_def: bool) {
        let v = match *op {
            Operand::Virt(v) => v,
            _ => return,
        };
        let id = IntervalId::new(self.num_phys + v.index());
        let child = if self.direct {
            id
        } else {
            match self.intervals.split_child_at(id, pos, mode) {
                Ok(child) => child,
                Err(e) => {
                    if self.error.is_none() {
                        self.error = Some(e);
                    }
                    return;
                }
            }
        };
        *op = match self.intervals[child].location {
            Location::Reg(r) => Operand::Reg(r),
            Location::Slot(slot) => Operand::Slot(slot),
            Location::None => {
                let value = self
                    .intervals
                    .materialized_value(child)
                    .expect("an unlocated interval is rematerializable");
                if is_def {
                    self.dead_const_def = true;
                    return;
                }
                Operand::Const(value)
            }
        };
    }
}

impl OperandVisitor for AssignVisitor<'_> {
    fn visit_def(&mut self, op: &mut Operand) {
        let pos = self.pos;
        self.resolve(op, pos, OperandMode::Def, true);
    }

    fn visit_temp(&mut self, op: &mut Operand) {
        let pos = self.pos;
        self.resolve(op, pos, OperandMode::Def, true);
    }

    fn visit_use(&mut self, op: &mut Operand) {
        let pos = self.pos;
        self.resolve(op, pos, OperandMode::Use, false);
    }

    fn visit_input(&mut self, op: &mut Operand) {
        let pos = self.pos;
        self.resolve(op, pos, OperandMode::Use, false);
    }

    fn visit_state(&mut self, op: &mut Operand) {
        let pos = self.state_pos;
        let mode = self.state_mode;
        self.resolve(op, pos, mode, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dominator_tree::DominatorTree;
    use crate::flowgraph::ControlFlowGraph;
    use crate::frame::FrameMap;
    use crate::ir::{Function, InstData, InstKind, ValueKind};
    use crate::loop_analysis::LoopAnalysis;
    use crate::reginfo::{PhysReg, RegInfo};

    fn prepared(func: &mut Function, reginfo: &RegInfo) -> (ControlFlowGraph, DominatorTree, LoopAnalysis) {
        let _ = reginfo;
        let cfg = ControlFlowGraph::with_function(func);
        let domtree = DominatorTree::with_function(func, &cfg);
        let loops = LoopAnalysis::with_function(func, &cfg, &domtree);
        (cfg, domtree, loops)
    }

    #[test]
    fn operands_are_rewritten_per_split_child() {
        let mut func = Function::new();
        let b0 = func.create_block();
        let v0 = func.new_value(ValueKind::Int);
        func.push_inst(b0, InstData::op(&[], &[v0.into()])); // id 0
        func.push_inst(b0, InstData::op(&[v0.into()], &[])); // id 2
        func.push_inst(b0, InstData::op(&[v0.into()], &[])); // id 4
        func.push_inst(b0, InstData::ret(None)); // id 6
        let reginfo = RegInfo::new(2).with_int(&[0, 1]);
        let (cfg, domtree, loops) = prepared(&mut func, &reginfo);
        let mut ls = LinearScan::new(&mut func, &reginfo, &cfg, &domtree, &loops, FrameMap::new());
        ls.number_instructions();
        ls.compute_local_live_sets();
        ls.compute_global_live_sets().unwrap();
        ls.build_intervals();

        let parent = ls.interval_for(v0.into()).unwrap();
        let child = ls.split_interval(parent, 3);
        ls.intervals[parent].location = Location::Reg(PhysReg::new(0));
        ls.assign_spill_slot(child);

        assign_locations(&mut ls).unwrap();
        drop(ls);

        let op_input = |i: usize| match &func.insts[func.blocks[b0].insts[i]].kind {
            InstKind::Op { inputs, .. } => inputs[0],
            other => panic!("unexpected {:?}", other),
        };
        // the use before the split reads the register, the one after
        // reads the slot
        assert!(op_input(1).is_reg());
        assert!(op_input(2).is_slot());
    }

    #[test]
    fn rematerialized_values_become_constants() {
        let mut func = Function::new();
        let b0 = func.create_block();
        let v0 = func.new_value(ValueKind::Int);
        let v1 = func.new_value(ValueKind::Int);
        func.push_inst(b0, InstData::load_const(v0.into(), 11)); // id 0
        func.push_inst(b0, InstData::op(&[], &[v1.into()]).with_state(&[v0.into()])); // id 2
        func.push_inst(b0, InstData::ret(Some(v1.into()))); // id 4
        let reginfo = RegInfo::new(2).with_int(&[0, 1]);
        let (cfg, domtree, loops) = prepared(&mut func, &reginfo);
        let mut ls = LinearScan::new(&mut func, &reginfo, &cfg, &domtree, &loops, FrameMap::new());
        ls.number_instructions();
        ls.compute_local_live_sets();
        ls.compute_global_live_sets().unwrap();
        ls.build_intervals();

        // the constant is never allocated anywhere
        let i0 = ls.interval_for(v0.into()).unwrap();
        assert_eq!(ls.intervals[i0].location, Location::None);
        let i1 = ls.interval_for(v1.into()).unwrap();
        ls.intervals[i1].location = Location::Reg(PhysReg::new(0));

        assign_locations(&mut ls).unwrap();
        drop(ls);

        // the dead constant definition is deleted and the state operand
        // reads the constant directly
        assert_eq!(func.blocks[b0].insts.len(), 2);
        let first = &func.insts[func.blocks[b0].insts[0]];
        assert!(matches!(first.kind, InstKind::Op { .. }));
        assert_eq!(first.state[0], Operand::Const(11));
    }
}
