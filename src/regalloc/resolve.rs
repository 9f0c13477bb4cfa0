//! Dataflow resolution across block boundaries.
//!
//! Splitting assigns different locations to different parts of one
//! value's lifetime. Within a block the walker records the connecting
//! moves itself; across control flow edges this pass compares, for every
//! value live into a successor, the location at the end of the
//! predecessor with the location at the start of the successor, and
//! inserts the moves that reconcile them. Moves for an edge go at the
//! end of the predecessor when it has a single successor, otherwise at
//! the start of the successor, which then must have a single predecessor.

use crate::bitset::BitSet;
use crate::ir::Block;
use crate::regalloc::context::LinearScan;
use crate::regalloc::interval::{IntervalId, OperandMode};
use crate::regalloc::move_resolver::MoveResolver;
use crate::result::AllocResult;
use cranelift_entity::EntityRef;
use log::trace;

pub(super) fn resolve_data_flow(ls: &mut LinearScan) -> AllocResult<()> {
    let mut resolver = MoveResolver::new(ls.reginfo.num_regs() as usize);
    let num_blocks = ls.func.layout.len();
    let mut completed = BitSet::with_capacity(num_blocks);

    // A block holding nothing but a jump is a natural home for the moves
    // of the edge that runs through it; resolving those first keeps them
    // off the surrounding blocks.
    for bi in 0..num_blocks {
        let block = ls.func.layout[bi];
        if ls.cfg.num_preds(block) != 1 || ls.cfg.num_succs(block) != 1 {
            continue;
        }
        if ls.func.blocks[block].insts.len() != 1 {
            continue;
        }
        let only = ls.func.blocks[block].insts[0];
        if !ls.func.insts[only].is_jump() {
            continue;
        }
        let pred = ls.cfg.preds(block)[0];
        let succ = ls.cfg.succs(block)[0];
        if pred == block || succ == block {
            continue;
        }
        trace!("resolving edge {} -> {} inside empty {}", pred, succ, block);
        completed.insert(bi);
        resolver.set_insert_position(ls, block, 0);
        collect_mappings(ls, &mut resolver, pred, succ)?;
    }

    let mut already = BitSet::with_capacity(num_blocks);
    for bi in 0..num_blocks {
        if completed.contains(bi) {
            continue;
        }
        let from = ls.func.layout[bi];
        already.copy_from(&completed);
        for si in 0..ls.cfg.num_succs(from) {
            let to = ls.cfg.succs(from)[si];
            let to_nr = ls.block_order[to] as usize;
            if already.contains(to_nr) {
                continue;
            }
            already.insert(to_nr);

            let (block, index) = if ls.cfg.num_succs(from) <= 1 {
                (from, ls.func.blocks[from].insts.len() - 1)
            } else {
                // a critical edge would have no safe insertion point
                debug_assert!(
                    ls.cfg.num_preds(to) <= 1,
                    "critical edge {} -> {} must be split",
                    from,
                    to
                );
                (to, 0)
            };
            resolver.set_insert_position(ls, block, index);
            collect_mappings(ls, &mut resolver, from, to)?;
        }
    }
    resolver.resolve_and_append(ls);
    Ok(())
}

/// Queue one move per value whose location at the end of `from` differs
/// from its location at the start of `to`.
fn collect_mappings(
    ls: &mut LinearScan,
    resolver: &mut MoveResolver,
    from: Block,
    to: Block,
) -> AllocResult<()> {
    let live_in: Vec<usize> = ls.live[to].live_in.iter().collect();
    let from_pos = ls.block_to(from) + 1;
    let to_pos = ls.block_from(to);
    for n in live_in {
        let parent = IntervalId::new(n);
        let from_child = ls.intervals.split_child_at(parent, from_pos, OperandMode::Def)?;
        let to_child = ls.intervals.split_child_at(parent, to_pos, OperandMode::Def)?;
        if from_child != to_child
            && ls.intervals[from_child].location != ls.intervals[to_child].location
        {
            resolver.add_mapping(ls, from_child, to_child);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dominator_tree::DominatorTree;
    use crate::flowgraph::ControlFlowGraph;
    use crate::frame::FrameMap;
    use crate::ir::{Function, InstData, ValueKind};
    use crate::loop_analysis::LoopAnalysis;
    use crate::regalloc::interval::Location;
    use crate::reginfo::{PhysReg, RegInfo};

    #[test]
    fn boundary_mismatch_gets_a_move_in_the_predecessor() {
        let mut func = Function::new();
        let b0 = func.create_block();
        let b1 = func.create_block();
        let v0 = func.new_value(ValueKind::Int);
        func.push_inst(b0, InstData::op(&[], &[v0.into()])); // id 0
        func.push_inst(b0, InstData::jump(b1)); // id 2
        func.push_inst(b1, InstData::op(&[v0.into()], &[])); // id 4
        func.push_inst(b1, InstData::ret(None)); // id 6
        let cfg = ControlFlowGraph::with_function(&func);
        let domtree = DominatorTree::with_function(&func, &cfg);
        let loops = LoopAnalysis::with_function(&func, &cfg, &domtree);
        let reginfo = RegInfo::new(2).with_int(&[0, 1]);
        let mut ls = LinearScan::new(&mut func, &reginfo, &cfg, &domtree, &loops, FrameMap::new());
        ls.number_instructions();
        ls.compute_local_live_sets();
        ls.compute_global_live_sets().unwrap();
        ls.build_intervals();

        // split at the block boundary and give the halves different
        // registers, as an eviction in b1 would
        let parent = ls.interval_for(v0.into()).unwrap();
        let child = ls.split_interval(parent, 4);
        ls.intervals[parent].location = Location::Reg(PhysReg::new(0));
        ls.intervals[child].location = Location::Reg(PhysReg::new(1));

        resolve_data_flow(&mut ls).unwrap();
        drop(ls);

        // the connecting move sits in b0, before the jump
        assert_eq!(func.blocks[b0].insts.len(), 3);
        let inserted = func.blocks[b0].insts[1];
        assert!(func.insts[inserted].id.is_none());
        assert!(func.insts[inserted].as_move().is_some());
        assert_eq!(func.blocks[b1].insts.len(), 2);
    }

    #[test]
    fn matching_locations_need_no_move() {
        let mut func = Function::new();
        let b0 = func.create_block();
        let b1 = func.create_block();
        let v0 = func.new_value(ValueKind::Int);
        func.push_inst(b0, InstData::op(&[], &[v0.into()]));
        func.push_inst(b0, InstData::jump(b1));
        func.push_inst(b1, InstData::ret(Some(v0.into())));
        let cfg = ControlFlowGraph::with_function(&func);
        let domtree = DominatorTree::with_function(&func, &cfg);
        let loops = LoopAnalysis::with_function(&func, &cfg, &domtree);
        let reginfo = RegInfo::new(2).with_int(&[0, 1]);
        let mut ls = LinearScan::new(&mut func, &reginfo, &cfg, &domtree, &loops, FrameMap::new());
        ls.number_instructions();
        ls.compute_local_live_sets();
        ls.compute_global_live_sets().unwrap();
        ls.build_intervals();
        let parent = ls.interval_for(v0.into()).unwrap();
        ls.intervals[parent].location = Location::Reg(PhysReg::new(0));

        resolve_data_flow(&mut ls).unwrap();
        drop(ls);
        assert_eq!(func.blocks[b0].insts.len(), 2);
        assert_eq!(func.blocks[b1].insts.len(), 1);
    }
}
