//! Spill store placement.
//!
//! When an interval is spilled inside a loop that does not contain its
//! definition, storing at every spill point would execute the store on
//! each iteration. This pass moves the canonical store of such intervals
//! to a colder dominating block: it finds the common dominator of all
//! blocks where the value sits on the stack, hoists it out of loops the
//! definition is not part of, and settles on the cheaper of that block
//! and the definition itself. The store is materialized later by the
//! spill move elimination pass.

use crate::ir::Block;
use crate::regalloc::context::LinearScan;
use crate::regalloc::interval::{IntervalId, SpillState};
use log::trace;

pub(super) fn optimize_spill_position(ls: &mut LinearScan) {
    let candidates: Vec<IntervalId> = ls
        .intervals
        .keys()
        .filter(|&id| {
            ls.intervals[id].operand.is_virt()
                && ls.intervals.is_split_parent(id)
                && ls.intervals.spill_state(id) == SpillState::SpillInDominator
        })
        .collect();

    for parent in candidates {
        let def_pos = match ls.intervals.spill_definition_pos(parent) {
            Some(p) => p,
            None => continue,
        };
        let def_block = ls.block_for_id(def_pos);

        let (spill_block, first_stack_from) = stack_dominator(ls, parent);
        let mut spill_block = match spill_block {
            Some(b) => b,
            None => {
                // the family never rests on the stack inside a numbered
                // range; keep the store at the definition
                ls.intervals.set_spill_state(parent, SpillState::StoreAtDefinition);
                continue;
            }
        };
        if !ls.domtree.dominates(def_block, spill_block) {
            spill_block = def_block;
        }

        // Climb out of loops the definition is not part of.
        let def_depth = ls.loops.loop_depth(def_block);
        while ls.loops.loop_depth(spill_block) > def_depth && spill_block != def_block {
            match ls.domtree.idom(spill_block) {
                Some(d) => spill_block = d,
                None => break,
            }
        }

        // A value already on the stack at the start of the spill block
        // must be stored before it, in the immediate dominator.
        if Some(ls.block_from(spill_block)) == first_stack_from {
            if let Some(d) = ls.domtree.idom(spill_block) {
                if ls.domtree.dominates(def_block, d) {
                    spill_block = d;
                }
            }
        }

        if spill_block == def_block
            || ls.block_frequency(spill_block) >= ls.block_frequency(def_block)
        {
            // no colder block exists; the definition itself is the store
            ls.intervals.set_spill_state(parent, SpillState::StoreAtDefinition);
        } else {
            trace!(
                "hoisting spill store of {} from {} to {}",
                ls.intervals.describe(parent),
                def_block,
                spill_block
            );
            ls.intervals
                .set_spill_definition_pos(parent, ls.block_from(spill_block));
            ls.intervals.set_spill_state(parent, SpillState::StoreAtDefinition);
        }
    }
}

/// The common dominator of every block in which a member of `parent`'s
/// family is assigned to the stack, and the lowest start position among
/// those members.
fn stack_dominator(ls: &LinearScan, parent: IntervalId) -> (Option<Block>, Option<u32>) {
    let mut dom: Option<Block> = None;
    let mut first_from: Option<u32> = None;
    let members: Vec<IntervalId> = if ls.intervals.split_children(parent).is_empty() {
        vec![parent]
    } else {
        ls.intervals.split_children(parent).to_vec()
    };
    let max_op_id = ls.max_op_id();

    for member in members {
        if !ls.intervals[member].location.is_slot() {
            continue;
        }
        let interval = &ls.intervals[member];
        first_from = Some(first_from.map_or(interval.from(), |f: u32| f.min(interval.from())));
        for i in 0..interval.num_ranges() {
            let range = interval.range(i);
            if range.from > max_op_id {
                continue;
            }
            let from_nr = ls.block_order[ls.block_for_id(range.from)];
            let last = (range.to - 1).min(max_op_id);
            let to_nr = ls.block_order[ls.block_for_id(last)];
            for nr in from_nr..=to_nr {
                let block = ls.func.layout[nr as usize];
                dom = Some(match dom {
                    Some(d) => ls.domtree.common_dominator(d, block),
                    None => block,
                });
            }
        }
    }
    (dom, first_from)
}
