//! Spill move elimination and canonical store insertion.
//!
//! The walker inserts a store move at every position where a value is
//! spilled. For intervals whose spill state promises that the stack copy
//! is always current, all of those moves are redundant except one: this
//! pass deletes them and inserts the single canonical store right after
//! the spill definition position, which the spill position optimizer may
//! have hoisted to a colder block.

use crate::ir::{InstData, Operand};
use crate::regalloc::context::LinearScan;
use crate::regalloc::interval::{IntervalId, Location, OperandMode, SpillState};
use core::mem;
use cranelift_entity::EntityRef;
use log::trace;

pub(super) fn eliminate_spill_moves(ls: &mut LinearScan) {
    // One canonical store per family with a settled store position.
    let mut stores: Vec<(u32, IntervalId)> = ls
        .intervals
        .keys()
        .filter(|&id| {
            ls.intervals[id].operand.is_virt()
                && ls.intervals.is_split_parent(id)
                && ls.intervals.spill_state(id) == SpillState::StoreAtDefinition
                && !ls.intervals.can_materialize(id)
                && ls.intervals.spill_slot(id).is_some()
        })
        .filter_map(|id| ls.intervals.spill_definition_pos(id).map(|pos| (pos, id)))
        .collect();
    stores.sort_by_key(|&(pos, _)| pos);
    let mut next = 0usize;

    let num_phys = ls.num_phys as usize;
    for bi in 0..ls.func.layout.len() {
        let block = ls.func.layout[bi];
        let insts = mem::take(&mut ls.func.blocks[block].insts);
        let mut out = Vec::with_capacity(insts.len());
        for inst in insts {
            let data = &ls.func.insts[inst];
            let op_id = match data.id {
                Some(op_id) => op_id,
                None => {
                    // An inserted store into an always-in-memory interval
                    // duplicates the canonical store.
                    if let Some((Operand::Virt(v), _)) = data.as_move() {
                        let id = IntervalId::new(num_phys + v.index());
                        if !ls.intervals[id].location.is_reg() && ls.intervals.always_in_memory(id)
                        {
                            trace!(
                                "eliminating spill move into {}",
                                ls.intervals.describe(id)
                            );
                            continue;
                        }
                    }
                    out.push(inst);
                    continue;
                }
            };
            out.push(inst);

            while next < stores.len() && stores[next].0 == op_id {
                let (pos, parent) = stores[next];
                next += 1;
                let child = match ls.intervals.split_child_at(parent, pos, OperandMode::Def) {
                    Ok(child) => child,
                    Err(_) => continue,
                };
                match ls.intervals[child].location {
                    Location::Reg(r) => {
                        let slot = ls
                            .intervals
                            .spill_slot(parent)
                            .expect("store candidates have a spill slot");
                        trace!(
                            "canonical store for {} at {}",
                            ls.intervals.describe(parent),
                            pos
                        );
                        let store =
                            ls.func
                                .make_inst(InstData::mov(Operand::Slot(slot), Operand::Reg(r)));
                        out.push(store);
                    }
                    _ => {
                        // already on the stack here; the walker's own move
                        // covered it
                        trace!(
                            "no canonical store for {}: not in a register at {}",
                            ls.intervals.describe(parent),
                            pos
                        );
                    }
                }
            }
        }
        ls.func.blocks[block].insts = out;
    }
}
