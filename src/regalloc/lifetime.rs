//! Lifetime analysis: instruction numbering, block liveness, and the
//! backward interval build.
//!
//! Instruction ids count in steps of two. The even position is the
//! instruction's definition point; the odd position after it orders the
//! moves the allocator inserts between instructions. Inserted
//! instructions themselves carry no id.

use crate::bitset::BitSet;
use crate::ir::{InstKind, Operand, OperandVisitor, Value, ValueKind};
use crate::regalloc::context::LinearScan;
use crate::regalloc::interval::{IntervalId, Intervals, Location, RegisterPriority, SpillState};
use crate::reginfo::PhysReg;
use crate::result::{AllocError, AllocResult};
use cranelift_entity::EntityRef;
use log::warn;
use smallvec::SmallVec;

/// Iteration cap for the global liveness fixpoint. Reducible control
/// flow stabilizes in a handful of passes; hitting the cap means the
/// graph is malformed.
const MAX_LIVENESS_ITERATIONS: u32 = 50;

/// Per-block liveness sets over operand numbers.
#[derive(Clone, Default)]
pub struct BlockLiveness {
    /// Operands read before any definition in the block.
    pub used: BitSet,
    /// Operands defined in the block.
    pub defined: BitSet,
    /// Operands live at the block entry.
    pub live_in: BitSet,
    /// Operands live at the block exit.
    pub live_out: BitSet,
}

impl<'a> LinearScan<'a> {
    /// Assign ascending even ids to all instructions in layout order and
    /// record the per-position lookup tables.
    pub(super) fn number_instructions(&mut self) {
        let mut idx: u32 = 0;
        for bi in 0..self.func.layout.len() {
            let block = self.func.layout[bi];
            self.block_order[block] = bi as u32;
            debug_assert!(
                !self.func.blocks[block].insts.is_empty(),
                "{} has no terminator",
                block
            );
            let first = idx * 2;
            for ii in 0..self.func.blocks[block].insts.len() {
                let inst = self.func.blocks[block].insts[ii];
                self.func.insts[inst].id = Some(idx * 2);
                self.op_inst.push(inst);
                self.op_block.push(block);
                self.op_has_call
                    .push(self.func.insts[inst].destroys_caller_saved());
                idx += 1;
            }
            self.block_range[block] = (first, (idx - 1) * 2);
        }
    }

    /// Compute the upward-exposed uses and the definitions of each block.
    pub(super) fn compute_local_live_sets(&mut self) {
        let num_ops = self.num_operands();
        let num_phys = self.num_phys as usize;
        let Self { func, live, .. } = self;
        for bi in 0..func.layout.len() {
            let block = func.layout[bi];
            live[block] = BlockLiveness {
                used: BitSet::with_capacity(num_ops),
                defined: BitSet::with_capacity(num_ops),
                live_in: BitSet::with_capacity(num_ops),
                live_out: BitSet::with_capacity(num_ops),
            };
            let BlockLiveness { used, defined, .. } = &mut live[block];
            let mut visitor = LocalLiveVisitor {
                used,
                defined,
                defs: SmallVec::new(),
                num_phys,
            };
            for ii in 0..func.blocks[block].insts.len() {
                let inst = func.blocks[block].insts[ii];
                func.insts[inst].visit_operands(&mut visitor);
                // Definitions kill only from the next instruction on; an
                // instruction may read the value it overwrites.
                for n in visitor.defs.drain(..) {
                    visitor.defined.insert(n);
                }
            }
        }
    }

    /// Propagate liveness backward through the flow graph to a fixpoint.
    pub(super) fn compute_global_live_sets(&mut self) -> AllocResult<()> {
        let num_ops = self.num_operands();
        let mut iterations = 0u32;
        let mut changed = true;
        while changed {
            iterations += 1;
            if iterations > MAX_LIVENESS_ITERATIONS {
                return Err(AllocError::FixpointDiverged {
                    iterations: iterations - 1,
                });
            }
            changed = false;
            for bi in (0..self.func.layout.len()).rev() {
                let block = self.func.layout[bi];
                let mut out = BitSet::with_capacity(num_ops);
                for &succ in self.cfg.succs(block) {
                    out.union_with(&self.live[succ].live_in);
                }
                let bl = &self.live[block];
                let mut input = out.clone();
                input.difference_with(&bl.defined);
                input.union_with(&bl.used);
                if out != bl.live_out || input != bl.live_in {
                    changed = true;
                    let bl = &mut self.live[block];
                    bl.live_out = out;
                    bl.live_in = input;
                }
            }
        }

        // A value live into the entry block is used before any definition.
        let entry = self.func.entry();
        if !self.live[entry].live_in.is_empty() {
            let num_phys = self.num_phys as usize;
            let names: Vec<String> = self.live[entry]
                .live_in
                .iter()
                .map(|n| Value::new(n - num_phys).to_string())
                .collect();
            return Err(AllocError::UseBeforeDef {
                operands: names.join(", "),
            });
        }
        Ok(())
    }

    /// Build one interval per operand by a single backward pass over the
    /// numbered instructions.
    pub(super) fn build_intervals(&mut self) {
        let num_phys = self.num_phys as usize;
        for i in 0..num_phys {
            let r = PhysReg::new(i);
            let id = self.intervals.push(Operand::Reg(r), ValueKind::Int);
            self.intervals[id].location = Location::Reg(r);
        }
        for i in 0..self.func.num_values() {
            let v = Value::new(i);
            let id = self.intervals.push(Operand::Virt(v), self.func.value_kind(v));
            debug_assert_eq!(id.index(), num_phys + i);
        }

        let caller_saved: Vec<PhysReg> = self.reginfo.caller_saved().to_vec();
        let Self {
            func,
            intervals,
            live,
            block_range,
            loops,
            ..
        } = self;

        for bi in (0..func.layout.len()).rev() {
            let block = func.layout[bi];
            let (block_from, block_to) = block_range[block];

            // Values live out of the block survive all of it.
            let loop_end = loops.is_loop_end(block);
            for n in live[block].live_out.iter() {
                let id = IntervalId::new(n);
                intervals[id].add_range(block_from, block_to + 2);
                if loop_end {
                    // Keep the value in a register across the back edge if
                    // at all possible.
                    intervals.add_use_pos(id, block_to + 1, RegisterPriority::LiveAtLoopEnd);
                }
            }

            for ii in (0..func.blocks[block].insts.len()).rev() {
                let inst = func.blocks[block].insts[ii];
                let op_id = func.insts[inst].id.expect("instructions are numbered");

                if func.insts[inst].destroys_caller_saved() {
                    for &r in &caller_saved {
                        intervals[IntervalId::new(r.index())].add_range(op_id, op_id + 1);
                    }
                }

                let (def_prio, use_prio) = match func.insts[inst].kind {
                    // An incoming stack argument needs no register at all
                    // at its definition; other moves merely prefer one.
                    InstKind::Move {
                        src: Operand::Slot(_),
                        ..
                    } => (RegisterPriority::None, RegisterPriority::ShouldHaveRegister),
                    InstKind::Move { .. } => (
                        RegisterPriority::ShouldHaveRegister,
                        RegisterPriority::ShouldHaveRegister,
                    ),
                    _ => (
                        RegisterPriority::MustHaveRegister,
                        RegisterPriority::MustHaveRegister,
                    ),
                };
                let current_const = match func.insts[inst].kind {
                    InstKind::LoadConst { value, .. } => Some(value),
                    _ => None,
                };
                let mut visitor = IntervalBuilder {
                    intervals,
                    num_phys,
                    block_from,
                    op_id,
                    def_prio,
                    use_prio,
                    current_const,
                };
                func.insts[inst].visit_operands(&mut visitor);

                if let InstKind::Move { src, dst } = func.insts[inst].kind {
                    let to_id = match dst {
                        Operand::Virt(v) => Some(IntervalId::new(num_phys + v.index())),
                        Operand::Reg(r) => Some(IntervalId::new(r.index())),
                        _ => None,
                    };
                    let from_id = match src {
                        Operand::Virt(v) => Some(IntervalId::new(num_phys + v.index())),
                        Operand::Reg(r) => Some(IntervalId::new(r.index())),
                        _ => None,
                    };
                    // Move destinations prefer the register of their source.
                    if let (Some(from_id), Some(to_id)) = (from_id, to_id) {
                        intervals[to_id].location_hint = from_id.into();
                    }
                    // An incoming stack argument starts life in memory; its
                    // slot doubles as the canonical spill slot.
                    if let (Operand::Slot(slot), Some(to_id)) = (src, to_id) {
                        if dst.is_virt() {
                            if intervals.spill_slot(to_id).is_none() {
                                intervals.set_spill_slot(to_id, slot);
                            }
                            intervals[to_id].location = Location::Slot(slot);
                            if intervals.spill_state(to_id) < SpillState::StartInMemory {
                                intervals.set_spill_state(to_id, SpillState::StartInMemory);
                            }
                        }
                    }
                }
            }
        }

        // Rematerializing at a use that tolerates the stack would only add
        // register pressure; such constants keep their spill slot.
        for i in 0..func.num_values() {
            let id = IntervalId::new(num_phys + i);
            if intervals.materialized_value(id).is_some() {
                let uses = intervals[id].use_positions();
                let has_should = (0..uses.len())
                    .any(|k| uses.priority(k) == RegisterPriority::ShouldHaveRegister);
                if has_should {
                    intervals.clear_materialization(id);
                }
            }
        }
    }

    /// Collect the non-empty intervals sorted by start position.
    pub(super) fn sort_intervals(&mut self) {
        let intervals = &self.intervals;
        self.sorted = intervals
            .keys()
            .filter(|&id| !intervals[id].is_empty())
            .collect();
        self.sorted.sort_by_key(|&id| intervals[id].from());
    }
}

/// Builds the local `used`/`defined` sets of one block.
struct LocalLiveVisitor<'a> {
    used: &'a mut BitSet,
    defined: &'a mut BitSet,
    defs: SmallVec<[usize; 2]>,
    num_phys: usize,
}

impl LocalLiveVisitor<'_> {
    fn record_use(&mut self, op: Operand) {
        if let Operand::Virt(v) = op {
            let n = self.num_phys + v.index();
            if !self.defined.contains(n) {
                self.used.insert(n);
            }
        }
    }
}

impl OperandVisitor for LocalLiveVisitor<'_> {
    fn visit_input(&mut self, op: &mut Operand) {
        self.record_use(*op);
    }

    fn visit_use(&mut self, op: &mut Operand) {
        self.record_use(*op);
    }

    fn visit_state(&mut self, op: &mut Operand) {
        self.record_use(*op);
    }

    fn visit_temp(&mut self, op: &mut Operand) {
        if let Operand::Virt(v) = *op {
            self.defs.push(self.num_phys + v.index());
        }
    }

    fn visit_def(&mut self, op: &mut Operand) {
        if let Operand::Virt(v) = *op {
            self.defs.push(self.num_phys + v.index());
        }
    }
}

/// Adds the ranges and use positions of one instruction's operands.
struct IntervalBuilder<'a> {
    intervals: &'a mut Intervals,
    num_phys: usize,
    block_from: u32,
    op_id: u32,
    def_prio: RegisterPriority,
    use_prio: RegisterPriority,
    current_const: Option<i64>,
}

impl IntervalBuilder<'_> {
    fn id_for(&self, op: Operand) -> Option<IntervalId> {
        match op {
            Operand::Reg(r) => Some(IntervalId::new(r.index())),
            Operand::Virt(v) => Some(IntervalId::new(self.num_phys + v.index())),
            Operand::Slot(_) | Operand::Const(_) => None,
        }
    }

    fn add_def(&mut self, op: Operand) {
        let id = match self.id_for(op) {
            Some(id) => id,
            None => return,
        };
        let interval = &mut self.intervals[id];
        if !interval.is_empty() && interval.from() <= self.op_id {
            // The live range started by later uses begins here.
            interval.set_from(self.op_id);
            self.intervals.add_use_pos(id, self.op_id, self.def_prio);
        } else {
            // The value is never read; keep it alive over the defining
            // instruction only.
            interval.add_range(self.op_id, self.op_id + 1);
            self.intervals.add_use_pos(id, self.op_id, self.def_prio);
            if op.is_virt() {
                warn!("dead definition of {} at position {}", op, self.op_id);
            }
        }
        if op.is_virt() {
            self.change_spill_definition_pos(id, self.op_id);
            match self.current_const {
                Some(value) => self.intervals.add_materialization_value(id, value),
                None => self.intervals.clear_materialization(id),
            }
        }
    }

    fn add_temp(&mut self, op: Operand) {
        let id = match self.id_for(op) {
            Some(id) => id,
            None => return,
        };
        self.intervals[id].add_range(self.op_id, self.op_id + 1);
        self.intervals
            .add_use_pos(id, self.op_id, RegisterPriority::MustHaveRegister);
    }

    fn add_use(&mut self, op: Operand, to: u32, priority: RegisterPriority) {
        let id = match self.id_for(op) {
            Some(id) => id,
            None => return,
        };
        // A use at the first instruction of a block leaves no room for a
        // range before it; keep the value alive over the instruction.
        let to = to.max(self.block_from + 1);
        self.intervals[id].add_range(self.block_from, to);
        self.intervals.add_use_pos(id, to & !1, priority);
    }

    fn change_spill_definition_pos(&mut self, id: IntervalId, def_pos: u32) {
        match self.intervals.spill_state(id) {
            SpillState::NoDefinitionFound => {
                self.intervals.set_spill_definition_pos(id, def_pos);
                self.intervals.set_spill_state(id, SpillState::NoSpillStore);
            }
            SpillState::NoSpillStore => {
                let cur = self.intervals.spill_definition_pos(id).unwrap_or(def_pos);
                debug_assert!(def_pos <= cur, "definitions arrive in descending order");
                if def_pos + 2 < cur {
                    // A second definition: one canonical store cannot
                    // cover both.
                    self.intervals
                        .set_spill_state(id, SpillState::NoOptimization);
                }
            }
            _ => {}
        }
    }
}

impl OperandVisitor for IntervalBuilder<'_> {
    fn visit_def(&mut self, op: &mut Operand) {
        self.add_def(*op);
    }

    fn visit_temp(&mut self, op: &mut Operand) {
        self.add_temp(*op);
    }

    fn visit_use(&mut self, op: &mut Operand) {
        // Kept alive across the instruction, so it may not share a
        // register with an output.
        self.add_use(*op, self.op_id + 1, self.use_prio);
    }

    fn visit_input(&mut self, op: &mut Operand) {
        self.add_use(*op, self.op_id, self.use_prio);
    }

    fn visit_state(&mut self, op: &mut Operand) {
        // State operands keep the value alive but never force a register:
        // a stack copy is as good for debugging.
        self.add_use(*op, self.op_id + 1, RegisterPriority::None);
    }
}
