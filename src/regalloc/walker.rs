//! The allocation walk.
//!
//! Intervals move through `unhandled -> {active <-> inactive} -> handled`
//! as a position cursor advances over their sorted start positions. Each
//! activation tries free-register allocation first and falls back to
//! evicting or spilling; both paths split intervals at positions chosen
//! to keep reloads out of loops.

use crate::ir::Block;
use crate::regalloc::context::LinearScan;
use crate::regalloc::interval::{
    intersects_at, IntervalId, Location, OperandMode, RegisterPriority, SpillState, MAX_POS,
};
use crate::regalloc::move_resolver::MoveResolver;
use crate::reginfo::PhysReg;
use crate::result::{AllocError, AllocResult};
use core::marker::PhantomData;
use core::mem;
use cranelift_entity::{EntityRef, SecondaryMap};
use log::trace;

const FIXED_LIST: usize = 0;
const ANY_LIST: usize = 1;
const STACK_LIST: usize = 2;

/// Whether an interval sat in the active or the inactive list when it was
/// collected for spilling.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Membership {
    Active,
    Inactive,
}

/// Where an interval's range chain stands relative to the cursor.
enum RangeState {
    /// A range covers the position.
    Covers,
    /// The position falls in a lifetime hole.
    Hole,
    /// All ranges lie behind the position.
    Done,
}

/// A pluggable refinement of the walk; the core state machine is the
/// same for every strategy.
pub trait WalkStrategy {
    /// Invoked once whenever the walk position first reaches the start
    /// of `block`.
    fn block_boundary(_walker: &mut Walker<'_, '_, Self>, _block: Block)
    where
        Self: Sized,
    {
    }
}

/// The default strategy: block boundaries get no special treatment;
/// boundary mismatches are left to the dataflow resolver.
pub struct Standard;

impl WalkStrategy for Standard {}

/// Re-homes intervals entering a single-predecessor block to the
/// location they had at the end of that predecessor when the register is
/// free, saving a resolution move on the edge.
pub struct Optimizing;

impl WalkStrategy for Optimizing {
    fn block_boundary(walker: &mut Walker<'_, '_, Self>, block: Block) {
        walker.rehome_at_block_boundary(block);
    }
}

/// Run the allocation walk over all sorted intervals.
pub(super) fn allocate_registers<S: WalkStrategy>(ls: &mut LinearScan) -> AllocResult<()> {
    Walker::<S>::new(ls).walk()
}

/// The walk state: the binding-partitioned interval lists, the per
/// register scratch arrays used by the allocation decisions, and the
/// move resolver collecting split moves.
pub struct Walker<'a, 'f, S: WalkStrategy = Standard> {
    ls: &'a mut LinearScan<'f>,
    unhandled: [Vec<IntervalId>; 3],
    active: [Vec<IntervalId>; 2],
    inactive: [Vec<IntervalId>; 2],
    /// Index of the first range not yet behind the cursor, per interval.
    range_cursor: SecondaryMap<IntervalId, u32>,
    cur_pos: u32,
    next_block: usize,
    resolver: MoveResolver,
    /// Allocatable registers for the interval being activated.
    avail: Vec<PhysReg>,
    use_pos: Vec<u32>,
    block_pos: Vec<u32>,
    spill_lists: Vec<Vec<(IntervalId, Membership)>>,
    _strategy: PhantomData<S>,
}

impl<'a, 'f, S: WalkStrategy> Walker<'a, 'f, S> {
    fn new(ls: &'a mut LinearScan<'f>) -> Self {
        let num_regs = ls.reginfo.num_regs() as usize;
        let mut unhandled: [Vec<IntervalId>; 3] = [Vec::new(), Vec::new(), Vec::new()];
        let mut inactive: [Vec<IntervalId>; 2] = [Vec::new(), Vec::new()];
        for &id in &ls.sorted {
            let interval = &ls.intervals[id];
            if interval.operand.is_reg() {
                // Fixed intervals hold their register for the whole walk;
                // they enter the in-flight lists directly and surface as
                // active wherever a clobber range covers the position.
                inactive[FIXED_LIST].push(id);
                continue;
            }
            let li = if interval.location.is_slot() {
                STACK_LIST
            } else {
                ANY_LIST
            };
            unhandled[li].push(id);
        }
        Self {
            ls,
            unhandled,
            active: [Vec::new(), Vec::new()],
            inactive,
            range_cursor: SecondaryMap::new(),
            cur_pos: 0,
            next_block: 1,
            resolver: MoveResolver::new(num_regs),
            avail: Vec::new(),
            use_pos: vec![0; num_regs],
            block_pos: vec![0; num_regs],
            spill_lists: vec![Vec::new(); num_regs],
            _strategy: PhantomData,
        }
    }

    fn walk(mut self) -> AllocResult<()> {
        while let Some(cur) = self.next_unhandled() {
            let pos = self.ls.intervals[cur].from();
            debug_assert!(pos >= self.cur_pos, "unhandled intervals are sorted");
            self.cur_pos = pos;
            self.walk_state_to(pos);
            self.range_cursor[cur] = 0;
            trace!("position {}: activating {}", pos, self.ls.intervals.describe(cur));
            debug_assert!(!self.ls.intervals[cur].operand.is_reg());
            if self.activate_current(cur)? {
                self.active[ANY_LIST].push(cur);
            }
            while self.next_block < self.ls.func.layout.len()
                && self.ls.block_from(self.ls.func.layout[self.next_block]) <= pos
            {
                let block = self.ls.func.layout[self.next_block];
                self.next_block += 1;
                S::block_boundary(&mut self, block);
            }
        }
        self.resolver.resolve_and_append(self.ls);
        Ok(())
    }

    fn next_unhandled(&mut self) -> Option<IntervalId> {
        let mut best: Option<usize> = None;
        let mut best_from = MAX_POS;
        for li in 0..3 {
            if let Some(&id) = self.unhandled[li].first() {
                let from = self.ls.intervals[id].from();
                if from < best_from {
                    best_from = from;
                    best = Some(li);
                }
            }
        }
        best.map(|li| self.unhandled[li].remove(0))
    }

    fn advance_cursor(&mut self, id: IntervalId, pos: u32) -> RangeState {
        loop {
            let cursor = self.range_cursor[id] as usize;
            let interval = &self.ls.intervals[id];
            if cursor >= interval.num_ranges() {
                return RangeState::Done;
            }
            let range = interval.range(cursor);
            if range.to <= pos {
                self.range_cursor[id] = (cursor + 1) as u32;
                continue;
            }
            return if range.from > pos {
                RangeState::Hole
            } else {
                RangeState::Covers
            };
        }
    }

    /// Move every active and inactive interval to the list matching its
    /// coverage at `pos`; intervals whose ranges are exhausted become
    /// handled and leave the lists.
    fn walk_state_to(&mut self, pos: u32) {
        for li in 0..2 {
            let active = mem::take(&mut self.active[li]);
            for id in active {
                match self.advance_cursor(id, pos) {
                    RangeState::Done => trace!("{} handled", self.ls.intervals.describe(id)),
                    RangeState::Hole => self.inactive[li].push(id),
                    RangeState::Covers => self.active[li].push(id),
                }
            }
            let inactive = mem::take(&mut self.inactive[li]);
            for id in inactive {
                match self.advance_cursor(id, pos) {
                    RangeState::Done => trace!("{} handled", self.ls.intervals.describe(id)),
                    RangeState::Hole => self.inactive[li].push(id),
                    RangeState::Covers => self.active[li].push(id),
                }
            }
        }
    }

    /// First position of the range the cursor points at, or `MAX_POS`
    /// when the chain is exhausted.
    fn current_from(&self, id: IntervalId) -> u32 {
        let cursor = self.range_cursor[id] as usize;
        let interval = &self.ls.intervals[id];
        if cursor >= interval.num_ranges() {
            MAX_POS
        } else {
            interval.range(cursor).from
        }
    }

    fn current_intersection(&self, id: IntervalId, cur: IntervalId) -> Option<u32> {
        intersects_at(
            &self.ls.intervals[id],
            self.range_cursor[id] as usize,
            &self.ls.intervals[cur],
            0,
        )
    }

    // ---- activation ----------------------------------------------------

    fn activate_current(&mut self, cur: IntervalId) -> AllocResult<bool> {
        let mut result = true;
        let location = self.ls.intervals[cur].location;
        if location.is_slot() {
            // The value is already on the stack; only the part that wants
            // a register is re-queued.
            self.split_stack_interval(cur);
            result = false;
        } else if location.is_none() {
            self.combine_spilled_intervals(cur);
            let kind = self.ls.intervals[cur].kind;
            self.avail.clear();
            self.avail.extend_from_slice(self.ls.reginfo.allocatable(kind));
            if self.no_allocation_possible(cur) || !self.alloc_free_register(cur) {
                self.alloc_locked_register(cur)?;
            }
            result = self.ls.intervals[cur].location.is_reg();
        }

        if self.ls.intervals[cur].insert_move_when_activated {
            debug_assert!(!self.ls.intervals.is_split_parent(cur));
            let from = self.ls.intervals[cur].from();
            let src = self.ls.intervals.split_child_before(cur, from);
            self.insert_move(from, src, cur);
        }
        Ok(result)
    }

    /// The interval starts right before an instruction that destroys all
    /// candidate registers and survives it, so a register assignment
    /// could never be kept.
    fn no_allocation_possible(&self, cur: IntervalId) -> bool {
        let kind = self.ls.intervals[cur].kind;
        if !self.ls.call_kills_registers(kind) {
            return false;
        }
        let from = self.ls.intervals[cur].from();
        from & 1 == 1
            && from + 1 <= self.ls.max_op_id()
            && self.ls.has_call(from + 1)
            && self.ls.intervals[cur].to() > from + 1
    }

    // ---- per-register scratch state ------------------------------------

    fn init_use_lists(&mut self, only_use_pos: bool) {
        for i in 0..self.avail.len() {
            let n = self.avail[i].index();
            self.use_pos[n] = MAX_POS;
            if !only_use_pos {
                self.block_pos[n] = MAX_POS;
                self.spill_lists[n].clear();
            }
        }
    }

    fn exclude_from_use(&mut self, id: IntervalId) {
        if let Some(r) = self.ls.intervals[id].location.as_reg() {
            self.use_pos[r.index()] = 0;
        }
    }

    fn set_use_pos(&mut self, id: IntervalId, pos: Option<u32>, record: Option<Membership>) {
        let pos = match pos {
            Some(p) => p,
            None => return,
        };
        let r = match self.ls.intervals[id].location.as_reg() {
            Some(r) => r,
            None => return,
        };
        let n = r.index();
        if let Some(membership) = record {
            self.spill_lists[n].push((id, membership));
        }
        if pos < self.use_pos[n] {
            self.use_pos[n] = pos;
        }
    }

    fn set_block_pos(&mut self, id: IntervalId, pos: Option<u32>) {
        let pos = match pos {
            Some(p) => p,
            None => return,
        };
        let r = match self.ls.intervals[id].location.as_reg() {
            Some(r) => r,
            None => return,
        };
        let n = r.index();
        if pos < self.block_pos[n] {
            self.block_pos[n] = pos;
        }
        if pos < self.use_pos[n] {
            self.use_pos[n] = pos;
        }
    }

    fn free_exclude_active(&mut self, li: usize) {
        for i in 0..self.active[li].len() {
            let id = self.active[li][i];
            self.exclude_from_use(id);
        }
    }

    fn free_collect_inactive_fixed(&mut self, cur: IntervalId) {
        for i in 0..self.inactive[FIXED_LIST].len() {
            let id = self.inactive[FIXED_LIST][i];
            let resume = self.current_from(id);
            if self.ls.intervals[cur].to() <= resume {
                // the register is free for the whole current interval
                self.set_use_pos(id, Some(resume), None);
            } else {
                let pos = self.current_intersection(id, cur);
                self.set_use_pos(id, pos, None);
            }
        }
    }

    fn free_collect_inactive_any(&mut self, cur: IntervalId) {
        for i in 0..self.inactive[ANY_LIST].len() {
            let id = self.inactive[ANY_LIST][i];
            let pos = self.current_intersection(id, cur);
            self.set_use_pos(id, pos, None);
        }
    }

    fn spill_exclude_active_fixed(&mut self) {
        for i in 0..self.active[FIXED_LIST].len() {
            let id = self.active[FIXED_LIST][i];
            self.exclude_from_use(id);
        }
    }

    fn spill_block_inactive_fixed(&mut self, cur: IntervalId) {
        for i in 0..self.inactive[FIXED_LIST].len() {
            let id = self.inactive[FIXED_LIST][i];
            if self.ls.intervals[cur].to() > self.current_from(id) {
                let pos = self.current_intersection(id, cur);
                self.set_block_pos(id, pos);
            }
        }
    }

    fn spill_collect_active_any(&mut self, priority: RegisterPriority) {
        for i in 0..self.active[ANY_LIST].len() {
            let id = self.active[ANY_LIST][i];
            let interval = &self.ls.intervals[id];
            let pos = interval.next_usage(priority, self.cur_pos).min(interval.to());
            self.set_use_pos(id, Some(pos), Some(Membership::Active));
        }
    }

    fn spill_collect_inactive_any(&mut self, cur: IntervalId) {
        for i in 0..self.inactive[ANY_LIST].len() {
            let id = self.inactive[ANY_LIST][i];
            if self.current_intersection(id, cur).is_some() {
                let interval = &self.ls.intervals[id];
                let pos = interval
                    .next_usage(RegisterPriority::LiveAtLoopEnd, self.cur_pos)
                    .min(interval.to());
                self.set_use_pos(id, Some(pos), Some(Membership::Inactive));
            }
        }
    }

    // ---- free register allocation --------------------------------------

    fn alloc_free_register(&mut self, cur: IntervalId) -> bool {
        self.init_use_lists(true);
        self.free_exclude_active(FIXED_LIST);
        self.free_exclude_active(ANY_LIST);
        debug_assert!(
            self.unhandled[FIXED_LIST].is_empty(),
            "fixed intervals never wait in the unhandled lists"
        );
        self.free_collect_inactive_fixed(cur);
        self.free_collect_inactive_any(cur);

        let from = self.ls.intervals[cur].from();
        let to = self.ls.intervals[cur].to();
        let hint = self
            .ls
            .intervals
            .location_hint(cur, true)
            .and_then(|h| self.ls.intervals[h].location.as_reg());
        // the register must be available at least up to the definition
        // point and the move that may follow it
        let reg_needed_until = from + 1;

        let mut min_full: Option<PhysReg> = None;
        let mut max_partial: Option<PhysReg> = None;
        for i in 0..self.avail.len() {
            let r = self.avail[i];
            let pos = self.use_pos[r.index()];
            if pos >= to {
                // free for the whole interval; prefer the hint, else the
                // smallest use position to keep long-free registers open
                if min_full.map_or(true, |m| {
                    Some(r) == hint || (pos < self.use_pos[m.index()] && Some(m) != hint)
                }) {
                    min_full = Some(r);
                }
            } else if pos > reg_needed_until {
                // free for a prefix; prefer the longest prefix
                if max_partial.map_or(true, |m| {
                    Some(r) == hint || (pos > self.use_pos[m.index()] && Some(m) != hint)
                }) {
                    max_partial = Some(r);
                }
            }
        }

        let (reg, need_split) = match (min_full, max_partial) {
            (Some(r), _) => (r, false),
            (None, Some(r)) => (r, true),
            (None, None) => return false,
        };
        let split_pos = self.use_pos[reg.index()];
        self.ls.intervals[cur].location = Location::Reg(reg);
        trace!("selected free register {}", reg);
        if need_split {
            self.split_when_partial_register_available(cur, split_pos);
        }
        true
    }

    // ---- locked register allocation ------------------------------------

    fn alloc_locked_register(&mut self, cur: IntervalId) -> AllocResult<()> {
        let from = self.ls.intervals[cur].from();
        let to = self.ls.intervals[cur].to();
        let first_usage = self.ls.intervals[cur].first_usage(RegisterPriority::MustHaveRegister);
        let first_should = self.ls.intervals[cur].first_usage(RegisterPriority::ShouldHaveRegister);
        let reg_needed_until = first_usage.min(from + 1);
        let ignore = self.ls.intervals[cur].location.as_reg();

        let mut priority = RegisterPriority::LiveAtLoopEnd;
        let reg = loop {
            self.init_use_lists(false);
            self.spill_exclude_active_fixed();
            self.spill_block_inactive_fixed(cur);
            self.spill_collect_active_any(priority);
            self.spill_collect_inactive_any(cur);

            // the register whose next forced use is furthest away
            let mut best: Option<PhysReg> = None;
            for i in 0..self.avail.len() {
                let r = self.avail[i];
                if Some(r) == ignore {
                    continue;
                }
                let pos = self.use_pos[r.index()];
                if pos > reg_needed_until && best.map_or(true, |b| pos > self.use_pos[b.index()]) {
                    best = Some(r);
                }
            }

            let reg_use_pos = best.map_or(0, |r| self.use_pos[r.index()]);
            if reg_use_pos <= first_should {
                // spilling the current interval is cheaper than evicting
                trace!(
                    "spilling current: first usage {}, furthest free {}",
                    first_usage,
                    reg_use_pos
                );
                if first_usage <= from + 1 {
                    if priority == RegisterPriority::LiveAtLoopEnd {
                        // retry with loop-carried uses counted as forced
                        priority = RegisterPriority::MustHaveRegister;
                        continue;
                    }
                    let interval = self.ls.intervals.describe(cur);
                    let candidates = self.candidates();
                    self.ls.assign_spill_slot(cur);
                    return Err(AllocError::OutOfRegisters {
                        interval,
                        first_use: first_usage,
                        candidates,
                    });
                }
                self.split_and_spill_interval(cur, Membership::Active, best, reg_use_pos);
                return Ok(());
            }
            break best.expect("a candidate exists when eviction wins");
        };

        let split_pos = self.block_pos[reg.index()];
        let need_split = split_pos <= to;
        trace!("evicting holders of {}", reg);
        self.ls.intervals[cur].location = Location::Reg(reg);
        if need_split {
            // a fixed interval needs the register back before the end
            self.split_when_partial_register_available(cur, split_pos);
        }
        self.split_and_spill_intersecting(reg);
        Ok(())
    }

    fn candidates(&self) -> String {
        let regs: Vec<String> = self.avail.iter().map(|r| r.to_string()).collect();
        format!("[{}]", regs.join(", "))
    }

    fn split_and_spill_intersecting(&mut self, reg: PhysReg) {
        let list = mem::take(&mut self.spill_lists[reg.index()]);
        for (id, membership) in list {
            self.remove_from_any_lists(id);
            self.split_and_spill_interval(id, membership, None, 0);
        }
    }

    fn remove_from_any_lists(&mut self, id: IntervalId) {
        self.active[ANY_LIST].retain(|&x| x != id);
        self.inactive[ANY_LIST].retain(|&x| x != id);
    }

    /// Split `id` so its head can give up its register at the current
    /// position, then spill the head. When the remainder keeps only
    /// should-have uses and an eviction register is supplied, the
    /// interval takes that register instead of spilling (the loop-carried
    /// value case).
    fn split_and_spill_interval(
        &mut self,
        id: IntervalId,
        membership: Membership,
        reg: Option<PhysReg>,
        must_use_pos: u32,
    ) {
        let cur_pos = self.cur_pos;
        match membership {
            Membership::Inactive => {
                // the interval has a hole at the current position; the
                // tail re-enters allocation on its own
                self.split_before_usage(id, cur_pos + 1, cur_pos + 1);
            }
            Membership::Active => {
                let to = self.ls.intervals[id].to();
                let max_split = self.ls.intervals[id]
                    .next_usage(RegisterPriority::MustHaveRegister, cur_pos + 1)
                    .min(to);
                self.split_before_usage(id, cur_pos + 1, max_split);
                debug_assert_eq!(
                    self.ls.intervals[id].next_usage(RegisterPriority::MustHaveRegister, cur_pos),
                    MAX_POS,
                    "the remaining part has no forced register use"
                );
                let to = self.ls.intervals[id].to();
                if to >= must_use_pos {
                    self.split_for_spilling(id);
                } else if let Some(r) = reg {
                    let split_pos = self.block_pos[r.index()];
                    let need_split = split_pos <= to;
                    self.ls.intervals[id].location = Location::Reg(r);
                    if need_split {
                        self.split_when_partial_register_available(id, split_pos);
                    }
                    self.split_and_spill_intersecting(r);
                } else {
                    self.split_for_spilling(id);
                }
            }
        }
    }

    // ---- splitting -----------------------------------------------------

    /// Split `id` somewhere in `[min_split, max_split]` and re-queue the
    /// tail as unhandled. No split happens when the tail would be empty
    /// of forced uses and end-aligned.
    fn split_before_usage(&mut self, id: IntervalId, min_split: u32, max_split: u32) {
        debug_assert!(self.ls.intervals[id].from() < min_split);
        debug_assert!(min_split <= max_split);

        let optimal = self.find_optimal_split_pos(id, min_split, max_split, true);
        debug_assert!(min_split <= optimal && optimal <= max_split);
        if optimal == self.ls.intervals[id].to()
            && self.ls.intervals[id].next_usage(RegisterPriority::MustHaveRegister, min_split)
                == MAX_POS
        {
            // nothing after the split point forces a register; the whole
            // tail can live on the stack without a second interval
            return;
        }

        let move_necessary = !self.ls.is_block_begin(optimal)
            && !self.ls.intervals[id].has_hole_between(optimal - 1, optimal);
        let optimal = if self.ls.is_block_begin(optimal) {
            optimal
        } else {
            // move the split in front of the instruction
            (optimal - 1) | 1
        };

        let child = self.ls.split_interval(id, optimal);
        self.ls.intervals[child].insert_move_when_activated = move_necessary;
        trace!(
            "split {} at {}, re-queued {}",
            self.ls.intervals.describe(id),
            optimal,
            self.ls.intervals.describe(child)
        );
        debug_assert!(self.ls.intervals[child].from() >= self.cur_pos);
        self.insert_unhandled_any(child);
    }

    /// Spill the part of `id` between its last real use and the current
    /// position; the split point is hoisted to a block boundary where
    /// profitable.
    fn split_for_spilling(&mut self, id: IntervalId) {
        let max_split = self.cur_pos;
        let from = self.ls.intervals[id].from();
        let mut prev = self.ls.intervals[id]
            .previous_usage(RegisterPriority::ShouldHaveRegister, max_split);
        if prev == Some(max_split) {
            // a should-have use exactly here does not anchor the value in
            // its register
            prev = self.ls.intervals[id].previous_usage(RegisterPriority::MustHaveRegister, max_split);
        }
        let min_split = prev.map_or(0, |p| p + 1).max(from);

        if min_split == from {
            // no use so far needed a register; the whole interval lives
            // in the spill slot
            debug_assert!(
                self.ls.intervals[id].first_usage(RegisterPriority::MustHaveRegister) > self.cur_pos
            );
            trace!("spilling entire interval {}", self.ls.intervals.describe(id));
            self.ls.assign_spill_slot(id);
            self.change_spill_state(id, min_split);

            // Earlier siblings that hold a register without ever using it
            // are parked in the slot as well.
            let mut parent = id;
            while !self.ls.intervals.is_split_parent(parent) {
                let parent_from = self.ls.intervals[parent].from();
                parent = self.ls.intervals.split_child_before(parent, parent_from);
                if self.ls.intervals[parent].location.is_reg() {
                    if self.ls.intervals[parent].first_usage(RegisterPriority::ShouldHaveRegister)
                        == MAX_POS
                    {
                        self.ls.assign_spill_slot(parent);
                    } else {
                        break;
                    }
                }
            }
        } else {
            let optimal = self.find_optimal_split_pos(id, min_split, max_split, false);
            let optimal = if self.ls.is_block_begin(optimal) {
                optimal
            } else {
                (optimal - 1) | 1
            };
            let spilled = self.ls.split_interval(id, optimal);
            self.ls.assign_spill_slot(spilled);
            self.change_spill_state(spilled, optimal);
            trace!("spilled tail {}", self.ls.intervals.describe(spilled));
            if !self.ls.is_block_begin(optimal) {
                self.insert_move(optimal, id, spilled);
            }
        }
    }

    /// Split a stack-located interval right before the first use that
    /// would rather have a register.
    fn split_stack_interval(&mut self, id: IntervalId) {
        let min = self.cur_pos + 1;
        let max = self.ls.intervals[id]
            .first_usage(RegisterPriority::ShouldHaveRegister)
            .min(self.ls.intervals[id].to());
        self.split_before_usage(id, min, max);
    }

    /// The register is available only until `available_until`; keep it
    /// for the prefix and re-queue the rest.
    fn split_when_partial_register_available(&mut self, id: IntervalId, available_until: u32) {
        let from = self.ls.intervals[id].from();
        let min_split = self.ls.intervals[id]
            .previous_usage(RegisterPriority::ShouldHaveRegister, available_until)
            .unwrap_or(0)
            .max(from + 1);
        self.split_before_usage(id, min_split, available_until);
    }

    /// Choose a split position in `[min_split, max_split]`, preferring
    /// block boundaries with low loop depth; with `do_loop_opt`, a value
    /// dying inside a loop is split right after the loop instead.
    fn find_optimal_split_pos(
        &self,
        id: IntervalId,
        min_split: u32,
        max_split: u32,
        do_loop_opt: bool,
    ) -> u32 {
        if min_split == max_split {
            return min_split;
        }
        debug_assert!(min_split < max_split);

        let min_block = self.ls.block_for_id(min_split - 1);
        let max_block = self.ls.block_for_id(max_split - 1);
        if min_block == max_block {
            return max_split;
        }
        if self.ls.intervals[id].has_hole_between(max_split - 1, max_split)
            && !self.ls.is_block_begin(max_split)
        {
            // the interval goes inactive just before max_split; splitting
            // there costs nothing
            return max_split;
        }

        let mut optimal = None;
        if do_loop_opt {
            let loop_end_pos = self.ls.intervals[id].next_usage_exact(
                RegisterPriority::LiveAtLoopEnd,
                self.ls.block_to(min_block) + 2,
            );
            if loop_end_pos < max_split {
                // the value is loop-carried but dies before max_split;
                // spill after the loop rather than inside it
                let loop_block = self.ls.block_for_id(loop_end_pos);
                debug_assert!(loop_block != min_block);
                let max_spill = self.ls.block_to(loop_block) + 2;
                let candidate = self.find_split_pos_in_blocks(min_block, loop_block, max_spill);
                if candidate != max_spill {
                    optimal = Some(candidate);
                }
            }
        }
        optimal.unwrap_or_else(|| self.find_split_pos_in_blocks(min_block, max_block, max_split))
    }

    /// Best block boundary between `min_block` and `max_block`: the end
    /// of the last block whose loop depth undercuts everything after it.
    fn find_split_pos_in_blocks(&self, min_block: Block, max_block: Block, max_split: u32) -> u32 {
        let mut optimal = self.ls.block_to(max_block) + 2;
        if optimal > max_split {
            optimal = self.ls.block_from(max_block);
        }
        let mut min_depth = self.ls.loops.loop_depth(max_block);
        let from_nr = self.ls.block_order[min_block] as usize;
        let to_nr = self.ls.block_order[max_block] as usize;
        for i in (from_nr..to_nr).rev() {
            if min_depth == 0 {
                break;
            }
            let cur = self.ls.func.layout[i];
            let depth = self.ls.loops.loop_depth(cur);
            if depth < min_depth {
                min_depth = depth;
                optimal = self.ls.block_to(cur) + 2;
            }
        }
        optimal
    }

    fn insert_unhandled_any(&mut self, child: IntervalId) {
        let from = self.ls.intervals[child].from();
        let first_use = self.ls.intervals[child].first_usage(RegisterPriority::ShouldHaveRegister);
        let pos = self.unhandled[ANY_LIST]
            .iter()
            .position(|&x| {
                let xf = self.ls.intervals[x].from();
                xf > from
                    || (xf == from
                        && self.ls.intervals[x].first_usage(RegisterPriority::ShouldHaveRegister)
                            > first_use)
            })
            .unwrap_or(self.unhandled[ANY_LIST].len());
        self.unhandled[ANY_LIST].insert(pos, child);
    }

    // ---- spill bookkeeping ---------------------------------------------

    /// Record a register-to-memory transition at `spill_pos` in the spill
    /// state machine.
    fn change_spill_state(&mut self, id: IntervalId, spill_pos: u32) {
        let def_pos = match self.ls.intervals.spill_definition_pos(id) {
            Some(p) => p,
            None => return,
        };
        let def_depth = self.ls.loops.loop_depth(self.ls.block_for_id(def_pos));
        let spill_depth = self.ls.loops.loop_depth(self.ls.block_for_id(spill_pos.min(self.ls.max_op_id())));
        match self.ls.intervals.spill_state(id) {
            SpillState::NoSpillStore => {
                if def_depth < spill_depth {
                    // spilling inside a deeper loop; the optimizer hoists
                    // the store to a dominator
                    self.ls.intervals.set_spill_state(id, SpillState::SpillInDominator);
                } else {
                    self.ls.intervals.set_spill_state(id, SpillState::OneSpillStore);
                }
            }
            SpillState::OneSpillStore => {
                if def_depth <= spill_depth {
                    self.ls.intervals.set_spill_state(id, SpillState::SpillInDominator);
                }
            }
            _ => {}
        }
    }

    /// When a split child begins exactly at a move from a spilled,
    /// hint-linked interval, the child inherits the spill slot and the
    /// boundary moves become redundant.
    fn combine_spilled_intervals(&mut self, cur: IntervalId) {
        if !self.ls.intervals.is_split_parent(cur) {
            return;
        }
        let hint = match self.ls.intervals[cur].location_hint.expand() {
            Some(h) => h,
            None => return,
        };
        if !self.ls.intervals.is_split_parent(hint) {
            return;
        }
        // Sharing slots with an interval under spill store optimization
        // would invalidate its canonical store.
        if self.ls.intervals.spill_state(cur) != SpillState::NoOptimization
            || self.ls.intervals.spill_state(hint) != SpillState::NoOptimization
        {
            return;
        }

        let begin_pos = self.ls.intervals[cur].from();
        let end_pos = self.ls.intervals[cur].to();
        if end_pos > self.ls.max_op_id() || begin_pos & 1 != 0 || end_pos & 1 != 0 {
            return;
        }
        if !self.is_move_between(begin_pos, hint, cur) || !self.is_move_between(end_pos, cur, hint)
        {
            return;
        }

        let begin_hint = match self.ls.intervals.split_child_at(hint, begin_pos, OperandMode::Use) {
            Ok(c) => c,
            Err(_) => return,
        };
        let end_hint = match self.ls.intervals.split_child_at(hint, end_pos, OperandMode::Def) {
            Ok(c) => c,
            Err(_) => return,
        };
        if begin_hint == end_hint
            || self.ls.intervals[begin_hint].to() != begin_pos
            || self.ls.intervals[end_hint].from() != end_pos
        {
            return;
        }
        if self.ls.intervals[begin_hint].location.is_reg() {
            // the value sits in a register here; the copy is worth keeping
            return;
        }
        let slot = match self.ls.intervals.spill_slot(hint) {
            Some(s) => s,
            None => return,
        };
        if self.ls.intervals.spill_slot(cur).is_some() {
            return;
        }
        trace!(
            "{} inherits the spill slot of {}",
            self.ls.intervals.describe(cur),
            self.ls.intervals.describe(hint)
        );
        self.ls.intervals.set_spill_slot(cur, slot);
        self.ls.intervals[cur].remove_first_use_pos();
        self.ls.intervals[end_hint].remove_first_use_pos();
    }

    fn is_move_between(&self, op_id: u32, from: IntervalId, to: IntervalId) -> bool {
        let inst = self.ls.inst_for_id(op_id);
        match self.ls.func.insts[inst].as_move() {
            Some((dst, src)) => {
                src == self.ls.intervals[from].operand && dst == self.ls.intervals[to].operand
            }
            None => false,
        }
    }

    // ---- move insertion ------------------------------------------------

    /// Record a move from `src` to `dst` just past the split position
    /// `operand_id`.
    fn insert_move(&mut self, operand_id: u32, src: IntervalId, dst: IntervalId) {
        // round up to the instruction the move goes in front of
        let pos = (operand_id + 1) & !1;
        let block = self.ls.block_for_id(pos);
        let index = self.ls.func.blocks[block]
            .insts
            .iter()
            .position(|&i| self.ls.func.insts[i].id == Some(pos))
            .expect("numbered instruction is in its block");
        self.resolver.set_insert_position(self.ls, block, index);
        self.resolver.add_mapping(self.ls, src, dst);
    }

    // ---- optimizing strategy -------------------------------------------

    /// For a block with a single predecessor, move intervals entering the
    /// block back into the register they occupied at the predecessor's
    /// end, when that register is free here.
    fn rehome_at_block_boundary(&mut self, block: Block) {
        if self.ls.cfg.num_preds(block) != 1 {
            return;
        }
        let pred = self.ls.cfg.preds(block)[0];
        let pred_end = self.ls.block_to(pred) + 1;
        let entry = self.ls.block_from(block);

        for i in 0..self.active[ANY_LIST].len() {
            let id = self.active[ANY_LIST][i];
            if self.ls.intervals[id].from() != entry {
                continue;
            }
            let prev = match self.ls.intervals.split_child_at(id, pred_end, OperandMode::Def) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if prev == id {
                continue;
            }
            let prev_loc = self.ls.intervals[prev].location;
            if prev_loc == self.ls.intervals[id].location {
                continue;
            }
            let r = match prev_loc.as_reg() {
                Some(r) => r,
                None => continue,
            };
            let kind = self.ls.intervals[id].kind;
            if !self.ls.reginfo.allocatable(kind).contains(&r) {
                continue;
            }
            if !self.register_free_for(id, r) {
                continue;
            }
            trace!(
                "re-homing {} to {} at the start of {}",
                self.ls.intervals.describe(id),
                r,
                block
            );
            self.ls.intervals[id].location = Location::Reg(r);
        }
    }

    fn register_free_for(&self, id: IntervalId, reg: PhysReg) -> bool {
        for li in 0..2 {
            for &other in self.active[li].iter().chain(self.inactive[li].iter()) {
                if other == id {
                    continue;
                }
                if self.ls.intervals[other].location == Location::Reg(reg)
                    && intersects_at(
                        &self.ls.intervals[other],
                        0,
                        &self.ls.intervals[id],
                        0,
                    )
                    .is_some()
                {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dominator_tree::DominatorTree;
    use crate::flowgraph::ControlFlowGraph;
    use crate::frame::FrameMap;
    use crate::ir::{Function, InstData, ValueKind};
    use crate::loop_analysis::LoopAnalysis;
    use crate::reginfo::RegInfo;

    fn run_walk(func: &mut Function, reginfo: &RegInfo) -> (Vec<Location>, u32) {
        let cfg = ControlFlowGraph::with_function(func);
        let domtree = DominatorTree::with_function(func, &cfg);
        let loops = LoopAnalysis::with_function(func, &cfg, &domtree);
        let num_values = func.num_values();
        let mut ls = LinearScan::new(func, reginfo, &cfg, &domtree, &loops, FrameMap::new());
        ls.number_instructions();
        ls.compute_local_live_sets();
        ls.compute_global_live_sets().unwrap();
        ls.build_intervals();
        ls.sort_intervals();
        allocate_registers::<Standard>(&mut ls).unwrap();
        let locations = (0..num_values)
            .map(|i| ls.intervals[IntervalId::new(ls.num_phys as usize + i)].location)
            .collect();
        (locations, ls.frame.frame_words())
    }

    #[test]
    fn disjoint_intervals_can_share_one_register() {
        let mut func = Function::new();
        let b0 = func.create_block();
        let v0 = func.new_value(ValueKind::Int);
        let v1 = func.new_value(ValueKind::Int);
        let v2 = func.new_value(ValueKind::Int);
        func.push_inst(b0, InstData::op(&[], &[v0.into()]));
        func.push_inst(b0, InstData::op(&[v0.into()], &[v1.into()]));
        func.push_inst(b0, InstData::op(&[v1.into()], &[v2.into()]));
        func.push_inst(b0, InstData::ret(Some(v2.into())));

        let reginfo = RegInfo::new(1).with_int(&[0]);
        let (locations, frame_words) = run_walk(&mut func, &reginfo);
        // one register suffices: each value dies as the next is defined
        for loc in locations {
            assert!(loc.is_reg(), "{} is not a register", loc);
        }
        assert_eq!(frame_words, 0);
    }

    #[test]
    fn overlapping_intervals_get_distinct_registers() {
        let mut func = Function::new();
        let b0 = func.create_block();
        let v0 = func.new_value(ValueKind::Int);
        let v1 = func.new_value(ValueKind::Int);
        func.push_inst(b0, InstData::op(&[], &[v0.into()]));
        func.push_inst(b0, InstData::op(&[], &[v1.into()]));
        func.push_inst(b0, InstData::op(&[v0.into(), v1.into()], &[]));
        func.push_inst(b0, InstData::ret(None));

        let reginfo = RegInfo::new(2).with_int(&[0, 1]);
        let (locations, _) = run_walk(&mut func, &reginfo);
        assert!(locations[0].is_reg() && locations[1].is_reg());
        assert_ne!(locations[0], locations[1]);
    }

    #[test]
    fn pressure_forces_a_spill_not_a_bailout() {
        // three simultaneously live values, one register
        let mut func = Function::new();
        let b0 = func.create_block();
        let vals: Vec<_> = (0..3).map(|_| func.new_value(ValueKind::Int)).collect();
        for &v in &vals {
            func.push_inst(b0, InstData::op(&[], &[v.into()]));
        }
        // keep all three alive to one final use, one at a time
        func.push_inst(b0, InstData::op(&[vals[0].into()], &[]));
        func.push_inst(b0, InstData::op(&[vals[1].into()], &[]));
        func.push_inst(b0, InstData::op(&[vals[2].into()], &[]));
        func.push_inst(b0, InstData::ret(None));

        let reginfo = RegInfo::new(2).with_int(&[0, 1]);
        let cfg = ControlFlowGraph::with_function(&func);
        let domtree = DominatorTree::with_function(&func, &cfg);
        let loops = LoopAnalysis::with_function(&func, &cfg, &domtree);
        let mut ls = LinearScan::new(&mut func, &reginfo, &cfg, &domtree, &loops, FrameMap::new());
        ls.number_instructions();
        ls.compute_local_live_sets();
        ls.compute_global_live_sets().unwrap();
        ls.build_intervals();
        ls.sort_intervals();
        assert!(allocate_registers::<Standard>(&mut ls).is_ok());
        // something had to hit the stack
        assert!(ls.frame.frame_words() > 0);
    }

    #[test]
    fn true_out_of_registers_is_reported() {
        // two values forced live across one instruction with one register
        let mut func = Function::new();
        let b0 = func.create_block();
        let v0 = func.new_value(ValueKind::Int);
        let v1 = func.new_value(ValueKind::Int);
        func.push_inst(b0, InstData::op(&[], &[v0.into()]));
        func.push_inst(b0, InstData::op(&[], &[v1.into()]));
        func.push_inst(b0, InstData::op(&[v0.into(), v1.into()], &[]));
        func.push_inst(b0, InstData::ret(None));

        let reginfo = RegInfo::new(1).with_int(&[0]);
        let cfg = ControlFlowGraph::with_function(&func);
        let domtree = DominatorTree::with_function(&func, &cfg);
        let loops = LoopAnalysis::with_function(&func, &cfg, &domtree);
        let mut ls = LinearScan::new(&mut func, &reginfo, &cfg, &domtree, &loops, FrameMap::new());
        ls.number_instructions();
        ls.compute_local_live_sets();
        ls.compute_global_live_sets().unwrap();
        ls.build_intervals();
        ls.sort_intervals();
        let err = allocate_registers::<Standard>(&mut ls).unwrap_err();
        assert!(matches!(err, AllocError::OutOfRegisters { .. }));
    }
}
