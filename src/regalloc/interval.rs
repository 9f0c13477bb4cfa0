//! Lifetime intervals.
//!
//! An [`Interval`] models where one operand is live, as a list of
//! half-open `[from, to)` ranges over instruction positions, together
//! with its use positions, its assigned location, and its splitting
//! metadata. Positions count two per instruction: the even position is
//! the instruction's definition point, the odd position orders uses that
//! happen logically after it.
//!
//! Intervals live in an [`Intervals`] arena and reference each other by
//! [`IntervalId`]. The arena index doubles as the operand number: the low
//! indices are the physical registers, everything above is a virtual
//! value. Splitting an interval allocates a new arena entry that becomes
//! a direct child of the original split parent; children always form a
//! flat list, never a tree, and share one canonical spill slot.

use crate::frame::SpillSlot;
use crate::ir::{Operand, ValueKind};
use crate::reginfo::PhysReg;
use crate::result::VerifierError;
use core::fmt;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{entity_impl, PrimaryMap};
use smallvec::SmallVec;

/// An opaque reference to an interval in the arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntervalId(u32);
entity_impl!(IntervalId, "iv");

/// Position value used as "never" / end of all ranges.
pub const MAX_POS: u32 = u32::MAX;

/// How urgently an interval needs a register at a use position.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum RegisterPriority {
    /// No register is required; the position only keeps the value alive.
    None,
    /// The value should stay in a register across a loop end.
    LiveAtLoopEnd,
    /// A register is preferred, but a stack slot is acceptable.
    ShouldHaveRegister,
    /// A register is mandatory.
    MustHaveRegister,
}

/// Which worklist family an interval belongs to during the walk.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegisterBinding {
    /// Precolored to one physical register.
    Fixed,
    /// May be assigned any allocatable register.
    Any,
    /// Assigned to a stack slot.
    Stack,
}

/// How confidently the allocator knows where a spilled value is stored.
///
/// The state only ever increases; see [`SpillState::advance`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum SpillState {
    /// No definition seen yet.
    NoDefinitionFound,
    /// Defined once, not spilled yet.
    NoSpillStore,
    /// Spilled exactly once, after its definition and at the same loop
    /// depth; the store stays where it is.
    OneSpillStore,
    /// Spilled several times, or inside a loop relative to the
    /// definition; the spill position optimizer picks one store point.
    SpillInDominator,
    /// One canonical store at the definition covers all spills.
    StoreAtDefinition,
    /// The value starts life in memory (an incoming stack parameter).
    StartInMemory,
    /// Spill store optimization is disabled for this interval.
    NoOptimization,
}

impl SpillState {
    /// Advance to `new`. Spill state never moves backwards; a downgrade
    /// is an allocator bug.
    pub fn advance(self, new: SpillState) -> SpillState {
        debug_assert!(new >= self, "spill state cannot decrease: {:?} -> {:?}", self, new);
        new
    }

    /// States in which the stack copy of the value is always current.
    pub fn always_in_memory(self) -> bool {
        matches!(
            self,
            SpillState::SpillInDominator | SpillState::StoreAtDefinition | SpillState::StartInMemory
        )
    }
}

/// The location assigned to an interval.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Location {
    /// Not assigned yet, or deliberately none for a value that is
    /// rematerialized from a constant instead of reloaded.
    None,
    /// A physical register.
    Reg(PhysReg),
    /// A stack spill slot.
    Slot(SpillSlot),
}

impl Location {
    /// The register, if this location is one.
    pub fn as_reg(self) -> Option<PhysReg> {
        match self {
            Self::Reg(r) => Some(r),
            _ => None,
        }
    }

    /// The spill slot, if this location is one.
    pub fn as_slot(self) -> Option<SpillSlot> {
        match self {
            Self::Slot(s) => Some(s),
            _ => None,
        }
    }

    /// Is this a register?
    pub fn is_reg(self) -> bool {
        matches!(self, Self::Reg(_))
    }

    /// Is this a stack slot?
    pub fn is_slot(self) -> bool {
        matches!(self, Self::Slot(_))
    }

    /// Is no location assigned?
    pub fn is_none(self) -> bool {
        matches!(self, Self::None)
    }

    /// Convert to an operand occurrence.
    pub fn to_operand(self) -> Operand {
        match self {
            Self::Reg(r) => Operand::Reg(r),
            Self::Slot(s) => Operand::Slot(s),
            Self::None => panic!("no location assigned"),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::None => write!(f, "-"),
            Self::Reg(r) => write!(f, "{}", r),
            Self::Slot(s) => write!(f, "{}", s),
        }
    }
}

/// Whether a position query reads or defines the operand.
///
/// A use at the very end position of a range still belongs to the range;
/// a definition there does not.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OperandMode {
    /// The operand is read at the position.
    Use,
    /// The operand is defined at the position.
    Def,
}

/// A contiguous half-open span of positions during which a value is live.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LiveRange {
    /// First live position.
    pub from: u32,
    /// First position past the range.
    pub to: u32,
}

/// Use positions paired with register priorities, sorted by descending
/// position (index 0 holds the highest position).
#[derive(Clone, Debug, Default)]
pub struct UsePosList {
    list: SmallVec<[(u32, RegisterPriority); 4]>,
}

impl UsePosList {
    /// Number of recorded use positions.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// True if no use position is recorded.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// The use position at `index`.
    pub fn pos(&self, index: usize) -> u32 {
        self.list[index].0
    }

    /// The register priority at `index`.
    pub fn priority(&self, index: usize) -> RegisterPriority {
        self.list[index].1
    }

    fn set_priority(&mut self, index: usize, priority: RegisterPriority) {
        self.list[index].1 = priority;
    }

    fn push(&mut self, pos: u32, priority: RegisterPriority) {
        debug_assert!(self.list.last().map_or(true, |&(p, _)| p > pos));
        self.list.push((pos, priority));
    }

    /// Remove the entry with the lowest position, if any.
    pub fn remove_lowest(&mut self) {
        self.list.pop();
    }

    /// Remove all entries with position `>= split_pos` and return them as
    /// the use list of the split-off child.
    pub fn split_at(&mut self, split_pos: u32) -> UsePosList {
        let split_index = self
            .list
            .iter()
            .position(|&(p, _)| p < split_pos)
            .unwrap_or(self.list.len());
        let child: SmallVec<[(u32, RegisterPriority); 4]> =
            self.list.drain(..split_index).collect();
        UsePosList { list: child }
    }
}

/// One lifetime interval.
///
/// Family-wide state (spill slot, spill state, spill definition position,
/// materialized constant) lives on the split parent and is reached
/// through the [`Intervals`] arena accessors.
#[derive(Clone, Debug)]
pub struct Interval {
    /// The operand this interval belongs to.
    pub operand: Operand,
    /// The value kind, deciding register class and spill slot size.
    pub kind: ValueKind,
    ranges: SmallVec<[LiveRange; 4]>,
    use_pos: UsePosList,
    /// The assigned location, if any.
    pub location: Location,
    spill_slot: Option<SpillSlot>,
    spill_state: SpillState,
    spill_definition_pos: Option<u32>,
    split_parent: PackedOption<IntervalId>,
    split_children: Vec<IntervalId>,
    /// Interval whose register this one would like to share.
    pub location_hint: PackedOption<IntervalId>,
    /// A reload move must be inserted when this interval is activated,
    /// because it starts in the middle of a block without a lifetime hole
    /// before it.
    pub insert_move_when_activated: bool,
    materialized_value: Option<i64>,
    num_material_defs: u32,
}

impl Interval {
    fn new(operand: Operand, kind: ValueKind) -> Self {
        Self {
            operand,
            kind,
            ranges: SmallVec::new(),
            use_pos: UsePosList::default(),
            location: Location::None,
            spill_slot: None,
            spill_state: SpillState::NoDefinitionFound,
            spill_definition_pos: None,
            split_parent: PackedOption::default(),
            split_children: Vec::new(),
            location_hint: PackedOption::default(),
            insert_move_when_activated: false,
            materialized_value: None,
            num_material_defs: 0,
        }
    }

    /// First live position, or `MAX_POS` for an empty interval.
    pub fn from(&self) -> u32 {
        self.ranges.first().map_or(MAX_POS, |r| r.from)
    }

    /// First position past the last range, or `MAX_POS` when empty.
    pub fn to(&self) -> u32 {
        self.ranges.last().map_or(MAX_POS, |r| r.to)
    }

    /// True if the interval has no live range.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of live ranges.
    pub fn num_ranges(&self) -> usize {
        self.ranges.len()
    }

    /// The `index`th live range.
    pub fn range(&self, index: usize) -> LiveRange {
        self.ranges[index]
    }

    /// The use position list.
    pub fn use_positions(&self) -> &UsePosList {
        &self.use_pos
    }

    /// Prepend a range, joining it with the first range if they touch.
    /// Ranges are built back to front, so `from` must not lie after the
    /// current first range.
    pub fn add_range(&mut self, from: u32, to: u32) {
        debug_assert!(from < to, "invalid range [{}, {})", from, to);
        match self.ranges.first_mut() {
            Some(first) if from <= first.to && to >= first.from => {
                first.from = first.from.min(from);
                first.to = first.to.max(to);
            }
            _ => {
                debug_assert!(self.ranges.first().map_or(true, |r| to < r.from));
                self.ranges.insert(0, LiveRange { from, to });
            }
        }
    }

    /// Trim the start of the first range to `from`. Used when the
    /// definition of a value is found during the backward build.
    pub fn set_from(&mut self, from: u32) {
        debug_assert!(!self.is_empty());
        self.ranges[0].from = from;
    }

    /// Does any range of this interval contain `op_id` under `mode`?
    pub fn covers(&self, op_id: u32, mode: OperandMode) -> bool {
        for r in &self.ranges {
            if r.to < op_id {
                continue;
            }
            return match mode {
                OperandMode::Def => r.from <= op_id && op_id < r.to,
                OperandMode::Use => r.from <= op_id && op_id <= r.to,
            };
        }
        false
    }

    /// True if the interval has a lifetime hole anywhere inside
    /// `[hole_from, hole_to)`.
    pub fn has_hole_between(&self, hole_from: u32, hole_to: u32) -> bool {
        debug_assert!(hole_from < hole_to);
        debug_assert!(self.from() <= hole_from && hole_to <= self.to());
        for (i, r) in self.ranges.iter().enumerate() {
            if hole_from < r.from {
                return true;
            }
            if hole_to <= r.to {
                return false;
            }
            if i + 1 == self.ranges.len() {
                return false;
            }
            if hole_from < self.ranges[i + 1].from && r.to < hole_to {
                return true;
            }
        }
        false
    }

    fn adapt_priority(&self, priority: RegisterPriority) -> RegisterPriority {
        // Rematerialized values have no stack copy, so a use that would
        // tolerate a stack slot must get a register after all.
        if priority == RegisterPriority::ShouldHaveRegister && self.materialized_value.is_some() {
            return RegisterPriority::MustHaveRegister;
        }
        priority
    }

    /// Lowest use position with priority at least `min`, or `MAX_POS`.
    pub fn first_usage(&self, min: RegisterPriority) -> u32 {
        debug_assert!(self.operand.is_virt());
        for i in (0..self.use_pos.len()).rev() {
            if self.adapt_priority(self.use_pos.priority(i)) >= min {
                return self.use_pos.pos(i);
            }
        }
        MAX_POS
    }

    /// Lowest use position `>= from` with priority at least `min`.
    pub fn next_usage(&self, min: RegisterPriority, from: u32) -> u32 {
        debug_assert!(self.operand.is_virt());
        for i in (0..self.use_pos.len()).rev() {
            let pos = self.use_pos.pos(i);
            if pos >= from && self.adapt_priority(self.use_pos.priority(i)) >= min {
                return pos;
            }
        }
        MAX_POS
    }

    /// Lowest use position `>= from` with priority exactly `exact`.
    pub fn next_usage_exact(&self, exact: RegisterPriority, from: u32) -> u32 {
        debug_assert!(self.operand.is_virt());
        for i in (0..self.use_pos.len()).rev() {
            let pos = self.use_pos.pos(i);
            if pos >= from && self.adapt_priority(self.use_pos.priority(i)) == exact {
                return pos;
            }
        }
        MAX_POS
    }

    /// Drop the lowest use position. Used when a split boundary move is
    /// proven redundant and deleted together with its use positions.
    pub fn remove_first_use_pos(&mut self) {
        self.use_pos.remove_lowest();
    }

    /// Highest use position `<= from` with priority at least `min`.
    pub fn previous_usage(&self, min: RegisterPriority, from: u32) -> Option<u32> {
        debug_assert!(self.operand.is_virt());
        let mut prev = None;
        for i in (0..self.use_pos.len()).rev() {
            let pos = self.use_pos.pos(i);
            if pos > from {
                return prev;
            }
            if self.adapt_priority(self.use_pos.priority(i)) >= min {
                prev = Some(pos);
            }
        }
        prev
    }
}

/// First intersecting position of two interval range lists, starting the
/// scan at the given range indices, or `None` if they do not intersect.
pub fn intersects_at(
    a: &Interval,
    a_start: usize,
    b: &Interval,
    b_start: usize,
) -> Option<u32> {
    let mut i = a_start;
    let mut j = b_start;
    while i < a.num_ranges() && j < b.num_ranges() {
        let ra = a.range(i);
        let rb = b.range(j);
        if ra.from < rb.from {
            if ra.to <= rb.from {
                i += 1;
            } else {
                return Some(rb.from);
            }
        } else if rb.from < ra.from {
            if rb.to <= ra.from {
                j += 1;
            } else {
                return Some(ra.from);
            }
        } else {
            return Some(ra.from);
        }
    }
    None
}

/// The interval arena for one function.
///
/// Arena indices are operand numbers: index `r` for physical register
/// `r`, `num_regs + v` for virtual value `v`, and fresh indices past
/// those for intervals created by splitting.
pub struct Intervals {
    arena: PrimaryMap<IntervalId, Interval>,
}

impl Intervals {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self {
            arena: PrimaryMap::new(),
        }
    }

    /// Number of intervals.
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    /// True if the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.arena.len() == 0
    }

    /// Iterate over all interval ids.
    pub fn keys(&self) -> cranelift_entity::Keys<IntervalId> {
        self.arena.keys()
    }

    /// Append a new top-level interval.
    pub fn push(&mut self, operand: Operand, kind: ValueKind) -> IntervalId {
        self.arena.push(Interval::new(operand, kind))
    }

    /// Record a constant definition for rematerialization. On the second
    /// definition the constant is dropped: a multiply-defined value
    /// cannot be rematerialized.
    pub fn add_materialization_value(&mut self, id: IntervalId, value: i64) {
        let interval = &mut self.arena[id];
        if interval.num_material_defs == 0 {
            interval.materialized_value = Some(value);
        } else {
            interval.materialized_value = None;
        }
        interval.num_material_defs += 1;
    }

    /// Drop any recorded materialization constant.
    pub fn clear_materialization(&mut self, id: IntervalId) {
        let interval = &mut self.arena[id];
        interval.materialized_value = None;
        interval.num_material_defs += 1;
    }

    /// The constant this interval can be rematerialized from.
    pub fn materialized_value(&self, id: IntervalId) -> Option<i64> {
        self.arena[self.split_parent(id)].materialized_value
    }

    /// Can this interval be regenerated from a constant instead of being
    /// reloaded from its spill slot?
    pub fn can_materialize(&self, id: IntervalId) -> bool {
        self.materialized_value(id).is_some()
    }

    /// The split parent of `id`; `id` itself if it is a parent.
    pub fn split_parent(&self, id: IntervalId) -> IntervalId {
        self.arena[id].split_parent.expand().unwrap_or(id)
    }

    /// Is `id` a split parent (possibly without children)?
    pub fn is_split_parent(&self, id: IntervalId) -> bool {
        self.arena[id].split_parent.is_none()
    }

    /// The split children of a parent. Contains the parent itself once
    /// the interval has been split.
    pub fn split_children(&self, parent: IntervalId) -> &[IntervalId] {
        debug_assert!(self.is_split_parent(parent));
        &self.arena[parent].split_children
    }

    /// The family-wide spill state.
    pub fn spill_state(&self, id: IntervalId) -> SpillState {
        self.arena[self.split_parent(id)].spill_state
    }

    /// Advance the family-wide spill state.
    pub fn set_spill_state(&mut self, id: IntervalId, state: SpillState) {
        let parent = self.split_parent(id);
        let interval = &mut self.arena[parent];
        interval.spill_state = interval.spill_state.advance(state);
    }

    /// The canonical spill slot of the family, if allocated.
    pub fn spill_slot(&self, id: IntervalId) -> Option<SpillSlot> {
        self.arena[self.split_parent(id)].spill_slot
    }

    /// Set the canonical spill slot. It may be set only once.
    pub fn set_spill_slot(&mut self, id: IntervalId, slot: SpillSlot) {
        let parent = self.split_parent(id);
        debug_assert!(self.arena[parent].spill_slot.is_none());
        self.arena[parent].spill_slot = Some(slot);
    }

    /// Position of the definition the canonical spill store belongs to.
    pub fn spill_definition_pos(&self, id: IntervalId) -> Option<u32> {
        self.arena[self.split_parent(id)].spill_definition_pos
    }

    /// Set the spill definition position.
    pub fn set_spill_definition_pos(&mut self, id: IntervalId, pos: u32) {
        let parent = self.split_parent(id);
        self.arena[parent].spill_definition_pos = Some(pos);
    }

    /// True if the stack copy of this interval is always current and the
    /// value is not rematerialized.
    pub fn always_in_memory(&self, id: IntervalId) -> bool {
        self.spill_state(id).always_in_memory() && !self.can_materialize(id)
    }

    /// Record a use position with its priority. Fixed intervals record
    /// nothing: they are precolored and never scanned for uses.
    pub fn add_use_pos(&mut self, id: IntervalId, pos: u32, priority: RegisterPriority) {
        let interval = &mut self.arena[id];
        debug_assert!(
            interval.covers(pos, OperandMode::Use),
            "use position {} not covered by {}",
            pos,
            interval.operand
        );
        if priority == RegisterPriority::None || !interval.operand.is_virt() {
            return;
        }
        // Positions arrive in descending order, so the list stays sorted
        // by appending; an equal position keeps the higher priority.
        let len = interval.use_pos.len();
        if len == 0 || interval.use_pos.pos(len - 1) > pos {
            interval.use_pos.push(pos, priority);
        } else if interval.use_pos.priority(len - 1) < priority {
            debug_assert_eq!(interval.use_pos.pos(len - 1), pos);
            interval.use_pos.set_priority(len - 1, priority);
        }
    }

    /// Split `id` at `split_pos`, returning the new child covering
    /// `[split_pos, to)`. The caller supplies the child's fresh operand.
    pub fn split(
        &mut self,
        id: IntervalId,
        split_pos: u32,
        child_operand: Operand,
    ) -> IntervalId {
        debug_assert!(self.arena[id].operand.is_virt(), "cannot split fixed intervals");
        let parent = self.split_parent(id);
        let kind = self.arena[id].kind;

        let child = self.arena.push(Interval::new(child_operand, kind));
        self.arena[child].split_parent = parent.into();
        self.arena[child].location_hint = parent.into();
        // Rematerialization is family-wide; keep the copy local so use
        // priority adaptation does not need the arena.
        self.arena[child].materialized_value = self.arena[parent].materialized_value;

        if self.arena[parent].split_children.is_empty() {
            debug_assert_eq!(parent, id, "children list is initialized at the first split");
            self.arena[parent].split_children.push(id);
        }
        self.arena[parent].split_children.push(child);

        // Divide the ranges at split_pos.
        let interval = &mut self.arena[id];
        let mut cut = 0;
        while cut < interval.ranges.len() && interval.ranges[cut].to <= split_pos {
            cut += 1;
        }
        debug_assert!(cut < interval.ranges.len(), "split after the end of the last range");
        let mut child_ranges: SmallVec<[LiveRange; 4]>;
        if interval.ranges[cut].from < split_pos {
            // The split position lies inside a range; both sides keep a
            // piece of it.
            child_ranges = interval.ranges[cut..].iter().copied().collect();
            child_ranges[0].from = split_pos;
            interval.ranges.truncate(cut + 1);
            interval.ranges[cut].to = split_pos;
        } else {
            // The split position lies in a hole between two ranges.
            child_ranges = interval.ranges[cut..].iter().copied().collect();
            interval.ranges.truncate(cut);
        }
        let child_uses = interval.use_pos.split_at(split_pos);
        self.arena[child].ranges = child_ranges;
        self.arena[child].use_pos = child_uses;
        child
    }

    /// The split child of `id`'s family covering `op_id`, with the list
    /// reordered so repeated queries for nearby positions stay fast.
    ///
    /// Zero or several covering children means the family's invariants
    /// are broken, which is fatal.
    pub fn split_child_at(
        &mut self,
        id: IntervalId,
        op_id: u32,
        mode: OperandMode,
    ) -> Result<IntervalId, VerifierError> {
        let parent = self.split_parent(id);
        if self.arena[parent].split_children.is_empty() {
            debug_assert!(self.arena[parent].covers(op_id, mode));
            return Ok(parent);
        }

        // A use at a child's very end position still reads that child; a
        // definition there belongs to the next one.
        let to_offset = match mode {
            OperandMode::Def => 0,
            OperandMode::Use => 1,
        };
        let len = self.arena[parent].split_children.len();
        let mut found = None;
        for i in 0..len {
            let child = self.arena[parent].split_children[i];
            let interval = &self.arena[child];
            if interval.from() <= op_id && op_id < interval.to().saturating_add(to_offset) {
                // A use exactly at a block-boundary split matches both
                // the child ending there and the child starting there;
                // the starting child holds the value.
                if found.is_none() || interval.from() == op_id {
                    found = Some((i, child));
                }
                if mode == OperandMode::Def || interval.from() == op_id {
                    break;
                }
            }
        }

        let found = match found {
            Some((i, f)) => {
                if i > 0 {
                    self.arena[parent].split_children.swap(0, i);
                }
                f
            }
            None => {
                return Err(VerifierError::NoCoveringChild {
                    parent: self.describe(parent),
                    pos: op_id,
                })
            }
        };
        if cfg!(debug_assertions) {
            for &child in &self.arena[parent].split_children {
                if child == found {
                    continue;
                }
                let interval = &self.arena[child];
                if interval.to() == op_id && self.arena[found].from() == op_id {
                    // The tiled neighbor ending where `found` starts.
                    continue;
                }
                if interval.from() <= op_id && op_id < interval.to().saturating_add(to_offset) {
                    return Err(VerifierError::AmbiguousChild {
                        parent: self.describe(parent),
                        pos: op_id,
                        a: self.describe(found),
                        b: self.describe(child),
                    });
                }
            }
        }
        Ok(found)
    }

    /// The split child ending closest before (or at) `op_id`.
    pub fn split_child_before(&self, id: IntervalId, op_id: u32) -> IntervalId {
        let parent = self.split_parent(id);
        let mut result = None;
        for &child in &self.arena[parent].split_children {
            let interval = &self.arena[child];
            if interval.to() <= op_id
                && result.map_or(true, |r: IntervalId| self.arena[r].to() < interval.to())
            {
                result = Some(child);
            }
        }
        result.expect("no split child ends before the requested position")
    }

    /// Resolve this interval's location hint to an interval that already
    /// has a register, searching the hint's split children if needed.
    pub fn location_hint(&self, id: IntervalId, search_split_child: bool) -> Option<IntervalId> {
        let hint = self.arena[id].location_hint.expand()?;
        if !search_split_child {
            return Some(hint);
        }
        if self.arena[hint].location.is_reg() {
            return Some(hint);
        }
        self.arena[hint]
            .split_children
            .iter()
            .copied()
            .find(|&child| self.arena[child].location.is_reg())
    }

    /// A short human-readable description for diagnostics.
    pub fn describe(&self, id: IntervalId) -> String {
        let interval = &self.arena[id];
        format!(
            "{} {} [{}, {}) at {}",
            id,
            interval.operand,
            interval.from(),
            interval.to(),
            interval.location
        )
    }
}

impl Default for Intervals {
    fn default() -> Self {
        Self::new()
    }
}

impl core::ops::Index<IntervalId> for Intervals {
    type Output = Interval;

    fn index(&self, id: IntervalId) -> &Interval {
        &self.arena[id]
    }
}

impl core::ops::IndexMut<IntervalId> for Intervals {
    fn index_mut(&mut self, id: IntervalId) -> &mut Interval {
        &mut self.arena[id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Value;
    use cranelift_entity::EntityRef;

    fn virt(n: usize) -> Operand {
        Operand::Virt(Value::new(n))
    }

    fn make(intervals: &mut Intervals) -> IntervalId {
        intervals.push(virt(0), ValueKind::Int)
    }

    #[test]
    fn ranges_build_backwards() {
        let mut intervals = Intervals::new();
        let id = make(&mut intervals);
        intervals[id].add_range(20, 30);
        intervals[id].add_range(10, 14);
        // touching ranges join
        intervals[id].add_range(6, 10);
        assert_eq!(intervals[id].num_ranges(), 2);
        assert_eq!(intervals[id].from(), 6);
        assert_eq!(intervals[id].to(), 30);
        intervals[id].set_from(8);
        assert_eq!(intervals[id].from(), 8);
    }

    #[test]
    fn covers_respects_mode() {
        let mut intervals = Intervals::new();
        let id = make(&mut intervals);
        intervals[id].add_range(10, 20);
        let iv = &intervals[id];
        assert!(iv.covers(10, OperandMode::Def));
        assert!(iv.covers(19, OperandMode::Def));
        assert!(!iv.covers(20, OperandMode::Def));
        // a use at the end position still reads this interval
        assert!(iv.covers(20, OperandMode::Use));
        assert!(!iv.covers(21, OperandMode::Use));
    }

    #[test]
    fn holes() {
        let mut intervals = Intervals::new();
        let id = make(&mut intervals);
        intervals[id].add_range(30, 40);
        intervals[id].add_range(10, 20);
        let iv = &intervals[id];
        assert!(iv.has_hole_between(18, 32));
        assert!(iv.has_hole_between(20, 21));
        assert!(!iv.has_hole_between(10, 20));
        assert!(!iv.has_hole_between(32, 39));
    }

    #[test]
    fn use_positions_and_queries() {
        let mut intervals = Intervals::new();
        let id = make(&mut intervals);
        intervals[id].add_range(0, 40);
        intervals.add_use_pos(id, 36, RegisterPriority::ShouldHaveRegister);
        intervals.add_use_pos(id, 20, RegisterPriority::MustHaveRegister);
        intervals.add_use_pos(id, 4, RegisterPriority::ShouldHaveRegister);
        // equal position upgrades priority in place
        intervals.add_use_pos(id, 4, RegisterPriority::MustHaveRegister);

        let iv = &intervals[id];
        assert_eq!(iv.first_usage(RegisterPriority::MustHaveRegister), 4);
        assert_eq!(iv.next_usage(RegisterPriority::MustHaveRegister, 5), 20);
        assert_eq!(iv.next_usage(RegisterPriority::ShouldHaveRegister, 21), 36);
        assert_eq!(iv.next_usage(RegisterPriority::MustHaveRegister, 21), MAX_POS);
        assert_eq!(iv.previous_usage(RegisterPriority::ShouldHaveRegister, 30), Some(20));
    }

    #[test]
    fn split_inside_a_range() {
        let mut intervals = Intervals::new();
        let id = make(&mut intervals);
        intervals[id].add_range(10, 40);
        intervals.add_use_pos(id, 30, RegisterPriority::MustHaveRegister);
        intervals.add_use_pos(id, 12, RegisterPriority::MustHaveRegister);

        let child = intervals.split(id, 21, virt(1));
        assert_eq!(intervals[id].from(), 10);
        assert_eq!(intervals[id].to(), 21);
        assert_eq!(intervals[child].from(), 21);
        assert_eq!(intervals[child].to(), 40);
        assert_eq!(intervals[id].use_positions().len(), 1);
        assert_eq!(intervals[child].use_positions().len(), 1);
        assert_eq!(intervals[child].use_positions().pos(0), 30);

        // flat family bookkeeping
        assert!(intervals.is_split_parent(id));
        assert!(!intervals.is_split_parent(child));
        assert_eq!(intervals.split_parent(child), id);
        assert_eq!(intervals.split_children(id), &[id, child]);

        // splitting the child keeps the family flat
        let grandchild = intervals.split(child, 33, virt(2));
        assert_eq!(intervals.split_parent(grandchild), id);
        assert_eq!(intervals.split_children(id), &[id, child, grandchild]);
    }

    #[test]
    fn split_in_a_hole() {
        let mut intervals = Intervals::new();
        let id = make(&mut intervals);
        intervals[id].add_range(30, 40);
        intervals[id].add_range(10, 20);
        let child = intervals.split(id, 24, virt(1));
        assert_eq!(intervals[id].num_ranges(), 1);
        assert_eq!(intervals[id].to(), 20);
        assert_eq!(intervals[child].from(), 30);
    }

    #[test]
    fn split_children_tile_parent() {
        let mut intervals = Intervals::new();
        let id = make(&mut intervals);
        intervals[id].add_range(0, 100);
        let c1 = intervals.split(id, 25, virt(1));
        let c2 = intervals.split(c1, 60, virt(2));
        let mut bounds: Vec<(u32, u32)> = intervals
            .split_children(id)
            .iter()
            .map(|&c| (intervals[c].from(), intervals[c].to()))
            .collect();
        bounds.sort();
        assert_eq!(bounds, vec![(0, 25), (25, 60), (60, 100)]);
        let _ = c2;
    }

    #[test]
    fn split_child_lookup() {
        let mut intervals = Intervals::new();
        let id = make(&mut intervals);
        intervals[id].add_range(0, 100);
        let c1 = intervals.split(id, 25, virt(1));
        let c2 = intervals.split(c1, 61, virt(2));

        assert_eq!(intervals.split_child_at(id, 10, OperandMode::Use), Ok(id));
        assert_eq!(intervals.split_child_at(id, 30, OperandMode::Def), Ok(c1));
        // both a def and a use at a child boundary resolve to the child
        // starting there; the ending child gave the value up at the split
        assert_eq!(intervals.split_child_at(id, 25, OperandMode::Def), Ok(c1));
        assert_eq!(intervals.split_child_at(id, 25, OperandMode::Use), Ok(c1));
        assert_eq!(intervals.split_child_at(c2, 80, OperandMode::Use), Ok(c2));
        assert!(intervals.split_child_at(id, 101, OperandMode::Use).is_err());

        // c1 covers [25, 61) and is the child ending closest before 61
        assert_eq!(intervals.split_child_before(id, 61), c1);
        assert_eq!(intervals.split_child_before(id, 30), id);
    }

    #[test]
    fn intersections() {
        let mut intervals = Intervals::new();
        let a = intervals.push(virt(0), ValueKind::Int);
        let b = intervals.push(virt(1), ValueKind::Int);
        intervals[a].add_range(30, 40);
        intervals[a].add_range(10, 20);
        intervals[b].add_range(20, 32);
        let (ia, ib) = (&intervals[a], &intervals[b]);
        assert_eq!(intersects_at(ia, 0, ib, 0), Some(30));
        // starting past the overlapping range finds nothing
        assert_eq!(intersects_at(ia, 1, ib, 0), Some(30));

        let c = intervals.push(virt(2), ValueKind::Int);
        intervals[c].add_range(20, 30);
        assert_eq!(intersects_at(&intervals[a], 0, &intervals[c], 0), None);
    }

    #[test]
    fn spill_state_is_monotonic() {
        let mut intervals = Intervals::new();
        let id = make(&mut intervals);
        intervals.set_spill_state(id, SpillState::NoSpillStore);
        intervals.set_spill_state(id, SpillState::OneSpillStore);
        intervals.set_spill_state(id, SpillState::SpillInDominator);
        assert_eq!(intervals.spill_state(id), SpillState::SpillInDominator);
        assert!(intervals.always_in_memory(id));
    }

    #[test]
    #[should_panic(expected = "spill state cannot decrease")]
    #[cfg(debug_assertions)]
    fn spill_state_rejects_downgrade() {
        let mut intervals = Intervals::new();
        let id = make(&mut intervals);
        intervals.set_spill_state(id, SpillState::OneSpillStore);
        intervals.set_spill_state(id, SpillState::NoSpillStore);
    }

    #[test]
    fn materialization() {
        let mut intervals = Intervals::new();
        let id = make(&mut intervals);
        intervals[id].add_range(0, 50);
        intervals.add_materialization_value(id, 42);
        assert_eq!(intervals.materialized_value(id), Some(42));

        // a ShouldHaveRegister use is upgraded because there is no stack
        // copy to fall back to
        intervals.add_use_pos(id, 10, RegisterPriority::ShouldHaveRegister);
        assert_eq!(
            intervals[id].first_usage(RegisterPriority::MustHaveRegister),
            10
        );

        // children inherit the constant
        let child = intervals.split(id, 21, virt(1));
        assert!(intervals.can_materialize(child));

        // a second definition kills materialization
        let other = intervals.push(virt(2), ValueKind::Int);
        intervals.add_materialization_value(other, 1);
        intervals.add_materialization_value(other, 2);
        assert_eq!(intervals.materialized_value(other), None);
    }
}
