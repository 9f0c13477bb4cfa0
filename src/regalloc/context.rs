//! The allocator driver and the per-function allocator state.

use crate::flowgraph::ControlFlowGraph;
use crate::dominator_tree::DominatorTree;
use crate::frame::FrameMap;
use crate::ir::{Block, Function, Inst, Operand, ValueKind};
use crate::loop_analysis::LoopAnalysis;
use crate::regalloc::interval::{IntervalId, Intervals, Location};
use crate::regalloc::lifetime::BlockLiveness;
use crate::regalloc::walker::{Optimizing, Standard, WalkStrategy};
use crate::regalloc::{assign, eliminate, resolve, spill_pos, verifier, walker};
use crate::reginfo::RegInfo;
use crate::result::AllocResult;
use cranelift_entity::{EntityRef, SecondaryMap};
use log::debug;

/// Reusable analysis storage for running the allocator over many
/// functions without reallocating.
pub struct Context {
    /// The control flow graph.
    pub cfg: ControlFlowGraph,
    /// The dominator tree, derived from the control flow graph.
    pub domtree: DominatorTree,
    /// The loop analysis, derived from the dominator tree.
    pub loops: LoopAnalysis,
}

impl Context {
    /// Allocate a new compilation context.
    pub fn new() -> Self {
        Self {
            cfg: ControlFlowGraph::new(),
            domtree: DominatorTree::new(),
            loops: LoopAnalysis::new(),
        }
    }

    /// Run the allocator over `func`, rewriting every virtual operand
    /// occurrence to a register, spill slot, or constant. Returns the
    /// stack frame holding the spill slots.
    pub fn run(&mut self, func: &mut Function, reginfo: &RegInfo) -> AllocResult<FrameMap> {
        self.run_with::<Standard>(func, reginfo, FrameMap::new())
    }

    /// Like [`run`](Self::run), but re-homes intervals to the location
    /// they had in the predecessor block where possible, trading walk
    /// time for fewer resolution moves.
    pub fn run_optimizing(
        &mut self,
        func: &mut Function,
        reginfo: &RegInfo,
    ) -> AllocResult<FrameMap> {
        self.run_with::<Optimizing>(func, reginfo, FrameMap::new())
    }

    /// Run with an explicit walk strategy and a pre-seeded frame. The
    /// caller seeds the frame when incoming arguments already occupy
    /// stack slots.
    pub fn run_with<S: WalkStrategy>(
        &mut self,
        func: &mut Function,
        reginfo: &RegInfo,
        frame: FrameMap,
    ) -> AllocResult<FrameMap> {
        self.cfg.compute(func);
        self.domtree.compute(func, &self.cfg);
        self.loops.compute(func, &self.cfg, &self.domtree);

        let mut ls = LinearScan::new(func, reginfo, &self.cfg, &self.domtree, &self.loops, frame);
        debug!("numbering {} blocks", ls.func.layout.len());
        ls.number_instructions();
        ls.compute_local_live_sets();
        ls.compute_global_live_sets()?;
        ls.build_intervals();
        ls.sort_intervals();
        debug!("allocating {} intervals", ls.sorted.len());
        walker::allocate_registers::<S>(&mut ls)?;
        if cfg!(debug_assertions) {
            verifier::verify(&ls)?;
        }
        spill_pos::optimize_spill_position(&mut ls);
        resolve::resolve_data_flow(&mut ls)?;
        eliminate::eliminate_spill_moves(&mut ls);
        assign::assign_locations(&mut ls)?;
        debug!("allocation finished, frame is {} words", ls.frame.frame_words());
        let LinearScan { frame, .. } = ls;
        Ok(frame)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// The allocator state for one function, shared by all phases.
pub struct LinearScan<'a> {
    /// The function being allocated.
    pub func: &'a mut Function,
    /// The target register description.
    pub reginfo: &'a RegInfo,
    /// The control flow graph of `func`.
    pub cfg: &'a ControlFlowGraph,
    /// The dominator tree of `func`.
    pub domtree: &'a DominatorTree,
    /// The loop analysis of `func`.
    pub loops: &'a LoopAnalysis,
    /// The stack frame; spill slots are allocated from here.
    pub frame: FrameMap,
    /// The interval arena.
    pub intervals: Intervals,
    /// Non-empty intervals sorted by increasing start position.
    pub sorted: Vec<IntervalId>,
    /// Per-block liveness sets over operand numbers.
    pub live: SecondaryMap<Block, BlockLiveness>,
    /// First and last instruction id of each block.
    pub block_range: SecondaryMap<Block, (u32, u32)>,
    /// Position of each block in the layout.
    pub block_order: SecondaryMap<Block, u32>,
    /// Instruction at each numbered position, indexed by `id / 2`.
    pub op_inst: Vec<Inst>,
    /// Block containing each numbered position, indexed by `id / 2`.
    pub op_block: Vec<Block>,
    /// Whether the instruction at each position destroys the caller
    /// saved registers, indexed by `id / 2`.
    pub op_has_call: Vec<bool>,
    /// Number of physical registers; also the first virtual operand
    /// number.
    pub num_phys: u32,
    call_kills: [bool; 2],
}

impl<'a> LinearScan<'a> {
    pub(super) fn new(
        func: &'a mut Function,
        reginfo: &'a RegInfo,
        cfg: &'a ControlFlowGraph,
        domtree: &'a DominatorTree,
        loops: &'a LoopAnalysis,
        frame: FrameMap,
    ) -> Self {
        let kills = |kind: ValueKind| {
            let regs = reginfo.allocatable(kind);
            !regs.is_empty() && regs.iter().all(|r| reginfo.caller_saved().contains(r))
        };
        let call_kills = [kills(ValueKind::Int), kills(ValueKind::Float)];
        Self {
            func,
            reginfo,
            cfg,
            domtree,
            loops,
            frame,
            intervals: Intervals::new(),
            sorted: Vec::new(),
            live: SecondaryMap::new(),
            block_range: SecondaryMap::new(),
            block_order: SecondaryMap::new(),
            op_inst: Vec::new(),
            op_block: Vec::new(),
            op_has_call: Vec::new(),
            num_phys: reginfo.num_regs(),
            call_kills,
        }
    }

    /// Total number of operand numbers: registers plus virtual values.
    pub fn num_operands(&self) -> usize {
        self.num_phys as usize + self.func.num_values()
    }

    /// The interval of an allocatable operand occurrence.
    pub fn interval_for(&self, operand: Operand) -> Option<IntervalId> {
        match operand {
            Operand::Reg(r) => Some(IntervalId::new(r.index())),
            Operand::Virt(v) => Some(IntervalId::new(self.num_phys as usize + v.index())),
            Operand::Slot(_) | Operand::Const(_) => None,
        }
    }

    /// Highest instruction id in the function.
    pub fn max_op_id(&self) -> u32 {
        debug_assert!(!self.op_inst.is_empty());
        (self.op_inst.len() as u32 - 1) * 2
    }

    /// The block containing the position `op_id` (rounded down to its
    /// instruction).
    pub fn block_for_id(&self, op_id: u32) -> Block {
        self.op_block[(op_id / 2) as usize]
    }

    /// The instruction at position `op_id`.
    pub fn inst_for_id(&self, op_id: u32) -> Inst {
        debug_assert_eq!(op_id & 1, 0);
        self.op_inst[(op_id / 2) as usize]
    }

    /// Does the instruction at `op_id` destroy the caller saved
    /// registers?
    pub fn has_call(&self, op_id: u32) -> bool {
        self.op_has_call[(op_id / 2) as usize]
    }

    /// Is `pos` the start of a block? Positions past the last instruction
    /// count as block begins, odd positions never do.
    pub fn is_block_begin(&self, pos: u32) -> bool {
        if pos == 0 {
            return true;
        }
        if pos > self.max_op_id() {
            return true;
        }
        self.block_for_id(pos) != self.block_for_id(pos - 1)
    }

    /// Id of the first instruction of `block`.
    pub fn block_from(&self, block: Block) -> u32 {
        self.block_range[block].0
    }

    /// Id of the last instruction of `block`.
    pub fn block_to(&self, block: Block) -> u32 {
        self.block_range[block].1
    }

    /// Relative execution frequency of `block`.
    pub fn block_frequency(&self, block: Block) -> f64 {
        self.loops.frequency(self.func, block)
    }

    /// Do call-like instructions destroy every allocatable register of
    /// this kind?
    pub fn call_kills_registers(&self, kind: ValueKind) -> bool {
        match kind {
            ValueKind::Int => self.call_kills[0],
            ValueKind::Float => self.call_kills[1],
        }
    }

    /// Split interval `id` at `pos`, minting a fresh virtual value as the
    /// child's operand so arena indices keep matching operand numbers.
    pub fn split_interval(&mut self, id: IntervalId, pos: u32) -> IntervalId {
        let kind = self.intervals[id].kind;
        let value = self.func.new_value(kind);
        let child = self.intervals.split(id, pos, Operand::Virt(value));
        debug_assert_eq!(child.index(), self.num_phys as usize + value.index());
        child
    }

    /// Park `id` in the family's canonical spill slot, allocating the
    /// slot on first use. Rematerializable values get no slot: they are
    /// reloaded from their constant instead.
    pub fn assign_spill_slot(&mut self, id: IntervalId) {
        if let Some(slot) = self.intervals.spill_slot(id) {
            self.intervals[id].location = Location::Slot(slot);
        } else if self.intervals.can_materialize(id) {
            self.intervals[id].location = Location::None;
        } else {
            let kind = self.intervals[id].kind;
            let slot = self.frame.alloc_spill_slot(kind);
            self.intervals.set_spill_slot(id, slot);
            self.intervals[id].location = Location::Slot(slot);
        }
    }
}
