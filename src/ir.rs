//! The linear instruction representation consumed by the allocator.
//!
//! A [`Function`] is an ordered list of basic blocks, each holding a vector
//! of instructions. Instructions reference *operands*: virtual values,
//! physical registers, spill slots, or constants. Before allocation all
//! data operands are virtual or precolored registers; the allocator
//! rewrites every occurrence to a register, slot, or constant.
//!
//! Instructions expose their operands through [`OperandVisitor`], which
//! partitions them by usage mode: plain inputs, inputs kept alive across
//! the instruction, temporaries, and outputs, plus debug state operands.

use crate::frame::SpillSlot;
use crate::reginfo::PhysReg;
use core::fmt;
use cranelift_entity::{entity_impl, PrimaryMap};
use smallvec::SmallVec;

/// An opaque reference to a basic block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to an instruction.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// An opaque reference to a virtual value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value(u32);
entity_impl!(Value, "v");

/// The storable category of a value, deciding which register class and
/// spill slot size it needs.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum ValueKind {
    /// Word-sized integer values.
    Int,
    /// Floating point values, occupying two spill slot words.
    Float,
}

impl ValueKind {
    /// Number of stack words a spilled value of this kind occupies.
    pub fn num_slots(self) -> u32 {
        match self {
            Self::Int => 1,
            Self::Float => 2,
        }
    }
}

/// An operand occurrence in an instruction.
///
/// Input functions use `Virt` and `Reg` operands only; `Slot` and `Const`
/// occurrences are produced by the allocator when it rewrites locations
/// and rematerializes constants.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Operand {
    /// A virtual value, subject to allocation.
    Virt(Value),
    /// A physical register, precolored or assigned.
    Reg(PhysReg),
    /// A stack spill slot.
    Slot(SpillSlot),
    /// An immediate constant.
    Const(i64),
}

impl Operand {
    /// The virtual value, if this operand is one.
    pub fn as_virt(self) -> Option<Value> {
        match self {
            Self::Virt(v) => Some(v),
            _ => None,
        }
    }

    /// Is this a virtual value?
    pub fn is_virt(self) -> bool {
        matches!(self, Self::Virt(_))
    }

    /// Is this a physical register?
    pub fn is_reg(self) -> bool {
        matches!(self, Self::Reg(_))
    }

    /// Is this a stack slot?
    pub fn is_slot(self) -> bool {
        matches!(self, Self::Slot(_))
    }
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Self::Virt(v)
    }
}

impl From<PhysReg> for Operand {
    fn from(r: PhysReg) -> Self {
        Self::Reg(r)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Virt(v) => write!(f, "{}", v),
            Self::Reg(r) => write!(f, "{}", r),
            Self::Slot(s) => write!(f, "{}", s),
            Self::Const(c) => write!(f, "#{}", c),
        }
    }
}

/// The payload of an instruction.
#[derive(Clone, Debug)]
pub enum InstKind {
    /// A generic computational instruction.
    Op {
        /// Operands read at this instruction.
        inputs: SmallVec<[Operand; 2]>,
        /// Operands read and kept alive across this instruction, so they
        /// may not share a register with any output.
        alive: SmallVec<[Operand; 2]>,
        /// Scratch operands live only during this instruction.
        temps: SmallVec<[Operand; 2]>,
        /// Operands defined by this instruction.
        outputs: SmallVec<[Operand; 2]>,
        /// Does this instruction destroy all caller saved registers?
        clobbers_caller_saved: bool,
    },
    /// Copy `src` to `dst`.
    Move {
        /// Source operand.
        src: Operand,
        /// Destination operand.
        dst: Operand,
    },
    /// Define `dst` with the constant `value`.
    LoadConst {
        /// The constant.
        value: i64,
        /// Destination operand.
        dst: Operand,
    },
    /// Unconditional jump.
    Jump {
        /// Jump target.
        target: Block,
    },
    /// Conditional or multi-way branch on `arg`.
    Branch {
        /// The tested operand.
        arg: Operand,
        /// Possible targets, in test order.
        targets: SmallVec<[Block; 2]>,
    },
    /// Return from the function.
    Ret {
        /// Returned operand, if any.
        arg: Option<Operand>,
    },
}

/// An instruction: its kind, its position id, and its debug state.
#[derive(Clone, Debug)]
pub struct InstData {
    /// The instruction payload.
    pub kind: InstKind,
    /// Position id assigned by instruction numbering. Instructions the
    /// allocator inserts itself carry no id.
    pub id: Option<u32>,
    /// Debug state operands observed at this instruction.
    pub state: SmallVec<[Operand; 2]>,
}

impl InstData {
    fn new(kind: InstKind) -> Self {
        Self {
            kind,
            id: None,
            state: SmallVec::new(),
        }
    }

    /// A generic instruction reading `inputs` and defining `outputs`.
    pub fn op(inputs: &[Operand], outputs: &[Operand]) -> Self {
        Self::op_full(inputs, &[], &[], outputs, false)
    }

    /// A generic instruction with all operand categories spelled out.
    pub fn op_full(
        inputs: &[Operand],
        alive: &[Operand],
        temps: &[Operand],
        outputs: &[Operand],
        clobbers_caller_saved: bool,
    ) -> Self {
        Self::new(InstKind::Op {
            inputs: SmallVec::from_slice(inputs),
            alive: SmallVec::from_slice(alive),
            temps: SmallVec::from_slice(temps),
            outputs: SmallVec::from_slice(outputs),
            clobbers_caller_saved,
        })
    }

    /// A call-like instruction: destroys the caller saved registers.
    pub fn call(inputs: &[Operand], output: Option<Operand>) -> Self {
        let outputs: SmallVec<[Operand; 2]> = output.into_iter().collect();
        Self::new(InstKind::Op {
            inputs: SmallVec::from_slice(inputs),
            alive: SmallVec::new(),
            temps: SmallVec::new(),
            outputs,
            clobbers_caller_saved: true,
        })
    }

    /// A move from `src` to `dst`.
    pub fn mov(dst: Operand, src: Operand) -> Self {
        Self::new(InstKind::Move { src, dst })
    }

    /// A constant load into `dst`.
    pub fn load_const(dst: Operand, value: i64) -> Self {
        Self::new(InstKind::LoadConst { value, dst })
    }

    /// An unconditional jump.
    pub fn jump(target: Block) -> Self {
        Self::new(InstKind::Jump { target })
    }

    /// A branch on `arg` with two or more targets.
    pub fn branch(arg: Operand, targets: &[Block]) -> Self {
        debug_assert!(targets.len() >= 2);
        Self::new(InstKind::Branch {
            arg,
            targets: SmallVec::from_slice(targets),
        })
    }

    /// A return.
    pub fn ret(arg: Option<Operand>) -> Self {
        Self::new(InstKind::Ret { arg })
    }

    /// Attach debug state operands.
    pub fn with_state(mut self, state: &[Operand]) -> Self {
        self.state = SmallVec::from_slice(state);
        self
    }

    /// The blocks this instruction can branch to. Empty for non-branches.
    pub fn branch_targets(&self) -> &[Block] {
        match &self.kind {
            InstKind::Jump { target } => core::slice::from_ref(target),
            InstKind::Branch { targets, .. } => targets,
            _ => &[],
        }
    }

    /// Is this instruction a block terminator?
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            InstKind::Jump { .. } | InstKind::Branch { .. } | InstKind::Ret { .. }
        )
    }

    /// Is this an unconditional jump?
    pub fn is_jump(&self) -> bool {
        matches!(self.kind, InstKind::Jump { .. })
    }

    /// The `(dst, src)` pair if this is a move.
    pub fn as_move(&self) -> Option<(Operand, Operand)> {
        match self.kind {
            InstKind::Move { src, dst } => Some((dst, src)),
            _ => None,
        }
    }

    /// Does this instruction destroy the caller saved registers?
    pub fn destroys_caller_saved(&self) -> bool {
        matches!(
            self.kind,
            InstKind::Op {
                clobbers_caller_saved: true,
                ..
            }
        )
    }

    /// Visit every operand occurrence, partitioned by usage mode.
    ///
    /// Outputs are visited first, then temporaries, then kept-alive
    /// inputs, then plain inputs, then state operands.
    pub fn visit_operands<V: OperandVisitor>(&mut self, visitor: &mut V) {
        match &mut self.kind {
            InstKind::Op {
                inputs,
                alive,
                temps,
                outputs,
                ..
            } => {
                for op in outputs {
                    visitor.visit_def(op);
                }
                for op in temps {
                    visitor.visit_temp(op);
                }
                for op in alive {
                    visitor.visit_use(op);
                }
                for op in inputs {
                    visitor.visit_input(op);
                }
            }
            InstKind::Move { src, dst } => {
                visitor.visit_def(dst);
                visitor.visit_input(src);
            }
            InstKind::LoadConst { dst, .. } => {
                visitor.visit_def(dst);
            }
            InstKind::Jump { .. } => {}
            InstKind::Branch { arg, .. } => {
                visitor.visit_input(arg);
            }
            InstKind::Ret { arg } => {
                if let Some(op) = arg {
                    visitor.visit_input(op);
                }
            }
        }
        for op in &mut self.state {
            visitor.visit_state(op);
        }
    }
}

/// Visitor over the operand occurrences of one instruction.
///
/// All methods default to doing nothing, so a visitor implements only the
/// modes it cares about.
pub trait OperandVisitor {
    /// An operand read by the instruction.
    fn visit_input(&mut self, _operand: &mut Operand) {}
    /// An operand read and kept alive across the instruction.
    fn visit_use(&mut self, _operand: &mut Operand) {}
    /// A scratch operand live only during the instruction.
    fn visit_temp(&mut self, _operand: &mut Operand) {}
    /// An operand defined by the instruction.
    fn visit_def(&mut self, _operand: &mut Operand) {}
    /// A debug state operand.
    fn visit_state(&mut self, _operand: &mut Operand) {}
}

/// Contents of a basic block.
#[derive(Clone, Debug, Default)]
pub struct BlockData {
    /// Instructions in program order. The last one must be a terminator
    /// once the block is complete.
    pub insts: Vec<Inst>,
    /// Relative execution frequency override. When absent, the frequency
    /// is estimated from the loop depth.
    pub frequency: Option<f64>,
}

/// A function: blocks in layout order plus the instruction and value pools.
#[derive(Clone, Default)]
pub struct Function {
    /// Instruction pool.
    pub insts: PrimaryMap<Inst, InstData>,
    /// Block pool.
    pub blocks: PrimaryMap<Block, BlockData>,
    /// Blocks in layout (linear) order. The first block is the entry.
    pub layout: Vec<Block>,
    value_kinds: PrimaryMap<Value, ValueKind>,
}

impl Function {
    /// Create an empty function.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new block and append it to the layout.
    pub fn create_block(&mut self) -> Block {
        let block = self.blocks.push(BlockData::default());
        self.layout.push(block);
        block
    }

    /// Create a new virtual value of the given kind.
    pub fn new_value(&mut self, kind: ValueKind) -> Value {
        self.value_kinds.push(kind)
    }

    /// The kind of a value.
    pub fn value_kind(&self, value: Value) -> ValueKind {
        self.value_kinds[value]
    }

    /// Number of virtual values created so far.
    pub fn num_values(&self) -> usize {
        self.value_kinds.len()
    }

    /// The entry block.
    pub fn entry(&self) -> Block {
        self.layout[0]
    }

    /// Append an instruction to a block.
    pub fn push_inst(&mut self, block: Block, data: InstData) -> Inst {
        let inst = self.insts.push(data);
        self.blocks[block].insts.push(inst);
        inst
    }

    /// Create an instruction without placing it in a block.
    pub fn make_inst(&mut self, data: InstData) -> Inst {
        self.insts.push(data)
    }

    /// The terminator of a block, if the block is non-empty.
    pub fn terminator(&self, block: Block) -> Option<Inst> {
        self.blocks[block].insts.last().copied()
    }

    /// Successor blocks of `block`, taken from its terminator.
    pub fn successors(&self, block: Block) -> &[Block] {
        match self.terminator(block) {
            Some(inst) => self.insts[inst].branch_targets(),
            None => &[],
        }
    }

    /// Set the execution frequency override for a block.
    pub fn set_frequency(&mut self, block: Block, frequency: f64) {
        self.blocks[block].frequency = Some(frequency);
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for &block in &self.layout {
            writeln!(f, "{}:", block)?;
            for &inst in &self.blocks[block].insts {
                let data = &self.insts[inst];
                match data.id {
                    Some(id) => write!(f, "  {:>4} ", id)?,
                    None => write!(f, "     . ")?,
                }
                writeln!(f, "{:?}", data.kind)?;
            }
        }
        Ok(())
    }
}

/// A buffer of instructions to be spliced into one block's body.
///
/// Insertions are expressed as "insert before index `i`" against the block
/// contents at the time the buffer was initialized; `finish` applies them
/// all at once. Entries appended for the same index keep their order.
#[derive(Default)]
pub struct InsertionBuffer {
    block: Option<Block>,
    pending: Vec<(usize, Inst)>,
}

impl InsertionBuffer {
    /// Create an idle buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the buffer to a block. The buffer must be idle.
    pub fn init(&mut self, block: Block) {
        debug_assert!(self.block.is_none() && self.pending.is_empty());
        self.block = Some(block);
    }

    /// The block this buffer is bound to.
    pub fn block(&self) -> Option<Block> {
        self.block
    }

    /// Schedule `inst` for insertion before `index`.
    pub fn append(&mut self, index: usize, inst: Inst) {
        debug_assert!(self.block.is_some());
        self.pending.push((index, inst));
    }

    /// True if nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Apply all scheduled insertions and return the buffer to idle.
    pub fn finish(&mut self, func: &mut Function) {
        let block = match self.block.take() {
            Some(b) => b,
            None => return,
        };
        // Stable by index, so same-index entries keep append order.
        self.pending.sort_by_key(|&(index, _)| index);
        let insts = &mut func.blocks[block].insts;
        let mut i = self.pending.len();
        while i > 0 {
            let mut start = i;
            let index = self.pending[i - 1].0;
            while start > 0 && self.pending[start - 1].0 == index {
                start -= 1;
            }
            insts.splice(
                index..index,
                self.pending[start..i].iter().map(|&(_, inst)| inst),
            );
            i = start;
        }
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reginfo::PhysReg;
    use cranelift_entity::EntityRef;

    #[test]
    fn build_and_query() {
        let mut func = Function::new();
        let b0 = func.create_block();
        let b1 = func.create_block();
        let v0 = func.new_value(ValueKind::Int);
        let v1 = func.new_value(ValueKind::Int);

        func.push_inst(b0, InstData::load_const(v0.into(), 7));
        func.push_inst(b0, InstData::op(&[v0.into()], &[v1.into()]));
        func.push_inst(b0, InstData::jump(b1));
        func.push_inst(b1, InstData::ret(Some(v1.into())));

        assert_eq!(func.entry(), b0);
        assert_eq!(func.successors(b0), &[b1]);
        assert!(func.successors(b1).is_empty());
        assert_eq!(func.value_kind(v1), ValueKind::Int);
        let term = func.terminator(b0).unwrap();
        assert!(func.insts[term].is_jump());
    }

    #[test]
    fn visitation_order_and_modes() {
        let r0 = PhysReg::new(0);
        let mut func = Function::new();
        let v0 = func.new_value(ValueKind::Int);
        let v1 = func.new_value(ValueKind::Int);
        let mut data = InstData::op_full(
            &[v0.into()],
            &[],
            &[Operand::Reg(r0)],
            &[v1.into()],
            false,
        )
        .with_state(&[v0.into()]);

        #[derive(Default)]
        struct Collect {
            log: Vec<(char, Operand)>,
        }
        impl OperandVisitor for Collect {
            fn visit_input(&mut self, op: &mut Operand) {
                self.log.push(('i', *op));
            }
            fn visit_temp(&mut self, op: &mut Operand) {
                self.log.push(('t', *op));
            }
            fn visit_def(&mut self, op: &mut Operand) {
                self.log.push(('d', *op));
            }
            fn visit_state(&mut self, op: &mut Operand) {
                self.log.push(('s', *op));
            }
        }

        let mut v = Collect::default();
        data.visit_operands(&mut v);
        assert_eq!(
            v.log,
            vec![
                ('d', Operand::Virt(v1)),
                ('t', Operand::Reg(r0)),
                ('i', Operand::Virt(v0)),
                ('s', Operand::Virt(v0)),
            ]
        );
    }

    #[test]
    fn insertion_buffer_orders_same_index() {
        let mut func = Function::new();
        let b0 = func.create_block();
        let v = func.new_value(ValueKind::Int);
        let i0 = func.push_inst(b0, InstData::load_const(v.into(), 1));
        let i1 = func.push_inst(b0, InstData::ret(Some(v.into())));

        let a = func.make_inst(InstData::load_const(v.into(), 2));
        let b = func.make_inst(InstData::load_const(v.into(), 3));
        let c = func.make_inst(InstData::load_const(v.into(), 4));

        let mut buf = InsertionBuffer::new();
        buf.init(b0);
        buf.append(1, a);
        buf.append(1, b);
        buf.append(0, c);
        buf.finish(&mut func);

        assert_eq!(func.blocks[b0].insts, vec![c, i0, a, b, i1]);
        assert!(buf.block().is_none() && buf.is_empty());
    }
}
