//! Target register description.
//!
//! The allocator is target independent; everything it needs to know about
//! registers fits in a [`RegInfo`]: how many physical registers exist,
//! which of them may be allocated for each value kind, and which are
//! destroyed by calls.

use crate::ir::ValueKind;
use cranelift_entity::entity_impl;

/// An opaque reference to a physical register.
///
/// Register indices are dense and shared with the operand numbering: the
/// low operand numbers are exactly the physical registers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysReg(u32);
entity_impl!(PhysReg, "r");

/// The register configuration for one target.
#[derive(Clone, Debug)]
pub struct RegInfo {
    num_regs: u32,
    allocatable_int: Vec<PhysReg>,
    allocatable_float: Vec<PhysReg>,
    caller_saved: Vec<PhysReg>,
}

impl RegInfo {
    /// Create a configuration with `num_regs` physical registers, none of
    /// them allocatable yet.
    pub fn new(num_regs: u32) -> Self {
        Self {
            num_regs,
            allocatable_int: Vec::new(),
            allocatable_float: Vec::new(),
            caller_saved: Vec::new(),
        }
    }

    /// Mark registers as allocatable for integer values.
    pub fn with_int(mut self, regs: &[u32]) -> Self {
        self.allocatable_int = regs.iter().map(|&r| PhysReg::from_u32(r)).collect();
        self
    }

    /// Mark registers as allocatable for float values.
    pub fn with_float(mut self, regs: &[u32]) -> Self {
        self.allocatable_float = regs.iter().map(|&r| PhysReg::from_u32(r)).collect();
        self
    }

    /// Mark registers as destroyed by calls.
    pub fn with_caller_saved(mut self, regs: &[u32]) -> Self {
        self.caller_saved = regs.iter().map(|&r| PhysReg::from_u32(r)).collect();
        self
    }

    /// Total number of physical registers.
    pub fn num_regs(&self) -> u32 {
        self.num_regs
    }

    /// The allocatable registers for a value kind.
    pub fn allocatable(&self, kind: ValueKind) -> &[PhysReg] {
        match kind {
            ValueKind::Int => &self.allocatable_int,
            ValueKind::Float => &self.allocatable_float,
        }
    }

    /// The registers destroyed by call-like instructions.
    pub fn caller_saved(&self) -> &[PhysReg] {
        &self.caller_saved
    }
}
