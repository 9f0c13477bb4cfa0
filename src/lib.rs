//! Linear scan register allocation with lifetime interval splitting.
//!
//! This library assigns a physical register or spill slot to every virtual
//! operand of a linear instruction stream, for every point where that
//! operand is live. Lifetimes are modeled as intervals over instruction
//! positions; an interval may be split so that one value lives in different
//! locations over its lifetime, with reconciling moves inserted at the
//! splits and at control flow edges.
//!
//! The main entry point is [`regalloc::Context`], which runs the allocator
//! phases over an [`ir::Function`] in order:
//!
//! 1. lifetime analysis (instruction numbering, liveness, interval build),
//! 2. the allocation walk (register assignment, splitting, spilling),
//! 3. spill position optimization,
//! 4. data flow resolution at block boundaries,
//! 5. spill move elimination, and
//! 6. location assignment.

#![deny(unsafe_code)]
#![warn(trivial_numeric_casts, unused_extern_crates, unstable_features)]

pub mod bitset;
pub mod dominator_tree;
pub mod flowgraph;
pub mod frame;
pub mod ir;
pub mod loop_analysis;
pub mod regalloc;
pub mod reginfo;
pub mod result;

pub use crate::result::{AllocError, AllocResult};
