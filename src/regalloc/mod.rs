//! Register allocation.
//!
//! The entry point is [`Context`], which owns the reusable analyses and
//! drives the allocator phases over one function at a time. The phases
//! communicate through [`context::LinearScan`], the per-function
//! allocator state: the interval arena, the instruction numbering, the
//! liveness sets, and the stack frame.

pub mod context;
pub mod interval;
pub mod walker;

mod assign;
mod eliminate;
mod lifetime;
mod move_resolver;
mod resolve;
mod spill_pos;
mod verifier;

pub use self::context::{Context, LinearScan};
pub use self::walker::{Optimizing, Standard, WalkStrategy};
