//! Result and error types for register allocation.

use thiserror::Error;

/// An error detected while allocating registers for one function.
///
/// Errors split into two tiers. [`AllocError::OutOfRegisters`] and
/// [`AllocError::FixpointDiverged`] are bailouts: the current function is
/// abandoned but the caller may retry it in another configuration.
/// [`AllocError::UseBeforeDef`] and [`AllocError::Verifier`] report broken
/// input or broken allocator invariants and are not retryable.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// A mandatory register use could not be satisfied at the start of an
    /// interval's live range, even after splitting and spilling.
    #[error("out of registers: {interval} needs a register at {first_use}, candidates {candidates}")]
    OutOfRegisters {
        /// Description of the interval that could not be allocated.
        interval: String,
        /// Position of the unsatisfiable use.
        first_use: u32,
        /// The candidate registers that were considered.
        candidates: String,
    },

    /// The global liveness fixpoint failed to stabilize within the
    /// iteration cap. This indicates a malformed control flow graph.
    #[error("liveness did not stabilize after {iterations} iterations")]
    FixpointDiverged {
        /// Number of iterations performed before giving up.
        iterations: u32,
    },

    /// Operands were live into the entry block, meaning they are used
    /// before any definition.
    #[error("operands live at function entry (used before defined): {operands}")]
    UseBeforeDef {
        /// Description of the offending operands.
        operands: String,
    },

    /// An internal consistency check failed.
    #[error("verifier: {0}")]
    Verifier(#[from] VerifierError),
}

/// A broken allocator invariant, with enough context to be actionable.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VerifierError {
    /// Two intersecting intervals were assigned the same register.
    #[error("intervals {a} and {b} intersect at {pos} but share {location}")]
    RegisterOverlap {
        /// First interval.
        a: String,
        /// Second interval.
        b: String,
        /// First intersecting position.
        pos: u32,
        /// The shared location.
        location: String,
    },

    /// The split children of a parent interval do not tile its range.
    #[error("split children of {parent} do not tile the parent range: {detail}")]
    BrokenPartition {
        /// The split parent.
        parent: String,
        /// What went wrong.
        detail: String,
    },

    /// A split child lookup found no covering child.
    #[error("{parent} has no split child covering position {pos}")]
    NoCoveringChild {
        /// The split parent that was searched.
        parent: String,
        /// The uncovered position.
        pos: u32,
    },

    /// A split child lookup found more than one covering child.
    #[error("{parent} has two split children covering position {pos}: {a} and {b}")]
    AmbiguousChild {
        /// The split parent that was searched.
        parent: String,
        /// The uncovered position.
        pos: u32,
        /// First covering child.
        a: String,
        /// Second covering child.
        b: String,
    },
}

/// A convenient alias for a `Result` using `AllocError`.
pub type AllocResult<T> = Result<T, AllocError>;
