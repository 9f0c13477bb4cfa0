//! Control flow graph: predecessor and successor lists per block.

use crate::ir::{Block, Function};
use cranelift_entity::SecondaryMap;

/// Predecessor and successor sets for every block in a function.
pub struct ControlFlowGraph {
    preds: SecondaryMap<Block, Vec<Block>>,
    succs: SecondaryMap<Block, Vec<Block>>,
    valid: bool,
}

impl ControlFlowGraph {
    /// Allocate a new blank control flow graph.
    pub fn new() -> Self {
        Self {
            preds: SecondaryMap::new(),
            succs: SecondaryMap::new(),
            valid: false,
        }
    }

    /// Allocate and compute the control flow graph for `func`.
    pub fn with_function(func: &Function) -> Self {
        let mut cfg = Self::new();
        cfg.compute(func);
        cfg
    }

    /// Compute the control flow graph of `func`.
    pub fn compute(&mut self, func: &Function) {
        self.clear();
        for &block in &func.layout {
            for &succ in func.successors(block) {
                self.succs[block].push(succ);
                self.preds[succ].push(block);
            }
        }
        self.valid = true;
    }

    /// Clear all data structures in this control flow graph.
    pub fn clear(&mut self) {
        self.preds.clear();
        self.succs.clear();
        self.valid = false;
    }

    /// The predecessors of `block`. A block branching to `block` twice
    /// appears twice.
    pub fn preds(&self, block: Block) -> &[Block] {
        &self.preds[block]
    }

    /// The successors of `block`, in branch order.
    pub fn succs(&self, block: Block) -> &[Block] {
        &self.succs[block]
    }

    /// Number of predecessor edges into `block`.
    pub fn num_preds(&self, block: Block) -> usize {
        self.preds[block].len()
    }

    /// Number of successor edges out of `block`.
    pub fn num_succs(&self, block: Block) -> usize {
        self.succs[block].len()
    }

    /// Check if the control flow graph has been computed.
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl Default for ControlFlowGraph {
    fn default() -> Self {
        Self::new()
    }
}
