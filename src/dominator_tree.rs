//! A dominator tree over the basic blocks of a function.

use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function};
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::SecondaryMap;

/// RPO numbers are assigned in steps of one, starting from one; zero
/// means "not reachable".
const UNREACHABLE: u32 = 0;

/// The dominator tree for a single function, computed over reverse
/// post-order with the classic iterative intersection algorithm.
pub struct DominatorTree {
    idom: SecondaryMap<Block, PackedOption<Block>>,
    rpo_number: SecondaryMap<Block, u32>,
    rpo: Vec<Block>,
    valid: bool,
}

impl DominatorTree {
    /// Allocate a new blank dominator tree.
    pub fn new() -> Self {
        Self {
            idom: SecondaryMap::new(),
            rpo_number: SecondaryMap::new(),
            rpo: Vec::new(),
            valid: false,
        }
    }

    /// Allocate and compute a dominator tree for `func`.
    pub fn with_function(func: &Function, cfg: &ControlFlowGraph) -> Self {
        let mut domtree = Self::new();
        domtree.compute(func, cfg);
        domtree
    }

    /// Compute the dominator tree of `func`.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        debug_assert!(cfg.is_valid());
        self.clear();
        self.compute_rpo(func, cfg);
        self.compute_idoms(func, cfg);
        self.valid = true;
    }

    /// Clear the data structures in this dominator tree.
    pub fn clear(&mut self) {
        self.idom.clear();
        self.rpo_number.clear();
        self.rpo.clear();
        self.valid = false;
    }

    /// Check if the dominator tree has been computed.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Is `block` reachable from the entry block?
    pub fn is_reachable(&self, block: Block) -> bool {
        self.rpo_number[block] != UNREACHABLE
    }

    /// The blocks in reverse post-order.
    pub fn cfg_rpo(&self) -> impl Iterator<Item = &Block> {
        debug_assert!(self.valid);
        self.rpo.iter()
    }

    /// The immediate dominator of `block`, or `None` for the entry block
    /// and unreachable blocks.
    pub fn idom(&self, block: Block) -> Option<Block> {
        self.idom[block].expand()
    }

    /// Does `a` dominate `b`?
    ///
    /// A block dominates itself.
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        debug_assert!(self.valid);
        let mut finger = b;
        while self.rpo_number[finger] > self.rpo_number[a] {
            match self.idom(finger) {
                Some(i) => finger = i,
                None => return false,
            }
        }
        finger == a
    }

    /// The closest block dominating both `a` and `b`.
    pub fn common_dominator(&self, a: Block, b: Block) -> Block {
        debug_assert!(self.is_reachable(a) && self.is_reachable(b));
        let (mut a, mut b) = (a, b);
        while a != b {
            while self.rpo_number[a] > self.rpo_number[b] {
                a = self.idom(a).expect("non-entry block must have an idom");
            }
            while self.rpo_number[b] > self.rpo_number[a] {
                b = self.idom(b).expect("non-entry block must have an idom");
            }
        }
        a
    }

    fn compute_rpo(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        // Iterative post-order DFS; the second stack element kind marks
        // nodes whose successors are already pushed.
        let mut visited = SecondaryMap::<Block, bool>::new();
        let mut stack = vec![(func.entry(), false)];
        let mut postorder = Vec::with_capacity(func.layout.len());
        while let Some((block, expanded)) = stack.pop() {
            if expanded {
                postorder.push(block);
                continue;
            }
            if visited[block] {
                continue;
            }
            visited[block] = true;
            stack.push((block, true));
            for &succ in cfg.succs(block) {
                if !visited[succ] {
                    stack.push((succ, false));
                }
            }
        }
        postorder.reverse();
        self.rpo = postorder;
        for (i, &block) in self.rpo.iter().enumerate() {
            self.rpo_number[block] = i as u32 + 1;
        }
    }

    fn compute_idoms(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        let entry = func.entry();
        self.idom[entry] = entry.into();
        let mut changed = true;
        while changed {
            changed = false;
            for &block in self.rpo.iter().skip(1) {
                let mut new_idom: Option<Block> = None;
                for &pred in cfg.preds(block) {
                    if self.idom[pred].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        Some(cur) => self.intersect(cur, pred),
                        None => pred,
                    });
                }
                let new_idom = new_idom.expect("reachable block without processed predecessor");
                if self.idom[block].expand() != Some(new_idom) {
                    self.idom[block] = new_idom.into();
                    changed = true;
                }
            }
        }
        // The entry has no dominator; it was only self-dominating for the
        // duration of the fixpoint.
        self.idom[entry] = PackedOption::default();
    }

    fn intersect(&self, a: Block, b: Block) -> Block {
        let (mut a, mut b) = (a, b);
        while a != b {
            while self.rpo_number[a] > self.rpo_number[b] {
                a = self.idom[a].expand().expect("missing idom");
            }
            while self.rpo_number[b] > self.rpo_number[a] {
                b = self.idom[b].expand().expect("missing idom");
            }
        }
        a
    }
}

impl Default for DominatorTree {
    fn default() -> Self {
        Self::new()
    }
}
