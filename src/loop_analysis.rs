//! A loop analysis represented as mappings of loops to their header block
//! and parent in the loop tree, plus the per-block facts the allocator
//! consumes: loop depth, innermost loop, and loop-end marking.

use crate::dominator_tree::DominatorTree;
use crate::flowgraph::ControlFlowGraph;
use crate::ir::{Block, Function};
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{entity_impl, Keys, PrimaryMap, SecondaryMap};

/// An opaque reference to a natural loop.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Loop(u32);
entity_impl!(Loop, "loop");

struct LoopData {
    header: Block,
    parent: PackedOption<Loop>,
    depth: u32,
}

/// Loop tree information for a single function.
pub struct LoopAnalysis {
    loops: PrimaryMap<Loop, LoopData>,
    block_loop_map: SecondaryMap<Block, PackedOption<Loop>>,
    loop_end: SecondaryMap<Block, bool>,
    valid: bool,
}

impl LoopAnalysis {
    /// Allocate a new blank loop analysis.
    pub fn new() -> Self {
        Self {
            loops: PrimaryMap::new(),
            block_loop_map: SecondaryMap::new(),
            loop_end: SecondaryMap::new(),
            valid: false,
        }
    }

    /// Allocate and compute the loop analysis for `func`.
    pub fn with_function(
        func: &Function,
        cfg: &ControlFlowGraph,
        domtree: &DominatorTree,
    ) -> Self {
        let mut loops = Self::new();
        loops.compute(func, cfg, domtree);
        loops
    }

    /// Detect the loops in `func`.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph, domtree: &DominatorTree) {
        self.clear();
        self.find_loop_headers(cfg, domtree);
        self.discover_loop_blocks(cfg, domtree);
        self.assign_loop_depths();
        self.mark_loop_ends(func, cfg, domtree);
        self.valid = true;
    }

    /// Clear all the data structures contained in the loop analysis.
    pub fn clear(&mut self) {
        self.loops.clear();
        self.block_loop_map.clear();
        self.loop_end.clear();
        self.valid = false;
    }

    /// Check if the loop analysis has been computed.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// All the loops contained in the function.
    pub fn loops(&self) -> Keys<Loop> {
        self.loops.keys()
    }

    /// The header block of a loop.
    pub fn loop_header(&self, lp: Loop) -> Block {
        self.loops[lp].header
    }

    /// The parent of a loop in the loop tree.
    pub fn loop_parent(&self, lp: Loop) -> Option<Loop> {
        self.loops[lp].parent.expand()
    }

    /// The innermost loop containing `block`, if any.
    pub fn innermost_loop(&self, block: Block) -> Option<Loop> {
        self.block_loop_map[block].expand()
    }

    /// The loop nesting depth of `block`; zero outside all loops.
    pub fn loop_depth(&self, block: Block) -> u32 {
        self.innermost_loop(block)
            .map_or(0, |lp| self.loops[lp].depth)
    }

    /// Is `block` the source of a loop back edge?
    ///
    /// Values live at the end of such a block stay live around the loop,
    /// which the interval builder models with a dedicated use priority.
    pub fn is_loop_end(&self, block: Block) -> bool {
        self.loop_end[block]
    }

    /// Returns `true` if `block` is in loop `lp` or one of its children.
    pub fn is_in_loop(&self, block: Block, lp: Loop) -> bool {
        let mut finger = self.innermost_loop(block);
        while let Some(cur) = finger {
            if cur == lp {
                return true;
            }
            finger = self.loop_parent(cur);
        }
        false
    }

    /// Relative execution frequency estimate for `block`.
    ///
    /// An explicit override on the block wins; otherwise the estimate is
    /// ten to the power of the loop depth.
    pub fn frequency(&self, func: &Function, block: Block) -> f64 {
        func.blocks[block]
            .frequency
            .unwrap_or_else(|| 10f64.powi(self.loop_depth(block) as i32))
    }

    // A block is a loop header if it dominates one of its predecessors.
    fn find_loop_headers(&mut self, cfg: &ControlFlowGraph, domtree: &DominatorTree) {
        for &block in domtree.cfg_rpo() {
            if cfg
                .preds(block)
                .iter()
                .any(|&pred| domtree.is_reachable(pred) && domtree.dominates(block, pred))
            {
                let lp = self.loops.push(LoopData {
                    header: block,
                    parent: PackedOption::default(),
                    depth: 0,
                });
                self.block_loop_map[block] = lp.into();
            }
        }
    }

    // Backward DFS from each back edge, processing headers innermost
    // first, assigning blocks to loops and loops to parent loops.
    fn discover_loop_blocks(&mut self, cfg: &ControlFlowGraph, domtree: &DominatorTree) {
        let mut stack: Vec<Block> = Vec::new();
        for lp in self.loops.keys().rev() {
            let header = self.loops[lp].header;
            stack.extend(
                cfg.preds(header)
                    .iter()
                    .copied()
                    .filter(|&pred| domtree.is_reachable(pred) && domtree.dominates(header, pred)),
            );
            while let Some(node) = stack.pop() {
                let continue_dfs: Option<Block>;
                match self.block_loop_map[node].expand() {
                    None => {
                        self.block_loop_map[node] = lp.into();
                        continue_dfs = Some(node);
                    }
                    Some(node_loop) => {
                        // Walk up the loop tree until lp or a root loop.
                        let mut cursor = node_loop;
                        let mut parent = self.loops[cursor].parent.expand();
                        while let Some(p) = parent {
                            if p == lp {
                                break;
                            }
                            cursor = p;
                            parent = self.loops[cursor].parent.expand();
                        }
                        match parent {
                            Some(_) => continue_dfs = None,
                            None => {
                                if cursor != lp {
                                    self.loops[cursor].parent = lp.into();
                                    continue_dfs = Some(self.loops[cursor].header);
                                } else {
                                    // A one-block loop; stop here.
                                    continue_dfs = None;
                                }
                            }
                        }
                    }
                }
                if let Some(node) = continue_dfs {
                    stack.extend(cfg.preds(node));
                }
            }
        }
    }

    fn assign_loop_depths(&mut self) {
        let mut stack: Vec<Loop> = Vec::new();
        for lp in self.loops.keys() {
            if self.loops[lp].depth == 0 {
                stack.push(lp);
                while let Some(&cur) = stack.last() {
                    match self.loops[cur].parent.expand() {
                        Some(parent) if self.loops[parent].depth == 0 => stack.push(parent),
                        Some(parent) => {
                            self.loops[cur].depth = self.loops[parent].depth + 1;
                            stack.pop();
                        }
                        None => {
                            self.loops[cur].depth = 1;
                            stack.pop();
                        }
                    }
                }
            }
        }
    }

    fn mark_loop_ends(&mut self, func: &Function, cfg: &ControlFlowGraph, domtree: &DominatorTree) {
        for &block in &func.layout {
            let is_end = cfg.succs(block).iter().any(|&succ| {
                domtree.is_reachable(block)
                    && domtree.dominates(succ, block)
                    && self
                        .innermost_loop(succ)
                        .is_some_and(|lp| self.loops[lp].header == succ)
            });
            self.loop_end[block] = is_end;
        }
    }
}

impl Default for LoopAnalysis {
    fn default() -> Self {
        Self::new()
    }
}
