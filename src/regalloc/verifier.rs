//! Post-allocation consistency checks.
//!
//! Run in debug builds after the walk, before the allocation is acted
//! on. Two properties are checked: no two intervals occupying the same
//! register overlap in time, and the split children of every family tile
//! the timeline without overlapping each other.

use crate::regalloc::context::LinearScan;
use crate::regalloc::interval::{intersects_at, IntervalId};
use crate::result::{AllocResult, VerifierError};

pub(super) fn verify(ls: &LinearScan) -> AllocResult<()> {
    check_register_overlaps(ls)?;
    check_split_partitions(ls)?;
    Ok(())
}

fn check_register_overlaps(ls: &LinearScan) -> AllocResult<()> {
    let in_regs: Vec<IntervalId> = ls
        .intervals
        .keys()
        .filter(|&id| ls.intervals[id].location.is_reg() && ls.intervals[id].num_ranges() > 0)
        .collect();

    for (i, &a) in in_regs.iter().enumerate() {
        for &b in &in_regs[i + 1..] {
            if ls.intervals[a].location != ls.intervals[b].location {
                continue;
            }
            if let Some(pos) = intersects_at(&ls.intervals[a], 0, &ls.intervals[b], 0) {
                return Err(VerifierError::RegisterOverlap {
                    a: ls.intervals.describe(a),
                    b: ls.intervals.describe(b),
                    pos,
                    location: ls.intervals[a].location.to_string(),
                }
                .into());
            }
        }
    }
    Ok(())
}

/// The children of a split family must cover disjoint parts of the
/// timeline; lookups by position rely on that.
fn check_split_partitions(ls: &LinearScan) -> AllocResult<()> {
    for parent in ls.intervals.keys() {
        if !ls.intervals.is_split_parent(parent) {
            continue;
        }
        let children = ls.intervals.split_children(parent);
        if children.is_empty() {
            continue;
        }
        // The children list already includes the parent's own piece.
        let mut family: Vec<IntervalId> = children.to_vec();
        family.retain(|&id| ls.intervals[id].num_ranges() > 0);
        family.sort_by_key(|&id| ls.intervals[id].from());

        for (i, &cur) in family.iter().enumerate() {
            if let Some(&next) = family.get(i + 1) {
                if ls.intervals[cur].to() > ls.intervals[next].from() {
                    return Err(VerifierError::BrokenPartition {
                        parent: ls.intervals.describe(parent),
                        detail: format!(
                            "{} ends at {} after {} starts at {}",
                            ls.intervals.describe(cur),
                            ls.intervals[cur].to(),
                            ls.intervals.describe(next),
                            ls.intervals[next].from()
                        ),
                    }
                    .into());
                }
            }
            for &other in &family[i + 1..] {
                if let Some(pos) =
                    intersects_at(&ls.intervals[cur], 0, &ls.intervals[other], 0)
                {
                    return Err(VerifierError::BrokenPartition {
                        parent: ls.intervals.describe(parent),
                        detail: format!(
                            "{} and {} overlap at {}",
                            ls.intervals.describe(cur),
                            ls.intervals.describe(other),
                            pos
                        ),
                    }
                    .into());
                }
            }
        }
    }
    Ok(())
}
