//! Broad-phase candidate search.
//!
//! One invocation per leaf walks the tree from the root with a fixed-size
//! stack, pruning every subtree whose box misses the leaf's own box. Leaves
//! that overlap (other than the query itself) are appended to the query's
//! candidate list until it is full; further hits are only counted.

use rayon::prelude::*;

use crate::bvh::{Bvh, NO_NODE};
use crate::error::KernelError;

/// Sentinel filling candidate slots past the stored count.
pub const NO_CANDIDATE: u32 = u32::MAX;

/// Traversal stack entries per invocation.
///
/// Tree depth is bounded by the 20 Morton bits plus the bits needed to tell
/// equal keys apart by position (at most 18 for the largest population).
pub const TRAVERSAL_STACK_DEPTH: usize = 64;

/// Summary over all lists, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateStats {
    /// Candidates actually stored.
    pub stored: u64,
    /// Candidates found, including the ones dropped for lack of space.
    pub found: u64,
    /// Lists that overflowed.
    pub saturated: u32,
}

/// Fixed-capacity candidate list per particle slot.
#[derive(Debug, Clone)]
pub struct CandidateLists {
    slots: Vec<u32>,
    found: Vec<u32>,
    capacity: usize,
}

impl CandidateLists {
    /// Lists for `particles` slots with `capacity` entries each.
    pub fn new(particles: usize, capacity: usize) -> Result<Self, KernelError> {
        if capacity == 0 {
            return Err(KernelError::InvalidCandidateCapacity);
        }
        Ok(Self {
            slots: vec![NO_CANDIDATE; particles * capacity],
            found: vec![0; particles],
            capacity,
        })
    }

    /// Entries per list.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of lists.
    pub fn len(&self) -> usize {
        self.found.len()
    }

    /// `true` when there are no lists.
    pub fn is_empty(&self) -> bool {
        self.found.is_empty()
    }

    /// All slots of list `i`, sentinel-padded.
    #[inline]
    pub fn slots(&self, i: usize) -> &[u32] {
        &self.slots[i * self.capacity..(i + 1) * self.capacity]
    }

    /// Stored candidates of particle `i`.
    pub fn candidates(&self, i: usize) -> &[u32] {
        let stored = (self.found[i] as usize).min(self.capacity);
        &self.slots(i)[..stored]
    }

    /// Uncapped number of overlaps found for particle `i`.
    pub fn found_count(&self, i: usize) -> u32 {
        self.found[i]
    }

    /// `true` when particle `i` found more candidates than fit.
    pub fn is_saturated(&self, i: usize) -> bool {
        self.found[i] as usize > self.capacity
    }

    /// `true` when `j` is stored in the list of `i`.
    #[inline]
    pub fn contains(&self, i: usize, j: u32) -> bool {
        self.candidates(i).contains(&j)
    }

    /// Position of `j` in the list of `i`.
    #[inline]
    pub fn position(&self, i: usize, j: u32) -> Option<usize> {
        self.candidates(i).iter().position(|&c| c == j)
    }

    /// Raw slot array, `len() * capacity()` entries.
    pub fn as_slice(&self) -> &[u32] {
        &self.slots
    }

    /// Raw uncapped counts.
    pub fn found_counts(&self) -> &[u32] {
        &self.found
    }

    /// Overwrite from raw GPU readback.
    pub fn copy_from_raw(&mut self, slots: &[u32], found: &[u32]) {
        self.slots.copy_from_slice(slots);
        self.found.copy_from_slice(found);
    }

    /// Totals over the first `active` lists.
    pub fn stats(&self, active: usize) -> CandidateStats {
        self.found[..active]
            .iter()
            .fold(CandidateStats::default(), |mut s, &f| {
                s.found += f as u64;
                s.stored += (f as usize).min(self.capacity) as u64;
                s.saturated += (f as usize > self.capacity) as u32;
                s
            })
    }
}

/// Fills [`CandidateLists`] from a merged tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollisionDetector;

impl CollisionDetector {
    /// Rebuild every list. Lists past the tree's leaf count are cleared.
    pub fn detect(&self, bvh: &Bvh, lists: &mut CandidateLists) {
        let n = bvh.leaf_count();
        let nodes = bvh.nodes();
        let root = bvh.root_index();
        let capacity = lists.capacity;

        lists
            .slots
            .par_chunks_mut(capacity)
            .zip(lists.found.par_iter_mut())
            .enumerate()
            .for_each(|(query, (slots, found))| {
                slots.fill(NO_CANDIDATE);
                *found = 0;
                let Some(root) = root.filter(|_| query < n) else {
                    return;
                };
                let bounds = nodes[query].aabb;

                let mut stack = [NO_NODE; TRAVERSAL_STACK_DEPTH];
                let mut top = 0usize;
                stack[top] = root;
                top += 1;

                while top > 0 {
                    top -= 1;
                    let index = stack[top];
                    let node = &nodes[index as usize];
                    if !node.aabb.overlaps(&bounds) {
                        continue;
                    }
                    if node.is_leaf() {
                        if index as usize != query {
                            if (*found as usize) < capacity {
                                slots[*found as usize] = node.particle;
                            }
                            *found += 1;
                        }
                    } else {
                        debug_assert!(top + 2 <= TRAVERSAL_STACK_DEPTH, "traversal stack overflow");
                        if top + 2 <= TRAVERSAL_STACK_DEPTH {
                            stack[top] = node.right_child;
                            stack[top + 1] = node.left_child;
                            top += 2;
                        }
                    }
                }
            });
    }
}
