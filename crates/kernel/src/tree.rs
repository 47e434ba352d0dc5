//! Parallel binary radix tree construction (Karras 2012).
//!
//! One invocation per internal node. Each node finds the range of sorted keys
//! it covers from the common-prefix lengths with its neighbours, then the
//! split inside that range, and links the two children. A child's parent
//! pointer is written only by the node adopting it; since every child has
//! exactly one parent no two invocations write the same slot.
//!
//! Equal keys are told apart by their position in the sorted array: the
//! position acts as 32 extra low-order key bits. The sort is stable, so this
//! is the same order as appending the original particle index to the key.

use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;

use crate::bvh::{Bvh, BvhNode, NO_NODE};
use crate::morton::SortKey;

/// Length of the common prefix of the (key, position) pairs at `i` and `j`,
/// or `-1` when `j` is outside `[0, n)`.
#[inline]
pub fn common_prefix_len(keys: &[SortKey], i: i64, j: i64) -> i32 {
    if j < 0 || j >= keys.len() as i64 {
        return -1;
    }
    let a = keys[i as usize].key;
    let b = keys[j as usize].key;
    if a == b {
        32 + ((i as u32) ^ (j as u32)).leading_zeros() as i32
    } else {
        (a ^ b).leading_zeros() as i32
    }
}

/// Children `(left, right)` of internal node `i`, as global node indices.
pub fn internal_children(keys: &[SortKey], i: usize) -> (u32, u32) {
    let n = keys.len();
    let i = i as i64;
    let delta = |j: i64| common_prefix_len(keys, i, j);

    let d: i64 = if delta(i + 1) - delta(i - 1) > 0 { 1 } else { -1 };

    // Upper bound for the range length, then binary search for the end.
    let delta_min = delta(i - d);
    let mut l_max: i64 = 2;
    while delta(i + l_max * d) > delta_min {
        l_max *= 2;
    }
    let mut l: i64 = 0;
    let mut t = l_max / 2;
    while t >= 1 {
        if delta(i + (l + t) * d) > delta_min {
            l += t;
        }
        t /= 2;
    }
    let j = i + l * d;

    // Split position.
    let delta_node = delta(j);
    let mut s: i64 = 0;
    let mut t = l;
    loop {
        t = (t + 1) / 2;
        if delta(i + (s + t) * d) > delta_node {
            s += t;
        }
        if t <= 1 {
            break;
        }
    }
    let gamma = i + s * d + d.min(0);

    let first = i.min(j);
    let last = i.max(j);
    let left = if first == gamma {
        gamma as u32
    } else {
        (n as i64 + gamma) as u32
    };
    let right = if last == gamma + 1 {
        (gamma + 1) as u32
    } else {
        (n as i64 + gamma + 1) as u32
    };
    (left, right)
}

/// Builds the tree skeleton (links only; boxes come from the merger).
#[derive(Debug)]
pub struct BinaryRadixTreeBuilder {
    parents: Vec<AtomicU32>,
}

impl BinaryRadixTreeBuilder {
    /// Scratch for trees of up to `capacity` leaves.
    pub fn new(capacity: usize) -> Self {
        Self {
            parents: (0..(2 * capacity).saturating_sub(1))
                .map(|_| AtomicU32::new(NO_NODE))
                .collect(),
        }
    }

    /// Build over `keys`, which must be sorted. Leaf `i` refers to particle
    /// slot `i` of the reordered particle array.
    pub fn build(&self, keys: &[SortKey], bvh: &mut Bvh) {
        let n = keys.len();
        let nodes = bvh.reset(n);
        let parents = &self.parents[..nodes.len()];

        nodes
            .par_iter_mut()
            .zip(parents.par_iter())
            .enumerate()
            .for_each(|(index, (node, parent))| {
                *node = if index < n {
                    BvhNode::leaf(index as u32)
                } else {
                    BvhNode::default()
                };
                parent.store(NO_NODE, Ordering::Relaxed);
            });

        if n < 2 {
            return;
        }

        nodes[n..]
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, node)| {
                let (left, right) = internal_children(keys, i);
                let me = (n + i) as u32;
                node.left_child = left;
                node.right_child = right;
                parents[left as usize].store(me, Ordering::Relaxed);
                parents[right as usize].store(me, Ordering::Relaxed);
            });

        nodes
            .par_iter_mut()
            .zip(parents.par_iter())
            .for_each(|(node, parent)| node.parent = parent.load(Ordering::Relaxed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn keys_of(raw: &[u32]) -> Vec<SortKey> {
        raw.iter()
            .enumerate()
            .map(|(i, &key)| SortKey { key, index: i as u32 })
            .collect()
    }

    fn build(raw: &[u32]) -> Bvh {
        let keys = keys_of(raw);
        let mut bvh = Bvh::with_capacity(raw.len().max(1));
        BinaryRadixTreeBuilder::new(raw.len()).build(&keys, &mut bvh);
        bvh
    }

    #[test]
    fn prefix_length_with_tie_break() {
        let keys = keys_of(&[0b0001, 0b0011, 0b0011]);
        assert_eq!(common_prefix_len(&keys, 0, 1), 30);
        // Equal keys: 32 + clz(1 ^ 2).
        assert_eq!(common_prefix_len(&keys, 1, 2), 32 + 30);
        assert_eq!(common_prefix_len(&keys, 0, -1), -1);
        assert_eq!(common_prefix_len(&keys, 2, 3), -1);
    }

    #[test]
    fn karras_paper_example() {
        // The 8-key example from the paper.
        let bvh = build(&[0b00001, 0b00010, 0b00100, 0b00101, 0b10011, 0b11000, 0b11001, 0b11110]);
        assert_eq!(bvh.validate(), Ok(()));
        let nodes = bvh.nodes();
        let n = 8;
        // Root splits between keys 3 and 4.
        assert_eq!(nodes[n].left_child, n as u32 + 3);
        assert_eq!(nodes[n].right_child, n as u32 + 4);
        // Internal node 1 covers [0, 3] and splits after key 1.
        assert_eq!(nodes[n + 3].left_child, n as u32 + 1);
        assert_eq!(nodes[n + 3].right_child, n as u32 + 2);
        assert_eq!(nodes[n + 1].left_child, 0);
        assert_eq!(nodes[n + 1].right_child, 1);
    }

    #[test]
    fn two_leaves() {
        let bvh = build(&[3, 9]);
        assert_eq!(bvh.validate(), Ok(()));
        let root = bvh.nodes()[2];
        assert_eq!((root.left_child, root.right_child), (0, 1));
        assert_eq!(root.parent, NO_NODE);
    }

    #[test]
    fn single_and_empty() {
        let bvh = build(&[42]);
        assert_eq!(bvh.nodes().len(), 1);
        assert_eq!(bvh.root_index(), Some(0));
        assert_eq!(bvh.validate(), Ok(()));

        let bvh = build(&[]);
        assert!(bvh.nodes().is_empty());
        assert_eq!(bvh.validate(), Ok(()));
    }

    #[test]
    fn all_keys_equal() {
        let bvh = build(&[7; 37]);
        assert_eq!(bvh.validate(), Ok(()));
        assert_eq!(bvh.in_order_leaves(), (0..37).collect::<Vec<u32>>());
    }

    #[test]
    fn rebuild_smaller_tree_in_same_storage() {
        let keys = keys_of(&[1, 2, 3, 4, 5, 6]);
        let builder = BinaryRadixTreeBuilder::new(6);
        let mut bvh = Bvh::with_capacity(6);
        builder.build(&keys, &mut bvh);
        assert_eq!(bvh.validate(), Ok(()));
        builder.build(&keys[..3], &mut bvh);
        assert_eq!(bvh.nodes().len(), 5);
        assert_eq!(bvh.validate(), Ok(()));
    }

    proptest! {
        #[test]
        fn sorted_keys_give_valid_tree(mut raw in proptest::collection::vec(0u32..64, 1..300)) {
            raw.sort();
            let bvh = build(&raw);
            prop_assert_eq!(bvh.nodes().len(), 2 * raw.len() - 1);
            prop_assert_eq!(bvh.nodes().iter().filter(|n| n.is_leaf()).count(), raw.len());
            prop_assert_eq!(bvh.validate(), Ok(()));
        }
    }
}
