//! Bounding volume hierarchy storage.
//!
//! The tree over `N` sorted particles is a flat array of `2N - 1` nodes:
//! leaves occupy `[0, N)` (leaf `i` holds the `i`-th particle in key order),
//! internal nodes occupy `[N, 2N - 1)` and the root is the first internal
//! node, global index `N`. With a single particle the lone leaf is the root.

use serde::{Deserialize, Serialize};

use crate::error::TreeError;

/// Sentinel for "no parent" / "no child".
pub const NO_NODE: u32 = u32::MAX;

/// Axis-aligned box. `y` grows upward, so `top >= bottom`.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, bytemuck::Pod, bytemuck::Zeroable,
)]
pub struct Aabb {
    /// Minimum x.
    pub left: f32,
    /// Maximum x.
    pub right: f32,
    /// Maximum y.
    pub top: f32,
    /// Minimum y.
    pub bottom: f32,
}

impl Aabb {
    /// Box enclosing a circle.
    #[inline]
    pub fn around_circle(x: f32, y: f32, radius: f32) -> Self {
        Self {
            left: x - radius,
            right: x + radius,
            top: y + radius,
            bottom: y - radius,
        }
    }

    /// Smallest box containing both.
    #[inline]
    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            left: self.left.min(other.left),
            right: self.right.max(other.right),
            top: self.top.max(other.top),
            bottom: self.bottom.min(other.bottom),
        }
    }

    /// Closed-interval overlap test; touching boxes overlap.
    #[inline]
    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.left <= other.right
            && other.left <= self.right
            && self.bottom <= other.top
            && other.bottom <= self.top
    }

    /// `true` when `other` lies entirely inside `self`.
    pub fn contains(&self, other: &Aabb) -> bool {
        self.left <= other.left
            && self.right >= other.right
            && self.top >= other.top
            && self.bottom <= other.bottom
    }
}

/// One node of the tree. Layout matches the `BvhNode` struct in the shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BvhNode {
    /// Bounding box, final after the merge stage.
    pub aabb: Aabb,
    /// `1` for leaves.
    pub is_leaf: u32,
    /// Parent node, [`NO_NODE`] for the root.
    pub parent: u32,
    /// Left child, [`NO_NODE`] for leaves.
    pub left_child: u32,
    /// Right child, [`NO_NODE`] for leaves.
    pub right_child: u32,
    /// Particle slot for leaves, [`NO_NODE`] for internal nodes.
    pub particle: u32,
    /// Pads the record to 48 bytes.
    pub _pad: [u32; 3],
}

impl Default for BvhNode {
    fn default() -> Self {
        Self {
            aabb: Aabb::default(),
            is_leaf: 0,
            parent: NO_NODE,
            left_child: NO_NODE,
            right_child: NO_NODE,
            particle: NO_NODE,
            _pad: [0; 3],
        }
    }
}

impl BvhNode {
    /// A leaf for `particle` with no parent assigned yet.
    pub fn leaf(particle: u32) -> Self {
        Self {
            is_leaf: 1,
            particle,
            ..Self::default()
        }
    }

    /// `true` for leaves.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.is_leaf != 0
    }
}

/// Global index of the root for a tree over `leaf_count` leaves.
#[inline]
pub fn root_index(leaf_count: usize) -> Option<u32> {
    match leaf_count {
        0 => None,
        1 => Some(0),
        n => Some(n as u32),
    }
}

/// Leaf indices in left-to-right order, walking from the root.
///
/// The walk visits at most `nodes.len()` nodes so a cyclic (corrupt) tree
/// terminates.
pub fn in_order_leaves(nodes: &[BvhNode], leaf_count: usize) -> Vec<u32> {
    let mut leaves = Vec::with_capacity(leaf_count);
    let Some(root) = root_index(leaf_count) else {
        return leaves;
    };
    let mut stack = vec![root];
    let mut visited = 0usize;
    while let Some(index) = stack.pop() {
        visited += 1;
        if visited > nodes.len() {
            break;
        }
        let Some(node) = nodes.get(index as usize) else {
            continue;
        };
        if node.is_leaf() {
            leaves.push(index);
        } else {
            stack.push(node.right_child);
            stack.push(node.left_child);
        }
    }
    leaves
}

/// Check the structural invariants of a tree over `leaf_count` leaves:
/// node count, leaf flags, child ranges, parent/child reciprocity and the
/// in-order leaf sequence.
pub fn validate_nodes(nodes: &[BvhNode], leaf_count: usize) -> Result<(), TreeError> {
    let expected = (2 * leaf_count).saturating_sub(1);
    if nodes.len() != expected {
        return Err(TreeError::NodeCount {
            expected,
            found: nodes.len(),
        });
    }
    let Some(root) = root_index(leaf_count) else {
        return Ok(());
    };

    for (i, node) in nodes.iter().enumerate() {
        let index = i as u32;
        let should_be_leaf = i < leaf_count;
        if node.is_leaf() != should_be_leaf {
            return Err(TreeError::BadLink { node: index });
        }
        if !should_be_leaf {
            for child in [node.left_child, node.right_child] {
                if child as usize >= nodes.len() || child == index {
                    return Err(TreeError::BadLink { node: index });
                }
            }
        }

        if index == root {
            if node.parent != NO_NODE {
                return Err(TreeError::BadLink { node: index });
            }
            continue;
        }
        if node.parent == NO_NODE {
            return Err(TreeError::Orphan { node: index });
        }
        let parent = nodes
            .get(node.parent as usize)
            .filter(|p| !p.is_leaf())
            .ok_or(TreeError::NotReciprocal {
                node: index,
                parent: node.parent,
            })?;
        if parent.left_child != index && parent.right_child != index {
            return Err(TreeError::NotReciprocal {
                node: index,
                parent: node.parent,
            });
        }
    }

    let leaves = in_order_leaves(nodes, leaf_count);
    let first_mismatch = leaves
        .iter()
        .enumerate()
        .position(|(i, &leaf)| leaf != i as u32);
    if leaves.len() != leaf_count || first_mismatch.is_some() {
        let cut = first_mismatch.map_or(leaves.len(), |p| p + 1);
        return Err(TreeError::LeafOrder {
            expected: leaf_count,
            found: leaves[..cut].to_vec(),
        });
    }
    Ok(())
}

/// Node storage sized for the largest population, plus the number of leaves
/// in the current tree.
#[derive(Debug, Clone)]
pub struct Bvh {
    nodes: Vec<BvhNode>,
    leaf_count: usize,
}

impl Bvh {
    /// Allocate `2 * capacity - 1` nodes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: vec![BvhNode::default(); (2 * capacity).saturating_sub(1)],
            leaf_count: 0,
        }
    }

    /// Leaves in the current tree.
    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Root of the current tree.
    pub fn root_index(&self) -> Option<u32> {
        root_index(self.leaf_count)
    }

    /// The `2N - 1` nodes of the current tree.
    pub fn nodes(&self) -> &[BvhNode] {
        &self.nodes[..(2 * self.leaf_count).saturating_sub(1)]
    }

    /// Resize the current tree to `leaf_count` leaves and return its nodes
    /// for the builder to fill.
    ///
    /// # Panics
    /// If `leaf_count` exceeds the capacity given at construction.
    pub fn reset(&mut self, leaf_count: usize) -> &mut [BvhNode] {
        let used = (2 * leaf_count).saturating_sub(1);
        assert!(used <= self.nodes.len(), "tree larger than its storage");
        self.leaf_count = leaf_count;
        &mut self.nodes[..used]
    }

    /// Mutable view of the current tree's nodes.
    pub fn nodes_mut(&mut self) -> &mut [BvhNode] {
        let used = (2 * self.leaf_count).saturating_sub(1);
        &mut self.nodes[..used]
    }

    /// Leaf indices reached by an in-order walk from the root.
    pub fn in_order_leaves(&self) -> Vec<u32> {
        in_order_leaves(self.nodes(), self.leaf_count)
    }

    /// See [`validate_nodes`].
    pub fn validate(&self) -> Result<(), TreeError> {
        validate_nodes(self.nodes(), self.leaf_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Leaves 0..3, internal 3 (root) -> (0, 4), 4 -> (1, 2).
    fn three_leaf_tree() -> Vec<BvhNode> {
        let mut nodes = vec![BvhNode::leaf(0), BvhNode::leaf(1), BvhNode::leaf(2)];
        nodes.push(BvhNode {
            left_child: 0,
            right_child: 4,
            ..BvhNode::default()
        });
        nodes.push(BvhNode {
            parent: 3,
            left_child: 1,
            right_child: 2,
            ..BvhNode::default()
        });
        nodes[0].parent = 3;
        nodes[1].parent = 4;
        nodes[2].parent = 4;
        nodes
    }

    #[test]
    fn node_layout_matches_shader() {
        assert_eq!(std::mem::size_of::<Aabb>(), 16);
        assert_eq!(std::mem::size_of::<BvhNode>(), 48);
    }

    #[test]
    fn aabb_union_and_overlap() {
        let a = Aabb::around_circle(0.0, 0.0, 1.0);
        let b = Aabb::around_circle(1.5, 0.0, 0.5);
        let c = Aabb::around_circle(5.0, 5.0, 0.5);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        let u = a.union(&c);
        assert_eq!(u, Aabb { left: -1.0, right: 5.5, top: 5.5, bottom: -1.0 });
        assert!(u.contains(&a) && u.contains(&c));
    }

    #[test]
    fn root_index_rules() {
        assert_eq!(root_index(0), None);
        assert_eq!(root_index(1), Some(0));
        assert_eq!(root_index(5), Some(5));
    }

    #[test]
    fn valid_tree_passes() {
        let nodes = three_leaf_tree();
        assert_eq!(validate_nodes(&nodes, 3), Ok(()));
        assert_eq!(in_order_leaves(&nodes, 3), vec![0, 1, 2]);
    }

    #[test]
    fn single_leaf_is_root() {
        assert_eq!(validate_nodes(&[BvhNode::leaf(0)], 1), Ok(()));
        assert_eq!(validate_nodes(&[], 0), Ok(()));
    }

    #[test]
    fn detects_broken_reciprocity() {
        let mut nodes = three_leaf_tree();
        nodes[1].parent = 3;
        assert_eq!(
            validate_nodes(&nodes, 3),
            Err(TreeError::NotReciprocal { node: 1, parent: 3 })
        );
    }

    #[test]
    fn detects_orphan_and_count() {
        let mut nodes = three_leaf_tree();
        nodes[2].parent = NO_NODE;
        assert_eq!(validate_nodes(&nodes, 3), Err(TreeError::Orphan { node: 2 }));
        assert!(matches!(
            validate_nodes(&nodes[..4], 3),
            Err(TreeError::NodeCount { expected: 5, found: 4 })
        ));
    }

    #[test]
    fn detects_swapped_leaves() {
        let mut nodes = three_leaf_tree();
        nodes[4].left_child = 2;
        nodes[4].right_child = 1;
        assert!(matches!(
            validate_nodes(&nodes, 3),
            Err(TreeError::LeafOrder { expected: 3, .. })
        ));
    }

    #[test]
    fn storage_reset() {
        let mut bvh = Bvh::with_capacity(4);
        assert_eq!(bvh.reset(3).len(), 5);
        assert_eq!(bvh.leaf_count(), 3);
        assert_eq!(bvh.root_index(), Some(3));
        assert!(bvh.reset(0).is_empty());
        assert_eq!(bvh.root_index(), None);
    }
}
