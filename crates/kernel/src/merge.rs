//! Bottom-up bounding box propagation.
//!
//! Every leaf starts a walk towards the root. At each internal node the
//! [`VisitGate`] lets only the second of the two arriving walks through: it
//! unions the two child boxes, stores the result and carries on upward. The
//! first arrival stops, because its sibling subtree is not finished yet.
//! No global barrier is needed between tree levels.

use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;

use crate::bvh::{Aabb, Bvh, BvhNode, NO_NODE};
use crate::particle::{Particle, PropertiesTable};

/// Per-internal-node arrival counters.
#[derive(Debug)]
pub struct VisitGate {
    visits: Vec<AtomicU32>,
}

impl VisitGate {
    /// Counters for up to `nodes` internal nodes.
    pub fn new(nodes: usize) -> Self {
        Self {
            visits: (0..nodes).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Zero the first `nodes` counters.
    pub fn reset(&self, nodes: usize) {
        self.visits[..nodes]
            .par_iter()
            .for_each(|v| v.store(0, Ordering::Relaxed));
    }

    /// Record an arrival at internal node `node`. Returns `true` for exactly
    /// one caller: the second to arrive.
    ///
    /// The `AcqRel` increment makes the first arrival's box visible to the
    /// second.
    #[inline]
    pub fn claim_second_arrival(&self, node: usize) -> bool {
        self.visits[node].fetch_add(1, Ordering::AcqRel) == 1
    }
}

/// Box stored as four `f32` bit patterns.
#[derive(Debug, Default)]
struct AtomicAabb([AtomicU32; 4]);

impl AtomicAabb {
    fn store(&self, b: Aabb) {
        for (slot, v) in self.0.iter().zip([b.left, b.right, b.top, b.bottom]) {
            slot.store(v.to_bits(), Ordering::Relaxed);
        }
    }

    fn load(&self) -> Aabb {
        let [l, r, t, b] = [0, 1, 2, 3].map(|k| f32::from_bits(self.0[k].load(Ordering::Relaxed)));
        Aabb {
            left: l,
            right: r,
            top: t,
            bottom: b,
        }
    }
}

/// Fills in every node's box after the tree builder has linked the nodes.
#[derive(Debug)]
pub struct BoundingVolumeMerger {
    gate: VisitGate,
    boxes: Vec<AtomicAabb>,
}

impl BoundingVolumeMerger {
    /// Scratch for trees of up to `capacity` leaves.
    pub fn new(capacity: usize) -> Self {
        let nodes = (2 * capacity).saturating_sub(1);
        Self {
            gate: VisitGate::new(capacity.saturating_sub(1)),
            boxes: (0..nodes).map(|_| AtomicAabb::default()).collect(),
        }
    }

    /// Compute leaf boxes from `particles` (position ± radius) and merge them
    /// up to the root. Leaf `i` reads `particles[i]`.
    pub fn merge(&self, particles: &[Particle], properties: &PropertiesTable, bvh: &mut Bvh) {
        let n = bvh.leaf_count();
        if n == 0 {
            return;
        }
        let gate = &self.gate;
        let boxes = &self.boxes;
        gate.reset(n - 1);

        let links: &[BvhNode] = bvh.nodes();
        (0..n).into_par_iter().for_each(|leaf| {
            let p = &particles[links[leaf].particle as usize];
            let radius = properties.get(p.type_index).radius;
            boxes[leaf].store(Aabb::around_circle(p.x(), p.y(), radius));

            let mut node = links[leaf].parent;
            while node != NO_NODE {
                if !gate.claim_second_arrival(node as usize - n) {
                    break;
                }
                let current = &links[node as usize];
                let merged = boxes[current.left_child as usize]
                    .load()
                    .union(&boxes[current.right_child as usize].load());
                boxes[node as usize].store(merged);
                node = current.parent;
            }
        });

        bvh.nodes_mut()
            .par_iter_mut()
            .zip(boxes.par_iter())
            .for_each(|(node, b)| node.aabb = b.load());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morton::SortKey;
    use crate::particle::ParticleProperties;
    use crate::tree::BinaryRadixTreeBuilder;

    fn subtree_union(nodes: &[BvhNode], index: u32) -> Aabb {
        let node = &nodes[index as usize];
        if node.is_leaf() {
            node.aabb
        } else {
            subtree_union(nodes, node.left_child).union(&subtree_union(nodes, node.right_child))
        }
    }

    fn build_and_merge(positions: &[(f32, f32)], radius: f32) -> Bvh {
        let n = positions.len();
        let keys: Vec<SortKey> = (0..n as u32).map(|i| SortKey { key: i, index: i }).collect();
        let particles: Vec<Particle> = positions
            .iter()
            .map(|&(x, y)| Particle::new(x, y, 0.0, 0.0, 1))
            .collect();
        let table = PropertiesTable::new(&[ParticleProperties { mass: 1.0, radius }]);
        let mut bvh = Bvh::with_capacity(n);
        BinaryRadixTreeBuilder::new(n).build(&keys, &mut bvh);
        BoundingVolumeMerger::new(n).merge(&particles, &table, &mut bvh);
        bvh
    }

    #[test]
    fn gate_admits_second_arrival_only() {
        let gate = VisitGate::new(2);
        assert!(!gate.claim_second_arrival(1));
        assert!(gate.claim_second_arrival(1));
        assert!(!gate.claim_second_arrival(0));
        gate.reset(2);
        assert!(!gate.claim_second_arrival(1));
    }

    #[test]
    fn four_leaf_tree_known_boxes() {
        // Keys 0..4 give root 4 -> (5, 6), 5 -> (0, 1), 6 -> (2, 3).
        let bvh = build_and_merge(&[(0.0, 0.0), (1.0, 0.0), (0.0, 2.0), (3.0, -1.0)], 0.5);
        let nodes = bvh.nodes();
        assert_eq!(bvh.validate(), Ok(()));
        assert_eq!((nodes[4].left_child, nodes[4].right_child), (5, 6));

        assert_eq!(nodes[5].aabb, Aabb { left: -0.5, right: 1.5, top: 0.5, bottom: -0.5 });
        assert_eq!(nodes[6].aabb, Aabb { left: -0.5, right: 3.5, top: 2.5, bottom: -1.5 });
        assert_eq!(nodes[4].aabb, Aabb { left: -0.5, right: 3.5, top: 2.5, bottom: -1.5 });
    }

    #[test]
    fn every_node_is_union_of_its_leaves() {
        let positions: Vec<(f32, f32)> = (0..200)
            .map(|i| {
                let t = i as f32 * 0.37;
                (t.sin() * 5.0, (t * 1.3).cos() * 5.0)
            })
            .collect();
        let bvh = build_and_merge(&positions, 0.1);
        let nodes = bvh.nodes();
        for index in 0..nodes.len() as u32 {
            assert_eq!(nodes[index as usize].aabb, subtree_union(nodes, index));
        }
    }

    #[test]
    fn single_leaf_gets_its_own_box() {
        let bvh = build_and_merge(&[(2.0, -1.0)], 0.25);
        assert_eq!(bvh.nodes()[0].aabb, Aabb::around_circle(2.0, -1.0, 0.25));
    }
}
