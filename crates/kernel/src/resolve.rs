//! Elastic impulse resolution over the candidate lists.
//!
//! Every unordered pair `(i, j)`, `i < j`, that both lists name is resolved
//! exactly once, in two passes:
//!
//! 1. The owner `i` computes the pair impulse and stores it in its own slot
//!    for `j`. Nothing but the impulse buffer is written.
//! 2. Every particle sums the impulses of the pairs it belongs to (its own
//!    slots, plus the owner's slot for pairs where it is the larger index)
//!    and updates its own velocity.
//!
//! No invocation ever writes another particle's state.

use rayon::prelude::*;

use crate::detect::{CandidateLists, NO_CANDIDATE};
use crate::particle::{Particle, PropertiesTable};

/// Impulse applied to `b` when `a` and `b` collide; `a` receives the
/// negation. Returns `None` when the circles do not overlap, the centres
/// coincide or the particles are already separating.
#[inline]
pub fn pair_impulse(a: &Particle, b: &Particle, properties: &PropertiesTable) -> Option<[f32; 2]> {
    let pa = properties.get(a.type_index);
    let pb = properties.get(b.type_index);

    let dx = b.x() - a.x();
    let dy = b.y() - a.y();
    let dist_sq = dx * dx + dy * dy;
    let reach = pa.radius + pb.radius;
    if dist_sq == 0.0 || dist_sq >= reach * reach {
        return None;
    }
    let dist = dist_sq.sqrt();
    let normal = [dx / dist, dy / dist];

    let v_rel = (b.velocity[0] - a.velocity[0]) * normal[0]
        + (b.velocity[1] - a.velocity[1]) * normal[1];
    if v_rel >= 0.0 {
        return None;
    }

    // Zero mass is an unassigned type upstream; let it blow up.
    let inv_a = 1.0 / pa.mass;
    let inv_b = 1.0 / pb.mass;
    debug_assert!(
        inv_a.is_finite() && inv_b.is_finite(),
        "collision involves a particle type with zero mass"
    );
    let j = -2.0 * v_rel / (inv_a + inv_b);
    Some([j * normal[0], j * normal[1]])
}

/// Owns the per-slot impulse buffer.
#[derive(Debug, Clone)]
pub struct CollisionResolver {
    impulses: Vec<[f32; 2]>,
}

impl CollisionResolver {
    /// Buffer matching `lists`.
    pub fn new(lists: &CandidateLists) -> Self {
        Self {
            impulses: vec![[0.0; 2]; lists.len() * lists.capacity()],
        }
    }

    /// Resolve the first `active` particles in place and record each
    /// particle's found-candidate count.
    pub fn resolve(
        &mut self,
        particles: &mut [Particle],
        properties: &PropertiesTable,
        lists: &CandidateLists,
        active: usize,
    ) {
        let capacity = lists.capacity();
        let impulses = &mut self.impulses[..active * capacity];

        // Pass 1: owners compute.
        let snapshot: &[Particle] = &*particles;
        impulses
            .par_chunks_mut(capacity)
            .enumerate()
            .for_each(|(i, out)| {
                for (slot, &j) in out.iter_mut().zip(lists.slots(i)) {
                    *slot = [0.0; 2];
                    if j == NO_CANDIDATE || j as usize <= i || !lists.contains(j as usize, i as u32) {
                        continue;
                    }
                    if let Some(imp) = pair_impulse(&snapshot[i], &snapshot[j as usize], properties) {
                        *slot = imp;
                    }
                }
            });

        // Pass 2: members apply to themselves.
        let impulses = &self.impulses[..active * capacity];
        particles[..active]
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, p)| {
                let inv_mass = 1.0 / properties.get(p.type_index).mass;
                let mut dv = [0.0f32; 2];
                for (k, &j) in lists.candidates(i).iter().enumerate() {
                    let j = j as usize;
                    let imp = if j > i {
                        let imp = impulses[i * capacity + k];
                        [-imp[0], -imp[1]]
                    } else {
                        match lists.position(j, i as u32) {
                            Some(kk) => impulses[j * capacity + kk],
                            None => continue,
                        }
                    };
                    dv[0] += imp[0] * inv_mass;
                    dv[1] += imp[1] * inv_mass;
                }
                p.velocity[0] += dv[0];
                p.velocity[1] += dv[1];
                p.nearby_count = lists.found_count(i);
            });
    }
}
