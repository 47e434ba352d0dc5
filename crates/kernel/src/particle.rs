//! Particle records, the double-buffered particle store and the per-type
//! properties table.
//!
//! Every record here is `bytemuck::Pod` so the exact same bytes can be
//! uploaded to GPU storage buffers; the field order and padding must match
//! the `Particle` / `ParticleProperties` structs in the WGSL shaders.

use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// A single circular particle.
///
/// Position is stored in a 4-float record: `x`, `y`, a depth value used only
/// for draw ordering, and padding.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Particle {
    /// `[x, y, depth, _]` in world units.
    pub position: [f32; 4],
    /// `[vx, vy]` in world units per second.
    pub velocity: [f32; 2],
    /// Index into the [`PropertiesTable`]. `0` is the "no type" entry.
    pub type_index: u32,
    /// Non-zero when the particle takes part in the simulation.
    pub active: u32,
    /// Number of candidate collisions found for this particle in the last step.
    pub nearby_count: u32,
    /// Pads the record to a 16-byte multiple.
    pub _pad: [u32; 3],
}

impl Particle {
    /// Create an active particle at `(x, y)` with velocity `(vx, vy)`.
    pub fn new(x: f32, y: f32, vx: f32, vy: f32, type_index: u32) -> Self {
        Self {
            position: [x, y, 0.0, 0.0],
            velocity: [vx, vy],
            type_index,
            active: 1,
            nearby_count: 0,
            _pad: [0; 3],
        }
    }

    /// An inactive, untyped slot.
    pub fn inactive() -> Self {
        Self::default()
    }

    /// `true` when the active flag is set.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active != 0
    }

    /// World-space x.
    #[inline]
    pub fn x(&self) -> f32 {
        self.position[0]
    }

    /// World-space y.
    #[inline]
    pub fn y(&self) -> f32 {
        self.position[1]
    }
}

/// Double-buffered particle storage.
///
/// Holds `2 * capacity` records. The first half is the live array seen by
/// every collaborator; the second half is scratch space that only the
/// post-sort permutation writes, and its contents are meaningless outside
/// that step.
#[derive(Debug, Clone)]
pub struct ParticleBuffer {
    data: Vec<Particle>,
    capacity: usize,
}

impl ParticleBuffer {
    /// Allocate `capacity` inactive live slots plus the same amount of scratch.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![Particle::inactive(); capacity * 2],
            capacity,
        }
    }

    /// Build a buffer whose live half starts with `particles`; the remaining
    /// live slots are inactive.
    ///
    /// Returns [`KernelError::CapacityExceeded`] when more particles than
    /// `capacity` are supplied.
    pub fn from_particles(particles: &[Particle], capacity: usize) -> Result<Self, KernelError> {
        if particles.len() > capacity {
            return Err(KernelError::CapacityExceeded {
                requested: particles.len(),
                max: capacity,
            });
        }
        let mut buffer = Self::new(capacity);
        buffer.data[..particles.len()].copy_from_slice(particles);
        Ok(buffer)
    }

    /// Maximum number of live particles.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The live half.
    pub fn live(&self) -> &[Particle] {
        &self.data[..self.capacity]
    }

    /// The live half, mutable.
    pub fn live_mut(&mut self) -> &mut [Particle] {
        &mut self.data[..self.capacity]
    }

    /// Split into `(live, scratch)` halves.
    pub fn halves_mut(&mut self) -> (&mut [Particle], &mut [Particle]) {
        self.data.split_at_mut(self.capacity)
    }

    /// Count active particles in the live half (serial; used by tests and
    /// debug assertions, never on the hot path).
    pub fn count_active(&self) -> usize {
        self.live().iter().filter(|p| p.is_active()).count()
    }
}

/// Mass and collision radius of a particle type.
#[repr(C)]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, bytemuck::Pod, bytemuck::Zeroable,
)]
pub struct ParticleProperties {
    /// Mass; must be non-zero for any type that can collide.
    pub mass: f32,
    /// Collision radius in world units.
    pub radius: f32,
}

/// Immutable per-type properties.
///
/// Entry 0 is always the zero-mass "no type" record: a particle that was never
/// given a type divides by zero during resolution.
#[derive(Debug, Clone)]
pub struct PropertiesTable {
    entries: Vec<ParticleProperties>,
}

impl PropertiesTable {
    /// Build a table from the real particle types; index 0 is prepended.
    pub fn new(types: &[ParticleProperties]) -> Self {
        let mut entries = Vec::with_capacity(types.len() + 1);
        entries.push(ParticleProperties::default());
        entries.extend_from_slice(types);
        Self { entries }
    }

    /// Properties for `type_index`. Out-of-range indices map to the "no type"
    /// entry so that they fail the same way an unassigned particle does.
    #[inline]
    pub fn get(&self, type_index: u32) -> ParticleProperties {
        self.entries
            .get(type_index as usize)
            .copied()
            .unwrap_or_default()
    }

    /// All entries including the "no type" record.
    pub fn as_slice(&self) -> &[ParticleProperties] {
        &self.entries
    }

    /// Number of entries including the "no type" record.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when no real type was registered.
    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    /// Largest collision radius over all types.
    pub fn max_radius(&self) -> f32 {
        self.entries.iter().map(|p| p.radius).fold(0.0, f32::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn particle_record_layout() {
        // Must match the WGSL struct: vec4 + vec2 + 3 u32 + 3 u32 padding.
        assert_eq!(std::mem::size_of::<Particle>(), 48);
        assert_eq!(std::mem::size_of::<ParticleProperties>(), 8);
    }

    #[test]
    fn new_particle_is_active() {
        let p = Particle::new(0.25, -0.5, 1.0, 0.0, 2);
        assert!(p.is_active());
        assert_eq!(p.x(), 0.25);
        assert_eq!(p.y(), -0.5);
        assert_eq!(p.velocity, [1.0, 0.0]);
        assert_eq!(p.type_index, 2);
        assert!(!Particle::inactive().is_active());
    }

    #[test]
    fn buffer_has_scratch_half() {
        let mut buf = ParticleBuffer::new(8);
        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.live().len(), 8);
        let (live, scratch) = buf.halves_mut();
        assert_eq!(live.len(), 8);
        assert_eq!(scratch.len(), 8);
        assert_eq!(buf.count_active(), 0);
    }

    #[test]
    fn buffer_rejects_overflow() {
        let particles = vec![Particle::new(0.0, 0.0, 0.0, 0.0, 1); 5];
        let err = ParticleBuffer::from_particles(&particles, 4).unwrap_err();
        assert!(matches!(err, KernelError::CapacityExceeded { requested: 5, max: 4 }));

        let buf = ParticleBuffer::from_particles(&particles, 6).unwrap();
        assert_eq!(buf.count_active(), 5);
    }

    #[test]
    fn properties_table_reserves_no_type_entry() {
        let table = PropertiesTable::new(&[ParticleProperties { mass: 2.0, radius: 0.1 }]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0).mass, 0.0);
        assert_eq!(table.get(1).mass, 2.0);
        assert_eq!(table.get(99), ParticleProperties::default());
        assert!((table.max_radius() - 0.1).abs() < 1e-7);
        assert!(PropertiesTable::new(&[]).is_empty());
    }
}
