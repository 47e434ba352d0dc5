//! 2-D particle collision kernel
//!
//! This crate provides the per-step collision pipeline for large populations
//! of circular particles. It is designed to be separable and compute-focused:
//! emission, integration and rendering live in the orchestrator.
//!
//! Each step runs, with a full barrier between stages:
//!
//! 1. Morton key generation ([`morton`])
//! 2. LSB radix sort over a two-level prefix scan ([`radix_sort`], [`scan`])
//! 3. Binary radix tree construction ([`tree`])
//! 4. Bottom-up bounding box merge ([`merge`])
//! 5. Stack-based BVH traversal into fixed-capacity candidate lists ([`detect`])
//! 6. Elastic impulse resolution ([`resolve`])
//!
//! # Modules
//! - [`particle`] -- Particle record, double-buffered storage, properties table.
//! - [`workgroup`] -- Work-group constants, dispatch sizing, [`ActiveCounter`].
//! - [`bvh`] -- Node layout, boxes and structural validation.
//! - [`error`] -- Construction and validation errors.

#![warn(missing_docs)]

pub mod bvh;
pub mod detect;
pub mod error;
pub mod merge;
pub mod morton;
pub mod particle;
pub mod radix_sort;
pub mod resolve;
pub mod scan;
pub mod tree;
pub mod workgroup;

#[cfg(feature = "gpu")]
#[allow(missing_docs)]
pub mod gpu;

pub use bvh::{Aabb, Bvh, BvhNode, NO_NODE};
pub use detect::{CandidateLists, CandidateStats, CollisionDetector, NO_CANDIDATE};
pub use error::{KernelError, TreeError};
pub use merge::{BoundingVolumeMerger, VisitGate};
pub use morton::{KeyGenerator, SortKey, INACTIVE_KEY};
pub use particle::{Particle, ParticleBuffer, ParticleProperties, PropertiesTable};
pub use radix_sort::ParallelRadixSorter;
pub use resolve::CollisionResolver;
pub use scan::PrefixScanEngine;
pub use tree::BinaryRadixTreeBuilder;
pub use workgroup::{ActiveCounter, MAX_SCAN_ELEMENTS};

#[cfg(feature = "gpu")]
pub use gpu::{gpu_available, GpuKernel};

// ---------------------------------------------------------------------------
// Pipeline configuration and the CollisionKernel trait
// ---------------------------------------------------------------------------

/// Fixed sizes chosen once at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    /// Maximum number of particles (live half of the particle buffer).
    pub capacity: usize,
    /// Half-width of the square world; keys cover `[-extent, extent]`.
    pub world_extent: f32,
    /// Candidate slots per particle.
    pub candidate_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: 16_384,
            world_extent: 1.0,
            candidate_capacity: 8,
        }
    }
}

impl PipelineConfig {
    /// Check the sizes against the hard limits of the pipeline.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.capacity > MAX_SCAN_ELEMENTS {
            return Err(KernelError::CapacityExceeded {
                requested: self.capacity,
                max: MAX_SCAN_ELEMENTS,
            });
        }
        if !(self.world_extent.is_finite() && self.world_extent > 0.0) {
            return Err(KernelError::InvalidWorldExtent(self.world_extent));
        }
        if self.candidate_capacity == 0 {
            return Err(KernelError::InvalidCandidateCapacity);
        }
        Ok(())
    }
}

/// Per-step counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepStats {
    /// Active particles that went through the tree stages.
    pub active: u32,
    /// Candidate list totals.
    pub candidates: CandidateStats,
}

/// Intermediate pipeline state, copied out for debug drawing and tests.
#[derive(Debug, Clone)]
pub struct PipelineSnapshot {
    /// Length of the active prefix.
    pub active: usize,
    /// All sort pairs, in sorted order.
    pub sorted_keys: Vec<SortKey>,
    /// The `2 * active - 1` tree nodes.
    pub nodes: Vec<BvhNode>,
    /// Candidate lists for every particle slot.
    pub candidates: CandidateLists,
}

/// Trait that every execution back-end (CPU, GPU) implements.
///
/// A `CollisionKernel` owns the particle buffer and all pipeline scratch.
/// Collaborators edit the live particles between steps through
/// [`CollisionKernel::particles_mut`]; `step` reorders them by Morton key and
/// resolves collisions in place.
pub trait CollisionKernel {
    /// Run the whole pipeline once. `active` holds the number of active
    /// particles, as counted by the updater for this step.
    fn step(&mut self, active: &ActiveCounter);

    /// Live particles.
    fn particles(&self) -> &[Particle];

    /// Live particles, for emitters and the updater.
    fn particles_mut(&mut self) -> &mut [Particle];

    /// Maximum number of particles.
    fn capacity(&self) -> usize;

    /// Counters from the last step.
    fn last_stats(&self) -> StepStats;

    /// Copy out the sort, tree and candidate state of the last step.
    fn snapshot(&mut self) -> PipelineSnapshot;

    /// Short back-end name for logs.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// CpuKernel -- rayon implementation of CollisionKernel
// ---------------------------------------------------------------------------

/// CPU implementation of the pipeline.
///
/// Every stage is one `rayon` parallel loop over invocation ids; returning
/// from the loop is the barrier before the next stage. All buffers are
/// allocated in [`CpuKernel::new`], nothing is allocated per step.
#[derive(Debug)]
pub struct CpuKernel {
    particles: ParticleBuffer,
    properties: PropertiesTable,
    generator: KeyGenerator,
    sorter: ParallelRadixSorter,
    tree_builder: BinaryRadixTreeBuilder,
    merger: BoundingVolumeMerger,
    detector: CollisionDetector,
    bvh: Bvh,
    candidates: CandidateLists,
    resolver: CollisionResolver,
    stats: StepStats,
}

impl CpuKernel {
    /// Create a kernel whose live buffer starts with `particles`.
    pub fn new(
        config: &PipelineConfig,
        properties: PropertiesTable,
        particles: &[Particle],
    ) -> Result<Self, KernelError> {
        config.validate()?;
        if properties.is_empty() {
            return Err(KernelError::EmptyPropertiesTable);
        }
        let capacity = config.capacity;
        let particles = ParticleBuffer::from_particles(particles, capacity)?;
        let candidates = CandidateLists::new(capacity, config.candidate_capacity)?;
        let resolver = CollisionResolver::new(&candidates);

        tracing::info!(
            capacity,
            candidate_capacity = config.candidate_capacity,
            world_extent = config.world_extent,
            types = properties.len() - 1,
            "CPU collision kernel ready"
        );

        Ok(Self {
            particles,
            properties,
            generator: KeyGenerator::new(config.world_extent),
            sorter: ParallelRadixSorter::new(capacity)?,
            tree_builder: BinaryRadixTreeBuilder::new(capacity),
            merger: BoundingVolumeMerger::new(capacity),
            detector: CollisionDetector,
            bvh: Bvh::with_capacity(capacity),
            candidates,
            resolver,
            stats: StepStats::default(),
        })
    }

    /// Tree built in the last step.
    pub fn bvh(&self) -> &Bvh {
        &self.bvh
    }

    /// Candidate lists from the last step.
    pub fn candidates(&self) -> &CandidateLists {
        &self.candidates
    }

    /// Sort pairs from the last step.
    pub fn sorted_keys(&self) -> &[SortKey] {
        self.sorter.sorted()
    }

    /// Properties table the kernel resolves with.
    pub fn properties(&self) -> &PropertiesTable {
        &self.properties
    }
}

impl CollisionKernel for CpuKernel {
    fn step(&mut self, active: &ActiveCounter) {
        // 1-2. Keys, sort, permute particles into key order.
        self.sorter.generate_keys(&self.generator, self.particles.live());
        self.sorter.sort();
        self.sorter.reorder_particles(&mut self.particles);

        let sorted = self.sorter.sorted();
        let sorted_active = sorted.partition_point(|k| k.key != INACTIVE_KEY);
        debug_assert_eq!(
            active.get() as usize,
            sorted_active,
            "active counter disagrees with the sorted keys"
        );
        let n = (active.get() as usize).min(sorted_active);

        // 3-4. Tree skeleton, then boxes.
        self.tree_builder.build(&sorted[..n], &mut self.bvh);
        self.merger
            .merge(self.particles.live(), &self.properties, &mut self.bvh);

        // 5-6. Candidates, then impulses.
        self.detector.detect(&self.bvh, &mut self.candidates);
        self.resolver.resolve(
            self.particles.live_mut(),
            &self.properties,
            &self.candidates,
            n,
        );

        self.stats = StepStats {
            active: n as u32,
            candidates: self.candidates.stats(n),
        };
        tracing::debug!(
            active = n,
            stored = self.stats.candidates.stored,
            found = self.stats.candidates.found,
            saturated = self.stats.candidates.saturated,
            "collision step"
        );
    }

    fn particles(&self) -> &[Particle] {
        self.particles.live()
    }

    fn particles_mut(&mut self) -> &mut [Particle] {
        self.particles.live_mut()
    }

    fn capacity(&self) -> usize {
        self.particles.capacity()
    }

    fn last_stats(&self) -> StepStats {
        self.stats
    }

    fn snapshot(&mut self) -> PipelineSnapshot {
        PipelineSnapshot {
            active: self.bvh.leaf_count(),
            sorted_keys: self.sorter.sorted().to_vec(),
            nodes: self.bvh.nodes().to_vec(),
            candidates: self.candidates.clone(),
        }
    }

    fn name(&self) -> &'static str {
        "cpu"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PropertiesTable {
        PropertiesTable::new(&[ParticleProperties { mass: 1.0, radius: 0.05 }])
    }

    #[test]
    fn config_limits() {
        assert!(PipelineConfig::default().validate().is_ok());
        let too_big = PipelineConfig {
            capacity: MAX_SCAN_ELEMENTS + 1,
            ..Default::default()
        };
        assert!(matches!(too_big.validate(), Err(KernelError::CapacityExceeded { .. })));
        let no_slots = PipelineConfig {
            candidate_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(no_slots.validate(), Err(KernelError::InvalidCandidateCapacity)));
        let flat = PipelineConfig {
            world_extent: 0.0,
            ..Default::default()
        };
        assert!(matches!(flat.validate(), Err(KernelError::InvalidWorldExtent(_))));
    }

    #[test]
    fn bad_world_extent_is_an_error_not_a_panic() {
        let config = PipelineConfig {
            world_extent: -1.0,
            ..Default::default()
        };
        let table = PropertiesTable::new(&[ParticleProperties { mass: 1.0, radius: 0.1 }]);
        let err = CpuKernel::new(&config, table, &[]).unwrap_err();
        assert!(matches!(err, KernelError::InvalidWorldExtent(_)));
    }

    #[test]
    fn rejects_empty_properties() {
        let err = CpuKernel::new(&PipelineConfig::default(), PropertiesTable::new(&[]), &[]).unwrap_err();
        assert!(matches!(err, KernelError::EmptyPropertiesTable));
    }

    #[test]
    fn empty_population_steps_cleanly() {
        let config = PipelineConfig {
            capacity: 32,
            ..Default::default()
        };
        let mut kernel = CpuKernel::new(&config, table(), &[]).unwrap();
        kernel.step(&ActiveCounter::new());
        assert_eq!(kernel.last_stats().active, 0);
        assert!(kernel.bvh().nodes().is_empty());
        assert_eq!(kernel.snapshot().nodes.len(), 0);
    }

    #[test]
    fn step_sorts_active_prefix_and_builds_tree() {
        let config = PipelineConfig {
            capacity: 64,
            ..Default::default()
        };
        let mut particles = Vec::new();
        for i in 0..40 {
            let t = i as f32 * 0.61;
            particles.push(Particle::new(t.sin() * 0.9, t.cos() * 0.9, 0.0, 0.0, 1));
            if i % 3 == 0 {
                particles.push(Particle::inactive());
            }
        }
        let mut kernel = CpuKernel::new(&config, table(), &particles).unwrap();
        kernel.step(&ActiveCounter::with_value(40));

        let live = kernel.particles();
        assert!(live[..40].iter().all(Particle::is_active));
        assert!(live[40..].iter().all(|p| !p.is_active()));
        let keys = kernel.sorted_keys();
        assert!(keys.windows(2).all(|w| w[0].key <= w[1].key));
        assert_eq!(kernel.bvh().validate(), Ok(()));
        assert_eq!(kernel.bvh().leaf_count(), 40);
        assert_eq!(kernel.name(), "cpu");
    }
}
