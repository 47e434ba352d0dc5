//! Orchestration Layer
//!
//! This crate drives the collision kernel, including:
//! - JSON configuration loading and validation
//! - Particle emitters filling the inactive suffix of the particle buffer
//! - The particle updater (integration, world boundary, active counting)
//! - Backend selection with CPU fallback

#![warn(missing_docs)]

pub mod config;
pub mod emitter;
pub mod update;

pub use config::{BackendType, BoundaryBehavior, ConfigError, SimulationConfig};
pub use emitter::{Emitter, FreeSlots};
pub use update::ParticleUpdater;

use std::path::Path;

use kernel::{
    ActiveCounter, CollisionKernel, CpuKernel, KernelError, Particle, PipelineConfig,
    PropertiesTable, StepStats,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Errors raised while setting up a simulation.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Kernel construction failed.
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// A running simulation: kernel, emitters, updater and the per-step counter.
///
/// One [`Simulation::step`] resets the counter, integrates and counts the
/// surviving particles, emits into the free suffix and then runs the
/// collision pipeline.
pub struct Simulation {
    config: SimulationConfig,
    kernel: Box<dyn CollisionKernel + Send>,
    emitters: Vec<Emitter>,
    updater: ParticleUpdater,
    counter: ActiveCounter,
    rng: StdRng,
    /// Length of the active prefix after the last kernel step.
    active: usize,
    step_count: u64,
}

impl Simulation {
    /// Build a simulation from a validated configuration.
    pub fn new(config: SimulationConfig) -> Result<Self, SimulationError> {
        config.validate()?;
        let kernel = create_kernel(
            config.backend,
            &config.pipeline_config(),
            config.properties_table(),
            &[],
        )?;
        Ok(Self::with_kernel(config, kernel))
    }

    /// Build a simulation around an existing kernel, e.g. one pre-seeded
    /// with particles. Active particles are moved to the front of the live
    /// buffer so the free slots form its suffix.
    pub fn with_kernel(
        config: SimulationConfig,
        mut kernel: Box<dyn CollisionKernel + Send>,
    ) -> Self {
        let particles = kernel.particles_mut();
        particles.sort_by_key(|p| !p.is_active());
        let active = particles.partition_point(Particle::is_active);
        Self {
            emitters: Emitter::from_config(&config),
            updater: ParticleUpdater::from_config(&config),
            rng: StdRng::seed_from_u64(config.seed),
            counter: ActiveCounter::new(),
            kernel,
            config,
            active,
            step_count: 0,
        }
    }

    /// Advance one timestep.
    pub fn step(&mut self) -> StepStats {
        self.counter.reset();
        let capacity = self.kernel.capacity();
        let particles = self.kernel.particles_mut();

        self.updater.update(particles, &self.counter);

        let mut slots = FreeSlots::new(self.active, capacity);
        for emitter in &mut self.emitters {
            let emitted = emitter.emit(self.config.dt, particles, &mut slots, &mut self.rng);
            self.counter.add(emitted as u32);
        }

        self.kernel.step(&self.counter);
        let stats = self.kernel.last_stats();
        self.active = stats.active as usize;
        self.step_count += 1;
        stats
    }

    /// Run until `max_steps` (or forever when unset), calling `on_step`
    /// after every step.
    pub fn run(&mut self, mut on_step: impl FnMut(u64, &StepStats)) {
        while !self.is_finished() {
            let stats = self.step();
            on_step(self.step_count, &stats);
        }
    }

    /// `true` once `max_steps` steps have run.
    pub fn is_finished(&self) -> bool {
        self.config.max_steps.is_some_and(|max| self.step_count >= max)
    }

    /// Steps executed so far.
    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// Active particles after the last step.
    pub fn active_count(&self) -> usize {
        self.active
    }

    /// Simulated time (seconds).
    pub fn sim_time(&self) -> f64 {
        self.step_count as f64 * self.config.dt as f64
    }

    /// The configuration this simulation was built from.
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// The collision kernel, for rendering and inspection.
    pub fn kernel(&self) -> &dyn CollisionKernel {
        self.kernel.as_ref()
    }

    /// Mutable kernel access, e.g. for [`CollisionKernel::snapshot`].
    pub fn kernel_mut(&mut self) -> &mut dyn CollisionKernel {
        self.kernel.as_mut()
    }
}

/// Create a complete simulation from a configuration file
///
/// # Example
/// ```no_run
/// use orchestrator::create_simulation;
///
/// let mut sim = create_simulation("configs/fountain.json")?;
/// sim.run(|step, stats| println!("{step}: {} active", stats.active));
/// # Ok::<(), orchestrator::SimulationError>(())
/// ```
pub fn create_simulation(config_path: impl AsRef<Path>) -> Result<Simulation, SimulationError> {
    let config_path = config_path.as_ref();
    tracing::info!("Creating simulation from config: {}", config_path.display());

    let config = SimulationConfig::load(config_path)?;
    tracing::info!(
        "Configuration loaded: {} ({} types, {} emitters, {} slots)",
        config.name,
        config.particle_types.len(),
        config.emitters.len(),
        config.max_particles
    );

    let sim = Simulation::new(config)?;
    tracing::info!("Simulation ready on the {} kernel", sim.kernel().name());
    Ok(sim)
}

/// Create a collision kernel for the requested backend.
///
/// `Gpu` and `Auto` fall back to the CPU kernel when the GPU kernel cannot
/// be created or the `gpu` feature is disabled. Configuration errors are
/// returned as-is.
pub fn create_kernel(
    backend: BackendType,
    config: &PipelineConfig,
    properties: PropertiesTable,
    particles: &[Particle],
) -> Result<Box<dyn CollisionKernel + Send>, KernelError> {
    match backend {
        BackendType::Cpu => {
            tracing::info!("Creating CPU collision kernel...");
            Ok(Box::new(CpuKernel::new(config, properties, particles)?))
        }
        #[cfg(feature = "gpu")]
        BackendType::Gpu | BackendType::Auto => {
            if backend == BackendType::Auto && !kernel::gpu_available() {
                tracing::info!("No GPU available, using CPU kernel");
                return Ok(Box::new(CpuKernel::new(config, properties, particles)?));
            }
            tracing::info!("Creating GPU collision kernel...");
            match kernel::GpuKernel::new(config, properties.clone(), particles) {
                Ok(gpu) => Ok(Box::new(gpu)),
                Err(e @ KernelError::GpuInit(_)) => {
                    tracing::warn!("GPU init failed ({e}), falling back to CPU");
                    Ok(Box::new(CpuKernel::new(config, properties, particles)?))
                }
                Err(e) => Err(e),
            }
        }
        #[cfg(not(feature = "gpu"))]
        BackendType::Gpu | BackendType::Auto => {
            tracing::warn!("GPU feature not enabled, using CPU kernel");
            Ok(Box::new(CpuKernel::new(config, properties, particles)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel::ParticleProperties;

    fn config() -> SimulationConfig {
        SimulationConfig::from_json(
            r#"{
                "name": "unit",
                "max_particles": 64,
                "dt": 0.01,
                "gravity": [0.0, 0.0],
                "particle_types": [{ "name": "ball", "mass": 1.0, "radius": 0.02 }],
                "emitters": [
                    { "Bar": { "start": [-0.5, 0.0], "end": [0.5, 0.0], "velocity": [0.0, 0.1], "rate": 1000.0, "particle_type": "ball" } }
                ],
                "max_steps": 20,
                "seed": 42
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_create_kernel_cpu() {
        let table = PropertiesTable::new(&[ParticleProperties { mass: 1.0, radius: 0.1 }]);
        let kernel = create_kernel(BackendType::Cpu, &PipelineConfig::default(), table, &[]).unwrap();
        assert_eq!(kernel.name(), "cpu");
    }

    #[test]
    fn test_create_kernel_rejects_bad_sizes() {
        let table = PropertiesTable::new(&[ParticleProperties { mass: 1.0, radius: 0.1 }]);
        let bad = PipelineConfig {
            candidate_capacity: 0,
            ..Default::default()
        };
        assert!(create_kernel(BackendType::Cpu, &bad, table, &[]).is_err());
    }

    #[test]
    fn test_emission_fills_buffer_without_overflow() {
        let mut sim = Simulation::new(config()).unwrap();
        let stats = sim.step();
        assert_eq!(stats.active, 10);
        assert_eq!(sim.active_count(), 10);

        let mut steps = 1;
        sim.run(|_, _| steps += 1);
        assert_eq!(steps, 20);
        assert!(sim.is_finished());
        assert_eq!(sim.active_count(), 64);
        assert!(sim.kernel().particles().iter().all(Particle::is_active));
    }
}
