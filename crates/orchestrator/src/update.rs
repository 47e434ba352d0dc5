//! Particle updater
//!
//! Explicit Euler integration under gravity, followed by the boundary rule.
//! Every particle still active afterwards bumps the step's [`ActiveCounter`].

use kernel::{ActiveCounter, Particle};
use rayon::prelude::*;

use crate::config::{BoundaryBehavior, SimulationConfig};

/// Integrates particle motion between collision steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticleUpdater {
    gravity: [f32; 2],
    dt: f32,
    extent: f32,
    boundary: BoundaryBehavior,
}

impl ParticleUpdater {
    /// Updater with explicit parameters.
    pub fn new(gravity: [f32; 2], dt: f32, extent: f32, boundary: BoundaryBehavior) -> Self {
        Self {
            gravity,
            dt,
            extent,
            boundary,
        }
    }

    /// Updater for a validated configuration.
    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new(config.gravity, config.dt, config.world_extent, config.boundary)
    }

    /// Advance every active particle by one timestep.
    pub fn update(&self, particles: &mut [Particle], counter: &ActiveCounter) {
        particles.par_iter_mut().for_each(|p| {
            if !p.is_active() {
                return;
            }
            p.velocity[0] += self.gravity[0] * self.dt;
            p.velocity[1] += self.gravity[1] * self.dt;
            p.position[0] += p.velocity[0] * self.dt;
            p.position[1] += p.velocity[1] * self.dt;

            match self.boundary {
                BoundaryBehavior::Reflect => {
                    for axis in 0..2 {
                        reflect(&mut p.position[axis], &mut p.velocity[axis], self.extent);
                    }
                }
                BoundaryBehavior::Recycle => {
                    let outside = p.position[..2].iter().any(|c| c.abs() > self.extent);
                    if outside {
                        *p = Particle::inactive();
                        return;
                    }
                }
            }
            counter.increment();
        });
    }
}

/// Mirror a coordinate that crossed a wall at `±extent` back inside and flip
/// its velocity component.
fn reflect(x: &mut f32, v: &mut f32, extent: f32) {
    if *x > extent {
        *x = (2.0 * extent - *x).max(-extent);
        *v = -v.abs();
    } else if *x < -extent {
        *x = (-2.0 * extent - *x).min(extent);
        *v = v.abs();
    }
}
