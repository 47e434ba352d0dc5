//! Particle emitters
//!
//! Emitters activate slots from the inactive suffix of the particle buffer.
//! After every kernel step the live buffer is sorted with all active
//! particles first, so the free slots of the next step are exactly
//! `[active, capacity)`. Requests beyond the free slots are dropped.

use kernel::Particle;
use rand::rngs::StdRng;
use rand::Rng;

use crate::config::{EmitterConfig, SimulationConfig};

/// Hands out free slots from the inactive suffix, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeSlots {
    next: usize,
    end: usize,
}

impl FreeSlots {
    /// Slots `start..end`.
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            next: start.min(end),
            end,
        }
    }

    /// Next free slot, if any.
    pub fn take(&mut self) -> Option<usize> {
        (self.next < self.end).then(|| {
            self.next += 1;
            self.next - 1
        })
    }

    /// Slots still available.
    pub fn remaining(&self) -> usize {
        self.end - self.next
    }
}

/// A particle source.
///
/// Both variants accumulate `rate * dt` every step and emit the whole part,
/// carrying the fraction over to the next step.
#[derive(Debug, Clone, PartialEq)]
pub enum Emitter {
    /// Emits from one point in a cone around +y.
    Point {
        /// Emission point
        position: [f32; 2],
        /// Initial speed
        speed: f32,
        /// Half-angle of the cone (radians)
        spread: f32,
        /// Particles per second
        rate: f32,
        /// Properties table index of the emitted type
        type_index: u32,
        /// Fractional particles carried between steps
        pending: f32,
    },
    /// Emits at uniformly random points along a segment.
    Bar {
        /// Segment start
        start: [f32; 2],
        /// Segment end
        end: [f32; 2],
        /// Initial velocity
        velocity: [f32; 2],
        /// Particles per second
        rate: f32,
        /// Properties table index of the emitted type
        type_index: u32,
        /// Fractional particles carried between steps
        pending: f32,
    },
}

impl Emitter {
    /// Build the emitters of a validated configuration.
    pub fn from_config(config: &SimulationConfig) -> Vec<Emitter> {
        config
            .emitters
            .iter()
            .filter_map(|e| {
                let type_index = config.type_index(e.particle_type())?;
                Some(match *e {
                    EmitterConfig::Point {
                        position,
                        speed,
                        spread,
                        rate,
                        ..
                    } => Emitter::Point {
                        position,
                        speed,
                        spread,
                        rate,
                        type_index,
                        pending: 0.0,
                    },
                    EmitterConfig::Bar {
                        start,
                        end,
                        velocity,
                        rate,
                        ..
                    } => Emitter::Bar {
                        start,
                        end,
                        velocity,
                        rate,
                        type_index,
                        pending: 0.0,
                    },
                })
            })
            .collect()
    }

    fn pending_mut(&mut self) -> &mut f32 {
        match self {
            Emitter::Point { pending, .. } | Emitter::Bar { pending, .. } => pending,
        }
    }

    fn rate(&self) -> f32 {
        match self {
            Emitter::Point { rate, .. } | Emitter::Bar { rate, .. } => *rate,
        }
    }

    /// One new particle.
    fn spawn(&self, rng: &mut StdRng) -> Particle {
        match *self {
            Emitter::Point {
                position,
                speed,
                spread,
                type_index,
                ..
            } => {
                let angle = std::f32::consts::FRAC_PI_2 + rng.gen_range(-spread..=spread);
                Particle::new(
                    position[0],
                    position[1],
                    speed * angle.cos(),
                    speed * angle.sin(),
                    type_index,
                )
            }
            Emitter::Bar {
                start,
                end,
                velocity,
                type_index,
                ..
            } => {
                let t: f32 = rng.gen();
                Particle::new(
                    start[0] + t * (end[0] - start[0]),
                    start[1] + t * (end[1] - start[1]),
                    velocity[0],
                    velocity[1],
                    type_index,
                )
            }
        }
    }

    /// Emit this step's particles into free slots. Returns how many were
    /// activated.
    pub fn emit(
        &mut self,
        dt: f32,
        particles: &mut [Particle],
        slots: &mut FreeSlots,
        rng: &mut StdRng,
    ) -> usize {
        let rate = self.rate();
        let pending = self.pending_mut();
        *pending += rate * dt;
        let requested = pending.floor();
        *pending -= requested;
        let requested = requested as usize;

        let mut emitted = 0;
        while emitted < requested {
            let Some(slot) = slots.take() else { break };
            particles[slot] = self.spawn(rng);
            emitted += 1;
        }
        if emitted < requested {
            tracing::warn!(
                requested,
                emitted,
                "particle buffer full, dropping emitted particles"
            );
        }
        emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn point(rate: f32) -> Emitter {
        Emitter::Point {
            position: [0.0, 0.0],
            speed: 2.0,
            spread: 0.3,
            rate,
            type_index: 1,
            pending: 0.0,
        }
    }

    #[test]
    fn test_free_slots_in_order() {
        let mut slots = FreeSlots::new(3, 5);
        assert_eq!(slots.remaining(), 2);
        assert_eq!(slots.take(), Some(3));
        assert_eq!(slots.take(), Some(4));
        assert_eq!(slots.take(), None);
        assert_eq!(FreeSlots::new(7, 5).remaining(), 0);
    }

    #[test]
    fn test_rate_accumulates_across_steps() {
        let mut emitter = point(1.0);
        let mut particles = vec![Particle::inactive(); 64];
        let mut rng = StdRng::seed_from_u64(1);
        let mut slots = FreeSlots::new(0, 64);
        // One particle every fourth step.
        let counts: Vec<usize> = (0..8)
            .map(|_| emitter.emit(0.25, &mut particles, &mut slots, &mut rng))
            .collect();
        assert_eq!(counts, vec![0, 0, 0, 1, 0, 0, 0, 1]);
        assert_eq!(particles.iter().filter(|p| p.is_active()).count(), 2);
    }

    #[test]
    fn test_point_emitter_velocity_within_cone() {
        let mut emitter = point(20.0);
        let mut particles = vec![Particle::inactive(); 32];
        let mut rng = StdRng::seed_from_u64(7);
        let n = emitter.emit(1.0, &mut particles, &mut FreeSlots::new(0, 32), &mut rng);
        assert_eq!(n, 20);
        for p in &particles[..n] {
            assert_eq!(p.type_index, 1);
            let speed = (p.velocity[0].powi(2) + p.velocity[1].powi(2)).sqrt();
            assert!((speed - 2.0).abs() < 1e-4);
            assert!(p.velocity[1] >= 2.0 * 0.3f32.cos() - 1e-4);
        }
    }

    #[test]
    fn test_bar_emitter_stays_on_segment() {
        let mut emitter = Emitter::Bar {
            start: [-1.0, 0.5],
            end: [1.0, 0.5],
            velocity: [0.0, -1.0],
            rate: 10.0,
            type_index: 2,
            pending: 0.0,
        };
        let mut particles = vec![Particle::inactive(); 16];
        let mut rng = StdRng::seed_from_u64(3);
        let n = emitter.emit(1.0, &mut particles, &mut FreeSlots::new(0, 16), &mut rng);
        assert_eq!(n, 10);
        for p in &particles[..n] {
            assert!(p.x() >= -1.0 && p.x() <= 1.0);
            assert_eq!(p.y(), 0.5);
            assert_eq!(p.velocity, [0.0, -1.0]);
        }
    }

    #[test]
    fn test_overflow_is_dropped() {
        let mut emitter = point(10.0);
        let mut particles = vec![Particle::inactive(); 8];
        particles[..6].fill(Particle::new(0.0, 0.0, 0.0, 0.0, 1));
        let mut rng = StdRng::seed_from_u64(5);
        let mut slots = FreeSlots::new(6, 8);
        let n = emitter.emit(1.0, &mut particles, &mut slots, &mut rng);
        assert_eq!(n, 2);
        assert_eq!(slots.remaining(), 0);
        assert!(particles.iter().all(Particle::is_active));
    }
}
