//! Two-particle collision course.
//!
//! Radius 0.1 each, starting 0.5 apart, closing at 1.0 unit/s. The pair must
//! show up in each other's candidate lists once the boxes overlap, and the
//! resolved velocities must conserve momentum.

use kernel::{
    ActiveCounter, CollisionKernel, CpuKernel, Particle, ParticleProperties, PipelineConfig,
    PropertiesTable,
};

fn setup(mass_b: f32) -> CpuKernel {
    let properties = PropertiesTable::new(&[
        ParticleProperties { mass: 1.0, radius: 0.1 },
        ParticleProperties { mass: mass_b, radius: 0.1 },
    ]);
    let particles = [
        Particle::new(-0.25, 0.0, 0.5, 0.0, 1),
        Particle::new(0.25, 0.0, -0.5, 0.0, 2),
    ];
    let config = PipelineConfig {
        capacity: 8,
        world_extent: 1.0,
        candidate_capacity: 4,
    };
    CpuKernel::new(&config, properties, &particles).unwrap()
}

/// Explicit Euler drift; the kernel itself never moves particles.
fn drift(kernel: &mut CpuKernel, dt: f32) {
    for p in kernel.particles_mut().iter_mut().filter(|p| p.is_active()) {
        p.position[0] += p.velocity[0] * dt;
        p.position[1] += p.velocity[1] * dt;
    }
}

fn momentum(kernel: &CpuKernel) -> [f32; 2] {
    let props = kernel.properties();
    kernel
        .particles()
        .iter()
        .filter(|p| p.is_active())
        .fold([0.0, 0.0], |m, p| {
            let mass = props.get(p.type_index).mass;
            [m[0] + mass * p.velocity[0], m[1] + mass * p.velocity[1]]
        })
}

/// Velocities of the pair ordered left to right. Sorting may reorder the
/// records, so particles are told apart by position.
fn velocities_by_x(kernel: &CpuKernel) -> [[f32; 2]; 2] {
    let (a, b) = (&kernel.particles()[0], &kernel.particles()[1]);
    if a.x() <= b.x() {
        [a.velocity, b.velocity]
    } else {
        [b.velocity, a.velocity]
    }
}

/// Step until the first impulse is applied. Returns the step index.
fn run_until_collision(kernel: &mut CpuKernel, dt: f32) -> usize {
    let counter = ActiveCounter::with_value(2);
    for step in 0..200 {
        let before = velocities_by_x(kernel);
        kernel.step(&counter);
        let after = velocities_by_x(kernel);
        if kernel.last_stats().candidates.found > 0 {
            // Boxes overlap: both lists must name the other particle.
            assert!(kernel.candidates().contains(0, 1));
            assert!(kernel.candidates().contains(1, 0));
            assert_eq!(kernel.particles()[0].nearby_count, 1);
        }
        if before != after {
            return step;
        }
        drift(kernel, dt);
    }
    panic!("particles never collided");
}

#[test]
fn candidates_appear_and_momentum_is_conserved() {
    let mut kernel = setup(1.0);
    let p0 = momentum(&kernel);
    let step = run_until_collision(&mut kernel, 0.01);

    // The gap of 0.3 closes at 1.0 unit/s.
    assert!((25..=35).contains(&step), "collided at step {step}");

    let p1 = momentum(&kernel);
    assert!((p0[0] - p1[0]).abs() < 1e-5);
    assert!((p0[1] - p1[1]).abs() < 1e-5);

    // Equal masses exchange their normal velocities.
    let [left, right] = velocities_by_x(&kernel);
    assert!((left[0] + 0.5).abs() < 1e-5);
    assert!((right[0] - 0.5).abs() < 1e-5);
}

#[test]
fn unequal_masses_conserve_momentum() {
    let mut kernel = setup(3.0);
    let p0 = momentum(&kernel);
    run_until_collision(&mut kernel, 0.01);
    let p1 = momentum(&kernel);
    assert!((p0[0] - p1[0]).abs() < 1e-5);
    assert!((p0[1] - p1[1]).abs() < 1e-5);
}

#[test]
fn separating_pair_is_not_resolved_again() {
    let mut kernel = setup(1.0);
    run_until_collision(&mut kernel, 0.01);
    let resolved = velocities_by_x(&kernel);

    // Still overlapping on the next step, but moving apart.
    kernel.step(&ActiveCounter::with_value(2));
    assert_eq!(velocities_by_x(&kernel), resolved);
}
