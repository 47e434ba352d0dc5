//! A frame with no new particles and no motion must reproduce the same
//! sorted order and the same tree on the next run.

use kernel::{
    ActiveCounter, CollisionKernel, CpuKernel, Particle, ParticleProperties, PipelineConfig,
    PropertiesTable,
};

fn still_population() -> Vec<Particle> {
    // Deterministic scatter with a few exact duplicates and some inactive
    // slots mixed in.
    let mut particles = Vec::new();
    for i in 0..300u32 {
        let t = i as f32 * 0.37;
        let r = 0.2 + 0.7 * ((i * 31) % 97) as f32 / 97.0;
        particles.push(Particle::new(r * t.cos(), r * t.sin(), 0.0, 0.0, 1 + i % 2));
        if i % 50 == 0 {
            particles.push(Particle::new(r * t.cos(), r * t.sin(), 0.0, 0.0, 1));
        }
        if i % 7 == 0 {
            particles.push(Particle::inactive());
        }
    }
    particles
}

#[test]
fn second_run_reproduces_order_and_tree() {
    let properties = PropertiesTable::new(&[
        ParticleProperties { mass: 1.0, radius: 0.02 },
        ParticleProperties { mass: 2.0, radius: 0.04 },
    ]);
    let particles = still_population();
    let active = particles.iter().filter(|p| p.is_active()).count();
    let config = PipelineConfig {
        capacity: 512,
        world_extent: 1.0,
        candidate_capacity: 8,
    };
    let mut kernel = CpuKernel::new(&config, properties, &particles).unwrap();
    let counter = ActiveCounter::with_value(active as u32);

    kernel.step(&counter);
    let first = kernel.snapshot();
    let order: Vec<[f32; 4]> = kernel.particles().iter().map(|p| p.position).collect();

    kernel.step(&counter);
    let second = kernel.snapshot();
    let order_again: Vec<[f32; 4]> = kernel.particles().iter().map(|p| p.position).collect();

    assert_eq!(order, order_again);
    assert_eq!(
        first.sorted_keys.iter().map(|k| k.key).collect::<Vec<_>>(),
        second.sorted_keys.iter().map(|k| k.key).collect::<Vec<_>>()
    );
    // Already sorted input comes back in place.
    assert!(second
        .sorted_keys
        .iter()
        .enumerate()
        .all(|(i, k)| k.index == i as u32));
    assert_eq!(first.nodes, second.nodes);
    assert_eq!(first.candidates.as_slice(), second.candidates.as_slice());
    assert_eq!(kernel.bvh().validate(), Ok(()));
}
