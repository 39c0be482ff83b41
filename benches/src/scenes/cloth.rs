use avian_async::prelude::*;
use bevy::prelude::*;

use super::BenchmarkPlugins;

pub fn create_bench(cloth_count: usize, size: usize) -> App {
    let mut app = App::new();
    app.add_plugins(BenchmarkPlugins);
    app.add_systems(Startup, move |solver: NonSendMut<PhysicsSolver>| {
        setup(solver, cloth_count, size);
    });
    app
}

fn setup(mut solver: NonSendMut<PhysicsSolver>, cloth_count: usize, size: usize) {
    let spacing = 0.1;
    let gap = size as Scalar * spacing + 1.0;

    for i in 0..cloth_count {
        let offset = Vector::new(i as Scalar * gap, 0.0, 0.0);
        let mut particles = Vec::with_capacity(size * size);
        let mut adjacency = Adjacency::new();

        // A horizontal sheet pinned along one edge, falling into a curtain.
        for row in 0..size {
            for column in 0..size {
                let position =
                    offset + Vector::new(column as Scalar, 0.0, row as Scalar) * spacing;
                particles.push(if row == 0 {
                    ParticleDesc::kinematic(position)
                } else {
                    ParticleDesc::dynamic(position, 1.0)
                });

                let index = row * size + column;
                let neighbors = adjacency.entry(index).or_default();
                if column + 1 < size {
                    neighbors.insert(index + 1);
                }
                if row + 1 < size {
                    neighbors.insert(index + size);
                }
            }
        }

        if let Err(error) = solver.register_cluster(ExternalId(i as u64), particles, adjacency) {
            error!("failed to register cloth {i}: {error}");
        }
    }
}
