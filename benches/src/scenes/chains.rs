use avian_async::prelude::*;
use bevy::prelude::*;

use super::BenchmarkPlugins;

/// Particles spawned as entities, synchronized through their transforms every frame.
pub fn create_particles_bench(count: usize) -> App {
    let mut app = App::new();
    app.add_plugins(BenchmarkPlugins);
    app.add_systems(Startup, move |mut commands: Commands| {
        let side = (count as f32).sqrt().ceil() as usize;
        for i in 0..count {
            let (x, z) = ((i % side) as f32, (i / side) as f32);
            commands.spawn((
                SolverParticle::dynamic(1.0),
                Transform::from_xyz(x * 0.5, 10.0, z * 0.5),
            ));
        }
    });
    app
}

/// Chains of particles hanging from a kinematic particle, linked by distance joints.
pub fn create_chains_bench(chain_count: usize, links: usize) -> App {
    let mut app = App::new();
    app.add_plugins(BenchmarkPlugins);
    app.add_systems(Startup, move |solver: NonSendMut<PhysicsSolver>| {
        setup_chains(solver, chain_count, links);
    });
    app
}

fn setup_chains(mut solver: NonSendMut<PhysicsSolver>, chain_count: usize, links: usize) {
    let mut owner = 0;
    for chain in 0..chain_count {
        if let Err(error) = spawn_chain(&mut solver, &mut owner, chain as Scalar, links) {
            error!("failed to register chain {chain}: {error}");
        }
    }
}

fn spawn_chain(
    solver: &mut PhysicsSolver,
    owner: &mut u64,
    x: Scalar,
    links: usize,
) -> Result<(), RegistrationError> {
    let mut next_owner = || {
        *owner += 1;
        ExternalId(*owner)
    };

    let mut previous =
        solver.register_particle(next_owner(), ParticleDesc::kinematic(Vector::new(x, 0.0, 0.0)))?;
    for link in 1..=links {
        // Links start out horizontal, so the chains swing down.
        let position = Vector::new(x, 0.0, link as Scalar * 0.25);
        let particle = solver.register_particle(next_owner(), ParticleDesc::dynamic(position, 1.0))?;
        solver.register_joint(
            next_owner(),
            ParticleRef::new(previous, 0),
            ParticleRef::new(particle, 0),
            0.0,
        )?;
        previous = particle;
    }
    Ok(())
}
