use std::collections::BTreeMap;

use crate::prelude::*;
use approx::assert_relative_eq;


/// A `width` by `depth` grid in the XZ plane with four neighbors per particle.
///
/// The row at `z = 0` is kinematic.
fn cloth(width: usize, depth: usize, spacing: Scalar) -> (Vec<ParticleDesc>, Adjacency) {
    let mut particles = Vec::with_capacity(width * depth);
    let mut adjacency = Adjacency::new();
    for row in 0..depth {
        for column in 0..width {
            let position = Vector::new(column as Scalar, 0.0, row as Scalar) * spacing;
            particles.push(if row == 0 {
                ParticleDesc::kinematic(position)
            } else {
                ParticleDesc::dynamic(position, 1.0)
            });

            let index = row * width + column;
            let neighbors = adjacency.entry(index).or_default();
            if column + 1 < width {
                neighbors.insert(index + 1);
            }
            if row + 1 < depth {
                neighbors.insert(index + width);
            }
        }
    }
    (particles, adjacency)
}

/// A chain folded into a U shape, anchored at its first particle.
fn folded_chain() -> (Vec<ParticleDesc>, Adjacency) {
    let path = [
        (0.0, 0.0),
        (0.0, -1.0),
        (0.0, -2.0),
        (1.0, -2.0),
        (2.0, -2.0),
        (2.0, -1.0),
        (2.0, 0.0),
    ];
    let particles = path
        .iter()
        .enumerate()
        .map(|(i, &(x, y))| {
            let position = Vector::new(x, y, 0.0);
            if i == 0 {
                ParticleDesc::kinematic(position)
            } else {
                ParticleDesc::dynamic(position, 1.0)
            }
        })
        .collect::<Vec<_>>();
    let adjacency = (0..path.len() - 1).map(|i| (i, [i + 1].into())).collect();
    (particles, adjacency)
}

fn single_threaded() -> SolverConfig {
    SolverConfig::default().with_threading(ThreadingMode::SingleThread)
}

fn pull_positions(solver: &mut PhysicsSolver) -> BTreeMap<ProxyId, Vec<Vector>> {
    let mut positions = BTreeMap::new();
    solver.for_each_dirty_proxy_since_last_pull(|proxy| {
        positions.insert(proxy.id(), proxy.state().positions.clone());
    });
    positions
}

#[test]
fn cloth_stays_within_tether_limits() {
    const WIDTH: usize = 6;
    const DEPTH: usize = 6;
    const SPACING: Scalar = 0.5;

    let mut solver = PhysicsSolver::new(single_threaded().with_fixed_step(None)).unwrap();
    let (particles, adjacency) = cloth(WIDTH, DEPTH, SPACING);
    let id = solver
        .register_cluster(ExternalId(1), particles.clone(), adjacency)
        .unwrap();

    let mut reports = 0;
    for _ in 0..45 {
        solver.advance_and_dispatch(1.0 / 60.0);
        let Some(positions) = pull_positions(&mut solver).remove(&id) else {
            continue;
        };
        reports += 1;

        for row in 0..DEPTH {
            for column in 0..WIDTH {
                let anchor = particles[column].position;
                let position = positions[row * WIDTH + column];
                // Every particle is tethered to the anchor at the top of its column.
                let limit = row as Scalar * SPACING;
                assert!(
                    position.distance(anchor) <= limit + 1e-3,
                    "particle ({row}, {column}) is {} from its anchor, limit {limit}",
                    position.distance(anchor)
                );
            }
        }
    }
    assert_eq!(reports, 45);

    // The cloth has swung down under gravity.
    let cluster = solver.proxy(id).unwrap();
    let corner = cluster.state().positions[WIDTH * DEPTH - 1];
    assert!(corner.y < -1.0);
}

#[test]
fn geodesic_tethers_follow_the_surface() {
    let run = |mode: TetherMode| {
        let tether = TetherConfig {
            mode,
            ..Default::default()
        };
        let mut solver =
            PhysicsSolver::new(single_threaded().with_fixed_step(None).with_tether(tether))
                .unwrap();
        let (particles, adjacency) = folded_chain();
        let id = solver
            .register_cluster(ExternalId(1), particles, adjacency)
            .unwrap();
        for _ in 0..240 {
            solver.advance_and_dispatch(1.0 / 60.0);
            solver.for_each_dirty_proxy_since_last_pull(|_| {});
        }
        let positions = &solver.proxy(id).unwrap().state().positions;
        positions[6].distance(positions[0])
    };

    // Along the chain, the last particle is 6 away from the anchor.
    let geodesic = run(TetherMode::Geodesic);
    assert!(geodesic > 5.0, "{geodesic}");
    assert!(geodesic <= 6.0 + 1e-3, "{geodesic}");

    // In a straight line, it is only 2 away.
    let euclidean = run(TetherMode::Euclidean);
    assert!(euclidean <= 2.0 + 1e-3, "{euclidean}");
}

#[test]
fn suspension_reports_the_force_holding_its_particle() {
    let mut solver = PhysicsSolver::new(single_threaded().with_fixed_step(None)).unwrap();
    let ball = solver
        .register_particle(ExternalId(1), ParticleDesc::dynamic(Vector::ZERO, 1.0))
        .unwrap();
    let spring = solver
        .register_suspension(ExternalId(2), ParticleRef::new(ball, 0), Vector::Y, 0.0)
        .unwrap();

    for _ in 0..60 {
        solver.advance_and_dispatch(1.0 / 60.0);
        solver.for_each_dirty_proxy_since_last_pull(|_| {});
    }

    let position = solver.proxy(ball).unwrap().state().positions[0];
    assert_relative_eq!(position.distance(Vector::Y), 1.0, epsilon = 1e-3);

    // The spring carries the weight of the particle.
    let force = solver.proxy(spring).unwrap().state().force;
    assert_relative_eq!(force.y, 9.81, epsilon = 0.1);
    assert_relative_eq!(force.x, 0.0, epsilon = 1e-3);
}

#[test]
fn joint_keeps_two_particles_apart() {
    let mut solver = PhysicsSolver::new(single_threaded().with_fixed_step(None)).unwrap();
    let anchor = solver
        .register_particle(ExternalId(1), ParticleDesc::kinematic(Vector::ZERO))
        .unwrap();
    let bob = solver
        .register_particle(ExternalId(2), ParticleDesc::dynamic(Vector::X * 2.0, 1.0))
        .unwrap();
    let joint = solver
        .register_joint(
            ExternalId(3),
            ParticleRef::new(anchor, 0),
            ParticleRef::new(bob, 0),
            0.0,
        )
        .unwrap();
    assert_eq!(solver.proxy(joint).unwrap().kind(), ProxyKind::Joint);

    for _ in 0..45 {
        solver.advance_and_dispatch(1.0 / 60.0);
        solver.for_each_dirty_proxy_since_last_pull(|_| {});
    }

    // The bob swings down like a pendulum.
    let position = solver.proxy(bob).unwrap().state().positions[0];
    assert_relative_eq!(position.length(), 2.0, epsilon = 1e-2);
    assert!(position.y < -1.0);
    assert_ne!(solver.proxy(joint).unwrap().state().force, Vector::ZERO);

    // Removing the anchor removes the joint with it.
    solver.unregister_proxy(anchor).unwrap();
    assert!(solver.proxy(joint).unwrap().is_pending_destroy());
    solver.advance_and_dispatch(1.0 / 60.0);
    solver.for_each_dirty_proxy_since_last_pull(|_| {});
    assert!(solver.proxy(joint).is_none());
    assert!(solver.proxy(bob).is_some());
}

#[test]
fn destroyed_handles_are_freed_after_the_pull() {
    let mut solver = PhysicsSolver::new(single_threaded()).unwrap();
    let id = solver
        .register_particle(ExternalId(7), ParticleDesc::dynamic(Vector::ZERO, 1.0))
        .unwrap();
    solver.advance_and_dispatch(1.0 / 30.0);
    solver.for_each_dirty_proxy_since_last_pull(|_| {});

    solver.unregister_owner(ExternalId(7)).unwrap();
    assert!(solver.proxy(id).unwrap().is_pending_destroy());
    assert_eq!(solver.proxy_of(ExternalId(7)), None);
    assert_eq!(
        solver.set_position(id, 0, Vector::ONE),
        Err(RegistrationError::PendingDestruction(id))
    );

    // The owner can register again right away, with a different handle.
    let replacement = solver
        .register_particle(ExternalId(7), ParticleDesc::dynamic(Vector::ZERO, 1.0))
        .unwrap();
    assert_ne!(replacement, id);

    // Nothing is freed until the step destroying the proxy has been pulled.
    solver.advance_and_dispatch(1.0 / 30.0);
    assert!(solver.proxy(id).is_some());
    solver.for_each_dirty_proxy_since_last_pull(|proxy| assert_ne!(proxy.id(), id));
    assert!(solver.proxy(id).is_none());
    assert_eq!(
        solver.set_position(id, 0, Vector::ONE),
        Err(RegistrationError::UnknownProxy(id))
    );
    assert_eq!(solver.registry().len(), 1);
}

#[test]
fn teleports_are_not_undone_by_older_steps() {
    let mut solver = PhysicsSolver::new(single_threaded().with_fixed_step(None)).unwrap();
    let id = solver
        .register_particle(ExternalId(1), ParticleDesc::dynamic(Vector::ZERO, 1.0))
        .unwrap();
    solver.advance_and_dispatch(1.0 / 60.0);

    // The step above already ran, but its results have not been pulled yet.
    let teleport = Vector::new(0.0, 10.0, 0.0);
    solver.set_position(id, 0, teleport).unwrap();
    assert_eq!(pull_positions(&mut solver).get(&id), None);
    assert_eq!(solver.proxy(id).unwrap().state().positions[0], teleport);

    // The next step starts from the teleported position.
    solver.advance_and_dispatch(1.0 / 60.0);
    let positions = pull_positions(&mut solver);
    let y = positions[&id][0].y;
    assert!(y < 10.0 && y > 9.9, "{y}");
}

#[test]
fn interpolated_results_trail_the_external_time() {
    let config = single_threaded()
        .with_fixed_step(Some(0.125))
        .with_gravity(Vector::ZERO)
        .with_interpolation(true);
    let mut solver = PhysicsSolver::new(config).unwrap();
    let id = solver
        .register_particle(
            ExternalId(1),
            ParticleDesc::dynamic(Vector::ZERO, 1.0).with_velocity(Vector::X),
        )
        .unwrap();

    let mut previous = 0.0;
    for frame in 0..32 {
        solver.advance_and_dispatch(0.0625);
        solver.for_each_dirty_proxy_since_last_pull(|_| {});
        let x = solver.proxy(id).unwrap().state().positions[0].x;

        assert!(x >= previous, "frame {frame}: {x} < {previous}");
        if frame > 0 {
            // The particle moves at unit speed, so its position is the results time.
            let expected = solver.results_time().max(0.0) as Scalar;
            assert_relative_eq!(x, expected, epsilon = 1e-3);
        }
        previous = x;
    }
    assert_relative_eq!(previous, 1.875, epsilon = 1e-3);
}

#[test]
fn task_pool_tokens_complete_in_order() {
    let config = SolverConfig::default()
        .with_fixed_step(None)
        .with_threading(ThreadingMode::TaskPool);
    let mut solver = PhysicsSolver::new(config).unwrap();
    let id = solver
        .register_particle(ExternalId(1), ParticleDesc::dynamic(Vector::ZERO, 1.0))
        .unwrap();

    let first = solver.advance_and_dispatch(1.0 / 60.0);
    // Dispatching again waits for the first advance.
    let second = solver.advance_and_dispatch(1.0 / 60.0);
    assert!(first.is_complete());
    assert_eq!(first.timestamp(), Timestamp(1));
    assert_eq!(second.timestamp(), Timestamp(2));

    solver.wait(&second);
    assert!(second.is_complete());
    assert!(!solver.is_in_flight());

    let positions = pull_positions(&mut solver);
    assert!(positions[&id][0].y < 0.0);
    assert_eq!(solver.producer_timestamp(), Timestamp(3));
}

#[test]
fn waiting_reclaims_a_finished_advance() {
    let config = SolverConfig::default()
        .with_fixed_step(None)
        .with_threading(ThreadingMode::TaskPool);
    let mut solver = PhysicsSolver::new(config).unwrap();
    solver
        .register_particle(ExternalId(1), ParticleDesc::dynamic(Vector::ZERO, 1.0))
        .unwrap();

    let token = solver.advance_and_dispatch(1.0 / 60.0);
    while !token.is_complete() {
        std::thread::yield_now();
    }
    solver.wait(&token);
    assert!(!solver.is_in_flight());
}

#[test]
fn kinematic_targets_are_reached_and_held() {
    let config = single_threaded().with_fixed_step(None);
    let mut solver = PhysicsSolver::new(config).unwrap();
    let (mut particles, adjacency) = folded_chain();
    for particle in &mut particles {
        particle.position.z += 1.0;
    }
    let chain = solver
        .register_cluster(ExternalId(1), particles, adjacency)
        .unwrap();
    let anchor = solver
        .register_particle(ExternalId(2), ParticleDesc::kinematic(Vector::ZERO))
        .unwrap();
    solver.advance_and_dispatch(1.0 / 60.0);
    solver.for_each_dirty_proxy_since_last_pull(|_| {});

    let target = Vector::new(1.0, 0.0, 0.0);
    solver.set_kinematic_target(anchor, 0, target).unwrap();
    solver
        .set_kinematic_target(chain, 0, Vector::new(0.0, 0.5, 1.0))
        .unwrap();

    let mut reports = Vec::new();
    for _ in 0..4 {
        solver.advance_and_dispatch(1.0 / 60.0);
        let mut reported = false;
        solver.for_each_dirty_proxy_since_last_pull(|proxy| reported |= proxy.id() == anchor);
        reports.push(reported);
    }
    // Reported for the step that moved it, then at rest.
    assert_eq!(reports, [true, false, false, false]);

    let state = solver.proxy(anchor).unwrap().state().clone();
    assert_relative_eq!(state.positions[0], target);
    assert_relative_eq!(state.velocities[0], Vector::new(60.0, 0.0, 0.0), epsilon = 1e-3);

    let (anchor_handle, chain_handle) = (
        solver.proxy(anchor).unwrap().particles()[0],
        solver.proxy(chain).unwrap().particles()[0],
    );
    let (solver_anchor, solver_chain, anchor_velocity) = solver
        .with_evolution(|evolution| {
            let particles = evolution.particles();
            (
                particles.position(anchor_handle),
                particles.position(chain_handle),
                particles.velocities[anchor_handle.slot()],
            )
        })
        .unwrap();
    assert_relative_eq!(solver_anchor.unwrap(), target);
    assert_relative_eq!(solver_chain.unwrap(), Vector::new(0.0, 0.5, 1.0));
    assert_eq!(anchor_velocity, Vector::ZERO);
}

#[test]
fn registration_errors_leave_the_world_untouched() {
    let mut solver = PhysicsSolver::new(single_threaded()).unwrap();
    let id = solver
        .register_particle(ExternalId(1), ParticleDesc::dynamic(Vector::ZERO, 1.0))
        .unwrap();

    assert_eq!(
        solver.register_particle(ExternalId(1), ParticleDesc::kinematic(Vector::ZERO)),
        Err(RegistrationError::AlreadyRegistered {
            owner: ExternalId(1),
            proxy: id
        })
    );
    assert_eq!(
        solver.register_cluster(ExternalId(2), Vec::new(), Adjacency::new()),
        Err(RegistrationError::EmptyCluster)
    );
    assert_eq!(
        solver.register_suspension(ExternalId(3), ParticleRef::new(id, 4), Vector::Y, 0.0),
        Err(RegistrationError::ParticleOutOfRange { proxy: id, index: 4 })
    );
    assert_eq!(
        solver.register_joint(
            ExternalId(4),
            ParticleRef::new(id, 0),
            ParticleRef::new(id, 0),
            0.0
        ),
        Err(RegistrationError::SelfAttachment)
    );
    assert_eq!(
        solver.set_tether_stiffness(id, 0.5),
        Err(RegistrationError::WrongKind {
            proxy: id,
            actual: ProxyKind::Particle
        })
    );

    assert_eq!(solver.registry().len(), 1);
    assert_eq!(solver.registry().particle_handle_count(), 1);
}
