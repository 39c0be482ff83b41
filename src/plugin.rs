//! Bevy integration.
//!
//! [`TetherSolverPlugin`] owns a [`PhysicsSolver`] as a non-send resource and drives it from
//! [`PostUpdate`]. Entities with a [`SolverParticle`] are registered as particle proxies, advanced
//! by the frame time, and have their [`Transform`] written back from the results.

use std::collections::BTreeMap;

use bevy::{
    diagnostic::{Diagnostic, DiagnosticPath, Diagnostics, RegisterDiagnostic},
    log::{error, warn},
    prelude::*,
    transform::TransformSystem,
};

use crate::{
    config::SolverConfig,
    math::*,
    particles::ParticleDesc,
    proxy::{ProxyId, ProxyKind, RegistrationError},
    solver::PhysicsSolver,
};

/// A plugin running a [`PhysicsSolver`] for entities with a [`SolverParticle`].
///
/// ```no_run
/// use avian_async::prelude::*;
/// use bevy::prelude::*;
///
/// App::new()
///     .add_plugins((MinimalPlugins, TetherSolverPlugin::new(SolverConfig::default())))
///     .add_systems(Startup, |mut commands: Commands| {
///         commands.spawn((SolverParticle::dynamic(1.0), Transform::from_xyz(0.0, 5.0, 0.0)));
///     })
///     .run();
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TetherSolverPlugin {
    pub config: SolverConfig,
}

impl TetherSolverPlugin {
    pub const fn new(config: SolverConfig) -> Self {
        Self { config }
    }
}

/// System sets of the [`TetherSolverPlugin`], run in order in [`PostUpdate`].
#[derive(SystemSet, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TetherSolverSet {
    /// Registers new particles and unregisters removed ones.
    Register,
    /// Advances the solver by the frame time.
    Advance,
    /// Writes results back to transforms.
    Writeback,
}

impl Plugin for TetherSolverPlugin {
    fn build(&self, app: &mut App) {
        let solver = PhysicsSolver::new(self.config).unwrap_or_else(|error| {
            error!("invalid solver configuration, falling back to the default: {error}");
            PhysicsSolver::default()
        });

        app.insert_non_send_resource(solver);

        for (name, _) in crate::dynamics::solver::SolverDiagnostics::default().timers() {
            app.register_diagnostic(
                Diagnostic::new(DiagnosticPath::const_new(name)).with_suffix("ms"),
            );
        }

        app.configure_sets(
            PostUpdate,
            (
                TetherSolverSet::Register,
                TetherSolverSet::Advance,
                TetherSolverSet::Writeback,
            )
                .chain()
                .before(TransformSystem::TransformPropagate),
        )
        .add_systems(
            PostUpdate,
            (
                (unregister_removed_particles, register_particles)
                    .chain()
                    .in_set(TetherSolverSet::Register),
                advance_solver.in_set(TetherSolverSet::Advance),
                (write_back_particles, record_diagnostics).in_set(TetherSolverSet::Writeback),
            ),
        );
    }
}

/// A particle simulated by the [`TetherSolverPlugin`], positioned by the entity's [`Transform`].
#[derive(Component, Clone, Copy, Debug, PartialEq)]
#[require(Transform)]
pub struct SolverParticle {
    /// The inverse mass. Zero makes the particle kinematic.
    pub inverse_mass: Scalar,
}

impl SolverParticle {
    pub const fn dynamic(inverse_mass: Scalar) -> Self {
        Self { inverse_mass }
    }

    pub const fn kinematic() -> Self {
        Self { inverse_mass: 0.0 }
    }
}

/// The proxy of a registered entity.
#[derive(Component, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SolverProxy(pub ProxyId);

fn register_particles(
    mut commands: Commands,
    mut solver: NonSendMut<PhysicsSolver>,
    query: Query<(Entity, &SolverParticle, &Transform), Without<SolverProxy>>,
) {
    for (entity, particle, transform) in &query {
        let position = transform.translation.adjust_precision();
        let desc = if particle.inverse_mass > 0.0 {
            ParticleDesc::dynamic(position, particle.inverse_mass)
        } else {
            ParticleDesc::kinematic(position)
        };
        match solver.register_particle(entity, desc) {
            Ok(id) => {
                commands.entity(entity).insert(SolverProxy(id));
            }
            Err(error) => warn!("failed to register {entity}: {error}"),
        }
    }
}

fn unregister_removed_particles(
    mut commands: Commands,
    mut solver: NonSendMut<PhysicsSolver>,
    mut removed: RemovedComponents<SolverParticle>,
) {
    for entity in removed.read() {
        match solver.unregister_owner(entity) {
            Ok(()) | Err(RegistrationError::UnknownOwner(_)) => {}
            Err(error) => warn!("failed to unregister {entity}: {error}"),
        }
        if let Ok(mut entity_commands) = commands.get_entity(entity) {
            entity_commands.remove::<SolverProxy>();
        }
    }
}

fn advance_solver(time: Res<Time>, mut solver: NonSendMut<PhysicsSolver>) {
    solver.advance_and_dispatch(time.delta_secs().adjust_precision());
}

fn write_back_particles(
    mut solver: NonSendMut<PhysicsSolver>,
    mut query: Query<(&SolverProxy, &mut Transform)>,
) {
    let mut positions = BTreeMap::new();
    solver.for_each_dirty_proxy_since_last_pull(|proxy| {
        if proxy.kind() == ProxyKind::Particle {
            if let Some(position) = proxy.state().positions.first() {
                positions.insert(proxy.id(), *position);
            }
        }
    });
    if positions.is_empty() {
        return;
    }

    for (proxy, mut transform) in &mut query {
        if let Some(position) = positions.get(&proxy.0) {
            transform.translation = position.f32();
        }
    }
}

fn record_diagnostics(solver: NonSend<PhysicsSolver>, mut diagnostics: Diagnostics) {
    for (name, duration) in solver.diagnostics().timers() {
        diagnostics.add_measurement(&DiagnosticPath::const_new(name), || {
            duration.as_secs_f64() * 1000.0
        });
    }
}
