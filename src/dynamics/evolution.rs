//! The solver-side world and its step pipeline.
//!
//! The [`Evolution`] owns the [`ParticleStore`], the constraints of every proxy, and the island
//! partition. It consumes exactly one [`PushSnapshot`] per step and answers it with one
//! [`PullSnapshot`] carrying the same timestamp.
//!
//! A step runs the following stages:
//!
//! 1. Apply the deltas of the snapshot in order. Deltas referring to unknown or stale handles are dropped.
//! 2. Rebuild tethers and islands if the topology changed.
//! 3. Run the pre-step hook.
//! 4. [Predict](predict_positions) the positions of every particle.
//! 5. Gather and solve every island, islands in parallel.
//! 6. Run the push-out passes.
//! 7. Scatter the positions back, deriving velocities from the positions before push-out.
//! 8. Run the pre-buffer hook, seal the pull snapshot, and run the post-step hook.
//!
//! A step with a zero step size only applies deltas and reports the touched proxies.

use core::fmt;
use std::collections::{BTreeMap, BTreeSet};

use bevy::{
    log::{debug, trace, warn},
    platform::time::Instant,
};

#[cfg(feature = "parallel")]
use bevy::tasks::ParallelSliceMut;

use super::{
    integrator::{predict_positions, reconcile_velocity},
    solver::{
        SolverDiagnostics,
        island_solver::IslandSolver,
        islands::{Adjacency, IslandPartition, compute_islands},
        joints::{DistanceJoint, Suspension},
        tether::{Tether, TetherConstraintSet, TetherConstraints, build_tethers},
    },
};
use crate::{
    config::SolverConfig,
    marshalling::{
        ProxyCommand, ProxyCreation, ProxyDelta, ProxyResult, PullSnapshot, PushSnapshot,
        ResultData, SnapshotReceiver, SnapshotSender, Timestamp,
    },
    math::*,
    particles::{ParticleDesc, ParticleHandle, ParticleStore},
    proxy::{ConstraintHandle, ProxyId},
};

/// Where the [`Evolution`] is in its step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EvolutionState {
    /// Between steps.
    #[default]
    Idle,
    /// Applying deltas, integrating and solving.
    Stepping { timestamp: Timestamp },
    /// Writing results and sealing the pull snapshot.
    Finalizing { timestamp: Timestamp },
}

/// Information about the current step, passed to hooks.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepInfo {
    pub timestamp: Timestamp,
    pub start_time: f64,
    pub dt: Scalar,
    /// The index of this step among the steps of one advance.
    pub step: u32,
    pub num_steps: u32,
    /// Iterations a collision hook should run per step.
    pub collision_iterations: u32,
    /// The distance beyond which a collision hook may ignore contacts.
    pub cull_distance: Scalar,
}

/// A hook run with the particle store, before the solver or before results are sealed.
pub type StepHook = Box<dyn FnMut(&StepInfo, &ParticleStore) + Send>;

/// A hook run with the sealed pull snapshot.
pub type PostStepHook = Box<dyn FnMut(&StepInfo, &PullSnapshot) + Send>;

/// User callbacks run by the [`Evolution`] during each step.
#[derive(Default)]
pub struct SolverHooks {
    pub pre_step: Option<StepHook>,
    pub pre_buffer: Option<StepHook>,
    pub post_step: Option<PostStepHook>,
}

impl fmt::Debug for SolverHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SolverHooks")
            .field("pre_step", &self.pre_step.is_some())
            .field("pre_buffer", &self.pre_buffer.is_some())
            .field("post_step", &self.post_step.is_some())
            .finish()
    }
}

/// A cluster of particles and the tethers built from its rest pose.
#[derive(Clone, Debug)]
struct ClusterData {
    particles: Vec<ParticleHandle>,
    rest_positions: Vec<Vector>,
    adjacency: Adjacency,
    stiffness: Scalar,
    /// Tethers with particle slots as indices.
    tethers: Vec<Tether>,
}

#[derive(Clone, Copy, Debug)]
struct JointData {
    handle: ConstraintHandle,
    a: ParticleHandle,
    b: ParticleHandle,
    rest_length: Scalar,
    compliance: Scalar,
}

#[derive(Clone, Copy, Debug)]
struct SuspensionData {
    handle: ConstraintHandle,
    particle: ParticleHandle,
    target: Vector,
    rest_length: Scalar,
    compliance: Scalar,
}

/// The solver-side world.
#[derive(Debug)]
pub struct Evolution {
    config: SolverConfig,
    state: EvolutionState,
    particles: ParticleStore,
    /// The particles of every particle and cluster proxy.
    particle_proxies: BTreeMap<ProxyId, Vec<ParticleHandle>>,
    clusters: BTreeMap<ProxyId, ClusterData>,
    joints: BTreeMap<ProxyId, JointData>,
    suspensions: BTreeMap<ProxyId, SuspensionData>,
    islands: IslandPartition,
    island_solvers: Vec<IslandSolver>,
    topology_dirty: bool,
    /// Forces of joints and suspensions from the last step that moved.
    constraint_forces: BTreeMap<ProxyId, Vector>,
    /// Proxies touched by the deltas of the current step.
    touched: BTreeSet<ProxyId>,
    inbox: SnapshotReceiver<PushSnapshot>,
    outbox: SnapshotSender<PullSnapshot>,
    hooks: SolverHooks,
    latest: Timestamp,
}

impl Evolution {
    /// Creates an empty world consuming push snapshots from `inbox` and sending results to `outbox`.
    pub fn new(
        config: SolverConfig,
        inbox: SnapshotReceiver<PushSnapshot>,
        outbox: SnapshotSender<PullSnapshot>,
    ) -> Self {
        Self {
            config,
            state: EvolutionState::Idle,
            particles: ParticleStore::new(),
            particle_proxies: BTreeMap::new(),
            clusters: BTreeMap::new(),
            joints: BTreeMap::new(),
            suspensions: BTreeMap::new(),
            islands: IslandPartition::default(),
            island_solvers: Vec::new(),
            topology_dirty: false,
            constraint_forces: BTreeMap::new(),
            touched: BTreeSet::new(),
            inbox,
            outbox,
            hooks: SolverHooks::default(),
            latest: Timestamp::ZERO,
        }
    }

    #[inline]
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Replaces the configuration. Islands and tethers are rebuilt before the next step.
    pub fn set_config(&mut self, config: SolverConfig) {
        self.config = config;
        self.topology_dirty = true;
    }

    #[inline]
    pub fn state(&self) -> EvolutionState {
        self.state
    }

    #[inline]
    pub fn particles(&self) -> &ParticleStore {
        &self.particles
    }

    /// Returns the current island partition, by particle slot.
    #[inline]
    pub fn islands(&self) -> &IslandPartition {
        &self.islands
    }

    #[inline]
    pub fn island_solvers(&self) -> &[IslandSolver] {
        &self.island_solvers
    }

    /// The timestamp of the last completed step.
    #[inline]
    pub fn latest_timestamp(&self) -> Timestamp {
        self.latest
    }

    #[inline]
    pub fn hooks_mut(&mut self) -> &mut SolverHooks {
        &mut self.hooks
    }

    /// Runs one step with the oldest pending push snapshot.
    ///
    /// Returns the timestamp of the step, or `None` if no snapshot was pending.
    pub fn step_next(&mut self) -> Option<Timestamp> {
        match self.inbox.try_recv() {
            Ok(Some(snapshot)) => {
                let timestamp = snapshot.timestamp;
                self.step(snapshot);
                Some(timestamp)
            }
            Ok(None) => {
                warn!("no push snapshot pending for the next step");
                None
            }
            Err(error) => {
                warn!("failed to receive a push snapshot: {error}");
                None
            }
        }
    }

    /// Runs one step with `snapshot` and sends the resulting pull snapshot.
    pub fn step(&mut self, snapshot: PushSnapshot) {
        let PushSnapshot {
            timestamp,
            start_time,
            dt,
            step,
            num_steps,
            deltas,
        } = snapshot;
        self.transition(EvolutionState::Stepping { timestamp });
        let mut diagnostics = SolverDiagnostics::default();

        let start = Instant::now();
        self.touched.clear();
        for delta in deltas {
            if !self.apply_delta(delta) {
                diagnostics.dropped_deltas += 1;
            }
        }
        diagnostics.apply_deltas = start.elapsed();

        if self.topology_dirty {
            let start = Instant::now();
            self.rebuild_topology();
            diagnostics.rebuild_islands = start.elapsed();
        }

        let info = StepInfo {
            timestamp,
            start_time,
            dt,
            step,
            num_steps,
            collision_iterations: self.config.collision_iterations,
            cull_distance: self.config.cull_distance,
        };
        if let Some(hook) = &mut self.hooks.pre_step {
            hook(&info, &self.particles);
        }

        if dt > 0.0 {
            let start = Instant::now();
            predict_positions(
                &mut self.particles,
                self.config.gravity,
                self.config.linear_damping,
                dt,
            );
            diagnostics.integrate = start.elapsed();

            let start = Instant::now();
            self.solve_islands(dt);
            diagnostics.solve_constraints = start.elapsed();

            let start = Instant::now();
            let iterations = self.config.push_out_iterations;
            for_each_island(&mut self.island_solvers, |island, parallel_tethers| {
                island.push_out(iterations, parallel_tethers);
            });
            diagnostics.push_out = start.elapsed();
        } else {
            trace!("step {timestamp} is paused");
        }

        self.transition(EvolutionState::Finalizing { timestamp });
        let start = Instant::now();
        if dt > 0.0 {
            self.scatter(dt);
        }
        let results = self.collect_results(dt > 0.0);

        if let Some(hook) = &mut self.hooks.pre_buffer {
            hook(&info, &self.particles);
        }
        self.particles.clear_step_data();

        diagnostics.island_count = self.island_solvers.len() as u32;
        diagnostics.tether_count = self
            .island_solvers
            .iter()
            .map(IslandSolver::tether_count)
            .sum::<usize>() as u32;
        diagnostics.finalize = start.elapsed();

        let pull = PullSnapshot {
            timestamp,
            start_time,
            end_time: start_time + dt as f64,
            results,
            diagnostics,
        };
        if let Some(hook) = &mut self.hooks.post_step {
            hook(&info, &pull);
        }
        if let Err(error) = self.outbox.send(pull) {
            warn!("failed to send the results of step {timestamp}: {error}");
        }

        self.latest = timestamp;
        self.transition(EvolutionState::Idle);
    }

    fn transition(&mut self, next: EvolutionState) {
        debug_assert!(
            matches!(
                (self.state, next),
                (EvolutionState::Idle, EvolutionState::Stepping { .. })
                    | (EvolutionState::Stepping { .. }, EvolutionState::Finalizing { .. })
                    | (EvolutionState::Finalizing { .. }, EvolutionState::Idle)
            ),
            "invalid evolution transition from {:?} to {next:?}",
            self.state
        );
        self.state = next;
    }

    /// Applies a delta. Returns `false` if it was dropped.
    fn apply_delta(&mut self, delta: ProxyDelta) -> bool {
        let ProxyDelta { proxy, command } = delta;
        let applied = match command {
            ProxyCommand::Create(creation) => self.create(proxy, creation),
            ProxyCommand::Destroy => self.destroy(proxy),
            ProxyCommand::SetPosition { particle, position } => self.owns(proxy, particle)
                && self.particles.set_position(particle, position),
            ProxyCommand::SetVelocity { particle, velocity } => self.owns(proxy, particle)
                && self.particles.set_velocity(particle, velocity),
            ProxyCommand::SetKinematicTarget { particle, target } => {
                self.owns(proxy, particle) && self.particles.set_kinematic_target(particle, target)
            }
            ProxyCommand::AddForce { particle, force } => {
                self.owns(proxy, particle) && self.particles.add_force(particle, force)
            }
            ProxyCommand::SetInverseMass {
                particle,
                inverse_mass,
            } => {
                if !self.owns(proxy, particle) {
                    false
                } else {
                    match self.particles.set_inverse_mass(particle, inverse_mass) {
                        Some(kind_changed) => {
                            // Anchors changed, so tethers and islands do too.
                            self.topology_dirty |= kind_changed;
                            true
                        }
                        None => false,
                    }
                }
            }
            ProxyCommand::SetTetherStiffness { stiffness } => {
                match self.clusters.get_mut(&proxy) {
                    Some(cluster) => {
                        cluster.stiffness = stiffness.clamp(0.0, 1.0);
                        for island in &mut self.island_solvers {
                            for (owner, set) in &mut island.tethers {
                                if *owner == proxy {
                                    set.set_stiffness(cluster.stiffness);
                                }
                            }
                        }
                        true
                    }
                    None => false,
                }
            }
            ProxyCommand::SetSuspensionTarget { handle, target } => {
                match self.suspensions.get_mut(&proxy) {
                    Some(data) if data.handle == handle => {
                        data.target = target;
                        for island in &mut self.island_solvers {
                            for (owner, suspension) in &mut island.suspensions {
                                if *owner == proxy {
                                    suspension.target = target;
                                }
                            }
                        }
                        true
                    }
                    _ => false,
                }
            }
            ProxyCommand::SetJointRestLength {
                handle,
                rest_length,
            } => match self.joints.get_mut(&proxy) {
                Some(data) if data.handle == handle => {
                    data.rest_length = rest_length.max(0.0);
                    for island in &mut self.island_solvers {
                        for (owner, joint) in &mut island.joints {
                            if *owner == proxy {
                                joint.rest_length = data.rest_length;
                            }
                        }
                    }
                    true
                }
                _ => false,
            },
        };

        if applied {
            self.touched.insert(proxy);
        } else {
            warn!("dropping a delta for {proxy} with an unknown or stale handle");
        }
        applied
    }

    /// Returns `true` if the live particle belongs to `proxy`.
    fn owns(&self, proxy: ProxyId, particle: ParticleHandle) -> bool {
        self.particles.owner(particle) == Some(proxy)
    }

    fn create(&mut self, proxy: ProxyId, creation: ProxyCreation) -> bool {
        if self.particle_proxies.contains_key(&proxy)
            || self.joints.contains_key(&proxy)
            || self.suspensions.contains_key(&proxy)
        {
            return false;
        }

        match creation {
            ProxyCreation::Particle { handle, particle } => {
                if !self.insert_particles(proxy, &[handle], &[particle]) {
                    return false;
                }
            }
            ProxyCreation::Cluster {
                handles,
                particles,
                adjacency,
                stiffness,
            } => {
                if handles.len() != particles.len()
                    || !self.insert_particles(proxy, &handles, &particles)
                {
                    return false;
                }
                self.clusters.insert(
                    proxy,
                    ClusterData {
                        particles: handles,
                        rest_positions: particles.iter().map(|p| p.position).collect(),
                        adjacency,
                        stiffness: stiffness.clamp(0.0, 1.0),
                        tethers: Vec::new(),
                    },
                );
            }
            ProxyCreation::Joint {
                handle,
                a,
                b,
                rest_length,
                compliance,
            } => {
                if !self.particles.contains(a) || !self.particles.contains(b) {
                    return false;
                }
                self.joints.insert(
                    proxy,
                    JointData {
                        handle,
                        a,
                        b,
                        rest_length,
                        compliance,
                    },
                );
            }
            ProxyCreation::Suspension {
                handle,
                particle,
                target,
                rest_length,
                compliance,
            } => {
                if !self.particles.contains(particle) {
                    return false;
                }
                self.suspensions.insert(
                    proxy,
                    SuspensionData {
                        handle,
                        particle,
                        target,
                        rest_length,
                        compliance,
                    },
                );
            }
        }

        self.topology_dirty = true;
        true
    }

    /// Inserts all particles of a proxy, or none of them.
    fn insert_particles(
        &mut self,
        proxy: ProxyId,
        handles: &[ParticleHandle],
        particles: &[ParticleDesc],
    ) -> bool {
        if handles
            .iter()
            .any(|handle| self.particles.is_alive(handle.slot()))
        {
            return false;
        }
        for (&handle, particle) in handles.iter().zip(particles) {
            self.particles.insert(handle, particle, proxy);
        }
        self.particle_proxies.insert(proxy, handles.to_vec());
        true
    }

    fn destroy(&mut self, proxy: ProxyId) -> bool {
        let destroyed = if let Some(handles) = self.particle_proxies.remove(&proxy) {
            for handle in handles {
                self.particles.remove(handle);
            }
            self.clusters.remove(&proxy);
            true
        } else {
            self.joints.remove(&proxy).is_some() || self.suspensions.remove(&proxy).is_some()
        };
        self.constraint_forces.remove(&proxy);
        self.topology_dirty |= destroyed;
        destroyed
    }

    /// Rebuilds the tethers of every cluster, the island partition and the island solvers.
    fn rebuild_topology(&mut self) {
        self.topology_dirty = false;
        let config = &self.config;
        let store = &self.particles;

        // Tethers are built per cluster over the rest pose and the current anchors.
        for cluster in self.clusters.values_mut() {
            if cluster.particles.iter().any(|&handle| !store.contains(handle)) {
                warn!("a cluster has destroyed particles and gets no tethers");
                cluster.tethers.clear();
                continue;
            }
            let inverse_masses: Vec<Scalar> = cluster
                .particles
                .iter()
                .map(|handle| store.inverse_masses[handle.slot()])
                .collect();
            let layout = build_tethers(
                &cluster.rest_positions,
                &inverse_masses,
                &cluster.adjacency,
                config.max_islands,
                config.tether.mode,
                config.tether.limit_scale,
            );
            let particles = &cluster.particles;
            cluster.tethers = layout
                .tethers
                .into_iter()
                .map(|tether| {
                    Tether::new(
                        particles[tether.start].slot(),
                        particles[tether.end].slot(),
                        tether.reference_length,
                    )
                })
                .collect();
        }

        // Joints attached to destroyed particles are dropped.
        self.joints.retain(|proxy, joint| {
            let alive = store.contains(joint.a) && store.contains(joint.b);
            if !alive {
                warn!("dropping {proxy}, its particles were destroyed");
            }
            alive
        });
        self.suspensions.retain(|proxy, suspension| {
            let alive = store.contains(suspension.particle);
            if !alive {
                warn!("dropping {proxy}, its particle was destroyed");
            }
            alive
        });

        // The global graph connects everything that is solved together.
        let points: BTreeSet<usize> = store.alive_slots().collect();
        let mut graph = Adjacency::new();
        let mut connect = |a: usize, b: usize| {
            graph.entry(a).or_default().insert(b);
        };
        for cluster in self.clusters.values() {
            for (&point, neighbors) in &cluster.adjacency {
                for &neighbor in neighbors {
                    connect(
                        cluster.particles[point].slot(),
                        cluster.particles[neighbor].slot(),
                    );
                }
            }
            for tether in &cluster.tethers {
                connect(tether.start, tether.end);
            }
        }
        for joint in self.joints.values() {
            connect(joint.a.slot(), joint.b.slot());
        }

        self.islands = compute_islands(
            &points,
            &graph,
            |slot| store.flags[slot].is_kinematic(),
            config.max_islands,
        );

        let mut local_index = vec![usize::MAX; store.slot_count()];
        let mut solvers: Vec<IslandSolver> = self
            .islands
            .islands
            .iter()
            .map(|island| IslandSolver::new(island.particles.clone()))
            .collect();
        for island in &self.islands.islands {
            for (local, &slot) in island.particles.iter().enumerate() {
                local_index[slot] = local;
            }
        }

        for (&proxy, cluster) in &self.clusters {
            let mut per_island: BTreeMap<usize, Vec<Tether>> = BTreeMap::new();
            for tether in &cluster.tethers {
                let Some(island) = self.islands.island_of(tether.end) else {
                    continue;
                };
                per_island.entry(island).or_default().push(Tether::new(
                    local_index[tether.start],
                    local_index[tether.end],
                    tether.reference_length,
                ));
            }
            for (island, tethers) in per_island {
                solvers[island].tethers.push((
                    proxy,
                    TetherConstraintSet::new(
                        config.tether.solver,
                        TetherConstraints::new(tethers, cluster.stiffness),
                    ),
                ));
            }
        }

        for (&proxy, joint) in &self.joints {
            let Some(island) = self.islands.island_of(joint.a.slot()) else {
                continue;
            };
            solvers[island].joints.push((
                proxy,
                DistanceJoint::new(
                    local_index[joint.a.slot()],
                    local_index[joint.b.slot()],
                    joint.rest_length,
                    joint.compliance,
                ),
            ));
        }

        for (&proxy, suspension) in &self.suspensions {
            let slot = suspension.particle.slot();
            let Some(island) = self.islands.island_of(slot) else {
                continue;
            };
            solvers[island].suspensions.push((
                proxy,
                Suspension::new(
                    local_index[slot],
                    suspension.target,
                    suspension.rest_length,
                    suspension.compliance,
                ),
            ));
        }

        debug!(
            "rebuilt {} islands over {} particles with {} tethers",
            solvers.len(),
            points.len(),
            solvers.iter().map(IslandSolver::tether_count).sum::<usize>()
        );
        self.island_solvers = solvers;
    }

    /// Gathers and solves every island.
    fn solve_islands(&mut self, dt: Scalar) {
        let store: &ParticleStore = &self.particles;
        let config: &SolverConfig = &self.config;
        for_each_island(&mut self.island_solvers, |island, parallel_tethers| {
            island.gather(store);
            island.solve(config, dt, parallel_tethers);
        });
    }

    /// Writes the solved positions back and reconciles velocities.
    fn scatter(&mut self, dt: Scalar) {
        let store = &mut self.particles;
        for island in &self.island_solvers {
            let solved = island.solved_positions();
            let positions = island.positions();
            for (local, &slot) in island.particles().iter().enumerate() {
                store.velocities[slot] = reconcile_velocity(store.positions[slot], solved[local], dt);
                store.positions[slot] = positions[local];
                store.predicted_positions[slot] = positions[local];
            }
        }

        for island in &self.island_solvers {
            self.constraint_forces.extend(island.constraint_forces(dt));
        }
    }

    /// Collects the results of every proxy that changed during the step, ordered by proxy.
    ///
    /// A moving step reports every proxy with a dynamic, moving kinematic or touched particle,
    /// and every constraint. A paused step only reports proxies touched by deltas.
    fn collect_results(&self, moved: bool) -> Vec<ProxyResult> {
        let store = &self.particles;
        let mut results = Vec::new();

        for (&proxy, handles) in &self.particle_proxies {
            let changed = self.touched.contains(&proxy)
                || handles.iter().any(|&handle| {
                    store.flags(handle).is_some_and(|flags| {
                        let moving = flags.is_dynamic()
                            || store.velocities[handle.slot()] != Vector::ZERO;
                        (moved && moving) || flags.is_dirty()
                    })
                });
            if !changed {
                continue;
            }
            let slots = handles.iter().map(|handle| handle.slot());
            results.push(ProxyResult {
                proxy,
                data: ResultData::Particles {
                    positions: slots.clone().map(|slot| store.positions[slot]).collect(),
                    velocities: slots.map(|slot| store.velocities[slot]).collect(),
                },
            });
        }

        for &proxy in self.joints.keys().chain(self.suspensions.keys()) {
            if moved || self.touched.contains(&proxy) {
                results.push(ProxyResult {
                    proxy,
                    data: ResultData::Constraint {
                        force: self
                            .constraint_forces
                            .get(&proxy)
                            .copied()
                            .unwrap_or(Vector::ZERO),
                    },
                });
            }
        }

        results.sort_by_key(|result| result.proxy);
        results
    }
}

/// Runs `f` on every island.
///
/// With several islands, islands run in parallel and `f` is told to keep tether batches serial.
/// A single island may parallelize its large tether batches instead.
fn for_each_island(
    island_solvers: &mut [IslandSolver],
    f: impl Fn(&mut IslandSolver, bool) + Send + Sync,
) {
    #[cfg(feature = "parallel")]
    if island_solvers.len() > 1 {
        let mut island_solvers = island_solvers;
        island_solvers.par_splat_map_mut(
            crate::dynamics::solver::compute_task_pool(),
            None,
            |_, chunk| {
                for island in chunk {
                    f(island, false);
                }
            },
        );
        return;
    }

    for island in island_solvers.iter_mut() {
        f(island, true);
    }
}
