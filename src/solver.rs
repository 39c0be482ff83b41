//! The producer-facing solver.
//!
//! [`PhysicsSolver`] is what the game thread talks to. It registers [proxies](crate::proxy),
//! buffers writes into push snapshots, plans steps from the frame time, dispatches an
//! [`AdvanceTask`] that owns the [`Evolution`] while it runs, and hands results back.
//!
//! ```
//! use avian_async::prelude::*;
//!
//! let config = SolverConfig::default().with_threading(ThreadingMode::SingleThread);
//! let mut solver = PhysicsSolver::new(config).unwrap();
//!
//! let ball = solver
//!     .register_particle(ExternalId(1), ParticleDesc::dynamic(Vector::ZERO, 1.0))
//!     .unwrap();
//!
//! let token = solver.advance_and_dispatch(1.0 / 60.0);
//! solver.wait(&token);
//!
//! solver.for_each_dirty_proxy_since_last_pull(|proxy| {
//!     assert_eq!(proxy.id(), ball);
//!     assert!(proxy.state().positions[0].y < 0.0);
//! });
//! ```

use core::fmt;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use bevy::{
    log::{debug, trace, warn},
    tasks::{AsyncComputeTaskPool, Task, TaskPool, block_on},
};

use crate::{
    config::{ConfigError, SolverConfig, ThreadingMode},
    dynamics::{
        evolution::{Evolution, StepInfo},
        solver::SolverDiagnostics,
    },
    marshalling::{
        MarshallingManager, ProxyCommand, ProxyDelta, PullSnapshot, ResultsManager, Timestamp,
        snapshot_channel,
    },
    math::*,
    particles::{ParticleDesc, ParticleStore},
    proxy::{
        ExternalId, ParticleRef, Proxy, ProxyDesc, ProxyId, ProxyKind, ProxyRegistry,
        RegistrationError,
    },
};

/// A handle to the completion of the steps dispatched by one advance.
#[derive(Clone, Debug)]
pub struct CompletionToken {
    target: Timestamp,
    progress: Arc<AtomicU64>,
}

impl CompletionToken {
    /// The timestamp of the last step the token waits for.
    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.target
    }

    /// Returns `true` once every step up to the target timestamp has run.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.progress.load(Ordering::Acquire) >= self.target.0
    }
}

/// Runs a number of steps on an owned [`Evolution`].
pub struct AdvanceTask {
    evolution: Box<Evolution>,
    steps: u32,
    progress: Arc<AtomicU64>,
}

impl AdvanceTask {
    /// Runs the steps and gives the evolution back.
    ///
    /// Each step consumes exactly one pending push snapshot.
    pub fn run(mut self) -> Box<Evolution> {
        for _ in 0..self.steps {
            if let Some(timestamp) = self.evolution.step_next() {
                self.progress.store(timestamp.0, Ordering::Release);
            }
        }
        self.evolution
    }
}

/// Exclusive ownership of the evolution: either here, or inside the in-flight task.
enum EvolutionSlot {
    Ready(Box<Evolution>),
    InFlight(Task<Box<Evolution>>),
    /// Only observable while an advance is being dispatched.
    Empty,
}

impl EvolutionSlot {
    /// Takes the evolution, waiting for the in-flight task if there is one.
    fn take(&mut self) -> Option<Box<Evolution>> {
        match core::mem::replace(self, Self::Empty) {
            Self::Ready(evolution) => Some(evolution),
            Self::InFlight(task) => Some(block_on(task)),
            Self::Empty => None,
        }
    }
}

/// How many steps of which size an advance runs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepPlan {
    pub num_steps: u32,
    pub dt: Scalar,
}

/// Turns frame times into steps.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepClock {
    accumulated: Scalar,
}

impl StepClock {
    /// Time carried over to the next advance.
    #[inline]
    pub fn accumulated(&self) -> Scalar {
        self.accumulated
    }

    /// Plans the steps for a frame of `dt` seconds.
    ///
    /// - Paused: one zero-length step that only applies deltas.
    /// - Fixed step: `floor(accumulated / step)` steps, capped at `max_substeps`. Excess backlog
    ///   is dropped when capped. A `dt` of zero flushes the accumulated time as one step.
    /// - Variable with `max_substeps > 1`: `ceil(dt / max_delta_time)` equal steps, capped.
    /// - Variable: one step, clamped to `max_delta_time`.
    ///
    /// In variable mode, frames shorter than `min_delta_time` are accumulated.
    pub fn plan(&mut self, config: &SolverConfig, dt: Scalar, paused: bool) -> StepPlan {
        if paused {
            return StepPlan {
                num_steps: 1,
                dt: 0.0,
            };
        }
        let dt = dt.max(0.0);

        if let Some(step) = config.fixed_step {
            if dt == 0.0 {
                let flushed = core::mem::take(&mut self.accumulated);
                return StepPlan {
                    num_steps: 1,
                    dt: flushed,
                };
            }

            self.accumulated += dt;
            let steps = (self.accumulated / step).floor() as u32;
            let num_steps = steps.min(config.max_substeps);
            if steps > num_steps {
                debug!("dropping {} fixed steps of backlog", steps - num_steps);
                self.accumulated %= step;
            } else {
                self.accumulated -= num_steps as Scalar * step;
            }
            return StepPlan {
                num_steps,
                dt: step,
            };
        }

        let total = self.accumulated + dt;
        if total < config.min_delta_time {
            self.accumulated = total;
            return StepPlan {
                num_steps: 0,
                dt: 0.0,
            };
        }
        self.accumulated = 0.0;

        if config.max_substeps > 1 {
            let steps = ((total / config.max_delta_time).ceil() as u32).max(1);
            if steps > config.max_substeps {
                debug!("frame of {total} s exceeds {} substeps", config.max_substeps);
                StepPlan {
                    num_steps: config.max_substeps,
                    dt: config.max_delta_time,
                }
            } else {
                StepPlan {
                    num_steps: steps,
                    dt: total / steps as Scalar,
                }
            }
        } else {
            StepPlan {
                num_steps: 1,
                dt: total.min(config.max_delta_time),
            }
        }
    }
}

/// The producer-facing solver.
pub struct PhysicsSolver {
    config: SolverConfig,
    registry: ProxyRegistry,
    marshalling: MarshallingManager,
    results: ResultsManager,
    evolution: EvolutionSlot,
    progress: Arc<AtomicU64>,
    clock: StepClock,
    external_time: f64,
    paused: bool,
}

impl fmt::Debug for PhysicsSolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicsSolver")
            .field("config", &self.config)
            .field("proxies", &self.registry.len())
            .field("producer_timestamp", &self.marshalling.producer_timestamp())
            .field("external_time", &self.external_time)
            .field("paused", &self.paused)
            .finish_non_exhaustive()
    }
}

impl Default for PhysicsSolver {
    fn default() -> Self {
        Self::build(SolverConfig::default())
    }
}

impl PhysicsSolver {
    /// Creates a solver with an empty world.
    pub fn new(config: SolverConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: SolverConfig) -> Self {
        let (push_sender, push_receiver) = snapshot_channel();
        let (pull_sender, pull_receiver) = snapshot_channel();
        Self {
            config,
            registry: ProxyRegistry::new(),
            marshalling: MarshallingManager::new(push_sender),
            results: ResultsManager::new(pull_receiver),
            evolution: EvolutionSlot::Ready(Box::new(Evolution::new(
                config,
                push_receiver,
                pull_sender,
            ))),
            progress: Arc::new(AtomicU64::new(0)),
            clock: StepClock::default(),
            external_time: 0.0,
            paused: false,
        }
    }

    #[inline]
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Replaces the configuration, waiting for the in-flight advance first.
    pub fn set_config(&mut self, config: SolverConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config = config;
        self.with_evolution(|evolution| evolution.set_config(config));
        Ok(())
    }

    #[inline]
    pub fn registry(&self) -> &ProxyRegistry {
        &self.registry
    }

    /// Returns the proxy if the handle is current.
    #[inline]
    pub fn proxy(&self, id: ProxyId) -> Option<&Proxy> {
        self.registry.get(id)
    }

    /// Returns the live proxy owned by an external object.
    #[inline]
    pub fn proxy_of(&self, owner: impl Into<ExternalId>) -> Option<ProxyId> {
        self.registry.proxy_of(owner.into())
    }

    /// Pauses or resumes the simulation. Paused advances only apply writes.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// The external time simulated by all dispatched steps, in seconds.
    #[inline]
    pub fn external_time(&self) -> f64 {
        self.external_time
    }

    /// Time not simulated yet.
    #[inline]
    pub fn accumulated_time(&self) -> Scalar {
        self.clock.accumulated()
    }

    /// The time results are interpolated at.
    ///
    /// It trails the external time by `interpolation_multiplier` fixed steps.
    pub fn results_time(&self) -> f64 {
        let lag = self.config.fixed_step.unwrap_or(0.0) * self.config.interpolation_multiplier;
        self.external_time + self.clock.accumulated() as f64 - lag as f64
    }

    /// The timestamp the next sealed push snapshot will carry.
    #[inline]
    pub fn producer_timestamp(&self) -> Timestamp {
        self.marshalling.producer_timestamp()
    }

    /// The diagnostics of the newest pulled step.
    #[inline]
    pub fn diagnostics(&self) -> SolverDiagnostics {
        self.results.diagnostics()
    }

    /// Registers a proxy for `owner`.
    pub fn register_proxy(
        &mut self,
        owner: impl Into<ExternalId>,
        desc: ProxyDesc,
    ) -> Result<ProxyId, RegistrationError> {
        let owner = owner.into();
        let (id, creation) = self.registry.register(
            owner,
            desc,
            self.marshalling.producer_timestamp(),
            self.config.tether.stiffness,
        )?;
        trace!("registered {id} for {owner}");
        self.marshalling
            .push(ProxyDelta::new(id, ProxyCommand::Create(creation)));
        Ok(id)
    }

    /// Registers a single particle.
    pub fn register_particle(
        &mut self,
        owner: impl Into<ExternalId>,
        particle: ParticleDesc,
    ) -> Result<ProxyId, RegistrationError> {
        self.register_proxy(owner, ProxyDesc::Particle(particle))
    }

    /// Registers a cluster with the configured tether stiffness.
    pub fn register_cluster(
        &mut self,
        owner: impl Into<ExternalId>,
        particles: Vec<ParticleDesc>,
        adjacency: crate::dynamics::solver::islands::Adjacency,
    ) -> Result<ProxyId, RegistrationError> {
        self.register_proxy(
            owner,
            ProxyDesc::Cluster {
                particles,
                adjacency,
                stiffness: None,
            },
        )
    }

    /// Registers a joint keeping the current distance between two particles.
    pub fn register_joint(
        &mut self,
        owner: impl Into<ExternalId>,
        a: ParticleRef,
        b: ParticleRef,
        compliance: Scalar,
    ) -> Result<ProxyId, RegistrationError> {
        self.register_proxy(
            owner,
            ProxyDesc::Joint {
                a,
                b,
                rest_length: None,
                compliance,
            },
        )
    }

    /// Registers a suspension keeping the current distance between a particle and `target`.
    pub fn register_suspension(
        &mut self,
        owner: impl Into<ExternalId>,
        particle: ParticleRef,
        target: Vector,
        compliance: Scalar,
    ) -> Result<ProxyId, RegistrationError> {
        self.register_proxy(
            owner,
            ProxyDesc::Suspension {
                particle,
                target,
                rest_length: None,
                compliance,
            },
        )
    }

    /// Unregisters a proxy, and every joint or suspension attached to it.
    ///
    /// The handles stay reserved until the step destroying them has been pulled.
    pub fn unregister_proxy(&mut self, id: ProxyId) -> Result<(), RegistrationError> {
        let timestamp = self.marshalling.producer_timestamp();
        for proxy in self.registry.unregister(id, timestamp)? {
            self.marshalling
                .push(ProxyDelta::new(proxy, ProxyCommand::Destroy));
        }
        Ok(())
    }

    /// Unregisters the proxy of an external object.
    pub fn unregister_owner(
        &mut self,
        owner: impl Into<ExternalId>,
    ) -> Result<(), RegistrationError> {
        let owner = owner.into();
        let id = self
            .registry
            .proxy_of(owner)
            .ok_or(RegistrationError::UnknownOwner(owner))?;
        self.unregister_proxy(id)
    }

    /// Teleports a particle.
    pub fn set_position(
        &mut self,
        id: ProxyId,
        index: usize,
        position: Vector,
    ) -> Result<(), RegistrationError> {
        let timestamp = self.marshalling.producer_timestamp();
        let (proxy, particle) = self.registry.particle_for_write(id, index, timestamp)?;
        proxy.state.positions[index] = position;
        self.marshalling
            .push(ProxyDelta::new(id, ProxyCommand::SetPosition { particle, position }));
        Ok(())
    }

    pub fn set_velocity(
        &mut self,
        id: ProxyId,
        index: usize,
        velocity: Vector,
    ) -> Result<(), RegistrationError> {
        let timestamp = self.marshalling.producer_timestamp();
        let (proxy, particle) = self.registry.particle_for_write(id, index, timestamp)?;
        proxy.state.velocities[index] = velocity;
        self.marshalling
            .push(ProxyDelta::new(id, ProxyCommand::SetVelocity { particle, velocity }));
        Ok(())
    }

    /// Moves a kinematic particle to `target` over the next step.
    pub fn set_kinematic_target(
        &mut self,
        id: ProxyId,
        index: usize,
        target: Vector,
    ) -> Result<(), RegistrationError> {
        let timestamp = self.marshalling.producer_timestamp();
        let (_, particle) = self.registry.particle_for_write(id, index, timestamp)?;
        self.marshalling.push(ProxyDelta::new(
            id,
            ProxyCommand::SetKinematicTarget { particle, target },
        ));
        Ok(())
    }

    /// Adds a force to a particle for the first step of the next advance.
    pub fn add_force(
        &mut self,
        id: ProxyId,
        index: usize,
        force: Vector,
    ) -> Result<(), RegistrationError> {
        let timestamp = self.marshalling.producer_timestamp();
        let (_, particle) = self.registry.particle_for_write(id, index, timestamp)?;
        self.marshalling
            .push(ProxyDelta::new(id, ProxyCommand::AddForce { particle, force }));
        Ok(())
    }

    /// Sets the inverse mass of a particle. Zero makes it kinematic.
    pub fn set_inverse_mass(
        &mut self,
        id: ProxyId,
        index: usize,
        inverse_mass: Scalar,
    ) -> Result<(), RegistrationError> {
        let timestamp = self.marshalling.producer_timestamp();
        let (_, particle) = self.registry.particle_for_write(id, index, timestamp)?;
        self.marshalling.push(ProxyDelta::new(
            id,
            ProxyCommand::SetInverseMass {
                particle,
                inverse_mass,
            },
        ));
        Ok(())
    }

    /// Sets the tether stiffness of a cluster.
    pub fn set_tether_stiffness(
        &mut self,
        id: ProxyId,
        stiffness: Scalar,
    ) -> Result<(), RegistrationError> {
        let timestamp = self.marshalling.producer_timestamp();
        self.registry
            .proxy_of_kind_for_write(id, ProxyKind::Cluster, timestamp)?;
        self.marshalling
            .push(ProxyDelta::new(id, ProxyCommand::SetTetherStiffness { stiffness }));
        Ok(())
    }

    /// Moves the point a suspension hangs from.
    pub fn set_suspension_target(
        &mut self,
        id: ProxyId,
        target: Vector,
    ) -> Result<(), RegistrationError> {
        let timestamp = self.marshalling.producer_timestamp();
        let proxy = self
            .registry
            .proxy_of_kind_for_write(id, ProxyKind::Suspension, timestamp)?;
        let Some(handle) = proxy.constraint() else {
            return Err(RegistrationError::UnknownProxy(id));
        };
        self.marshalling.push(ProxyDelta::new(
            id,
            ProxyCommand::SetSuspensionTarget { handle, target },
        ));
        Ok(())
    }

    pub fn set_joint_rest_length(
        &mut self,
        id: ProxyId,
        rest_length: Scalar,
    ) -> Result<(), RegistrationError> {
        let timestamp = self.marshalling.producer_timestamp();
        let proxy = self
            .registry
            .proxy_of_kind_for_write(id, ProxyKind::Joint, timestamp)?;
        let Some(handle) = proxy.constraint() else {
            return Err(RegistrationError::UnknownProxy(id));
        };
        self.marshalling.push(ProxyDelta::new(
            id,
            ProxyCommand::SetJointRestLength {
                handle,
                rest_length,
            },
        ));
        Ok(())
    }

    /// Sets the hook run after deltas are applied and before integration.
    pub fn set_pre_step_hook(
        &mut self,
        hook: impl FnMut(&StepInfo, &ParticleStore) + Send + 'static,
    ) {
        self.with_evolution(|evolution| evolution.hooks_mut().pre_step = Some(Box::new(hook)));
    }

    /// Sets the hook run after the solve and before results are sealed.
    pub fn set_pre_buffer_hook(
        &mut self,
        hook: impl FnMut(&StepInfo, &ParticleStore) + Send + 'static,
    ) {
        self.with_evolution(|evolution| evolution.hooks_mut().pre_buffer = Some(Box::new(hook)));
    }

    /// Sets the hook run with every sealed pull snapshot.
    pub fn set_post_step_hook(
        &mut self,
        hook: impl FnMut(&StepInfo, &PullSnapshot) + Send + 'static,
    ) {
        self.with_evolution(|evolution| evolution.hooks_mut().post_step = Some(Box::new(hook)));
    }

    /// Runs `f` on the evolution, waiting for the in-flight advance first.
    pub fn with_evolution<R>(&mut self, f: impl FnOnce(&mut Evolution) -> R) -> Option<R> {
        let mut evolution = self.evolution.take()?;
        let result = f(&mut evolution);
        self.evolution = EvolutionSlot::Ready(evolution);
        Some(result)
    }

    /// Plans the steps for a frame of `dt` seconds, seals them, and dispatches them.
    ///
    /// At most one advance is in flight: a previous one is waited for before dispatching.
    pub fn advance_and_dispatch(&mut self, dt: Scalar) -> CompletionToken {
        let plan = self.clock.plan(&self.config, dt, self.paused);
        let start_time = self.external_time;

        let target = match self
            .marshalling
            .seal_steps(start_time, plan.dt, plan.num_steps)
        {
            Ok(target) => target,
            Err(error) => {
                warn!("failed to seal push snapshots: {error}");
                return self.token(self.marshalling.sealed_timestamp());
            }
        };
        self.external_time += plan.dt as f64 * plan.num_steps as f64;

        if plan.num_steps == 0 {
            return self.token(target);
        }

        let Some(evolution) = self.evolution.take() else {
            warn!("no evolution to dispatch {} steps to", plan.num_steps);
            return self.token(target);
        };
        trace!(
            "dispatching {} steps of {} s up to {target}",
            plan.num_steps, plan.dt
        );

        let task = AdvanceTask {
            evolution,
            steps: plan.num_steps,
            progress: self.progress.clone(),
        };
        self.evolution = match self.config.threading {
            ThreadingMode::TaskPool if cfg!(feature = "parallel") => EvolutionSlot::InFlight(
                AsyncComputeTaskPool::get_or_init(TaskPool::default)
                    .spawn(async move { task.run() }),
            ),
            _ => EvolutionSlot::Ready(task.run()),
        };

        self.token(target)
    }

    fn token(&self, target: Timestamp) -> CompletionToken {
        CompletionToken {
            target,
            progress: self.progress.clone(),
        }
    }

    /// Waits until every step of `token` has run, and reclaims the evolution from the
    /// in-flight advance.
    ///
    /// The advance publishes its progress before it hands the evolution back, so a
    /// complete token does not mean the task has been joined.
    pub fn wait(&mut self, token: &CompletionToken) {
        self.wait_for_pending();
        if !token.is_complete() {
            warn!("steps up to {} were never run", token.timestamp());
        }
    }

    /// Waits for the in-flight advance, if any.
    pub fn wait_for_pending(&mut self) {
        if let EvolutionSlot::InFlight(_) = self.evolution {
            if let Some(evolution) = self.evolution.take() {
                self.evolution = EvolutionSlot::Ready(evolution);
            }
        }
    }

    /// Returns `true` if an advance is still running.
    pub fn is_in_flight(&self) -> bool {
        matches!(self.evolution, EvolutionSlot::InFlight(_))
    }

    /// Hands the results pulled since the last call to `callback`, then frees the handles
    /// of proxies whose destruction has been pulled.
    ///
    /// With interpolation enabled, results are blended at [`results_time`](Self::results_time).
    /// Returns the number of proxies reported.
    pub fn for_each_dirty_proxy_since_last_pull(&mut self, callback: impl FnMut(&Proxy)) -> usize {
        let reported = if self.config.interpolates() {
            let results_time = self.results_time();
            self.results
                .pull_interpolated(results_time, &mut self.registry, callback)
        } else {
            self.results.pull_sync(&mut self.registry, callback)
        };
        self.registry.collect_garbage(self.results.consumed());
        reported
    }
}
