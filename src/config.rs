//! Runtime configuration of the solver.
//!
//! All tuning lives in a single [`SolverConfig`] owned by the solver instance.
//! A copy of it travels with the [`Evolution`](crate::dynamics::evolution::Evolution)
//! into every advance task, so changing the configuration never races with a running step.

use thiserror::Error;

use crate::{dynamics::solver::tether::TetherMode, math::*};

/// How advance tasks are scheduled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum ThreadingMode {
    /// Every advance runs inline on the calling thread, and the call returns once all
    /// internal steps are done.
    SingleThread,
    /// Advances are spawned on the [`AsyncComputeTaskPool`](bevy::tasks::AsyncComputeTaskPool),
    /// and the call returns immediately with a [`CompletionToken`](crate::solver::CompletionToken).
    ///
    /// Without the `parallel` feature, tasks still run inline.
    #[default]
    TaskPool,
}

/// Which formulation is used to project tethers during the position iterations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum TetherSolverKind {
    /// Plain position projection. The response depends on the iteration count and time step.
    Pbd,
    /// Compliance-based projection with an accumulated Lagrange multiplier per tether.
    #[default]
    Xpbd,
}

/// Configuration for the long-range tethers built for clusters.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TetherConfig {
    /// How reference lengths are measured.
    pub mode: TetherMode,
    /// The default stiffness in `[0, 1]` of newly registered clusters.
    pub stiffness: Scalar,
    /// A multiplier applied to every reference length.
    pub limit_scale: Scalar,
    /// The tether formulation.
    pub solver: TetherSolverKind,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            mode: TetherMode::default(),
            stiffness: 1.0,
            limit_scale: 1.0,
            solver: TetherSolverKind::default(),
        }
    }
}

/// Configuration of a [`PhysicsSolver`](crate::solver::PhysicsSolver).
///
/// ```
/// use avian_async::prelude::*;
///
/// let config = SolverConfig::default()
///     .with_fixed_step(Some(1.0 / 120.0))
///     .with_position_iterations(4)
///     .with_threading(ThreadingMode::SingleThread);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SolverConfig {
    /// The number of constraint projection passes per step.
    pub position_iterations: u32,
    /// The number of rigid tether passes run after the projection passes.
    /// They correct positions without feeding into velocities.
    pub push_out_iterations: u32,
    /// Collision iteration count forwarded to collision collaborators through [`StepInfo`].
    ///
    /// [`StepInfo`]: crate::dynamics::evolution::StepInfo
    pub collision_iterations: u32,
    /// The number of times joints and suspensions are solved per projection pass.
    pub joint_iterations: u32,
    /// Broad-phase cull distance forwarded to collision collaborators.
    pub cull_distance: Scalar,
    /// The internal step size. `None` steps by the external delta time instead.
    pub fixed_step: Option<Scalar>,
    /// The maximum number of internal steps a single advance may run.
    pub max_substeps: u32,
    /// External delta times below this are accumulated instead of stepped
    /// when no fixed step is used.
    pub min_delta_time: Scalar,
    /// The largest internal step when no fixed step is used.
    pub max_delta_time: Scalar,
    /// The maximum number of islands the constraint graph is partitioned into.
    pub max_islands: usize,
    /// Tether configuration.
    pub tether: TetherConfig,
    /// Gravitational acceleration.
    pub gravity: Vector,
    /// Linear velocity damping coefficient.
    pub linear_damping: Scalar,
    /// If `true`, results are interpolated between the two pull snapshots
    /// bracketing the results time. Only used with a fixed step.
    pub interpolate_results: bool,
    /// How many fixed steps the results time lags behind the external time.
    pub interpolation_multiplier: Scalar,
    /// How advance tasks are scheduled.
    pub threading: ThreadingMode,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            position_iterations: 8,
            push_out_iterations: 1,
            collision_iterations: 4,
            joint_iterations: 1,
            cull_distance: 3.0,
            fixed_step: Some(1.0 / 60.0),
            max_substeps: 4,
            min_delta_time: 0.0,
            max_delta_time: 1.0 / 30.0,
            max_islands: 4,
            tether: TetherConfig::default(),
            gravity: Vector::new(0.0, -9.81, 0.0),
            linear_damping: 0.0,
            interpolate_results: false,
            interpolation_multiplier: 1.0,
            threading: ThreadingMode::default(),
        }
    }
}

/// An error returned by [`SolverConfig::validate`].
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigError {
    /// The fixed step is not a positive finite number.
    #[error("fixed step must be positive and finite, got {0}")]
    InvalidFixedStep(Scalar),
    /// `max_substeps` is zero.
    #[error("at least one sub-step must be allowed")]
    ZeroMaxSubsteps,
    /// `max_islands` is zero.
    #[error("at least one island must be allowed")]
    ZeroMaxIslands,
    /// The delta time clamps are inverted or not positive.
    #[error("invalid delta time range [{min}, {max}]")]
    InvalidDeltaTimeRange {
        /// The configured minimum.
        min: Scalar,
        /// The configured maximum.
        max: Scalar,
    },
    /// The tether stiffness is outside of `[0, 1]`.
    #[error("tether stiffness must be within [0, 1], got {0}")]
    InvalidStiffness(Scalar),
    /// The tether limit scale is not positive.
    #[error("tether limit scale must be positive, got {0}")]
    InvalidLimitScale(Scalar),
    /// The damping coefficient is negative.
    #[error("linear damping must not be negative, got {0}")]
    NegativeDamping(Scalar),
    /// The interpolation multiplier is negative.
    #[error("interpolation multiplier must not be negative, got {0}")]
    InvalidInterpolationMultiplier(Scalar),
    /// The cull distance is negative.
    #[error("cull distance must not be negative, got {0}")]
    NegativeCullDistance(Scalar),
}

impl SolverConfig {
    /// Checks that every setting is in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(step) = self.fixed_step {
            if !(step > 0.0 && step.is_finite()) {
                return Err(ConfigError::InvalidFixedStep(step));
            }
        }
        if self.max_substeps == 0 {
            return Err(ConfigError::ZeroMaxSubsteps);
        }
        if self.max_islands == 0 {
            return Err(ConfigError::ZeroMaxIslands);
        }
        if !(self.max_delta_time > 0.0
            && self.min_delta_time >= 0.0
            && self.min_delta_time <= self.max_delta_time)
        {
            return Err(ConfigError::InvalidDeltaTimeRange {
                min: self.min_delta_time,
                max: self.max_delta_time,
            });
        }
        if !(0.0..=1.0).contains(&self.tether.stiffness) {
            return Err(ConfigError::InvalidStiffness(self.tether.stiffness));
        }
        if !(self.tether.limit_scale > 0.0) {
            return Err(ConfigError::InvalidLimitScale(self.tether.limit_scale));
        }
        if !(self.linear_damping >= 0.0) {
            return Err(ConfigError::NegativeDamping(self.linear_damping));
        }
        if !(self.interpolation_multiplier >= 0.0) {
            return Err(ConfigError::InvalidInterpolationMultiplier(
                self.interpolation_multiplier,
            ));
        }
        if !(self.cull_distance >= 0.0) {
            return Err(ConfigError::NegativeCullDistance(self.cull_distance));
        }
        Ok(())
    }

    /// Returns `true` if results are interpolated between pull snapshots.
    #[inline]
    pub fn interpolates(&self) -> bool {
        self.interpolate_results && self.fixed_step.is_some()
    }

    /// Sets the number of position iterations.
    pub fn with_position_iterations(mut self, iterations: u32) -> Self {
        self.position_iterations = iterations;
        self
    }

    /// Sets the number of push-out iterations.
    pub fn with_push_out_iterations(mut self, iterations: u32) -> Self {
        self.push_out_iterations = iterations;
        self
    }

    /// Sets the number of joint iterations per projection pass.
    pub fn with_joint_iterations(mut self, iterations: u32) -> Self {
        self.joint_iterations = iterations;
        self
    }

    /// Sets the fixed step. `None` disables fixed stepping.
    pub fn with_fixed_step(mut self, step: Option<Scalar>) -> Self {
        self.fixed_step = step;
        self
    }

    /// Sets the maximum number of internal steps per advance.
    pub fn with_max_substeps(mut self, max_substeps: u32) -> Self {
        self.max_substeps = max_substeps;
        self
    }

    /// Sets the delta time clamps used without a fixed step.
    pub fn with_delta_time_range(mut self, min: Scalar, max: Scalar) -> Self {
        self.min_delta_time = min;
        self.max_delta_time = max;
        self
    }

    /// Sets the island bound.
    pub fn with_max_islands(mut self, max_islands: usize) -> Self {
        self.max_islands = max_islands;
        self
    }

    /// Sets the tether configuration.
    pub fn with_tether(mut self, tether: TetherConfig) -> Self {
        self.tether = tether;
        self
    }

    /// Sets the gravitational acceleration.
    pub fn with_gravity(mut self, gravity: Vector) -> Self {
        self.gravity = gravity;
        self
    }

    /// Sets the linear damping coefficient.
    pub fn with_linear_damping(mut self, damping: Scalar) -> Self {
        self.linear_damping = damping;
        self
    }

    /// Enables or disables result interpolation.
    pub fn with_interpolation(mut self, enabled: bool) -> Self {
        self.interpolate_results = enabled;
        self
    }

    /// Sets how many fixed steps the results time lags behind.
    pub fn with_interpolation_multiplier(mut self, multiplier: Scalar) -> Self {
        self.interpolation_multiplier = multiplier;
        self
    }

    /// Sets the threading mode.
    pub fn with_threading(mut self, threading: ThreadingMode) -> Self {
        self.threading = threading;
        self
    }
}
