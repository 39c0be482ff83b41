//! Timestamped snapshots exchanged between the producer and the solver.
//!
//! The producer never touches solver state directly. Every registration and write becomes a
//! [`ProxyDelta`] buffered by the [`MarshallingManager`], and every planned step seals one
//! [`PushSnapshot`] with a strictly increasing [`Timestamp`]. The solver answers each step with
//! one [`PullSnapshot`] carrying the same timestamp, which the [`ResultsManager`] hands back to
//! the producer either as-is or interpolated.

mod channel;
mod results;

pub use channel::{SnapshotReceiver, SnapshotSender, Timestamped, snapshot_channel};
pub use results::ResultsManager;

use bevy::log::trace;
use thiserror::Error;

use crate::{
    dynamics::solver::{SolverDiagnostics, islands::Adjacency},
    math::*,
    particles::{ParticleDesc, ParticleHandle},
    proxy::{ConstraintHandle, ProxyId},
};

/// The sequence number of a step.
///
/// The first sealed snapshot has timestamp 1, so [`Timestamp::ZERO`] means "before any step".
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::From,
    derive_more::Display,
)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[display("#{_0}")]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The timestamp before any step.
    pub const ZERO: Self = Self(0);

    /// Returns the timestamp following this one.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// The solver-side payload of a new proxy.
#[derive(Clone, Debug, PartialEq)]
pub enum ProxyCreation {
    /// A single particle.
    Particle {
        handle: ParticleHandle,
        particle: ParticleDesc,
    },
    /// A cluster of particles with its neighbor graph.
    Cluster {
        handles: Vec<ParticleHandle>,
        particles: Vec<ParticleDesc>,
        adjacency: Adjacency,
        stiffness: Scalar,
    },
    /// A distance joint.
    Joint {
        handle: ConstraintHandle,
        a: ParticleHandle,
        b: ParticleHandle,
        rest_length: Scalar,
        compliance: Scalar,
    },
    /// A suspension spring.
    Suspension {
        handle: ConstraintHandle,
        particle: ParticleHandle,
        target: Vector,
        rest_length: Scalar,
        compliance: Scalar,
    },
}

/// A producer write to apply at the start of a step.
#[derive(Clone, Debug, PartialEq)]
pub enum ProxyCommand {
    Create(ProxyCreation),
    Destroy,
    SetPosition {
        particle: ParticleHandle,
        position: Vector,
    },
    SetVelocity {
        particle: ParticleHandle,
        velocity: Vector,
    },
    SetKinematicTarget {
        particle: ParticleHandle,
        target: Vector,
    },
    /// Adds a force for the duration of one step.
    AddForce {
        particle: ParticleHandle,
        force: Vector,
    },
    SetInverseMass {
        particle: ParticleHandle,
        inverse_mass: Scalar,
    },
    SetTetherStiffness {
        stiffness: Scalar,
    },
    SetSuspensionTarget {
        handle: ConstraintHandle,
        target: Vector,
    },
    SetJointRestLength {
        handle: ConstraintHandle,
        rest_length: Scalar,
    },
}

/// A [`ProxyCommand`] addressed to a proxy.
#[derive(Clone, Debug, PartialEq)]
pub struct ProxyDelta {
    pub proxy: ProxyId,
    pub command: ProxyCommand,
}

impl ProxyDelta {
    /// Creates a new [`ProxyDelta`].
    pub const fn new(proxy: ProxyId, command: ProxyCommand) -> Self {
        Self { proxy, command }
    }
}

/// The input of one step.
#[derive(Clone, Debug, PartialEq)]
pub struct PushSnapshot {
    pub timestamp: Timestamp,
    /// The external time at the start of the step, in seconds.
    pub start_time: f64,
    /// The step size. Zero pauses the simulation for this step.
    pub dt: Scalar,
    /// The index of this step among the steps of one advance.
    pub step: u32,
    /// The number of steps of the advance this snapshot belongs to.
    pub num_steps: u32,
    /// Producer writes in the order they were made. Only the first step of an advance has any.
    pub deltas: Vec<ProxyDelta>,
}

/// Per-proxy output of a step.
#[derive(Clone, Debug, PartialEq)]
pub enum ResultData {
    /// Positions and velocities of a particle or cluster proxy, by particle index.
    Particles {
        positions: Vec<Vector>,
        velocities: Vec<Vector>,
    },
    /// The force applied by a joint or suspension.
    Constraint { force: Vector },
}

impl ResultData {
    /// Blends particle data linearly. Constraint data and mismatched layouts take `next`.
    pub fn lerp(&self, next: &Self, alpha: Scalar) -> Self {
        match (self, next) {
            (
                Self::Particles {
                    positions: prev_positions,
                    velocities: prev_velocities,
                },
                Self::Particles {
                    positions,
                    velocities,
                },
            ) if prev_positions.len() == positions.len()
                && prev_velocities.len() == velocities.len() =>
            {
                Self::Particles {
                    positions: prev_positions
                        .iter()
                        .zip(positions)
                        .map(|(a, b)| a.lerp(*b, alpha))
                        .collect(),
                    velocities: prev_velocities
                        .iter()
                        .zip(velocities)
                        .map(|(a, b)| a.lerp(*b, alpha))
                        .collect(),
                }
            }
            _ => next.clone(),
        }
    }
}

/// The output of a step for one proxy.
#[derive(Clone, Debug, PartialEq)]
pub struct ProxyResult {
    pub proxy: ProxyId,
    pub data: ResultData,
}

/// The output of one step.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PullSnapshot {
    /// The timestamp of the [`PushSnapshot`] this step consumed.
    pub timestamp: Timestamp,
    pub start_time: f64,
    pub end_time: f64,
    /// Results of every proxy that changed during the step, ordered by proxy.
    pub results: Vec<ProxyResult>,
    pub diagnostics: SolverDiagnostics,
}

impl Timestamped for PushSnapshot {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl Timestamped for PullSnapshot {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// An error in the snapshot exchange.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum MarshallingError {
    /// A snapshot was sent out of order.
    #[error("snapshot {timestamp} does not follow {previous}")]
    NonMonotonic {
        previous: Timestamp,
        timestamp: Timestamp,
    },
    /// The other end of the channel was dropped.
    #[error("the snapshot channel is disconnected")]
    Disconnected,
}

/// Buffers producer writes and seals them into push snapshots.
#[derive(Debug)]
pub struct MarshallingManager {
    deltas: Vec<ProxyDelta>,
    sender: SnapshotSender<PushSnapshot>,
    next_timestamp: Timestamp,
}

impl MarshallingManager {
    /// Creates a manager sealing snapshots into `sender`, starting at timestamp 1.
    pub fn new(sender: SnapshotSender<PushSnapshot>) -> Self {
        Self {
            deltas: Vec::new(),
            sender,
            next_timestamp: Timestamp::ZERO.next(),
        }
    }

    /// The timestamp the currently buffered deltas will be sealed with.
    #[inline]
    pub fn producer_timestamp(&self) -> Timestamp {
        self.next_timestamp
    }

    /// The timestamp of the last sealed snapshot.
    #[inline]
    pub fn sealed_timestamp(&self) -> Timestamp {
        Timestamp(self.next_timestamp.0 - 1)
    }

    /// Returns the number of buffered deltas.
    #[inline]
    pub fn pending_deltas(&self) -> usize {
        self.deltas.len()
    }

    /// Buffers a delta for the next snapshot.
    pub fn push(&mut self, delta: ProxyDelta) {
        self.deltas.push(delta);
    }

    /// Seals one snapshot per step and sends them.
    ///
    /// The buffered deltas go into the first snapshot. Returns the timestamp of the last
    /// sealed snapshot. With zero steps, nothing is sealed and the deltas stay buffered.
    pub fn seal_steps(
        &mut self,
        start_time: f64,
        dt: Scalar,
        num_steps: u32,
    ) -> Result<Timestamp, MarshallingError> {
        for step in 0..num_steps {
            let snapshot = PushSnapshot {
                timestamp: self.next_timestamp,
                start_time: start_time + step as f64 * dt as f64,
                dt,
                step,
                num_steps,
                deltas: if step == 0 {
                    core::mem::take(&mut self.deltas)
                } else {
                    Vec::new()
                },
            };
            trace!(
                "sealing push snapshot {} with {} deltas",
                snapshot.timestamp,
                snapshot.deltas.len()
            );
            self.sender.send(snapshot)?;
            self.next_timestamp = self.next_timestamp.next();
        }
        Ok(self.sealed_timestamp())
    }
}
