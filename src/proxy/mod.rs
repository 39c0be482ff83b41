//! The producer-side proxy layer.
//!
//! Every external object (identified by an [`ExternalId`], usually a Bevy [`Entity`]) that takes
//! part in the simulation owns exactly one [`Proxy`]. A proxy owns the generational
//! [particle handles](ParticleHandle) of its particles, or a [`ConstraintHandle`] for joints and
//! suspensions, together with the producer's own view of the proxy's state.
//!
//! Proxies are created immediately on registration, and the command creating their solver-side
//! counterpart is buffered into the next push snapshot. Unregistering a proxy only marks it
//! for destruction: its handles are freed once a pull snapshot at least as new as the
//! destroy command has been consumed, so no snapshot still in flight can refer to a reused handle.

mod registry;

pub use registry::ProxyRegistry;

use bevy::ecs::entity::Entity;
use thiserror::Error;

use crate::{
    data_structures::handle_pool::impl_pool_handle,
    dynamics::solver::islands::Adjacency,
    marshalling::Timestamp,
    math::*,
    particles::{ParticleDesc, ParticleHandle},
};

/// A generational handle to a [`Proxy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[display("Proxy({index}v{generation})")]
pub struct ProxyId {
    index: u32,
    generation: u32,
}

impl_pool_handle!(ProxyId);

/// A generational handle to a joint or suspension in the solver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[display("Constraint({index}v{generation})")]
pub struct ConstraintHandle {
    index: u32,
    generation: u32,
}

impl_pool_handle!(ConstraintHandle);

/// A stable identity of an object outside of the solver.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::From, derive_more::Display,
)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[display("External({_0})")]
pub struct ExternalId(pub u64);

impl From<Entity> for ExternalId {
    fn from(entity: Entity) -> Self {
        Self(entity.to_bits())
    }
}

/// What a [`Proxy`] represents in the solver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    /// A single particle.
    Particle,
    /// A set of particles connected by a neighbor graph and held by tethers, like a piece of cloth.
    Cluster,
    /// A distance joint between two particles.
    Joint,
    /// A spring between a particle and a point in world space.
    Suspension,
}

impl ProxyKind {
    /// Returns `true` if the proxy owns particles.
    #[inline]
    pub fn owns_particles(self) -> bool {
        matches!(self, Self::Particle | Self::Cluster)
    }

    /// Returns `true` if the proxy owns a constraint.
    #[inline]
    pub fn is_constraint(self) -> bool {
        !self.owns_particles()
    }
}

/// A particle of a particle or cluster proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ParticleRef {
    /// The proxy owning the particle.
    pub proxy: ProxyId,
    /// The index of the particle within the proxy.
    pub index: usize,
}

impl ParticleRef {
    /// Creates a new [`ParticleRef`].
    pub const fn new(proxy: ProxyId, index: usize) -> Self {
        Self { proxy, index }
    }
}

/// A description of a proxy to register.
#[derive(Clone, Debug, PartialEq)]
pub enum ProxyDesc {
    /// A single particle.
    Particle(ParticleDesc),
    /// A cluster of particles.
    Cluster {
        /// The particles, in their rest pose.
        particles: Vec<ParticleDesc>,
        /// Neighbors by particle index within the cluster.
        adjacency: Adjacency,
        /// The tether stiffness. Defaults to the configured stiffness.
        stiffness: Option<Scalar>,
    },
    /// A distance joint between two particles.
    Joint {
        /// The first particle.
        a: ParticleRef,
        /// The second particle.
        b: ParticleRef,
        /// The rest length. Defaults to the current distance between the particles.
        rest_length: Option<Scalar>,
        /// The inverse of stiffness. Zero is rigid.
        compliance: Scalar,
    },
    /// A spring between a particle and a point in world space.
    Suspension {
        /// The suspended particle.
        particle: ParticleRef,
        /// The point the particle hangs from.
        target: Vector,
        /// The rest length. Defaults to the current distance to the target.
        rest_length: Option<Scalar>,
        /// The inverse of stiffness. Zero is rigid.
        compliance: Scalar,
    },
}

impl ProxyDesc {
    /// Returns the kind of proxy the description creates.
    pub fn kind(&self) -> ProxyKind {
        match self {
            Self::Particle(_) => ProxyKind::Particle,
            Self::Cluster { .. } => ProxyKind::Cluster,
            Self::Joint { .. } => ProxyKind::Joint,
            Self::Suspension { .. } => ProxyKind::Suspension,
        }
    }
}

/// The producer's view of a proxy's state.
///
/// It is updated by producer writes immediately, and by results when they are pulled.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProxyState {
    /// Particle positions, by particle index within the proxy.
    pub positions: Vec<Vector>,
    /// Particle velocities, by particle index within the proxy.
    pub velocities: Vec<Vector>,
    /// The force applied by a joint or suspension during the last reported step.
    pub force: Vector,
}

/// The producer-side record of one external object in the solver.
#[derive(Clone, Debug, PartialEq)]
pub struct Proxy {
    id: ProxyId,
    owner: ExternalId,
    kind: ProxyKind,
    particles: Vec<ParticleHandle>,
    constraint: Option<ConstraintHandle>,
    attached_to: Vec<ProxyId>,
    pub(crate) state: ProxyState,
    pub(crate) sync_timestamp: Timestamp,
    pending_destroy: Option<Timestamp>,
}

impl Proxy {
    /// Returns the handle of the proxy.
    #[inline]
    pub fn id(&self) -> ProxyId {
        self.id
    }

    /// Returns the external object owning the proxy.
    #[inline]
    pub fn owner(&self) -> ExternalId {
        self.owner
    }

    /// Returns the kind of the proxy.
    #[inline]
    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    /// Returns the particles of the proxy.
    ///
    /// For joints and suspensions, these are the attached particles owned by other proxies.
    #[inline]
    pub fn particles(&self) -> &[ParticleHandle] {
        &self.particles
    }

    /// Returns the constraint handle of a joint or suspension.
    #[inline]
    pub fn constraint(&self) -> Option<ConstraintHandle> {
        self.constraint
    }

    /// Returns the proxies whose particles a joint or suspension is attached to.
    #[inline]
    pub fn attached_to(&self) -> &[ProxyId] {
        &self.attached_to
    }

    /// Returns the producer's view of the proxy's state.
    #[inline]
    pub fn state(&self) -> &ProxyState {
        &self.state
    }

    /// Returns the timestamp of the snapshot carrying the latest producer write to the proxy.
    ///
    /// Results from steps older than this are stale for this proxy.
    #[inline]
    pub fn sync_timestamp(&self) -> Timestamp {
        self.sync_timestamp
    }

    /// Returns the timestamp of the snapshot destroying the proxy, if it was unregistered.
    #[inline]
    pub fn pending_destroy(&self) -> Option<Timestamp> {
        self.pending_destroy
    }

    /// Returns `true` if the proxy was unregistered.
    #[inline]
    pub fn is_pending_destroy(&self) -> bool {
        self.pending_destroy.is_some()
    }
}

/// An error returned by proxy registration and producer writes.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RegistrationError {
    /// The external object already owns a proxy.
    #[error("{owner} already owns {proxy}")]
    AlreadyRegistered {
        /// The external object.
        owner: ExternalId,
        /// Its existing proxy.
        proxy: ProxyId,
    },
    /// The proxy does not exist, or the handle is stale.
    #[error("{0} does not exist")]
    UnknownProxy(ProxyId),
    /// The external object owns no proxy.
    #[error("{0} owns no proxy")]
    UnknownOwner(ExternalId),
    /// The proxy was unregistered and is waiting to be destroyed.
    #[error("{0} is pending destruction")]
    PendingDestruction(ProxyId),
    /// The operation does not apply to this kind of proxy.
    #[error("{proxy} is a {actual:?} proxy")]
    WrongKind {
        /// The proxy.
        proxy: ProxyId,
        /// Its kind.
        actual: ProxyKind,
    },
    /// A cluster was registered without particles.
    #[error("a cluster needs at least one particle")]
    EmptyCluster,
    /// The adjacency of a cluster refers to a particle it does not have.
    #[error("adjacency refers to particle {index} of a cluster with {len} particles")]
    InvalidAdjacency {
        /// The offending index.
        index: usize,
        /// The number of particles in the cluster.
        len: usize,
    },
    /// The particle index is out of range for the proxy.
    #[error("{proxy} has no particle {index}")]
    ParticleOutOfRange {
        /// The proxy.
        proxy: ProxyId,
        /// The offending index.
        index: usize,
    },
    /// A joint was attached to the same particle twice.
    #[error("a joint cannot connect a particle to itself")]
    SelfAttachment,
}
