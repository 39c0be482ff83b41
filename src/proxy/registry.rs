use std::collections::{BTreeMap, BTreeSet};

use bevy::log::debug;

use super::*;
use crate::{
    data_structures::handle_pool::HandlePool,
    marshalling::ProxyCreation,
};

/// The producer-side set of all proxies, and the allocator of every solver handle.
///
/// The registry is the only place handles are allocated and freed, so the producer always knows
/// which handles exist, and the solver never has to allocate one mid-step.
#[derive(Clone, Debug, Default)]
pub struct ProxyRegistry {
    proxies: Vec<Option<Proxy>>,
    proxy_pool: HandlePool<ProxyId>,
    particle_pool: HandlePool<ParticleHandle>,
    constraint_pool: HandlePool<ConstraintHandle>,
    owners: BTreeMap<ExternalId, ProxyId>,
    /// Joints and suspensions attached to each particle-owning proxy.
    dependents: BTreeMap<ProxyId, BTreeSet<ProxyId>>,
}

impl ProxyRegistry {
    /// Creates an empty [`ProxyRegistry`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of proxies, including those pending destruction.
    pub fn len(&self) -> usize {
        self.proxy_pool.len()
    }

    /// Returns `true` if there are no proxies.
    pub fn is_empty(&self) -> bool {
        self.proxy_pool.is_empty()
    }

    /// Returns the proxy if the handle is current.
    pub fn get(&self, id: ProxyId) -> Option<&Proxy> {
        self.proxies
            .get(id.slot())
            .and_then(Option::as_ref)
            .filter(|proxy| proxy.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: ProxyId) -> Option<&mut Proxy> {
        self.proxies
            .get_mut(id.slot())
            .and_then(Option::as_mut)
            .filter(|proxy| proxy.id == id)
    }

    /// Returns the live proxy owned by an external object.
    pub fn proxy_of(&self, owner: ExternalId) -> Option<ProxyId> {
        self.owners.get(&owner).copied()
    }

    /// Iterates over all proxies in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Proxy> {
        self.proxies.iter().flatten()
    }

    /// Returns the number of allocated particle handles.
    pub fn particle_handle_count(&self) -> usize {
        self.particle_pool.len()
    }

    /// Registers a proxy for `owner`.
    ///
    /// `timestamp` is the timestamp of the push snapshot that will carry the returned creation command.
    pub(crate) fn register(
        &mut self,
        owner: ExternalId,
        desc: ProxyDesc,
        timestamp: Timestamp,
        default_stiffness: Scalar,
    ) -> Result<(ProxyId, ProxyCreation), RegistrationError> {
        if let Some(&proxy) = self.owners.get(&owner) {
            return Err(RegistrationError::AlreadyRegistered { owner, proxy });
        }

        // Validate everything before allocating any handle.
        let kind = desc.kind();
        let mut attached_to = Vec::new();
        let mut attached_particles = Vec::new();
        let mut state = ProxyState::default();

        let pending = match desc {
            ProxyDesc::Particle(particle) => {
                state.positions.push(particle.position);
                state.velocities.push(particle.velocity);
                PendingCreation::Particles {
                    particles: vec![particle],
                    adjacency: None,
                    stiffness: default_stiffness,
                }
            }
            ProxyDesc::Cluster {
                particles,
                adjacency,
                stiffness,
            } => {
                if particles.is_empty() {
                    return Err(RegistrationError::EmptyCluster);
                }
                let len = particles.len();
                let out_of_range = adjacency
                    .iter()
                    .flat_map(|(&point, neighbors)| {
                        core::iter::once(point).chain(neighbors.iter().copied())
                    })
                    .find(|&index| index >= len);
                if let Some(index) = out_of_range {
                    return Err(RegistrationError::InvalidAdjacency { index, len });
                }
                state.positions = particles.iter().map(|p| p.position).collect();
                state.velocities = particles.iter().map(|p| p.velocity).collect();
                PendingCreation::Particles {
                    particles,
                    adjacency: Some(adjacency),
                    stiffness: stiffness.unwrap_or(default_stiffness).clamp(0.0, 1.0),
                }
            }
            ProxyDesc::Joint {
                a,
                b,
                rest_length,
                compliance,
            } => {
                let (handle_a, position_a) = self.resolve(a)?;
                let (handle_b, position_b) = self.resolve(b)?;
                if handle_a == handle_b {
                    return Err(RegistrationError::SelfAttachment);
                }
                attached_to.extend([a.proxy, b.proxy]);
                attached_particles.extend([handle_a, handle_b]);
                PendingCreation::Joint {
                    a: handle_a,
                    b: handle_b,
                    rest_length: rest_length.unwrap_or_else(|| position_a.distance(position_b)),
                    compliance: compliance.max(0.0),
                }
            }
            ProxyDesc::Suspension {
                particle,
                target,
                rest_length,
                compliance,
            } => {
                let (handle, position) = self.resolve(particle)?;
                attached_to.push(particle.proxy);
                attached_particles.push(handle);
                PendingCreation::Suspension {
                    particle: handle,
                    target,
                    rest_length: rest_length.unwrap_or_else(|| position.distance(target)),
                    compliance: compliance.max(0.0),
                }
            }
        };

        let id = self.proxy_pool.alloc();
        let (particles, constraint, creation) = match pending {
            PendingCreation::Particles {
                particles,
                adjacency,
                stiffness,
            } => {
                let handles: Vec<ParticleHandle> =
                    particles.iter().map(|_| self.particle_pool.alloc()).collect();
                let creation = match adjacency {
                    None => ProxyCreation::Particle {
                        handle: handles[0],
                        particle: particles[0],
                    },
                    Some(adjacency) => ProxyCreation::Cluster {
                        handles: handles.clone(),
                        particles,
                        adjacency,
                        stiffness,
                    },
                };
                (handles, None, creation)
            }
            PendingCreation::Joint {
                a,
                b,
                rest_length,
                compliance,
            } => {
                let handle = self.constraint_pool.alloc();
                let creation = ProxyCreation::Joint {
                    handle,
                    a,
                    b,
                    rest_length,
                    compliance,
                };
                (attached_particles, Some(handle), creation)
            }
            PendingCreation::Suspension {
                particle,
                target,
                rest_length,
                compliance,
            } => {
                let handle = self.constraint_pool.alloc();
                let creation = ProxyCreation::Suspension {
                    handle,
                    particle,
                    target,
                    rest_length,
                    compliance,
                };
                (attached_particles, Some(handle), creation)
            }
        };

        for &parent in &attached_to {
            self.dependents.entry(parent).or_default().insert(id);
        }

        let slot = id.slot();
        if slot >= self.proxies.len() {
            self.proxies.resize_with(slot + 1, || None);
        }
        self.proxies[slot] = Some(Proxy {
            id,
            owner,
            kind,
            particles,
            constraint,
            attached_to,
            state,
            sync_timestamp: timestamp,
            pending_destroy: None,
        });
        self.owners.insert(owner, id);

        Ok((id, creation))
    }

    /// Marks a proxy and every joint or suspension attached to it for destruction.
    ///
    /// Returns the proxies to destroy, dependents first.
    pub(crate) fn unregister(
        &mut self,
        id: ProxyId,
        timestamp: Timestamp,
    ) -> Result<Vec<ProxyId>, RegistrationError> {
        let proxy = self.get(id).ok_or(RegistrationError::UnknownProxy(id))?;
        if proxy.is_pending_destroy() {
            return Err(RegistrationError::PendingDestruction(id));
        }

        let mut destroyed: Vec<ProxyId> = self
            .dependents
            .remove(&id)
            .unwrap_or_default()
            .into_iter()
            .filter(|&dependent| self.get(dependent).is_some_and(|p| !p.is_pending_destroy()))
            .collect();
        destroyed.push(id);

        for &proxy_id in &destroyed {
            let Some(proxy) = self.get_mut(proxy_id) else {
                continue;
            };
            proxy.pending_destroy = Some(timestamp);
            let owner = proxy.owner;
            let attached_to = proxy.attached_to.clone();

            self.owners.remove(&owner);
            for parent in attached_to {
                if let Some(set) = self.dependents.get_mut(&parent) {
                    set.remove(&proxy_id);
                }
            }
        }

        if destroyed.len() > 1 {
            debug!(
                "unregistering {id} also unregisters {} attached constraints",
                destroyed.len() - 1
            );
        }

        Ok(destroyed)
    }

    /// Frees the handles of every proxy destroyed by a snapshot no newer than `consumed`.
    ///
    /// Returns the number of proxies freed.
    pub(crate) fn collect_garbage(&mut self, consumed: Timestamp) -> usize {
        let mut freed = 0;
        for slot in self.proxies.iter_mut() {
            let Some(proxy) = slot else {
                continue;
            };
            if !proxy.pending_destroy.is_some_and(|destroy| destroy <= consumed) {
                continue;
            }

            if proxy.kind.owns_particles() {
                for &handle in &proxy.particles {
                    self.particle_pool.free(handle);
                }
            }
            if let Some(handle) = proxy.constraint {
                self.constraint_pool.free(handle);
            }
            self.proxy_pool.free(proxy.id);
            self.dependents.remove(&proxy.id);
            *slot = None;
            freed += 1;
        }

        if freed > 0 {
            debug!("freed the handles of {freed} destroyed proxies");
        }
        freed
    }

    /// Returns a live proxy for a producer write, stamped with `timestamp`.
    pub(crate) fn proxy_for_write(
        &mut self,
        id: ProxyId,
        timestamp: Timestamp,
    ) -> Result<&mut Proxy, RegistrationError> {
        let proxy = self
            .get_mut(id)
            .ok_or(RegistrationError::UnknownProxy(id))?;
        if proxy.is_pending_destroy() {
            return Err(RegistrationError::PendingDestruction(id));
        }
        proxy.sync_timestamp = proxy.sync_timestamp.max(timestamp);
        Ok(proxy)
    }

    /// Returns a live proxy of `kind` for a producer write, stamped with `timestamp`.
    pub(crate) fn proxy_of_kind_for_write(
        &mut self,
        id: ProxyId,
        kind: ProxyKind,
        timestamp: Timestamp,
    ) -> Result<&mut Proxy, RegistrationError> {
        let actual = self
            .get(id)
            .ok_or(RegistrationError::UnknownProxy(id))?
            .kind;
        if actual != kind {
            return Err(RegistrationError::WrongKind { proxy: id, actual });
        }
        self.proxy_for_write(id, timestamp)
    }

    /// Returns the handle of a particle for a producer write, stamping the proxy with `timestamp`.
    pub(crate) fn particle_for_write(
        &mut self,
        id: ProxyId,
        index: usize,
        timestamp: Timestamp,
    ) -> Result<(&mut Proxy, ParticleHandle), RegistrationError> {
        let proxy = self
            .get(id)
            .ok_or(RegistrationError::UnknownProxy(id))?;
        if !proxy.kind.owns_particles() {
            return Err(RegistrationError::WrongKind {
                proxy: id,
                actual: proxy.kind,
            });
        }
        let handle = *proxy
            .particles
            .get(index)
            .ok_or(RegistrationError::ParticleOutOfRange { proxy: id, index })?;
        let proxy = self.proxy_for_write(id, timestamp)?;
        Ok((proxy, handle))
    }

    /// Resolves a particle reference to its handle and the producer's view of its position.
    fn resolve(&self, particle: ParticleRef) -> Result<(ParticleHandle, Vector), RegistrationError> {
        let proxy = self
            .get(particle.proxy)
            .ok_or(RegistrationError::UnknownProxy(particle.proxy))?;
        if proxy.is_pending_destroy() {
            return Err(RegistrationError::PendingDestruction(particle.proxy));
        }
        if !proxy.kind.owns_particles() {
            return Err(RegistrationError::WrongKind {
                proxy: particle.proxy,
                actual: proxy.kind,
            });
        }
        let out_of_range = RegistrationError::ParticleOutOfRange {
            proxy: particle.proxy,
            index: particle.index,
        };
        let handle = *proxy.particles.get(particle.index).ok_or(out_of_range.clone())?;
        let position = *proxy.state.positions.get(particle.index).ok_or(out_of_range)?;
        Ok((handle, position))
    }
}

/// A validated registration whose handles are not allocated yet.
enum PendingCreation {
    Particles {
        particles: Vec<ParticleDesc>,
        adjacency: Option<Adjacency>,
        stiffness: Scalar,
    },
    Joint {
        a: ParticleHandle,
        b: ParticleHandle,
        rest_length: Scalar,
        compliance: Scalar,
    },
    Suspension {
        particle: ParticleHandle,
        target: Vector,
        rest_length: Scalar,
        compliance: Scalar,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(value: u64) -> Timestamp {
        Timestamp::from(value)
    }

    fn particle(registry: &mut ProxyRegistry, owner: u64, x: Scalar) -> ProxyId {
        registry
            .register(
                ExternalId(owner),
                ProxyDesc::Particle(ParticleDesc::dynamic(Vector::new(x, 0.0, 0.0), 1.0)),
                ts(1),
                1.0,
            )
            .unwrap()
            .0
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ProxyRegistry::new();
        let id = particle(&mut registry, 7, 0.0);
        let error = registry
            .register(
                ExternalId(7),
                ProxyDesc::Particle(ParticleDesc::kinematic(Vector::ZERO)),
                ts(1),
                1.0,
            )
            .unwrap_err();
        assert_eq!(
            error,
            RegistrationError::AlreadyRegistered {
                owner: ExternalId(7),
                proxy: id
            }
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn invalid_cluster_is_rejected_without_allocating() {
        let mut registry = ProxyRegistry::new();
        let mut adjacency = Adjacency::new();
        adjacency.entry(0).or_default().insert(3);
        let error = registry
            .register(
                ExternalId(1),
                ProxyDesc::Cluster {
                    particles: vec![ParticleDesc::kinematic(Vector::ZERO); 2],
                    adjacency,
                    stiffness: None,
                },
                ts(1),
                1.0,
            )
            .unwrap_err();
        assert_eq!(error, RegistrationError::InvalidAdjacency { index: 3, len: 2 });
        assert!(registry.is_empty());
        assert_eq!(registry.particle_handle_count(), 0);
    }

    #[test]
    fn joint_rest_length_defaults_to_current_distance() {
        let mut registry = ProxyRegistry::new();
        let a = particle(&mut registry, 1, 0.0);
        let b = particle(&mut registry, 2, 3.0);
        let (_, creation) = registry
            .register(
                ExternalId(3),
                ProxyDesc::Joint {
                    a: ParticleRef::new(a, 0),
                    b: ParticleRef::new(b, 0),
                    rest_length: None,
                    compliance: 0.0,
                },
                ts(1),
                1.0,
            )
            .unwrap();
        let ProxyCreation::Joint { rest_length, .. } = creation else {
            panic!("expected a joint creation, got {creation:?}");
        };
        assert_eq!(rest_length, 3.0);
    }

    #[test]
    fn unregister_cascades_and_defers_freeing() {
        let mut registry = ProxyRegistry::new();
        let a = particle(&mut registry, 1, 0.0);
        let b = particle(&mut registry, 2, 1.0);
        let (joint, _) = registry
            .register(
                ExternalId(3),
                ProxyDesc::Joint {
                    a: ParticleRef::new(a, 0),
                    b: ParticleRef::new(b, 0),
                    rest_length: None,
                    compliance: 0.0,
                },
                ts(1),
                1.0,
            )
            .unwrap();

        let destroyed = registry.unregister(a, ts(4)).unwrap();
        assert_eq!(destroyed, vec![joint, a]);
        assert_eq!(
            registry.unregister(joint, ts(4)),
            Err(RegistrationError::PendingDestruction(joint))
        );
        assert_eq!(registry.proxy_of(ExternalId(1)), None);

        // The destroy snapshot has not been consumed yet.
        assert_eq!(registry.collect_garbage(ts(3)), 0);
        assert!(registry.get(a).is_some());
        assert_eq!(registry.particle_handle_count(), 2);

        assert_eq!(registry.collect_garbage(ts(4)), 2);
        assert!(registry.get(a).is_none());
        assert_eq!(registry.particle_handle_count(), 1);

        // The freed slot is reused with a new generation.
        let c = particle(&mut registry, 1, 0.0);
        assert_eq!(c.slot(), joint.slot().min(a.slot()));
        assert!(registry.get(a).is_none() || c != a);
    }

    #[test]
    fn writes_stamp_the_proxy() {
        let mut registry = ProxyRegistry::new();
        let a = particle(&mut registry, 1, 0.0);
        let (proxy, _) = registry.particle_for_write(a, 0, ts(9)).unwrap();
        assert_eq!(proxy.sync_timestamp(), ts(9));
        assert_eq!(
            registry.particle_for_write(a, 1, ts(9)).unwrap_err(),
            RegistrationError::ParticleOutOfRange { proxy: a, index: 1 }
        );
    }
}
