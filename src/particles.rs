//! The solver-side [`ParticleStore`] and the [`ParticleHandle`]s addressing it.
//!
//! Particles are stored as a structure of arrays indexed by the slot of their handle.
//! A slot is only valid while it is alive and its generation matches the handle's,
//! so a stale handle never resolves to a newer occupant of the same slot.

use crate::{
    data_structures::handle_pool::impl_pool_handle,
    math::{RecipOrZero, Scalar, Vector},
    proxy::ProxyId,
};

/// A generational handle to a particle in a [`ParticleStore`].
///
/// Handles are allocated by the producer when a proxy is registered and materialized
/// in the solver once the snapshot carrying the creation command is consumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[display("{index}v{generation}")]
pub struct ParticleHandle {
    index: u32,
    generation: u32,
}

impl_pool_handle!(ParticleHandle);

/// Flags describing the state of a particle slot.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ParticleFlags(u8);

bitflags::bitflags! {
    impl ParticleFlags: u8 {
        /// Set if the slot holds a live particle.
        const ALIVE = 1 << 0;
        /// Set if the particle has zero inverse mass and is not moved by constraints.
        const KINEMATIC = 1 << 1;
        /// Set if the producer wrote to the particle since the last step.
        const DIRTY = 1 << 2;
    }
}

impl ParticleFlags {
    /// Returns `true` if the particle is kinematic.
    #[inline]
    pub fn is_kinematic(&self) -> bool {
        self.contains(ParticleFlags::KINEMATIC)
    }

    /// Returns `true` if the particle is dynamic.
    #[inline]
    pub fn is_dynamic(&self) -> bool {
        !self.is_kinematic()
    }

    /// Returns `true` if the producer wrote to the particle since the last step.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.contains(ParticleFlags::DIRTY)
    }
}

/// The initial state of a particle.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ParticleDesc {
    /// The initial position. For clusters, this is also the rest pose used to build tethers.
    pub position: Vector,
    /// The initial velocity.
    pub velocity: Vector,
    /// The inverse mass. Zero makes the particle kinematic.
    pub inverse_mass: Scalar,
}

impl ParticleDesc {
    /// Creates a dynamic particle with the given position and inverse mass.
    pub const fn dynamic(position: Vector, inverse_mass: Scalar) -> Self {
        Self {
            position,
            velocity: Vector::ZERO,
            inverse_mass,
        }
    }

    /// Creates a kinematic particle at the given position.
    pub const fn kinematic(position: Vector) -> Self {
        Self {
            position,
            velocity: Vector::ZERO,
            inverse_mass: 0.0,
        }
    }

    /// Creates a particle with the given position and mass. A zero mass makes it kinematic.
    pub fn from_mass(position: Vector, mass: Scalar) -> Self {
        Self::dynamic(position, mass.recip_or_zero())
    }

    /// Sets the initial velocity.
    pub const fn with_velocity(mut self, velocity: Vector) -> Self {
        self.velocity = velocity;
        self
    }

    /// Returns `true` if the particle is kinematic.
    pub fn is_kinematic(&self) -> bool {
        self.inverse_mass == 0.0
    }
}

/// Structure-of-arrays storage for every particle simulated by the solver.
///
/// The store is exclusively owned by the [`Evolution`](crate::dynamics::evolution::Evolution),
/// and is only mutated by the step that currently owns it.
#[derive(Clone, Debug, Default)]
pub struct ParticleStore {
    pub(crate) positions: Vec<Vector>,
    pub(crate) predicted_positions: Vec<Vector>,
    pub(crate) velocities: Vec<Vector>,
    pub(crate) inverse_masses: Vec<Scalar>,
    /// External forces accumulated for the next step.
    pub(crate) forces: Vec<Vector>,
    /// Where kinematic particles should be at the end of the next step.
    pub(crate) kinematic_targets: Vec<Option<Vector>>,
    pub(crate) owners: Vec<Option<ProxyId>>,
    pub(crate) flags: Vec<ParticleFlags>,
    generations: Vec<u32>,
    alive_count: usize,
}

impl ParticleStore {
    /// Creates an empty [`ParticleStore`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live particles.
    #[inline]
    pub fn len(&self) -> usize {
        self.alive_count
    }

    /// Returns `true` if there are no live particles.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.alive_count == 0
    }

    /// Returns the number of slots, including dead ones.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.flags.len()
    }

    /// Returns `true` if the handle refers to a live particle.
    #[inline]
    pub fn contains(&self, handle: ParticleHandle) -> bool {
        let slot = handle.slot();
        self.flags
            .get(slot)
            .is_some_and(|flags| flags.contains(ParticleFlags::ALIVE))
            && self.generations[slot] == handle.generation
    }

    /// Returns `true` if the slot holds a live particle.
    #[inline]
    pub fn is_alive(&self, slot: usize) -> bool {
        self.flags
            .get(slot)
            .is_some_and(|flags| flags.contains(ParticleFlags::ALIVE))
    }

    /// Returns the handle of the live particle in `slot`.
    pub fn handle_at(&self, slot: usize) -> Option<ParticleHandle> {
        self.is_alive(slot).then(|| ParticleHandle {
            index: slot as u32,
            generation: self.generations[slot],
        })
    }

    /// Iterates over the slots of all live particles in ascending order.
    pub fn alive_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.flags
            .iter()
            .enumerate()
            .filter(|(_, flags)| flags.contains(ParticleFlags::ALIVE))
            .map(|(slot, _)| slot)
    }

    /// Inserts a particle into the slot of `handle`.
    ///
    /// Returns `false` if the slot is already occupied by a live particle.
    pub(crate) fn insert(
        &mut self,
        handle: ParticleHandle,
        desc: &ParticleDesc,
        owner: ProxyId,
    ) -> bool {
        let slot = handle.slot();
        if self.is_alive(slot) {
            return false;
        }

        if slot >= self.flags.len() {
            let new_len = slot + 1;
            self.positions.resize(new_len, Vector::ZERO);
            self.predicted_positions.resize(new_len, Vector::ZERO);
            self.velocities.resize(new_len, Vector::ZERO);
            self.inverse_masses.resize(new_len, 0.0);
            self.forces.resize(new_len, Vector::ZERO);
            self.kinematic_targets.resize(new_len, None);
            self.owners.resize(new_len, None);
            self.flags.resize(new_len, ParticleFlags::empty());
            self.generations.resize(new_len, 0);
        }

        let inverse_mass = desc.inverse_mass.max(0.0);
        self.positions[slot] = desc.position;
        self.predicted_positions[slot] = desc.position;
        self.velocities[slot] = desc.velocity;
        self.inverse_masses[slot] = inverse_mass;
        self.forces[slot] = Vector::ZERO;
        self.kinematic_targets[slot] = None;
        self.owners[slot] = Some(owner);
        self.generations[slot] = handle.generation;

        let mut flags = ParticleFlags::ALIVE | ParticleFlags::DIRTY;
        flags.set(ParticleFlags::KINEMATIC, inverse_mass == 0.0);
        self.flags[slot] = flags;
        self.alive_count += 1;
        true
    }

    /// Removes the particle referenced by `handle`.
    ///
    /// Returns `false` if the handle is stale.
    pub(crate) fn remove(&mut self, handle: ParticleHandle) -> bool {
        if !self.contains(handle) {
            return false;
        }
        let slot = handle.slot();
        self.flags[slot] = ParticleFlags::empty();
        self.owners[slot] = None;
        self.kinematic_targets[slot] = None;
        self.forces[slot] = Vector::ZERO;
        self.alive_count -= 1;
        true
    }

    /// Returns the position of the particle.
    pub fn position(&self, handle: ParticleHandle) -> Option<Vector> {
        self.contains(handle).then(|| self.positions[handle.slot()])
    }

    /// Returns the velocity of the particle.
    pub fn velocity(&self, handle: ParticleHandle) -> Option<Vector> {
        self.contains(handle).then(|| self.velocities[handle.slot()])
    }

    /// Returns the inverse mass of the particle.
    pub fn inverse_mass(&self, handle: ParticleHandle) -> Option<Scalar> {
        self.contains(handle).then(|| self.inverse_masses[handle.slot()])
    }

    /// Returns the flags of the particle.
    pub fn flags(&self, handle: ParticleHandle) -> Option<ParticleFlags> {
        self.contains(handle).then(|| self.flags[handle.slot()])
    }

    /// Returns the proxy owning the particle.
    pub fn owner(&self, handle: ParticleHandle) -> Option<ProxyId> {
        if self.contains(handle) {
            self.owners[handle.slot()]
        } else {
            None
        }
    }

    /// Positions indexed by slot. Dead slots hold stale data.
    #[inline]
    pub fn positions(&self) -> &[Vector] {
        &self.positions
    }

    /// Velocities indexed by slot. Dead slots hold stale data.
    #[inline]
    pub fn velocities(&self) -> &[Vector] {
        &self.velocities
    }

    /// Inverse masses indexed by slot. Dead slots hold stale data.
    #[inline]
    pub fn inverse_masses(&self) -> &[Scalar] {
        &self.inverse_masses
    }

    /// Teleports the particle.
    pub(crate) fn set_position(&mut self, handle: ParticleHandle, position: Vector) -> bool {
        self.write(handle, |store, slot| {
            store.positions[slot] = position;
            store.predicted_positions[slot] = position;
        })
    }

    pub(crate) fn set_velocity(&mut self, handle: ParticleHandle, velocity: Vector) -> bool {
        self.write(handle, |store, slot| store.velocities[slot] = velocity)
    }

    /// Sets the position a kinematic particle moves to during the next step.
    pub(crate) fn set_kinematic_target(&mut self, handle: ParticleHandle, target: Vector) -> bool {
        self.write(handle, |store, slot| {
            store.kinematic_targets[slot] = Some(target);
        })
    }

    pub(crate) fn add_force(&mut self, handle: ParticleHandle, force: Vector) -> bool {
        self.write(handle, |store, slot| store.forces[slot] += force)
    }

    /// Sets the inverse mass of the particle.
    ///
    /// Returns `Some(true)` if the particle switched between kinematic and dynamic,
    /// and `None` if the handle is stale.
    pub(crate) fn set_inverse_mass(
        &mut self,
        handle: ParticleHandle,
        inverse_mass: Scalar,
    ) -> Option<bool> {
        if !self.contains(handle) {
            return None;
        }
        let slot = handle.slot();
        let inverse_mass = inverse_mass.max(0.0);
        let was_kinematic = self.flags[slot].is_kinematic();
        self.inverse_masses[slot] = inverse_mass;
        self.flags[slot].set(ParticleFlags::KINEMATIC, inverse_mass == 0.0);
        self.flags[slot].insert(ParticleFlags::DIRTY);
        Some(was_kinematic != (inverse_mass == 0.0))
    }

    /// Clears the dirty flags, accumulated forces and kinematic targets of every particle.
    ///
    /// A kinematic particle that reached its target comes to rest there.
    pub(crate) fn clear_step_data(&mut self) {
        for (flags, force) in self.flags.iter_mut().zip(self.forces.iter_mut()) {
            flags.remove(ParticleFlags::DIRTY);
            *force = Vector::ZERO;
        }
        for (target, velocity) in self
            .kinematic_targets
            .iter_mut()
            .zip(self.velocities.iter_mut())
        {
            if target.take().is_some() {
                *velocity = Vector::ZERO;
            }
        }
    }

    fn write(&mut self, handle: ParticleHandle, f: impl FnOnce(&mut Self, usize)) -> bool {
        if !self.contains(handle) {
            return false;
        }
        let slot = handle.slot();
        f(self, slot);
        self.flags[slot].insert(ParticleFlags::DIRTY);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::handle_pool::{HandlePool, PoolHandle};

    #[test]
    fn stale_handles_are_rejected() {
        let mut pool = HandlePool::<ParticleHandle>::new();
        let owner = ProxyId::from_raw_parts(0, 0);
        let mut store = ParticleStore::new();

        let a = pool.alloc();
        assert!(store.insert(a, &ParticleDesc::kinematic(Vector::ZERO), owner));
        assert!(!store.insert(a, &ParticleDesc::kinematic(Vector::ZERO), owner));
        assert!(store.flags(a).unwrap().is_kinematic());

        assert!(store.remove(a));
        pool.free(a);
        let b = pool.alloc();
        assert_eq!(a.slot(), b.slot());
        assert!(store.insert(b, &ParticleDesc::dynamic(Vector::X, 1.0), owner));

        assert_eq!(store.position(a), None);
        assert!(!store.set_velocity(a, Vector::Y));
        assert_eq!(store.position(b), Some(Vector::X));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn reached_targets_come_to_rest() {
        let mut store = ParticleStore::new();
        let owner = ProxyId::from_raw_parts(0, 0);
        let moved = ParticleHandle::from_raw_parts(0, 0);
        let drifting = ParticleHandle::from_raw_parts(1, 0);
        store.insert(moved, &ParticleDesc::kinematic(Vector::ZERO), owner);
        store.insert(drifting, &ParticleDesc::kinematic(Vector::ZERO), owner);
        store.set_kinematic_target(moved, Vector::X);
        store.set_velocity(moved, Vector::X);
        store.set_velocity(drifting, Vector::Y);

        store.clear_step_data();

        assert_eq!(store.kinematic_targets[0], None);
        assert_eq!(store.velocities[0], Vector::ZERO);
        assert_eq!(store.velocities[1], Vector::Y);
        assert!(!store.flags(drifting).unwrap().is_dirty());
    }

    #[test]
    fn inverse_mass_switch_reports_kind_change() {
        let mut store = ParticleStore::new();
        let handle = ParticleHandle::from_raw_parts(3, 0);
        store.insert(
            handle,
            &ParticleDesc::dynamic(Vector::ZERO, 2.0),
            ProxyId::from_raw_parts(0, 0),
        );
        assert_eq!(store.slot_count(), 4);
        assert_eq!(store.alive_slots().collect::<Vec<_>>(), vec![3]);

        assert_eq!(store.set_inverse_mass(handle, 1.0), Some(false));
        assert_eq!(store.set_inverse_mass(handle, 0.0), Some(true));
        assert!(store.flags(handle).unwrap().is_kinematic());
        assert_eq!(
            store.set_inverse_mass(ParticleHandle::from_raw_parts(3, 1), 1.0),
            None
        );
    }

    #[test]
    fn zero_mass_is_kinematic() {
        assert!(ParticleDesc::from_mass(Vector::ZERO, 0.0).is_kinematic());
        assert_eq!(ParticleDesc::from_mass(Vector::ZERO, 4.0).inverse_mass, 0.25);
    }
}
