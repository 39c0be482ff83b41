//! Long-range tether constraints.
//!
//! A tether is a one-directional, pull-only distance constraint from a kinematic anchor
//! to a dynamic particle. Tethers keep cloth and skin from stretching away from the points
//! they are pinned to, no matter how many iterations the local constraints would need to
//! propagate the correction.
//!
//! Tethers are [built](build_tethers) per cluster from a neighbor graph and the rest pose, and
//! solved either with plain [PBD](PbdTethers) or with [XPBD](XpbdTethers).
//!
//! # Batches
//!
//! Tethers are grouped into batches in which no two tethers share an end particle.
//! Batches run in sequence. Corrections inside a batch are independent of each other,
//! so large batches compute them on the [`ComputeTaskPool`](bevy::tasks::ComputeTaskPool)
//! and then apply them in order, which gives the same result as a serial pass.

mod builder;
mod pbd;
mod xpbd;

pub use builder::{TetherLayout, build_tethers};
pub use pbd::PbdTethers;
pub use xpbd::{MAX_COMPLIANCE, XpbdTethers};

use core::ops::Range;

use crate::{config::TetherSolverKind, math::*};

/// Batches with fewer tethers than this are solved serially.
pub const MIN_PARALLEL_TETHERS: usize = 500;

/// How the reference length of a tether is measured.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum TetherMode {
    /// The straight-line rest distance to the nearest anchor of the same island.
    ///
    /// Cheap to build, but can shortcut through the surface.
    Euclidean,
    /// The shortest path along the neighbor graph to the nearest anchor.
    ///
    /// Required when the surface wraps around, for example a sleeve or a skirt.
    #[default]
    Geodesic,
}

/// A long-range constraint from a kinematic `start` to a dynamic `end`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tether {
    /// The index of the kinematic anchor.
    pub start: usize,
    /// The index of the dynamic particle.
    pub end: usize,
    /// The distance beyond which the tether starts pulling.
    pub reference_length: Scalar,
}

impl Tether {
    /// Creates a new [`Tether`].
    pub const fn new(start: usize, end: usize, reference_length: Scalar) -> Self {
        Self {
            start,
            end,
            reference_length,
        }
    }

    /// Returns the unit direction from the end towards the anchor,
    /// and how far the end is beyond the reference length.
    ///
    /// The offset is never negative. A degenerate direction is zero.
    #[inline]
    pub fn delta(&self, positions: &[Vector], inverse_masses: &[Scalar]) -> (Vector, Scalar) {
        debug_assert!(
            inverse_masses[self.start] == 0.0,
            "tether anchor {} must be kinematic",
            self.start
        );
        debug_assert!(
            inverse_masses[self.end] > 0.0,
            "tether end {} must be dynamic",
            self.end
        );
        let (direction, length) =
            direction_and_length(positions[self.start] - positions[self.end]);
        (direction, (length - self.reference_length).max(0.0))
    }

    /// Returns the violation of the tether.
    #[inline]
    pub fn offset(&self, positions: &[Vector]) -> Scalar {
        let length = positions[self.start].distance(positions[self.end]);
        (length - self.reference_length).max(0.0)
    }
}

/// Tethers grouped into batches with a shared stiffness.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TetherConstraints {
    tethers: Vec<Tether>,
    batches: Vec<Range<usize>>,
    stiffness: Scalar,
}

impl TetherConstraints {
    /// Creates a new set of tethers, grouping them into batches with unique end particles.
    ///
    /// The order of tethers within a batch follows the input order.
    /// The stiffness is clamped to `[0, 1]`.
    pub fn new(tethers: Vec<Tether>, stiffness: Scalar) -> Self {
        // The k-th tether sharing an end goes to batch k.
        let mut end_counts = std::collections::BTreeMap::<usize, usize>::new();
        let mut keyed: Vec<(usize, Tether)> = tethers
            .into_iter()
            .map(|tether| {
                let count = end_counts.entry(tether.end).or_insert(0);
                let batch = *count;
                *count += 1;
                (batch, tether)
            })
            .collect();
        keyed.sort_by_key(|(batch, _)| *batch);

        let mut batches: Vec<Range<usize>> = Vec::new();
        for (i, (batch, _)) in keyed.iter().enumerate() {
            match batches.get_mut(*batch) {
                Some(range) => range.end = i + 1,
                None => batches.push(i..i + 1),
            }
        }

        Self {
            tethers: keyed.into_iter().map(|(_, tether)| tether).collect(),
            batches,
            stiffness: stiffness.clamp(0.0, 1.0),
        }
    }

    /// Returns the tethers, ordered batch by batch.
    #[inline]
    pub fn tethers(&self) -> &[Tether] {
        &self.tethers
    }

    /// Returns the index ranges of the batches into [`tethers`](Self::tethers).
    #[inline]
    pub fn batches(&self) -> &[Range<usize>] {
        &self.batches
    }

    /// Returns the number of tethers.
    #[inline]
    pub fn len(&self) -> usize {
        self.tethers.len()
    }

    /// Returns `true` if there are no tethers.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tethers.is_empty()
    }

    /// Returns the stiffness in `[0, 1]`.
    #[inline]
    pub fn stiffness(&self) -> Scalar {
        self.stiffness
    }

    /// Sets the stiffness, clamped to `[0, 1]`.
    #[inline]
    pub fn set_stiffness(&mut self, stiffness: Scalar) {
        self.stiffness = stiffness.clamp(0.0, 1.0);
    }
}

/// A runtime choice between the [PBD](PbdTethers) and [XPBD](XpbdTethers) tether solvers.
#[derive(Clone, Debug, PartialEq)]
pub enum TetherConstraintSet {
    /// Tethers projected with plain PBD.
    Pbd(PbdTethers),
    /// Tethers projected with XPBD.
    Xpbd(XpbdTethers),
}

impl TetherConstraintSet {
    /// Creates a tether set of the given kind.
    pub fn new(kind: TetherSolverKind, constraints: TetherConstraints) -> Self {
        match kind {
            TetherSolverKind::Pbd => Self::Pbd(PbdTethers::new(constraints)),
            TetherSolverKind::Xpbd => Self::Xpbd(XpbdTethers::new(constraints)),
        }
    }

    /// Returns the underlying tethers.
    pub fn constraints(&self) -> &TetherConstraints {
        match self {
            Self::Pbd(set) => &set.constraints,
            Self::Xpbd(set) => &set.constraints,
        }
    }

    /// Sets the stiffness, clamped to `[0, 1]`.
    pub fn set_stiffness(&mut self, stiffness: Scalar) {
        match self {
            Self::Pbd(set) => set.constraints.set_stiffness(stiffness),
            Self::Xpbd(set) => set.constraints.set_stiffness(stiffness),
        }
    }

    /// Prepares the set for a new step.
    pub fn init(&mut self) {
        if let Self::Xpbd(set) = self {
            set.init();
        }
    }

    /// Runs one projection pass.
    pub fn apply(
        &mut self,
        positions: &mut [Vector],
        inverse_masses: &[Scalar],
        dt: Scalar,
        parallel: bool,
    ) {
        match self {
            Self::Pbd(set) => set.apply(positions, inverse_masses, parallel),
            Self::Xpbd(set) => set.apply(positions, inverse_masses, dt, parallel),
        }
    }

    /// Runs one rigid pass that fully closes every violation.
    pub fn apply_rigid(&self, positions: &mut [Vector], inverse_masses: &[Scalar], parallel: bool) {
        pbd::apply_with_stiffness(self.constraints(), 1.0, positions, inverse_masses, parallel);
    }
}

/// Returns `true` if a batch of `len` tethers is worth dispatching to the task pool.
#[inline]
fn should_parallelize(len: usize, parallel: bool) -> bool {
    cfg!(feature = "parallel") && parallel && len >= MIN_PARALLEL_TETHERS
}
