//! Constraint island partitioning.
//!
//! An island is a set of particles together with every constraint whose endpoints all lie
//! inside it. Islands share no particles, so each one can be solved on its own copy of the
//! particle data and in parallel with the others.
//!
//! Islands are rebuilt from scratch whenever the topology changes, with breadth-first search
//! over the symmetrized neighbor graph:
//!
//! 1. Kinematic points seed the traversal first, in ascending order, so that islands grow
//!    outward from their anchors. Kinematic points are traversed through like any other point.
//! 2. Points not reached from an anchor seed further components, again in ascending order.
//! 3. While there are more components than the island bound allows, the two smallest are merged.
//!    Ties are broken by the lowest particle index.
//!
//! The result only depends on the graph itself, never on hashing or iteration order of the
//! input, which keeps the whole step deterministic.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use bevy::log::trace;

use crate::data_structures::bit_vec::BitVec;

/// A point→neighbor adjacency map.
///
/// The map does not have to be symmetric: an edge listed in either direction connects both points.
pub type Adjacency = BTreeMap<usize, BTreeSet<usize>>;

/// A set of particles that can be solved independently of every other island.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Island {
    /// The particles in the island, in ascending order.
    pub particles: Vec<usize>,
}

impl Island {
    /// Returns the lowest particle index of the island.
    #[inline]
    pub fn first(&self) -> Option<usize> {
        self.particles.first().copied()
    }

    /// Returns the number of particles in the island.
    #[inline]
    pub fn len(&self) -> usize {
        self.particles.len()
    }

    /// Returns `true` if the island has no particles.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
}

/// A partition of points into islands, sorted by their first particle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IslandPartition {
    /// The islands.
    pub islands: Vec<Island>,
    island_of: BTreeMap<usize, usize>,
}

impl IslandPartition {
    /// Returns the index of the island containing `particle`.
    #[inline]
    pub fn island_of(&self, particle: usize) -> Option<usize> {
        self.island_of.get(&particle).copied()
    }

    /// Returns the number of islands.
    #[inline]
    pub fn len(&self) -> usize {
        self.islands.len()
    }

    /// Returns `true` if there are no islands.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.islands.is_empty()
    }

    /// Returns `true` if both particles are in the same island.
    pub fn same_island(&self, a: usize, b: usize) -> bool {
        match (self.island_of(a), self.island_of(b)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// Returns a symmetric copy of `adjacency` restricted to `points`.
///
/// Self-loops and edges to points outside of `points` are ignored.
pub fn symmetrize(points: &BTreeSet<usize>, adjacency: &Adjacency) -> Adjacency {
    let mut graph: Adjacency = points.iter().map(|&p| (p, BTreeSet::new())).collect();

    for (&a, neighbors) in adjacency {
        if !points.contains(&a) {
            continue;
        }
        for &b in neighbors {
            if a == b || !points.contains(&b) {
                continue;
            }
            if let Some(set) = graph.get_mut(&a) {
                set.insert(b);
            }
            if let Some(set) = graph.get_mut(&b) {
                set.insert(a);
            }
        }
    }

    graph
}

/// Partitions `points` into at most `max_islands` islands.
///
/// `is_kinematic` tells which points seed the traversal first.
/// A `max_islands` of zero is treated as one.
pub fn compute_islands(
    points: &BTreeSet<usize>,
    adjacency: &Adjacency,
    is_kinematic: impl Fn(usize) -> bool,
    max_islands: usize,
) -> IslandPartition {
    let Some(&max_point) = points.last() else {
        return IslandPartition::default();
    };

    let graph = symmetrize(points, adjacency);
    let mut visited = BitVec::new(max_point + 1);
    let mut components: Vec<Vec<usize>> = Vec::new();
    let mut queue = VecDeque::new();

    let seeds = points
        .iter()
        .copied()
        .filter(|&p| is_kinematic(p))
        .chain(points.iter().copied().filter(|&p| !is_kinematic(p)));

    for seed in seeds {
        if !visited.insert(seed) {
            continue;
        }

        let mut component = vec![seed];
        queue.push_back(seed);

        while let Some(point) = queue.pop_front() {
            let Some(neighbors) = graph.get(&point) else {
                continue;
            };
            for &neighbor in neighbors {
                if visited.insert(neighbor) {
                    component.push(neighbor);
                    queue.push_back(neighbor);
                }
            }
        }

        component.sort_unstable();
        components.push(component);
    }

    let found = components.len();
    merge_smallest(&mut components, max_islands.max(1));

    components.sort_unstable_by_key(|component| component[0]);

    let mut island_of = BTreeMap::new();
    let islands = components
        .into_iter()
        .enumerate()
        .map(|(index, particles)| {
            island_of.extend(particles.iter().map(|&p| (p, index)));
            Island { particles }
        })
        .collect::<Vec<_>>();

    trace!(
        "partitioned {} points into {} islands ({found} components)",
        points.len(),
        islands.len()
    );

    IslandPartition { islands, island_of }
}

/// Merges the two smallest components until at most `max_components` remain.
///
/// Every component must be sorted and non-empty. Merged components stay sorted.
fn merge_smallest(components: &mut Vec<Vec<usize>>, max_components: usize) {
    while components.len() > max_components {
        // Order by size, then by the lowest particle.
        let key = |component: &Vec<usize>| (component.len(), component[0]);

        let mut order: Vec<usize> = (0..components.len()).collect();
        order.sort_unstable_by_key(|&i| key(&components[i]));
        let (keep, absorb) = (order[0].min(order[1]), order[0].max(order[1]));

        let absorbed = components.swap_remove(absorb);
        let target = &mut components[keep];
        target.extend(absorbed);
        target.sort_unstable();
    }
}
