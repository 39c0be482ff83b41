use core::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};

use bevy::log::debug;

use super::{Tether, TetherMode};
use crate::{
    dynamics::solver::islands::{Adjacency, IslandPartition, compute_islands, symmetrize},
    math::*,
};

/// The islands of a cluster and the tethers built over them.
///
/// Indices are local to the positions the layout was built from.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TetherLayout {
    /// The islands the points were partitioned into.
    pub partition: IslandPartition,
    /// At most one tether per dynamic point, ordered by island and then by end point.
    pub tethers: Vec<Tether>,
}

/// Builds one tether per dynamic point to its governing anchor.
///
/// The points `0..positions.len()` are partitioned into at most `max_islands` islands first.
/// Each dynamic point is then tethered to the nearest kinematic point of its island, measured
/// according to `mode`. Points that cannot reach an anchor get no tether.
///
/// Ties are resolved towards the lower anchor index. Reference lengths are scaled by `limit_scale`.
pub fn build_tethers(
    positions: &[Vector],
    inverse_masses: &[Scalar],
    adjacency: &Adjacency,
    max_islands: usize,
    mode: TetherMode,
    limit_scale: Scalar,
) -> TetherLayout {
    debug_assert_eq!(positions.len(), inverse_masses.len());

    let points: BTreeSet<usize> = (0..positions.len()).collect();
    let is_kinematic = |p: usize| inverse_masses[p] == 0.0;
    let partition = compute_islands(&points, adjacency, is_kinematic, max_islands);

    let anchors = match mode {
        TetherMode::Euclidean => euclidean_anchors(positions, &partition, is_kinematic),
        TetherMode::Geodesic => {
            let graph = symmetrize(&points, adjacency);
            geodesic_anchors(positions, &graph, is_kinematic)
        }
    };

    let mut tethers = Vec::new();
    let mut unreachable = 0;
    for island in &partition.islands {
        for &point in &island.particles {
            if is_kinematic(point) {
                continue;
            }
            match anchors[point] {
                Some((anchor, length)) => {
                    tethers.push(Tether::new(anchor, point, length * limit_scale));
                }
                None => unreachable += 1,
            }
        }
    }

    if unreachable > 0 {
        debug!("{unreachable} dynamic points have no reachable anchor and get no tether");
    }

    TetherLayout { partition, tethers }
}

/// For every point, the nearest anchor of its island by straight-line distance.
fn euclidean_anchors(
    positions: &[Vector],
    partition: &IslandPartition,
    is_kinematic: impl Fn(usize) -> bool,
) -> Vec<Option<(usize, Scalar)>> {
    let mut anchors = vec![None; positions.len()];

    for island in &partition.islands {
        let island_anchors: Vec<usize> = island
            .particles
            .iter()
            .copied()
            .filter(|&p| is_kinematic(p))
            .collect();

        for &point in &island.particles {
            if is_kinematic(point) {
                continue;
            }
            let mut best: Option<(usize, Scalar)> = None;
            for &anchor in &island_anchors {
                let distance_squared = positions[anchor].distance_squared(positions[point]);
                // Anchors are ascending, so a strict comparison keeps the lowest on ties.
                if best.is_none_or(|(_, d)| distance_squared < d) {
                    best = Some((anchor, distance_squared));
                }
            }
            anchors[point] = best.map(|(anchor, d)| (anchor, d.sqrt()));
        }
    }

    anchors
}

/// A frontier entry of the multi-source Dijkstra search.
#[derive(Clone, Copy, Debug)]
struct Frontier {
    distance: Scalar,
    anchor: usize,
    point: usize,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Frontier {}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier {
    // Reversed, so that the max-heap pops the shortest distance first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .distance
            .total_cmp(&self.distance)
            .then_with(|| other.anchor.cmp(&self.anchor))
            .then_with(|| other.point.cmp(&self.point))
    }
}

/// For every point, the nearest anchor by path length along the neighbor graph.
///
/// Every edge of `graph` stays within one connected component, and islands are unions of
/// components, so a single search from all anchors never crosses islands.
fn geodesic_anchors(
    positions: &[Vector],
    graph: &Adjacency,
    is_kinematic: impl Fn(usize) -> bool,
) -> Vec<Option<(usize, Scalar)>> {
    let mut best: Vec<Option<(usize, Scalar)>> = vec![None; positions.len()];
    let mut heap = BinaryHeap::new();

    for point in (0..positions.len()).filter(|&p| is_kinematic(p)) {
        best[point] = Some((point, 0.0));
        heap.push(Frontier {
            distance: 0.0,
            anchor: point,
            point,
        });
    }

    while let Some(Frontier {
        distance,
        anchor,
        point,
    }) = heap.pop()
    {
        if best[point] != Some((anchor, distance)) {
            // Stale entry.
            continue;
        }
        let Some(neighbors) = graph.get(&point) else {
            continue;
        };
        for &neighbor in neighbors {
            if is_kinematic(neighbor) {
                continue;
            }
            let candidate = distance + positions[point].distance(positions[neighbor]);
            let improves = match best[neighbor] {
                None => true,
                Some((current_anchor, current)) => {
                    candidate < current || (candidate == current && anchor < current_anchor)
                }
            };
            if improves {
                best[neighbor] = Some((anchor, candidate));
                heap.push(Frontier {
                    distance: candidate,
                    anchor,
                    point: neighbor,
                });
            }
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// A strip bent into a "U": the anchor at 0 and the free end at 4 are close in space,
    /// but far apart along the strip.
    fn u_strip() -> (Vec<Vector>, Vec<Scalar>, Adjacency) {
        let positions = vec![
            Vector::new(0.0, 0.0, 0.0),
            Vector::new(0.0, -1.0, 0.0),
            Vector::new(1.0, -1.0, 0.0),
            Vector::new(2.0, -1.0, 0.0),
            Vector::new(2.0, 0.0, 0.0),
        ];
        let inverse_masses = vec![0.0, 1.0, 1.0, 1.0, 1.0];
        let mut adjacency = Adjacency::new();
        for i in 0..4 {
            adjacency.entry(i).or_default().insert(i + 1);
        }
        (positions, inverse_masses, adjacency)
    }

    #[test]
    fn geodesic_follows_the_surface() {
        let (positions, inverse_masses, adjacency) = u_strip();
        let layout = build_tethers(
            &positions,
            &inverse_masses,
            &adjacency,
            4,
            TetherMode::Geodesic,
            1.0,
        );
        assert_eq!(layout.tethers.len(), 4);
        let last = layout.tethers.iter().find(|t| t.end == 4).unwrap();
        assert_eq!(last.start, 0);
        assert_relative_eq!(last.reference_length, 4.0);
    }

    #[test]
    fn euclidean_takes_the_shortcut() {
        let (positions, inverse_masses, adjacency) = u_strip();
        let layout = build_tethers(
            &positions,
            &inverse_masses,
            &adjacency,
            4,
            TetherMode::Euclidean,
            2.0,
        );
        let last = layout.tethers.iter().find(|t| t.end == 4).unwrap();
        assert_relative_eq!(last.reference_length, 4.0);
    }

    #[test]
    fn tether_invariants_hold() {
        // Two anchors at both ends of a chain, plus a free-floating point.
        let count = 9;
        let positions: Vec<Vector> = (0..count)
            .map(|i| Vector::new(i as Scalar, 0.0, 0.0))
            .collect();
        let mut inverse_masses = vec![1.0; count];
        inverse_masses[0] = 0.0;
        inverse_masses[7] = 0.0;
        let mut adjacency = Adjacency::new();
        for i in 0..7 {
            adjacency.entry(i).or_default().insert(i + 1);
        }

        for mode in [TetherMode::Euclidean, TetherMode::Geodesic] {
            let layout = build_tethers(&positions, &inverse_masses, &adjacency, 4, mode, 1.0);
            // Point 8 is isolated and unanchored.
            assert_eq!(layout.tethers.len(), 6);
            for tether in &layout.tethers {
                assert_eq!(inverse_masses[tether.start], 0.0);
                assert!(inverse_masses[tether.end] > 0.0);
                assert!(layout.partition.same_island(tether.start, tether.end));
            }
            // Point 4 is closer to anchor 7 (3 units) than to anchor 0 (4 units).
            let middle = layout.tethers.iter().find(|t| t.end == 4).unwrap();
            assert_eq!(middle.start, 7);
        }
    }
}
