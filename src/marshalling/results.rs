use std::collections::{BTreeMap, BTreeSet, VecDeque};

use bevy::log::{trace, warn};

use super::{PullSnapshot, ResultData, SnapshotReceiver, Timestamp};
use crate::{
    dynamics::solver::SolverDiagnostics,
    math::*,
    proxy::{Proxy, ProxyId, ProxyRegistry},
};

/// Hands pull snapshots back to the producer.
///
/// In synchronous mode, every received snapshot is merged and the latest result of each proxy is
/// applied. In interpolated mode, the manager keeps a window of a merged "previous" state and the
/// "next" snapshot, and blends between them at the requested results time.
///
/// A result is only applied if the step that produced it already saw the latest producer write to
/// the proxy, so a teleport is never undone by an older step. Proxies pending destruction get
/// no results.
#[derive(Debug)]
pub struct ResultsManager {
    receiver: SnapshotReceiver<PullSnapshot>,
    pending: VecDeque<PullSnapshot>,
    /// The latest result of every proxy from the snapshots before `next`.
    prev: BTreeMap<ProxyId, (Timestamp, ResultData)>,
    next: Option<PullSnapshot>,
    diagnostics: SolverDiagnostics,
}

impl ResultsManager {
    /// Creates a manager reading from `receiver`.
    pub fn new(receiver: SnapshotReceiver<PullSnapshot>) -> Self {
        Self {
            receiver,
            pending: VecDeque::new(),
            prev: BTreeMap::new(),
            next: None,
            diagnostics: SolverDiagnostics::default(),
        }
    }

    /// The timestamp of the newest received pull snapshot.
    pub fn consumed(&self) -> Timestamp {
        self.receiver.last_timestamp().unwrap_or(Timestamp::ZERO)
    }

    /// The diagnostics of the newest received pull snapshot.
    pub fn diagnostics(&self) -> SolverDiagnostics {
        self.diagnostics
    }

    /// The time span of the snapshot currently interpolated towards.
    pub fn next_interval(&self) -> Option<(f64, f64)> {
        self.next.as_ref().map(|next| (next.start_time, next.end_time))
    }

    fn receive(&mut self) {
        match self.receiver.drain() {
            Ok(snapshots) => {
                if let Some(last) = snapshots.last() {
                    self.diagnostics = last.diagnostics;
                }
                self.pending.extend(snapshots);
            }
            Err(error) => warn!("failed to receive pull snapshots: {error}"),
        }
    }

    /// Applies the latest result of every proxy from all received snapshots.
    ///
    /// Returns the number of proxies reported to `callback`.
    pub fn pull_sync(
        &mut self,
        registry: &mut ProxyRegistry,
        mut callback: impl FnMut(&Proxy),
    ) -> usize {
        self.receive();
        self.prev.clear();
        self.next = None;

        let mut latest: BTreeMap<ProxyId, (Timestamp, ResultData)> = BTreeMap::new();
        for snapshot in self.pending.drain(..) {
            for result in snapshot.results {
                latest.insert(result.proxy, (snapshot.timestamp, result.data));
            }
        }

        let mut reported = 0;
        for (id, (timestamp, data)) in latest {
            let Some(proxy) = registry.get_mut(id) else {
                continue;
            };
            if proxy.is_pending_destroy() || proxy.sync_timestamp > timestamp {
                continue;
            }
            write_state(proxy, data);
            callback(proxy);
            reported += 1;
        }
        reported
    }

    /// Applies results interpolated at `results_time`.
    ///
    /// Returns the number of proxies reported to `callback`.
    pub fn pull_interpolated(
        &mut self,
        results_time: f64,
        registry: &mut ProxyRegistry,
        mut callback: impl FnMut(&Proxy),
    ) -> usize {
        self.receive();
        self.prev.retain(|id, _| registry.get(*id).is_some());

        // Advance the window until `next` ends at or after the results time.
        while self
            .next
            .as_ref()
            .is_none_or(|next| next.end_time < results_time)
        {
            let Some(snapshot) = self.pending.pop_front() else {
                break;
            };
            if let Some(previous) = self.next.replace(snapshot) {
                for result in previous.results {
                    self.prev
                        .insert(result.proxy, (previous.timestamp, result.data));
                }
            }
        }

        let Some(next) = &self.next else {
            return 0;
        };
        let span = next.end_time - next.start_time;
        let alpha = if span > 0.0 {
            ((results_time - next.start_time) / span).clamp(0.0, 1.0) as Scalar
        } else {
            1.0
        };
        trace!(
            "interpolating towards {} at alpha {alpha} ({} pending)",
            next.timestamp,
            self.pending.len()
        );

        let next_results: BTreeMap<ProxyId, &ResultData> = next
            .results
            .iter()
            .map(|result| (result.proxy, &result.data))
            .collect();
        let ids: BTreeSet<ProxyId> = self
            .prev
            .keys()
            .chain(next_results.keys())
            .copied()
            .collect();

        let mut reported = 0;
        for id in ids {
            let Some(proxy) = registry.get_mut(id) else {
                continue;
            };
            if proxy.is_pending_destroy() {
                continue;
            }
            let sync = proxy.sync_timestamp;
            let prev = self.prev.get(&id).filter(|(timestamp, _)| *timestamp >= sync);

            let resolved = match (prev, next_results.get(&id)) {
                // The producer wrote after the step that produced `next`.
                (_, Some(_)) if sync > next.timestamp => None,
                (_, Some(next_data @ ResultData::Constraint { .. })) => {
                    Some(ResultData::clone(next_data))
                }
                (Some((_, prev_data)), Some(next_data)) => Some(prev_data.lerp(next_data, alpha)),
                // No usable previous result: blend from the producer's current state.
                (None, Some(next_data)) => Some(current_data(proxy).lerp(next_data, alpha)),
                (Some((_, prev_data)), None) => Some(prev_data.clone()),
                (None, None) => None,
            };

            if let Some(data) = resolved {
                write_state(proxy, data);
                callback(proxy);
                reported += 1;
            }
        }
        reported
    }
}

fn current_data(proxy: &Proxy) -> ResultData {
    ResultData::Particles {
        positions: proxy.state.positions.clone(),
        velocities: proxy.state.velocities.clone(),
    }
}

fn write_state(proxy: &mut Proxy, data: ResultData) {
    match data {
        ResultData::Particles {
            positions,
            velocities,
        } => {
            proxy.state.positions = positions;
            proxy.state.velocities = velocities;
        }
        ResultData::Constraint { force } => proxy.state.force = force,
    }
}
