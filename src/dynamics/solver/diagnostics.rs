use core::time::Duration;

/// Diagnostics for the solver, measured by the step that produced a pull snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SolverDiagnostics {
    /// Time spent applying the deltas of the push snapshot.
    pub apply_deltas: Duration,
    /// Time spent rebuilding islands and tethers after a topology change.
    pub rebuild_islands: Duration,
    /// Time spent predicting positions.
    pub integrate: Duration,
    /// Time spent in the constraint projection passes.
    pub solve_constraints: Duration,
    /// Time spent in the push-out passes.
    pub push_out: Duration,
    /// Time spent writing the final results to the particles and sealing the pull snapshot.
    pub finalize: Duration,
    /// The number of islands.
    pub island_count: u32,
    /// The number of tethers.
    pub tether_count: u32,
    /// The number of deltas dropped because they referenced stale or unknown handles.
    pub dropped_deltas: u32,
}

impl SolverDiagnostics {
    /// Returns the total time spent by the step.
    pub fn total(&self) -> Duration {
        self.apply_deltas
            + self.rebuild_islands
            + self.integrate
            + self.solve_constraints
            + self.push_out
            + self.finalize
    }

    /// Returns the timers with a name for each, in stage order.
    pub fn timers(&self) -> [(&'static str, Duration); 6] {
        [
            ("avian_async/solver/apply_deltas", self.apply_deltas),
            ("avian_async/solver/rebuild_islands", self.rebuild_islands),
            ("avian_async/solver/integrate", self.integrate),
            ("avian_async/solver/solve_constraints", self.solve_constraints),
            ("avian_async/solver/push_out", self.push_out),
            ("avian_async/solver/finalize", self.finalize),
        ]
    }
}
