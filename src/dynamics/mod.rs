//! Particle dynamics: prediction, constraint solving and the stepper driving them.

pub mod evolution;
pub mod integrator;
pub mod solver;
