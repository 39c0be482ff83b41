//! Specialized data structures used by the solver.

pub mod bit_vec;
pub mod handle_pool;
