//! Allocation Module
//!
//! Decides which node each MinIO replica lands on: the node census keeps
//! the ready nodes, the allocation pool spreads replicas over them.

pub mod census;
pub mod pool;

pub use census::*;
pub use pool::*;
