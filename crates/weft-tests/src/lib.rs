//! Multi-node test suite for Weft.
//!
//! [`sim::SimNetwork`] runs several network workers in one process against
//! a virtual clock, routing their transport actions to each other. The
//! integration tests under `tests/` drive it through sync, DHT, reputation
//! and notification scenarios.

pub mod helpers;
pub mod sim;
