//! Communication substrate and wire helpers used by the distributor.

pub mod communicator;
pub mod wire;
