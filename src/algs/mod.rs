//! Exchange algorithms and the transports they run on.

pub mod all_to_all;
pub mod communicator;
pub mod wire;

pub use all_to_all::{Algorithm, BlockDistribution, DistFlags, Distributor, DistributorConfig};
