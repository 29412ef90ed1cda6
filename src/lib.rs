#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mesh-all-to-all
//!
//! All-to-all redistribution of element arrays for distributed solvers.
//! Each rank describes where its local elements go (a destination rank,
//! optionally a slot on that rank); a [`Distributor`](algs::all_to_all::Distributor)
//! then moves arrays of any `Pod` type forward to the destinations and
//! back again, in fixed-stride, indexed (variable-length) or index form.
//!
//! ## Features
//! - Two backends behind one API: a direct counts + variable all-to-all
//!   exchange, and a crystal-router collaborator that also reports where
//!   every record came from
//! - Destination-id ordering, source-rank queries, reverse exchanges
//! - Block distribution of 1-based global numberings
//! - Pluggable transports: serial (`NoComm`), threads (`ThreadComm`) and
//!   MPI (`MpiComm`, feature `mpi-support`)
//! - Call counts and wall time of metadata and data exchanges
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! mesh-all-to-all = "0.3"
//! # Optional features:
//! # features = ["mpi-support", "rayon"]
//! ```
//!
//! Every exchanging operation is collective. Ranks must issue them in the
//! same order with the same element type and stride; the element counts
//! may differ from rank to rank.

pub mod algs;
pub mod debug_invariants;
pub mod exchange_error;

pub use debug_invariants::DebugInvariants;
pub use exchange_error::ExchangeError;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::all_to_all::{
        Algorithm, BlockDistribution, CrystalRouter, DistFlags, Distributor, DistributorConfig,
        ExchangeMetrics, MetricsSnapshot, PairwiseRouter, Timer,
    };
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::communicator::{Communicator, NoComm, ThreadComm, Wait};
    pub use crate::algs::wire::LocalId;
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::exchange_error::ExchangeError;
}
