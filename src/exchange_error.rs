//! ExchangeError: Unified error type for the all-to-all redistribution APIs.
//!
//! Configuration errors (conflicting flags, queries the distributor was not
//! created for) are reported here instead of aborting the process; callers
//! that want the abort semantics can simply `expect` them. Transport errors
//! carry the peer rank they were observed on.

use thiserror::Error;

/// Unified error type for distributor and transport operations.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// `ORDER_BY_DEST_ID` and `ORDER_BY_SRC_RANK` were both requested.
    #[error("flags may not match both ORDER_BY_DEST_ID and ORDER_BY_SRC_RANK (flags = {flags:#x})")]
    ConflictingOrderFlags { flags: u32 },
    /// Ordering by destination id was requested without a destination id array.
    #[error("ORDER_BY_DEST_ID requires a destination id for every element")]
    MissingDestIds,
    /// `src_rank()` was called on a distributor that does not track source ranks.
    #[error("source ranks are not tracked (flags {flags:#x}); set USE_SRC_RANK")]
    SrcRankNotTracked { flags: u32 },
    /// Reverse exchange on a distributor created with `NO_REVERSE`.
    #[error("reverse exchange requested on a distributor created with NO_REVERSE")]
    ReverseDisabled,
    /// The backend lost the provenance needed for a reverse exchange.
    #[error("reverse exchange metadata is unavailable: {0}")]
    MissingReverseMetadata(&'static str),
    /// An input array does not have the length implied by the element count.
    #[error("{what}: expected length {expected}, got {got}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    /// A destination rank lies outside the process group.
    #[error("element {index} targets rank {rank}, but the group only has {n_ranks} ranks")]
    RankOutOfRange {
        index: usize,
        rank: usize,
        n_ranks: usize,
    },
    /// A received destination id lies outside `[0, n_elts_dest)`.
    #[error("received destination id {id} is outside [0, {n_elts_dest})")]
    DestIdOutOfRange { id: usize, n_elts_dest: usize },
    /// Two received records claimed the same destination id.
    #[error("destination id {0} was received more than once")]
    DuplicateDestId(usize),
    /// Global numbers are 1-based; 0 cannot be mapped to a block.
    #[error("global number at position {index} is 0 (global numbers are 1-based)")]
    InvalidGlobalNumber { index: usize },
    /// Block distribution description cannot map any element.
    #[error("invalid block distribution: {0}")]
    InvalidBlockDistribution(String),
    /// A source index is not a valid prefix sum.
    #[error("index is not non-decreasing at position {0}")]
    NonMonotonicIndex(usize),
    /// A count or displacement does not fit the transport's count type.
    #[error("count {0} exceeds the transport count limit")]
    CountOverflow(usize),
    /// Generic communication failure with a peer.
    #[error("communication error with rank {neighbor}: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A message from a peer did not have the expected size.
    #[error("buffer size mismatch with rank {neighbor}: expected {expected} bytes, got {got}")]
    BufferSizeMismatch {
        neighbor: usize,
        expected: usize,
        got: usize,
    },
    /// A debug invariant check failed.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}
