//! Distributor flags and backend selection.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::metrics::ExchangeMetrics;
use crate::exchange_error::ExchangeError;

/// Option flags of a distributor (bitwise or of the associated constants).
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DistFlags(u32);

impl DistFlags {
    /// No ordering, reverse allowed, no source-rank tracking.
    pub const NONE: DistFlags = DistFlags(0);
    /// Place received records at their explicit destination id.
    pub const ORDER_BY_DEST_ID: DistFlags = DistFlags(1 << 0);
    /// Group received records by originating rank.
    pub const ORDER_BY_SRC_RANK: DistFlags = DistFlags(1 << 1);
    /// The caller never runs a reverse exchange.
    pub const NO_REVERSE: DistFlags = DistFlags(1 << 2);
    /// Keep source ranks of received records for [`src_rank`](super::Distributor::src_rank).
    pub const USE_SRC_RANK: DistFlags = DistFlags(1 << 3);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn contains(self, other: DistFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn order_by_dest_id(self) -> bool {
        self.contains(Self::ORDER_BY_DEST_ID)
    }

    pub fn tracks_src_rank(self) -> bool {
        self.contains(Self::USE_SRC_RANK) || self.contains(Self::ORDER_BY_SRC_RANK)
    }

    pub fn reverse_allowed(self) -> bool {
        !self.contains(Self::NO_REVERSE)
    }

    /// Reject flag combinations no backend can honor.
    pub fn validate(self) -> Result<(), ExchangeError> {
        if self.contains(Self::ORDER_BY_DEST_ID) && self.contains(Self::ORDER_BY_SRC_RANK) {
            return Err(ExchangeError::ConflictingOrderFlags { flags: self.0 });
        }
        Ok(())
    }
}

impl BitOr for DistFlags {
    type Output = DistFlags;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DistFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for DistFlags {
    type Output = DistFlags;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for DistFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(DistFlags, &str); 4] = [
            (DistFlags::ORDER_BY_DEST_ID, "ORDER_BY_DEST_ID"),
            (DistFlags::ORDER_BY_SRC_RANK, "ORDER_BY_SRC_RANK"),
            (DistFlags::NO_REVERSE, "NO_REVERSE"),
            (DistFlags::USE_SRC_RANK, "USE_SRC_RANK"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "DistFlags(NONE)")
        } else {
            write!(f, "DistFlags({})", set.join(" | "))
        }
    }
}

/// All-to-all algorithm choice.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Counts all-to-all followed by a variable-size all-to-all.
    #[default]
    Direct,
    /// Crystal-router collaborator.
    CrystalRouter,
}

impl Algorithm {
    /// Human-readable name used in performance logs.
    pub fn description(self) -> &'static str {
        match self {
            Algorithm::Direct => "all-to-all counts and variable all-to-all",
            Algorithm::CrystalRouter => "crystal router algorithm",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Algorithm::Direct => "direct",
            Algorithm::CrystalRouter => "crystal_router",
        })
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" | "default" | "alltoallv" => Ok(Algorithm::Direct),
            "crystal_router" | "crystal-router" | "cr" => Ok(Algorithm::CrystalRouter),
            other => Err(format!("unknown all-to-all algorithm `{other}`")),
        }
    }
}

/// Explicit per-distributor configuration: which backend to use and where
/// to accumulate instrumentation. Cloning shares the metrics accumulator.
#[derive(Clone, Debug, Default)]
pub struct DistributorConfig {
    pub algorithm: Algorithm,
    pub metrics: Arc<ExchangeMetrics>,
}

impl DistributorConfig {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            metrics: Arc::new(ExchangeMetrics::default()),
        }
    }

    /// Use `metrics` instead of a private accumulator.
    pub fn with_metrics(mut self, metrics: Arc<ExchangeMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}
