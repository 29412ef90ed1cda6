#![allow(dead_code)]
use std::borrow::Cow;
use std::sync::Arc;

use mesh_all_to_all::algs::all_to_all::{
    Algorithm, DistFlags, Distributor, DistributorConfig, ExchangeMetrics,
};
use mesh_all_to_all::algs::communicator::ThreadComm;
use mesh_all_to_all::algs::wire::LocalId;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Every backend; each behavioural test runs against all of them.
pub const ALGORITHMS: [Algorithm; 2] = [Algorithm::Direct, Algorithm::CrystalRouter];

/// Fresh configuration for `algorithm`, with its own metrics accumulator.
pub fn config(algorithm: Algorithm) -> DistributorConfig {
    DistributorConfig::new(algorithm)
}

/// Configuration sharing `metrics` (to inspect counters afterwards).
pub fn config_with(algorithm: Algorithm, metrics: &Arc<ExchangeMetrics>) -> DistributorConfig {
    DistributorConfig::new(algorithm).with_metrics(Arc::clone(metrics))
}

/// Distributor over owned copies of `dest_rank` / `dest_id`.
pub fn distributor<'c>(
    comm: &'c ThreadComm,
    flags: DistFlags,
    dest_rank: &[usize],
    dest_id: Option<&[LocalId]>,
    cfg: DistributorConfig,
) -> Distributor<'c, 'static, ThreadComm> {
    Distributor::new(
        dest_rank.len(),
        flags,
        dest_id.map(|ids| Cow::Owned(ids.to_vec())),
        Cow::Owned(dest_rank.to_vec()),
        comm,
        cfg,
    )
    .unwrap()
}

/// Per-rank random destination ranks, reproducible from `seed`.
pub fn random_ranks(seed: u64, rank: usize, n_ranks: usize, n_elts: usize) -> Vec<usize> {
    let mut rng = SmallRng::seed_from_u64(seed ^ (rank as u64).wrapping_mul(0x9E37_79B9));
    (0..n_elts).map(|_| rng.gen_range(0..n_ranks)).collect()
}

/// Value identifying element `i` of `rank` across exchanges.
pub fn tag(rank: usize, i: usize) -> u64 {
    ((rank as u64) << 32) | i as u64
}
