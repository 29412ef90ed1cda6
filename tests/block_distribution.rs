//! Block distribution arithmetic and the distributor built on it.
mod util;
use util::*;

use mesh_all_to_all::ExchangeError;
use mesh_all_to_all::algs::all_to_all::{BlockDistribution, DistFlags, Distributor};
use mesh_all_to_all::algs::communicator::{Communicator, ThreadComm};
use proptest::prelude::*;

#[test]
fn block_scenario_ranks_and_ids() {
    let bi = BlockDistribution {
        gnum_range: [1, 5],
        n_ranks: 3,
        rank_step: 1,
        block_size: 4,
    };
    let (ranks, ids) = bi.destinations(&[5, 1, 9], true).unwrap();
    assert_eq!(ranks, vec![1, 0, 2]);
    assert_eq!(ids, Some(vec![0, 0, 0]));
}

#[test]
fn block_distributor_gathers_owned_numbers() {
    const N_RANKS: usize = 3;
    const N_G: u64 = 10;
    for alg in ALGORITHMS {
        let out = ThreadComm::run(N_RANKS, |comm| {
            let me = comm.rank();
            let bi = BlockDistribution::compute(me, N_RANKS, 1, 1, N_G);
            // rank r holds every number congruent to r mod N_RANKS, descending
            let gnums: Vec<u64> = (1..=N_G)
                .rev()
                .filter(|g| g % N_RANKS as u64 == me as u64)
                .collect();
            let mut d = Distributor::from_block_distribution(
                gnums.len(),
                DistFlags::ORDER_BY_DEST_ID,
                &gnums,
                &bi,
                &comm,
                config(alg),
            )
            .unwrap();
            assert_eq!(d.n_elts_dest().unwrap() as u64, bi.n_local());
            let got: Vec<u64> = d.copy_array(1, false, &gnums).unwrap();
            let back: Vec<u64> = d.copy_array(1, true, &got).unwrap();
            assert_eq!(back, gnums);
            (bi.gnum_range, got)
        });
        for ([start, end], got) in out {
            assert_eq!(got, (start..end).collect::<Vec<_>>(), "{alg}");
        }
    }
}

#[test]
fn block_distributor_rejects_zero_global_number() {
    let comms = ThreadComm::group(1);
    let bi = BlockDistribution::compute(0, 1, 1, 1, 4);
    let err = Distributor::from_block_distribution(
        2,
        DistFlags::NONE,
        &[1, 0],
        &bi,
        &comms[0],
        config(ALGORITHMS[0]),
    )
    .unwrap_err();
    assert!(matches!(err, ExchangeError::InvalidGlobalNumber { index: 1 }));
}

#[test]
fn block_info_serializes() {
    let bi = BlockDistribution::compute(1, 4, 1, 1, 100);
    let json = serde_json::to_string(&bi).unwrap();
    let back: BlockDistribution = serde_json::from_str(&json).unwrap();
    assert_eq!(back, bi);
}

proptest! {
    #[test]
    fn blocks_tile_the_numbering(
        n_ranks in 1usize..17,
        min_rank_step in 1usize..5,
        min_block_size in 0u64..40,
        n_g in 0u64..500,
    ) {
        let infos: Vec<_> = (0..n_ranks)
            .map(|r| BlockDistribution::compute(r, n_ranks, min_rank_step, min_block_size, n_g))
            .collect();
        // ranges are contiguous, ordered by rank and cover 1..=n_g
        let mut next = 1u64;
        for bi in &infos {
            prop_assert_eq!(bi.gnum_range[0], next);
            prop_assert!(bi.gnum_range[1] >= bi.gnum_range[0]);
            next = bi.gnum_range[1];
        }
        prop_assert_eq!(next, n_g + 1);
    }

    #[test]
    fn every_number_maps_to_its_owner(
        n_ranks in 1usize..17,
        min_block_size in 0u64..40,
        n_g in 1u64..500,
    ) {
        let infos: Vec<_> = (0..n_ranks)
            .map(|r| BlockDistribution::compute(r, n_ranks, 1, min_block_size, n_g))
            .collect();
        let gnums: Vec<u64> = (1..=n_g).collect();
        let (ranks, ids) = infos[0].destinations(&gnums, true).unwrap();
        let ids = ids.unwrap();
        for (i, &g) in gnums.iter().enumerate() {
            let owner = &infos[ranks[i]];
            prop_assert!(owner.gnum_range[0] <= g && g < owner.gnum_range[1]);
            prop_assert_eq!(u64::from(ids[i]), g - owner.gnum_range[0]);
        }
    }
}
