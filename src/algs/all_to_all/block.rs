//! Block distribution of a global numbering.
//!
//! Entities numbered `1..=n_g_ents` are split into contiguous blocks of
//! `block_size` numbers. Block `b` lives on rank `b * rank_step`; ranks in
//! between own empty blocks, which keeps blocks reasonably large when there
//! are many ranks and few entities.

#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::algs::wire::LocalId;
use crate::exchange_error::ExchangeError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockDistribution {
    /// Global numbers owned by this rank: `[start, past_end)`.
    pub gnum_range: [u64; 2],
    /// Number of ranks owning a (possibly partial) block.
    pub n_ranks: usize,
    /// Rank distance between two consecutive blocks.
    pub rank_step: usize,
    pub block_size: u64,
}

impl BlockDistribution {
    /// Block layout of `n_g_ents` entities over `n_ranks` ranks, as seen
    /// from `rank`.
    ///
    /// The rank step doubles while blocks would hold fewer than
    /// `min_block_size` entities, then is raised to at least
    /// `min_rank_step` and capped at `n_ranks`.
    pub fn compute(
        rank: usize,
        n_ranks: usize,
        min_rank_step: usize,
        min_block_size: u64,
        n_g_ents: u64,
    ) -> Self {
        if n_ranks <= 1 {
            return Self {
                gnum_range: [1, n_g_ents + 1],
                n_ranks: 1,
                rank_step: 1,
                block_size: n_g_ents.max(1),
            };
        }

        let min_block_size = min_block_size.max(1);
        let mut rank_step = 1usize;
        let mut active = n_ranks;
        while n_g_ents / (active as u64) < min_block_size && active > 1 && rank_step < n_ranks {
            rank_step *= 2;
            active = (n_ranks / rank_step).max(1);
        }
        rank_step = rank_step.max(min_rank_step).min(n_ranks);
        let active = (n_ranks / rank_step).max(1);

        let block_size = n_g_ents.div_ceil(active as u64).max(1);
        let clamp = |g: u64| g.min(n_g_ents + 1);
        let gnum_range = if rank % rank_step == 0 {
            let b = (rank / rank_step) as u64;
            [clamp(b * block_size + 1), clamp((b + 1) * block_size + 1)]
        } else {
            let start = clamp((rank / rank_step + 1) as u64 * block_size + 1);
            [start, start]
        };

        Self {
            gnum_range,
            n_ranks: active,
            rank_step,
            block_size,
        }
    }

    /// Number of entities owned by this rank.
    pub fn n_local(&self) -> u64 {
        self.gnum_range[1] - self.gnum_range[0]
    }

    /// Destination rank of global number `g`, and its id inside the block.
    #[inline]
    fn locate(&self, index: usize, g: u64) -> Result<(usize, LocalId), ExchangeError> {
        if g == 0 {
            return Err(ExchangeError::InvalidGlobalNumber { index });
        }
        let block = (g - 1) / self.block_size;
        let id = (g - 1) % self.block_size;
        let rank = usize::try_from(block)
            .ok()
            .and_then(|b| b.checked_mul(self.rank_step))
            .ok_or(ExchangeError::InvalidGlobalNumber { index })?;
        let id = LocalId::try_from(id).map_err(|_| ExchangeError::CountOverflow(index))?;
        Ok((rank, id))
    }

    /// Destination rank of every 1-based global number and, if `with_ids`,
    /// its id inside the destination block.
    pub fn destinations(
        &self,
        global_numbers: &[u64],
        with_ids: bool,
    ) -> Result<(Vec<usize>, Option<Vec<LocalId>>), ExchangeError> {
        if self.block_size == 0 || self.rank_step == 0 {
            return Err(ExchangeError::InvalidBlockDistribution(format!(
                "block_size {} / rank_step {}",
                self.block_size, self.rank_step
            )));
        }

        #[cfg(feature = "rayon")]
        let located: Vec<(usize, LocalId)> = global_numbers
            .par_iter()
            .enumerate()
            .map(|(i, &g)| self.locate(i, g))
            .collect::<Result<_, _>>()?;

        #[cfg(not(feature = "rayon"))]
        let located: Vec<(usize, LocalId)> = global_numbers
            .iter()
            .enumerate()
            .map(|(i, &g)| self.locate(i, g))
            .collect::<Result<_, _>>()?;

        let (ranks, ids): (Vec<usize>, Vec<LocalId>) = located.into_iter().unzip();
        Ok((ranks, with_ids.then_some(ids)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(block_size: u64, rank_step: usize) -> BlockDistribution {
        BlockDistribution {
            gnum_range: [1, 1],
            n_ranks: 3,
            rank_step,
            block_size,
        }
    }

    #[test]
    fn ranks_and_ids_from_global_numbers() {
        let (ranks, ids) = info(4, 1).destinations(&[5, 1, 9], true).unwrap();
        assert_eq!(ranks, vec![1, 0, 2]);
        assert_eq!(ids, Some(vec![0, 0, 0]));
    }

    #[test]
    fn rank_step_spreads_blocks() {
        let (ranks, ids) = info(4, 2).destinations(&[4, 5, 12], false).unwrap();
        assert_eq!(ranks, vec![0, 2, 4]);
        assert_eq!(ids, None);
    }

    #[test]
    fn zero_global_number_rejected() {
        let err = info(4, 1).destinations(&[3, 0], false).unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidGlobalNumber { index: 1 }));
    }

    #[test]
    fn empty_block_size_rejected() {
        assert!(matches!(
            info(0, 1).destinations(&[1], false),
            Err(ExchangeError::InvalidBlockDistribution(_))
        ));
    }

    #[test]
    fn single_rank_owns_everything() {
        let bi = BlockDistribution::compute(0, 1, 1, 100, 7);
        assert_eq!(bi.gnum_range, [1, 8]);
        assert_eq!(bi.block_size, 7);
        assert_eq!(bi.n_local(), 7);
    }

    #[test]
    fn even_split_over_ranks() {
        let ranges: Vec<_> = (0..4)
            .map(|r| BlockDistribution::compute(r, 4, 1, 1, 10).gnum_range)
            .collect();
        assert_eq!(ranges, vec![[1, 4], [4, 7], [7, 10], [10, 11]]);
    }

    #[test]
    fn small_counts_double_the_step() {
        // 8 entities, at least 4 per block: 2 blocks on ranks 0 and 4
        let bi = BlockDistribution::compute(4, 8, 1, 4, 8);
        assert_eq!(bi.rank_step, 4);
        assert_eq!(bi.n_ranks, 2);
        assert_eq!(bi.block_size, 4);
        assert_eq!(bi.gnum_range, [5, 9]);
        let idle = BlockDistribution::compute(5, 8, 1, 4, 8);
        assert_eq!(idle.n_local(), 0);
    }

    #[test]
    fn min_rank_step_is_honored() {
        let bi = BlockDistribution::compute(0, 4, 2, 1, 100);
        assert_eq!(bi.rank_step, 2);
        assert_eq!(bi.n_ranks, 2);
        assert_eq!(bi.block_size, 50);
    }
}
