//! All-to-all redistribution of element arrays across a process group.
//!
//! A [`Distributor`] is built once from the destination rank (and
//! optionally the destination id) of every local element. It can then move
//! any number of arrays laid out like those elements to their destination
//! ranks, and move arrays laid out like the received elements back to
//! their source ranks (reverse exchange).
//!
//! Two interchangeable backends implement the exchange, selected by
//! [`DistributorConfig::algorithm`]:
//! - [`Algorithm::Direct`]: counts all-to-all, then a variable-size
//!   all-to-all of packed records ([`direct`]);
//! - [`Algorithm::CrystalRouter`]: a [`CrystalRouter`] collaborator that
//!   routes records and reports their provenance ([`crystal_router`]).
//!
//! Received records are grouped by source rank, in send order within a
//! group, unless [`DistFlags::ORDER_BY_DEST_ID`] places them at their
//! destination id. Every operation that exchanges data is collective: all
//! ranks of the group call it in the same order with the same element type
//! and stride.
//!
//! ```
//! use std::borrow::Cow;
//! use mesh_all_to_all::algs::all_to_all::{DistFlags, Distributor, DistributorConfig};
//! use mesh_all_to_all::algs::communicator::NoComm;
//!
//! let comm = NoComm;
//! let ranks = [0usize, 0, 0];
//! let mut d = Distributor::new(
//!     3,
//!     DistFlags::NONE,
//!     None,
//!     Cow::Borrowed(&ranks[..]),
//!     &comm,
//!     DistributorConfig::default(),
//! )
//! .unwrap();
//! let moved: Vec<f64> = d.copy_array(1, false, &[1.0, 2.0, 3.0]).unwrap();
//! assert_eq!(moved, vec![1.0, 2.0, 3.0]);
//! let back: Vec<f64> = d.copy_array(1, true, &moved).unwrap();
//! assert_eq!(back, vec![1.0, 2.0, 3.0]);
//! ```

pub mod block;
pub mod config;
pub mod crystal_router;
pub mod direct;
pub mod layout;
pub mod metrics;

pub use block::BlockDistribution;
pub use config::{Algorithm, DistFlags, DistributorConfig};
pub use crystal_router::{CrystalRouter, PairwiseRouter, RoutedData, RouterFlags, RouterRequest};
pub use metrics::{ExchangeMetrics, MetricsSnapshot, Timer, TimerStat};

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use bytemuck::Pod;
use itertools::Itertools;
use once_cell::unsync::OnceCell;

use crate::algs::communicator::Communicator;
use crate::algs::wire::{LocalId, cast_slice, cast_slice_mut};
use crate::debug_invariants::DebugInvariants;
use crate::exchange_error::ExchangeError;

use direct::DirectExchange;
use layout::ElementType;

fn check_len(what: &'static str, expected: usize, got: usize) -> Result<(), ExchangeError> {
    if expected == got {
        Ok(())
    } else {
        Err(ExchangeError::LengthMismatch {
            what,
            expected,
            got,
        })
    }
}

/// Provenance kept by the crystal-router backend for reverse exchanges and
/// source-rank queries. Arrays follow the forward output order.
#[derive(Debug, Default)]
struct RouterState {
    src_rank: Option<Vec<usize>>,
    src_id: Option<Vec<LocalId>>,
}

impl RouterState {
    fn has_provenance(&self) -> bool {
        self.src_rank.is_some() && self.src_id.is_some()
    }

    /// Create, run and read one router exchange, timing it as a call of
    /// `timer` (router creation time is charged without a call).
    fn route<C: Communicator>(
        comm: &C,
        metrics: &ExchangeMetrics,
        timer: Timer,
        request: RouterRequest<'_>,
    ) -> Result<(usize, RoutedData), ExchangeError> {
        let t0 = Instant::now();
        let mut cr = PairwiseRouter::create(request, comm)?;
        metrics.add_time(timer, t0.elapsed());
        metrics.timed(timer, || cr.exchange())?;
        let n = cr.n_elts();
        Ok((n, cr.into_data()))
    }

    /// Forward exchange. Provenance is requested until it has been captured.
    #[allow(clippy::too_many_arguments)]
    fn forward<C: Communicator>(
        &mut self,
        comm: &C,
        metrics: &ExchangeMetrics,
        timer: Timer,
        flags: DistFlags,
        dest_rank: &[usize],
        dest_id: Option<&[LocalId]>,
        elt_type: ElementType,
        stride: usize,
        src: &[u8],
    ) -> Result<(usize, Vec<u8>), ExchangeError> {
        let mut cr_flags = RouterFlags::NONE;
        if flags.order_by_dest_id() {
            cr_flags = cr_flags | RouterFlags::USE_DEST_ID;
        }
        if self.src_rank.is_none() && (flags.tracks_src_rank() || flags.reverse_allowed()) {
            cr_flags = cr_flags | RouterFlags::ADD_SRC_RANK;
        }
        if self.src_id.is_none() && flags.reverse_allowed() {
            cr_flags = cr_flags | RouterFlags::ADD_SRC_ID;
        }

        let request = RouterRequest {
            elt_type,
            stride,
            flags: cr_flags,
            data: src,
            dest_id,
            dest_rank,
        };
        let (n, routed) = Self::route(comm, metrics, timer, request)?;
        if routed.src_rank.is_some() {
            self.src_rank = routed.src_rank;
        }
        if routed.src_id.is_some() {
            self.src_id = routed.src_id;
        }
        Ok((n, routed.data))
    }

    /// Send data laid out like the forward output back to its source slots.
    fn reverse<C: Communicator>(
        &self,
        comm: &C,
        metrics: &ExchangeMetrics,
        elt_type: ElementType,
        stride: usize,
        src: &[u8],
    ) -> Result<(usize, Vec<u8>), ExchangeError> {
        let (Some(src_rank), Some(src_id)) = (&self.src_rank, &self.src_id) else {
            return Err(ExchangeError::MissingReverseMetadata(
                "crystal router provenance was not captured",
            ));
        };
        let request = RouterRequest {
            elt_type,
            stride,
            flags: RouterFlags::USE_DEST_ID,
            data: src,
            dest_id: Some(src_id),
            dest_rank: src_rank,
        };
        let (n, routed) = Self::route(comm, metrics, Timer::Exchange, request)?;
        Ok((n, routed.data))
    }
}

#[derive(Debug)]
enum Backend {
    Direct(DirectExchange),
    Router(RouterState),
}

/// Redistribution plan of `n_elts_src` local elements.
///
/// `'c` is the lifetime of the communicator, `'a` the lifetime of borrowed
/// destination arrays (`'static` once owned, see [`into_owned`](Self::into_owned)).
///
/// Metadata (how many records each rank receives) is resolved lazily by the
/// first operation that needs it and cached afterwards.
pub struct Distributor<'c, 'a, C: Communicator> {
    comm: &'c C,
    config: DistributorConfig,
    flags: DistFlags,
    n_elts_src: usize,
    n_elts_dest: Option<usize>,
    dest_rank: Cow<'a, [usize]>,
    dest_id: Option<Cow<'a, [LocalId]>>,
    /// Destination id of every received record in arrival order (direct
    /// backend, `ORDER_BY_DEST_ID` only).
    recv_id: Option<Vec<LocalId>>,
    src_rank: OnceCell<Vec<usize>>,
    backend: Backend,
}

impl<C: Communicator> std::fmt::Debug for Distributor<'_, '_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributor")
            .field("rank", &self.comm.rank())
            .field("algorithm", &self.config.algorithm)
            .field("flags", &self.flags)
            .field("n_elts_src", &self.n_elts_src)
            .field("n_elts_dest", &self.n_elts_dest)
            .field("backend", &self.backend)
            .finish()
    }
}

impl<'c, 'a, C: Communicator> Distributor<'c, 'a, C> {
    /// Plan the redistribution of `n_elts` elements, element `i` going to
    /// rank `dest_rank[i]` (and to slot `dest_id[i]` there when ordering by
    /// destination id).
    ///
    /// Local only: no communication happens until metadata is needed.
    pub fn new(
        n_elts: usize,
        flags: DistFlags,
        dest_id: Option<Cow<'a, [LocalId]>>,
        dest_rank: Cow<'a, [usize]>,
        comm: &'c C,
        config: DistributorConfig,
    ) -> Result<Self, ExchangeError> {
        let t0 = Instant::now();
        flags.validate()?;
        check_len("dest_rank", n_elts, dest_rank.len())?;
        let dest_id = match dest_id {
            Some(ids) if flags.order_by_dest_id() => {
                check_len("dest_id", n_elts, ids.len())?;
                Some(ids)
            }
            Some(_) => {
                log::warn!(
                    "[all_to_all] destination ids given without ORDER_BY_DEST_ID are ignored"
                );
                None
            }
            None if flags.order_by_dest_id() => return Err(ExchangeError::MissingDestIds),
            None => None,
        };
        let n_ranks = comm.size();
        if let Some((index, &rank)) = dest_rank.iter().find_position(|&&r| r >= n_ranks) {
            return Err(ExchangeError::RankOutOfRange {
                index,
                rank,
                n_ranks,
            });
        }

        let backend = match config.algorithm {
            Algorithm::Direct => Backend::Direct(DirectExchange::new(
                comm.rank(),
                n_ranks,
                flags.order_by_dest_id(),
            )),
            Algorithm::CrystalRouter => Backend::Router(RouterState::default()),
        };
        log::debug!(
            "[all_to_all] rank {}: distributor for {} elements, {:?}, {} backend",
            comm.rank(),
            n_elts,
            flags,
            config.algorithm
        );
        config.metrics.add_time(Timer::Total, t0.elapsed());

        Ok(Self {
            comm,
            config,
            flags,
            n_elts_src: n_elts,
            n_elts_dest: None,
            dest_rank,
            dest_id,
            recv_id: None,
            src_rank: OnceCell::new(),
            backend,
        })
    }

    /// Copy borrowed destination arrays so the distributor no longer
    /// borrows from the caller.
    pub fn into_owned(self) -> Distributor<'c, 'static, C> {
        Distributor {
            comm: self.comm,
            config: self.config,
            flags: self.flags,
            n_elts_src: self.n_elts_src,
            n_elts_dest: self.n_elts_dest,
            dest_rank: Cow::Owned(self.dest_rank.into_owned()),
            dest_id: self.dest_id.map(|ids| Cow::Owned(ids.into_owned())),
            recv_id: self.recv_id,
            src_rank: self.src_rank,
            backend: self.backend,
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.config.algorithm
    }

    pub fn flags(&self) -> DistFlags {
        self.flags
    }

    pub fn n_elts_src(&self) -> usize {
        self.n_elts_src
    }

    /// Whether the receive counts are known.
    pub fn is_resolved(&self) -> bool {
        self.n_elts_dest.is_some()
    }

    pub fn metrics(&self) -> &Arc<ExchangeMetrics> {
        &self.config.metrics
    }

    /// Number of elements this rank receives.
    ///
    /// Collective on the first call; cached afterwards. Only the resolving
    /// call is instrumented.
    pub fn n_elts_dest(&mut self) -> Result<usize, ExchangeError> {
        if let Some(n) = self.n_elts_dest {
            return Ok(n);
        }
        let metrics = Arc::clone(&self.config.metrics);
        metrics.timed(Timer::Total, || self.resolve_metadata())
    }

    fn resolve_metadata(&mut self) -> Result<usize, ExchangeError> {
        if let Some(n) = self.n_elts_dest {
            return Ok(n);
        }
        let metrics = &self.config.metrics;
        let n = match &mut self.backend {
            Backend::Direct(dx) => dx.exchange_meta(&self.dest_rank, self.comm, metrics)?,
            Backend::Router(rs) => {
                rs.forward(
                    self.comm,
                    metrics,
                    Timer::Metadata,
                    self.flags,
                    &self.dest_rank,
                    self.dest_id.as_deref(),
                    ElementType::NULL,
                    0,
                    &[],
                )?
                .0
            }
        };
        self.n_elts_dest = Some(n);
        log::debug!(
            "[all_to_all] rank {}: {} elements sent, {} received",
            self.comm.rank(),
            self.n_elts_src,
            n
        );
        Ok(n)
    }

    /// Make sure a reverse exchange can route records back: receive counts,
    /// received destination ids when ordering by destination id (direct
    /// backend), or router provenance. Runs a payload-free forward exchange
    /// when something is missing.
    fn ensure_reverse_metadata(&mut self) -> Result<usize, ExchangeError> {
        let n = self.resolve_metadata()?;
        let metrics = &self.config.metrics;
        match &mut self.backend {
            Backend::Direct(dx) if self.flags.order_by_dest_id() && self.recv_id.is_none() => {
                log::debug!("[all_to_all] exchanging destination ids before reverse exchange");
                let dest_id = self.dest_id.as_deref();
                dx.resolve_dest_ids(self.comm, metrics, dest_id, &mut self.recv_id)?;
            }
            Backend::Router(rs) if !rs.has_provenance() => {
                log::debug!("[all_to_all] routing provenance before reverse exchange");
                rs.forward(
                    self.comm,
                    metrics,
                    Timer::Metadata,
                    self.flags,
                    &self.dest_rank,
                    self.dest_id.as_deref(),
                    ElementType::NULL,
                    0,
                    &[],
                )?;
            }
            _ => {}
        }
        Ok(n)
    }

    fn exchange_array<T: Pod>(
        &mut self,
        stride: usize,
        reverse: bool,
        src: &[T],
        dest: &mut [T],
    ) -> Result<(), ExchangeError> {
        if reverse && !self.flags.reverse_allowed() {
            return Err(ExchangeError::ReverseDisabled);
        }
        let elt_type = ElementType::of::<T>();

        if reverse {
            let n_dest = self.ensure_reverse_metadata()?;
            check_len("reverse source array", n_dest * stride, src.len())?;
            check_len("reverse destination array", self.n_elts_src * stride, dest.len())?;
            let metrics = &self.config.metrics;
            match &mut self.backend {
                Backend::Direct(dx) => dx.exchange(
                    self.comm,
                    metrics,
                    elt_type,
                    stride,
                    true,
                    cast_slice(src),
                    None,
                    &mut self.recv_id,
                    cast_slice_mut(dest),
                )?,
                Backend::Router(rs) => {
                    let (n, data) =
                        rs.reverse(self.comm, metrics, elt_type, stride, cast_slice(src))?;
                    check_len("reverse router output", self.n_elts_src, n)?;
                    cast_slice_mut(dest).copy_from_slice(&data);
                }
            }
            return Ok(());
        }

        check_len("source array", self.n_elts_src * stride, src.len())?;
        if matches!(self.backend, Backend::Direct(_)) {
            self.resolve_metadata()?;
        }
        if let Some(n_dest) = self.n_elts_dest {
            check_len("destination array", n_dest * stride, dest.len())?;
        }
        let metrics = &self.config.metrics;
        match &mut self.backend {
            Backend::Direct(dx) => dx.exchange(
                self.comm,
                metrics,
                elt_type,
                stride,
                false,
                cast_slice(src),
                self.dest_id.as_deref(),
                &mut self.recv_id,
                cast_slice_mut(dest),
            )?,
            Backend::Router(_) => {
                let (n, data) = self.route_forward(elt_type, stride, cast_slice(src))?;
                check_len("destination array", n * stride, dest.len())?;
                cast_slice_mut(dest).copy_from_slice(&data);
            }
        }
        crate::debug_invariants!(self.validate_invariants(), "distributor after forward exchange");
        Ok(())
    }

    /// Forward exchange through the router. The first one also resolves
    /// the receive count.
    fn route_forward(
        &mut self,
        elt_type: ElementType,
        stride: usize,
        src: &[u8],
    ) -> Result<(usize, Vec<u8>), ExchangeError> {
        let Backend::Router(rs) = &mut self.backend else {
            return Err(ExchangeError::InvariantViolation(
                "router exchange on a direct distributor".into(),
            ));
        };
        let (n, data) = rs.forward(
            self.comm,
            &self.config.metrics,
            Timer::Exchange,
            self.flags,
            &self.dest_rank,
            self.dest_id.as_deref(),
            elt_type,
            stride,
            src,
        )?;
        match self.n_elts_dest {
            Some(prev) if prev != n => {
                return Err(ExchangeError::InvariantViolation(format!(
                    "router delivered {n} elements, {prev} expected"
                )));
            }
            Some(_) => {}
            None => self.n_elts_dest = Some(n),
        }
        Ok((n, data))
    }

    /// Elements produced by an exchange in the given direction.
    fn output_len(&mut self, reverse: bool) -> Result<usize, ExchangeError> {
        if reverse {
            if !self.flags.reverse_allowed() {
                return Err(ExchangeError::ReverseDisabled);
            }
            Ok(self.n_elts_src)
        } else {
            self.resolve_metadata()
        }
    }

    /// Exchange `stride` values per element and return the received array.
    ///
    /// Forward: `src` has `n_elts_src * stride` values, the result
    /// `n_elts_dest * stride`. Reverse: the other way around, with the
    /// result in the original source order.
    pub fn copy_array<T: Pod>(
        &mut self,
        stride: usize,
        reverse: bool,
        src: &[T],
    ) -> Result<Vec<T>, ExchangeError> {
        let metrics = Arc::clone(&self.config.metrics);
        metrics.timed(Timer::Total, || {
            if !reverse && !self.is_resolved() && matches!(self.backend, Backend::Router(_)) {
                // the routed exchange itself tells how many elements arrive
                check_len("source array", self.n_elts_src * stride, src.len())?;
                let (n, data) =
                    self.route_forward(ElementType::of::<T>(), stride, cast_slice(src))?;
                let mut dest = vec![T::zeroed(); n * stride];
                cast_slice_mut(&mut dest).copy_from_slice(&data);
                return Ok(dest);
            }
            let n_out = self.output_len(reverse)?;
            let mut dest = vec![T::zeroed(); n_out * stride];
            self.exchange_array(stride, reverse, src, &mut dest)?;
            Ok(dest)
        })
    }

    /// Like [`copy_array`](Self::copy_array), into a caller buffer of
    /// exactly the output length.
    pub fn copy_array_into<T: Pod>(
        &mut self,
        stride: usize,
        reverse: bool,
        src: &[T],
        dest: &mut [T],
    ) -> Result<(), ExchangeError> {
        let metrics = Arc::clone(&self.config.metrics);
        metrics.timed(Timer::Total, || self.exchange_array(stride, reverse, src, dest))
    }

    fn exchange_index(
        &mut self,
        reverse: bool,
        src_index: &[usize],
        dest_index: &mut [usize],
    ) -> Result<(), ExchangeError> {
        let n_src = if reverse {
            if !self.flags.reverse_allowed() {
                return Err(ExchangeError::ReverseDisabled);
            }
            self.ensure_reverse_metadata()?
        } else {
            self.n_elts_src
        };
        check_len("source index", n_src + 1, src_index.len())?;
        let counts: Vec<u64> = src_index
            .iter()
            .tuple_windows()
            .enumerate()
            .map(|(i, (&a, &b))| {
                b.checked_sub(a)
                    .map(|c| c as u64)
                    .ok_or(ExchangeError::NonMonotonicIndex(i + 1))
            })
            .collect::<Result<_, _>>()?;

        let n_out = dest_index.len().saturating_sub(1);
        let mut recv = vec![0u64; n_out];
        self.exchange_array(1, reverse, &counts, &mut recv)?;

        dest_index[0] = 0;
        for (i, &c) in recv.iter().enumerate() {
            let c = usize::try_from(c).map_err(|_| ExchangeError::CountOverflow(i))?;
            dest_index[i + 1] = dest_index[i] + c;
        }
        Ok(())
    }

    /// Exchange an index (prefix sum with one more entry than elements) and
    /// return the matching index on the receiving side, starting at 0.
    pub fn copy_index(
        &mut self,
        reverse: bool,
        src_index: &[usize],
    ) -> Result<Vec<usize>, ExchangeError> {
        let metrics = Arc::clone(&self.config.metrics);
        metrics.timed(Timer::Total, || {
            let n_out = self.output_len(reverse)?;
            let mut dest_index = vec![0usize; n_out + 1];
            self.exchange_index(reverse, src_index, &mut dest_index)?;
            Ok(dest_index)
        })
    }

    /// Like [`copy_index`](Self::copy_index), into a caller buffer of
    /// `output elements + 1` entries.
    pub fn copy_index_into(
        &mut self,
        reverse: bool,
        src_index: &[usize],
        dest_index: &mut [usize],
    ) -> Result<(), ExchangeError> {
        let metrics = Arc::clone(&self.config.metrics);
        metrics.timed(Timer::Total, || {
            let n_out = self.output_len(reverse)?;
            check_len("destination index", n_out + 1, dest_index.len())?;
            self.exchange_index(reverse, src_index, dest_index)
        })
    }

    /// Exchange a variable number of values per element.
    ///
    /// `src_index` and `dest_index` are the indexes of `src_data` and of the
    /// result on this rank (`dest_index` typically comes from
    /// [`copy_index`](Self::copy_index)). Values of one element stay
    /// contiguous and in order.
    pub fn copy_indexed<T: Pod>(
        &mut self,
        reverse: bool,
        src_index: &[usize],
        src_data: &[T],
        dest_index: &[usize],
    ) -> Result<Vec<T>, ExchangeError> {
        let metrics = Arc::clone(&self.config.metrics);
        metrics.timed(Timer::Total, || {
            if reverse && !self.flags.reverse_allowed() {
                return Err(ExchangeError::ReverseDisabled);
            }
            let n_dest = self.resolve_metadata()?;
            // index of the forward source side and of the forward output side
            let (fwd_src_index, fwd_dest_index) = if reverse {
                (dest_index, src_index)
            } else {
                (src_index, dest_index)
            };
            check_len("source-side index", self.n_elts_src + 1, fwd_src_index.len())?;
            check_len("destination-side index", n_dest + 1, fwd_dest_index.len())?;
            let n_src_vals = fwd_src_index[self.n_elts_src];
            let n_dest_vals = fwd_dest_index[n_dest];
            let (n_in, n_out) = if reverse {
                (n_dest_vals, n_src_vals)
            } else {
                (n_src_vals, n_dest_vals)
            };
            check_len("indexed source data", n_in, src_data.len())?;

            let mut values = self.value_distributor(fwd_src_index, fwd_dest_index, n_dest)?;
            let out = values.copy_array(1, reverse, src_data)?;
            check_len("indexed destination data", n_out, out.len())?;
            Ok(out)
        })
    }

    /// Distributor moving the individual values of an indexed array, built
    /// from the element-level plan.
    fn value_distributor(
        &mut self,
        fwd_src_index: &[usize],
        fwd_dest_index: &[usize],
        n_dest: usize,
    ) -> Result<Distributor<'c, 'static, C>, ExchangeError> {
        // first value slot of every element on its destination rank
        let remote_start = if self.flags.order_by_dest_id() {
            if !self.flags.reverse_allowed() {
                return Err(ExchangeError::ReverseDisabled);
            }
            let starts: Vec<u64> = fwd_dest_index[..n_dest].iter().map(|&s| s as u64).collect();
            let mut remote = vec![0u64; self.n_elts_src];
            self.exchange_array(1, true, &starts, &mut remote)?;
            Some(remote)
        } else {
            None
        };

        let n_vals = fwd_src_index[self.n_elts_src];
        let mut val_rank = Vec::with_capacity(n_vals);
        let mut val_id = remote_start.as_ref().map(|_| Vec::with_capacity(n_vals));
        for (j, (&a, &b)) in fwd_src_index.iter().tuple_windows().enumerate() {
            if b < a {
                return Err(ExchangeError::NonMonotonicIndex(j + 1));
            }
            val_rank.extend(std::iter::repeat_n(self.dest_rank[j], b - a));
            if let (Some(ids), Some(starts)) = (val_id.as_mut(), remote_start.as_ref()) {
                for k in 0..(b - a) as u64 {
                    let id = LocalId::try_from(starts[j] + k)
                        .map_err(|_| ExchangeError::CountOverflow(j))?;
                    ids.push(id);
                }
            }
        }

        let flags = if self.flags.order_by_dest_id() {
            DistFlags::ORDER_BY_DEST_ID
        } else {
            DistFlags::NONE
        };
        Distributor::new(
            n_vals,
            flags,
            val_id.map(Cow::Owned),
            Cow::Owned(val_rank),
            self.comm,
            self.config.clone(),
        )
    }

    /// Rank each received element came from, in output order.
    ///
    /// Requires [`DistFlags::USE_SRC_RANK`] or
    /// [`DistFlags::ORDER_BY_SRC_RANK`]. Collective on the first call if
    /// metadata is not resolved yet.
    pub fn src_rank(&mut self) -> Result<&[usize], ExchangeError> {
        if !self.flags.tracks_src_rank() {
            return Err(ExchangeError::SrcRankNotTracked {
                flags: self.flags.bits(),
            });
        }
        if self.src_rank.get().is_none() {
            let metrics = Arc::clone(&self.config.metrics);
            let ranks = metrics.timed(Timer::Total, || self.collect_src_rank())?;
            let _ = self.src_rank.set(ranks);
        }
        Ok(self.src_rank.get().map(Vec::as_slice).unwrap_or_default())
    }

    fn collect_src_rank(&mut self) -> Result<Vec<usize>, ExchangeError> {
        self.resolve_metadata()?;
        let metrics = &self.config.metrics;
        match &mut self.backend {
            Backend::Direct(dx) => {
                if self.flags.order_by_dest_id() {
                    let dest_id = self.dest_id.as_deref();
                    dx.resolve_dest_ids(self.comm, metrics, dest_id, &mut self.recv_id)?;
                }
                Ok(dx.src_rank(self.recv_id.as_deref()))
            }
            Backend::Router(rs) => {
                if rs.src_rank.is_none() {
                    rs.forward(
                        self.comm,
                        metrics,
                        Timer::Metadata,
                        self.flags,
                        &self.dest_rank,
                        self.dest_id.as_deref(),
                        ElementType::NULL,
                        0,
                        &[],
                    )?;
                }
                rs.src_rank
                    .clone()
                    .ok_or(ExchangeError::MissingReverseMetadata(
                        "crystal router did not report source ranks",
                    ))
            }
        }
    }

    /// Release the distributor, charging the release to the total timer.
    pub fn destroy(self) {
        let metrics = Arc::clone(&self.config.metrics);
        let rank = self.comm.rank();
        let t0 = Instant::now();
        drop(self);
        metrics.add_time(Timer::Total, t0.elapsed());
        log::trace!("[all_to_all] rank {rank}: distributor destroyed");
    }
}

impl<C: Communicator> DebugInvariants for Distributor<'_, '_, C> {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "Distributor");
    }

    fn validate_invariants(&self) -> Result<(), ExchangeError> {
        check_len("dest_rank", self.n_elts_src, self.dest_rank.len())?;
        if let Some(ids) = &self.dest_id {
            check_len("dest_id", self.n_elts_src, ids.len())?;
        }
        if let (Some(n_dest), Some(recv_id)) = (self.n_elts_dest, &self.recv_id) {
            check_len("recv_id", n_dest, recv_id.len())?;
        }
        match &self.backend {
            Backend::Direct(dx) if self.n_elts_dest.is_some() => dx.validate_invariants(),
            Backend::Router(rs) => {
                if let (Some(n_dest), Some(ranks)) = (self.n_elts_dest, &rs.src_rank) {
                    check_len("router src_rank", n_dest, ranks.len())?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl<'c, C: Communicator> Distributor<'c, 'static, C> {
    /// Plan the redistribution of elements identified by 1-based global
    /// numbers to the ranks owning their blocks.
    ///
    /// With [`DistFlags::ORDER_BY_DEST_ID`], elements are placed at their
    /// position inside the destination block.
    pub fn from_block_distribution(
        n_elts: usize,
        flags: DistFlags,
        global_numbers: &[u64],
        block: &BlockDistribution,
        comm: &'c C,
        config: DistributorConfig,
    ) -> Result<Self, ExchangeError> {
        check_len("global_numbers", n_elts, global_numbers.len())?;
        let (dest_rank, dest_id) = block.destinations(global_numbers, flags.order_by_dest_id())?;
        Distributor::new(
            n_elts,
            flags,
            dest_id.map(Cow::Owned),
            Cow::Owned(dest_rank),
            comm,
            config,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;

    fn serial(
        flags: DistFlags,
        ranks: &[usize],
        ids: Option<&[LocalId]>,
    ) -> Distributor<'static, 'static, NoComm> {
        static COMM: NoComm = NoComm;
        Distributor::new(
            ranks.len(),
            flags,
            ids.map(|v| Cow::Owned(v.to_vec())),
            Cow::Owned(ranks.to_vec()),
            &COMM,
            DistributorConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn conflicting_flags_rejected() {
        let err = Distributor::new(
            0,
            DistFlags::ORDER_BY_DEST_ID | DistFlags::ORDER_BY_SRC_RANK,
            Some(Cow::Borrowed(&[][..])),
            Cow::Borrowed(&[][..]),
            &NoComm,
            DistributorConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ExchangeError::ConflictingOrderFlags { .. }));
    }

    #[test]
    fn ordering_requires_dest_ids() {
        let err = Distributor::new(
            1,
            DistFlags::ORDER_BY_DEST_ID,
            None,
            Cow::Borrowed(&[0][..]),
            &NoComm,
            DistributorConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ExchangeError::MissingDestIds));
    }

    #[test]
    fn out_of_group_rank_rejected() {
        let err = Distributor::new(
            2,
            DistFlags::NONE,
            None,
            Cow::Borrowed(&[0, 3][..]),
            &NoComm,
            DistributorConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ExchangeError::RankOutOfRange { index: 1, rank: 3, n_ranks: 1 }));
    }

    #[test]
    fn ordered_reverse_before_forward() {
        let mut d = serial(DistFlags::ORDER_BY_DEST_ID, &[0, 0, 0], Some(&[2, 0, 1]));
        // data laid out in destination order goes back to source order
        let back: Vec<i32> = d.copy_array(1, true, &[20, 0, 10]).unwrap();
        assert_eq!(back, vec![10, 20, 0]);
        let fwd: Vec<i32> = d.copy_array(1, false, &back).unwrap();
        assert_eq!(fwd, vec![20, 0, 10]);
    }

    #[test]
    fn index_exchange_rebuilds_prefix_sum() {
        let mut d = serial(DistFlags::NONE, &[0, 0], None);
        assert_eq!(d.copy_index(false, &[0, 2, 5]).unwrap(), vec![0, 2, 5]);
        assert!(matches!(
            d.copy_index(false, &[0, 2, 1]),
            Err(ExchangeError::NonMonotonicIndex(2))
        ));
    }

    #[test]
    fn src_rank_needs_tracking_flag() {
        let mut d = serial(DistFlags::NONE, &[0], None);
        assert!(matches!(d.src_rank(), Err(ExchangeError::SrcRankNotTracked { flags: 0 })));
        let mut d = serial(DistFlags::USE_SRC_RANK, &[0, 0], None);
        assert_eq!(d.src_rank().unwrap(), &[0, 0]);
    }

    #[test]
    fn cached_receive_count_is_not_instrumented() {
        let mut d = serial(DistFlags::NONE, &[0, 0, 0], None);
        assert_eq!(d.n_elts_dest().unwrap(), 3);
        assert_eq!(d.n_elts_dest().unwrap(), 3);
        assert_eq!(d.metrics().calls(Timer::Total), 1);
        assert_eq!(d.metrics().calls(Timer::Metadata), 1);
    }

    #[test]
    fn into_owned_releases_caller_arrays() {
        let d = {
            let ranks = vec![0usize; 2];
            Distributor::new(
                2,
                DistFlags::NONE,
                None,
                Cow::Borrowed(&ranks[..]),
                &NoComm,
                DistributorConfig::default(),
            )
            .unwrap()
            .into_owned()
        };
        let mut d = d;
        assert_eq!(d.n_elts_dest().unwrap(), 2);
        d.validate_invariants().unwrap();
        d.destroy();
    }
}
