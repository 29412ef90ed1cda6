//! Crystal-router collaborator.
//!
//! The distributor only depends on the [`CrystalRouter`] contract: build a
//! router from a batch of records, run one collective exchange, then read
//! back the received records together with whatever provenance was asked
//! for. Dropping the router releases it.
//!
//! [`PairwiseRouter`] implements the contract by sending every record
//! straight to its destination rank. Each record travels with a
//! [`WireRouteHdr`] (destination id and source id); the source rank is the
//! sender of the message that carried it.

use std::fmt;
use std::ops::BitOr;

use crate::algs::communicator::Communicator;
use crate::algs::wire::{LocalId, WireRouteHdr};
use crate::exchange_error::ExchangeError;

use super::layout::{self, ElementType};

/// Options of one routed exchange.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct RouterFlags(u32);

impl RouterFlags {
    pub const NONE: RouterFlags = RouterFlags(0);
    /// Deliver records at their destination id instead of arrival order.
    pub const USE_DEST_ID: RouterFlags = RouterFlags(1 << 0);
    /// Report the source id (index on the sending rank) of every record.
    pub const ADD_SRC_ID: RouterFlags = RouterFlags(1 << 1);
    /// Report the sending rank of every record.
    pub const ADD_SRC_RANK: RouterFlags = RouterFlags(1 << 2);

    #[inline]
    pub const fn contains(self, other: RouterFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for RouterFlags {
    type Output = RouterFlags;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for RouterFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouterFlags({:#05b})", self.0)
    }
}

/// Records handed to a router.
#[derive(Copy, Clone, Debug)]
pub struct RouterRequest<'d> {
    pub elt_type: ElementType,
    pub stride: usize,
    pub flags: RouterFlags,
    /// `dest_rank.len() * elt_type.size * stride` payload bytes.
    pub data: &'d [u8],
    /// Required with [`RouterFlags::USE_DEST_ID`].
    pub dest_id: Option<&'d [LocalId]>,
    pub dest_rank: &'d [usize],
}

impl RouterRequest<'_> {
    pub fn n_elts(&self) -> usize {
        self.dest_rank.len()
    }

    pub fn elt_size(&self) -> usize {
        self.elt_type.size * self.stride
    }
}

/// What a router delivered to this rank.
///
/// `data` and every provenance array follow the output order: destination
/// id order with [`RouterFlags::USE_DEST_ID`], otherwise grouped by source
/// rank, in send order within a group. `recv_id` is the exception: it lists
/// the destination id of each record in arrival order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutedData {
    pub src_rank: Option<Vec<usize>>,
    pub recv_id: Option<Vec<LocalId>>,
    pub src_id: Option<Vec<LocalId>>,
    pub data: Vec<u8>,
}

/// Collaborator contract of the crystal-router backend.
pub trait CrystalRouter<'c, C: Communicator>: Sized {
    /// Take a copy of the records described by `request`.
    fn create(request: RouterRequest<'_>, comm: &'c C) -> Result<Self, ExchangeError>;

    /// Move every record to its destination rank.
    ///
    /// Collective and blocking.
    fn exchange(&mut self) -> Result<(), ExchangeError>;

    /// Number of records held on this rank (received ones after
    /// [`exchange`](Self::exchange)).
    fn n_elts(&self) -> usize;

    fn into_data(self) -> RoutedData;
}

/// Router that sends each record directly to its destination rank.
pub struct PairwiseRouter<'c, C: Communicator> {
    comm: &'c C,
    flags: RouterFlags,
    elt_size: usize,
    /// Records grouped by destination rank.
    send: Vec<u8>,
    send_count: Vec<usize>,
    recv: Vec<u8>,
    recv_count: Vec<usize>,
    exchanged: bool,
}

impl<C: Communicator> fmt::Debug for PairwiseRouter<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairwiseRouter")
            .field("rank", &self.comm.rank())
            .field("flags", &self.flags)
            .field("elt_size", &self.elt_size)
            .field("send_count", &self.send_count)
            .field("recv_count", &self.recv_count)
            .field("exchanged", &self.exchanged)
            .finish()
    }
}

impl<C: Communicator> PairwiseRouter<'_, C> {
    fn record_size(&self) -> usize {
        WireRouteHdr::SIZE + self.elt_size
    }

    fn header(&self, i: usize) -> WireRouteHdr {
        let rs = self.record_size();
        bytemuck::pod_read_unaligned(&self.recv[i * rs..i * rs + WireRouteHdr::SIZE])
    }
}

fn displacements(count: &[usize]) -> Vec<usize> {
    let mut acc = 0;
    count
        .iter()
        .map(|&c| {
            let d = acc;
            acc += c;
            d
        })
        .collect()
}

impl<'c, C: Communicator> CrystalRouter<'c, C> for PairwiseRouter<'c, C> {
    fn create(request: RouterRequest<'_>, comm: &'c C) -> Result<Self, ExchangeError> {
        let n = request.n_elts();
        let n_ranks = comm.size();
        let elt_size = request.elt_size();
        if request.data.len() != n * elt_size {
            return Err(ExchangeError::LengthMismatch {
                what: "router payload bytes",
                expected: n * elt_size,
                got: request.data.len(),
            });
        }
        let dest_id = match (request.flags.contains(RouterFlags::USE_DEST_ID), request.dest_id) {
            (true, None) => return Err(ExchangeError::MissingDestIds),
            (true, Some(ids)) if ids.len() != n => {
                return Err(ExchangeError::LengthMismatch {
                    what: "router dest_id",
                    expected: n,
                    got: ids.len(),
                });
            }
            (true, ids) => ids,
            (false, _) => None,
        };
        if let Some((index, &rank)) = request
            .dest_rank
            .iter()
            .enumerate()
            .find(|(_, r)| **r >= n_ranks)
        {
            return Err(ExchangeError::RankOutOfRange {
                index,
                rank,
                n_ranks,
            });
        }

        let mut send_count = vec![0usize; n_ranks];
        for &r in request.dest_rank {
            send_count[r] += 1;
        }
        let mut send_displ = displacements(&send_count);
        send_displ.push(n);
        let positions = layout::send_positions(request.dest_rank, &send_displ);

        let rs = WireRouteHdr::SIZE + elt_size;
        let mut send = vec![0u8; n * rs];
        for (j, &p) in positions.iter().enumerate() {
            let rec = &mut send[p * rs..(p + 1) * rs];
            let hdr = WireRouteHdr::new(dest_id.map_or(0, |ids| ids[j]), j as LocalId);
            rec[..WireRouteHdr::SIZE].copy_from_slice(bytemuck::bytes_of(&hdr));
            rec[WireRouteHdr::SIZE..]
                .copy_from_slice(&request.data[j * elt_size..(j + 1) * elt_size]);
        }

        Ok(Self {
            comm,
            flags: request.flags,
            elt_size,
            send,
            send_count,
            recv: Vec::new(),
            recv_count: vec![0; n_ranks],
            exchanged: false,
        })
    }

    fn exchange(&mut self) -> Result<(), ExchangeError> {
        let rs = self.record_size();
        let counts: Vec<u64> = self.send_count.iter().map(|&c| c as u64).collect();
        self.recv_count = self
            .comm
            .all_to_all_counts(&counts)?
            .into_iter()
            .map(|c| usize::try_from(c).map_err(|_| ExchangeError::CountOverflow(usize::MAX)))
            .collect::<Result<_, _>>()?;
        let n_recv: usize = self.recv_count.iter().sum();

        let scale = |v: Vec<usize>| -> Vec<usize> { v.into_iter().map(|x| x * rs).collect() };
        let send_counts = scale(self.send_count.clone());
        let send_displs = scale(displacements(&self.send_count));
        let recv_counts = scale(self.recv_count.clone());
        let recv_displs = scale(displacements(&self.recv_count));

        self.recv = vec![0u8; n_recv * rs];
        self.comm.all_to_all_bytes(
            &self.send,
            &send_counts,
            &send_displs,
            &mut self.recv,
            &recv_counts,
            &recv_displs,
        )?;
        self.send = Vec::new();
        self.exchanged = true;

        if self.flags.contains(RouterFlags::USE_DEST_ID) {
            let ids: Vec<LocalId> = (0..n_recv).map(|i| self.header(i).dest_id()).collect();
            layout::check_dest_ids(&ids, n_recv)?;
        }
        log::trace!(
            "[crystal_router] rank {}: {} records routed in, {} bytes each",
            self.comm.rank(),
            n_recv,
            rs
        );
        Ok(())
    }

    fn n_elts(&self) -> usize {
        if self.exchanged {
            self.recv_count.iter().sum()
        } else {
            self.send_count.iter().sum()
        }
    }

    fn into_data(self) -> RoutedData {
        if !self.exchanged {
            return RoutedData::default();
        }
        let n = self.n_elts();
        let rs = self.record_size();
        let es = self.elt_size;
        let by_dest_id = self.flags.contains(RouterFlags::USE_DEST_ID);

        let mut data = vec![0u8; n * es];
        let mut src_rank = self
            .flags
            .contains(RouterFlags::ADD_SRC_RANK)
            .then(|| vec![0usize; n]);
        let mut src_id = self
            .flags
            .contains(RouterFlags::ADD_SRC_ID)
            .then(|| vec![0 as LocalId; n]);
        let mut recv_id = by_dest_id.then(|| Vec::with_capacity(n));

        let mut i = 0;
        for (rank, &count) in self.recv_count.iter().enumerate() {
            for _ in 0..count {
                let hdr = self.header(i);
                let slot = if by_dest_id { hdr.dest_id() as usize } else { i };
                let payload = &self.recv[i * rs + WireRouteHdr::SIZE..(i + 1) * rs];
                data[slot * es..(slot + 1) * es].copy_from_slice(payload);
                if let Some(v) = src_rank.as_mut() {
                    v[slot] = rank;
                }
                if let Some(v) = src_id.as_mut() {
                    v[slot] = hdr.src_id();
                }
                if let Some(v) = recv_id.as_mut() {
                    v.push(hdr.dest_id());
                }
                i += 1;
            }
        }

        RoutedData {
            src_rank,
            recv_id,
            src_id,
            data,
        }
    }
}
