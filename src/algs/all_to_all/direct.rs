//! Direct exchange backend: a fixed-size all-to-all of per-rank counts,
//! then a variable-size all-to-all of packed records.
//!
//! Counts and displacements are computed once per distributor
//! ([`DirectExchange::exchange_meta`]) and reused by every payload exchange,
//! in both directions: a reverse exchange swaps the send and receive tables.

use crate::algs::communicator::Communicator;
use crate::algs::wire::LocalId;
use crate::debug_invariants::DebugInvariants;
use crate::exchange_error::ExchangeError;

use super::layout::{self, ElementType, RecordLayout};
use super::metrics::{ExchangeMetrics, Timer};

/// Where the bytes of one payload exchange are sent from.
enum SendBuffer<'b> {
    /// Records packed into the backend's own buffer.
    Packed,
    /// The caller's element array, sent as is. Only used when the layout is
    /// dense and no reordering applies, so the caller's bytes already are
    /// the wire records in send order.
    Borrowed(&'b [u8]),
}

/// Counts, displacements and the reusable send buffer of the direct backend.
#[derive(Debug)]
pub struct DirectExchange {
    rank: usize,
    n_ranks: usize,
    send_count: Vec<usize>,
    recv_count: Vec<usize>,
    /// Prefix sums of `send_count` (length `n_ranks + 1`).
    send_displ: Vec<usize>,
    /// Prefix sums of `recv_count` (length `n_ranks + 1`).
    recv_displ: Vec<usize>,
    send_size: usize,
    recv_size: usize,
    /// Slot of every source element in the rank-grouped send order.
    send_pos: Vec<usize>,
    send_in_order: bool,
    /// The next forward exchange still has to carry destination ids.
    pending_dest_id: bool,
    send_buffer: Vec<u8>,
}

fn prefix_sum(count: &[usize]) -> Vec<usize> {
    let mut displ = Vec::with_capacity(count.len() + 1);
    displ.push(0);
    let mut acc = 0usize;
    for &c in count {
        acc += c;
        displ.push(acc);
    }
    displ
}

fn scaled(v: &[usize], factor: usize) -> Vec<usize> {
    v.iter().map(|&x| x * factor).collect()
}

impl DirectExchange {
    pub fn new(rank: usize, n_ranks: usize, order_by_dest_id: bool) -> Self {
        Self {
            rank,
            n_ranks,
            send_count: vec![0; n_ranks],
            recv_count: vec![0; n_ranks],
            send_displ: vec![0; n_ranks + 1],
            recv_displ: vec![0; n_ranks + 1],
            send_size: 0,
            recv_size: 0,
            send_pos: Vec::new(),
            send_in_order: true,
            pending_dest_id: order_by_dest_id,
            send_buffer: Vec::new(),
        }
    }

    /// Count records per destination rank and exchange the counts.
    ///
    /// Collective. Returns the number of records this rank receives.
    pub fn exchange_meta<C: Communicator>(
        &mut self,
        dest_rank: &[usize],
        comm: &C,
        metrics: &ExchangeMetrics,
    ) -> Result<usize, ExchangeError> {
        self.send_count.iter_mut().for_each(|c| *c = 0);
        for &r in dest_rank {
            self.send_count[r] += 1;
        }
        self.send_displ = prefix_sum(&self.send_count);
        self.send_size = self.send_displ[self.n_ranks];

        let counts: Vec<u64> = self.send_count.iter().map(|&c| c as u64).collect();
        let recv = metrics.timed(Timer::Metadata, || comm.all_to_all_counts(&counts))?;
        self.recv_count = recv
            .into_iter()
            .map(|c| usize::try_from(c).map_err(|_| ExchangeError::CountOverflow(usize::MAX)))
            .collect::<Result<_, _>>()?;
        self.recv_displ = prefix_sum(&self.recv_count);
        self.recv_size = self.recv_displ[self.n_ranks];

        self.send_pos = layout::send_positions(dest_rank, &self.send_displ);
        self.send_in_order = layout::is_identity(&self.send_pos);

        log::debug!(
            "[all_to_all] rank {}: direct metadata resolved, {} sent, {} received",
            self.rank,
            self.send_size,
            self.recv_size
        );
        crate::debug_invariants!(self.validate_invariants(), "direct exchange metadata");
        Ok(self.recv_size)
    }

    /// Exchange one payload array.
    ///
    /// Forward: `src` holds one element per source record (caller order),
    /// `out` one element per received record. With a pending destination-id
    /// prefix the received ids are stored in `recv_id`; once `recv_id` is
    /// known, records are placed at their destination id.
    ///
    /// Reverse: `src` holds one element per received record (in the order
    /// of the forward output); records travel back to their source rank and
    /// land in `out` in the original source order.
    #[allow(clippy::too_many_arguments)]
    pub fn exchange<C: Communicator>(
        &mut self,
        comm: &C,
        metrics: &ExchangeMetrics,
        elt_type: ElementType,
        stride: usize,
        reverse: bool,
        src: &[u8],
        dest_id: Option<&[LocalId]>,
        recv_id: &mut Option<Vec<LocalId>>,
        out: &mut [u8],
    ) -> Result<(), ExchangeError> {
        if reverse {
            self.exchange_reverse(comm, metrics, elt_type, stride, src, recv_id.as_deref(), out)
        } else {
            self.exchange_forward(
                comm,
                metrics,
                Timer::Exchange,
                elt_type,
                stride,
                src,
                dest_id,
                recv_id,
                out,
            )
        }
    }

    /// Payload-free forward exchange that only delivers destination ids
    /// into `recv_id`. No-op once the ids have been exchanged.
    ///
    /// Collective.
    pub fn resolve_dest_ids<C: Communicator>(
        &mut self,
        comm: &C,
        metrics: &ExchangeMetrics,
        dest_id: Option<&[LocalId]>,
        recv_id: &mut Option<Vec<LocalId>>,
    ) -> Result<(), ExchangeError> {
        if !self.pending_dest_id {
            return Ok(());
        }
        self.exchange_forward(
            comm,
            metrics,
            Timer::Metadata,
            ElementType::NULL,
            0,
            &[],
            dest_id,
            recv_id,
            &mut [],
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn exchange_forward<C: Communicator>(
        &mut self,
        comm: &C,
        metrics: &ExchangeMetrics,
        timer: Timer,
        elt_type: ElementType,
        stride: usize,
        src: &[u8],
        dest_id: Option<&[LocalId]>,
        recv_id: &mut Option<Vec<LocalId>>,
        out: &mut [u8],
    ) -> Result<(), ExchangeError> {
        let with_id = self.pending_dest_id;
        if with_id && dest_id.is_none() {
            return Err(ExchangeError::MissingDestIds);
        }
        let layout = RecordLayout::new(elt_type, stride, with_id);
        let rs = layout.record_size();

        let send = if layout.is_dense() && self.send_in_order {
            SendBuffer::Borrowed(src)
        } else {
            self.send_buffer.clear();
            self.send_buffer.resize(layout.buffer_len(self.send_size), 0);
            layout::pack(&layout, &self.send_pos, dest_id, src, &mut self.send_buffer);
            SendBuffer::Packed
        };
        let send_bytes = match send {
            SendBuffer::Packed => &self.send_buffer[..],
            SendBuffer::Borrowed(b) => b,
        };

        let send_counts = scaled(&self.send_count, rs);
        let send_displs = scaled(&self.send_displ, rs);
        let recv_counts = scaled(&self.recv_count, rs);
        let recv_displs = scaled(&self.recv_displ, rs);

        log::trace!(
            "[all_to_all] rank {}: forward exchange, {} records of {} bytes",
            self.rank,
            self.send_size,
            rs
        );

        if layout.is_dense() && recv_id.is_none() {
            metrics.timed(timer, || {
                comm.all_to_all_bytes(
                    send_bytes,
                    &send_counts,
                    &send_displs,
                    out,
                    &recv_counts,
                    &recv_displs,
                )
            })?;
            return Ok(());
        }

        let mut recv = vec![0u8; layout.buffer_len(self.recv_size)];
        metrics.timed(timer, || {
            comm.all_to_all_bytes(
                send_bytes,
                &send_counts,
                &send_displs,
                &mut recv,
                &recv_counts,
                &recv_displs,
            )
        })?;

        if with_id {
            let ids = layout::extract_ids(&layout, &recv, self.recv_size);
            layout::check_dest_ids(&ids, self.recv_size)?;
            *recv_id = Some(ids);
            self.pending_dest_id = false;
        }
        layout::unpack(&layout, &recv, self.recv_size, recv_id.as_deref(), out)
    }

    #[allow(clippy::too_many_arguments)]
    fn exchange_reverse<C: Communicator>(
        &mut self,
        comm: &C,
        metrics: &ExchangeMetrics,
        elt_type: ElementType,
        stride: usize,
        src: &[u8],
        recv_id: Option<&[LocalId]>,
        out: &mut [u8],
    ) -> Result<(), ExchangeError> {
        let layout = RecordLayout::new(elt_type, stride, false);
        let rs = layout.record_size();

        let send = match recv_id {
            Some(ids) => {
                self.send_buffer.clear();
                self.send_buffer.resize(layout.buffer_len(self.recv_size), 0);
                layout::pack_gathered(&layout, ids, src, &mut self.send_buffer)?;
                SendBuffer::Packed
            }
            None if layout.is_dense() => SendBuffer::Borrowed(src),
            None => {
                self.send_buffer.clear();
                self.send_buffer.resize(layout.buffer_len(self.recv_size), 0);
                layout::pack_in_order(&layout, self.recv_size, src, &mut self.send_buffer);
                SendBuffer::Packed
            }
        };
        let send_bytes = match send {
            SendBuffer::Packed => &self.send_buffer[..],
            SendBuffer::Borrowed(b) => b,
        };

        // roles swapped: we send what we received and receive what we sent
        let send_counts = scaled(&self.recv_count, rs);
        let send_displs = scaled(&self.recv_displ, rs);
        let recv_counts = scaled(&self.send_count, rs);
        let recv_displs = scaled(&self.send_displ, rs);

        log::trace!(
            "[all_to_all] rank {}: reverse exchange, {} records of {} bytes",
            self.rank,
            self.recv_size,
            rs
        );

        if layout.is_dense() && self.send_in_order {
            metrics.timed(Timer::Exchange, || {
                comm.all_to_all_bytes(
                    send_bytes,
                    &send_counts,
                    &send_displs,
                    out,
                    &recv_counts,
                    &recv_displs,
                )
            })?;
            return Ok(());
        }

        let mut recv = vec![0u8; layout.buffer_len(self.send_size)];
        metrics.timed(Timer::Exchange, || {
            comm.all_to_all_bytes(
                send_bytes,
                &send_counts,
                &send_displs,
                &mut recv,
                &recv_counts,
                &recv_displs,
            )
        })?;
        layout::unpack_from_positions(&layout, &recv, &self.send_pos, out);
        Ok(())
    }

    /// Source rank of every received record, derived from the receive
    /// displacement table (no payload involved). With `recv_id` the result
    /// follows destination-id order.
    pub fn src_rank(&self, recv_id: Option<&[LocalId]>) -> Vec<usize> {
        let mut src_rank = vec![0usize; self.recv_size];
        for r in 0..self.n_ranks {
            for j in self.recv_displ[r]..self.recv_displ[r + 1] {
                let slot = recv_id.map_or(j, |ids| ids[j] as usize);
                src_rank[slot] = r;
            }
        }
        src_rank
    }
}

impl DebugInvariants for DirectExchange {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "DirectExchange");
    }

    fn validate_invariants(&self) -> Result<(), ExchangeError> {
        for (what, count, displ, size) in [
            ("send", &self.send_count, &self.send_displ, self.send_size),
            ("recv", &self.recv_count, &self.recv_displ, self.recv_size),
        ] {
            if count.len() != self.n_ranks || displ.len() != self.n_ranks + 1 {
                return Err(ExchangeError::InvariantViolation(format!(
                    "{what} tables sized {}/{} for {} ranks",
                    count.len(),
                    displ.len(),
                    self.n_ranks
                )));
            }
            if displ[0] != 0 || displ[self.n_ranks] != size {
                return Err(ExchangeError::InvariantViolation(format!(
                    "{what} displacements span [{}, {}] but size is {size}",
                    displ[0], displ[self.n_ranks]
                )));
            }
            if let Some(r) = (0..self.n_ranks).find(|&r| displ[r + 1] != displ[r] + count[r]) {
                return Err(ExchangeError::InvariantViolation(format!(
                    "{what} displacement of rank {r} is not a prefix sum"
                )));
            }
        }
        if self.send_pos.len() != self.send_size {
            return Err(ExchangeError::InvariantViolation(format!(
                "{} send positions for {} records",
                self.send_pos.len(),
                self.send_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, ThreadComm};
    use crate::algs::wire::{cast_slice, cast_slice_mut};

    #[test]
    fn prefix_sum_has_leading_zero() {
        assert_eq!(prefix_sum(&[2, 0, 3]), vec![0, 2, 2, 5]);
        assert_eq!(prefix_sum(&[]), vec![0]);
    }

    #[test]
    fn single_rank_forward_is_a_copy() {
        let metrics = ExchangeMetrics::default();
        let mut dx = DirectExchange::new(0, 1, false);
        assert_eq!(dx.exchange_meta(&[0, 0, 0], &NoComm, &metrics).unwrap(), 3);
        dx.validate_invariants().unwrap();

        let src = [7u64, 8, 9];
        let mut out = [0u64; 3];
        let mut recv_id = None;
        dx.exchange(
            &NoComm,
            &metrics,
            ElementType::of::<u64>(),
            1,
            false,
            cast_slice(&src),
            None,
            &mut recv_id,
            cast_slice_mut(&mut out),
        )
        .unwrap();
        assert_eq!(out, src);
        assert_eq!(metrics.calls(Timer::Metadata), 1);
        assert_eq!(metrics.calls(Timer::Exchange), 1);
    }

    #[test]
    fn src_rank_follows_displacements() {
        let out = ThreadComm::run(2, |comm| {
            let metrics = ExchangeMetrics::default();
            let mut dx = DirectExchange::new(comm.rank(), 2, false);
            // every rank sends one record to each rank
            dx.exchange_meta(&[0, 1], &comm, &metrics).unwrap();
            dx.src_rank(None)
        });
        assert_eq!(out, vec![vec![0, 1], vec![0, 1]]);
    }

    #[test]
    fn missing_dest_ids_rejected() {
        let metrics = ExchangeMetrics::default();
        let mut dx = DirectExchange::new(0, 1, true);
        dx.exchange_meta(&[0], &NoComm, &metrics).unwrap();
        let mut recv_id = None;
        let mut out = [0u32; 1];
        let err = dx
            .exchange(
                &NoComm,
                &metrics,
                ElementType::of::<u32>(),
                1,
                false,
                cast_slice(&[1u32]),
                None,
                &mut recv_id,
                cast_slice_mut(&mut out),
            )
            .unwrap_err();
        assert!(matches!(err, ExchangeError::MissingDestIds));
    }
}
