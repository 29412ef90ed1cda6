//! Thin façade over intra-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! Point-to-point handles are **waitable**: callers post every send and
//! receive first and only then call `.wait()`, so a rank never blocks while
//! one of its own sends is still unposted.
//!
//! On top of the point-to-point primitives the trait provides the two
//! collectives the all-to-all distributor is built on:
//! [`Communicator::all_to_all_counts`] (one fixed-size count per peer) and
//! [`Communicator::all_to_all_bytes`] (variable-size byte ranges per peer).
//! Transports with native collectives override them.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::algs::wire::{WireCount, cast_slice, cast_slice_mut};
use crate::exchange_error::ExchangeError;

/// Typed message tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(pub u16);

impl CommTag {
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Tag `n` slots after this one (wrapping).
    #[inline]
    pub const fn offset(self, n: u16) -> Self {
        Self(self.0.wrapping_add(n))
    }
}

/// Tags reserved by the collectives provided on [`Communicator`].
pub const ALL_TO_ALL_COUNTS: CommTag = CommTag::new(0xA2A0);
pub const ALL_TO_ALL_DATA: CommTag = CommTag::new(0xA2A1);

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Message-passing interface shared by every transport.
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// Rank of this process in the group.
    fn rank(&self) -> usize;
    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// True for the serial no-op transport.
    fn is_no_comm(&self) -> bool {
        false
    }

    /// Fixed-size all-to-all: `send[r]` goes to rank `r`, the returned
    /// vector holds at position `r` the value rank `r` addressed to us.
    ///
    /// Collective: every rank of the group must call it.
    fn all_to_all_counts(&self, send: &[u64]) -> Result<Vec<u64>, ExchangeError> {
        let me = self.rank();
        let n = self.size();
        if send.len() != n {
            return Err(ExchangeError::LengthMismatch {
                what: "all_to_all_counts send buffer",
                expected: n,
                got: send.len(),
            });
        }

        // 1) post all receives
        let mut pending_recvs = Vec::with_capacity(n.saturating_sub(1));
        for peer in (0..n).filter(|&p| p != me) {
            let mut cnt = WireCount::new(0);
            let h = self.irecv(
                peer,
                ALL_TO_ALL_COUNTS.as_u16(),
                cast_slice_mut(std::slice::from_mut(&mut cnt)),
            );
            pending_recvs.push((peer, h));
        }

        // 2) post all sends and keep buffers alive until completion
        let mut pending_sends = Vec::with_capacity(n.saturating_sub(1));
        let mut send_bufs = Vec::with_capacity(n.saturating_sub(1));
        for peer in (0..n).filter(|&p| p != me) {
            let wire = WireCount::new(send[peer]);
            pending_sends.push(self.isend(
                peer,
                ALL_TO_ALL_COUNTS.as_u16(),
                cast_slice(std::slice::from_ref(&wire)),
            ));
            send_bufs.push(wire);
        }

        let mut recv = vec![0u64; n];
        recv[me] = send[me];

        // 3) wait for all recvs (but do not early-return)
        let mut maybe_err = None;
        for (peer, h) in pending_recvs {
            match h.wait() {
                Some(data) if data.len() == std::mem::size_of::<WireCount>() => {
                    let mut cnt = WireCount::new(0);
                    cast_slice_mut(std::slice::from_mut(&mut cnt)).copy_from_slice(&data);
                    recv[peer] = cnt.get();
                }
                Some(data) if maybe_err.is_none() => {
                    maybe_err = Some(ExchangeError::BufferSizeMismatch {
                        neighbor: peer,
                        expected: std::mem::size_of::<WireCount>(),
                        got: data.len(),
                    });
                }
                None if maybe_err.is_none() => {
                    maybe_err = Some(ExchangeError::CommError {
                        neighbor: peer,
                        source: format!("failed to receive count from rank {peer}").into(),
                    });
                }
                _ => {}
            }
        }

        // 4) always drain all send handles before returning
        for s in pending_sends {
            let _ = s.wait();
        }
        drop(send_bufs);

        match maybe_err {
            Some(err) => Err(err),
            None => Ok(recv),
        }
    }

    /// Variable-size all-to-all of byte ranges.
    ///
    /// `send[send_displs[r]..][..send_counts[r]]` goes to rank `r`; the bytes
    /// rank `r` addressed to us land in `recv[recv_displs[r]..][..recv_counts[r]]`.
    /// Counts must agree pairwise across the group (what we send to `r`
    /// is what `r` expects from us); peers with a zero count exchange
    /// no message at all.
    ///
    /// Collective: every rank of the group must call it.
    fn all_to_all_bytes(
        &self,
        send: &[u8],
        send_counts: &[usize],
        send_displs: &[usize],
        recv: &mut [u8],
        recv_counts: &[usize],
        recv_displs: &[usize],
    ) -> Result<(), ExchangeError> {
        let me = self.rank();
        let n = self.size();
        check_partition("send", send.len(), send_counts, send_displs, n)?;
        check_partition("recv", recv.len(), recv_counts, recv_displs, n)?;
        if send_counts[me] != recv_counts[me] {
            return Err(ExchangeError::BufferSizeMismatch {
                neighbor: me,
                expected: recv_counts[me],
                got: send_counts[me],
            });
        }

        // 1) post all receives
        let mut pending_recvs = Vec::new();
        for peer in (0..n).filter(|&p| p != me && recv_counts[p] > 0) {
            let range = recv_displs[peer]..recv_displs[peer] + recv_counts[peer];
            let h = self.irecv(peer, ALL_TO_ALL_DATA.as_u16(), &mut recv[range]);
            pending_recvs.push((peer, h));
        }

        // 2) post all sends
        let mut pending_sends = Vec::new();
        for peer in (0..n).filter(|&p| p != me && send_counts[p] > 0) {
            let range = send_displs[peer]..send_displs[peer] + send_counts[peer];
            pending_sends.push(self.isend(peer, ALL_TO_ALL_DATA.as_u16(), &send[range]));
        }

        // 3) local segment
        recv[recv_displs[me]..recv_displs[me] + recv_counts[me]]
            .copy_from_slice(&send[send_displs[me]..send_displs[me] + send_counts[me]]);

        // 4) wait for all recvs, copy into place (but do not early-return)
        let mut maybe_err = None;
        for (peer, h) in pending_recvs {
            let expected = recv_counts[peer];
            match h.wait() {
                Some(data) if data.len() == expected => {
                    let start = recv_displs[peer];
                    recv[start..start + expected].copy_from_slice(&data);
                }
                Some(data) if maybe_err.is_none() => {
                    maybe_err = Some(ExchangeError::BufferSizeMismatch {
                        neighbor: peer,
                        expected,
                        got: data.len(),
                    });
                }
                None if maybe_err.is_none() => {
                    maybe_err = Some(ExchangeError::CommError {
                        neighbor: peer,
                        source: "no data received (wait returned None)".into(),
                    });
                }
                _ => {}
            }
        }

        // 5) always drain all send handles before returning
        for s in pending_sends {
            let _ = s.wait();
        }

        match maybe_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn check_partition(
    what: &'static str,
    buf_len: usize,
    counts: &[usize],
    displs: &[usize],
    n: usize,
) -> Result<(), ExchangeError> {
    if counts.len() != n || displs.len() < n {
        return Err(ExchangeError::LengthMismatch {
            what,
            expected: n,
            got: counts.len().min(displs.len()),
        });
    }
    for (&c, &d) in counts.iter().zip(displs) {
        if d + c > buf_len {
            return Err(ExchangeError::LengthMismatch {
                what,
                expected: d + c,
                got: buf_len,
            });
        }
    }
    Ok(())
}

/// Compile-time no-op comm for pure serial unit tests: a group of one.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn is_no_comm(&self) -> bool {
        true
    }
}

// --- ThreadComm: intra-process group, one thread per rank ---
type Key = (usize, usize, u16); // (src, dst, tag)

/// Mailbox shared by the ranks of one [`ThreadComm`] group.
#[derive(Default)]
struct Mailbox {
    slots: DashMap<Key, VecDeque<Bytes>>,
    bell: Mutex<()>,
    ring: Condvar,
}

impl Mailbox {
    fn post(&self, key: Key, msg: Bytes) {
        self.slots.entry(key).or_default().push_back(msg);
        let _guard = self.bell.lock();
        self.ring.notify_all();
    }

    fn try_take(&self, key: &Key) -> Option<Bytes> {
        self.slots.get_mut(key).and_then(|mut q| q.pop_front())
    }

    fn take(&self, key: &Key) -> Bytes {
        loop {
            if let Some(msg) = self.try_take(key) {
                return msg;
            }
            let mut guard = self.bell.lock();
            // re-check under the bell so a post between the two checks is not lost
            if let Some(msg) = self.try_take(key) {
                return msg;
            }
            self.ring.wait(&mut guard);
        }
    }
}

/// Receive handle of a [`ThreadComm`]; blocks in `wait` until the message arrives.
pub struct LocalRecv {
    mailbox: Arc<Mailbox>,
    key: Key,
    len: usize,
}

impl Wait for LocalRecv {
    fn wait(self) -> Option<Vec<u8>> {
        let bytes = self.mailbox.take(&self.key);
        let n = bytes.len().min(self.len);
        Some(bytes[..n].to_vec())
    }
}

/// In-process communicator: every rank of a group is a thread, messages
/// travel through a mailbox private to the group, FIFO per (src, dst, tag).
///
/// Sends are buffered and never block. Separate groups share nothing, so
/// tests can run any number of groups concurrently.
#[derive(Clone)]
pub struct ThreadComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
}

impl std::fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl ThreadComm {
    /// Create the `size` communicators of a fresh group (rank order).
    pub fn group(size: usize) -> Vec<ThreadComm> {
        let mailbox = Arc::new(Mailbox::default());
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
            })
            .collect()
    }

    /// Run `f` once per rank of a fresh group, each on its own thread, and
    /// return the results in rank order.
    pub fn run<R, F>(size: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(ThreadComm) -> R + Sync,
    {
        let comms = Self::group(size);
        std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    let f = &f;
                    s.spawn(move || f(comm))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(r) => r,
                    Err(payload) => std::panic::resume_unwind(payload),
                })
                .collect()
        })
    }
}

impl Communicator for ThreadComm {
    type SendHandle = ();
    type RecvHandle = LocalRecv;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
        self.mailbox
            .post((self.rank, peer, tag), Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> LocalRecv {
        LocalRecv {
            mailbox: Arc::clone(&self.mailbox),
            key: (peer, self.rank, tag),
            len: buf.len(),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::{Communicator, ExchangeError, Wait, check_partition};
    use mpi::Count;
    use mpi::datatype::{Partition, PartitionMut};
    use mpi::environment::Universe;
    use mpi::request::StaticScope;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::{
        Communicator as _, CommunicatorCollectives as _, Destination as _, Source as _,
    };

    /// Communicator over `MPI_COMM_WORLD`.
    ///
    /// MPI calls must be funneled through one thread at a time; the
    /// `Send`/`Sync` impls only let the handle satisfy [`Communicator`]'s bounds.
    pub struct MpiComm {
        rank: usize,
        size: usize,
        _universe: Option<Universe>,
    }

    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl MpiComm {
        /// Initialize MPI and wrap the world communicator. MPI is finalized
        /// when the returned handle is dropped.
        pub fn new() -> Result<Self, ExchangeError> {
            let universe = mpi::initialize().ok_or_else(|| ExchangeError::CommError {
                neighbor: 0,
                source: "MPI is already initialized".into(),
            })?;
            let world = universe.world();
            Ok(Self {
                rank: world.rank() as usize,
                size: world.size() as usize,
                _universe: Some(universe),
            })
        }

        /// Wrap the world communicator of an MPI environment initialized elsewhere.
        pub fn from_world() -> Self {
            let world = SimpleCommunicator::world();
            Self {
                rank: world.rank() as usize,
                size: world.size() as usize,
                _universe: None,
            }
        }

        fn world(&self) -> SimpleCommunicator {
            SimpleCommunicator::world()
        }
    }

    fn to_counts(v: &[usize]) -> Result<Vec<Count>, ExchangeError> {
        v.iter()
            .map(|&c| Count::try_from(c).map_err(|_| ExchangeError::CountOverflow(c)))
            .collect()
    }

    /// Send handle: the message buffer is owned by the handle until the
    /// request completes.
    pub struct MpiSend {
        finish: Option<Box<dyn FnOnce()>>,
    }

    impl Wait for MpiSend {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(finish) = self.finish.take() {
                finish();
            }
            None
        }
    }

    impl Drop for MpiSend {
        fn drop(&mut self) {
            if let Some(finish) = self.finish.take() {
                finish();
            }
        }
    }

    /// Receive handle: the matching blocking receive runs in `wait`.
    pub struct MpiRecv {
        peer: i32,
        tag: i32,
    }

    impl Wait for MpiRecv {
        fn wait(self) -> Option<Vec<u8>> {
            let world = SimpleCommunicator::world();
            let (msg, _status) = world
                .process_at_rank(self.peer)
                .receive_vec_with_tag::<u8>(self.tag);
            Some(msg)
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSend;
        type RecvHandle = MpiRecv;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSend {
            let leaked: &'static [u8] = Box::leak(buf.to_vec().into_boxed_slice());
            let raw = leaked as *const [u8] as *mut [u8];
            let req = self.world().process_at_rank(peer as i32).immediate_send_with_tag(
                StaticScope,
                leaked,
                i32::from(tag),
            );
            MpiSend {
                finish: Some(Box::new(move || {
                    req.wait();
                    // SAFETY: `raw` came from `Box::leak` above and the only
                    // borrow of it (the request) has completed.
                    drop(unsafe { Box::from_raw(raw) });
                })),
            }
        }

        fn irecv(&self, peer: usize, tag: u16, _buf: &mut [u8]) -> MpiRecv {
            MpiRecv {
                peer: peer as i32,
                tag: i32::from(tag),
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn all_to_all_counts(&self, send: &[u64]) -> Result<Vec<u64>, ExchangeError> {
            if send.len() != self.size {
                return Err(ExchangeError::LengthMismatch {
                    what: "all_to_all_counts send buffer",
                    expected: self.size,
                    got: send.len(),
                });
            }
            let mut recv = vec![0u64; self.size];
            self.world().all_to_all_into(send, &mut recv[..]);
            Ok(recv)
        }

        fn all_to_all_bytes(
            &self,
            send: &[u8],
            send_counts: &[usize],
            send_displs: &[usize],
            recv: &mut [u8],
            recv_counts: &[usize],
            recv_displs: &[usize],
        ) -> Result<(), ExchangeError> {
            check_partition("send", send.len(), send_counts, send_displs, self.size)?;
            check_partition("recv", recv.len(), recv_counts, recv_displs, self.size)?;
            let sc = to_counts(send_counts)?;
            let sd = to_counts(&send_displs[..self.size])?;
            let rc = to_counts(recv_counts)?;
            let rd = to_counts(&recv_displs[..self.size])?;
            let send_part = Partition::new(send, &sc[..], &sd[..]);
            let mut recv_part = PartitionMut::new(recv, &rc[..], &rd[..]);
            self.world()
                .all_to_all_varcount_into(&send_part, &mut recv_part);
            Ok(())
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
