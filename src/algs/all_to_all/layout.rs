//! Composite record layout and packing.
//!
//! A record on the wire is an optional destination-id prefix followed by
//! the element payload (`stride` values of one element type):
//!
//! ```text
//! | dest_id (LocalId) | pad | payload (type_size * stride) | pad |
//! |<----- elt_shift ----->|<------------- padded ------------->|
//! |<----------------------- record_size ---------------------->|
//! ```
//!
//! Both pads round up to the larger of the id alignment and the element
//! alignment. A zero-size payload (metadata-only exchange) is legal; if
//! there is no id prefix either, the record size is zero and packing is a
//! no-op.
//!
//! Every function here writes each output record exactly once, so the loops
//! run in parallel when the `rayon` feature is enabled.

use std::mem::{align_of, size_of};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::algs::wire::{LocalId, read_local_id, write_local_id};
use crate::exchange_error::ExchangeError;

/// Byte size and alignment of one exchanged value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ElementType {
    pub size: usize,
    pub align: usize,
}

impl ElementType {
    /// The empty type used for metadata-only exchanges.
    pub const NULL: ElementType = ElementType { size: 0, align: 1 };

    pub fn of<T>() -> Self {
        Self {
            size: size_of::<T>(),
            align: align_of::<T>(),
        }
    }
}

#[inline]
fn round_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

/// Per-record byte layout, computed once per exchange and reused by every
/// pack/unpack step of that exchange.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RecordLayout {
    id_size: usize,
    elt_size: usize,
    align: usize,
    elt_shift: usize,
    record_size: usize,
}

impl RecordLayout {
    pub fn new(elt_type: ElementType, stride: usize, with_dest_id: bool) -> Self {
        let id_size = if with_dest_id { size_of::<LocalId>() } else { 0 };
        let elt_size = elt_type.size * stride;
        let align = align_of::<LocalId>().max(elt_type.align);
        let elt_shift = round_up(id_size, align);
        let record_size = elt_shift + round_up(elt_size, align);
        Self {
            id_size,
            elt_size,
            align,
            elt_shift,
            record_size,
        }
    }

    pub fn of<T>(stride: usize, with_dest_id: bool) -> Self {
        Self::new(ElementType::of::<T>(), stride, with_dest_id)
    }

    /// Layout of a metadata-only exchange (no payload).
    pub fn metadata_only(with_dest_id: bool) -> Self {
        Self::new(ElementType::NULL, 0, with_dest_id)
    }

    pub fn has_dest_id(&self) -> bool {
        self.id_size > 0
    }
    /// Payload bytes of one record (without padding).
    pub fn elt_size(&self) -> usize {
        self.elt_size
    }
    pub fn align(&self) -> usize {
        self.align
    }
    /// Offset of the payload inside a record.
    pub fn elt_shift(&self) -> usize {
        self.elt_shift
    }
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// True when a record is exactly its payload, so a caller's element
    /// array can be sent or received without repacking.
    pub fn is_dense(&self) -> bool {
        self.id_size == 0 && self.record_size == self.elt_size
    }

    /// Bytes needed for `n` records.
    pub fn buffer_len(&self, n: usize) -> usize {
        n * self.record_size
    }

    #[inline]
    fn payload<'b>(&self, data: &'b [u8], j: usize) -> &'b [u8] {
        &data[j * self.elt_size..(j + 1) * self.elt_size]
    }

    #[inline]
    fn write_record(&self, rec: &mut [u8], id: Option<LocalId>, payload: &[u8]) {
        if let Some(id) = id {
            write_local_id(rec, id);
        }
        rec[self.elt_shift..self.elt_shift + self.elt_size].copy_from_slice(payload);
    }
}

/// Slot of every source element in a buffer grouped by destination rank.
///
/// Slots of one rank start at `send_displ[rank]` and advance in source
/// order, so elements keep their relative order within each rank group.
/// `send_displ` itself is not modified.
pub fn send_positions(dest_rank: &[usize], send_displ: &[usize]) -> Vec<usize> {
    let mut cursor = send_displ.to_vec();
    dest_rank
        .iter()
        .map(|&r| {
            let p = cursor[r];
            cursor[r] += 1;
            p
        })
        .collect()
}

/// Whether `positions` maps every element to its own index.
pub fn is_identity(positions: &[usize]) -> bool {
    positions.iter().enumerate().all(|(j, &p)| j == p)
}

/// Pack source elements into `out` at the record slots given by
/// `positions`, with an optional destination-id prefix.
pub fn pack(
    layout: &RecordLayout,
    positions: &[usize],
    dest_id: Option<&[LocalId]>,
    data: &[u8],
    out: &mut [u8],
) {
    let rs = layout.record_size();
    if rs == 0 {
        return;
    }
    debug_assert_eq!(out.len(), positions.len() * rs);
    let id_of = |j: usize| if layout.has_dest_id() { dest_id.map(|ids| ids[j]) } else { None };

    #[cfg(feature = "rayon")]
    {
        let mut src_of = vec![0usize; positions.len()];
        for (j, &p) in positions.iter().enumerate() {
            src_of[p] = j;
        }
        out.par_chunks_mut(rs)
            .zip(src_of.par_iter())
            .for_each(|(rec, &j)| layout.write_record(rec, id_of(j), layout.payload(data, j)));
    }

    #[cfg(not(feature = "rayon"))]
    for (j, &p) in positions.iter().enumerate() {
        let rec = &mut out[p * rs..(p + 1) * rs];
        layout.write_record(rec, id_of(j), layout.payload(data, j));
    }
}

/// Pack records in the caller's element order.
pub fn pack_in_order(layout: &RecordLayout, n: usize, data: &[u8], out: &mut [u8]) {
    let rs = layout.record_size();
    if rs == 0 {
        return;
    }
    out[..n * rs]
        .chunks_mut(rs)
        .enumerate()
        .for_each(|(i, rec)| layout.write_record(rec, None, layout.payload(data, i)));
}

/// Pack record `i` from element `recv_id[i]` of `data` (reverse exchange of
/// data keyed by destination id).
pub fn pack_gathered(
    layout: &RecordLayout,
    recv_id: &[LocalId],
    data: &[u8],
    out: &mut [u8],
) -> Result<(), ExchangeError> {
    let rs = layout.record_size();
    if rs == 0 {
        return Ok(());
    }
    let n_data = if layout.elt_size() == 0 {
        usize::MAX
    } else {
        data.len() / layout.elt_size()
    };
    if let Some(&bad) = recv_id.iter().find(|&&id| id as usize >= n_data) {
        return Err(ExchangeError::DestIdOutOfRange {
            id: bad as usize,
            n_elts_dest: n_data,
        });
    }
    out.chunks_mut(rs)
        .zip(recv_id)
        .for_each(|(rec, &id)| layout.write_record(rec, None, layout.payload(data, id as usize)));
    Ok(())
}

/// Read the destination-id prefix of the first `n` records of `recv`.
pub fn extract_ids(layout: &RecordLayout, recv: &[u8], n: usize) -> Vec<LocalId> {
    let rs = layout.record_size();
    (0..n).map(|i| read_local_id(&recv[i * rs..])).collect()
}

/// Check that received destination ids are a collision-free subset of
/// `[0, n_elts_dest)`.
pub fn check_dest_ids(ids: &[LocalId], n_elts_dest: usize) -> Result<(), ExchangeError> {
    let mut seen = vec![false; n_elts_dest];
    for &id in ids {
        let id = id as usize;
        match seen.get_mut(id) {
            None => return Err(ExchangeError::DestIdOutOfRange { id, n_elts_dest }),
            Some(true) => return Err(ExchangeError::DuplicateDestId(id)),
            Some(slot) => *slot = true,
        }
    }
    Ok(())
}

/// Copy the payload of the first `n` records of `recv` into `out`, either
/// consecutively or at element `recv_id[i]`.
pub fn unpack(
    layout: &RecordLayout,
    recv: &[u8],
    n: usize,
    recv_id: Option<&[LocalId]>,
    out: &mut [u8],
) -> Result<(), ExchangeError> {
    let es = layout.elt_size();
    let rs = layout.record_size();
    if es == 0 {
        return Ok(());
    }
    let shift = layout.elt_shift();
    let n_out = out.len() / es;
    for i in 0..n {
        let slot = recv_id.map_or(i, |ids| ids[i] as usize);
        if slot >= n_out {
            return Err(ExchangeError::DestIdOutOfRange {
                id: slot,
                n_elts_dest: n_out,
            });
        }
        out[slot * es..(slot + 1) * es].copy_from_slice(&recv[i * rs + shift..i * rs + shift + es]);
    }
    Ok(())
}

/// Fill element `j` of `out` from record `positions[j]` of `recv`
/// (restores the original element order after a reverse exchange).
pub fn unpack_from_positions(
    layout: &RecordLayout,
    recv: &[u8],
    positions: &[usize],
    out: &mut [u8],
) {
    let es = layout.elt_size();
    if es == 0 {
        return;
    }
    let rs = layout.record_size();
    let shift = layout.elt_shift();
    let copy = |(elt, &p): (&mut [u8], &usize)| {
        elt.copy_from_slice(&recv[p * rs + shift..p * rs + shift + es]);
    };

    #[cfg(feature = "rayon")]
    out.par_chunks_mut(es).zip(positions.par_iter()).for_each(copy);

    #[cfg(not(feature = "rayon"))]
    out.chunks_mut(es).zip(positions.iter()).for_each(copy);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_without_id_pads_to_id_alignment() {
        let l = RecordLayout::of::<u8>(3, false);
        assert_eq!(l.elt_size(), 3);
        assert_eq!(l.elt_shift(), 0);
        assert_eq!(l.record_size(), 4);
        assert!(!l.is_dense());
    }

    #[test]
    fn layout_with_id_aligns_payload_to_element() {
        let l = RecordLayout::of::<f64>(2, true);
        assert_eq!(l.align(), 8);
        assert_eq!(l.elt_shift(), 8);
        assert_eq!(l.record_size(), 24);
    }

    #[test]
    fn dense_layout_for_word_sized_values() {
        let l = RecordLayout::of::<u32>(5, false);
        assert!(l.is_dense());
        assert_eq!(l.buffer_len(3), 60);
    }

    #[test]
    fn metadata_only_layouts() {
        let bare = RecordLayout::metadata_only(false);
        assert_eq!(bare.record_size(), 0);
        assert_eq!(bare.elt_size(), 0);
        let with_id = RecordLayout::metadata_only(true);
        assert_eq!(with_id.elt_shift(), 4);
        assert_eq!(with_id.record_size(), 4);
    }

    #[test]
    fn send_positions_are_stable_per_rank() {
        // counts per rank: r0 = 1, r1 = 2
        let pos = send_positions(&[1, 0, 1], &[0, 1, 3]);
        assert_eq!(pos, vec![1, 0, 2]);
        assert!(!is_identity(&pos));
        assert!(is_identity(&send_positions(&[0, 1, 1], &[0, 1, 3])));
    }

    #[test]
    fn pack_then_unpack_by_id() {
        let l = RecordLayout::of::<u16>(1, true);
        let data: Vec<u8> = [10u16, 20, 30].iter().flat_map(|v| v.to_ne_bytes()).collect();
        let mut buf = vec![0u8; l.buffer_len(3)];
        pack(&l, &[2, 0, 1], Some(&[0, 2, 1]), &data, &mut buf);

        let ids = extract_ids(&l, &buf, 3);
        assert_eq!(ids, vec![2, 1, 0]);
        check_dest_ids(&ids, 3).unwrap();

        let mut out = vec![0u8; 6];
        unpack(&l, &buf, 3, Some(&ids), &mut out).unwrap();
        let want: Vec<u8> = [10u16, 30, 20].iter().flat_map(|v| v.to_ne_bytes()).collect();
        assert_eq!(out, want);
    }

    #[test]
    fn zero_size_payload_is_noop() {
        let l = RecordLayout::metadata_only(false);
        let mut buf = Vec::new();
        pack(&l, &[0, 1], None, &[], &mut buf);
        let mut out = Vec::new();
        unpack(&l, &buf, 2, None, &mut out).unwrap();
        assert!(buf.is_empty() && out.is_empty());
    }

    #[test]
    fn dest_id_checks() {
        assert!(matches!(
            check_dest_ids(&[0, 3], 3),
            Err(ExchangeError::DestIdOutOfRange { id: 3, .. })
        ));
        assert!(matches!(
            check_dest_ids(&[1, 1], 3),
            Err(ExchangeError::DuplicateDestId(1))
        ));
    }

    #[test]
    fn gathered_pack_rejects_bad_ids() {
        let l = RecordLayout::of::<u32>(1, false);
        let data = vec![0u8; 8];
        let mut out = vec![0u8; 4];
        assert!(pack_gathered(&l, &[2], &data, &mut out).is_err());
    }
}
