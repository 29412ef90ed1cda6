//! Fixed, little-endian wire types for the exchange paths.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::{align_of, size_of};

/// Slot index of a record on its destination rank.
pub type LocalId = u32;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Decode a little-endian [`LocalId`] from the first bytes of `b`.
#[inline]
pub fn read_local_id(b: &[u8]) -> LocalId {
    let mut raw = [0u8; size_of::<LocalId>()];
    raw.copy_from_slice(&b[..size_of::<LocalId>()]);
    LocalId::from_le_bytes(raw)
}

/// Encode `id` as little-endian bytes into the front of `b`.
#[inline]
pub fn write_local_id(b: &mut [u8], id: LocalId) {
    b[..size_of::<LocalId>()].copy_from_slice(&id.to_le_bytes());
}

/// A count carried on the wire.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u64,
}

impl WireCount {
    pub fn new(n: u64) -> Self {
        Self { n_le: n.to_le() }
    }
    pub fn get(&self) -> u64 {
        u64::from_le(self.n_le)
    }
}

/// Per-record header used by the pairwise router: where the record goes on
/// the receiving rank and where it came from on the sending rank.
/// The source rank is implied by the message's sender.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireRouteHdr {
    pub dest_id_le: u32,
    pub src_id_le: u32,
}

impl WireRouteHdr {
    pub const SIZE: usize = 8;

    pub fn new(dest_id: LocalId, src_id: LocalId) -> Self {
        Self {
            dest_id_le: dest_id.to_le(),
            src_id_le: src_id.to_le(),
        }
    }
    pub fn dest_id(&self) -> LocalId {
        u32::from_le(self.dest_id_le)
    }
    pub fn src_id(&self) -> LocalId {
        u32::from_le(self.src_id_le)
    }
}

// ===== Compile-time sanity checks =========================================

const_assert_eq!(size_of::<WireCount>(), 8);
const_assert_eq!(size_of::<WireRouteHdr>(), WireRouteHdr::SIZE);
const_assert_eq!(align_of::<WireRouteHdr>(), 4);
const_assert_eq!(size_of::<LocalId>(), 4);
