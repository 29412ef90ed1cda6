use mesh_all_to_all::algs::communicator::{ALL_TO_ALL_COUNTS, ALL_TO_ALL_DATA, CommTag};
use mesh_all_to_all::algs::wire::{WireCount, WireRouteHdr};

#[test]
fn commtag_offset_wrap() {
    let t = CommTag::new(u16::MAX).offset(1);
    assert_eq!(t.as_u16(), 0);
}

#[test]
fn exchange_tags_are_distinct() {
    assert_ne!(ALL_TO_ALL_COUNTS.as_u16(), ALL_TO_ALL_DATA.as_u16());
}

#[test]
fn wire_count_roundtrip() {
    for n in [0u64, 1, u32::MAX as u64 + 7, u64::MAX] {
        assert_eq!(WireCount::new(n).get(), n);
    }
}

#[test]
fn route_header_fields() {
    let h = WireRouteHdr::new(7, 0xFFFF_FFFF);
    assert_eq!(h.dest_id(), 7);
    assert_eq!(h.src_id(), 0xFFFF_FFFF);
    assert_eq!(bytemuck::bytes_of(&h).len(), WireRouteHdr::SIZE);
}
