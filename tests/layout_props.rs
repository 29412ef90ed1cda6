//! Record packing properties over arbitrary layouts.
use mesh_all_to_all::algs::all_to_all::layout::{
    ElementType, RecordLayout, pack, send_positions, unpack, unpack_from_positions,
};
use proptest::prelude::*;

fn displacements(dest_rank: &[usize], n_ranks: usize) -> Vec<usize> {
    let mut displ = vec![0usize; n_ranks + 1];
    for &r in dest_rank {
        displ[r + 1] += 1;
    }
    for r in 0..n_ranks {
        displ[r + 1] += displ[r];
    }
    displ
}

fn element_types() -> impl Strategy<Value = ElementType> {
    prop_oneof![
        Just(ElementType::of::<u8>()),
        Just(ElementType::of::<u16>()),
        Just(ElementType::of::<u32>()),
        Just(ElementType::of::<f64>()),
        Just(ElementType::of::<[u8; 3]>()),
    ]
}

proptest! {
    #[test]
    fn records_are_aligned_and_hold_payload(
        ty in element_types(),
        stride in 0usize..6,
        with_id: bool,
    ) {
        let l = RecordLayout::new(ty, stride, with_id);
        prop_assert_eq!(l.record_size() % l.align(), 0);
        prop_assert_eq!(l.elt_shift() % l.align(), 0);
        prop_assert!(l.record_size() >= l.elt_shift() + l.elt_size());
        prop_assert_eq!(l.has_dest_id(), with_id);
    }

    #[test]
    fn positions_restore_source_order(
        ty in element_types(),
        stride in 1usize..4,
        dest_rank in prop::collection::vec(0usize..4, 0..40),
    ) {
        let l = RecordLayout::new(ty, stride, false);
        let n = dest_rank.len();
        let data: Vec<u8> = (0..n * l.elt_size()).map(|k| (k * 31 % 251) as u8).collect();
        let positions = send_positions(&dest_rank, &displacements(&dest_rank, 4));

        let mut buf = vec![0u8; l.buffer_len(n)];
        pack(&l, &positions, None, &data, &mut buf);
        let mut out = vec![0u8; data.len()];
        unpack_from_positions(&l, &buf, &positions, &mut out);
        prop_assert_eq!(out, data);
    }

    #[test]
    fn packed_records_are_grouped_by_rank(
        dest_rank in prop::collection::vec(0usize..3, 0..30),
    ) {
        let l = RecordLayout::of::<u32>(1, true);
        let n = dest_rank.len();
        let data: Vec<u8> = (0..n as u32).flat_map(|v| v.to_ne_bytes()).collect();
        let ids: Vec<u32> = (0..n as u32).collect();
        let positions = send_positions(&dest_rank, &displacements(&dest_rank, 3));

        let mut buf = vec![0u8; l.buffer_len(n)];
        pack(&l, &positions, Some(&ids), &data, &mut buf);
        let mut out = vec![0u8; data.len()];
        unpack(&l, &buf, n, None, &mut out).unwrap();
        let got: Vec<u32> = out
            .chunks(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let mut want: Vec<u32> = (0..n as u32).collect();
        want.sort_by_key(|&j| dest_rank[j as usize]);
        prop_assert_eq!(got, want);
    }
}
