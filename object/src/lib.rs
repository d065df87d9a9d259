mod header;
mod objects;
mod value;

pub use header::{Header, MAX_PREFIX_WORDS, ObjectKind};
pub use objects::{
    Bytes, LargeInt, TYPE_PAYLOAD_WORDS, Tuple, Type, bytes_payload_words, init_bytes,
    init_large_int, init_tuple, init_type, large_int_digits, large_int_payload_words,
    trace_object, tuple_payload_words,
};
pub use value::{Cell, CellKind, ErrorKind, MAX_SMALL_BYTES, SMALL_INT_BITS};

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::proptest;

    #[repr(C, align(8))]
    struct Words<const N: usize>([u64; N]);

    impl<const N: usize> Words<N> {
        fn new() -> Self {
            Self([0; N])
        }

        fn addr(&mut self) -> usize {
            self.0.as_mut_ptr() as usize
        }
    }

    // ── Cell tagging ───────────────────────────────────────────────

    #[test]
    fn small_int_round_trip() {
        for &n in &[0i64, 1, -1, 42, -42, Cell::SMALL_INT_MAX, Cell::SMALL_INT_MIN] {
            let c = Cell::from_i64(n);
            assert!(c.is_small_int());
            assert!(c.is_immediate());
            assert!(!c.is_heap_ref());
            assert_eq!(c.as_small_int(), Some(n));
        }
    }

    #[test]
    fn small_int_zero_is_zero_bits() {
        assert_eq!(Cell::from_i64(0).raw(), 0);
    }

    #[test]
    fn promotion_boundary_is_symmetric() {
        assert!(Cell::try_small_int(Cell::SMALL_INT_MAX).is_some());
        assert!(Cell::try_small_int(Cell::SMALL_INT_MAX + 1).is_none());
        assert!(Cell::try_small_int(Cell::SMALL_INT_MIN).is_some());
        assert!(Cell::try_small_int(Cell::SMALL_INT_MIN - 1).is_none());
        assert_eq!(Cell::SMALL_INT_MAX, -(Cell::SMALL_INT_MIN + 1));
    }

    #[test]
    #[should_panic(expected = "small int overflow")]
    fn from_i64_rejects_out_of_range() {
        let _ = Cell::from_i64(i64::MAX);
    }

    #[test]
    fn heap_ref_tagging() {
        let mut words = Words::<2>::new();
        let addr = words.addr();
        let c = Cell::from_address(addr);
        assert!(c.is_heap_ref());
        assert!(!c.is_immediate());
        assert!(!c.is_small_int());
        assert_eq!(c.kind(), CellKind::HeapRef);
        assert_eq!(c.as_address(), addr);
    }

    #[test]
    #[should_panic(expected = "as_address on a non-heap cell")]
    fn as_address_on_immediate_is_fatal() {
        let _ = Cell::from_i64(8).as_address();
    }

    #[test]
    fn singletons_are_distinct_immediates() {
        let all = [
            Cell::NONE,
            Cell::TRUE,
            Cell::FALSE,
            Cell::NOT_IMPLEMENTED,
            Cell::UNBOUND,
            Cell::error(ErrorKind::OutOfMemory),
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.is_immediate(), "{a:?}");
            assert!(!a.is_small_int(), "{a:?}");
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(Cell::NONE.kind(), CellKind::None);
        assert_eq!(Cell::UNBOUND.kind(), CellKind::Unbound);
        assert_eq!(Cell::error(ErrorKind::NotFound).kind(), CellKind::Error);
        assert_eq!(Cell::TRUE.as_bool(), Some(true));
        assert_eq!(Cell::FALSE.as_bool(), Some(false));
        assert_eq!(Cell::NONE.as_bool(), None);
    }

    #[test]
    fn small_bytes_round_trip() {
        for bytes in [&b""[..], b"a", b"hello", b"1234567"] {
            let c = Cell::try_small_bytes(bytes).expect("fits inline");
            assert_eq!(c.kind(), CellKind::SmallBytes);
            let mut buf = [0; MAX_SMALL_BYTES];
            assert_eq!(c.small_bytes(&mut buf), bytes);
        }
        assert!(Cell::try_small_bytes(b"12345678").is_none());
    }

    #[test]
    fn header_tag_detected() {
        let header = Header::new(ObjectKind::Tuple, 3);
        let c = header.as_cell();
        assert!(c.is_header());
        assert!(!c.is_immediate());
        assert!(!c.is_heap_ref());
        assert_eq!(Header::try_from(c), Ok(header));
    }

    // ── Header ─────────────────────────────────────────────────────

    #[test]
    fn header_fields() {
        for (i, &kind) in [
            ObjectKind::LargeInt,
            ObjectKind::Bytes,
            ObjectKind::Tuple,
            ObjectKind::Type,
        ]
        .iter()
        .enumerate()
        {
            let h = Header::with_prefix(kind, 7 + i as u32, i % 2);
            assert_eq!(h.kind(), kind, "kind mismatch at index {i}");
            assert_eq!(h.payload_words(), 7 + i);
            assert_eq!(h.prefix_words(), i % 2);
            assert_eq!(h.allocation_size(), (1 + 7 + i + i % 2) * 8);
        }
    }

    // ── Layouts ────────────────────────────────────────────────────

    #[test]
    fn payload_sizes() {
        assert_eq!(bytes_payload_words(0), 1);
        assert_eq!(bytes_payload_words(8), 2);
        assert_eq!(bytes_payload_words(9), 3);
        assert_eq!(tuple_payload_words(3), 4);
        assert_eq!(large_int_payload_words(2), 2);
    }

    #[test]
    fn bytes_layout() {
        let mut words = Words::<4>::new();
        let addr = words.addr();
        unsafe {
            init_bytes(addr, b"hello world");
            let bytes = Cell::from_address(addr).as_ref::<Bytes>();
            assert_eq!(bytes.header.kind(), ObjectKind::Bytes);
            assert_eq!(bytes.as_slice(), b"hello world");
        }
    }

    #[test]
    fn large_int_digits_are_minimal() {
        assert_eq!(large_int_digits(1 << 62), vec![1 << 62]);
        assert_eq!(large_int_digits(-(1 << 62) - 1).len(), 1);
        assert_eq!(large_int_digits(1 << 64).len(), 2);

        let mut words = Words::<3>::new();
        let addr = words.addr();
        let n = -(1i128 << 100) + 12345;
        unsafe {
            init_large_int(addr, &large_int_digits(n));
            let large = Cell::from_address(addr).as_ref::<LargeInt>();
            assert_eq!(large.to_i128(), Some(n));
        }
    }

    #[test]
    fn trace_visits_tuple_elements_and_type_name() {
        let mut words = Words::<5>::new();
        let addr = words.addr();
        let elements = [Cell::from_i64(1), Cell::NONE, Cell::from_i64(3)];
        let mut seen = Vec::new();
        unsafe {
            init_tuple(addr, &elements);
            trace_object(addr as *mut u8, &mut |c| {
                seen.push(*c);
                *c = Cell::TRUE;
            });
            let tuple = Cell::from_address(addr).as_ref::<Tuple>();
            assert!(tuple.elements().iter().all(|&c| c == Cell::TRUE));
        }
        assert_eq!(seen, elements);

        let mut words = Words::<2>::new();
        let addr = words.addr();
        let mut count = 0;
        unsafe {
            init_type(addr, Cell::try_small_bytes(b"int").unwrap());
            trace_object(addr as *mut u8, &mut |_| count += 1);
        }
        assert_eq!(count, 1);
    }

    proptest! {
        #[test]
        fn small_int_range_round_trips(n in Cell::SMALL_INT_MIN..=Cell::SMALL_INT_MAX) {
            let c = Cell::try_small_int(n).unwrap();
            assert!(c.is_immediate());
            assert_eq!(c.as_small_int(), Some(n));
        }

        #[test]
        fn small_bytes_round_trip_any(bytes in proptest::collection::vec(proptest::arbitrary::any::<u8>(), 0..=MAX_SMALL_BYTES)) {
            let c = Cell::try_small_bytes(&bytes).unwrap();
            let mut buf = [0; MAX_SMALL_BYTES];
            assert_eq!(c.small_bytes(&mut buf), &bytes[..]);
        }
    }
}
