use std::sync::Arc;
use std::thread;

use bridge::{
    Cell, Error, HANDLE_QUARANTINE, HeapSettings, NativeBuffer, RootFrame, Runtime,
    RuntimeSettings,
};
use proptest::prelude::*;

fn runtime_with_space(space_size: usize) -> Runtime {
    Runtime::new(RuntimeSettings {
        heap: HeapSettings { space_size },
        handle_capacity: 8,
    })
    .unwrap()
}

fn small_runtime() -> Runtime {
    runtime_with_space(64 * 1024)
}

/// Allocate garbage until the runtime has run one more collection.
fn allocate_until_collection(runtime: &mut Runtime) {
    let cycles = runtime.gc_stats().cycles;
    while runtime.gc_stats().cycles == cycles {
        runtime.new_bytes(b"garbage that nobody roots").unwrap();
    }
}

// ── Value representation ──────────────────────────────────────────────

proptest! {
    #[test]
    fn immediate_ints_stay_immediate(n in Cell::SMALL_INT_MIN..=Cell::SMALL_INT_MAX) {
        let mut runtime = small_runtime();
        let cell = runtime.new_int(n).unwrap();
        prop_assert!(cell.is_small_int());
        prop_assert!(!cell.is_heap_ref());
        prop_assert_eq!(runtime.int_value(cell), Some(n as i128));
    }
}

#[test]
fn promotion_boundary_is_exact_in_both_directions() {
    let mut runtime = small_runtime();
    let max = runtime.new_int(Cell::SMALL_INT_MAX).unwrap();
    let above = runtime.new_int(Cell::SMALL_INT_MAX + 1).unwrap();
    let min = runtime.new_int(Cell::SMALL_INT_MIN).unwrap();
    let below = runtime.new_int(Cell::SMALL_INT_MIN - 1).unwrap();

    assert!(max.is_small_int() && min.is_small_int());
    assert!(above.is_heap_ref() && below.is_heap_ref());

    // arithmetic back into range returns to the immediate form
    assert_eq!(runtime.int_add(above, Cell::from_i64(-1)).unwrap(), max);
    assert_eq!(runtime.int_add(below, Cell::from_i64(1)).unwrap(), min);
}

// ── Root stack ────────────────────────────────────────────────────────

#[test]
fn roots_survive_moves_across_nested_frames() {
    let mut runtime = small_runtime();
    let outer = RootFrame::new(&runtime);
    let text = outer.register(runtime.new_bytes(b"rooted in the outer frame").unwrap());
    let before = text.get();
    {
        let inner = RootFrame::new(&runtime);
        let big = inner.register(runtime.new_int_wide(-(1 << 100)).unwrap());
        let tuple = inner.register(runtime.new_tuple(&[text.get(), big.get()]).unwrap());

        allocate_until_collection(&mut runtime);

        assert_ne!(text.get(), before, "the collector copies every live object");
        assert_eq!(runtime.int_value(big.get()), Some(-(1 << 100)));
        assert_eq!(runtime.tuple_get(tuple.get(), 0), Some(text.get()));
        assert_eq!(runtime.tuple_get(tuple.get(), 1), Some(big.get()));
    }
    allocate_until_collection(&mut runtime);

    assert_eq!(
        runtime.bytes_value(text.get()).as_deref(),
        Some(&b"rooted in the outer frame"[..])
    );
    assert_eq!(runtime.root_stack().depth(), 1);
}

#[test]
fn unrooted_objects_are_reclaimed() {
    let mut runtime = small_runtime();
    runtime.collect();
    let baseline = runtime.heap_used();
    for _ in 0..100 {
        runtime.new_bytes(b"this goes nowhere at all").unwrap();
    }
    assert!(runtime.heap_used() > baseline);
    runtime.collect();
    assert_eq!(runtime.heap_used(), baseline);
}

// ── Native handles ────────────────────────────────────────────────────

#[test]
fn ensure_twice_returns_the_same_handle() {
    let mut runtime = small_runtime();
    let cell = runtime.new_bytes(b"one identity, one handle").unwrap();
    let first = runtime.ensure(cell);
    let second = runtime.ensure(cell);
    assert_eq!(first, second);

    let immediate = runtime.ensure(Cell::from_i64(42));
    assert_eq!(runtime.ensure(Cell::from_i64(42)), immediate);
}

#[test]
fn count_reaching_zero_disposes_and_ensure_starts_fresh() {
    let mut runtime = small_runtime();
    let frame = RootFrame::new(&runtime);
    let value = frame.register(runtime.new_bytes(b"counted by native code").unwrap());

    let handle = runtime.new_owning_reference(value.get());
    unsafe {
        runtime.incref(handle);
        assert!(!runtime.decref(handle));
        assert!(runtime.decref(handle));
        assert!(handle.as_ref().is_disposed());
        assert_eq!(handle.as_ref().reference(), Cell::UNBOUND);
    }
    assert_eq!(runtime.lookup(value.get()), None);

    let fresh = runtime.ensure(value.get());
    assert_ne!(fresh, handle);
    assert_eq!(unsafe { fresh.as_ref() }.refcnt, 0);
}

#[test]
fn growth_preserves_every_mapping() {
    let mut runtime = runtime_with_space(256 * 1024);
    let frame = RootFrame::new(&runtime);
    let mut before = Vec::new();
    for n in 0..40 {
        let cell = runtime.new_bytes(format!("identity number {n:04}").as_bytes()).unwrap();
        before.push((frame.register(cell), runtime.ensure(cell)));
    }
    let growths = runtime.handle_stats().growths;

    for n in 0..2_000 {
        runtime.ensure(Cell::from_i64(n));
    }
    assert!(runtime.handle_stats().growths > growths);

    for (root, handle) in &before {
        assert_eq!(runtime.ensure(root.get()), *handle);
    }
}

#[test]
fn zero_count_handle_is_a_strong_root() {
    let mut runtime = small_runtime();
    let cell = runtime.new_bytes(b"only a scratch handle holds me").unwrap();
    let handle = runtime.ensure(cell);
    assert_eq!(unsafe { handle.as_ref() }.refcnt, 0);

    // the collector is shown the value through the handle table
    let mut presented = Vec::new();
    runtime.visit_handle_references(&mut |c| presented.push(*c));
    assert!(presented.contains(&cell));

    allocate_until_collection(&mut runtime);

    let moved = unsafe { runtime.as_cell(handle) };
    assert_ne!(moved, cell);
    assert_eq!(
        runtime.bytes_value(moved).as_deref(),
        Some(&b"only a scratch handle holds me"[..])
    );
    assert_eq!(runtime.lookup(moved), Some(handle));

    // it stays until disposed explicitly
    unsafe { runtime.dispose(handle) };
    assert_eq!(runtime.lookup(moved), None);
}

#[test]
fn relocation_through_the_visit_hook_keeps_keys_current() {
    let mut runtime = small_runtime();
    let frame = RootFrame::new(&runtime);
    let old = frame.register(runtime.new_bytes(b"where the object was").unwrap());
    let new = frame.register(runtime.new_bytes(b"where the object went").unwrap());
    let handle = runtime.new_owning_reference(old.get());

    let (from, to) = (old.get(), new.get());
    runtime.visit_handle_references(&mut |cell| {
        if *cell == from {
            *cell = to;
        }
    });

    assert_eq!(unsafe { runtime.as_cell(handle) }, to);
    assert_eq!(runtime.lookup(to), Some(handle));
    assert_eq!(runtime.lookup(from), None);
    assert_eq!(runtime.ensure(to), handle);
    assert!(unsafe { runtime.decref(handle) });
    assert_eq!(runtime.lookup(to), None);
}

#[test]
fn move_then_dispose_then_ensure_new_object() {
    let mut runtime = small_runtime();
    let (handle, moved) = {
        let frame = RootFrame::new(&runtime);
        let cell = frame.register(runtime.new_bytes(b"crosses into native code").unwrap());
        let before = cell.get();
        let handle = runtime.new_owning_reference(before);
        assert_eq!(unsafe { handle.as_ref() }.refcnt, 1);
        let text = unsafe { runtime.bytes_as_c_str(handle) }.unwrap();

        // roots are evacuated first: the object lands at the start of the
        // other semispace
        runtime.collect();
        let moved = unsafe { runtime.as_cell(handle) };
        assert_ne!(moved, before, "collection relocates the object");
        assert_eq!(cell.get(), moved);
        assert_eq!(runtime.lookup(moved), Some(handle));
        assert_eq!(unsafe { runtime.bytes_as_c_str(handle) }, Some(text));
        (handle, moved)
    };

    assert!(unsafe { runtime.decref(handle) });
    assert_eq!(runtime.handle_stats().cached, 0);

    // back to the first semispace, then a rooted newcomer is evacuated to
    // exactly the address the disposed handle's object had
    runtime.collect();
    let frame = RootFrame::new(&runtime);
    let newcomer = frame.register(runtime.new_bytes(b"crosses into native code").unwrap());
    runtime.collect();
    assert_eq!(newcomer.get(), moved);

    let fresh = runtime.ensure(newcomer.get());
    assert_ne!(fresh, handle, "disposed struct is quarantined");
    assert_eq!(unsafe { runtime.cache(fresh) }, None, "no stale cache data");
    assert_eq!(unsafe { fresh.as_ref() }.refcnt, 0);
    assert!(unsafe { handle.as_ref() }.is_disposed());
}

#[test]
fn disposed_struct_is_not_reused_before_quarantine_drains() {
    let mut runtime = small_runtime();
    let first = runtime.new_owning_reference(Cell::from_i64(-1));
    unsafe { runtime.decref(first) };
    for n in 0..HANDLE_QUARANTINE as i64 {
        let handle = runtime.new_owning_reference(Cell::from_i64(n));
        assert_ne!(handle, first);
    }
}

#[test]
#[should_panic(expected = "as_cell on disposed native handle")]
fn dereferencing_a_disposed_handle_is_fatal() {
    let mut runtime = small_runtime();
    let handle = runtime.new_owning_reference(Cell::TRUE);
    unsafe {
        runtime.decref(handle);
        runtime.as_cell(handle);
    }
}

#[test]
#[should_panic(expected = "decref below zero")]
fn decref_of_a_borrowed_reference_is_fatal() {
    let mut runtime = small_runtime();
    let handle = runtime.new_borrowed_reference(Cell::FALSE);
    unsafe { runtime.decref(handle) };
}

#[test]
fn custom_cache_buffers_follow_their_handle() {
    let mut runtime = small_runtime();
    let cell = runtime.new_tuple(&[Cell::NONE]).unwrap();
    let handle = runtime.new_owning_reference(cell);
    unsafe {
        runtime.set_cache(handle, Some(NativeBuffer::new(vec![1, 2, 3].into_boxed_slice())));
        let buffer = runtime.cache(handle).unwrap();
        runtime.collect();
        assert_eq!(runtime.cache(handle), Some(buffer));
        runtime.decref(handle);
    }
    assert_eq!(runtime.handle_stats().cached, 0);
}

// ── Errors and sharing ────────────────────────────────────────────────

#[test]
fn out_of_memory_surfaces_after_one_collection() {
    let mut runtime = small_runtime();
    let frame = RootFrame::new(&runtime);
    let mut kept = Vec::new();
    let err = loop {
        match runtime.new_bytes(&[7; 1000]) {
            Ok(cell) => kept.push(frame.register(cell)),
            Err(err) => break err,
        }
    };
    assert!(matches!(err, Error::OutOfMemory { .. }));
    assert!(!kept.is_empty());
    for root in &kept {
        assert_eq!(runtime.bytes_value(root.get()).unwrap().len(), 1000);
    }
}

#[test]
fn runtimes_are_independent() {
    let mut a = small_runtime();
    let mut b = small_runtime();
    let ha = a.ensure(Cell::from_i64(1));
    let hb = b.ensure(Cell::from_i64(1));
    assert_ne!(ha, hb);
    assert_eq!(a.lookup(Cell::from_i64(2)), None);
    assert_eq!(b.handle_stats().live, a.handle_stats().live);
}

#[test]
fn shared_runtime_serialises_mutators() {
    let shared = runtime_with_space(256 * 1024).into_shared();
    let workers: Vec<_> = (0..4)
        .map(|worker: i128| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                for i in 0..200 {
                    let mut runtime = shared.lock();
                    let cell = runtime.new_int_wide((worker << 80) + i).unwrap();
                    let handle = runtime.new_owning_reference(cell);
                    if i % 50 == 0 {
                        runtime.collect();
                    }
                    let cell = unsafe { runtime.as_cell(handle) };
                    assert_eq!(runtime.int_value(cell), Some((worker << 80) + i));
                    unsafe { runtime.decref(handle) };
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    let runtime = shared.lock();
    assert_eq!(runtime.handle_stats().live, 7);
}
