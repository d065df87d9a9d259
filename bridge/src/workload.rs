use core::ptr::NonNull;

use object::Cell;

use crate::error::Result;
use crate::handles::NativeHandle;
use crate::roots::RootFrame;
use crate::runtime::Runtime;

/// A synthetic extension workload: build guest values, hand them out as
/// owned native handles, collect, and check every handle still sees the
/// same logical value.
#[derive(Debug, Clone)]
pub struct Workload {
    pub objects: usize,
    /// Collect after this many objects; 0 never forces a collection.
    pub collect_every: usize,
    pub seed: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub handles_checked: usize,
    pub forced_collections: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Expected {
    Int(i128),
    Bytes(Vec<u8>),
    Pair(i128, Vec<u8>),
}

/// LCG with a folded high half; enough to vary sizes and kinds
/// deterministically.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.0 ^ (self.0 >> 29)
    }
}

fn make(runtime: &mut Runtime, rng: &mut Rng) -> Result<(Cell, Expected)> {
    let n = rng.next();
    match n % 3 {
        0 => {
            // spread over both sides of the small int boundary
            let value = (n as i64 as i128) << (n % 5);
            Ok((runtime.new_int_wide(value)?, Expected::Int(value)))
        }
        1 => {
            let bytes: Vec<u8> = (0..n % 40).map(|i| b'a' + ((n >> i) % 26) as u8).collect();
            Ok((runtime.new_bytes(&bytes)?, Expected::Bytes(bytes)))
        }
        _ => {
            let value = (n >> 3) as i64 as i128;
            let bytes = format!("pair-{n:x}").into_bytes();
            let frame = RootFrame::new(runtime);
            let first = frame.register(runtime.new_int_wide(value)?);
            let second = frame.register(runtime.new_bytes(&bytes)?);
            let pair = runtime.new_tuple(&[first.get(), second.get()])?;
            Ok((pair, Expected::Pair(value, bytes)))
        }
    }
}

fn observe(runtime: &Runtime, handle: NonNull<NativeHandle>) -> Option<Expected> {
    // SAFETY: the caller owns a count of the handle
    let cell = unsafe { runtime.as_cell(handle) };
    if let Some(n) = runtime.int_value(cell) {
        return Some(Expected::Int(n));
    }
    if let Some(bytes) = runtime.bytes_value(cell) {
        return Some(Expected::Bytes(bytes));
    }
    let first = runtime.int_value(runtime.tuple_get(cell, 0)?)?;
    let second = runtime.bytes_value(runtime.tuple_get(cell, 1)?)?;
    Some(Expected::Pair(first, second))
}

/// Run the workload and release everything it created.
///
/// A mismatch between a handle and its value is a broken invariant and
/// panics.
pub fn churn(runtime: &mut Runtime, workload: &Workload) -> Result<Report> {
    let mut rng = Rng(workload.seed);
    let mut owned = Vec::with_capacity(workload.objects);
    let mut report = Report::default();

    for i in 0..workload.objects {
        let (cell, expected) = make(runtime, &mut rng)?;
        owned.push((runtime.new_owning_reference(cell), expected));

        if workload.collect_every > 0 && (i + 1) % workload.collect_every == 0 {
            runtime.collect();
            report.forced_collections += 1;
        }
    }

    for (handle, expected) in &owned {
        let seen = observe(runtime, *handle);
        assert_eq!(seen.as_ref(), Some(expected), "handle {handle:p} changed value");
        report.handles_checked += 1;
    }

    for (handle, _) in owned {
        // SAFETY: we own exactly one count per entry; equal values may share
        // a handle, in which case the count covers each entry
        unsafe { runtime.decref(handle) };
    }
    log::debug!("workload: {report:?}");
    Ok(report)
}
