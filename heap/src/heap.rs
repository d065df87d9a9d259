//! Semispace copying heap.
//!
//! Two equally sized, zeroed arenas. Allocation bumps through the current
//! ("from") space; a collection copies everything reachable from the roots
//! into the other space and flips them. The heap knows nothing about object
//! layouts beyond the [`Header`] word. Consumers provide:
//! - A [`TraceFn`] to enumerate Cell edges of heap objects.
//! - A [`RootProvider`] to supply live roots at collection time.

use std::mem;

use object::{Cell, Header};

use crate::system::{OS_PAGE_SIZE, Region};

const WORD: usize = size_of::<u64>();

// ── Public API types ──────────────────────────────────────────────────

/// Function that traces all Cell edges of a heap object.
///
/// Given the header address of a heap object, the function must call
/// `visitor` for every [`Cell`] field that may be a heap reference. The
/// visitor may rewrite the Cell in place.
///
/// # Safety
///
/// `obj` must point to the header of a valid, live heap object.
pub type TraceFn = unsafe fn(obj: *mut u8, visitor: &mut dyn FnMut(&mut Cell));

/// Consumers implement this to provide GC roots.
///
/// The visitor receives `&mut Cell` so the collector can rewrite roots in
/// place when it relocates their referents.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Cell));
}

// ── Heap settings ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Size of one semispace in bytes. The heap maps twice this much.
    /// Must be a multiple of the OS page size.
    pub space_size: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            space_size: 4 * 1024 * 1024, // 4 MB
        }
    }
}

impl HeapSettings {
    #[inline]
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.space_size == 0 {
            return Err("space_size must be > 0");
        }
        if !self.space_size.is_multiple_of(OS_PAGE_SIZE) {
            return Err("space_size must match OS page alignment");
        }
        Ok(())
    }
}

/// Counters accumulated over the lifetime of a heap.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub cycles: u64,
    pub objects_copied: u64,
    pub bytes_copied: u64,
    pub bytes_reclaimed: u64,
}

// ── Space ─────────────────────────────────────────────────────────────

/// A contiguous, zeroed arena with a bump pointer.
#[derive(Debug)]
pub struct Space {
    region: Region,
    bump: usize,
}

impl Space {
    fn new(size: usize) -> Option<Self> {
        Some(Self {
            region: Region::zeroed(size)?,
            bump: 0,
        })
    }

    #[inline(always)]
    pub fn base(&self) -> usize {
        self.region.start().as_ptr() as usize
    }

    #[inline(always)]
    pub fn used(&self) -> usize {
        self.bump
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// True if `addr` lies inside the allocated part of this space.
    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.base() + self.bump
    }

    /// Bump allocate `size` bytes and return `start + header_offset`.
    #[inline]
    fn allocate(&mut self, size: usize, header_offset: usize) -> Option<usize> {
        let size = size.checked_next_multiple_of(WORD)?;
        if self.capacity() - self.bump < size {
            return None;
        }
        let start = self.base() + self.bump;
        self.bump += size;
        Some(start + header_offset)
    }

    /// Zero the used part so the next round of allocations starts clean.
    fn reset(&mut self) {
        self.region.clear(self.bump);
        self.bump = 0;
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Heap {
    settings: HeapSettings,
    from: Space,
    to: Space,
    trace_fn: TraceFn,
    stats: GcStats,
}

// SAFETY: the heap owns its mappings; the runtime serializes access
unsafe impl Send for Heap {}

impl Heap {
    pub fn new(settings: HeapSettings, trace_fn: TraceFn) -> Result<Self, &'static str> {
        settings.validate()?;
        let from = Space::new(settings.space_size).ok_or("failed to map from-space")?;
        let to = Space::new(settings.space_size).ok_or("failed to map to-space")?;
        log::debug!(
            "heap: mapped two {} byte semispaces at 0x{:x} and 0x{:x}",
            settings.space_size,
            from.base(),
            to.base()
        );
        Ok(Self {
            settings,
            from,
            to,
            trace_fn,
            stats: GcStats::default(),
        })
    }

    #[inline(always)]
    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    #[inline(always)]
    pub fn stats(&self) -> GcStats {
        self.stats
    }

    #[inline(always)]
    pub fn used(&self) -> usize {
        self.from.used()
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.from.capacity()
    }

    /// True if `cell` references an object allocated in the current space.
    #[inline]
    pub fn contains(&self, cell: Cell) -> bool {
        cell.is_heap_ref() && self.from.contains(cell.as_address())
    }

    /// Allocate a zeroed, 8-byte aligned region of `size` bytes.
    ///
    /// Returns the address `header_offset` bytes into the region, which is
    /// where the object header goes. `None` means the current space is
    /// exhausted; the caller decides whether to collect and retry.
    /// The address is only valid until the next collection.
    #[inline]
    pub fn allocate(&mut self, size: usize, header_offset: usize) -> Option<usize> {
        debug_assert!(header_offset.is_multiple_of(WORD), "unaligned header offset");
        debug_assert!(header_offset < size.max(WORD), "header offset past allocation");
        self.from.allocate(size, header_offset)
    }

    /// Run one full collection cycle.
    ///
    /// Every root the provider presents is evacuated and rewritten in place;
    /// everything unreachable from them is reclaimed. The old space is only
    /// reused for allocation after the cycle has finished.
    pub fn collect(&mut self, roots: &mut dyn RootProvider) {
        let before = self.from.used();
        log::debug!(
            "gc: cycle {} start, {} bytes in use",
            self.stats.cycles + 1,
            before
        );

        let trace_fn = self.trace_fn;
        let mut evacuator = Evacuator {
            from: &self.from,
            to: &mut self.to,
            gray: Vec::new(),
            objects: 0,
        };

        roots.visit_roots(&mut |cell| *cell = evacuator.evacuate(*cell));

        while let Some(obj) = evacuator.gray.pop() {
            // SAFETY: `obj` is the header of an object we just copied
            unsafe { trace_fn(obj as *mut u8, &mut |cell| *cell = evacuator.evacuate(*cell)) };
        }

        let objects = evacuator.objects;
        let after = self.to.used();

        self.from.reset();
        mem::swap(&mut self.from, &mut self.to);

        self.stats.cycles += 1;
        self.stats.objects_copied += objects;
        self.stats.bytes_copied += after as u64;
        self.stats.bytes_reclaimed += (before - after) as u64;

        log::debug!(
            "gc: cycle {} done, copied {} objects ({} bytes), reclaimed {} bytes",
            self.stats.cycles,
            objects,
            after,
            before - after
        );
    }
}

/// Copies objects out of from-space, leaving forwarding references behind.
struct Evacuator<'a> {
    from: &'a Space,
    to: &'a mut Space,
    gray: Vec<usize>,
    objects: u64,
}

impl Evacuator<'_> {
    fn evacuate(&mut self, cell: Cell) -> Cell {
        if !cell.is_heap_ref() {
            return cell;
        }
        let addr = cell.as_address();
        if !self.from.contains(addr) {
            return cell;
        }

        // SAFETY: addr is the header of an object in from-space
        let word = unsafe { Header::read(addr) };
        if word.is_heap_ref() {
            // already copied, the header slot holds the forwarding reference
            return word;
        }
        let header = match Header::try_from(word) {
            Ok(header) => header,
            Err(word) => panic!("gc: reference 0x{addr:x} to a non-object word {word:?}"),
        };

        let size = header.allocation_size();
        let prefix = header.prefix_words() * WORD;
        let Some(new_addr) = self.to.allocate(size, prefix) else {
            panic!("gc: to-space overflow while copying {size} bytes");
        };

        // SAFETY: both regions are `size` bytes, distinct spaces
        unsafe {
            std::ptr::copy_nonoverlapping(
                (addr - prefix) as *const u8,
                (new_addr - prefix) as *mut u8,
                size,
            );
            *(addr as *mut u64) = Cell::from_address(new_addr).raw();
        }

        self.objects += 1;
        self.gray.push(new_addr);
        Cell::from_address(new_addr)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
