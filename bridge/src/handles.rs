use core::ptr::{self, NonNull};
use std::collections::VecDeque;

use bitflags::bitflags;
use object::Cell;

use crate::identity::IdentityTable;

/// Handle structs per arena chunk.
pub const HANDLE_CHUNK_SIZE: usize = 256;

/// Released handle structs wait this long in FIFO order before reuse.
pub const HANDLE_QUARANTINE: usize = 64;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleFlags: u32 {
        /// A buffer for this handle lives in the cache table.
        const HAS_CACHE = 1 << 0;
        /// Never counted, never disposed. Builtin type handles.
        const IMMORTAL  = 1 << 1;
        /// Released; the struct sits in quarantine.
        const DISPOSED  = 1 << 2;
    }
}

/// The fixed-layout record native code sees for a guest value.
///
/// Native code reads and writes `refcnt` directly and reads `ob_type`; the
/// runtime owns the rest. While registered, `reference` holds the value's
/// current [`Cell`]; the collector rewrites it when the value moves. After
/// disposal it holds [`Cell::UNBOUND`].
#[repr(C)]
pub struct NativeHandle {
    pub refcnt: usize,
    pub ob_type: *mut NativeHandle,
    reference: Cell,
    flags: HandleFlags,
}

const VACANT: NativeHandle = NativeHandle {
    refcnt: 0,
    ob_type: ptr::null_mut(),
    reference: Cell::UNBOUND,
    flags: HandleFlags::DISPOSED,
};

impl NativeHandle {
    /// The stored cell, without checking for the disposed sentinel.
    #[inline(always)]
    pub fn reference(&self) -> Cell {
        self.reference
    }

    #[inline(always)]
    pub fn flags(&self) -> HandleFlags {
        self.flags
    }

    #[inline(always)]
    pub fn is_immortal(&self) -> bool {
        self.flags.contains(HandleFlags::IMMORTAL)
    }

    #[inline(always)]
    pub fn is_disposed(&self) -> bool {
        self.flags.contains(HandleFlags::DISPOSED)
    }
}

impl core::fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NativeHandle")
            .field("refcnt", &self.refcnt)
            .field("reference", &self.reference)
            .field("flags", &self.flags)
            .finish()
    }
}

/// An owned native buffer stored in the cache table, e.g. a NUL-terminated
/// copy of a bytes value.
pub struct NativeBuffer(Box<[u8]>);

impl NativeBuffer {
    pub fn new(bytes: Box<[u8]>) -> Self {
        Self(bytes)
    }

    /// Copy `bytes` and append a NUL terminator.
    pub fn c_string(bytes: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(bytes.len() + 1);
        buf.extend_from_slice(bytes);
        buf.push(0);
        Self(buf.into_boxed_slice())
    }

    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        NonNull::from(&*self.0).cast()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Chunked storage for handle structs. Chunks are never freed while the
/// arena lives, so released addresses stay readable.
struct HandleArena {
    chunks: Vec<Box<[NativeHandle; HANDLE_CHUNK_SIZE]>>,
    /// Never-used slots left in the last chunk start here.
    next: usize,
    released: VecDeque<NonNull<NativeHandle>>,
}

impl HandleArena {
    fn new() -> Self {
        Self {
            chunks: Vec::new(),
            next: HANDLE_CHUNK_SIZE,
            released: VecDeque::new(),
        }
    }

    fn acquire(&mut self) -> NonNull<NativeHandle> {
        if self.released.len() > HANDLE_QUARANTINE
            && let Some(handle) = self.released.pop_front()
        {
            return handle;
        }
        if self.next == HANDLE_CHUNK_SIZE {
            self.chunks.push(Box::new([VACANT; HANDLE_CHUNK_SIZE]));
            self.next = 0;
        }
        let Some(chunk) = self.chunks.last_mut() else {
            unreachable!()
        };
        let handle = NonNull::from(&mut chunk[self.next]);
        self.next += 1;
        handle
    }

    fn release(&mut self, handle: NonNull<NativeHandle>) {
        self.released.push_back(handle);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HandleStats {
    /// Handles currently registered, immortal ones included.
    pub live: usize,
    pub capacity: usize,
    pub cached: usize,
    pub growths: u64,
    pub created: u64,
    pub disposed: u64,
}

/// The handle table and its companion cache table.
///
/// Maps guest value identity to the unique [`NativeHandle`] for it. Every
/// registered handle is a strong root, whatever its count.
pub struct HandleTable {
    handles: IdentityTable<NonNull<NativeHandle>>,
    caches: IdentityTable<NativeBuffer>,
    arena: HandleArena,
    created: u64,
    disposed: u64,
}

impl HandleTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            handles: IdentityTable::with_capacity(capacity),
            caches: IdentityTable::with_capacity(0),
            arena: HandleArena::new(),
            created: 0,
            disposed: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    #[inline]
    pub fn lookup(&self, cell: Cell) -> Option<NonNull<NativeHandle>> {
        self.handles.get(cell).copied()
    }

    /// The handle for `cell`, creating one with a zero count if needed.
    ///
    /// `ob_type` is only consulted when a handle is created.
    pub fn ensure(&mut self, cell: Cell, ob_type: *mut NativeHandle) -> NonNull<NativeHandle> {
        if let Some(handle) = self.lookup(cell) {
            return handle;
        }
        self.register(cell, ob_type, HandleFlags::empty())
    }

    /// Register a handle that ignores counting and can never be disposed.
    pub fn insert_immortal(&mut self, cell: Cell, ob_type: *mut NativeHandle) -> NonNull<NativeHandle> {
        assert!(
            !self.handles.contains_key(cell),
            "immortal handle for {cell:?} registered twice"
        );
        self.register(cell, ob_type, HandleFlags::IMMORTAL)
    }

    fn register(&mut self, cell: Cell, ob_type: *mut NativeHandle, flags: HandleFlags) -> NonNull<NativeHandle> {
        assert!(
            !cell.is_unbound() && !cell.is_header(),
            "cannot create a native handle for {cell:?}"
        );
        let handle = self.arena.acquire();
        // SAFETY: acquired structs are exclusively ours until released
        unsafe {
            handle.as_ptr().write(NativeHandle {
                refcnt: 0,
                ob_type,
                reference: cell,
                flags,
            });
        }
        self.handles.insert(cell, handle);
        self.created += 1;
        log::trace!("handles: {handle:p} created for {cell:?}");
        handle
    }

    /// # Safety
    ///
    /// `handle` must come from this table (disposed or not).
    #[inline(always)]
    unsafe fn live<'a>(handle: NonNull<NativeHandle>, operation: &str) -> &'a mut NativeHandle {
        // SAFETY: arena chunks outlive the table, so the struct is readable
        let h = unsafe { &mut *handle.as_ptr() };
        assert!(
            !h.is_disposed(),
            "{operation} on disposed native handle {handle:p}"
        );
        h
    }

    /// # Safety
    ///
    /// `handle` must come from this table.
    #[inline]
    pub unsafe fn incref(&mut self, handle: NonNull<NativeHandle>) {
        let h = unsafe { Self::live(handle, "incref") };
        if !h.is_immortal() {
            h.refcnt += 1;
        }
    }

    /// Returns `true` when the count reached zero and the handle was
    /// disposed.
    ///
    /// # Safety
    ///
    /// `handle` must come from this table.
    #[inline]
    pub unsafe fn decref(&mut self, handle: NonNull<NativeHandle>) -> bool {
        let h = unsafe { Self::live(handle, "decref") };
        if h.is_immortal() {
            return false;
        }
        assert!(h.refcnt > 0, "decref below zero on native handle {handle:p}");
        h.refcnt -= 1;
        if h.refcnt == 0 {
            unsafe { self.dispose(handle) };
            return true;
        }
        false
    }

    /// Unregister the handle, free its cached buffer and release the struct.
    ///
    /// # Safety
    ///
    /// `handle` must come from this table.
    pub unsafe fn dispose(&mut self, handle: NonNull<NativeHandle>) {
        let h = unsafe { Self::live(handle, "dispose") };
        assert!(!h.is_immortal(), "dispose of immortal native handle {handle:p}");

        let key = h.reference;
        match self.handles.get(key) {
            Some(&found) if found == handle => {}
            found => panic!("native handle {handle:p} for {key:?} is not registered (found {found:?})"),
        }
        self.handles.remove(key);
        if h.flags.contains(HandleFlags::HAS_CACHE) {
            self.caches.remove(key);
        }

        h.reference = Cell::UNBOUND;
        h.flags = HandleFlags::DISPOSED;
        h.refcnt = 0;
        h.ob_type = ptr::null_mut();
        self.arena.release(handle);
        self.disposed += 1;
        log::trace!("handles: {handle:p} disposed ({key:?})");
    }

    /// The stored cell of a live handle.
    ///
    /// # Safety
    ///
    /// `handle` must come from this table.
    #[inline]
    pub unsafe fn as_cell(&self, handle: NonNull<NativeHandle>) -> Cell {
        unsafe { Self::live(handle, "as_cell") }.reference
    }

    /// The type handle of a live handle.
    ///
    /// # Safety
    ///
    /// `handle` must come from this table.
    #[inline]
    pub unsafe fn type_handle(&self, handle: NonNull<NativeHandle>) -> NonNull<NativeHandle> {
        let h = unsafe { Self::live(handle, "type_handle") };
        match NonNull::new(h.ob_type) {
            Some(ty) => ty,
            None => panic!("native handle {handle:p} has no type"),
        }
    }

    /// # Safety
    ///
    /// `handle` must come from this table.
    #[inline]
    pub unsafe fn cache(&self, handle: NonNull<NativeHandle>) -> Option<NonNull<u8>> {
        let h = unsafe { Self::live(handle, "cache") };
        if !h.flags.contains(HandleFlags::HAS_CACHE) {
            return None;
        }
        self.caches.get(h.reference).map(NativeBuffer::as_ptr)
    }

    /// Replace (or with `None`, drop) the handle's cached buffer.
    ///
    /// # Safety
    ///
    /// `handle` must come from this table.
    pub unsafe fn set_cache(&mut self, handle: NonNull<NativeHandle>, buffer: Option<NativeBuffer>) {
        let h = unsafe { Self::live(handle, "set_cache") };
        match buffer {
            Some(buffer) => {
                self.caches.insert(h.reference, buffer);
                h.flags.insert(HandleFlags::HAS_CACHE);
            }
            None => {
                self.caches.remove(h.reference);
                h.flags.remove(HandleFlags::HAS_CACHE);
            }
        }
    }

    /// Present the stored cell of every registered handle to `visitor`.
    ///
    /// These are the values, not the table keys: after a moving collection
    /// the keys are stale until [`HandleTable::rekey_after_collection`].
    pub fn visit_references(&mut self, visitor: &mut dyn FnMut(&mut Cell)) {
        for handle in self.handles.values_mut() {
            // SAFETY: registered handles point at live arena structs
            visitor(unsafe { &mut handle.as_mut().reference });
        }
    }

    /// Re-derive every key from the handle's current cell.
    pub fn rekey_after_collection(&mut self) {
        let mut moved = IdentityTable::with_capacity(0);
        self.handles.rekey(|old, handle| {
            // SAFETY: registered handles point at live arena structs
            let handle = unsafe { handle.as_ref() };
            if handle.reference != old && handle.flags.contains(HandleFlags::HAS_CACHE) {
                moved.insert(old, handle.reference);
            }
            handle.reference
        });
        if !moved.is_empty() {
            self.caches
                .rekey(|old, _| moved.get(old).copied().unwrap_or(old));
        }
        log::debug!(
            "handles: rekeyed {} handles, {} cached buffers moved",
            self.handles.len(),
            moved.len()
        );
    }

    pub fn stats(&self) -> HandleStats {
        HandleStats {
            live: self.handles.len(),
            capacity: self.handles.capacity(),
            cached: self.caches.len(),
            growths: self.handles.growths(),
            created: self.created,
            disposed: self.disposed,
        }
    }
}
