use core::ffi::c_char;
use core::ptr::{self, NonNull};
use std::sync::Arc;

use heap::{GcStats, Heap, RootProvider};
use num_bigint::{BigInt, Sign};
use object::{
    Bytes, Cell, CellKind, Header, LargeInt, MAX_SMALL_BYTES, ObjectKind, TYPE_PAYLOAD_WORDS,
    Tuple, Type, bytes_payload_words, init_bytes, init_large_int, init_tuple, init_type,
    large_int_digits, large_int_payload_words, trace_object, tuple_payload_words,
};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::handles::{HandleStats, HandleTable, NativeBuffer, NativeHandle};
use crate::roots::{Root, RootFrame, RootStack};
use crate::settings::RuntimeSettings;

/// A runtime shared between threads. Whoever holds the lock is the mutator.
pub type SharedRuntime = Arc<Mutex<Runtime>>;

/// Immortal handles of the builtin type objects.
#[derive(Clone, Copy)]
struct BuiltinTypes {
    type_: NonNull<NativeHandle>,
    int: NonNull<NativeHandle>,
    bool: NonNull<NativeHandle>,
    none: NonNull<NativeHandle>,
    not_implemented: NonNull<NativeHandle>,
    bytes: NonNull<NativeHandle>,
    tuple: NonNull<NativeHandle>,
}

impl BuiltinTypes {
    const UNSET: Self = Self {
        type_: NonNull::dangling(),
        int: NonNull::dangling(),
        bool: NonNull::dangling(),
        none: NonNull::dangling(),
        not_implemented: NonNull::dangling(),
        bytes: NonNull::dangling(),
        tuple: NonNull::dangling(),
    };
}

/// Everything the collector treats as a root: the root stack and the value
/// of every registered native handle.
struct CollectionRoots<'a> {
    roots: &'a mut RootStack,
    handles: &'a mut HandleTable,
}

impl RootProvider for CollectionRoots<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Cell)) {
        self.roots.visit(visitor);
        self.handles.visit_references(visitor);
    }
}

/// One managed heap, its root stack and its native handle table.
///
/// Single mutator: share it between threads only behind a lock
/// ([`SharedRuntime`]).
pub struct Runtime {
    heap: Heap,
    roots: Box<RootStack>,
    handles: HandleTable,
    types: BuiltinTypes,
}

// SAFETY: handle pointers point into arenas owned by the runtime itself, and
// RootFrames (which point back at the root stack) are !Send
unsafe impl Send for Runtime {}

impl Runtime {
    pub fn new(settings: RuntimeSettings) -> Result<Self> {
        settings.validate().map_err(Error::InvalidSettings)?;
        let heap = Heap::new(settings.heap.clone(), trace_object).map_err(Error::InvalidSettings)?;
        let mut runtime = Self {
            heap,
            roots: Box::new(RootStack::new()),
            handles: HandleTable::with_capacity(settings.handle_capacity),
            types: BuiltinTypes::UNSET,
        };
        runtime.types = runtime.bootstrap_types()?;
        log::debug!(
            "runtime: ready, {} byte semispaces, {} builtin type handles",
            settings.heap.space_size,
            runtime.handles.len()
        );
        Ok(runtime)
    }

    pub fn into_shared(self) -> SharedRuntime {
        Arc::new(Mutex::new(self))
    }

    fn bootstrap_types(&mut self) -> Result<BuiltinTypes> {
        let type_cell = self.new_type(b"type")?;
        let type_ = self.handles.insert_immortal(type_cell, ptr::null_mut());
        // the type of types is its own type
        // SAFETY: freshly registered, nothing else refers to it yet
        unsafe { (*type_.as_ptr()).ob_type = type_.as_ptr() };

        let mut builtin = |name: &[u8]| -> Result<NonNull<NativeHandle>> {
            let cell = self.new_type(name)?;
            Ok(self.handles.insert_immortal(cell, type_.as_ptr()))
        };
        Ok(BuiltinTypes {
            type_,
            int: builtin(b"int")?,
            bool: builtin(b"bool")?,
            none: builtin(b"NoneType")?,
            not_implemented: builtin(b"NotImplementedType")?,
            bytes: builtin(b"bytes")?,
            tuple: builtin(b"tuple")?,
        })
    }

    // ── Collector interface ───────────────────────────────────────────

    /// Allocate `size` zeroed bytes, collecting and retrying once if the
    /// heap is full.
    ///
    /// Any collection moves objects: cells not held in a [`Root`] or a
    /// native handle are stale afterwards.
    pub fn allocate(&mut self, size: usize, header_offset: usize) -> Result<usize> {
        if let Some(addr) = self.heap.allocate(size, header_offset) {
            return Ok(addr);
        }
        log::debug!("runtime: allocation of {size} bytes failed, collecting");
        self.collect();
        self.heap
            .allocate(size, header_offset)
            .ok_or(Error::OutOfMemory { requested: size })
    }

    fn allocate_object(&mut self, kind: ObjectKind, payload_words: u32) -> Result<usize> {
        self.allocate(Header::new(kind, payload_words).allocation_size(), 0)
    }

    /// Run a full collection, then bring the handle table keys up to date.
    pub fn collect(&mut self) {
        let Self {
            heap,
            roots,
            handles,
            ..
        } = self;
        heap.collect(&mut CollectionRoots { roots, handles });
        handles.rekey_after_collection();
    }

    /// Visit every root on the root stack.
    pub fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Cell)) {
        self.roots.visit(visitor);
    }

    /// Visit the stored cell of every registered native handle.
    ///
    /// The visitor may relocate values; the table is rekeyed afterwards so
    /// lookups by the new cell find the same handle.
    pub fn visit_handle_references(&mut self, visitor: &mut dyn FnMut(&mut Cell)) {
        self.handles.visit_references(visitor);
        self.handles.rekey_after_collection();
    }

    pub fn root_stack(&self) -> &RootStack {
        &self.roots
    }

    pub fn gc_stats(&self) -> GcStats {
        self.heap.stats()
    }

    pub fn handle_stats(&self) -> HandleStats {
        self.handles.stats()
    }

    pub fn heap_used(&self) -> usize {
        self.heap.used()
    }

    // ── Objects ───────────────────────────────────────────────────────

    #[inline]
    fn object_kind(&self, cell: Cell) -> Option<ObjectKind> {
        if !cell.is_heap_ref() {
            return None;
        }
        // SAFETY: heap references always point at a live header
        Some(unsafe { cell.as_ref::<Header>() }.kind())
    }

    pub fn new_int(&mut self, n: i64) -> Result<Cell> {
        match Cell::try_small_int(n) {
            Some(cell) => Ok(cell),
            None => self.new_int_wide(n as i128),
        }
    }

    pub fn new_int_wide(&mut self, n: i128) -> Result<Cell> {
        if let Ok(small) = i64::try_from(n)
            && let Some(cell) = Cell::try_small_int(small)
        {
            return Ok(cell);
        }
        let digits = large_int_digits(n);
        let addr = self.allocate_object(ObjectKind::LargeInt, large_int_payload_words(digits.len()))?;
        // SAFETY: fresh allocation sized for these digits
        unsafe { init_large_int(addr, &digits) };
        Ok(Cell::from_address(addr))
    }

    /// Integer of any magnitude. Values that fit are stored immediately.
    pub fn new_int_big(&mut self, n: &BigInt) -> Result<Cell> {
        if let Ok(small) = i64::try_from(n)
            && let Some(cell) = Cell::try_small_int(small)
        {
            return Ok(cell);
        }
        let digits = big_digits(n);
        let addr = self.allocate_object(ObjectKind::LargeInt, large_int_payload_words(digits.len()))?;
        // SAFETY: fresh allocation sized for these digits
        unsafe { init_large_int(addr, &digits) };
        Ok(Cell::from_address(addr))
    }

    /// `None` for non-integers and for integers outside `i128`; see
    /// [`Runtime::int_big_value`].
    pub fn int_value(&self, cell: Cell) -> Option<i128> {
        if let Some(n) = cell.as_small_int() {
            return Some(n as i128);
        }
        match self.object_kind(cell)? {
            // SAFETY: kind checked
            ObjectKind::LargeInt => unsafe { cell.as_ref::<LargeInt>() }.to_i128(),
            _ => None,
        }
    }

    pub fn int_big_value(&self, cell: Cell) -> Option<BigInt> {
        if let Some(n) = cell.as_small_int() {
            return Some(BigInt::from(n));
        }
        match self.object_kind(cell)? {
            // SAFETY: kind checked
            ObjectKind::LargeInt => Some(from_digits(unsafe { cell.as_ref::<LargeInt>() }.digits())),
            _ => None,
        }
    }

    /// Integer addition. Non-integer operands give [`Cell::NOT_IMPLEMENTED`].
    pub fn int_add(&mut self, a: Cell, b: Cell) -> Result<Cell> {
        if let (Some(x), Some(y)) = (a.as_small_int(), b.as_small_int()) {
            // two 63-bit values never overflow an i64
            return self.new_int(x + y);
        }
        let (Some(a), Some(b)) = (self.int_big_value(a), self.int_big_value(b)) else {
            return Ok(Cell::NOT_IMPLEMENTED);
        };
        self.new_int_big(&(a + b))
    }

    /// Short sequences are stored inline, longer ones on the heap.
    pub fn new_bytes(&mut self, bytes: &[u8]) -> Result<Cell> {
        if let Some(cell) = Cell::try_small_bytes(bytes) {
            return Ok(cell);
        }
        let addr = self.allocate_object(ObjectKind::Bytes, bytes_payload_words(bytes.len()))?;
        // SAFETY: fresh allocation sized for these bytes
        unsafe { init_bytes(addr, bytes) };
        Ok(Cell::from_address(addr))
    }

    pub fn bytes_value(&self, cell: Cell) -> Option<Vec<u8>> {
        if cell.is_small_bytes() {
            let mut buf = [0; MAX_SMALL_BYTES];
            return Some(cell.small_bytes(&mut buf).to_vec());
        }
        match self.object_kind(cell)? {
            // SAFETY: kind checked
            ObjectKind::Bytes => Some(unsafe { cell.as_ref::<Bytes>() }.as_slice().to_vec()),
            _ => None,
        }
    }

    pub fn new_tuple(&mut self, elements: &[Cell]) -> Result<Cell> {
        let frame = RootFrame::new(self);
        let rooted: Vec<Root<'_>> = elements.iter().map(|&cell| frame.register(cell)).collect();
        let addr = self.allocate_object(ObjectKind::Tuple, tuple_payload_words(elements.len()))?;
        let elements: Vec<Cell> = rooted.iter().map(Root::get).collect();
        // SAFETY: fresh allocation sized for these elements
        unsafe { init_tuple(addr, &elements) };
        Ok(Cell::from_address(addr))
    }

    pub fn tuple_len(&self, cell: Cell) -> Option<usize> {
        match self.object_kind(cell)? {
            // SAFETY: kind checked
            ObjectKind::Tuple => Some(unsafe { cell.as_ref::<Tuple>() }.len()),
            _ => None,
        }
    }

    pub fn tuple_get(&self, cell: Cell, index: usize) -> Option<Cell> {
        match self.object_kind(cell)? {
            // SAFETY: kind checked
            ObjectKind::Tuple => unsafe { cell.as_ref::<Tuple>() }.elements().get(index).copied(),
            _ => None,
        }
    }

    pub fn new_type(&mut self, name: &[u8]) -> Result<Cell> {
        let name = self.new_bytes(name)?;
        let frame = RootFrame::new(self);
        let name = frame.register(name);
        let addr = self.allocate_object(ObjectKind::Type, TYPE_PAYLOAD_WORDS)?;
        // SAFETY: fresh allocation sized for a type
        unsafe { init_type(addr, name.get()) };
        Ok(Cell::from_address(addr))
    }

    pub fn type_name(&self, cell: Cell) -> Option<Vec<u8>> {
        match self.object_kind(cell)? {
            // SAFETY: kind checked
            ObjectKind::Type => self.bytes_value(unsafe { cell.as_ref::<Type>() }.name),
            _ => None,
        }
    }

    /// The immortal handle of the builtin type of `cell`.
    pub fn type_of(&self, cell: Cell) -> NonNull<NativeHandle> {
        let types = &self.types;
        match cell.kind() {
            CellKind::SmallInt => types.int,
            CellKind::SmallBytes => types.bytes,
            CellKind::Bool => types.bool,
            CellKind::None => types.none,
            CellKind::NotImplemented => types.not_implemented,
            CellKind::HeapRef => match self.object_kind(cell) {
                Some(ObjectKind::LargeInt) => types.int,
                Some(ObjectKind::Bytes) => types.bytes,
                Some(ObjectKind::Tuple) => types.tuple,
                Some(ObjectKind::Type) | None => types.type_,
            },
            CellKind::Unbound | CellKind::Error | CellKind::Header => {
                panic!("{cell:?} is not a guest value")
            }
        }
    }

    // ── Native handles ────────────────────────────────────────────────

    /// The existing handle for `cell` without creating one.
    pub fn lookup(&self, cell: Cell) -> Option<NonNull<NativeHandle>> {
        self.handles.lookup(cell)
    }

    /// The unique handle for `cell`'s identity, created with a zero count
    /// if it does not exist yet.
    pub fn ensure(&mut self, cell: Cell) -> NonNull<NativeHandle> {
        if let Some(handle) = self.handles.lookup(cell) {
            return handle;
        }
        let ob_type = self.type_of(cell).as_ptr();
        self.handles.ensure(cell, ob_type)
    }

    /// A handle native code owns one count of.
    pub fn new_owning_reference(&mut self, cell: Cell) -> NonNull<NativeHandle> {
        let handle = self.ensure(cell);
        // SAFETY: just obtained from this runtime
        unsafe { self.handles.incref(handle) };
        handle
    }

    /// A handle native code may use but does not own a count of.
    pub fn new_borrowed_reference(&mut self, cell: Cell) -> NonNull<NativeHandle> {
        self.ensure(cell)
    }

    /// # Safety
    ///
    /// `handle` must have been issued by this runtime.
    pub unsafe fn incref(&mut self, handle: NonNull<NativeHandle>) {
        unsafe { self.handles.incref(handle) }
    }

    /// Borrowed handle of the handle's type. Fatal on a disposed handle.
    ///
    /// # Safety
    ///
    /// `handle` must have been issued by this runtime.
    pub unsafe fn type_handle(&self, handle: NonNull<NativeHandle>) -> NonNull<NativeHandle> {
        unsafe { self.handles.type_handle(handle) }
    }

    /// Returns `true` if the handle was disposed.
    ///
    /// # Safety
    ///
    /// `handle` must have been issued by this runtime.
    pub unsafe fn decref(&mut self, handle: NonNull<NativeHandle>) -> bool {
        unsafe { self.handles.decref(handle) }
    }

    /// # Safety
    ///
    /// `handle` must have been issued by this runtime.
    pub unsafe fn dispose(&mut self, handle: NonNull<NativeHandle>) {
        unsafe { self.handles.dispose(handle) }
    }

    /// The current cell behind a handle. Fatal on a disposed handle.
    ///
    /// # Safety
    ///
    /// `handle` must have been issued by this runtime.
    pub unsafe fn as_cell(&self, handle: NonNull<NativeHandle>) -> Cell {
        unsafe { self.handles.as_cell(handle) }
    }

    /// # Safety
    ///
    /// `handle` must have been issued by this runtime.
    pub unsafe fn cache(&self, handle: NonNull<NativeHandle>) -> Option<NonNull<u8>> {
        unsafe { self.handles.cache(handle) }
    }

    /// # Safety
    ///
    /// `handle` must have been issued by this runtime.
    pub unsafe fn set_cache(&mut self, handle: NonNull<NativeHandle>, buffer: Option<NativeBuffer>) {
        unsafe { self.handles.set_cache(handle, buffer) }
    }

    /// A NUL-terminated copy of a bytes value, owned by its handle.
    ///
    /// Built on first use; later calls return the same pointer until the
    /// handle is disposed. `None` if the handle does not refer to bytes.
    ///
    /// # Safety
    ///
    /// `handle` must have been issued by this runtime.
    pub unsafe fn bytes_as_c_str(&mut self, handle: NonNull<NativeHandle>) -> Option<NonNull<c_char>> {
        if let Some(cached) = unsafe { self.handles.cache(handle) } {
            return Some(cached.cast());
        }
        let bytes = self.bytes_value(unsafe { self.handles.as_cell(handle) })?;
        unsafe {
            self.handles
                .set_cache(handle, Some(NativeBuffer::c_string(&bytes)));
            self.handles.cache(handle).map(NonNull::cast)
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.roots.depth() != 0 {
            // live frames still point at the stack; keep it allocated
            log::error!(
                "runtime: dropped with {} live root frames",
                self.roots.depth()
            );
            core::mem::forget(core::mem::replace(&mut self.roots, Box::new(RootStack::new())));
        }
    }
}

/// Minimal little-endian two's complement digits of `n`.
fn big_digits(n: &BigInt) -> Vec<u64> {
    let mut bytes = n.to_signed_bytes_le();
    let fill = if n.sign() == Sign::Minus { 0xFF } else { 0 };
    bytes.resize(bytes.len().next_multiple_of(8), fill);
    bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut word = [0; 8];
            word.copy_from_slice(chunk);
            u64::from_le_bytes(word)
        })
        .collect()
}

fn from_digits(digits: &[u64]) -> BigInt {
    let bytes: Vec<u8> = digits.iter().flat_map(|d| d.to_le_bytes()).collect();
    BigInt::from_signed_bytes_le(&bytes)
}
