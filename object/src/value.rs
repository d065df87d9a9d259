/// Tag constants.
const SMALL_INT_MASK: u64 = 0b1;
const TAG_MASK: u64 = 0b111;
const HEAP_REF_TAG: u64 = 0b001;
const HEADER_TAG: u64 = 0b011;
const SMALL_BYTES_TAG: u64 = 0b101;
const IMMEDIATE_TAG: u64 = 0b111;

const IMMEDIATE_MASK: u64 = 0xff;
const BOOL_TAG: u64 = 0x07;
const NONE_TAG: u64 = 0x0f;
const NOT_IMPLEMENTED_TAG: u64 = 0x17;
const UNBOUND_TAG: u64 = 0x1f;
const ERROR_TAG: u64 = 0x27;

const SMALL_BYTES_LEN_SHIFT: u32 = 3;
const SMALL_BYTES_LEN_MASK: u64 = 0b11111;
const SMALL_BYTES_DATA_SHIFT: u32 = 8;

/// Number of payload bits of a small integer.
pub const SMALL_INT_BITS: u32 = 63;

/// Maximum number of bytes stored inline in a [`Cell`].
pub const MAX_SMALL_BYTES: usize = 7;

/// The kind of a [`Cell`], as far as it can be told from the word itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    SmallInt,
    SmallBytes,
    Bool,
    None,
    NotImplemented,
    Unbound,
    Error,
    HeapRef,
    Header,
}

/// Payload of an [`CellKind::Error`] immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    None = 0,
    Exception,
    NotFound,
    OutOfMemory,
    OutOfBounds,
}

/// A tagged 64-bit guest value.
///
/// Encoding:
/// - **SmallInt**:   `...XXXXX0`: 63-bit signed integer (low bit 0).
/// - **HeapRef**:    `...XXX001`: heap address (mask low 3 bits; requires 8-byte alignment).
/// - **Header**:     `...XXX011`: only valid as the first word of a heap object.
/// - **SmallBytes**: `...XXX101`: length in bits 3..8, up to 7 bytes from bit 8.
/// - **Immediates**: `...XXX111`: the low byte selects bool, none, not-implemented,
///   unbound or error.
///
/// Immediates are identified by their bits; heap references by their address,
/// which is only meaningful until the next allocation point.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Cell(u64);

impl Cell {
    pub const NONE: Cell = Cell(NONE_TAG);
    pub const TRUE: Cell = Cell(BOOL_TAG | (1 << 8));
    pub const FALSE: Cell = Cell(BOOL_TAG);
    pub const NOT_IMPLEMENTED: Cell = Cell(NOT_IMPLEMENTED_TAG);
    pub const UNBOUND: Cell = Cell(UNBOUND_TAG);

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    // ── Classification ─────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_heap_ref(self) -> bool {
        self.0 & TAG_MASK == HEAP_REF_TAG
    }

    #[inline(always)]
    pub const fn is_header(self) -> bool {
        self.0 & TAG_MASK == HEADER_TAG
    }

    /// Everything that is neither a heap reference nor a header word.
    #[inline(always)]
    pub const fn is_immediate(self) -> bool {
        !self.is_heap_ref() && !self.is_header()
    }

    pub fn kind(self) -> CellKind {
        if self.is_small_int() {
            return CellKind::SmallInt;
        }
        match self.0 & TAG_MASK {
            HEAP_REF_TAG => CellKind::HeapRef,
            HEADER_TAG => CellKind::Header,
            SMALL_BYTES_TAG => CellKind::SmallBytes,
            IMMEDIATE_TAG => match self.0 & IMMEDIATE_MASK {
                BOOL_TAG => CellKind::Bool,
                NONE_TAG => CellKind::None,
                NOT_IMPLEMENTED_TAG => CellKind::NotImplemented,
                UNBOUND_TAG => CellKind::Unbound,
                ERROR_TAG => CellKind::Error,
                other => panic!("malformed immediate cell: low byte 0x{other:02x}"),
            },
            _ => unreachable!(),
        }
    }

    // ── SmallInt ───────────────────────────────────────────────────

    pub const SMALL_INT_MIN: i64 = -(1i64 << (SMALL_INT_BITS - 1));
    pub const SMALL_INT_MAX: i64 = (1i64 << (SMALL_INT_BITS - 1)) - 1;

    #[inline(always)]
    pub const fn is_small_int(self) -> bool {
        self.0 & SMALL_INT_MASK == 0
    }

    #[inline(always)]
    pub const fn fits_small_int(n: i64) -> bool {
        n >= Self::SMALL_INT_MIN && n <= Self::SMALL_INT_MAX
    }

    /// Encode `n` inline, or `None` when it needs a large integer.
    #[inline(always)]
    pub const fn try_small_int(n: i64) -> Option<Self> {
        if Self::fits_small_int(n) {
            Some(Self((n << 1) as u64))
        } else {
            None
        }
    }

    /// Encode `n` inline.
    ///
    /// Panics when `n` is outside the small integer range; use
    /// [`Cell::try_small_int`] when promotion is possible.
    #[inline(always)]
    pub fn from_i64(n: i64) -> Self {
        match Self::try_small_int(n) {
            Some(cell) => cell,
            None => panic!("small int overflow: {n}"),
        }
    }

    /// # Safety
    ///
    /// The value must be a small integer.
    #[inline(always)]
    pub unsafe fn to_i64_unchecked(self) -> i64 {
        debug_assert!(self.is_small_int());
        (self.0 as i64) >> 1
    }

    #[inline(always)]
    pub fn as_small_int(self) -> Option<i64> {
        if self.is_small_int() {
            // SAFETY: checked above
            Some(unsafe { self.to_i64_unchecked() })
        } else {
            None
        }
    }

    // ── SmallBytes ─────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_small_bytes(self) -> bool {
        self.0 & TAG_MASK == SMALL_BYTES_TAG
    }

    pub fn try_small_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > MAX_SMALL_BYTES {
            return None;
        }
        let mut raw = SMALL_BYTES_TAG | ((bytes.len() as u64) << SMALL_BYTES_LEN_SHIFT);
        for (i, &b) in bytes.iter().enumerate() {
            raw |= (b as u64) << (SMALL_BYTES_DATA_SHIFT + 8 * i as u32);
        }
        Some(Self(raw))
    }

    pub fn small_bytes_len(self) -> usize {
        debug_assert!(self.is_small_bytes());
        ((self.0 >> SMALL_BYTES_LEN_SHIFT) & SMALL_BYTES_LEN_MASK) as usize
    }

    /// Copy the inline bytes into `out`, returning the filled prefix.
    pub fn small_bytes<'a>(self, out: &'a mut [u8; MAX_SMALL_BYTES]) -> &'a [u8] {
        assert!(self.is_small_bytes(), "not small bytes: {self:?}");
        let len = self.small_bytes_len();
        for (i, byte) in out.iter_mut().enumerate().take(len) {
            *byte = (self.0 >> (SMALL_BYTES_DATA_SHIFT + 8 * i as u32)) as u8;
        }
        &out[..len]
    }

    // ── Singletons ─────────────────────────────────────────────────

    #[inline(always)]
    pub const fn from_bool(b: bool) -> Self {
        if b { Self::TRUE } else { Self::FALSE }
    }

    #[inline(always)]
    pub fn as_bool(self) -> Option<bool> {
        if self.0 & IMMEDIATE_MASK == BOOL_TAG {
            Some(self.0 >> 8 != 0)
        } else {
            None
        }
    }

    #[inline(always)]
    pub const fn is_none(self) -> bool {
        self.0 == NONE_TAG
    }

    #[inline(always)]
    pub const fn is_unbound(self) -> bool {
        self.0 == UNBOUND_TAG
    }

    #[inline(always)]
    pub const fn error(kind: ErrorKind) -> Self {
        Self(ERROR_TAG | ((kind as u64) << 8))
    }

    #[inline(always)]
    pub const fn is_error(self) -> bool {
        self.0 & IMMEDIATE_MASK == ERROR_TAG
    }

    // ── Heap references ────────────────────────────────────────────

    #[inline(always)]
    pub fn from_address(addr: usize) -> Self {
        debug_assert!(addr as u64 & TAG_MASK == 0, "address not aligned: 0x{addr:x}");
        Self(addr as u64 | HEAP_REF_TAG)
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self::from_address(ptr as usize)
    }

    /// Byte address of the referenced heap object.
    ///
    /// Calling this on anything but a heap reference is a broken invariant
    /// somewhere else in the runtime and aborts the operation.
    #[inline(always)]
    pub fn as_address(self) -> usize {
        assert!(
            self.is_heap_ref(),
            "as_address on a non-heap cell: {self:?}"
        );
        (self.0 & !TAG_MASK) as usize
    }

    /// # Safety
    ///
    /// The value must be a reference to a valid, live `T`.
    #[inline(always)]
    pub unsafe fn as_ref<'a, T>(self) -> &'a T {
        unsafe { &*(self.as_address() as *const T) }
    }

    /// # Safety
    ///
    /// The value must be a reference to a valid, live `T`, and no other
    /// references to it may exist.
    #[inline(always)]
    pub unsafe fn as_mut<'a, T>(self) -> &'a mut T {
        unsafe { &mut *(self.as_address() as *mut T) }
    }
}

impl Default for Cell {
    fn default() -> Self {
        Self::NONE
    }
}

impl From<bool> for Cell {
    fn from(b: bool) -> Self {
        Self::from_bool(b)
    }
}

impl core::fmt::Debug for Cell {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.kind() {
            CellKind::SmallInt => write!(f, "SmallInt({})", unsafe { self.to_i64_unchecked() }),
            CellKind::SmallBytes => {
                let mut buf = [0; MAX_SMALL_BYTES];
                write!(f, "SmallBytes({:?})", self.small_bytes(&mut buf))
            }
            CellKind::Bool => write!(f, "Bool({})", self.0 >> 8 != 0),
            CellKind::None => write!(f, "None"),
            CellKind::NotImplemented => write!(f, "NotImplemented"),
            CellKind::Unbound => write!(f, "Unbound"),
            CellKind::Error => write!(f, "Error({})", (self.0 >> 8) as u8),
            CellKind::HeapRef => write!(f, "Ref(0x{:x})", self.0 & !TAG_MASK),
            CellKind::Header => write!(f, "Header(0x{:016x})", self.0),
        }
    }
}
