use crate::Cell;

/// Object kind stored in bits 3..8 of the header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectKind {
    LargeInt = 1,
    Bytes,
    Tuple,
    Type,
}

impl ObjectKind {
    pub const COUNT: usize = Self::Type as usize + 1;

    fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            1 => Self::LargeInt,
            2 => Self::Bytes,
            3 => Self::Tuple,
            4 => Self::Type,
            _ => return None,
        })
    }
}

const HEADER_TAG: u64 = 0b011;
const KIND_SHIFT: u32 = 3;
const KIND_MASK: u64 = 0b11111;
const PREFIX_SHIFT: u32 = 8;
const PREFIX_MASK: u64 = 0b11;
const WORDS_SHIFT: u32 = 32;

/// Maximum number of words an allocation may reserve in front of its header.
pub const MAX_PREFIX_WORDS: usize = PREFIX_MASK as usize;

/// The 8-byte header at the start of every heap object.
///
/// ```text
/// bits 0..3:   tag = 0b011
/// bits 3..8:   object kind
/// bits 8..10:  prefix words (allocated in front of the header)
/// bits 10..32: reserved (zero)
/// bits 32..64: payload words (following the header)
/// ```
///
/// Read as a [`Cell`], a header reports [`Cell::is_header`]. The collector
/// overwrites the header of an evacuated object with a heap reference to its
/// new copy, so a header that reads as a reference is a forwarding pointer.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Header(u64);

const _: () = assert!(size_of::<Header>() == 8);

impl Header {
    pub fn new(kind: ObjectKind, payload_words: u32) -> Self {
        Self::with_prefix(kind, payload_words, 0)
    }

    pub fn with_prefix(kind: ObjectKind, payload_words: u32, prefix_words: usize) -> Self {
        assert!(prefix_words <= MAX_PREFIX_WORDS, "header prefix too large: {prefix_words}");
        Self(
            HEADER_TAG
                | ((kind as u64) << KIND_SHIFT)
                | ((prefix_words as u64) << PREFIX_SHIFT)
                | ((payload_words as u64) << WORDS_SHIFT),
        )
    }

    #[inline(always)]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub fn as_cell(self) -> Cell {
        Cell::from_raw(self.0)
    }

    #[inline(always)]
    pub fn kind(self) -> ObjectKind {
        let bits = ((self.0 >> KIND_SHIFT) & KIND_MASK) as u8;
        match ObjectKind::from_bits(bits) {
            Some(kind) => kind,
            None => panic!("corrupt header 0x{:016x}", self.0),
        }
    }

    #[inline(always)]
    pub fn payload_words(self) -> usize {
        (self.0 >> WORDS_SHIFT) as usize
    }

    #[inline(always)]
    pub fn prefix_words(self) -> usize {
        ((self.0 >> PREFIX_SHIFT) & PREFIX_MASK) as usize
    }

    /// Total bytes of the allocation, prefix and header included.
    #[inline(always)]
    pub fn allocation_size(self) -> usize {
        (self.prefix_words() + 1 + self.payload_words()) * size_of::<u64>()
    }

    /// Read the header word at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must point to the header of a live heap object.
    #[inline(always)]
    pub unsafe fn read(addr: usize) -> Cell {
        unsafe { Cell::from_raw(*(addr as *const u64)) }
    }

    /// # Safety
    ///
    /// `addr` must point to writable, 8-byte aligned heap memory.
    #[inline(always)]
    pub unsafe fn write(self, addr: usize) {
        unsafe { *(addr as *mut u64) = self.0 };
    }
}

impl TryFrom<Cell> for Header {
    type Error = Cell;

    fn try_from(cell: Cell) -> Result<Self, Self::Error> {
        if cell.is_header() {
            Ok(Self(cell.raw()))
        } else {
            Err(cell)
        }
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("kind", &self.kind())
            .field("prefix_words", &self.prefix_words())
            .field("payload_words", &self.payload_words())
            .finish()
    }
}
