use core::{ptr, slice};

use crate::header::{Header, ObjectKind};
use crate::Cell;

const WORD: usize = size_of::<u64>();

// ── LargeInt ───────────────────────────────────────────────────────

/// An integer outside the small integer range.
///
/// ```text
/// [Header 8B] [digit_0 8B] [digit_1 8B] ...
/// ```
///
/// Digits are little-endian two's complement; the digit count is the
/// header's payload word count.
#[repr(C)]
pub struct LargeInt {
    pub header: Header,
}

const _: () = assert!(size_of::<LargeInt>() == 8);

impl LargeInt {
    #[inline(always)]
    pub fn digits(&self) -> &[u64] {
        let len = self.header.payload_words();
        // SAFETY: the header records how many digits follow
        unsafe { slice::from_raw_parts((self as *const Self).add(1) as *const u64, len) }
    }

    /// The value as an `i128`, or `None` if it needs more than two digits.
    pub fn to_i128(&self) -> Option<i128> {
        match *self.digits() {
            [lo] => Some(lo as i64 as i128),
            [lo, hi] => Some((((hi as i64) as i128) << 64) | lo as i128),
            _ => None,
        }
    }
}

pub const fn large_int_payload_words(digit_count: usize) -> u32 {
    digit_count as u32
}

/// Minimal two's complement digits for `n`.
pub fn large_int_digits(n: i128) -> Vec<u64> {
    let lo = n as u64;
    let hi = (n >> 64) as u64;
    // one digit suffices when the high digit is only sign extension
    if (lo as i64 as i128) == n {
        vec![lo]
    } else {
        vec![lo, hi]
    }
}

/// # Safety
///
/// `addr` must be a zeroed allocation of
/// `large_int_payload_words(digits.len())` payload words plus header.
pub unsafe fn init_large_int(addr: usize, digits: &[u64]) {
    unsafe {
        Header::new(ObjectKind::LargeInt, large_int_payload_words(digits.len())).write(addr);
        ptr::copy_nonoverlapping(digits.as_ptr(), (addr + WORD) as *mut u64, digits.len());
    }
}

// ── Bytes ──────────────────────────────────────────────────────────

/// An immutable byte sequence too long to be stored inline.
///
/// ```text
/// [Header 8B] [length: u64 8B] [bytes, padded to 8B]
/// ```
#[repr(C)]
pub struct Bytes {
    pub header: Header,
    length: u64,
}

const _: () = assert!(size_of::<Bytes>() == 16);

impl Bytes {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.length as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `length` bytes follow the fixed part
        unsafe { slice::from_raw_parts((self as *const Self).add(1) as *const u8, self.len()) }
    }
}

pub const fn bytes_payload_words(len: usize) -> u32 {
    (1 + len.div_ceil(WORD)) as u32
}

/// # Safety
///
/// `addr` must be a zeroed allocation of `bytes_payload_words(bytes.len())`
/// payload words plus header.
pub unsafe fn init_bytes(addr: usize, bytes: &[u8]) {
    unsafe {
        Header::new(ObjectKind::Bytes, bytes_payload_words(bytes.len())).write(addr);
        *((addr + WORD) as *mut u64) = bytes.len() as u64;
        ptr::copy_nonoverlapping(bytes.as_ptr(), (addr + 2 * WORD) as *mut u8, bytes.len());
    }
}

// ── Tuple ──────────────────────────────────────────────────────────

/// A fixed-length sequence of cells.
///
/// ```text
/// [Header 8B] [length: u64 8B] [elem_0 8B] [elem_1 8B] ...
/// ```
#[repr(C)]
pub struct Tuple {
    pub header: Header,
    length: u64,
}

const _: () = assert!(size_of::<Tuple>() == 16);

impl Tuple {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.length as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline(always)]
    pub fn elements(&self) -> &[Cell] {
        // SAFETY: `length` cells follow the fixed part
        unsafe { slice::from_raw_parts((self as *const Self).add(1) as *const Cell, self.len()) }
    }

    #[inline(always)]
    pub fn elements_mut(&mut self) -> &mut [Cell] {
        // SAFETY: `length` cells follow the fixed part
        unsafe { slice::from_raw_parts_mut((self as *mut Self).add(1) as *mut Cell, self.len()) }
    }
}

pub const fn tuple_payload_words(len: usize) -> u32 {
    (1 + len) as u32
}

/// # Safety
///
/// `addr` must be a zeroed allocation of `tuple_payload_words(elements.len())`
/// payload words plus header.
pub unsafe fn init_tuple(addr: usize, elements: &[Cell]) {
    unsafe {
        Header::new(ObjectKind::Tuple, tuple_payload_words(elements.len())).write(addr);
        *((addr + WORD) as *mut u64) = elements.len() as u64;
        ptr::copy_nonoverlapping(elements.as_ptr(), (addr + 2 * WORD) as *mut Cell, elements.len());
    }
}

// ── Type ───────────────────────────────────────────────────────────

/// A guest type object. Only what the handle bridge needs: a name.
///
/// ```text
/// [Header 8B] [name: Cell 8B]
/// ```
#[repr(C)]
pub struct Type {
    pub header: Header,
    pub name: Cell,
}

const _: () = assert!(size_of::<Type>() == 16);

pub const TYPE_PAYLOAD_WORDS: u32 = 1;

/// # Safety
///
/// `addr` must be a zeroed allocation of [`TYPE_PAYLOAD_WORDS`] payload
/// words plus header.
pub unsafe fn init_type(addr: usize, name: Cell) {
    unsafe {
        ptr::write(
            addr as *mut Type,
            Type {
                header: Header::new(ObjectKind::Type, TYPE_PAYLOAD_WORDS),
                name,
            },
        );
    }
}

// ── Tracing ────────────────────────────────────────────────────────

/// Visit every [`Cell`] field of a heap object that may be a heap reference.
///
/// # Safety
///
/// `obj` must point to the header of a valid, live heap object.
pub unsafe fn trace_object(obj: *mut u8, visitor: &mut dyn FnMut(&mut Cell)) {
    let header = unsafe { *(obj as *const Header) };
    match header.kind() {
        ObjectKind::Tuple => {
            let tuple = unsafe { &mut *(obj as *mut Tuple) };
            tuple.elements_mut().iter_mut().for_each(visitor);
        }
        ObjectKind::Type => {
            let ty = unsafe { &mut *(obj as *mut Type) };
            visitor(&mut ty.name);
        }
        // no reference fields
        ObjectKind::LargeInt | ObjectKind::Bytes => {}
    }
}
