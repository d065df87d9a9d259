//! Backing memory for semispaces.
//!
//! A [`Region`] is a zeroed, page aligned block owned for the lifetime of a
//! space. On unix it comes straight from an anonymous private mapping,
//! elsewhere from the global allocator.

use core::ptr::NonNull;

pub const OS_PAGE_SIZE: usize = 4096;

#[cfg(unix)]
mod os {
    use core::ffi::c_void;

    const PROT_READ: i32 = 0x1;
    const PROT_WRITE: i32 = 0x2;
    const MAP_PRIVATE: i32 = 0x02;
    #[cfg(target_os = "linux")]
    const MAP_ANON: i32 = 0x20;
    #[cfg(not(target_os = "linux"))]
    const MAP_ANON: i32 = 0x1000;
    const MAP_FAILED: isize = -1;

    unsafe extern "C" {
        fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;
        fn munmap(addr: *mut c_void, length: usize) -> i32;
    }

    pub fn reserve(len: usize) -> *mut u8 {
        // SAFETY: a fresh anonymous mapping aliases nothing
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if p as isize == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p.cast()
        }
    }

    /// # Safety
    /// `ptr` and `len` must describe a mapping returned by [`reserve`].
    pub unsafe fn release(ptr: *mut u8, len: usize) {
        let rc = unsafe { munmap(ptr.cast(), len) };
        if rc != 0 {
            log::error!("munmap of {len} bytes at {ptr:p} failed");
        }
    }
}

#[cfg(not(unix))]
mod os {
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    use super::OS_PAGE_SIZE;

    pub fn reserve(len: usize) -> *mut u8 {
        match Layout::from_size_align(len, OS_PAGE_SIZE) {
            // SAFETY: len is non-zero, HeapSettings::validate checks it
            Ok(layout) => unsafe { alloc_zeroed(layout) },
            Err(_) => core::ptr::null_mut(),
        }
    }

    /// # Safety
    /// `ptr` and `len` must describe a block returned by [`reserve`].
    pub unsafe fn release(ptr: *mut u8, len: usize) {
        if let Ok(layout) = Layout::from_size_align(len, OS_PAGE_SIZE) {
            unsafe { dealloc(ptr, layout) };
        }
    }
}

/// Zeroed memory returned to the system on drop.
#[derive(Debug)]
pub struct Region {
    start: NonNull<u8>,
    len: usize,
}

impl Region {
    /// `None` when the system refuses the request.
    #[must_use]
    pub fn zeroed(len: usize) -> Option<Self> {
        let start = NonNull::new(os::reserve(len))?;
        Some(Self { start, len })
    }

    #[inline(always)]
    pub fn start(&self) -> NonNull<u8> {
        self.start
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Zero the first `used` bytes again.
    pub fn clear(&mut self, used: usize) {
        debug_assert!(used <= self.len);
        // SAFETY: [start, start + used) lies inside the region we own
        unsafe { self.start.as_ptr().write_bytes(0, used.min(self.len)) };
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: start and len came from os::reserve
        unsafe { os::release(self.start.as_ptr(), self.len) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_zeroed_and_page_aligned() {
        let mut region = Region::zeroed(2 * OS_PAGE_SIZE).unwrap();
        assert_eq!(region.len(), 2 * OS_PAGE_SIZE);
        assert_eq!(region.start().as_ptr() as usize % OS_PAGE_SIZE, 0);

        let ptr = region.start().as_ptr();
        // SAFETY: within the region
        unsafe {
            assert!((0..region.len()).all(|i| *ptr.add(i) == 0));
            ptr.add(10).write(0xAB);
        }
        region.clear(64);
        assert_eq!(unsafe { *ptr.add(10) }, 0);
    }
}
