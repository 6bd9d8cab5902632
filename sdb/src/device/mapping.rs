//! RAII wrapper around a shared `mmap` region.
//!
//! ```text
//! Unsafe POSIX operations:    Safe Rust wrappers:
//! ┌──────────────────┐        ┌─────────────────────────┐
//! │ mmap(fd, ...)    │───────>│ Mapping::of_device()    │
//! │ mmap(ANONYMOUS)  │───────>│ Mapping::anonymous()    │
//! │ munmap()         │───────>│ Drop::drop()            │
//! └──────────────────┘        └─────────────────────────┘
//! ```
//!
//! A `Mapping` is never handed out as a long-lived slice. The pool borrows
//! it for the duration of a single callback, which keeps the kernel-shared
//! memory out of application data structures.

use std::os::fd::AsFd;
use std::ptr::{NonNull, null_mut};

use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags, mmap, mmap_anonymous, munmap};

use super::RegionMemory;
use crate::trace::warn;

/// A read/write `MAP_SHARED` mapping, unmapped on drop.
///
/// # Safety Invariants
///
/// - **Mapped**: `ptr` points to `len` bytes returned by `mmap()`
/// - **Stable**: the mapping is neither moved nor resized while `Mapping` lives
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain memory owned by this value; concurrent
// writers (the coprocessor) are coordinated by the notification protocol,
// not by the pointer's thread affinity.
unsafe impl Send for Mapping {}

// SAFETY: `Mapping` exposes only reads through `&self`.
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Maps `len` bytes of the device behind `fd` at offset 0.
    ///
    /// # Errors
    ///
    /// Returns the errno reported by `mmap`, or `EINVAL` for a zero length.
    pub fn of_device<Fd: AsFd>(fd: Fd, len: usize) -> Result<Self, Errno> {
        if len == 0 {
            return Err(Errno::INVAL);
        }

        // SAFETY: a fresh mapping chosen by the kernel (null hint) cannot
        // alias any existing Rust object. The device decides which physical
        // buffer backs it.
        let ptr = unsafe {
            mmap(
                null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )?
        };

        Self::from_raw(ptr, len)
    }

    /// Maps `len` zeroed bytes of anonymous shared memory.
    ///
    /// # Errors
    ///
    /// Returns the errno reported by `mmap`, or `EINVAL` for a zero length.
    pub fn anonymous(len: usize) -> Result<Self, Errno> {
        if len == 0 {
            return Err(Errno::INVAL);
        }

        // SAFETY: as above; anonymous memory is zero-filled by the kernel.
        let ptr = unsafe {
            mmap_anonymous(
                null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
            )?
        };

        Self::from_raw(ptr, len)
    }

    fn from_raw(ptr: *mut std::ffi::c_void, len: usize) -> Result<Self, Errno> {
        // mmap never returns null on success, but don't trust it blindly
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(Errno::NOMEM)?;
        Ok(Self { ptr, len })
    }

    /// Copies `bytes` into the start of the mapping.
    ///
    /// Returns how many bytes were copied (truncated to the mapping length).
    ///
    /// # Safety
    ///
    /// No other thread may read the overlapping range while the copy runs.
    pub unsafe fn write_at_start(&self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.len);
        // SAFETY: n <= len, the range is mapped writable, the caller rules out
        // concurrent readers, and `bytes` cannot overlap a mapping we own.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr(), n) };
        n
    }
}

// SAFETY: ptr/len come from a successful mmap and stay valid until Drop.
unsafe impl RegionMemory for Mapping {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: the region was mapped by us with this exact length and is
        // not referenced once the owner is gone.
        if let Err(_e) = unsafe { munmap(self.ptr.as_ptr().cast(), self.len) } {
            warn!(len = self.len, error = %_e, "munmap failed");
        }
    }
}
