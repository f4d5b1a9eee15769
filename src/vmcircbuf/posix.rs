//! Shared helpers for the mmap based backends

use std::os::fd::RawFd;
use std::ptr::{self, NonNull};

use super::{AllocError, AllocResult, VmRegion};

pub(super) fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

/// Map the first `size` bytes of `fd` twice, back to back.
///
/// The file must already be at least `2 * size` bytes long. The descriptor may
/// be closed as soon as this returns; the mappings keep the pages alive.
pub(super) fn map_mirrored_fd(
    fd: RawFd,
    size: usize,
    backend: &'static str,
) -> AllocResult<VmRegion> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;

    // SAFETY: a fresh shared mapping of a descriptor we own; the result is
    // checked against MAP_FAILED before use.
    let first = unsafe { libc::mmap(ptr::null_mut(), 2 * size, prot, libc::MAP_SHARED, fd, 0) };
    if first == libc::MAP_FAILED {
        return Err(AllocError::last_os_error("mmap (first copy)"));
    }

    // SAFETY: `first` spans 2 * size bytes, so first + size is inside it.
    let hole = unsafe { first.cast::<u8>().add(size) }.cast::<libc::c_void>();

    // SAFETY: unmapping the upper half of a mapping we just created.
    if unsafe { libc::munmap(hole, size) } != 0 {
        let err = AllocError::last_os_error("munmap (second half)");
        // SAFETY: releasing our own mapping.
        unsafe { libc::munmap(first, 2 * size) };
        return Err(err);
    }

    // Ask for the hole without MAP_FIXED so a racing mapping is never clobbered.
    // SAFETY: a shared mapping of the same descriptor at offset 0.
    let second = unsafe { libc::mmap(hole, size, prot, libc::MAP_SHARED, fd, 0) };
    if second == libc::MAP_FAILED {
        let err = AllocError::last_os_error("mmap (second copy)");
        // SAFETY: releasing the first copy only; the hole is already unmapped.
        unsafe { libc::munmap(first, size) };
        return Err(err);
    }
    if second != hole {
        // SAFETY: both are mappings we own.
        unsafe {
            libc::munmap(second, size);
            libc::munmap(first, size);
        }
        return Err(AllocError::AllocationFailed(
            "kernel placed the second copy away from the first".to_string(),
        ));
    }

    let base = NonNull::new(first.cast::<u8>())
        .ok_or_else(|| AllocError::AllocationFailed("mmap returned null".to_string()))?;

    Ok(VmRegion::new(base, size, backend, |base, size| {
        // SAFETY: both copies are contiguous, so one call releases the whole span.
        unsafe { libc::munmap(base.as_ptr().cast(), 2 * size) };
    }))
}
