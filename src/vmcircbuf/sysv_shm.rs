//! Double mapping through System V shared memory, fenced by guard pages
//!
//! Layout of the reserved span:
//!
//! ```text
//! | guard (ro) | copy 1 (N bytes) | copy 2 (N bytes) | guard (ro) |
//! ```
//!
//! The guard pages are attached read-only, so a stray write just outside the
//! ring faults instead of corrupting a neighbouring allocation.

use std::ptr::{self, NonNull};

use super::posix::page_size;
use super::{AllocError, AllocResult, VmCircBufBackend, VmRegion, check_size};

/// System V segments attached at fixed addresses inside a reserved span
#[derive(Debug, Default, Clone, Copy)]
pub struct SysvShm;

/// A segment id removed (IPC_RMID) on drop; attachments keep it alive.
struct Segment(libc::c_int);

impl Segment {
    fn create(size: usize, mode: libc::c_int) -> AllocResult<Self> {
        // SAFETY: shmget has no memory preconditions.
        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | mode) };
        if id < 0 {
            return Err(AllocError::last_os_error("shmget"));
        }
        Ok(Segment(id))
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: marking our own segment for removal.
        unsafe { libc::shmctl(self.0, libc::IPC_RMID, ptr::null_mut()) };
    }
}

/// Attachments that are detached on drop unless handed over to a region
struct Attachments(Vec<usize>);

impl Attachments {
    fn attach(&mut self, seg: &Segment, at: *mut u8, flags: libc::c_int) -> AllocResult<()> {
        // SAFETY: attaching a segment we created at an address inside a span we
        // reserved and released a moment ago; the result is checked below.
        let addr = unsafe { libc::shmat(seg.0, at.cast::<libc::c_void>(), flags) };
        if addr as isize == -1 {
            return Err(AllocError::last_os_error("shmat"));
        }
        self.0.push(addr as usize);
        if addr.cast::<u8>() != at {
            return Err(AllocError::AllocationFailed(
                "shmat attached away from the requested address".to_string(),
            ));
        }
        Ok(())
    }

    fn disarm(mut self) -> Vec<usize> {
        std::mem::take(&mut self.0)
    }
}

impl Drop for Attachments {
    fn drop(&mut self) {
        for &addr in &self.0 {
            // SAFETY: detaching addresses returned by shmat.
            unsafe { libc::shmdt(addr as *const libc::c_void) };
        }
    }
}

impl VmCircBufBackend for SysvShm {
    fn name(&self) -> &'static str {
        "sysv_shm"
    }

    fn granularity(&self) -> usize {
        page_size()
    }

    fn make(&self, size: usize) -> AllocResult<VmRegion> {
        check_size(size, self.granularity())?;
        let page = page_size();

        let guard = Segment::create(page, 0o400)?;
        let data = Segment::create(size, 0o600)?;

        // Reserve an address span big enough for both copies plus guards.
        let reserve = {
            let span = Segment::create(2 * size + 2 * page, 0o600)?;
            // SAFETY: attaching anywhere the kernel likes.
            let addr = unsafe { libc::shmat(span.0, ptr::null(), 0) };
            if addr as isize == -1 {
                return Err(AllocError::last_os_error("shmat (reserve)"));
            }
            // SAFETY: detaching the reservation we just made.
            unsafe { libc::shmdt(addr) };
            addr.cast::<u8>()
        };

        let mut attached = Attachments(Vec::with_capacity(4));
        // SAFETY (pointer arithmetic below): every offset stays within the
        // 2 * size + 2 * page span reserved above.
        unsafe {
            attached.attach(&guard, reserve, libc::SHM_RDONLY)?;
            attached.attach(&data, reserve.add(page), 0)?;
            attached.attach(&data, reserve.add(page + size), 0)?;
            attached.attach(&guard, reserve.add(page + 2 * size), libc::SHM_RDONLY)?;
        }

        // SAFETY: `reserve + page` is the first data attachment, never null.
        let base = unsafe { NonNull::new_unchecked(reserve.add(page)) };
        let addrs = attached.disarm();

        // `guard` and `data` drop here; IPC_RMID defers removal until detach.
        Ok(VmRegion::new(base, size, self.name(), move |_, _| {
            drop(Attachments(addrs));
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmcircbuf::self_test;

    #[test]
    fn test_sysv_mirror() {
        // Containers often cap SHMMAX very low; only a produced region must mirror.
        let backend = SysvShm;
        match backend.make(backend.granularity()) {
            Ok(region) => {
                assert_eq!(region.len(), backend.granularity());
                drop(region);
                self_test(&backend).unwrap();
            }
            Err(e) => eprintln!("sysv shm unavailable here: {e}"),
        }
    }
}
