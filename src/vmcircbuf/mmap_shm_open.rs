//! Double mapping through a POSIX shared memory object

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::posix::{map_mirrored_fd, page_size};
use super::{AllocError, AllocResult, VmCircBufBackend, VmRegion, check_size};

static SEGMENT_COUNTER: AtomicUsize = AtomicUsize::new(0);

const MAX_NAME_ATTEMPTS: usize = 16;

/// Creates a uniquely named shm object, unlinks it straight away and maps it
/// twice. Nothing touches the filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapShmOpen;

impl MmapShmOpen {
    fn open_unlinked() -> AllocResult<OwnedFd> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let seq = SEGMENT_COUNTER.fetch_add(1, Ordering::Relaxed);
            let name = format!("/sigflow-{}-{}", std::process::id(), seq);
            let cname = CString::new(name)
                .map_err(|e| AllocError::AllocationFailed(format!("shm name: {e}")))?;

            // SAFETY: `cname` is a valid NUL terminated string.
            let fd = unsafe {
                libc::shm_open(
                    cname.as_ptr(),
                    libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                    0o600 as libc::c_uint,
                )
            };
            if fd < 0 {
                if std::io::Error::last_os_error().raw_os_error() == Some(libc::EEXIST) {
                    continue;
                }
                return Err(AllocError::last_os_error("shm_open"));
            }

            // SAFETY: `fd` was just returned by shm_open and is owned by nobody else.
            let owned = unsafe { OwnedFd::from_raw_fd(fd) };
            // SAFETY: unlinking the name we created; the descriptor stays valid.
            unsafe { libc::shm_unlink(cname.as_ptr()) };
            return Ok(owned);
        }
        Err(AllocError::AllocationFailed(
            "shm_open: could not find an unused segment name".to_string(),
        ))
    }
}

impl VmCircBufBackend for MmapShmOpen {
    fn name(&self) -> &'static str {
        "mmap_shm_open"
    }

    fn granularity(&self) -> usize {
        page_size()
    }

    fn make(&self, size: usize) -> AllocResult<VmRegion> {
        check_size(size, self.granularity())?;

        let fd = Self::open_unlinked()?;
        // SAFETY: resizing a descriptor we own.
        if unsafe { libc::ftruncate(fd.as_raw_fd(), (2 * size) as libc::off_t) } != 0 {
            return Err(AllocError::last_os_error("ftruncate"));
        }

        map_mirrored_fd(fd.as_raw_fd(), size, self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmcircbuf::self_test;

    #[test]
    fn test_shm_open_mirror() {
        // Some sandboxes mount no /dev/shm; only a produced region must mirror.
        let backend = MmapShmOpen;
        match backend.make(backend.granularity()) {
            Ok(_) => self_test(&backend).unwrap(),
            Err(e) => eprintln!("shm_open unavailable here: {e}"),
        }
    }
}
