//! Double-mapped virtual memory regions
//!
//! A region of `2 * N` bytes whose two halves are backed by the same physical
//! pages. Writing byte `i` of the first half makes it visible at `N + i` and the
//! other way round, so a ring of `N` bytes can always be handed out as one flat
//! slice starting anywhere in `[0, N)` and running up to `N` bytes long.
//!
//! Several OS mechanisms can build such a mapping. Each one is a
//! [`VmCircBufBackend`]; [`VmCircBufFactory`] tries them in priority order,
//! verifies the winner with [`self_test`] and remembers the choice in the
//! preference store.

mod error;
mod factory;
mod self_test;

#[cfg(unix)]
mod posix;

#[cfg(unix)]
mod mmap_tmpfile;
#[cfg(any(target_os = "linux", target_os = "macos"))]
mod mmap_shm_open;
#[cfg(any(target_os = "linux", target_os = "macos"))]
mod sysv_shm;
#[cfg(windows)]
mod createfilemapping;

use std::fmt;
use std::ptr::NonNull;

pub use error::{AllocError, AllocResult};
pub use factory::{PREFS_KEY, PREFS_SECTION, VmCircBufFactory, platform_backends};
pub use self_test::self_test;

#[cfg(unix)]
pub use mmap_tmpfile::MmapTmpfile;
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub use mmap_shm_open::MmapShmOpen;
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub use sysv_shm::SysvShm;
#[cfg(windows)]
pub use createfilemapping::CreateFileMapping;

/// One mechanism for building double-mapped regions
pub trait VmCircBufBackend: Send + Sync + fmt::Debug {
    /// Stable name, used as the persisted preference value
    fn name(&self) -> &'static str;

    /// Mapping unit in bytes; `make` only accepts multiples of it
    fn granularity(&self) -> usize;

    /// Create a region whose `size` bytes are mirrored at `base + size`
    fn make(&self, size: usize) -> AllocResult<VmRegion>;
}

type Release = Box<dyn FnOnce(NonNull<u8>, usize) + Send + Sync>;

/// An owned double-mapped region; both halves are unmapped on drop
pub struct VmRegion {
    base: NonNull<u8>,
    size: usize,
    backend: &'static str,
    release: Option<Release>,
}

// SAFETY: the region is plain memory owned by this value. Concurrent access to
// its contents is coordinated by the buffer that owns it.
unsafe impl Send for VmRegion {}
// SAFETY: see above; `&VmRegion` only exposes the base address and length.
unsafe impl Sync for VmRegion {}

impl VmRegion {
    /// Wrap a freshly mirrored mapping. `release` runs exactly once, on drop.
    pub(crate) fn new(
        base: NonNull<u8>,
        size: usize,
        backend: &'static str,
        release: impl FnOnce(NonNull<u8>, usize) + Send + Sync + 'static,
    ) -> Self {
        Self {
            base,
            size,
            backend,
            release: Some(Box::new(release)),
        }
    }

    /// Start of the first copy
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Length of one copy (`N`); the mapping spans `2 * N` bytes
    pub fn len(&self) -> usize {
        self.size
    }

    /// Always false: backends reject empty regions
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Name of the backend that produced this region
    pub fn backend(&self) -> &'static str {
        self.backend
    }
}

impl Drop for VmRegion {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.base, self.size);
        }
    }
}

impl fmt::Debug for VmRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VmRegion")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("backend", &self.backend)
            .finish()
    }
}

/// Reject sizes a backend cannot mirror
pub(crate) fn check_size(size: usize, granularity: usize) -> AllocResult<()> {
    if size == 0 || granularity == 0 || size % granularity != 0 {
        return Err(AllocError::InvalidSize { size, granularity });
    }
    Ok(())
}

/// Smallest item count whose byte size is a whole number of granules
pub fn minimum_buffer_items(item_size: usize, granularity: usize) -> usize {
    granularity / gcd(item_size, granularity)
}

pub(crate) fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

pub(crate) fn lcm(a: usize, b: usize) -> usize {
    if a == 0 || b == 0 {
        return 0;
    }
    a / gcd(a, b) * b
}

/// Platform page size (Unix) or allocation granularity (Windows)
pub fn system_granularity() -> usize {
    #[cfg(unix)]
    {
        posix::page_size()
    }
    #[cfg(windows)]
    {
        createfilemapping::allocation_granularity()
    }
    #[cfg(not(any(unix, windows)))]
    {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_buffer_items() {
        assert_eq!(minimum_buffer_items(4, 4096), 1024);
        assert_eq!(minimum_buffer_items(8, 4096), 512);
        // 3-byte items need a full 4096 items before the byte size lands on a page
        assert_eq!(minimum_buffer_items(3, 4096), 4096);
        assert_eq!(minimum_buffer_items(8192, 4096), 1);
    }

    #[test]
    fn test_check_size() {
        assert!(check_size(8192, 4096).is_ok());
        assert!(matches!(
            check_size(4097, 4096),
            Err(AllocError::InvalidSize { .. })
        ));
        assert!(check_size(0, 4096).is_err());
    }

    #[test]
    fn test_lcm_gcd() {
        assert_eq!(gcd(12, 18), 6);
        assert_eq!(lcm(4, 6), 12);
        assert_eq!(lcm(1, 7), 7);
    }

    #[test]
    fn test_release_runs_once_on_drop() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let mut backing = vec![0u8; 16];
        let base = NonNull::new(backing.as_mut_ptr()).unwrap();
        let region = VmRegion::new(base, 8, "test", move |_, size| {
            assert_eq!(size, 8);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(region.len(), 8);
        drop(region);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
