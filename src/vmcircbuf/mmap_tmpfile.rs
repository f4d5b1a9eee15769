//! Double mapping through an unlinked temporary file

use std::os::fd::AsRawFd;

use super::posix::{map_mirrored_fd, page_size};
use super::{AllocError, AllocResult, VmCircBufBackend, VmRegion, check_size};

/// Maps an anonymous temp file twice. Works anywhere `mmap` does, but the
/// pages may be written back to the temp directory under memory pressure.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapTmpfile;

impl VmCircBufBackend for MmapTmpfile {
    fn name(&self) -> &'static str {
        "mmap_tmpfile"
    }

    fn granularity(&self) -> usize {
        page_size()
    }

    fn make(&self, size: usize) -> AllocResult<VmRegion> {
        check_size(size, self.granularity())?;

        let file = tempfile::tempfile()
            .map_err(|e| AllocError::AllocationFailed(format!("tempfile: {e}")))?;
        file.set_len((2 * size) as u64)
            .map_err(|e| AllocError::AllocationFailed(format!("set_len: {e}")))?;

        // `file` closes on return; the mappings hold the pages.
        map_mirrored_fd(file.as_raw_fd(), size, self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmcircbuf::self_test;

    #[test]
    fn test_tmpfile_mirror() {
        let backend = MmapTmpfile;
        self_test(&backend).unwrap();
    }

    #[test]
    fn test_tmpfile_rejects_odd_size() {
        let backend = MmapTmpfile;
        assert!(matches!(
            backend.make(backend.granularity() + 1),
            Err(AllocError::InvalidSize { .. })
        ));
    }
}
