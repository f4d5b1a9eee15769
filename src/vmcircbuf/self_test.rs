//! Mirror verification for freshly chosen backends

use std::panic::{self, AssertUnwindSafe};

use tracing::debug;

use super::{AllocError, AllocResult, VmCircBufBackend, VmRegion};

/// Largest region tried, in granules
const MAX_GRANULES: usize = 64;

fn pattern(index: usize, seed: u8) -> u8 {
    (index as u32).wrapping_mul(2_654_435_761).rotate_right(13) as u8 ^ seed
}

/// Write through one half, read back through the other.
fn check_halves(region: &VmRegion, write_upper: bool, seed: u8) -> Result<(), String> {
    let n = region.len();
    let base = region.as_ptr();
    let (src, dst) = if write_upper { (n, 0) } else { (0, n) };

    for i in 0..n {
        // SAFETY: `src + i < 2n`, inside the mapping.
        unsafe { base.add(src + i).write_volatile(pattern(i, seed)) };
    }
    for i in 0..n {
        // SAFETY: `dst + i < 2n`, inside the mapping.
        let got = unsafe { base.add(dst + i).read_volatile() };
        let want = pattern(i, seed);
        if got != want {
            return Err(format!(
                "{} bytes: offset {} of the {} half reads {:#04x}, expected {:#04x}",
                n,
                i,
                if write_upper { "lower" } else { "upper" },
                got,
                want
            ));
        }
    }
    Ok(())
}

/// Exercise `backend` at 1, 2, 4, ... 64 granules.
///
/// Each size is written through the first half and checked through the second,
/// then the other way round. A failing OS call, a mismatch or a panic inside a
/// backend all report `SelfTestFailed`.
pub fn self_test(backend: &dyn VmCircBufBackend) -> AllocResult<()> {
    let granularity = backend.granularity();
    let failed = |reason: String| AllocError::SelfTestFailed {
        backend: backend.name().to_string(),
        reason,
    };

    let mut granules = 1;
    let mut seed = 0x5a_u8;
    while granules <= MAX_GRANULES {
        let size = granules * granularity;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), String> {
            let region = backend.make(size).map_err(|e| e.to_string())?;
            check_halves(&region, false, seed)?;
            check_halves(&region, true, seed.wrapping_add(1))
        }));

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(failed(reason)),
            Err(_) => return Err(failed(format!("panicked at {size} bytes"))),
        }

        granules *= 2;
        seed = seed.wrapping_add(0x31);
    }

    debug!(backend = backend.name(), granularity, "double mapping self-test passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;

    /// Hands out plain heap memory whose halves do not alias.
    #[derive(Debug)]
    struct Unmirrored;

    impl VmCircBufBackend for Unmirrored {
        fn name(&self) -> &'static str {
            "unmirrored"
        }

        fn granularity(&self) -> usize {
            64
        }

        fn make(&self, size: usize) -> AllocResult<VmRegion> {
            let mut mem = vec![0u8; 2 * size].into_boxed_slice();
            let base = NonNull::new(mem.as_mut_ptr())
                .ok_or_else(|| AllocError::AllocationFailed("null".into()))?;
            Ok(VmRegion::new(base, size, "unmirrored", move |_, _| drop(mem)))
        }
    }

    #[derive(Debug)]
    struct Panicking;

    impl VmCircBufBackend for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn granularity(&self) -> usize {
            64
        }

        fn make(&self, _size: usize) -> AllocResult<VmRegion> {
            panic!("backend blew up");
        }
    }

    #[test]
    fn test_unmirrored_backend_fails() {
        let err = self_test(&Unmirrored).unwrap_err();
        assert!(matches!(err, AllocError::SelfTestFailed { ref backend, .. } if backend == "unmirrored"));
    }

    #[test]
    fn test_panicking_backend_is_contained() {
        let err = self_test(&Panicking).unwrap_err();
        match err {
            AllocError::SelfTestFailed { reason, .. } => assert!(reason.contains("panicked")),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
