//! Backend selection and caching

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::{AllocError, AllocResult, VmCircBufBackend, VmRegion, self_test};
use crate::prefs::Preferences;

/// Preference section holding allocator settings
pub const PREFS_SECTION: &str = "vmcircbuf";
/// Preference key naming the backend that last passed its self-test
pub const PREFS_KEY: &str = "default_factory";

/// Every backend compiled for this platform, in probe order
pub fn platform_backends() -> Vec<Arc<dyn VmCircBufBackend>> {
    #[allow(unused_mut)]
    let mut backends: Vec<Arc<dyn VmCircBufBackend>> = Vec::new();
    #[cfg(unix)]
    backends.push(Arc::new(super::MmapTmpfile));
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        backends.push(Arc::new(super::MmapShmOpen));
        backends.push(Arc::new(super::SysvShm));
    }
    #[cfg(windows)]
    backends.push(Arc::new(super::CreateFileMapping));
    backends
}

/// Picks a working backend on first use and hands out regions from it.
///
/// Selection order: explicit override, then the persisted preference, then
/// every backend in probe order. Whatever is chosen must pass [`self_test`].
/// A probed winner is written back to the preference store so later runs skip
/// the probe.
pub struct VmCircBufFactory {
    backends: Vec<Arc<dyn VmCircBufBackend>>,
    override_name: Option<String>,
    prefs: Mutex<Preferences>,
    chosen: Mutex<Option<Arc<dyn VmCircBufBackend>>>,
}

impl VmCircBufFactory {
    pub fn new(prefs: Preferences) -> Self {
        Self::with_backends(platform_backends(), prefs)
    }

    pub fn with_backends(backends: Vec<Arc<dyn VmCircBufBackend>>, prefs: Preferences) -> Self {
        Self {
            backends,
            override_name: None,
            prefs: Mutex::new(prefs),
            chosen: Mutex::new(None),
        }
    }

    /// Force a backend by name; falls back to normal selection if it is unknown
    /// or fails its self-test.
    pub fn with_override(mut self, name: Option<String>) -> Self {
        self.override_name = name;
        self
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    fn find(&self, name: &str) -> Option<&Arc<dyn VmCircBufBackend>> {
        self.backends.iter().find(|b| b.name() == name)
    }

    fn try_named(&self, name: &str, origin: &str) -> Option<Arc<dyn VmCircBufBackend>> {
        let Some(backend) = self.find(name) else {
            warn!("{} names unknown vmcircbuf backend '{}'", origin, name);
            return None;
        };
        match self_test(backend.as_ref()) {
            Ok(()) => Some(Arc::clone(backend)),
            Err(e) => {
                warn!("{} backend '{}' rejected: {}", origin, name, e);
                None
            }
        }
    }

    fn select(&self) -> AllocResult<Arc<dyn VmCircBufBackend>> {
        if let Some(name) = &self.override_name {
            if let Some(backend) = self.try_named(name, "Configured") {
                return Ok(backend);
            }
        }

        let remembered = self
            .prefs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(PREFS_SECTION, PREFS_KEY)
            .map(str::to_string);
        if let Some(name) = remembered {
            if let Some(backend) = self.try_named(&name, "Preference") {
                return Ok(backend);
            }
        }

        for backend in &self.backends {
            match self_test(backend.as_ref()) {
                Ok(()) => {
                    self.remember(backend.name());
                    return Ok(Arc::clone(backend));
                }
                Err(e) => debug!("vmcircbuf backend '{}' failed: {}", backend.name(), e),
            }
        }
        Err(AllocError::NoWorkingBackend)
    }

    fn remember(&self, name: &str) {
        let mut prefs = self.prefs.lock().unwrap_or_else(|e| e.into_inner());
        prefs.set(PREFS_SECTION, PREFS_KEY, name);
        if let Err(e) = prefs.save() {
            warn!("Could not persist vmcircbuf backend choice: {}", e);
        }
    }

    /// The cached backend, selecting one on first call
    pub fn backend(&self) -> AllocResult<Arc<dyn VmCircBufBackend>> {
        let mut chosen = self.chosen.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(backend) = chosen.as_ref() {
            return Ok(Arc::clone(backend));
        }
        let backend = self.select()?;
        info!(
            "Using vmcircbuf backend '{}' (granularity {} bytes)",
            backend.name(),
            backend.granularity()
        );
        *chosen = Some(Arc::clone(&backend));
        Ok(backend)
    }

    pub fn granularity(&self) -> AllocResult<usize> {
        Ok(self.backend()?.granularity())
    }

    pub fn make(&self, size: usize) -> AllocResult<VmRegion> {
        self.backend()?.make(size)
    }
}

impl std::fmt::Debug for VmCircBufFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("VmCircBufFactory")
            .field("backends", &self.backend_names())
            .field("override", &self.override_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Heap memory with no aliasing: always fails the self-test
    #[derive(Debug)]
    struct Broken;

    impl VmCircBufBackend for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }
        fn granularity(&self) -> usize {
            64
        }
        fn make(&self, size: usize) -> AllocResult<VmRegion> {
            let mut mem = vec![0u8; 2 * size].into_boxed_slice();
            let base = NonNull::new(mem.as_mut_ptr())
                .ok_or_else(|| AllocError::AllocationFailed("null".into()))?;
            Ok(VmRegion::new(base, size, "broken", move |_, _| drop(mem)))
        }
    }

    #[derive(Debug, Default)]
    struct Refusing {
        calls: AtomicUsize,
    }

    impl VmCircBufBackend for Refusing {
        fn name(&self) -> &'static str {
            "refusing"
        }
        fn granularity(&self) -> usize {
            64
        }
        fn make(&self, _size: usize) -> AllocResult<VmRegion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AllocError::Unavailable("refusing".into()))
        }
    }

    #[test]
    fn test_no_working_backend() {
        let factory = VmCircBufFactory::with_backends(
            vec![Arc::new(Broken), Arc::new(Refusing::default())],
            Preferences::in_memory(),
        );
        assert_eq!(factory.backend().unwrap_err(), AllocError::NoWorkingBackend);
    }

    #[cfg(unix)]
    #[test]
    fn test_probe_skips_broken_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.toml");
        let factory = VmCircBufFactory::with_backends(
            vec![Arc::new(Broken), Arc::new(crate::vmcircbuf::MmapTmpfile)],
            Preferences::load(&path).unwrap(),
        );

        let backend = factory.backend().unwrap();
        assert_eq!(backend.name(), "mmap_tmpfile");

        let saved = Preferences::load(&path).unwrap();
        assert_eq!(saved.get(PREFS_SECTION, PREFS_KEY), Some("mmap_tmpfile"));
    }

    #[test]
    fn test_failed_selection_retries() {
        let refusing = Arc::new(Refusing::default());
        let factory = VmCircBufFactory::with_backends(
            vec![refusing.clone() as Arc<dyn VmCircBufBackend>],
            Preferences::in_memory(),
        );
        assert!(factory.backend().is_err());
        let after_first = refusing.calls.load(Ordering::SeqCst);
        assert!(factory.backend().is_err());
        assert_eq!(refusing.calls.load(Ordering::SeqCst), 2 * after_first);
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_preference_reprobes() {
        let mut prefs = Preferences::in_memory();
        prefs.set(PREFS_SECTION, PREFS_KEY, "broken");
        let factory = VmCircBufFactory::with_backends(
            vec![Arc::new(Broken), Arc::new(crate::vmcircbuf::MmapTmpfile)],
            prefs,
        );
        assert_eq!(factory.backend().unwrap().name(), "mmap_tmpfile");
    }

    #[cfg(unix)]
    #[test]
    fn test_override_wins() {
        let factory = VmCircBufFactory::new(Preferences::in_memory())
            .with_override(Some("mmap_tmpfile".to_string()));
        let region = factory.make(factory.granularity().unwrap()).unwrap();
        assert_eq!(region.backend(), "mmap_tmpfile");
    }
}
