//! Zone registry and the default-zone indirection.
//!
//! The zone list is a copy-on-write snapshot: readers clone an `Arc` under a
//! read lock held for a pointer copy, writers build a new list and swap it
//! in. The default zone is named by id in a single atomic, so swapping it is
//! one store that no reader can see half-done.

use super::config::ZoneConfig;
use super::error::{ConfigError, Corruption, MallocError, RegistryError, fatal};
use super::vm::default_provider;
use super::zone::{MallocOptions, Zone, ZoneObserver};
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::{Arc, OnceLock, RwLock};
use std::ptr::NonNull;

pub const DEFAULT_ZONE_NAME: &str = "DefaultMallocZone";

/// Default-zone lookups that lose a race with `set_default_zone` retry this
/// many times before giving up.
const DEFAULT_LOOKUP_RETRIES: usize = 4;

type ZoneList = Arc<Vec<Arc<Zone>>>;

pub struct ZoneRegistry {
    zones: RwLock<ZoneList>,
    /// Id of "zone 0".
    default_id: AtomicU64,
}

static GLOBAL: OnceLock<ZoneRegistry> = OnceLock::new();

impl ZoneRegistry {
    /// Registry whose default zone is `default`.
    pub fn new(default: Zone) -> Self {
        let id = default.id();
        log::debug!("[magzone] registry created, default zone {id}");
        Self {
            zones: RwLock::new(Arc::new(vec![Arc::new(default)])),
            default_id: AtomicU64::new(id),
        }
    }

    /// Registry with a fresh default zone built from `config`.
    pub fn with_config(config: ZoneConfig) -> Result<Self, ConfigError> {
        let zone = Zone::new(config)?;
        zone.set_name(Some(DEFAULT_ZONE_NAME));
        Ok(Self::new(zone))
    }

    /// The process-wide registry, created on first use with a default zone
    /// on the platform VM provider.
    pub fn global() -> &'static ZoneRegistry {
        GLOBAL.get_or_init(|| {
            let zone = Zone::build(ZoneConfig::default(), default_provider());
            zone.set_name(Some(DEFAULT_ZONE_NAME));
            Self::new(zone)
        })
    }

    fn snapshot(&self) -> ZoneList {
        self.zones
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Add a zone. Zones are listed in registration order.
    pub fn register_zone(&self, zone: Zone) -> Arc<Zone> {
        let zone = Arc::new(zone);
        self.register_shared(zone.clone());
        zone
    }

    fn register_shared(&self, zone: Arc<Zone>) {
        let mut guard = self
            .zones
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.iter().any(|z| z.id() == zone.id()) {
            return;
        }
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        log::debug!("[magzone] zone {} registered ({} zones)", zone.id(), next.len() + 1);
        next.push(zone);
        *guard = Arc::new(next);
    }

    pub fn create_zone(&self, config: ZoneConfig) -> Result<Arc<Zone>, ConfigError> {
        Ok(self.register_zone(Zone::new(config)?))
    }

    /// Register a wrapper around `inner` (registered too, if it is not yet).
    pub fn create_wrapper_zone(
        &self,
        inner: &Arc<Zone>,
        observer: Option<std::sync::Arc<dyn ZoneObserver>>,
    ) -> Arc<Zone> {
        self.register_shared(inner.clone());
        self.register_zone(Zone::wrap(inner.clone(), observer))
    }

    /// Unregister a zone. Its memory goes back to the VM provider once the
    /// last handle (including wrappers around it) is dropped.
    pub fn destroy_zone(&self, id: u64) -> Result<(), RegistryError> {
        let mut guard = self
            .zones
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if self.default_id.load(Ordering::Acquire) == id {
            return Err(RegistryError::DefaultZone(id));
        }
        if !guard.iter().any(|z| z.id() == id) {
            return Err(RegistryError::NotRegistered(id));
        }
        let next: Vec<_> = guard.iter().filter(|z| z.id() != id).cloned().collect();
        *guard = Arc::new(next);
        log::debug!("[magzone] zone {id} destroyed");
        Ok(())
    }

    /// Snapshot of every registered zone, default zone first unless it was
    /// swapped.
    #[must_use]
    pub fn all_zones(&self) -> ZoneList {
        self.snapshot()
    }

    /// `0` is the default zone; `n` is the n-th registered zone.
    #[must_use]
    pub fn zone_at(&self, n: usize) -> Option<Arc<Zone>> {
        match n {
            0 => self.default_zone().ok(),
            n => self.snapshot().get(n - 1).cloned(),
        }
    }

    pub fn default_zone(&self) -> Result<Arc<Zone>, RegistryError> {
        for _ in 0..DEFAULT_LOOKUP_RETRIES {
            let id = self.default_id.load(Ordering::Acquire);
            if let Some(zone) = self.snapshot().iter().find(|z| z.id() == id) {
                return Ok(zone.clone());
            }
        }
        Err(RegistryError::NoDefaultZone)
    }

    /// Make a registered zone the default.
    pub fn set_default_zone(&self, id: u64) -> Result<(), RegistryError> {
        let guard = self
            .zones
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !guard.iter().any(|z| z.id() == id) {
            return Err(RegistryError::NotRegistered(id));
        }
        let old = self.default_id.swap(id, Ordering::AcqRel);
        drop(guard);
        log::debug!("[magzone] default zone {old} -> {id}");
        Ok(())
    }

    /// First registered zone that owns `ptr`.
    #[must_use]
    pub fn zone_from_ptr(&self, ptr: NonNull<u8>) -> Option<Arc<Zone>> {
        self.snapshot().iter().find(|z| z.owns(ptr)).cloned()
    }

    fn default_or_fatal(&self) -> Arc<Zone> {
        match self.default_zone() {
            Ok(zone) => zone,
            Err(e) => {
                log::error!("[magzone] {e}");
                panic!("magzone: {e}");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Routed entry points
    // ---------------------------------------------------------------------

    pub fn malloc(&self, size: usize) -> Result<NonNull<u8>, MallocError> {
        self.default_or_fatal().malloc(size)
    }

    pub fn calloc(&self, count: usize, size: usize) -> Result<NonNull<u8>, MallocError> {
        self.default_or_fatal().calloc(count, size)
    }

    pub fn malloc_with_options(
        &self,
        alignment: usize,
        size: usize,
        options: MallocOptions,
    ) -> Result<NonNull<u8>, MallocError> {
        self.default_or_fatal()
            .malloc_with_options(alignment, size, options)
    }

    pub fn posix_memalign(&self, alignment: usize, size: usize) -> Result<NonNull<u8>, MallocError> {
        self.default_or_fatal().posix_memalign(alignment, size)
    }

    /// Free through the owning zone. A pointer no zone owns goes to the
    /// default zone, which reports it as a double free or a foreign pointer.
    ///
    /// # Safety
    /// `ptr` must not be used after this call.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let zone = match self.zone_from_ptr(ptr) {
            Some(zone) => zone,
            None => self.default_or_fatal(),
        };
        // Safety: forwarded contract.
        unsafe { zone.free(ptr) };
    }

    /// # Safety
    /// As [`Zone::realloc`].
    pub unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<NonNull<u8>, MallocError> {
        let Some(ptr) = ptr else {
            return self.malloc(new_size);
        };
        let Some(zone) = self.zone_from_ptr(ptr) else {
            fatal(
                "<registry>",
                &Corruption::UnknownPointer {
                    addr: ptr.as_ptr() as usize,
                },
            );
        };
        // Safety: forwarded contract.
        unsafe { zone.realloc(Some(ptr), new_size) }
    }

    /// `malloc_size`: usable size, 0 if no zone owns `ptr`.
    #[must_use]
    pub fn size(&self, ptr: NonNull<u8>) -> usize {
        self.snapshot()
            .iter()
            .map(|z| z.size(ptr))
            .find(|&size| size != 0)
            .unwrap_or(0)
    }

    /// Relieve every zone. Returns bytes released.
    pub fn pressure_relief(&self, goal: usize) -> usize {
        let mut released = 0;
        for zone in self.snapshot().iter().filter(|z| !z.is_wrapper()) {
            released += zone.pressure_relief(goal.saturating_sub(released));
            if goal != 0 && released >= goal {
                break;
            }
        }
        released
    }
}

impl std::fmt::Debug for ZoneRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneRegistry")
            .field("zones", &self.snapshot().len())
            .field("default_id", &self.default_id.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn config() -> ZoneConfig {
        ZoneConfig {
            magazine_count: 2,
            ..ZoneConfig::default()
        }
    }

    fn registry() -> ZoneRegistry {
        ZoneRegistry::with_config(config()).unwrap()
    }

    #[test]
    fn test_default_zone_is_named_and_first() {
        let r = registry();
        let zone = r.default_zone().unwrap();
        assert_eq!(zone.name().as_deref(), Some(DEFAULT_ZONE_NAME));
        assert_eq!(r.all_zones()[0].id(), zone.id());
        assert_eq!(r.zone_at(0).map(|z| z.id()), Some(zone.id()));
        assert_eq!(r.zone_at(1).map(|z| z.id()), Some(zone.id()));
        assert!(r.zone_at(2).is_none());
    }

    #[test]
    fn test_register_and_destroy() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let r = registry();
        let z = r.create_zone(config()).unwrap();
        assert_eq!(r.all_zones().len(), 2);
        let p = z.malloc(64).unwrap();
        assert_eq!(r.zone_from_ptr(p).map(|z| z.id()), Some(z.id()));
        assert_eq!(r.size(p), 64);
        // Safety: Test code.
        unsafe { r.free(p) };
        assert_eq!(z.statistics().blocks_in_use, 0);

        r.destroy_zone(z.id()).unwrap();
        assert_eq!(r.all_zones().len(), 1);
        assert_eq!(
            r.destroy_zone(z.id()),
            Err(RegistryError::NotRegistered(z.id()))
        );
    }

    #[test]
    fn test_default_zone_cannot_be_destroyed() {
        let r = registry();
        let id = r.default_zone().unwrap().id();
        assert_eq!(r.destroy_zone(id), Err(RegistryError::DefaultZone(id)));
    }

    #[test]
    fn test_swap_default() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let r = registry();
        let old = r.default_zone().unwrap();
        let z = r.create_zone(config()).unwrap();
        r.set_default_zone(z.id()).unwrap();
        assert_eq!(r.default_zone().unwrap().id(), z.id());

        let p = r.malloc(32).unwrap();
        assert!(z.owns(p));
        assert!(!old.owns(p));
        // Safety: Test code.
        unsafe { r.free(p) };

        r.destroy_zone(old.id()).unwrap();
        assert_eq!(r.set_default_zone(old.id()), Err(RegistryError::NotRegistered(old.id())));
    }

    #[test]
    fn test_wrapper_registration_keeps_inner() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let r = registry();
        let inner = Arc::new(Zone::new(config()).unwrap());
        let wrapper = r.create_wrapper_zone(&inner, None);
        assert_eq!(r.all_zones().len(), 3);
        let p = wrapper.malloc(100).unwrap();
        assert_eq!(r.zone_from_ptr(p).map(|z| z.id()), Some(inner.id()));
        // Safety: Test code.
        unsafe { wrapper.free(p) };
    }

    #[test]
    fn test_realloc_routes_to_owner() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let r = registry();
        let z = r.create_zone(config()).unwrap();
        let p = z.malloc(16).unwrap();
        // Safety: Test code.
        unsafe {
            let q = r.realloc(Some(p), 4000).unwrap();
            assert!(z.owns(q));
            r.free(q);
            let fresh = r.realloc(None, 10).unwrap();
            assert!(r.default_zone().unwrap().owns(fresh));
            r.free(fresh);
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_unowned_free_goes_to_default_zone() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let r = registry();
        let p = r.malloc(48).unwrap();
        // Safety: Test code, deliberately invalid.
        unsafe {
            r.free(p);
            r.free(p);
        }
    }

    #[test]
    fn test_global_is_shared() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let a = ZoneRegistry::global();
        let b = ZoneRegistry::global();
        assert!(std::ptr::eq(a, b));
        let p = a.malloc(8).unwrap();
        assert!(b.size(p) >= 8);
        // Safety: Test code.
        unsafe { b.free(p) };
    }
}
