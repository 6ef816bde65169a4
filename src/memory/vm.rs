use super::error::VmError;
use std::ptr::NonNull;

/// Virtual-memory primitives the allocator consumes.
///
/// Reservations come back inaccessible; [`commit`](VmProvider::commit) makes
/// a sub-range readable and writable. Freshly committed pages of a fresh
/// reservation read as zero. Nothing is promised about pages that went
/// through [`decommit_hint`](VmProvider::decommit_hint) and back.
pub trait VmProvider: Send + Sync {
    /// Reserve `size` bytes of address space aligned to `alignment`
    /// (0 or anything up to the page size means page alignment).
    fn reserve(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, VmError>;

    /// Back `[ptr, ptr + size)` with readable/writable pages.
    ///
    /// # Safety
    /// The range must lie inside a live reservation from this provider.
    unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Advise that the contents of `[ptr, ptr + size)` are dead. The range
    /// stays reserved and must be committed again before use.
    ///
    /// # Safety
    /// The range must lie inside a live reservation from this provider.
    unsafe fn decommit_hint(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Return a whole reservation to the system.
    ///
    /// # Safety
    /// `ptr`/`size` must be exactly a reservation returned by `reserve`, and
    /// no pointer into it may be used afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Minimum commit granularity.
    fn page_size(&self) -> usize;
}

/// Provider used by zones created without an explicit one.
#[must_use]
pub fn default_provider() -> std::sync::Arc<dyn VmProvider> {
    #[cfg(not(any(loom, miri)))]
    {
        std::sync::Arc::new(PlatformVm)
    }
    #[cfg(any(loom, miri))]
    {
        std::sync::Arc::new(HeapVm::new())
    }
}

fn check_request(size: usize, alignment: usize) -> Result<(), VmError> {
    if size == 0 || !(alignment == 0 || alignment.is_power_of_two()) {
        return Err(VmError::InvalidRequest { size, alignment });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Platform provider: mmap / mprotect / madvise / munmap
// ---------------------------------------------------------------------------

/// `mmap`-backed provider.
#[cfg(not(any(loom, miri)))]
#[derive(Clone, Copy, Debug, Default)]
pub struct PlatformVm;

#[cfg(not(any(loom, miri)))]
mod unix {
    use super::{NonNull, PlatformVm, VmError, VmProvider, check_request};
    use std::io;

    /// Map `size` bytes of inaccessible anonymous memory.
    fn map_none(size: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(VmError::ReservationFailed {
                size,
                source: io::Error::last_os_error(),
            });
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| VmError::ReservationFailed {
            size,
            source: io::Error::other("mmap returned null"),
        })
    }

    fn unmap(addr: usize, size: usize) -> Result<(), VmError> {
        if size == 0 {
            return Ok(());
        }
        // Safety: FFI call to munmap on a range we mapped.
        if unsafe { libc::munmap(addr as *mut libc::c_void, size) } != 0 {
            return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
        }
        Ok(())
    }

    impl VmProvider for PlatformVm {
        fn reserve(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, VmError> {
            check_request(size, alignment)?;
            let page = self.page_size();
            let size = size
                .checked_next_multiple_of(page)
                .ok_or(VmError::InvalidRequest { size, alignment })?;
            if alignment <= page {
                return map_none(size);
            }

            // Over-map by `alignment - page`, then trim the misaligned head
            // and the unused tail so only the aligned span stays mapped.
            let padded = size
                .checked_add(alignment - page)
                .ok_or(VmError::InvalidRequest { size, alignment })?;
            let raw = map_none(padded)?;
            let raw_addr = raw.as_ptr() as usize;
            let aligned = raw_addr.next_multiple_of(alignment);
            let head = aligned - raw_addr;
            let tail = padded - head - size;
            unmap(raw_addr, head)?;
            unmap(aligned + size, tail)?;
            // Safety: aligned lies inside the non-null mapping.
            Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
        }

        unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn decommit_hint(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // MADV_FREE marks pages for lazy reclamation. If the kernel does
            // not get around to it, old data persists until the next write.
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_FREE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, libc::PROT_NONE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            unmap(ptr.as_ptr() as usize, size.next_multiple_of(self.page_size()))
        }

        fn page_size(&self) -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed provider
//
// Under `cfg(loom)` we cannot issue real VM syscalls: loom runs inside a
// single OS process with its own scheduler. Every "reservation" is a zeroed
// heap allocation instead. `commit` / `decommit_hint` are no-ops: the memory
// is always accessible once reserved. Unit tests use it too when they need a
// provider they can wrap.
// ---------------------------------------------------------------------------

const HEAP_PAGE: usize = 4096;

/// Heap-backed provider for loom, Miri and tests.
#[derive(Debug, Default)]
pub struct HeapVm {
    // Plain std Mutex: bookkeeping of the mock, not a synchronisation point
    // the allocator relies on.
    layouts: std::sync::Mutex<std::collections::HashMap<usize, std::alloc::Layout>>,
}

impl HeapVm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl VmProvider for HeapVm {
    fn reserve(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, VmError> {
        check_request(size, alignment)?;
        let layout = std::alloc::Layout::from_size_align(
            size.next_multiple_of(HEAP_PAGE),
            alignment.max(HEAP_PAGE),
        )
        .map_err(|_| VmError::InvalidRequest { size, alignment })?;
        // Safety: layout has non-zero size.
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
            .ok_or_else(|| VmError::out_of_memory(size))?;
        self.layouts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(ptr.as_ptr() as usize, layout);
        Ok(ptr)
    }

    unsafe fn commit(&self, _ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn decommit_hint(&self, _ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn release(&self, ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        let layout = self
            .layouts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&(ptr.as_ptr() as usize))
            .ok_or_else(|| VmError::ReleaseFailed(std::io::Error::other("unknown reservation")))?;
        // Safety: ptr was allocated with this layout by `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size(&self) -> usize {
        HEAP_PAGE
    }
}

impl Drop for HeapVm {
    fn drop(&mut self) {
        let layouts = self
            .layouts
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for (addr, layout) in layouts.drain() {
            // Safety: every entry is a live allocation made by `reserve`.
            unsafe { std::alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}

/// Test providers that fail on demand.
#[cfg(test)]
pub(crate) mod testing {
    use super::{NonNull, VmError, VmProvider};
    use crate::sync::atomic::{AtomicUsize, Ordering};

    /// Wraps another provider; `reserve` starts failing once `budget`
    /// successful reservations have been handed out. While `rejecting`,
    /// every reservation is refused as an invalid request instead.
    pub(crate) struct FaultyVm {
        inner: std::sync::Arc<dyn VmProvider>,
        budget: AtomicUsize,
        rejecting: std::sync::atomic::AtomicBool,
        pub reserves: AtomicUsize,
        pub releases: AtomicUsize,
    }

    impl FaultyVm {
        pub(crate) fn new(inner: std::sync::Arc<dyn VmProvider>, budget: usize) -> Self {
            Self {
                inner,
                budget: AtomicUsize::new(budget),
                rejecting: std::sync::atomic::AtomicBool::new(false),
                reserves: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
            }
        }

        pub(crate) fn set_budget(&self, budget: usize) {
            self.budget.store(budget, Ordering::SeqCst);
        }

        pub(crate) fn set_rejecting(&self, rejecting: bool) {
            self.rejecting.store(rejecting, Ordering::SeqCst);
        }
    }

    impl VmProvider for FaultyVm {
        fn reserve(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, VmError> {
            if self.rejecting.load(Ordering::SeqCst) {
                return Err(VmError::InvalidRequest { size, alignment });
            }
            let granted = self
                .budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
                .is_ok();
            if !granted {
                return Err(VmError::out_of_memory(size));
            }
            self.reserves.fetch_add(1, Ordering::SeqCst);
            self.inner.reserve(size, alignment)
        }

        unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: forwarded contract.
            unsafe { self.inner.commit(ptr, size) }
        }

        unsafe fn decommit_hint(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: forwarded contract.
            unsafe { self.inner.decommit_hint(ptr, size) }
        }

        unsafe fn release(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            // Safety: forwarded contract.
            unsafe { self.inner.release(ptr, size) }
        }

        fn page_size(&self) -> usize {
            self.inner.page_size()
        }
    }

    /// Wraps another provider; once armed, the next `release` parks until
    /// the test has seen it enter and opened the gate.
    pub(crate) struct GatedVm {
        inner: std::sync::Arc<dyn VmProvider>,
        armed: std::sync::atomic::AtomicBool,
        gate: std::sync::Barrier,
    }

    impl GatedVm {
        pub(crate) fn new(inner: std::sync::Arc<dyn VmProvider>) -> Self {
            Self {
                inner,
                armed: std::sync::atomic::AtomicBool::new(false),
                gate: std::sync::Barrier::new(2),
            }
        }

        pub(crate) fn arm(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }

        /// Returns once the armed `release` is in progress.
        pub(crate) fn wait_entered(&self) {
            self.gate.wait();
        }

        /// Let the parked `release` finish.
        pub(crate) fn open(&self) {
            self.gate.wait();
        }
    }

    impl VmProvider for GatedVm {
        fn reserve(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, VmError> {
            self.inner.reserve(size, alignment)
        }

        unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: forwarded contract.
            unsafe { self.inner.commit(ptr, size) }
        }

        unsafe fn decommit_hint(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: forwarded contract.
            unsafe { self.inner.decommit_hint(ptr, size) }
        }

        unsafe fn release(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.gate.wait();
                self.gate.wait();
            }
            // Safety: forwarded contract.
            unsafe { self.inner.release(ptr, size) }
        }

        fn page_size(&self) -> usize {
            self.inner.page_size()
        }
    }
}
