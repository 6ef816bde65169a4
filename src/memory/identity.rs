//! Thread / CPU identity used for magazine selection.
//!
//! Thread ids come from a process-wide counter and are cached in a
//! thread-local, so the fast path never enters the kernel.

use super::config::MagazineSelect;
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

// Plain std atomic: the id only has to be unique, loom has nothing to explore.
static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Small, dense, stable id of the calling thread.
#[inline]
#[must_use]
pub fn current_thread_id() -> usize {
    THREAD_ID
        .try_with(|slot| {
            if let Some(id) = slot.get() {
                return id;
            }
            let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
            slot.set(Some(id));
            id
        })
        // TLS already torn down (allocation from a thread-local destructor).
        .unwrap_or(0)
}

/// CPU the calling thread is running on, if the platform reports it.
#[inline]
#[must_use]
pub fn current_cpu() -> Option<usize> {
    #[cfg(all(target_os = "linux", not(any(loom, miri))))]
    {
        // Safety: FFI call to sched_getcpu, no arguments.
        let cpu = unsafe { libc::sched_getcpu() };
        usize::try_from(cpu).ok()
    }
    #[cfg(not(all(target_os = "linux", not(any(loom, miri)))))]
    {
        None
    }
}

/// Identity for the given selection policy.
#[inline]
#[must_use]
pub fn current_id(select: MagazineSelect) -> usize {
    match select {
        MagazineSelect::PerThread => current_thread_id(),
        MagazineSelect::PerCpu => current_cpu().unwrap_or_else(current_thread_id),
    }
}

/// Magazine index for `id`. Pure function of its inputs.
#[inline]
#[must_use]
pub fn magazine_index(id: usize, shift: u32, count: usize) -> usize {
    debug_assert!(count > 0);
    (id >> shift) % count
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_is_stable() {
        let a = current_thread_id();
        let b = current_thread_id();
        assert_eq!(a, b);
    }

    #[test]
    fn test_thread_ids_differ_across_threads() {
        let here = current_thread_id();
        let there = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_magazine_index_shift_groups_neighbours() {
        assert_eq!(magazine_index(4, 1, 8), magazine_index(5, 1, 8));
        assert_ne!(magazine_index(4, 1, 8), magazine_index(6, 1, 8));
        assert_eq!(magazine_index(17, 0, 4), 1);
    }

    #[test]
    fn test_per_cpu_falls_back_to_something_in_range() {
        let idx = magazine_index(current_id(MagazineSelect::PerCpu), 0, 4);
        assert!(idx < 4);
    }
}
