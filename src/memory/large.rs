use super::config::{ReclaimPolicy, ZoneConfig};
use super::error::{Corruption, VmError};
use super::stats;
use super::vm::VmProvider;
use crate::sync::{Mutex, lock};
use std::collections::{BTreeMap, VecDeque};
use std::ptr::NonNull;

/// A reused mapping may be at most this many times the request.
const MAX_REUSE_SLACK: usize = 2;

/// Under `ReclaimPolicy::Deferred` the death-row may overshoot its bounds by
/// this factor before `free` evicts inline.
const DEFERRED_OVERSHOOT: usize = 2;

/// One VM mapping backing one large allocation.
pub(crate) struct Mapping {
    base: NonNull<u8>,
    /// Usable bytes.
    size: usize,
    /// Reserved bytes (usable + guard page).
    reserved: usize,
    /// Whether the usable range is currently committed.
    committed: bool,
}

// Safety: Mapping is a plain description of a VM range it owns.
unsafe impl Send for Mapping {}

impl Mapping {
    #[inline]
    fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    fn recommit(&mut self, vm: &dyn VmProvider) -> Result<(), VmError> {
        // Safety: the usable range of a mapping we own.
        unsafe { vm.commit(self.base, self.size) }?;
        self.committed = true;
        stats::TOTAL_COMMITTED.add(self.size);
        stats::LARGE_COMMITTED.add(self.size);
        Ok(())
    }

    fn decommit(&mut self, vm: &dyn VmProvider) -> Result<(), VmError> {
        // Safety: the usable range of a mapping we own.
        unsafe { vm.decommit_hint(self.base, self.size) }?;
        self.committed = false;
        stats::TOTAL_COMMITTED.sub(self.size);
        stats::LARGE_COMMITTED.sub(self.size);
        Ok(())
    }

    /// Hand the reservation back. Returns the reserved bytes released.
    fn release(self, vm: &dyn VmProvider) -> usize {
        // Safety: base/reserved is exactly the reservation made in map_fresh.
        if let Err(e) = unsafe { vm.release(self.base, self.reserved) } {
            log::warn!("[magzone] large release of {:#x} failed: {e}", self.addr());
            return 0;
        }
        stats::TOTAL_RESERVED.sub(self.reserved);
        if self.committed {
            stats::TOTAL_COMMITTED.sub(self.size);
            stats::LARGE_COMMITTED.sub(self.size);
        }
        self.reserved
    }
}

#[derive(Clone, Copy, Debug)]
struct LargePolicy {
    cache: bool,
    max_entries: usize,
    max_bytes: usize,
    reclaim: ReclaimPolicy,
}

/// Bookkeeping guarded by the large lock. Nothing in here talks to the VM
/// provider.
#[derive(Default)]
struct LargeState {
    /// Live allocations by address. Ordered for resumable enumeration.
    live: BTreeMap<usize, Mapping>,
    /// Oldest first.
    death_row: VecDeque<Mapping>,
    death_row_bytes: usize,
}

impl LargeState {
    /// Best-fit parked mapping within [`MAX_REUSE_SLACK`] of `size`.
    fn take_parked(&mut self, size: usize, alignment: usize) -> Option<Mapping> {
        let ceiling = size.saturating_mul(MAX_REUSE_SLACK);
        let best = self
            .death_row
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                m.size >= size && m.size <= ceiling && m.addr().is_multiple_of(alignment.max(1))
            })
            .min_by_key(|(_, m)| m.size)
            .map(|(i, _)| i)?;
        let mapping = self.death_row.remove(best)?;
        self.death_row_bytes -= mapping.size;
        stats::DEATH_ROW_BYTES.sub(mapping.size);
        Some(mapping)
    }

    fn take_live(&mut self, ptr: NonNull<u8>) -> Result<Mapping, Corruption> {
        let addr = ptr.as_ptr() as usize;
        self.live.remove(&addr).ok_or_else(|| {
            if self.death_row.iter().any(|m| m.addr() == addr) {
                Corruption::DoubleFree { addr, block: 0 }
            } else {
                Corruption::UnknownPointer { addr }
            }
        })
    }

    fn park(&mut self, mapping: Mapping) {
        stats::DEATH_ROW_BYTES.add(mapping.size);
        self.death_row_bytes += mapping.size;
        self.death_row.push_back(mapping);
    }

    fn pop_oldest(&mut self) -> Option<Mapping> {
        let mapping = self.death_row.pop_front()?;
        self.death_row_bytes -= mapping.size;
        stats::DEATH_ROW_BYTES.sub(mapping.size);
        Some(mapping)
    }

    /// Oldest entries past either bound.
    fn evict(&mut self, max_entries: usize, max_bytes: usize) -> Vec<Mapping> {
        let mut evicted = Vec::new();
        while self.death_row.len() > max_entries || self.death_row_bytes > max_bytes {
            let Some(mapping) = self.pop_oldest() else {
                break;
            };
            evicted.push(mapping);
        }
        evicted
    }
}

/// Oversized allocations: one mapping each, plus a FIFO death-row of freed
/// mappings kept reserved (and decommitted) for reuse.
///
/// Reuse is best-fit within [`MAX_REUSE_SLACK`]. A mapping that comes back
/// from the death-row is recommitted and its contents are unspecified.
///
/// The lock only covers the live map and the death-row. Mappings move in and
/// out of them under the lock; commit, decommit and release happen after the
/// guard is gone, so one thread's `munmap` never stalls another's large
/// allocation.
pub(crate) struct LargeAllocator {
    vm: std::sync::Arc<dyn VmProvider>,
    state: Mutex<LargeState>,
    policy: LargePolicy,
}

impl LargeAllocator {
    pub fn new(vm: std::sync::Arc<dyn VmProvider>, config: &ZoneConfig) -> Self {
        Self {
            vm,
            state: Mutex::new(LargeState::default()),
            policy: LargePolicy {
                cache: config.large_cache,
                max_entries: config.large_cache_max_entries,
                max_bytes: config.large_cache_max_bytes,
                reclaim: config.reclaim,
            },
        }
    }

    /// Map a fresh allocation, not yet live.
    ///
    /// Fresh pages read as zero. With `guard`, one inaccessible page follows
    /// the usable range.
    pub fn map_fresh(&self, size: usize, alignment: usize, guard: bool) -> Result<Mapping, VmError> {
        let vm = &*self.vm;
        let page = vm.page_size();
        let size = size
            .checked_next_multiple_of(page)
            .ok_or(VmError::InvalidRequest { size, alignment })?;
        let reserved = if guard {
            size.checked_add(page)
                .ok_or(VmError::InvalidRequest { size, alignment })?
        } else {
            size
        };
        let base = vm.reserve(reserved, alignment)?;
        // Safety: base/size lies inside the reservation just made.
        if let Err(e) = unsafe { vm.commit(base, size) } {
            // Safety: releasing the reservation made above.
            drop(unsafe { vm.release(base, reserved) });
            return Err(e);
        }
        stats::TOTAL_RESERVED.add(reserved);
        stats::TOTAL_COMMITTED.add(size);
        stats::LARGE_COMMITTED.add(size);
        Ok(Mapping {
            base,
            size,
            reserved,
            committed: true,
        })
    }

    /// Record a committed mapping as live.
    pub fn adopt(&self, mapping: Mapping) -> NonNull<u8> {
        let base = mapping.base;
        lock(&self.state).live.insert(mapping.addr(), mapping);
        base
    }

    /// Best-fit reuse from the death-row. `Ok(None)` when nothing fits.
    pub fn reuse(
        &self,
        size: usize,
        alignment: usize,
    ) -> Result<Option<(NonNull<u8>, usize)>, VmError> {
        if !self.policy.cache {
            return Ok(None);
        }
        let Some(mut mapping) = lock(&self.state).take_parked(size, alignment) else {
            return Ok(None);
        };
        if let Err(e) = mapping.recommit(&*self.vm) {
            mapping.release(&*self.vm);
            return Err(e);
        }
        let usable = mapping.size;
        Ok(Some((self.adopt(mapping), usable)))
    }

    /// Free a live allocation. Returns its usable size.
    pub fn free(&self, ptr: NonNull<u8>) -> Result<usize, Corruption> {
        let mut mapping = lock(&self.state).take_live(ptr)?;
        let size = mapping.size;

        if !self.policy.cache || size > self.policy.max_bytes {
            mapping.release(&*self.vm);
            return Ok(size);
        }
        if let Err(e) = mapping.decommit(&*self.vm) {
            log::debug!("[magzone] large decommit of {:#x} failed ({e}); releasing", mapping.addr());
            mapping.release(&*self.vm);
            return Ok(size);
        }

        let factor = match self.policy.reclaim {
            ReclaimPolicy::Eager => 1,
            ReclaimPolicy::Deferred => DEFERRED_OVERSHOOT,
        };
        let evicted = {
            let mut state = lock(&self.state);
            state.park(mapping);
            state.evict(
                self.policy.max_entries.saturating_mul(factor),
                self.policy.max_bytes.saturating_mul(factor),
            )
        };
        self.release_all(evicted);
        Ok(size)
    }

    /// Evict oldest death-row entries until both bounds hold. Returns bytes
    /// released.
    pub fn trim_to(&self, max_entries: usize, max_bytes: usize) -> usize {
        let evicted = lock(&self.state).evict(max_entries, max_bytes);
        self.release_all(evicted)
    }

    /// Bring the death-row back within its configured bounds.
    pub fn reclaim(&self) -> usize {
        self.trim_to(self.policy.max_entries, self.policy.max_bytes)
    }

    /// Release death-row entries, oldest first, until `goal` bytes went back
    /// (0 = all of them).
    pub fn purge(&self, goal: usize) -> usize {
        let evicted = {
            let mut state = lock(&self.state);
            let mut evicted = Vec::new();
            let mut bytes = 0;
            while goal == 0 || bytes < goal {
                let Some(mapping) = state.pop_oldest() else {
                    break;
                };
                bytes += mapping.reserved;
                evicted.push(mapping);
            }
            evicted
        };
        self.release_all(evicted)
    }

    fn release_all(&self, mappings: Vec<Mapping>) -> usize {
        mappings.into_iter().map(|m| m.release(&*self.vm)).sum()
    }

    pub fn size_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        lock(&self.state)
            .live
            .get(&(ptr.as_ptr() as usize))
            .map(Mapping::size)
    }

    /// Up to `limit` live allocations at or above `from`, lowest first.
    pub fn live_from(&self, from: usize, limit: usize) -> Vec<(usize, usize)> {
        lock(&self.state)
            .live
            .range(from..)
            .take(limit)
            .map(|(&addr, m)| (addr, m.size))
            .collect()
    }

    /// Reserved bytes, live and parked.
    pub fn footprint(&self) -> usize {
        let state = lock(&self.state);
        state.live.values().map(|m| m.reserved).sum::<usize>()
            + state.death_row.iter().map(|m| m.reserved).sum::<usize>()
    }

    #[cfg(test)]
    pub fn death_row_len(&self) -> usize {
        lock(&self.state).death_row.len()
    }
}

impl Drop for LargeAllocator {
    fn drop(&mut self) {
        let (parked, live) = {
            let mut state = lock(&self.state);
            (state.evict(0, 0), std::mem::take(&mut state.live))
        };
        self.release_all(parked);
        self.release_all(live.into_values().collect());
    }
}
