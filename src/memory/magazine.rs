//! Magazines: per-thread shards of a slab family.
//!
//! Lock order, outermost first:
//!   1. magazine locks, ascending magazine index (only `Depot::steal` holds two)
//!   2. the zone's `RegionIndex` lock (leaf: never held while taking another)
//!
//! A region belongs to exactly one magazine while it is listed in the
//! index. Frees look the owner up in the index, drop the index lock, then
//! take the owner's lock; a stale lookup is caught by `try_free` returning
//! `NotOwned` and retried.

use super::config::ReclaimPolicy;
use super::error::{Corruption, VmError};
use super::pressure::PressureState;
use super::region::{Region, RegionError};
use super::size_class::{Family, SizeClass, SizeClassTable};
use super::vm::VmProvider;
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{Mutex, RwLock, lock};
use std::collections::{BTreeMap, BTreeSet};
use std::ptr::NonNull;

/// Extra index lookups a free makes after a `NotOwned` rejection.
const ROUTE_RETRIES: usize = 2;

pub(crate) const SCRIBBLE_FREE: u8 = 0x55;

// ---------------------------------------------------------------------------
// Region index
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RegionEntry {
    pub len: usize,
    pub family: Family,
    pub magazine: usize,
}

/// Address-range index of a zone's live regions: base → owner.
#[derive(Default)]
pub(crate) struct RegionIndex {
    map: BTreeMap<usize, RegionEntry>,
}

impl RegionIndex {
    pub fn insert(&mut self, base: usize, entry: RegionEntry) {
        self.map.insert(base, entry);
    }

    pub fn remove(&mut self, base: usize) {
        self.map.remove(&base);
    }

    /// Region containing `addr`, if any.
    pub fn lookup(&self, addr: usize) -> Option<RegionEntry> {
        let (&base, entry) = self.map.range(..=addr).next_back()?;
        (addr - base < entry.len).then_some(*entry)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.len()
    }
}

// ---------------------------------------------------------------------------
// Magazine
// ---------------------------------------------------------------------------

pub(crate) enum Alloc {
    Hit(NonNull<u8>),
    Miss,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum FreeReject {
    /// The pointer's region is not owned by this magazine.
    #[error("region not owned by this magazine")]
    NotOwned,
    #[error(transparent)]
    Corrupt(#[from] Corruption),
}

/// Zone policy as seen by the free path.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FreePolicy {
    pub cache: bool,
    pub zero: bool,
    pub scribble: bool,
    pub retain: usize,
    pub reclaim: ReclaimPolicy,
}

pub(crate) struct Freed {
    pub block_size: usize,
    /// Region released from the magazine; drop it after unlocking.
    pub evicted: Option<Region>,
    /// A region moved to the spare list.
    pub parked: bool,
}

/// Copy of one region's live blocks, taken under the magazine lock.
pub(crate) struct RegionSnapshot {
    pub base: usize,
    pub len: usize,
    pub block_size: usize,
    pub blocks: Vec<usize>,
}

pub(crate) struct Magazine {
    index: usize,
    family: Family,
    first_class: usize,
    regions: BTreeMap<usize, Region>,
    /// Per class (family-local): bases of regions with a free block.
    available: Vec<BTreeSet<usize>>,
    /// Per class (family-local): most recently freed block. Still marked
    /// allocated in its region's bitmap.
    last_free: Vec<Option<NonNull<u8>>>,
    /// Fully-free regions detached from the index, ready for any class.
    spare: Vec<Region>,
    /// Regions in `regions` with no live block.
    empty: usize,
}

// Safety: raw pointers in `last_free` point into regions this magazine owns;
// all access is under the magazine's lock.
unsafe impl Send for Magazine {}

impl Magazine {
    pub fn new(index: usize, family: Family, table: &SizeClassTable) -> Self {
        let classes = table.family_classes(family);
        Self {
            index,
            family,
            first_class: classes.first().map_or(0, |c| c.index),
            regions: BTreeMap::new(),
            available: vec![BTreeSet::new(); classes.len()],
            last_free: vec![None; classes.len()],
            spare: Vec::new(),
            empty: 0,
        }
    }

    #[inline]
    fn local(&self, class: &SizeClass) -> usize {
        debug_assert_eq!(class.family, self.family);
        class.index - self.first_class
    }

    /// Serve from the last-free slot, then from owned regions.
    pub fn try_allocate(&mut self, class: &SizeClass, cache: bool) -> Alloc {
        let local = self.local(class);
        if cache && let Some(ptr) = self.last_free[local].take() {
            return Alloc::Hit(ptr);
        }
        while let Some(&base) = self.available[local].first() {
            let Some(region) = self.regions.get_mut(&base) else {
                self.available[local].remove(&base);
                continue;
            };
            let was_empty = region.is_empty();
            match region.allocate_block() {
                Ok(ptr) => {
                    if was_empty {
                        self.empty -= 1;
                    }
                    if region.is_full() {
                        self.available[local].remove(&base);
                    }
                    return Alloc::Hit(ptr);
                }
                Err(RegionError::NoFreeBlock) => {
                    self.available[local].remove(&base);
                }
            }
        }
        Alloc::Miss
    }

    /// Take ownership of an empty region, cut it for `class` and hand out
    /// its first block.
    pub fn adopt(
        &mut self,
        mut region: Region,
        class: &SizeClass,
        index: &RwLock<RegionIndex>,
    ) -> Result<NonNull<u8>, RegionError> {
        region.recarve(*class);
        region.set_owner(self.index);
        let ptr = region.allocate_block()?;
        let base = region.base();
        index.write().unwrap_or_else(std::sync::PoisonError::into_inner).insert(
            base,
            RegionEntry {
                len: region.len(),
                family: self.family,
                magazine: self.index,
            },
        );
        if !region.is_full() {
            let local = self.local(class);
            self.available[local].insert(base);
        }
        self.regions.insert(base, region);
        Ok(ptr)
    }

    pub fn take_spare(&mut self) -> Option<Region> {
        self.spare.pop()
    }

    pub fn park(&mut self, region: Region) {
        debug_assert!(region.is_empty());
        self.spare.push(region);
    }

    /// Free `ptr` into this magazine.
    ///
    /// Rejects with `NotOwned` when no region of this magazine contains the
    /// pointer. Corruption is reported before anything is modified.
    pub fn try_free(
        &mut self,
        ptr: NonNull<u8>,
        policy: &FreePolicy,
        index: &RwLock<RegionIndex>,
    ) -> Result<Freed, FreeReject> {
        let addr = ptr.as_ptr() as usize;
        let (class, block) = {
            let Some((_, region)) = self.regions.range(..=addr).next_back() else {
                return Err(FreeReject::NotOwned);
            };
            if !region.contains(addr) {
                return Err(FreeReject::NotOwned);
            }
            let block = region.block_index(ptr)?;
            if !region.is_allocated(ptr) {
                return Err(Corruption::DoubleFree { addr, block }.into());
            }
            (*region.class(), block)
        };
        let local = self.local(&class);
        if self.last_free[local] == Some(ptr) {
            return Err(Corruption::DoubleFree { addr, block }.into());
        }

        // Safety: ptr is a live block of `class` inside a region we own.
        unsafe {
            if policy.scribble {
                std::ptr::write_bytes(ptr.as_ptr(), SCRIBBLE_FREE, class.block_size);
            } else if policy.zero {
                std::ptr::write_bytes(ptr.as_ptr(), 0, class.block_size);
            }
        }

        let victim = if policy.cache {
            match self.last_free[local].replace(ptr) {
                Some(previous) => previous,
                None => {
                    return Ok(Freed {
                        block_size: class.block_size,
                        evicted: None,
                        parked: false,
                    });
                }
            }
        } else {
            ptr
        };
        let (evicted, parked) = self.release_block(victim, policy, index)?;
        Ok(Freed {
            block_size: class.block_size,
            evicted,
            parked,
        })
    }

    /// Clear `ptr` in its region's bitmap and apply the retention policy.
    fn release_block(
        &mut self,
        ptr: NonNull<u8>,
        policy: &FreePolicy,
        index: &RwLock<RegionIndex>,
    ) -> Result<(Option<Region>, bool), Corruption> {
        let addr = ptr.as_ptr() as usize;
        let Some((&base, region)) = self.regions.range_mut(..=addr).next_back() else {
            return Err(Corruption::UnknownPointer { addr });
        };
        region.free_block(ptr)?;
        let local = region.class().index - self.first_class;
        let now_empty = region.is_empty();
        self.available[local].insert(base);
        if !now_empty {
            return Ok((None, false));
        }

        self.empty += 1;
        if self.empty <= policy.retain {
            return Ok((None, false));
        }
        let region = self.detach(base, index);
        match policy.reclaim {
            ReclaimPolicy::Eager => Ok((region, false)),
            ReclaimPolicy::Deferred => {
                let parked = region.is_some();
                if let Some(region) = region {
                    self.spare.push(region);
                }
                Ok((None, parked))
            }
        }
    }

    /// Remove an empty region from this magazine and the index.
    fn detach(&mut self, base: usize, index: &RwLock<RegionIndex>) -> Option<Region> {
        let region = self.regions.remove(&base)?;
        debug_assert!(region.is_empty());
        self.empty -= 1;
        let local = region.class().index - self.first_class;
        self.available[local].remove(&base);
        index
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(base);
        Some(region)
    }

    /// Flush every last-free slot and give up every fully-free region,
    /// spares included.
    pub fn relieve(&mut self, index: &RwLock<RegionIndex>) -> Result<Vec<Region>, Corruption> {
        let keep_all = FreePolicy {
            cache: false,
            zero: false,
            scribble: false,
            retain: usize::MAX,
            reclaim: ReclaimPolicy::Eager,
        };
        for local in 0..self.last_free.len() {
            if let Some(ptr) = self.last_free[local].take() {
                self.release_block(ptr, &keep_all, index)?;
            }
        }
        let empties: Vec<usize> = self
            .regions
            .iter()
            .filter(|(_, r)| r.is_empty())
            .map(|(&base, _)| base)
            .collect();
        let mut released: Vec<Region> = empties
            .into_iter()
            .filter_map(|base| self.detach(base, index))
            .collect();
        released.append(&mut self.spare);
        Ok(released)
    }

    /// Give up the spare list.
    pub fn reclaim(&mut self) -> Vec<Region> {
        std::mem::take(&mut self.spare)
    }

    /// Usable size of the live block at `ptr`.
    pub fn size_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let addr = ptr.as_ptr() as usize;
        let (_, region) = self.regions.range(..=addr).next_back()?;
        if !region.contains(addr) || !region.is_allocated(ptr) {
            return None;
        }
        let class = region.class();
        (self.last_free[self.local(class)] != Some(ptr)).then_some(class.block_size)
    }

    /// Live blocks of the first region at or above `from`.
    pub fn snapshot_from(&self, from: usize) -> Option<RegionSnapshot> {
        let (&base, region) = self.regions.range(from..).next()?;
        let class = region.class();
        let cached = self.last_free[self.local(class)].map(|p| p.as_ptr() as usize);
        Some(RegionSnapshot {
            base,
            len: region.len(),
            block_size: class.block_size,
            blocks: region
                .allocated_blocks()
                .filter(|&addr| Some(addr) != cached)
                .collect(),
        })
    }

    /// Bytes mapped by this magazine, spares included.
    pub fn footprint(&self) -> usize {
        self.regions.values().map(Region::len).sum::<usize>()
            + self.spare.iter().map(Region::len).sum::<usize>()
    }

    #[cfg(test)]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    #[cfg(test)]
    pub fn spare_count(&self) -> usize {
        self.spare.len()
    }
}

// ---------------------------------------------------------------------------
// Depot: the magazines of one family
// ---------------------------------------------------------------------------

/// Zone state the depot needs for a call.
pub(crate) struct DepotCx<'a> {
    pub vm: &'a std::sync::Arc<dyn VmProvider>,
    pub index: &'a RwLock<RegionIndex>,
    pub pressure: &'a PressureState,
    pub policy: FreePolicy,
}

pub(crate) struct Depot {
    family: Family,
    magazines: Box<[Mutex<Magazine>]>,
    /// Spare regions across all magazines. Hint for `steal`; may lag.
    spares: AtomicUsize,
}

impl Depot {
    pub fn new(family: Family, table: &SizeClassTable, count: usize) -> Self {
        let count = count.max(1);
        Self {
            family,
            magazines: (0..count)
                .map(|i| Mutex::new(Magazine::new(i, family, table)))
                .collect(),
            spares: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.magazines.len()
    }

    #[inline]
    pub fn family(&self) -> Family {
        self.family
    }

    /// Allocate one block of `class` through magazine `me`.
    pub fn allocate(
        &self,
        me: usize,
        class: &SizeClass,
        cx: &DepotCx<'_>,
    ) -> Result<NonNull<u8>, VmError> {
        {
            let mut mag = lock(&self.magazines[me]);
            if let Alloc::Hit(ptr) = mag.try_allocate(class, cx.policy.cache) {
                return Ok(ptr);
            }
            if let Some(region) = mag.take_spare() {
                self.spares.fetch_sub(1, Ordering::Relaxed);
                if let Ok(ptr) = mag.adopt(region, class, cx.index) {
                    return Ok(ptr);
                }
            }
        }

        if let Some(ptr) = self.steal(me, class, cx) {
            return Ok(ptr);
        }

        // Map with no lock held, then re-validate: another thread may have
        // freed into this magazine in the meantime.
        let region = Region::acquire(cx.vm, *class, me)?;
        cx.pressure.clear();
        let surplus;
        {
            let mut mag = lock(&self.magazines[me]);
            match mag.try_allocate(class, cx.policy.cache) {
                Alloc::Hit(ptr) => match cx.policy.reclaim {
                    ReclaimPolicy::Deferred => {
                        mag.park(region);
                        self.spares.fetch_add(1, Ordering::Relaxed);
                        return Ok(ptr);
                    }
                    ReclaimPolicy::Eager => surplus = (region, ptr),
                },
                Alloc::Miss => {
                    return mag
                        .adopt(region, class, cx.index)
                        .map_err(|_| VmError::out_of_memory(class.block_size));
                }
            }
        }
        let (region, ptr) = surplus;
        drop(region);
        Ok(ptr)
    }

    /// Move a spare region from a neighbour into `me` and allocate from it.
    ///
    /// The only path that holds two magazine locks; they are always taken
    /// in ascending index order.
    fn steal(&self, me: usize, class: &SizeClass, cx: &DepotCx<'_>) -> Option<NonNull<u8>> {
        let n = self.magazines.len();
        for step in 1..n {
            if self.spares.load(Ordering::Relaxed) == 0 {
                return None;
            }
            let other = (me + step) % n;
            let (lo, hi) = (me.min(other), me.max(other));
            let mut low = lock(&self.magazines[lo]);
            let mut high = lock(&self.magazines[hi]);
            let (mine, theirs) = if me == lo {
                (&mut *low, &mut *high)
            } else {
                (&mut *high, &mut *low)
            };
            if let Some(region) = theirs.take_spare() {
                self.spares.fetch_sub(1, Ordering::Relaxed);
                log::trace!(
                    "[magzone] {:?} magazine {me} took a spare region from magazine {other}",
                    self.family
                );
                return mine.adopt(region, class, cx.index).ok();
            }
        }
        None
    }

    /// Free `ptr`, first trying magazine `owner`.
    ///
    /// Returns the block size that went back to the family.
    pub fn free(
        &self,
        ptr: NonNull<u8>,
        mut owner: usize,
        cx: &DepotCx<'_>,
    ) -> Result<usize, Corruption> {
        let addr = ptr.as_ptr() as usize;
        for _ in 0..=ROUTE_RETRIES {
            let result = lock(&self.magazines[owner]).try_free(ptr, &cx.policy, cx.index);
            match result {
                Ok(freed) => {
                    if freed.parked {
                        self.spares.fetch_add(1, Ordering::Relaxed);
                    }
                    drop(freed.evicted);
                    return Ok(freed.block_size);
                }
                Err(FreeReject::Corrupt(c)) => return Err(c),
                Err(FreeReject::NotOwned) => {
                    let entry = cx
                        .index
                        .read()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .lookup(addr);
                    match entry {
                        Some(e) if e.family == self.family => owner = e.magazine,
                        _ => break,
                    }
                }
            }
        }
        Err(Corruption::UnknownPointer { addr })
    }

    pub fn size_of(&self, ptr: NonNull<u8>, owner: usize) -> Option<usize> {
        self.magazines
            .get(owner)
            .and_then(|m| lock(m).size_of(ptr))
    }

    /// Flush caches and release every fully-free region until `goal` bytes
    /// went back (0 = no limit). Returns bytes released.
    pub fn relieve(&self, index: &RwLock<RegionIndex>, goal: usize) -> Result<usize, Corruption> {
        let mut released = 0;
        for mag in &*self.magazines {
            let regions = lock(mag).relieve(index)?;
            released += regions.iter().map(Region::len).sum::<usize>();
            drop(regions);
            if goal != 0 && released >= goal {
                break;
            }
        }
        self.recount_spares();
        Ok(released)
    }

    /// Release every parked spare region. Returns bytes released.
    pub fn reclaim(&self) -> usize {
        let mut released = 0;
        for mag in &*self.magazines {
            let regions = lock(mag).reclaim();
            released += regions.iter().map(Region::len).sum::<usize>();
        }
        self.recount_spares();
        released
    }

    fn recount_spares(&self) {
        let total = self
            .magazines
            .iter()
            .map(|m| lock(m).spare.len())
            .sum();
        self.spares.store(total, Ordering::Relaxed);
    }

    pub fn footprint(&self) -> usize {
        self.magazines.iter().map(|m| lock(m).footprint()).sum()
    }

    pub fn snapshot(&self, magazine: usize, from: usize) -> Option<RegionSnapshot> {
        lock(self.magazines.get(magazine)?).snapshot_from(from)
    }

    #[cfg(test)]
    pub fn with_magazine<R>(&self, i: usize, f: impl FnOnce(&Magazine) -> R) -> R {
        f(&lock(&self.magazines[i]))
    }
}
