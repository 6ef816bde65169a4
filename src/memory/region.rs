use super::error::{Corruption, VmError};
use super::size_class::SizeClass;
use super::stats;
use super::vm::VmProvider;
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

/// Blocks one [`FreeTree`] can index (three levels of 64-bit words).
pub(crate) const FREE_TREE_CAPACITY: usize = 64 * 64 * 64;

/// Hierarchical bitset over the blocks of one region: bit set = block free.
///
/// `l2` has one bit per block, `l1` one bit per non-zero `l2` word, `l0`
/// one bit per non-zero `l1` word. First-fit lookup is three
/// `trailing_zeros` calls, lowest address first.
pub(crate) struct FreeTree {
    l0: u64,
    l1: Vec<u64>,
    l2: Vec<u64>,
}

impl FreeTree {
    /// Empty tree (no block free) sized for `capacity` blocks.
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity <= FREE_TREE_CAPACITY);
        let l2_words = capacity.div_ceil(64);
        Self {
            l0: 0,
            l1: vec![0; l2_words.div_ceil(64)],
            l2: vec![0; l2_words],
        }
    }

    pub fn mark_free(&mut self, block: usize) {
        let l2_word = block / 64;
        let l1_word = l2_word / 64;

        let mask2 = 1u64 << (block % 64);
        if self.l2[l2_word] & mask2 == 0 {
            self.l2[l2_word] |= mask2;
            self.l1[l1_word] |= 1u64 << (l2_word % 64);
            self.l0 |= 1u64 << l1_word;
        }
    }

    pub fn mark_used(&mut self, block: usize) {
        let l2_word = block / 64;
        self.l2[l2_word] &= !(1u64 << (block % 64));

        if self.l2[l2_word] == 0 {
            let l1_word = l2_word / 64;
            self.l1[l1_word] &= !(1u64 << (l2_word % 64));
            if self.l1[l1_word] == 0 {
                self.l0 &= !(1u64 << l1_word);
            }
        }
    }

    /// Lowest free block.
    pub fn find_free(&self) -> Option<usize> {
        if self.l0 == 0 {
            return None;
        }
        let l1_word = self.l0.trailing_zeros() as usize;
        let l2_word = l1_word * 64 + self.l1[l1_word].trailing_zeros() as usize;
        Some(l2_word * 64 + self.l2[l2_word].trailing_zeros() as usize)
    }
}

/// Internal allocation failure of a single region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub(crate) enum RegionError {
    #[error("region has no free block")]
    NoFreeBlock,
}

/// One slab: a contiguous, slab-size-aligned VM span cut into equal blocks.
///
/// `allocated` is the authoritative block state (one bit per block, set =
/// handed out); `free` mirrors its complement for fast first-fit search.
pub(crate) struct Region {
    base: NonNull<u8>,
    len: usize,
    class: SizeClass,
    capacity: usize,
    free: FreeTree,
    allocated: FixedBitSet,
    live: usize,
    owner: usize,
    vm: std::sync::Arc<dyn VmProvider>,
}

// Safety: Region owns its VM span; access is serialised by the owning
// magazine's lock.
unsafe impl Send for Region {}

impl Drop for Region {
    fn drop(&mut self) {
        // Safety: base/len is exactly the reservation made in `acquire`.
        if let Err(e) = unsafe { self.vm.release(self.base, self.len) } {
            log::warn!("[magzone] region {:p} release failed: {e}", self.base);
            return;
        }
        stats::TOTAL_RESERVED.sub(self.len);
        stats::TOTAL_COMMITTED.sub(self.len);
        stats::REGION_COMMITTED.sub(self.len);
    }
}

impl Region {
    /// Map a fresh region for `class`, owned by magazine `owner`.
    ///
    /// The span is aligned to its own size, so block alignment follows from
    /// block size alone.
    pub fn acquire(
        vm: &std::sync::Arc<dyn VmProvider>,
        class: SizeClass,
        owner: usize,
    ) -> Result<Self, VmError> {
        let len = class.slab_size;
        let base = vm.reserve(len, len)?;
        // Safety: base/len was just reserved.
        if let Err(e) = unsafe { vm.commit(base, len) } {
            // Safety: releasing the reservation made above.
            drop(unsafe { vm.release(base, len) });
            return Err(e);
        }
        stats::TOTAL_RESERVED.add(len);
        stats::TOTAL_COMMITTED.add(len);
        stats::REGION_COMMITTED.add(len);

        let mut region = Self {
            base,
            len,
            class,
            capacity: 0,
            free: FreeTree::new(0),
            allocated: FixedBitSet::new(),
            live: 0,
            owner,
            vm: vm.clone(),
        };
        region.format(class);
        debug_assert_eq!(region.carve().count(), region.capacity);
        Ok(region)
    }

    /// Reset the block layout for `class`. All blocks start free.
    fn format(&mut self, class: SizeClass) {
        let capacity = self.len / class.block_size;
        self.class = class;
        self.capacity = capacity;
        self.free = FreeTree::new(capacity);
        self.allocated = FixedBitSet::with_capacity(capacity);
        for block in 0..capacity {
            self.free.mark_free(block);
        }
    }

    /// Re-cut an empty region for another class with the same slab size.
    pub fn recarve(&mut self, class: SizeClass) {
        debug_assert!(self.is_empty(), "recarve of a region with live blocks");
        debug_assert_eq!(class.slab_size, self.len);
        if self.class != class {
            self.format(class);
        }
    }

    /// Offsets of the blocks currently free, lowest first. Lazy and finite.
    pub fn carve(&self) -> impl Iterator<Item = usize> + '_ {
        let block_size = self.class.block_size;
        (0..self.capacity)
            .filter(|&block| !self.allocated.contains(block))
            .map(move |block| block * block_size)
    }

    pub fn allocate_block(&mut self) -> Result<NonNull<u8>, RegionError> {
        let block = self.free.find_free().ok_or(RegionError::NoFreeBlock)?;
        debug_assert!(!self.allocated.contains(block));
        self.free.mark_used(block);
        self.allocated.insert(block);
        self.live += 1;
        Ok(self.block_ptr(block))
    }

    /// Return `ptr` to the bitmap.
    ///
    /// Validation happens before any mutation: on error the region is
    /// untouched.
    pub fn free_block(&mut self, ptr: NonNull<u8>) -> Result<(), Corruption> {
        let block = self.block_index(ptr)?;
        if !self.allocated.contains(block) {
            return Err(Corruption::DoubleFree {
                addr: ptr.as_ptr() as usize,
                block,
            });
        }
        self.allocated.set(block, false);
        self.free.mark_free(block);
        self.live -= 1;
        Ok(())
    }

    /// Block index of `ptr`, which must point at the start of a block.
    pub fn block_index(&self, ptr: NonNull<u8>) -> Result<usize, Corruption> {
        let addr = ptr.as_ptr() as usize;
        let offset = addr.wrapping_sub(self.base.as_ptr() as usize);
        let block_size = self.class.block_size;
        if offset >= self.capacity * block_size {
            return Err(Corruption::UnknownPointer { addr });
        }
        if !offset.is_multiple_of(block_size) {
            return Err(Corruption::Misaligned { addr, block_size });
        }
        Ok(offset / block_size)
    }

    #[inline]
    pub fn block_ptr(&self, block: usize) -> NonNull<u8> {
        debug_assert!(block < self.capacity);
        // Safety: block < capacity keeps the offset inside the span.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(block * self.class.block_size)) }
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        addr >= base && addr - base < self.len
    }

    pub fn is_allocated(&self, ptr: NonNull<u8>) -> bool {
        self.block_index(ptr)
            .is_ok_and(|block| self.allocated.contains(block))
    }

    /// Start addresses of the blocks marked allocated, lowest first.
    pub fn allocated_blocks(&self) -> impl Iterator<Item = usize> + '_ {
        let base = self.base.as_ptr() as usize;
        let block_size = self.class.block_size;
        self.allocated.ones().map(move |block| base + block * block_size)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.live == self.capacity
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn class(&self) -> &SizeClass {
        &self.class
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn owner(&self) -> usize {
        self.owner
    }

    pub fn set_owner(&mut self, owner: usize) {
        self.owner = owner;
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::size_class::{Family, SizeClassTable};
    use crate::memory::vm::HeapVm;

    fn vm() -> std::sync::Arc<dyn VmProvider> {
        std::sync::Arc::new(HeapVm::new())
    }

    fn class_for(size: usize) -> SizeClass {
        SizeClassTable::new(4096).classify(size, 0).unwrap().class
    }

    #[test]
    fn test_free_tree_first_fit() {
        let mut tree = FreeTree::new(4096);
        assert_eq!(tree.find_free(), None);
        tree.mark_free(4095);
        tree.mark_free(70);
        assert_eq!(tree.find_free(), Some(70));
        tree.mark_used(70);
        assert_eq!(tree.find_free(), Some(4095));
        tree.mark_used(4095);
        assert_eq!(tree.find_free(), None);
    }

    #[test]
    fn test_free_tree_idempotent_mark_free() {
        let mut tree = FreeTree::new(128);
        tree.mark_free(5);
        tree.mark_free(5);
        tree.mark_used(5);
        assert_eq!(tree.find_free(), None);
    }

    #[test]
    fn test_acquire_is_aligned_and_carved() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let class = class_for(48);
        let region = Region::acquire(&vm(), class, 0).unwrap();
        assert_eq!(region.base() % class.slab_size, 0);
        assert_eq!(region.capacity(), class.slab_size / 48);
        assert!(region.is_empty());
        let offsets: Vec<usize> = region.carve().take(3).collect();
        assert_eq!(offsets, vec![0, 48, 96]);
        assert_eq!(region.carve().count(), region.capacity());
    }

    #[test]
    fn test_allocate_until_full() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let class = class_for(MEDIUM_BLOCK);
        let mut region = Region::acquire(&vm(), class, 0).unwrap();
        let mut seen = Vec::new();
        while let Ok(p) = region.allocate_block() {
            seen.push(p.as_ptr() as usize);
        }
        assert!(region.is_full());
        assert_eq!(seen.len(), region.capacity());
        assert_eq!(region.allocate_block(), Err(RegionError::NoFreeBlock));
        // First fit: addresses ascend.
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(region.carve().count(), 0);
    }

    const MEDIUM_BLOCK: usize = 256 * 1024;

    #[test]
    fn test_free_reuses_lowest_block() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut region = Region::acquire(&vm(), class_for(64), 0).unwrap();
        let a = region.allocate_block().unwrap();
        let b = region.allocate_block().unwrap();
        region.free_block(a).unwrap();
        assert_eq!(region.allocate_block().unwrap(), a);
        region.free_block(b).unwrap();
        region.free_block(a).unwrap();
        assert!(region.is_empty());
    }

    #[test]
    fn test_double_free_detected() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut region = Region::acquire(&vm(), class_for(32), 0).unwrap();
        let p = region.allocate_block().unwrap();
        region.free_block(p).unwrap();
        assert!(matches!(
            region.free_block(p),
            Err(Corruption::DoubleFree { block: 0, .. })
        ));
        assert!(region.is_empty(), "failed free must not mutate state");
    }

    #[test]
    fn test_misaligned_and_foreign_pointers() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut region = Region::acquire(&vm(), class_for(32), 0).unwrap();
        let p = region.allocate_block().unwrap();
        // Safety: Test code, pointer stays inside the block.
        let inner = unsafe { NonNull::new_unchecked(p.as_ptr().add(8)) };
        assert!(matches!(
            region.free_block(inner),
            Err(Corruption::Misaligned { block_size: 32, .. })
        ));
        let mut outside = 0u64;
        let foreign = NonNull::from(&mut outside).cast::<u8>();
        assert!(matches!(
            region.free_block(foreign),
            Err(Corruption::UnknownPointer { .. })
        ));
        assert_eq!(region.live(), 1);
    }

    #[test]
    fn test_recarve_same_family() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut region = Region::acquire(&vm(), class_for(16), 0).unwrap();
        let p = region.allocate_block().unwrap();
        region.free_block(p).unwrap();
        let bigger = class_for(1008);
        assert_eq!(bigger.family, Family::Tiny);
        region.recarve(bigger);
        assert_eq!(region.capacity(), bigger.slab_size / 1008);
        let q = region.allocate_block().unwrap();
        assert_eq!(q.as_ptr() as usize, region.base());
        assert!(region.is_allocated(q));
    }

    #[test]
    fn test_allocated_blocks_listing() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut region = Region::acquire(&vm(), class_for(128), 0).unwrap();
        let a = region.allocate_block().unwrap();
        let b = region.allocate_block().unwrap();
        let c = region.allocate_block().unwrap();
        region.free_block(b).unwrap();
        let listed: Vec<usize> = region.allocated_blocks().collect();
        assert_eq!(listed, vec![a.as_ptr() as usize, c.as_ptr() as usize]);
    }

    #[test]
    fn test_drop_releases_reservation() {
        use crate::memory::vm::testing::FaultyVm;
        use crate::sync::atomic::Ordering;
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();

        let faulty = std::sync::Arc::new(FaultyVm::new(vm(), 1));
        let provider: std::sync::Arc<dyn VmProvider> = faulty.clone();
        let region = Region::acquire(&provider, class_for(16), 0).unwrap();
        assert!(Region::acquire(&provider, class_for(16), 0).is_err());
        drop(region);
        assert_eq!(faulty.releases.load(Ordering::SeqCst), 1);
    }
}
