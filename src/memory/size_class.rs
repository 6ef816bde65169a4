use super::error::MallocError;

// Family boundaries. Every call site goes through `SizeClassTable`; these
// constants are the only place the numbers live.
pub const TINY_QUANTUM: usize = 16;
pub const TINY_MAX: usize = 1008;
pub const TINY_SLAB: usize = 64 * 1024;

pub const SMALL_QUANTUM: usize = 512;
pub const SMALL_MIN: usize = 1024;
pub const SMALL_MAX: usize = 15 * 1024;
pub const SMALL_SLAB: usize = 256 * 1024;

pub const MEDIUM_QUANTUM: usize = 16 * 1024;
pub const MEDIUM_MIN: usize = 16 * 1024;
pub const MEDIUM_MAX: usize = 256 * 1024;
pub const MEDIUM_SLAB: usize = 4 * 1024 * 1024;

const TINY_COUNT: usize = TINY_MAX / TINY_QUANTUM;
const SMALL_COUNT: usize = (SMALL_MAX - SMALL_MIN) / SMALL_QUANTUM + 1;
const MEDIUM_COUNT: usize = (MEDIUM_MAX - MEDIUM_MIN) / MEDIUM_QUANTUM + 1;

/// Number of slab-backed size classes.
pub const SLAB_CLASS_COUNT: usize = TINY_COUNT + SMALL_COUNT + MEDIUM_COUNT;

/// `SizeClass::index` of every large classification.
pub const LARGE_CLASS_INDEX: usize = usize::MAX;

/// Requests above this never classify (same ceiling as `Layout`).
const MAX_REQUEST: usize = isize::MAX as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    Tiny,
    Small,
    Medium,
    Large,
}

impl Family {
    /// Families served from slab regions, in address-independent order.
    pub const SLAB: [Family; 3] = [Family::Tiny, Family::Small, Family::Medium];

    /// Position in [`Family::SLAB`], `None` for large.
    #[inline]
    #[must_use]
    pub fn slab_index(self) -> Option<usize> {
        match self {
            Family::Tiny => Some(0),
            Family::Small => Some(1),
            Family::Medium => Some(2),
            Family::Large => None,
        }
    }
}

/// Immutable size-class descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClass {
    /// Global index into the table, or [`LARGE_CLASS_INDEX`].
    pub index: usize,
    pub family: Family,
    pub block_size: usize,
    pub quantum: usize,
    pub slab_size: usize,
    pub max_objects_per_slab: usize,
}

impl SizeClass {
    #[inline]
    #[must_use]
    pub fn is_large(&self) -> bool {
        self.family == Family::Large
    }
}

/// Result of [`SizeClassTable::classify`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classification {
    pub class: SizeClass,
    /// Usable bytes the caller will get.
    pub rounded_size: usize,
    /// Effective alignment of the returned block (at least the quantum).
    pub alignment: usize,
}

/// The size-class table of one zone. Built once, never mutated.
#[derive(Clone, Debug)]
pub struct SizeClassTable {
    classes: Vec<SizeClass>,
    first: [usize; 3],
    page_size: usize,
}

impl SizeClassTable {
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        let mut classes = Vec::with_capacity(SLAB_CLASS_COUNT);
        let families = [
            (Family::Tiny, TINY_QUANTUM, TINY_QUANTUM, TINY_MAX, TINY_SLAB),
            (Family::Small, SMALL_QUANTUM, SMALL_MIN, SMALL_MAX, SMALL_SLAB),
            (Family::Medium, MEDIUM_QUANTUM, MEDIUM_MIN, MEDIUM_MAX, MEDIUM_SLAB),
        ];
        let mut first = [0; 3];
        for (slot, &(family, quantum, min, max, slab)) in families.iter().enumerate() {
            first[slot] = classes.len();
            let slab_size = slab.max(page_size);
            let mut block_size = min;
            while block_size <= max {
                classes.push(SizeClass {
                    index: classes.len(),
                    family,
                    block_size,
                    quantum,
                    slab_size,
                    max_objects_per_slab: slab_size / block_size,
                });
                block_size += quantum;
            }
        }
        debug_assert_eq!(classes.len(), SLAB_CLASS_COUNT);
        Self {
            classes,
            first,
            page_size,
        }
    }

    #[inline]
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    #[must_use]
    pub fn class(&self, index: usize) -> Option<&SizeClass> {
        self.classes.get(index)
    }

    /// Classes of one slab family, smallest first.
    #[must_use]
    pub fn family_classes(&self, family: Family) -> &[SizeClass] {
        let Some(slot) = family.slab_index() else {
            return &[];
        };
        let end = self.first.get(slot + 1).copied().unwrap_or(self.classes.len());
        &self.classes[self.first[slot]..end]
    }

    /// Position of `class` inside its family.
    #[inline]
    #[must_use]
    pub fn local_index(&self, class: &SizeClass) -> usize {
        class
            .family
            .slab_index()
            .map_or(0, |slot| class.index - self.first[slot])
    }

    /// Smallest slab class holding `size` bytes (`1..=MEDIUM_MAX`).
    #[inline]
    fn index_for(size: usize) -> usize {
        if size <= TINY_MAX {
            size.div_ceil(TINY_QUANTUM) - 1
        } else if size <= SMALL_MAX {
            TINY_COUNT + (size.max(SMALL_MIN) - SMALL_MIN).div_ceil(SMALL_QUANTUM)
        } else {
            TINY_COUNT + SMALL_COUNT + (size.max(MEDIUM_MIN) - MEDIUM_MIN).div_ceil(MEDIUM_QUANTUM)
        }
    }

    /// Map a request onto a size class.
    ///
    /// `alignment == 0` means no constraint. A nonzero alignment must be a
    /// power of two and `size` must be a multiple of it. Size 0 maps to the
    /// smallest class.
    pub fn classify(&self, size: usize, alignment: usize) -> Result<Classification, MallocError> {
        if alignment != 0 && (!alignment.is_power_of_two() || !size.is_multiple_of(alignment)) {
            return Err(MallocError::InvalidAlignment { alignment, size });
        }
        let want = size.max(1);
        if want > MAX_REQUEST {
            return Err(MallocError::SizeOverflow { size });
        }

        if want <= MEDIUM_MAX {
            // Region bases are aligned to the slab size, so a block is
            // aligned to `alignment` iff its size is a multiple of it.
            let mut idx = Self::index_for(want);
            while let Some(class) = self.classes.get(idx) {
                if alignment <= class.quantum
                    || (class.block_size.is_multiple_of(alignment) && alignment <= class.slab_size)
                {
                    return Ok(Classification {
                        class: *class,
                        rounded_size: class.block_size,
                        alignment: alignment.max(1 << class.block_size.trailing_zeros()),
                    });
                }
                idx += 1;
            }
        }
        self.classify_large(size, want, alignment)
    }

    fn classify_large(
        &self,
        size: usize,
        want: usize,
        alignment: usize,
    ) -> Result<Classification, MallocError> {
        let rounded = want
            .checked_next_multiple_of(self.page_size)
            .filter(|&r| r <= MAX_REQUEST - self.page_size)
            .ok_or(MallocError::SizeOverflow { size })?;
        Ok(Classification {
            class: SizeClass {
                index: LARGE_CLASS_INDEX,
                family: Family::Large,
                block_size: rounded,
                quantum: self.page_size,
                slab_size: rounded,
                max_objects_per_slab: 1,
            },
            rounded_size: rounded,
            alignment: alignment.max(self.page_size),
        })
    }
}
