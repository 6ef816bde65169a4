//! Zone introspection: live-range enumeration and statistics.
//!
//! Enumeration is consistent per region, not across the whole zone. Each
//! region is snapshotted under its magazine lock and the lock is dropped
//! before the ranges are handed out, so a slow reader never stalls
//! allocation. A block freed after its region was snapshotted may still be
//! reported; a block that was live for the whole pass always is.

use super::size_class::Family;
use super::zone::{Zone, ZoneCore};
use crate::sync::atomic::{AtomicUsize, Ordering};
use std::collections::VecDeque;

/// Large allocations reported per batch.
const LARGE_BATCH: usize = 64;

/// Bitmask of range kinds, as in the malloc introspection protocol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RangeType(u32);

impl RangeType {
    /// Blocks handed out to callers.
    pub const IN_USE: Self = Self(1);
    /// Whole VM spans backing the zone.
    pub const REGION: Self = Self(2);
    /// Allocator metadata. Never reported: it lives on the Rust heap.
    pub const ADMIN: Self = Self(4);
    pub const ALL: Self = Self(7);

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for RangeType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Range {
    pub address: usize,
    pub size: usize,
}

impl Range {
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.address && addr - self.address < self.size
    }
}

/// `malloc_zone_statistics` equivalent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ZoneStatistics {
    pub blocks_in_use: usize,
    /// Usable bytes of live blocks.
    pub size_in_use: usize,
    /// High-water mark of `size_in_use`.
    pub max_size_in_use: usize,
    /// Bytes reserved from the VM provider, parked memory included.
    pub size_allocated: usize,
}

pub(crate) struct ZoneCounters {
    blocks: AtomicUsize,
    bytes: AtomicUsize,
    peak: AtomicUsize,
}

impl ZoneCounters {
    pub fn new() -> Self {
        Self {
            blocks: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn record_alloc(&self, size: usize) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
        let now = self.bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.peak.fetch_max(now, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_free(&self, size: usize) {
        self.blocks.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(size, Ordering::Relaxed);
    }

    pub fn snapshot(&self, size_allocated: usize) -> ZoneStatistics {
        ZoneStatistics {
            blocks_in_use: self.blocks.load(Ordering::Relaxed),
            size_in_use: self.bytes.load(Ordering::Relaxed),
            max_size_in_use: self.peak.load(Ordering::Relaxed),
            size_allocated,
        }
    }
}

/// Where an enumeration pass stands.
///
/// Obtained from [`Enumerator::cursor`]; passing it to
/// [`Zone::enumerator_from`] resumes at the first region not yet fully
/// reported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnumCursor {
    family: usize,
    magazine: usize,
    next_base: usize,
}

impl EnumCursor {
    const DONE: usize = Family::SLAB.len() + 1;

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.family >= Self::DONE
    }

    /// Family currently being walked.
    #[must_use]
    pub fn family(&self) -> Option<Family> {
        match self.family {
            f if f < Family::SLAB.len() => Some(Family::SLAB[f]),
            f if f == Family::SLAB.len() => Some(Family::Large),
            _ => None,
        }
    }
}

/// Lazy walk over a zone's ranges, one region (or one batch of large
/// allocations) per item.
pub struct Enumerator<'z> {
    zone: &'z ZoneCore,
    mask: RangeType,
    cursor: EnumCursor,
    /// Cursor of the unit whose ranges sit in `pending`.
    resume: EnumCursor,
    pending: VecDeque<(RangeType, Vec<Range>)>,
}

impl<'z> Enumerator<'z> {
    fn new(zone: &'z ZoneCore, mask: RangeType, cursor: EnumCursor) -> Self {
        Self {
            zone,
            mask,
            cursor,
            resume: cursor,
            pending: VecDeque::new(),
        }
    }

    /// Resume point. A unit only partly handed out is reported again.
    #[must_use]
    pub fn cursor(&self) -> EnumCursor {
        if self.pending.is_empty() {
            self.cursor
        } else {
            self.resume
        }
    }

    /// Snapshot the next unit into `pending`. `false` at the end of the zone.
    fn fill(&mut self) -> bool {
        let zone = self.zone;
        let depots = &zone.depots;
        loop {
            let c = &mut self.cursor;
            if c.family < depots.len() {
                let depot = &depots[c.family];
                if c.magazine >= depot.len() {
                    *c = EnumCursor {
                        family: c.family + 1,
                        ..EnumCursor::default()
                    };
                    continue;
                }
                let Some(snap) = depot.snapshot(c.magazine, c.next_base) else {
                    c.magazine += 1;
                    c.next_base = 0;
                    continue;
                };
                self.resume = *c;
                c.next_base = snap.base + snap.len;
                if self.mask.contains(RangeType::REGION) {
                    self.pending.push_back((
                        RangeType::REGION,
                        vec![Range {
                            address: snap.base,
                            size: snap.len,
                        }],
                    ));
                }
                if self.mask.contains(RangeType::IN_USE) && !snap.blocks.is_empty() {
                    let ranges = snap
                        .blocks
                        .iter()
                        .map(|&address| Range {
                            address,
                            size: snap.block_size,
                        })
                        .collect();
                    self.pending.push_back((RangeType::IN_USE, ranges));
                }
                if !self.pending.is_empty() {
                    return true;
                }
            } else if c.family == depots.len() {
                let live = zone.large.live_from(c.next_base, LARGE_BATCH);
                let Some(&(last, _)) = live.last() else {
                    c.family = EnumCursor::DONE;
                    return false;
                };
                self.resume = *c;
                c.next_base = last + 1;
                let ranges: Vec<Range> = live
                    .into_iter()
                    .map(|(address, size)| Range { address, size })
                    .collect();
                if self.mask.contains(RangeType::REGION) {
                    self.pending.push_back((RangeType::REGION, ranges.clone()));
                }
                if self.mask.contains(RangeType::IN_USE) {
                    self.pending.push_back((RangeType::IN_USE, ranges));
                }
                if !self.pending.is_empty() {
                    return true;
                }
            } else {
                return false;
            }
        }
    }
}

impl Iterator for Enumerator<'_> {
    type Item = (RangeType, Vec<Range>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pending.is_empty() && !self.fill() {
            return None;
        }
        self.pending.pop_front()
    }
}

impl Zone {
    /// Walk every range of the requested kinds. Wrappers walk the zone they
    /// wrap.
    pub fn enumerator(&self, mask: RangeType) -> Enumerator<'_> {
        self.enumerator_from(mask, EnumCursor::default())
    }

    pub fn enumerator_from(&self, mask: RangeType, cursor: EnumCursor) -> Enumerator<'_> {
        Enumerator::new(self.core(), mask, cursor)
    }

    /// Callback form: `visit` runs once per batch of contiguous-kind ranges.
    ///
    /// Any caller context (a task handle, a user cookie) is whatever the
    /// closure captures. Zone metadata is read directly in this address
    /// space; there is no out-of-process memory reader.
    pub fn enumerate(&self, mask: RangeType, mut visit: impl FnMut(RangeType, &[Range])) {
        for (kind, ranges) in self.enumerator(mask) {
            visit(kind, &ranges);
        }
    }

    /// Every live block, in enumeration order.
    #[must_use]
    pub fn in_use_ranges(&self) -> Vec<Range> {
        self.enumerator(RangeType::IN_USE)
            .flat_map(|(_, ranges)| ranges)
            .collect()
    }
}
