use super::error::ConfigError;
use super::size_class::Family;

/// Upper bound on magazines per family.
pub const MAX_MAGAZINES: usize = 256;

/// What happens to a fully-free region or a parked large mapping once the
/// retention bounds are exceeded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReclaimPolicy {
    /// Release to the VM provider inline with `free`.
    #[default]
    Eager,
    /// Park it; the memory goes back on the next `Zone::reclaim` or
    /// `Zone::pressure_relief` pass.
    Deferred,
}

/// Identity used to pick a magazine for the calling thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MagazineSelect {
    /// Stable per-thread id. Cache locality stays put for a thread's lifetime.
    #[default]
    PerThread,
    /// Current CPU where the platform reports it, thread id otherwise.
    PerCpu,
}

/// Configuration for a [`Zone`](super::zone::Zone). All fields have sensible
/// defaults. Set at creation time via `Zone::new()` / `ZoneRegistry::create_zone()`.
#[derive(Clone, Debug)]
pub struct ZoneConfig {
    /// One-slot last-free cache for tiny blocks. Default: true.
    pub tiny_cache: bool,
    /// One-slot last-free cache for small blocks. Default: true.
    pub small_cache: bool,
    /// One-slot last-free cache for medium blocks. Default: true.
    pub medium_cache: bool,

    /// Keep freed large mappings on a death-row for reuse. Default: true.
    pub large_cache: bool,
    /// Death-row bound, in mappings. Default: 16.
    pub large_cache_max_entries: usize,
    /// Death-row bound, in bytes. Mappings larger than this are never
    /// parked. Default: 64 MB.
    pub large_cache_max_bytes: usize,

    /// Eager or deferred reclaim of fully-free regions and death-row
    /// overflow. Default: `Eager`.
    pub reclaim: ReclaimPolicy,

    /// Magazines per slab family. 0 = available parallelism. Default: 0.
    pub magazine_count: usize,
    /// Default: `PerThread`.
    pub magazine_select: MagazineSelect,
    /// Identity is shifted right by this many bits before picking a
    /// magazine, so neighbouring ids (hyperthreads, cluster siblings) share
    /// one. Default: 0.
    pub magazine_shift: u32,

    /// Fully-free regions a magazine keeps mapped and ready. Default: 1.
    pub retained_empty_regions: usize,

    /// Zero the block before it becomes reusable. Default: true.
    pub zero_on_free: bool,
    /// Fill fresh allocations with 0xAA and freed blocks with 0x55.
    /// Takes precedence over `zero_on_free` on the free path. Default: false.
    pub scribble: bool,
    /// Trailing inaccessible page behind every large allocation.
    /// Default: false.
    pub large_guard_pages: bool,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            tiny_cache: true,
            small_cache: true,
            medium_cache: true,
            large_cache: true,
            large_cache_max_entries: 16,
            large_cache_max_bytes: 64 * 1024 * 1024,
            reclaim: ReclaimPolicy::Eager,
            magazine_count: 0,
            magazine_select: MagazineSelect::PerThread,
            magazine_shift: 0,
            retained_empty_regions: 1,
            zero_on_free: true,
            scribble: false,
            large_guard_pages: false,
        }
    }
}

impl ZoneConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.magazine_shift >= u64::BITS {
            return Err(ConfigError::MagazineShift(self.magazine_shift));
        }
        if self.magazine_count > MAX_MAGAZINES {
            return Err(ConfigError::TooManyMagazines {
                count: self.magazine_count,
                max: MAX_MAGAZINES,
            });
        }
        if self.large_cache && self.large_cache_max_entries == 0 {
            return Err(ConfigError::EmptyLargeCache);
        }
        Ok(())
    }

    /// Magazine count with `0` resolved against the machine.
    #[must_use]
    pub fn resolved_magazine_count(&self) -> usize {
        if self.magazine_count != 0 {
            return self.magazine_count;
        }
        std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .min(MAX_MAGAZINES)
    }

    /// Whether the last-free slot is enabled for `family`.
    #[must_use]
    pub fn cache_enabled(&self, family: Family) -> bool {
        match family {
            Family::Tiny => self.tiny_cache,
            Family::Small => self.small_cache,
            Family::Medium => self.medium_cache,
            Family::Large => self.large_cache,
        }
    }
}
