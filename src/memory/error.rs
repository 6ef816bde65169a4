use std::io;

/// Failure reported by a [`VmProvider`](super::vm::VmProvider).
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("VM reservation of {size} bytes failed: {source}")]
    ReservationFailed { size: usize, source: io::Error },
    #[error("VM commit failed: {0}")]
    CommitFailed(io::Error),
    #[error("VM decommit failed: {0}")]
    DecommitFailed(io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(io::Error),
    #[error("invalid VM request: size {size}, alignment {alignment}")]
    InvalidRequest { size: usize, alignment: usize },
}

impl VmError {
    /// The provider ran out of address space or backing memory, as opposed
    /// to rejecting the request or failing to give memory back.
    #[must_use]
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::ReservationFailed { .. } | Self::CommitFailed(_))
    }

    pub(crate) fn out_of_memory(size: usize) -> Self {
        Self::ReservationFailed {
            size,
            source: io::Error::from(io::ErrorKind::OutOfMemory),
        }
    }
}

/// Recoverable failures of the malloc-family entry points.
///
/// Every variant is detected before any bitmap mutation, so a failed call
/// leaves the zone exactly as it found it.
#[derive(Debug, thiserror::Error)]
pub enum MallocError {
    /// Alignment is not a power of two, is not a multiple of the pointer
    /// size where that is required, or `size` is not a multiple of it.
    #[error("invalid alignment {alignment} for size {size}")]
    InvalidAlignment { alignment: usize, size: usize },
    /// Rounding `size` up to its size class would overflow.
    #[error("allocation size {size} overflows size-class rounding")]
    SizeOverflow { size: usize },
    /// The VM provider could not back the request.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory {
        size: usize,
        #[source]
        source: VmError,
    },
}

impl MallocError {
    /// The `errno` value a C caller would observe.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            MallocError::InvalidAlignment { .. } => libc::EINVAL,
            MallocError::SizeOverflow { .. } | MallocError::OutOfMemory { .. } => libc::ENOMEM,
        }
    }
}

/// Rejected [`ZoneConfig`](super::config::ZoneConfig).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("magazine_shift {0} must be below 64")]
    MagazineShift(u32),
    #[error("magazine_count {count} exceeds the limit of {max}")]
    TooManyMagazines { count: usize, max: usize },
    #[error("large_cache_max_entries must be non-zero when the large cache is enabled")]
    EmptyLargeCache,
}

/// Failures of zone registration bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("zone {0} is not registered")]
    NotRegistered(u64),
    #[error("zone {0} is the default zone and cannot be destroyed")]
    DefaultZone(u64),
    #[error("no default zone is set")]
    NoDefaultZone,
}

/// Heap corruption detected while mutating allocator metadata.
///
/// Never returned to callers: see [`fatal`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Corruption {
    #[error("double free of {addr:#x} (block {block} already free)")]
    DoubleFree { addr: usize, block: usize },
    #[error("pointer {addr:#x} was not allocated by this zone")]
    UnknownPointer { addr: usize },
    #[error("pointer {addr:#x} is not aligned to block size {block_size}")]
    Misaligned { addr: usize, block_size: usize },
}

/// Fatal trap for heap corruption.
///
/// The corrupted state is left untouched for diagnosis; execution does not
/// continue past the check. Unwinding out of an `extern "C"` entry point
/// aborts the process.
#[cold]
#[inline(never)]
#[track_caller]
pub fn fatal(zone: &str, err: &Corruption) -> ! {
    log::error!("[magzone] zone {zone:?}: heap corruption: {err}");
    panic!("magzone: heap corruption in zone {zone:?}: {err}");
}
