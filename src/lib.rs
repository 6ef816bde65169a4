#[cfg(not(target_pointer_width = "64"))]
compile_error!("magzone supports only 64-bit targets.");

#[cfg(not(unix))]
compile_error!("magzone supports only unix targets.");

pub(crate) mod sync;

// public module: zone engine, registry and introspection; internals stay
// pub(crate). TEST_MUTEX is public for tests.
pub mod memory;

#[cfg(feature = "ffi")]
pub mod ffi;

// zones
pub use memory::registry::{DEFAULT_ZONE_NAME, ZoneRegistry};
pub use memory::zone::{MallocOptions, Zone, ZoneObserver};

// config
pub use memory::config::{MagazineSelect, ReclaimPolicy, ZoneConfig};

// introspection/stats
pub use memory::introspect::{EnumCursor, Enumerator, Range, RangeType, ZoneStatistics};
pub use memory::pressure::{PressureEvent, PressureHandler};
pub use memory::stats::MemoryStats;

// VM provider
pub use memory::vm::{HeapVm, VmProvider};

// errors
pub use memory::error::{ConfigError, MallocError, RegistryError, VmError};
