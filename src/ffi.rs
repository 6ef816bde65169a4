//! C-ABI entry points over the process-wide registry.
//!
//! Symbols carry a `magzone_` prefix so a test binary linking this crate
//! keeps the system allocator underneath it.

use crate::memory::error::MallocError;
use crate::memory::registry::ZoneRegistry;
use crate::memory::zone::MallocOptions;
use std::ffi::c_void;
use std::ptr::NonNull;

fn set_errno(code: libc::c_int) {
    // Safety: the errno location is thread-local and always valid.
    unsafe {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            *libc::__errno_location() = code;
        }
        #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
        {
            *libc::__error() = code;
        }
    }
}

fn out(result: Result<NonNull<u8>, MallocError>) -> *mut c_void {
    match result {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(e) => {
            set_errno(e.errno());
            std::ptr::null_mut()
        }
    }
}

/// `malloc`. Null with `errno` set on failure.
#[unsafe(no_mangle)]
pub extern "C" fn magzone_malloc(size: usize) -> *mut c_void {
    out(ZoneRegistry::global().malloc(size))
}

/// `calloc`. Null on overflow or failure.
#[unsafe(no_mangle)]
pub extern "C" fn magzone_calloc(count: usize, size: usize) -> *mut c_void {
    out(ZoneRegistry::global().calloc(count, size))
}

/// `malloc_zone_malloc_with_options` on the default zone. Unknown option
/// bits are ignored.
#[unsafe(no_mangle)]
pub extern "C" fn magzone_malloc_with_options(
    alignment: usize,
    size: usize,
    options: u64,
) -> *mut c_void {
    out(ZoneRegistry::global().malloc_with_options(
        alignment,
        size,
        MallocOptions::from_bits(options),
    ))
}

/// `free`. Null is a no-op.
///
/// # Safety
/// `ptr` must come from this allocator and not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn magzone_free(ptr: *mut c_void) {
    if let Some(ptr) = NonNull::new(ptr.cast::<u8>()) {
        // Safety: forwarded contract.
        unsafe { ZoneRegistry::global().free(ptr) };
    }
}

/// `realloc`. On failure the original block is left intact and null comes
/// back.
///
/// # Safety
/// `ptr` is null or a live block of this allocator.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn magzone_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    // Safety: forwarded contract.
    out(unsafe { ZoneRegistry::global().realloc(NonNull::new(ptr.cast::<u8>()), size) })
}

/// `posix_memalign`. Returns 0 or an errno value; `*memptr` is null on
/// every error path.
///
/// # Safety
/// `memptr` must be valid for a pointer-sized write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn magzone_posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> libc::c_int {
    if memptr.is_null() {
        return libc::EINVAL;
    }
    let (ptr, code) = match ZoneRegistry::global().posix_memalign(alignment, size) {
        Ok(ptr) => (ptr.as_ptr().cast(), 0),
        Err(e) => (std::ptr::null_mut(), e.errno()),
    };
    // Safety: checked non-null above, writability is the caller's contract.
    unsafe { memptr.write(ptr) };
    code
}

/// `malloc_size`: usable size, 0 for null or foreign pointers.
#[unsafe(no_mangle)]
pub extern "C" fn magzone_malloc_size(ptr: *const c_void) -> usize {
    NonNull::new(ptr.cast_mut().cast::<u8>()).map_or(0, |p| ZoneRegistry::global().size(p))
}
