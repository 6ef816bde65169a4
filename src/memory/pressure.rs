//! Low-memory notification.
//!
//! An event opens on the first allocation the VM provider cannot back and
//! closes at the next successful VM acquisition. The handler runs once per
//! event, however many allocations fail inside it.

use crate::sync::RwLock;
use crate::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// What the handler is told.
#[derive(Clone, Copy, Debug)]
pub struct PressureEvent<'a> {
    pub zone: &'a str,
    /// Bytes of the request that failed.
    pub requested: usize,
}

pub type PressureHandler = dyn Fn(&PressureEvent<'_>) + Send + Sync;

pub(crate) struct PressureState {
    handler: RwLock<Option<std::sync::Arc<PressureHandler>>>,
    active: AtomicBool,
    events: AtomicUsize,
}

impl PressureState {
    pub fn new() -> Self {
        Self {
            handler: RwLock::new(None),
            active: AtomicBool::new(false),
            events: AtomicUsize::new(0),
        }
    }

    pub fn set_handler(&self, handler: Option<std::sync::Arc<PressureHandler>>) {
        *self
            .handler
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = handler;
    }

    /// Report a failed VM acquisition. Returns `true` if this opened a new
    /// event (the handler, if any, has run).
    pub fn notify(&self, zone: &str, requested: usize) -> bool {
        if self.active.swap(true, Ordering::AcqRel) {
            return false;
        }
        let seq = self.events.fetch_add(1, Ordering::Relaxed) + 1;
        log::warn!("[magzone] zone {zone:?}: memory pressure event {seq} ({requested} bytes failed)");
        let handler = self
            .handler
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(&PressureEvent { zone, requested });
        }
        true
    }

    /// Close the current event, if one is open.
    #[inline]
    pub fn clear(&self) {
        if self.active.load(Ordering::Relaxed) {
            self.active.store(false, Ordering::Release);
        }
    }

    pub fn events(&self) -> usize {
        self.events.load(Ordering::Relaxed)
    }
}
