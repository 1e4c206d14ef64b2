//! Pending-request registry.
//!
//! Legacy handles are held strongly from `send` until their first terminal
//! event, through a [`PendingGuard`]. Modern handles are only registered
//! weakly and lapse once the last `Arc` to them is dropped; nothing removes
//! them explicitly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::warn;

use crate::types::ResponseHandle;

enum Entry {
    /// Holding the `Arc` is the point; it is never read back.
    Owned { _handle: Arc<ResponseHandle> },
    Lapsing(Weak<ResponseHandle>),
}

impl Entry {
    fn is_live(&self) -> bool {
        match self {
            Entry::Owned { .. } => true,
            Entry::Lapsing(weak) => weak.strong_count() > 0,
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<u64, Entry>,
    releases: u64,
}

#[derive(Clone, Default)]
pub struct PendingRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `handle` until the returned guard is released.
    pub fn acquire(&self, handle: &Arc<ResponseHandle>) -> PendingGuard {
        self.lock()
            .entries
            .insert(
                handle.id(),
                Entry::Owned {
                    _handle: Arc::clone(handle),
                },
            );
        PendingGuard {
            registry: self.clone(),
            id: handle.id(),
            released: false,
        }
    }

    /// Register `handle` without keeping it alive.
    pub fn track(&self, handle: &Arc<ResponseHandle>) {
        self.lock()
            .entries
            .insert(handle.id(), Entry::Lapsing(Arc::downgrade(handle)));
    }

    /// Live entries. Lapsed weak entries are pruned first.
    pub fn len(&self) -> usize {
        let mut inner = self.lock();
        inner.entries.retain(|_, e| e.is_live());
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock()
            .entries
            .get(&id)
            .map(Entry::is_live)
            .unwrap_or(false)
    }

    /// Number of explicit releases performed so far.
    pub fn releases(&self) -> u64 {
        self.lock().releases
    }

    fn release(&self, id: u64) -> bool {
        let mut inner = self.lock();
        let removed = inner.entries.remove(&id).is_some();
        if removed {
            inner.releases += 1;
        }
        removed
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Keeps a legacy handle registered until the first terminal event.
pub struct PendingGuard {
    registry: PendingRegistry,
    id: u64,
    released: bool,
}

impl PendingGuard {
    /// Remove the handle. Only the first call has an effect.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.registry.release(self.id)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!(handle = self.id, "pending request dropped before a terminal event");
            self.release();
        }
    }
}
