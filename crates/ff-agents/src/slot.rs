//! Per-entity concurrency cell.
//!
//! A [`Slot`] pairs an async gate with an immutable published snapshot.
//! Writers serialize on the gate and hold it across the persistence write;
//! readers clone the current `Arc` and never wait on the gate, so they see
//! either the previous record or the next one, never a partial update.

use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug)]
pub struct Slot<T> {
    gate: Mutex<()>,
    current: RwLock<Arc<T>>,
}

impl<T> Slot<T> {
    pub fn new(value: T) -> Self {
        Self {
            gate: Mutex::new(()),
            current: RwLock::new(Arc::new(value)),
        }
    }

    /// Latest published value.
    pub fn snapshot(&self) -> Arc<T> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wait for exclusive write access.
    pub async fn lock(&self) -> SlotGuard<'_, T> {
        SlotGuard {
            slot: self,
            _gate: self.gate.lock().await,
        }
    }

    /// Exclusive write access if nobody else holds it right now.
    pub fn try_lock(&self) -> Option<SlotGuard<'_, T>> {
        self.gate.try_lock().ok().map(|gate| SlotGuard {
            slot: self,
            _gate: gate,
        })
    }
}

/// Write access to a [`Slot`]. Dropping it releases the gate.
pub struct SlotGuard<'a, T> {
    slot: &'a Slot<T>,
    _gate: MutexGuard<'a, ()>,
}

impl<T> SlotGuard<'_, T> {
    pub fn current(&self) -> Arc<T> {
        self.slot.snapshot()
    }

    /// Replace the published value. Call only after the new value is durable.
    pub fn publish(&self, value: T) {
        *self
            .slot
            .current
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Arc::new(value);
    }
}
