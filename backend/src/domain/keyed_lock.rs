//! Per-key async mutual exclusion.
//!
//! Merges into the same destination root must not interleave, while merges
//! into different roots proceed in parallel. Slots are created on demand and
//! dropped once nobody holds or awaits them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::domain::Error;

/// Table of async locks keyed by string.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    /// Wait for exclusive access to `key`. The lock is released when the
    /// returned guard drops.
    pub async fn acquire(&self, key: &str) -> Result<OwnedMutexGuard<()>, Error> {
        let slot = {
            let mut slots = self
                .slots
                .lock()
                .map_err(|_| Error::internal("keyed lock table poisoned"))?;
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            Arc::clone(slots.entry(key.to_owned()).or_default())
        };
        Ok(slot.lock_owned().await)
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        self.slots.lock().map_or(0, |slots| slots.len())
    }

    /// Whether no slot is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
