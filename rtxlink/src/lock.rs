//! Per-key mutex registry.
//!
//! Serializes mutations of the same router object (one DHCP scope, one
//! tunnel) while leaving unrelated objects concurrent. Lock entries
//! are never removed; the key space is bounded by the number of
//! configured objects, not by traffic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// Registry of named async locks.
///
/// Owned by the client instance, never shared process-wide, so two
/// clients for two routers do not contend.
#[derive(Default)]
pub struct KeyedMutex {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the given key, creating its entry on first use. The guard
    /// releases on drop.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }

    /// Run `f` while holding the lock for `key`.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock(key).await;
        f().await
    }

    /// Number of keys ever locked. For tests and debugging.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
