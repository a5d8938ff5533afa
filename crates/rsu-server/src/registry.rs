//! Thread-safe map from remote-IP key to connection handle.

use std::collections::HashMap;
use std::net::IpAddr;

use tokio::sync::RwLock;

/// Registry of live connections, keyed by the remote IP address (without
/// port) of each device.
///
/// Readers may overlap; writers are mutually exclusive with everyone else.
/// `insert` is first-writer-wins: a connection that loses the race on a
/// duplicate key is **not** recorded here, but it must still proceed
/// through its own close path to release its socket (that is the caller's
/// responsibility, not this registry's).
#[derive(Default)]
pub struct ClientRegistry<H> {
    entries: RwLock<HashMap<IpAddr, H>>,
}

impl<H: Clone> ClientRegistry<H> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    /// Insert `handle` under `key`. No-op if `key` is already present;
    /// returns `true` if the insert happened.
    pub async fn insert(&self, key: IpAddr, handle: H) -> bool {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&key) {
            false
        } else {
            entries.insert(key, handle);
            true
        }
    }

    /// Remove `key`. No-op if absent.
    pub async fn remove(&self, key: IpAddr) {
        self.entries.write().await.remove(&key);
    }

    /// Look up the handle for `key`.
    pub async fn get(&self, key: IpAddr) -> Option<H> {
        self.entries.read().await.get(&key).cloned()
    }

    /// Snapshot of every live connection handle.
    pub async fn snapshot(&self) -> Vec<H> {
        self.entries.read().await.values().cloned().collect()
    }
}
