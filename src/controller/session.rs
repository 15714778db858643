//! Per-object state that lives as long as the operator process
//!
//! Each OpenSearchService gets one [`ObjectSession`]: its change hashes, the
//! lock that serializes mutating replication calls, and its replication
//! watcher. Nothing here is persisted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::cluster::ClusterAccess;
use super::hashes::ResourceHashes;
use super::watcher::ReplicationWatcher;

pub struct ObjectSession {
    hashes: Mutex<ResourceHashes>,
    /// Held by the switchover protocol and by the watcher while they touch replication
    pub replication_lock: Arc<tokio::sync::Mutex<()>>,
    pub watcher: ReplicationWatcher,
}

impl ObjectSession {
    pub fn new(access: ClusterAccess, namespace: &str, name: &str) -> Self {
        let replication_lock = Arc::new(tokio::sync::Mutex::new(()));
        let watcher =
            ReplicationWatcher::spawn(access, namespace, name, replication_lock.clone());
        Self {
            hashes: Mutex::new(ResourceHashes::default()),
            replication_lock,
            watcher,
        }
    }

    /// True when a hash was stored for `key` and `hash` differs from it
    pub fn hash_changed(&self, key: &str, hash: &str) -> bool {
        self.hashes
            .lock()
            .map(|h| h.changed(key, hash))
            .unwrap_or(false)
    }

    pub fn hash(&self, key: &str) -> Option<String> {
        self.hashes.lock().ok().and_then(|h| h.get(key).map(str::to_string))
    }

    pub fn set_hash(&self, key: &str, hash: &str) {
        if let Ok(mut hashes) = self.hashes.lock() {
            hashes.set(key, hash);
        }
    }
}

/// Sessions keyed by `namespace/name`
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<ObjectSession>>>,
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

impl SessionRegistry {
    pub fn get_or_create(
        &self,
        access: &ClusterAccess,
        namespace: &str,
        name: &str,
    ) -> Arc<ObjectSession> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions
            .entry(key(namespace, name))
            .or_insert_with(|| {
                debug!(namespace, name, "Creating object session");
                Arc::new(ObjectSession::new(access.clone(), namespace, name))
            })
            .clone()
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<ObjectSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key(namespace, name))
            .cloned()
    }

    /// Forget the session; its watcher stops once the last handle is gone
    pub fn remove(&self, namespace: &str, name: &str) {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&key(namespace, name));
        if let Some(session) = removed {
            session.watcher.pause();
            debug!(namespace, name, "Object session removed");
        }
    }
}
