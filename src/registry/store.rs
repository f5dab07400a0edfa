//! Connection registry
//!
//! Tracks every open connection and the identity → connection mapping used
//! for directed delivery. Shared by all connection tasks, the router and the
//! liveness monitor.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{ConnectionHandle, ConnectionId};

#[derive(Default)]
struct RegistryInner {
    /// All open connections, identified or not
    connections: HashMap<ConnectionId, ConnectionHandle>,
    /// At most one entry per identity; last write wins
    identities: HashMap<String, ConnectionHandle>,
}

impl RegistryInner {
    fn remove(&mut self, handle: &ConnectionHandle) -> bool {
        let attached = self.connections.remove(&handle.id()).is_some();

        // Only drop the identity if a newer connection has not taken it over
        if let Some(identity) = handle.identity() {
            let owned = self
                .identities
                .get(identity)
                .is_some_and(|current| current.id() == handle.id());
            if owned {
                self.identities.remove(identity);
            }
        }

        attached
    }
}

/// Registry of live connections
///
/// The ConnectionRegistry is the single source of "who is online". It:
/// - Holds a handle for every open connection (the broadcast set)
/// - Maps identities to handles for directed delivery
/// - Never closes a connection; handles only queue frames
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to the broadcast set
    pub async fn attach(&self, handle: ConnectionHandle) {
        let mut inner = self.inner.write().await;
        inner.connections.insert(handle.id(), handle);
    }

    /// Insert or overwrite the entry for `identity`.
    ///
    /// Returns the handle previously mapped to the identity. That connection
    /// stays open but is no longer reachable by identity.
    pub async fn register(
        &self,
        identity: impl Into<String>,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let identity = identity.into();
        let mut inner = self.inner.write().await;
        let previous = inner.identities.insert(identity.clone(), handle);
        if let Some(prev) = &previous {
            debug!("Identity {} moved off connection {}", identity, prev.id());
        }
        previous
    }

    /// Look up the connection currently registered under `identity`
    pub async fn lookup(&self, identity: &str) -> Option<ConnectionHandle> {
        self.inner.read().await.identities.get(identity).cloned()
    }

    /// Remove the entry for `identity` regardless of which connection owns it.
    /// Removing an absent identity is a no-op.
    #[allow(dead_code)]
    pub async fn unregister(&self, identity: &str) -> Option<ConnectionHandle> {
        self.inner.write().await.identities.remove(identity)
    }

    /// Remove a connection and, if its identity still points at it, the
    /// identity entry too. Idempotent.
    ///
    /// This is the cleanup the connection lifecycle uses on close. Unlike
    /// [`unregister`](Self::unregister) it is owner-checked, so a stale close
    /// cannot remove the entry of a newer connection under the same identity.
    ///
    /// Returns true if the connection was still attached.
    pub async fn release(&self, handle: &ConnectionHandle) -> bool {
        let mut inner = self.inner.write().await;
        inner.remove(handle)
    }

    /// Release every connection whose task has exited without cleaning up.
    ///
    /// Returns the number of connections removed.
    pub async fn prune_closed(&self) -> usize {
        let mut inner = self.inner.write().await;
        let closed: Vec<ConnectionHandle> = inner
            .connections
            .values()
            .filter(|handle| !handle.is_open())
            .cloned()
            .collect();

        for handle in &closed {
            inner.remove(handle);
        }
        closed.len()
    }

    /// Number of identity entries
    pub async fn size(&self) -> usize {
        self.inner.read().await.identities.len()
    }

    /// Number of open connections, identified or not
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Snapshot of the open connections.
    ///
    /// Handles whose task has already exited are skipped; the snapshot may
    /// still go stale while the caller iterates it.
    pub async fn snapshot(&self) -> Vec<ConnectionHandle> {
        let inner = self.inner.read().await;
        inner
            .connections
            .values()
            .filter(|handle| handle.is_open())
            .cloned()
            .collect()
    }
}
