//! The set of live connections.
//!
//! Structural changes take the write lock; fanout iterates under the read
//! lock, so broadcasts from different clients overlap freely while never
//! observing a half-inserted entry. A removed connection is marked closed
//! while the write lock is held, so a delivery racing with the removal sees
//! it as unwritable and skips it.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::{RwLock, mpsc};

use crate::connection::{Connection, ConnectionId, Frame};

/// Outcome of a visit over the registry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Visit {
    pub visited: usize,
    pub failed: usize,
}

pub struct Registry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new connection under the next id. Ids start at 1 and are
    /// never handed out twice by the same registry.
    pub async fn add(
        &self,
        peer: impl Into<String>,
        outbound: mpsc::Sender<Frame>,
    ) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Connection::new(id, peer.into(), outbound));

        let mut connections = self.connections.write().await;
        connections.insert(id, Arc::clone(&connection));
        connection
    }

    /// Removes and closes a connection. Unknown ids are ignored.
    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut connections = self.connections.write().await;
        let removed = connections.remove(&id)?;
        removed.close();
        Some(removed)
    }

    /// Calls `f` for every live connection except `exclude`. A failure for
    /// one connection is counted and iteration carries on.
    pub async fn for_each_except<F, E>(&self, exclude: ConnectionId, mut f: F) -> Visit
    where
        F: FnMut(&Connection) -> Result<(), E>,
    {
        let connections = self.connections.read().await;
        let mut visit = Visit::default();
        for connection in connections.values().filter(|c| c.id() != exclude) {
            visit.visited += 1;
            if f(connection).is_err() {
                visit.failed += 1;
            }
        }
        visit
    }

    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Connection),
    {
        let connections = self.connections.read().await;
        connections.values().for_each(|connection| f(connection));
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
