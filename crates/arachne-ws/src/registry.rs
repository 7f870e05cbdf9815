//! Registry of live connections.
//!
//! `connections: RwLock<FxHashMap<ConnectionId, Arc<Connection>>>`. Every
//! open connection is present exactly once; the server adds on upgrade and
//! removes on teardown. Broadcast iterates a [`snapshot`](ConnectionRegistry::snapshot)
//! taken under the read lock and released before any write happens, so a
//! callback that closes or opens connections mid-broadcast cannot deadlock
//! or invalidate the iteration.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::connection::{Connection, ConnectionId};

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<FxHashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            connections: RwLock::new(FxHashMap::default()),
        }
    }

    /// Register a connection. Returns `false` (and keeps the existing entry)
    /// if the id is already taken.
    pub(crate) fn add(&self, conn: Arc<Connection>) -> bool {
        let mut connections = self.connections.write();
        if connections.contains_key(conn.id()) {
            return false;
        }
        connections.insert(conn.id().clone(), conn);
        true
    }

    /// Remove a connection by id. Only the first removal returns it.
    pub(crate) fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.write().remove(id)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(id).cloned()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// The current members. The read lock is released before this returns.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.read().keys().cloned().collect()
    }
}
