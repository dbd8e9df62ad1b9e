//! Connection registry: routes inbound native events to live adapters.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Thread-safe map from a flow's local (TUN-side) endpoint to its adapter.
///
/// Entries are inserted on flow creation and removed exactly once, by the
/// adapter's own close path; the registry never initiates removal. Its
/// synchronization is independent of any adapter lock and must never be
/// acquired while one is held.
pub struct ConnectionRegistry<C> {
    conns: DashMap<SocketAddr, Arc<C>>,
}

impl<C> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
        }
    }

    pub fn insert(&self, key: SocketAddr, conn: Arc<C>) {
        self.conns.insert(key, conn);
    }

    pub fn get(&self, key: &SocketAddr) -> Option<Arc<C>> {
        self.conns.get(key).map(|entry| entry.clone())
    }

    pub fn remove(&self, key: &SocketAddr) -> Option<Arc<C>> {
        self.conns.remove(key).map(|(_, conn)| conn)
    }

    pub fn contains(&self, key: &SocketAddr) -> bool {
        self.conns.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

impl<C> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_lookup_remove_once() {
        let registry: ConnectionRegistry<String> = ConnectionRegistry::new();
        let key: SocketAddr = "10.0.0.2:5353".parse().unwrap();

        registry.insert(key, Arc::new("conn".to_string()));
        assert!(registry.contains(&key));
        assert_eq!(registry.len(), 1);
        assert_eq!(*registry.get(&key).unwrap(), "conn");

        assert!(registry.remove(&key).is_some());
        assert!(registry.remove(&key).is_none());
        assert!(registry.is_empty());
    }
}
