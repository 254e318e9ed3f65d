//! Shared transport clients
//!
//! Devices behind the same physical connection (one serial line, one
//! gateway host:port) share a single client. Entries are reference counted;
//! the client is disconnected and dropped when its last holder releases it.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::core::client::TransportClient;
use crate::core::config::ConnectionKey;
use crate::error::Result;

/// A transport client behind its exclusive-access lock
pub type SharedClient = Arc<Mutex<Box<dyn TransportClient>>>;

struct PoolEntry {
    client: SharedClient,
    refs: usize,
}

/// Reference-counted client cache keyed by physical connection
#[derive(Default)]
pub struct ConnectionPool {
    entries: DashMap<ConnectionKey, PoolEntry>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.entries.len())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the client for `key`, building it with `factory` on first use
    pub fn acquire<F>(&self, key: &ConnectionKey, factory: F) -> Result<SharedClient>
    where
        F: FnOnce() -> Result<Box<dyn TransportClient>>,
    {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let entry = entry.get_mut();
                entry.refs += 1;
                debug!("Reusing connection {} (refs={})", key, entry.refs);
                Ok(Arc::clone(&entry.client))
            },
            Entry::Vacant(slot) => {
                let client: SharedClient = Arc::new(Mutex::new(factory()?));
                slot.insert(PoolEntry {
                    client: Arc::clone(&client),
                    refs: 1,
                });
                debug!("New connection {}", key);
                Ok(client)
            },
        }
    }

    /// Drop one reference. Returns `true` when the client was torn down.
    pub async fn release(&self, key: &ConnectionKey) -> bool {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.refs = entry.refs.saturating_sub(1);
        }
        let Some((_, entry)) = self.entries.remove_if(key, |_, e| e.refs == 0) else {
            return false;
        };
        let mut client = entry.client.lock().await;
        client.disconnect().await;
        info!("Connection {} closed", key);
        true
    }

    /// Current holders of `key`
    pub fn refs(&self, key: &ConnectionKey) -> usize {
        self.entries.get(key).map(|e| e.refs).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<ConnectionKey> {
        let mut keys: Vec<_> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::config::ConnectionConfig;
    use crate::core::registry::build_client;
    use std::time::Duration;

    fn tcp(port: u16) -> ConnectionConfig {
        ConnectionConfig::ModbusTcp {
            host: "127.0.0.1".into(),
            port,
            slave_id: 1,
        }
    }

    #[tokio::test]
    async fn test_shared_until_last_release() {
        let pool = ConnectionPool::new();
        let conn = tcp(1502);
        let key = conn.key();
        let timeout = Duration::from_millis(100);

        let a = pool.acquire(&key, || build_client(&conn, timeout)).unwrap();
        let b = pool
            .acquire(&key, || panic!("factory must not run for a pooled key"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.refs(&key), 2);

        assert!(!pool.release(&key).await);
        assert_eq!(pool.refs(&key), 1);
        assert!(pool.release(&key).await);
        assert!(pool.is_empty());
        assert!(!pool.release(&key).await);
    }

    #[tokio::test]
    async fn test_distinct_keys_get_distinct_clients() {
        let pool = ConnectionPool::new();
        let timeout = Duration::from_millis(100);
        let (c1, c2) = (tcp(1502), tcp(1503));
        let a = pool.acquire(&c1.key(), || build_client(&c1, timeout)).unwrap();
        let b = pool.acquire(&c2.key(), || build_client(&c2, timeout)).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.keys(), vec![c1.key(), c2.key()]);
    }

    #[test]
    fn test_factory_error_leaves_pool_empty() {
        let pool = ConnectionPool::new();
        let key = ConnectionKey("snmp:h:161:public".into());
        let result = pool.acquire(&key, || {
            Err(crate::error::PollSrvError::unsupported("SNMPv3 is not supported"))
        });
        assert!(result.is_err());
        assert!(pool.is_empty());
    }
}
