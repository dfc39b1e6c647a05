//! Per-endpoint connection reuse.
//!
//! Connections are established lazily and returned to a per-endpoint idle
//! list after use, so keys within one run share connections instead of
//! reconnecting per command. Workers never share a live connection; the pool
//! hands out exclusive ownership.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use crate::endpoint::Endpoint;

use super::{ClientError, Connection};

/// Aggregated pool counters.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Connections established over the pool's lifetime.
    pub connected: u64,
    /// Acquisitions satisfied from the idle list.
    pub reused: u64,
}

/// Task-safe pool of connections keyed by endpoint.
#[derive(Debug)]
pub struct ConnectionPool {
    idle: Mutex<HashMap<Endpoint, Vec<Connection>>>,
    connected: AtomicU64,
    reused: AtomicU64,
}

impl ConnectionPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            connected: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Acquire a connection to `endpoint`, reusing an idle one when present.
    /// The caller owns the connection until it is [`release`](Self::release)d.
    pub async fn acquire(&self, endpoint: &Endpoint) -> Result<Connection, ClientError> {
        if let Some(conn) = self
            .idle
            .lock()
            .await
            .get_mut(endpoint)
            .and_then(Vec::pop)
        {
            self.reused.fetch_add(1, Ordering::Relaxed);
            return Ok(conn);
        }
        let conn = Connection::connect(endpoint).await?;
        self.connected.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    /// Return a healthy connection for reuse. Connections that errored should
    /// be dropped instead.
    pub async fn release(&self, conn: Connection) {
        self.idle
            .lock()
            .await
            .entry(conn.endpoint().clone())
            .or_default()
            .push(conn);
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            connected: self.connected.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}
