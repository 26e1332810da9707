//! Connection pool
//!
//! At most one live connection per node address. A connection is replaced
//! when it has outlived its cluster's lifetime (only while no remote
//! transaction is open on it) or after a transport failure marked it broken.
//!
//! The pool does no I/O itself: opening and closing sessions goes through a
//! [`Connector`], which the dispatcher implements.
//!
//! # Capacity
//!
//! The total number of connections is capped at `limits.max_connections`.
//! When the cap is reached the pool first reaps idle connections that have
//! aged out, then rejects with `PoolExhausted`.

use crate::cluster::Cluster;
use parking_lot::Mutex;
use shardcall_core::{ProxyError, ProxyResult, RemoteSession, TransportError};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Opens and closes transport sessions for the pool
pub trait Connector {
    /// Open a session to `address`
    fn connect(&self, address: &str) -> Result<Box<dyn RemoteSession>, TransportError>;

    /// Close a session
    fn disconnect(&self, session: Box<dyn RemoteSession>);
}

/// A pooled connection, shared between the pool and the call using it
pub type SharedConnection = Arc<Mutex<Connection>>;

/// One live session to one node
pub struct Connection {
    id: u64,
    cluster: String,
    node: usize,
    address: String,
    session: Option<Box<dyn RemoteSession>>,
    depth: usize,
    connected_at: Instant,
    lifetime: Option<Duration>,
    broken: bool,
    last_function: String,
}

impl fmt::Debug for Connection {
    // The address carries credentials; never print it.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("cluster", &self.cluster)
            .field("node", &self.node)
            .field("depth", &self.depth)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Pool-assigned id, unique for the life of the pool
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cluster this connection belongs to
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Node index within the cluster
    pub fn node(&self) -> usize {
        self.node
    }

    /// Remote transaction nesting depth; 0 means no open transaction
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Record a new remote nesting depth
    pub fn set_depth(&mut self, depth: usize) {
        self.depth = depth;
    }

    /// When the session was opened
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// True when older than the cluster's lifetime at `now`
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.lifetime {
            Some(lifetime) => now.saturating_duration_since(self.connected_at) > lifetime,
            None => false,
        }
    }

    /// Mark the session unusable; the pool discards it
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// True after a transport failure or a failed cleanup
    pub fn is_broken(&self) -> bool {
        self.broken || self.session.is_none()
    }

    /// Last function that ran on this connection
    pub fn last_function(&self) -> &str {
        &self.last_function
    }

    /// The live session, `None` once closed
    pub fn session_mut(&mut self) -> Option<&mut (dyn RemoteSession + 'static)> {
        self.session.as_deref_mut()
    }

    fn should_retire(&self, now: Instant) -> bool {
        self.is_broken() || (self.depth == 0 && self.is_expired(now))
    }

    fn close(&mut self, connector: &dyn Connector) {
        if let Some(session) = self.session.take() {
            connector.disconnect(session);
        }
        self.depth = 0;
    }
}

/// Live connections keyed by node address
pub struct ConnectionPool {
    entries: HashMap<String, SharedConnection>,
    max_connections: usize,
    next_id: u64,
}

impl ConnectionPool {
    /// Empty pool holding at most `max_connections`
    pub fn new(max_connections: usize) -> Self {
        ConnectionPool {
            entries: HashMap::new(),
            max_connections,
            next_id: 1,
        }
    }

    /// Return the connection for `node` of `cluster`, opening or replacing
    /// it as needed. `function` is recorded for diagnostics.
    ///
    /// # Errors
    ///
    /// - `OutOfRange` if `node` is not a node of `cluster`
    /// - `PoolExhausted` if a new connection is needed and the pool is full
    /// - `RemoteQueryError` if the connect fails
    pub fn acquire(
        &mut self,
        cluster: &Cluster,
        node: usize,
        function: &str,
        now: Instant,
        connector: &dyn Connector,
    ) -> ProxyResult<SharedConnection> {
        let address = cluster.node_address(node).ok_or_else(|| ProxyError::OutOfRange {
            context: format!("cluster '{}'", cluster.name()),
            index: node as i64,
            node_count: cluster.node_count(),
        })?;

        if let Some(existing) = self.entries.get(address) {
            let retire = {
                let mut conn = existing.lock();
                if conn.should_retire(now) {
                    true
                } else {
                    conn.last_function = function.to_string();
                    false
                }
            };
            if !retire {
                return Ok(Arc::clone(existing));
            }
            if let Some(old) = self.entries.remove(address) {
                let mut conn = old.lock();
                debug!(
                    target: "shardcall::pool",
                    conn_id = conn.id,
                    cluster = %conn.cluster,
                    node = conn.node,
                    broken = conn.is_broken(),
                    "Retiring connection"
                );
                conn.close(connector);
            }
        }

        if self.entries.len() >= self.max_connections {
            self.reap_expired(now, connector);
        }
        if self.entries.len() >= self.max_connections {
            warn!(
                target: "shardcall::pool",
                max = self.max_connections,
                cluster = %cluster.name(),
                node,
                "Connection pool exhausted"
            );
            return Err(ProxyError::PoolExhausted {
                max: self.max_connections,
            });
        }

        let session = connector
            .connect(address)
            .map_err(|e| ProxyError::RemoteQueryError {
                function: function.to_string(),
                cluster: cluster.name().to_string(),
                node,
                message: e.to_string(),
            })?;

        let id = self.next_id;
        self.next_id += 1;
        info!(
            target: "shardcall::pool",
            conn_id = id,
            cluster = %cluster.name(),
            node,
            "Connected"
        );
        let conn = Arc::new(Mutex::new(Connection {
            id,
            cluster: cluster.name().to_string(),
            node,
            address: address.to_string(),
            session: Some(session),
            depth: 0,
            connected_at: now,
            lifetime: cluster.connection_lifetime(),
            broken: false,
            last_function: function.to_string(),
        }));
        self.entries.insert(address.to_string(), Arc::clone(&conn));
        Ok(conn)
    }

    /// Close and remove a connection. A no-op when the pool already holds a
    /// different connection for the same address.
    ///
    /// The caller must not hold the connection's lock.
    pub fn discard(&mut self, conn: &SharedConnection, connector: &dyn Connector) {
        let mut guard = conn.lock();
        let ours = self
            .entries
            .get(&guard.address)
            .map_or(false, |c| Arc::ptr_eq(c, conn));
        if ours {
            self.entries.remove(&guard.address);
        }
        debug!(
            target: "shardcall::pool",
            conn_id = guard.id,
            cluster = %guard.cluster,
            node = guard.node,
            "Discarding connection"
        );
        guard.close(connector);
    }

    /// Close idle connections past their lifetime; returns how many
    pub fn reap_expired(&mut self, now: Instant, connector: &dyn Connector) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, c)| c.lock().should_retire(now))
            .map(|(address, _)| address.clone())
            .collect();
        for address in &expired {
            if let Some(conn) = self.entries.remove(address) {
                conn.lock().close(connector);
            }
        }
        if !expired.is_empty() {
            debug!(target: "shardcall::pool", count = expired.len(), "Reaped expired connections");
        }
        expired.len()
    }

    /// Every pooled connection
    pub fn connections(&self) -> Vec<SharedConnection> {
        self.entries.values().cloned().collect()
    }

    /// Close everything
    pub fn close_all(&mut self, connector: &dyn Connector) {
        for (_, conn) in self.entries.drain() {
            conn.lock().close(connector);
        }
    }

    /// Number of pooled connections
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the pool is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured maximum
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}
