//! Connection pool
//!
//! Bookkeeping for the connections a relay has accepted and not yet closed.
//! The pool is a plain arena keyed by [`ConnToken`]; the relay keeps it behind
//! its own mutex together with the running flag, so all locking happens in
//! one place (see `Relay::store_conn` and friends).

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

use crate::endpoint::Protocol;

/// Identifies one pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnToken(u64);

/// Handle to a live accepted connection
///
/// Cloning is cheap. [`ConnHandle::close`] asks the owning handler to drop
/// both sockets; the handler then removes the entry from the pool itself.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    peer: SocketAddr,
    local: SocketAddr,
    network: Protocol,
    closer: Arc<watch::Sender<bool>>,
}

/// Receiving side of [`ConnHandle::close`], held by the connection handler
#[derive(Debug)]
pub struct CloseSignal(watch::Receiver<bool>);

impl ConnHandle {
    /// Create a handle and the signal its handler waits on
    pub fn new(peer: SocketAddr, local: SocketAddr, network: Protocol) -> (Self, CloseSignal) {
        let (tx, rx) = watch::channel(false);
        let handle = Self {
            peer,
            local,
            network,
            closer: Arc::new(tx),
        };
        (handle, CloseSignal(rx))
    }

    /// Address of the client
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Address the client connected to
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Transport of the accepted connection
    pub fn network(&self) -> Protocol {
        self.network
    }

    /// Force the connection closed
    pub fn close(&self) {
        self.closer.send_replace(true);
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        *self.closer.borrow()
    }
}

impl CloseSignal {
    /// Resolve once the connection has been asked to close
    pub async fn closed(&mut self) {
        if self.0.wait_for(|closed| *closed).await.is_err() {
            // Every handle is gone, nobody can close us any more
            std::future::pending::<()>().await;
        }
    }
}

/// One live connection and its metadata
#[derive(Debug, Clone)]
pub struct PooledConnection {
    /// Token the owning handler uses to update or remove the entry
    pub token: ConnToken,
    /// Handle to the accepted connection
    pub conn: ConnHandle,
    /// Destination address, filled in once a dial succeeds
    pub remote_addr: Option<String>,
    /// When the connection was accepted
    pub opened_at: DateTime<Utc>,
}

/// Arena of live connections
#[derive(Debug, Default)]
pub struct ConnectionPool {
    next: u64,
    entries: BTreeMap<ConnToken, PooledConnection>,
}

impl ConnectionPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an accepted connection
    pub fn store(&mut self, conn: ConnHandle) -> ConnToken {
        let token = ConnToken(self.next);
        self.next += 1;

        self.entries.insert(
            token,
            PooledConnection {
                token,
                conn,
                remote_addr: None,
                opened_at: Utc::now(),
            },
        );
        token
    }

    /// Remove a connection, returning its entry if it was present
    pub fn remove(&mut self, token: ConnToken) -> Option<PooledConnection> {
        self.entries.remove(&token)
    }

    /// Record the destination a connection was relayed to
    pub fn update_remote(&mut self, token: ConnToken, remote: &str) -> bool {
        match self.entries.get_mut(&token) {
            Some(entry) => {
                entry.remote_addr = Some(remote.to_string());
                true
            }
            None => false,
        }
    }

    /// Copy of every live entry, oldest first
    pub fn snapshot(&self) -> Vec<PooledConnection> {
        self.entries.values().cloned().collect()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
