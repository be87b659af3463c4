//! Live legacy connections, for routing between devices and apps.
//!
//! A connection is added when it binds an address and becomes routable once
//! its session starts. Routing asks for the Ready peers matching a predicate
//! and gets back owned handles, so no lock is held while sending.

use bumper_core::PrincipalKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// Sending side of a bound connection.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub conn_id: u64,
    pub kind: PrincipalKind,
    /// Device id or app user id.
    pub principal_id: String,
    pub address: String,
    tx: mpsc::UnboundedSender<String>,
}

impl PeerHandle {
    pub fn new(
        conn_id: u64,
        kind: PrincipalKind,
        principal_id: impl Into<String>,
        address: impl Into<String>,
        tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            conn_id,
            kind,
            principal_id: principal_id.into(),
            address: address.into(),
            tx,
        }
    }

    /// Queue a stanza for the peer's writer. False if the peer is gone.
    pub fn send(&self, stanza: String) -> bool {
        self.tx.send(stanza).is_ok()
    }

    /// Whether the principal id occurs in `target`, ignoring case.
    pub fn matches(&self, target: &str) -> bool {
        target
            .to_lowercase()
            .contains(&self.principal_id.to_lowercase())
    }
}

struct Entry {
    handle: PeerHandle,
    ready: bool,
    bound_at: Instant,
}

/// Process-wide table of bound legacy connections.
pub struct ConnectionManager {
    conns: RwLock<HashMap<u64, Entry>>,
    next_conn_id: AtomicU64,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a newly accepted connection.
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a connection at bind time; it is not routable until `mark_ready`.
    pub async fn add(&self, handle: PeerHandle) {
        info!(
            conn_id = handle.conn_id,
            kind = %handle.kind,
            address = %handle.address,
            "connection bound"
        );
        let entry = Entry {
            handle,
            ready: false,
            bound_at: Instant::now(),
        };
        self.conns.write().await.insert(entry.handle.conn_id, entry);
    }

    pub async fn mark_ready(&self, conn_id: u64) -> bool {
        match self.conns.write().await.get_mut(&conn_id) {
            Some(entry) => {
                entry.ready = true;
                debug!(conn_id, address = %entry.handle.address, "connection ready");
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, conn_id: u64) -> bool {
        match self.conns.write().await.remove(&conn_id) {
            Some(entry) => {
                info!(
                    conn_id,
                    address = %entry.handle.address,
                    bound_secs = entry.bound_at.elapsed().as_secs(),
                    "connection removed"
                );
                true
            }
            None => false,
        }
    }

    /// Handles of every Ready connection accepted by `pred`.
    pub async fn for_each_ready<F>(&self, pred: F) -> Vec<PeerHandle>
    where
        F: Fn(&PeerHandle) -> bool,
    {
        self.conns
            .read()
            .await
            .values()
            .filter(|e| e.ready && pred(&e.handle))
            .map(|e| e.handle.clone())
            .collect()
    }

    /// Number of bound connections.
    pub async fn count(&self) -> usize {
        self.conns.read().await.len()
    }
}
