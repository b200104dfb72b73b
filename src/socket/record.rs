//! Per-socket bookkeeping and the destination key index.

use crate::socket::conn::{PooledConn, SocketPipe};
use crate::socket::dest::DestKey;
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

/// Stable integer handle for a pooled socket.
///
/// Handles are monotonic and never reused, so an absent id below the
/// allocation watermark is known to be a retired socket rather than a
/// forged one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Caller-scoped token used only to bias dispatch priority.
///
/// Sessions never own sockets; removal closes nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Session(u64);

impl Session {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }
}

/// Lifecycle state of a pooled socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    /// Transport connect in flight.
    Connecting,
    /// Connected; the enable hook holds the connection for setup.
    Enabling,
    /// Idle in the pool, ready for reuse.
    Available,
    /// Checked out to a lease holder.
    Acquired,
}

/// One pooled socket, owned exclusively by the pool while present.
///
/// `conn` is populated only while the pool itself holds the connection
/// value: while `Available`. During `Connecting` it does not exist yet;
/// during `Enabling` the hook holds it; during `Acquired` the lease does.
pub struct SocketRecord {
    pub id: SocketId,
    pub key: DestKey,
    pub status: SocketStatus,
    pub session: Option<Session>,
    pub reusable: bool,
    pub conn: Option<Box<dyn PooledConn>>,
    pub pipe: Option<Box<dyn SocketPipe>>,
    pub idle_since: Option<Instant>,
}

impl SocketRecord {
    pub fn new(id: SocketId, key: DestKey, session: Option<Session>, reusable: bool) -> Self {
        Self {
            id,
            key,
            status: SocketStatus::Connecting,
            session,
            reusable,
            conn: None,
            pipe: None,
            idle_since: None,
        }
    }
}

impl fmt::Debug for SocketRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketRecord")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("status", &self.status)
            .field("session", &self.session)
            .field("reusable", &self.reusable)
            .field("has_conn", &self.conn.is_some())
            .field("has_pipe", &self.pipe.is_some())
            .finish()
    }
}

/// Maps each normalized destination key to the records serving it.
///
/// Reuse lookup is O(matching set); no scan of unrelated destinations.
#[derive(Debug, Default)]
pub struct KeyIndex {
    map: HashMap<DestKey, Vec<SocketId>>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: DestKey, id: SocketId) {
        self.map.entry(key).or_default().push(id);
    }

    /// Remove one id from a key's set, dropping the key once empty.
    /// Removing an id that was already removed is a no-op.
    pub fn remove(&mut self, key: &DestKey, id: SocketId) {
        if let Some(ids) = self.map.get_mut(key) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.map.remove(key);
            }
        }
    }

    /// Ids currently registered under a key.
    pub fn ids(&self, key: &DestKey) -> &[SocketId] {
        self.map.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn key_count(&self) -> usize {
        self.map.len()
    }
}
