//! The pool controller: admission, matching, eviction, and dispatch.
//!
//! All bookkeeping lives behind one mutex. Every structural mutation (queue
//! edit, status change, index update) completes inside a single critical
//! section before any continuation observes it; waiting callers are woken
//! through `oneshot` channels, and side effects that may reenter the pool
//! (hook invocation, transport disposal, connect spawning) are deferred
//! until after the guard drops.

use crate::base::error::PoolError;
use crate::socket::conn::{ClosedSignal, PooledConn, SocketPipe, Transport};
use crate::socket::dest::{DestKey, Destination};
use crate::socket::record::{KeyIndex, Session, SocketId, SocketRecord, SocketStatus};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard cap on simultaneously open sockets.
    pub max_sockets: usize,
    /// How long a released socket may sit idle before the reaper closes it.
    pub idle_timeout: Duration,
    /// How often the background reaper runs.
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sockets: 64,
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(60),
        }
    }
}

/// A checked-out socket: the connection value, its optional pipe, and the
/// stable id to present back on release.
pub struct Lease {
    id: SocketId,
    conn: Box<dyn PooledConn>,
    pipe: Option<Box<dyn SocketPipe>>,
    reused: bool,
}

impl Lease {
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// True when the lease was satisfied from an existing socket rather
    /// than a fresh connect.
    pub fn reused(&self) -> bool {
        self.reused
    }

    pub fn conn(&self) -> &dyn PooledConn {
        &*self.conn
    }

    pub fn conn_mut(&mut self) -> &mut dyn PooledConn {
        &mut *self.conn
    }

    pub fn pipe(&self) -> Option<&dyn SocketPipe> {
        self.pipe.as_deref()
    }

    pub fn pipe_mut(&mut self) -> Option<&mut (dyn SocketPipe + 'static)> {
        self.pipe.as_deref_mut()
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("reused", &self.reused)
            .field("has_pipe", &self.pipe.is_some())
            .finish()
    }
}

/// Post-connect setup extension point.
///
/// When registered, every freshly connected socket is handed here instead of
/// straight to its requester. The hook owns the connection for the duration
/// of the enable phase and must eventually call
/// [`SocketPool::enable_socket`] (returning the connection, possibly
/// wrapped) or [`SocketPool::reject_socket`].
pub trait ConnectHook: Send + Sync + 'static {
    fn on_socket_connected(&self, pool: SocketPool, id: SocketId, conn: Box<dyn PooledConn>);
}

/// A queued acquisition waiting for dispatch.
struct PendingAcquire {
    dest: Destination,
    key: DestKey,
    reuse: bool,
    session: Option<Session>,
    tx: oneshot::Sender<Result<Lease, PoolError>>,
}

/// Side effects collected under the lock, executed after it drops.
enum Deferred {
    Connect {
        id: SocketId,
        dest: Destination,
    },
    Watch {
        id: SocketId,
        closed: ClosedSignal,
    },
    Enable {
        hook: Arc<dyn ConnectHook>,
        id: SocketId,
        conn: Box<dyn PooledConn>,
    },
    Dispose {
        conn: Option<Box<dyn PooledConn>>,
        pipe: Option<Box<dyn SocketPipe>>,
    },
    Redispatch,
}

struct PoolState {
    max_sockets: usize,
    idle_timeout: Duration,
    records: HashMap<SocketId, SocketRecord>,
    index: KeyIndex,
    queue: VecDeque<PendingAcquire>,
    /// Requests riding an in-flight connect or enable phase, by record id.
    pending: HashMap<SocketId, PendingAcquire>,
    sessions: HashSet<Session>,
    hook: Option<Arc<dyn ConnectHook>>,
    next_socket: u64,
    next_session: u64,
}

struct Shared {
    state: Mutex<PoolState>,
    transport: Arc<dyn Transport>,
    reap_interval: Duration,
}

/// Manages outbound sockets under a global socket cap.
///
/// Cheap to clone; all clones share the same pool.
#[derive(Clone)]
pub struct SocketPool {
    shared: Arc<Shared>,
}

impl fmt::Debug for SocketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("SocketPool")
            .field("max_sockets", &state.max_sockets)
            .field("active", &state.records.len())
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl SocketPool {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, PoolConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: PoolConfig) -> Self {
        let max_sockets = config.max_sockets.max(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    max_sockets,
                    idle_timeout: config.idle_timeout,
                    records: HashMap::new(),
                    index: KeyIndex::new(),
                    queue: VecDeque::new(),
                    pending: HashMap::new(),
                    sessions: HashSet::new(),
                    hook: None,
                    next_socket: 0,
                    next_session: 0,
                }),
                transport,
                reap_interval: config.reap_interval,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // A panicked holder cannot leave the structures half-mutated in a
        // way later passes cannot tolerate, so recover from poisoning.
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register the enable hook. Sockets connected from now on go through
    /// the enable phase before becoming usable.
    pub fn set_connect_hook(&self, hook: Arc<dyn ConnectHook>) {
        self.lock().hook = Some(hook);
    }

    /// Unregister the enable hook. Sockets already in their enable phase
    /// still complete through `enable_socket`/`reject_socket`.
    pub fn clear_connect_hook(&self) {
        self.lock().hook = None;
    }

    /// Create a session token for a batch of related acquisitions.
    pub fn new_session(&self) -> Session {
        let mut state = self.lock();
        let session = Session::new(state.next_session);
        state.next_session += 1;
        state.sessions.insert(session);
        session
    }

    /// Drop a session. Closes nothing; requests and sockets tagged with it
    /// simply lose their priority bias and become plain unscoped work.
    pub fn remove_session(&self, session: Session) {
        let mut deferred = Vec::new();
        {
            let mut state = self.lock();
            state.sessions.remove(&session);
            for rec in state.records.values_mut() {
                if rec.session == Some(session) {
                    rec.session = None;
                }
            }
            for req in state.queue.iter_mut() {
                if req.session == Some(session) {
                    req.session = None;
                }
            }
            for req in state.pending.values_mut() {
                if req.session == Some(session) {
                    req.session = None;
                }
            }
            Self::dispatch_locked(&mut state, &mut deferred, None);
        }
        self.run_deferred(deferred);
    }

    /// Change the socket cap. Takes effect on future admission and eviction
    /// decisions only; nothing is closed here even if the active count now
    /// exceeds the cap.
    pub fn set_max_sockets(&self, max: usize) {
        if max == 0 {
            tracing::warn!("ignoring max_sockets = 0");
            return;
        }
        let mut deferred = Vec::new();
        {
            let mut state = self.lock();
            state.max_sockets = max;
            // A raised cap may unblock queued requests.
            Self::dispatch_locked(&mut state, &mut deferred, None);
        }
        self.run_deferred(deferred);
    }

    pub fn max_sockets(&self) -> usize {
        self.lock().max_sockets
    }

    /// Total records (connecting, enabling, available, acquired).
    pub fn active_count(&self) -> usize {
        self.lock().records.len()
    }

    /// Sockets sitting idle, ready for reuse.
    pub fn idle_count(&self) -> usize {
        self.lock()
            .records
            .values()
            .filter(|r| r.status == SocketStatus::Available)
            .count()
    }

    /// Requests still waiting in the queue.
    pub fn queued_count(&self) -> usize {
        self.lock().queue.len()
    }

    /// Sessions currently registered.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Acquire a socket to `dest`, optionally under a session.
    ///
    /// Resolves with a [`Lease`] once a matching socket is available or a
    /// fresh connect (plus enable phase, when hooked) completes. With
    /// `allow_reuse` false the request never matches an existing socket and
    /// the socket it spawns is disposed of on release instead of pooled.
    ///
    /// Dropping the returned future abandons the request; the pool notices
    /// at resolution time and pools or disposes of the socket instead.
    pub async fn acquire(
        &self,
        dest: Destination,
        allow_reuse: bool,
        session: Option<Session>,
    ) -> Result<Lease, PoolError> {
        // Validation failures reject synchronously, before any state change.
        dest.validate()?;
        let key = dest.key();
        let (tx, rx) = oneshot::channel();

        let mut deferred = Vec::new();
        {
            let mut state = self.lock();
            tracing::debug!(key = %key, session = ?session, reuse = allow_reuse, "acquire queued");
            state.queue.push_back(PendingAcquire {
                dest,
                key,
                reuse: allow_reuse,
                session,
                tx,
            });
            Self::dispatch_locked(&mut state, &mut deferred, session);
        }
        self.run_deferred(deferred);

        rx.await.map_err(|_| PoolError::Shutdown)?
    }

    /// Complete the enable phase for `id`, returning the connection the
    /// hook received (possibly wrapped, e.g. a TLS upgrade) and the pipe it
    /// attached.
    ///
    /// Legal only while the record is `Enabling`; anything else is a
    /// contract violation and leaves the pool untouched.
    pub fn enable_socket(
        &self,
        id: SocketId,
        conn: Box<dyn PooledConn>,
        pipe: Option<Box<dyn SocketPipe>>,
    ) -> Result<(), PoolError> {
        let mut deferred = Vec::new();
        let result = {
            let mut state = self.lock();
            match state.records.get(&id).map(|r| r.status) {
                Some(SocketStatus::Enabling) => {
                    match state.pending.remove(&id) {
                        Some(req) => {
                            let scope = req.session;
                            if let Some(rec) = state.records.get_mut(&id) {
                                rec.status = SocketStatus::Acquired;
                                rec.session = req.session;
                            }
                            tracing::debug!(socket = %id, "enabled, resolving waiting request");
                            if let Err(Ok(lease)) = req.tx.send(Ok(Lease {
                                id,
                                conn,
                                pipe,
                                reused: false,
                            })) {
                                // Requester gave up while we were enabling.
                                Self::park_or_dispose(
                                    &mut state,
                                    &mut deferred,
                                    id,
                                    lease.conn,
                                    lease.pipe,
                                );
                            }
                            Self::dispatch_locked(&mut state, &mut deferred, scope);
                            Ok(())
                        }
                        None => {
                            // Enabled speculatively, nobody claimed it yet:
                            // park it so the next dispatch pass can match it.
                            let scope = state.records.get(&id).and_then(|r| r.session);
                            tracing::debug!(socket = %id, "enabled with no claimant, parking");
                            Self::park_or_dispose(&mut state, &mut deferred, id, conn, pipe);
                            Self::dispatch_locked(&mut state, &mut deferred, scope);
                            Ok(())
                        }
                    }
                }
                Some(other) => {
                    tracing::warn!(socket = %id, status = ?other, "enable_socket outside enable phase");
                    deferred.push(Deferred::Dispose {
                        conn: Some(conn),
                        pipe,
                    });
                    Err(PoolError::usage(format!(
                        "enable_socket: socket {id} is {other:?}, not enabling"
                    )))
                }
                None => {
                    deferred.push(Deferred::Dispose {
                        conn: Some(conn),
                        pipe,
                    });
                    Err(PoolError::usage(format!(
                        "enable_socket: unknown socket {id}"
                    )))
                }
            }
        };
        self.run_deferred(deferred);
        result
    }

    /// Fail the enable phase for `id`.
    ///
    /// Treated exactly like a transport connect failure: the record is
    /// removed first, the waiting request falls back to an available
    /// same-key socket when one exists, and only otherwise is it rejected.
    pub fn reject_socket(&self, id: SocketId, reason: impl Into<String>) -> Result<(), PoolError> {
        let reason = reason.into();
        let mut deferred = Vec::new();
        let result = {
            let mut state = self.lock();
            match state.records.get(&id).map(|r| r.status) {
                Some(SocketStatus::Enabling) => {
                    let (rec, pend) = Self::remove_record(&mut state, id);
                    if let Some(mut rec) = rec {
                        deferred.push(Deferred::Dispose {
                            conn: rec.conn.take(),
                            pipe: rec.pipe.take(),
                        });
                    }
                    let scope = pend.as_ref().and_then(|p| p.session);
                    if let Some(req) = pend {
                        let fallback = if req.reuse {
                            Self::find_available(&mut state, &mut deferred, &req.key)
                        } else {
                            None
                        };
                        if let Some(rid) = fallback {
                            tracing::debug!(key = %req.key, "enable rejected, absorbed by available socket");
                            Self::serve_from_record(&mut state, &mut deferred, rid, req);
                        } else {
                            tracing::debug!(socket = %id, reason = %reason, "enable rejected");
                            let _ = req.tx.send(Err(PoolError::EnableRejected {
                                dest: req.dest.label(),
                                reason: reason.clone(),
                            }));
                        }
                    }
                    Self::dispatch_locked(&mut state, &mut deferred, scope);
                    Ok(())
                }
                Some(other) => Err(PoolError::usage(format!(
                    "reject_socket: socket {id} is {other:?}, not enabling"
                ))),
                None => Err(PoolError::usage(format!(
                    "reject_socket: unknown socket {id}"
                ))),
            }
        };
        self.run_deferred(deferred);
        result
    }

    /// Return a leased socket for reuse.
    ///
    /// A dead or non-reusable connection is disposed of instead of pooled.
    /// Releasing a socket the closed observer already reclaimed is a no-op;
    /// presenting a still-connected lease the pool does not know is a
    /// contract violation.
    pub fn release(&self, lease: Lease) -> Result<(), PoolError> {
        let Lease {
            id, mut conn, pipe, ..
        } = lease;
        let mut deferred = Vec::new();
        let result = {
            let mut state = self.lock();
            match state.records.get(&id).map(|r| r.status) {
                Some(SocketStatus::Acquired) => {
                    let scope = state.records.get(&id).and_then(|r| r.session);
                    tracing::debug!(socket = %id, "released");
                    Self::park_or_dispose(&mut state, &mut deferred, id, conn, pipe);
                    Self::dispatch_locked(&mut state, &mut deferred, scope);
                    Ok(())
                }
                Some(other) => {
                    deferred.push(Deferred::Dispose {
                        conn: Some(conn),
                        pipe,
                    });
                    Err(PoolError::usage(format!(
                        "release: socket {id} is {other:?}, not acquired"
                    )))
                }
                None => {
                    if conn.is_connected() {
                        deferred.push(Deferred::Dispose {
                            conn: Some(conn),
                            pipe,
                        });
                        Err(PoolError::usage(format!("release: unknown socket {id}")))
                    } else {
                        // Already reclaimed by the closed observer.
                        conn.start_close();
                        deferred.push(Deferred::Dispose {
                            conn: Some(conn),
                            pipe,
                        });
                        Ok(())
                    }
                }
            }
        };
        self.run_deferred(deferred);
        result
    }

    /// Dispose of a leased socket instead of pooling it.
    pub fn discard(&self, lease: Lease) -> Result<(), PoolError> {
        let Lease {
            id, mut conn, pipe, ..
        } = lease;
        let mut deferred = Vec::new();
        let result = {
            let mut state = self.lock();
            match state.records.get(&id).map(|r| r.status) {
                Some(SocketStatus::Acquired) => {
                    tracing::debug!(socket = %id, "discarded");
                    let _ = Self::remove_record(&mut state, id);
                    conn.start_close();
                    deferred.push(Deferred::Dispose {
                        conn: Some(conn),
                        pipe,
                    });
                    Self::dispatch_locked(&mut state, &mut deferred, None);
                    Ok(())
                }
                Some(other) => {
                    deferred.push(Deferred::Dispose {
                        conn: Some(conn),
                        pipe,
                    });
                    Err(PoolError::usage(format!(
                        "discard: socket {id} is {other:?}, not acquired"
                    )))
                }
                None => {
                    // Closing was the requested outcome either way.
                    conn.start_close();
                    deferred.push(Deferred::Dispose {
                        conn: Some(conn),
                        pipe,
                    });
                    Ok(())
                }
            }
        };
        self.run_deferred(deferred);
        result
    }

    /// Close idle sockets whose transport died or whose idle timer expired.
    /// Returns how many were reclaimed.
    pub fn reap_idle(&self) -> usize {
        let mut deferred = Vec::new();
        let reaped = {
            let mut state = self.lock();
            let timeout = state.idle_timeout;
            let now = Instant::now();
            let victims: Vec<SocketId> = state
                .records
                .values()
                .filter(|r| r.status == SocketStatus::Available)
                .filter(|r| {
                    let dead = r.conn.as_ref().map_or(true, |c| !c.is_connected());
                    let expired = r
                        .idle_since
                        .map_or(false, |t| now.duration_since(t) >= timeout);
                    dead || expired
                })
                .map(|r| r.id)
                .collect();
            for id in &victims {
                let (rec, _) = Self::remove_record(&mut state, *id);
                if let Some(mut rec) = rec {
                    deferred.push(Deferred::Dispose {
                        conn: rec.conn.take(),
                        pipe: rec.pipe.take(),
                    });
                }
            }
            if !victims.is_empty() {
                Self::dispatch_locked(&mut state, &mut deferred, None);
            }
            victims.len()
        };
        self.run_deferred(deferred);
        reaped
    }

    /// Start the background idle reaper. Call once during initialization.
    pub fn start_reaper(&self) {
        let pool = self.clone();
        let interval = self.shared.reap_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let reaped = pool.reap_idle();
                if reaped > 0 {
                    tracing::debug!(count = reaped, "reaped idle sockets");
                }
            }
        });
    }

    // ---- continuation entry points -------------------------------------

    /// Called from the connect task when the transport resolves.
    fn finish_connect(&self, id: SocketId, result: Result<Box<dyn PooledConn>, PoolError>) {
        let mut deferred = Vec::new();
        {
            let mut state = self.lock();
            match result {
                Ok(mut conn) => {
                    if !state.records.contains_key(&id) {
                        // Reclaimed while the connect was in flight.
                        conn.start_close();
                        deferred.push(Deferred::Dispose {
                            conn: Some(conn),
                            pipe: None,
                        });
                    } else {
                        deferred.push(Deferred::Watch {
                            id,
                            closed: conn.closed(),
                        });
                        if let Some(hook) = state.hook.clone() {
                            let scope = state.pending.get(&id).and_then(|p| p.session);
                            if let Some(rec) = state.records.get_mut(&id) {
                                rec.status = SocketStatus::Enabling;
                            }
                            tracing::debug!(socket = %id, "connected, entering enable phase");
                            deferred.push(Deferred::Enable { hook, id, conn });
                            Self::dispatch_locked(&mut state, &mut deferred, scope);
                        } else {
                            match state.pending.remove(&id) {
                                Some(req) => {
                                    let scope = req.session;
                                    if let Some(rec) = state.records.get_mut(&id) {
                                        rec.status = SocketStatus::Acquired;
                                        rec.session = req.session;
                                    }
                                    tracing::debug!(socket = %id, "connected, resolving request");
                                    if let Err(Ok(lease)) = req.tx.send(Ok(Lease {
                                        id,
                                        conn,
                                        pipe: None,
                                        reused: false,
                                    })) {
                                        Self::park_or_dispose(
                                            &mut state,
                                            &mut deferred,
                                            id,
                                            lease.conn,
                                            lease.pipe,
                                        );
                                    }
                                    Self::dispatch_locked(&mut state, &mut deferred, scope);
                                }
                                None => {
                                    let scope = state.records.get(&id).and_then(|r| r.session);
                                    Self::park_or_dispose(&mut state, &mut deferred, id, conn, None);
                                    Self::dispatch_locked(&mut state, &mut deferred, scope);
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    let (_rec, pend) = Self::remove_record(&mut state, id);
                    let scope = pend.as_ref().and_then(|p| p.session);
                    if let Some(req) = pend {
                        // Another socket for the same key may have become
                        // available while this connect was failing.
                        let fallback = if req.reuse {
                            Self::find_available(&mut state, &mut deferred, &req.key)
                        } else {
                            None
                        };
                        if let Some(rid) = fallback {
                            tracing::debug!(key = %req.key, "connect failed, absorbed by available socket");
                            Self::serve_from_record(&mut state, &mut deferred, rid, req);
                        } else {
                            tracing::debug!(socket = %id, error = %err, "connect failed");
                            let _ = req.tx.send(Err(err));
                        }
                    }
                    Self::dispatch_locked(&mut state, &mut deferred, scope);
                }
            }
        }
        self.run_deferred(deferred);
    }

    /// Called from the closed observer; fires at most once per socket and
    /// tolerates the record being long gone.
    fn handle_closed(&self, id: SocketId) {
        let mut deferred = Vec::new();
        {
            let mut state = self.lock();
            let (rec, pend) = Self::remove_record(&mut state, id);
            if rec.is_none() && pend.is_none() {
                return;
            }
            if let Some(mut rec) = rec {
                tracing::debug!(socket = %id, key = %rec.key, "socket closed, reclaiming");
                deferred.push(Deferred::Dispose {
                    conn: rec.conn.take(),
                    pipe: rec.pipe.take(),
                });
            }
            if let Some(req) = pend {
                let _ = req.tx.send(Err(PoolError::ClosedBeforeUsable));
            }
            // Freed capacity may be useful to any session.
            Self::dispatch_locked(&mut state, &mut deferred, None);
        }
        self.run_deferred(deferred);
    }

    // ---- dispatch ------------------------------------------------------

    /// The reuse → eviction → spawn sequence, re-run after every
    /// pool-relevant event. `scope` filters which queued requests may spawn
    /// connections this pass; the reuse pass always runs over the whole
    /// queue so per-key FIFO order holds across sessions.
    fn dispatch_locked(
        state: &mut PoolState,
        deferred: &mut Vec<Deferred>,
        scope: Option<Session>,
    ) {
        // Pass 1: reuse. FIFO over the queue, at most one hit per key.
        let mut consumed: HashSet<DestKey> = HashSet::new();
        let mut i = 0;
        while i < state.queue.len() {
            let (wants_reuse, key) = {
                let req = &state.queue[i];
                (req.reuse, req.key.clone())
            };
            if !wants_reuse || consumed.contains(&key) {
                i += 1;
                continue;
            }
            match Self::find_available(state, deferred, &key) {
                Some(rid) => {
                    consumed.insert(key);
                    if let Some(req) = state.queue.remove(i) {
                        Self::serve_from_record(state, deferred, rid, req);
                    }
                    // The next entry shifted into position i.
                }
                None => i += 1,
            }
        }

        // Pass 2: admission/eviction. Make room for what still waits by
        // closing idle sockets; tolerate over-subscription when none are.
        let mut active = state.records.len();
        let required = state.queue.len();
        while active + required > state.max_sockets {
            let victim = state
                .records
                .values()
                .find(|r| r.status == SocketStatus::Available)
                .map(|r| r.id);
            match victim {
                Some(vid) => {
                    let (rec, _) = Self::remove_record(state, vid);
                    if let Some(mut rec) = rec {
                        tracing::debug!(socket = %vid, key = %rec.key, "evicting idle socket");
                        deferred.push(Deferred::Dispose {
                            conn: rec.conn.take(),
                            pipe: rec.pipe.take(),
                        });
                    }
                    active -= 1;
                }
                None => break,
            }
        }

        // Pass 3: spawn connects for what capacity allows.
        while active < state.max_sockets {
            let pos = match scope {
                Some(s) => state.queue.iter().position(|r| r.session == Some(s)),
                None => {
                    if state.queue.is_empty() {
                        None
                    } else {
                        Some(0)
                    }
                }
            };
            let Some(pos) = pos else { break };
            let Some(req) = state.queue.remove(pos) else {
                break;
            };

            let id = SocketId::new(state.next_socket);
            state.next_socket += 1;
            let record = SocketRecord::new(id, req.key.clone(), req.session, req.reuse);
            state.records.insert(id, record);
            state.index.insert(req.key.clone(), id);

            // Inserted but gone on re-lookup would mean the table lost the
            // entry; fail this one request, never the loop.
            if !state.records.contains_key(&id) {
                state.index.remove(&req.key, id);
                let _ = req.tx.send(Err(PoolError::InternalConsistency {
                    detail: format!("record {id} vanished after insert"),
                }));
                continue;
            }

            tracing::debug!(socket = %id, key = %req.key, "spawning connect");
            let dest = req.dest.clone();
            state.pending.insert(id, req);
            active += 1;
            deferred.push(Deferred::Connect { id, dest });
        }

        // Pass 4: a scoped pass with spare capacity must not shadow other
        // sessions' queues; schedule one unscoped re-run.
        if let Some(s) = scope {
            if active < state.max_sockets && state.queue.iter().any(|r| r.session != Some(s)) {
                deferred.push(Deferred::Redispatch);
            }
        }
    }

    /// First `Available` record under `key` with a live transport. Dead
    /// idle sockets found on the way are culled.
    fn find_available(
        state: &mut PoolState,
        deferred: &mut Vec<Deferred>,
        key: &DestKey,
    ) -> Option<SocketId> {
        loop {
            let candidate = state.index.ids(key).iter().copied().find(|id| {
                state
                    .records
                    .get(id)
                    .map_or(false, |r| r.status == SocketStatus::Available)
            })?;
            let alive = state
                .records
                .get(&candidate)
                .and_then(|r| r.conn.as_ref())
                .map_or(false, |c| c.is_connected());
            if alive {
                return Some(candidate);
            }
            let (rec, _) = Self::remove_record(state, candidate);
            if let Some(mut rec) = rec {
                tracing::debug!(socket = %candidate, "culling dead idle socket");
                deferred.push(Deferred::Dispose {
                    conn: rec.conn.take(),
                    pipe: rec.pipe.take(),
                });
            }
        }
    }

    /// Resolve `req` with the `Available` record `rid`.
    fn serve_from_record(
        state: &mut PoolState,
        deferred: &mut Vec<Deferred>,
        rid: SocketId,
        req: PendingAcquire,
    ) {
        let taken = state.records.get_mut(&rid).and_then(|rec| {
            let conn = rec.conn.take()?;
            let pipe = rec.pipe.take();
            rec.status = SocketStatus::Acquired;
            rec.session = req.session;
            rec.idle_since = None;
            Some((conn, pipe))
        });
        let Some((conn, pipe)) = taken else {
            // An Available record always holds its connection; failing that
            // invariant fails the one request it affected.
            let (rec, _) = Self::remove_record(state, rid);
            drop(rec);
            let _ = req.tx.send(Err(PoolError::InternalConsistency {
                detail: format!("available record {rid} had no connection"),
            }));
            return;
        };

        tracing::debug!(socket = %rid, key = %req.key, "reusing socket");
        if let Err(Ok(lease)) = req.tx.send(Ok(Lease {
            id: rid,
            conn,
            pipe,
            reused: true,
        })) {
            // Requester abandoned the acquire; put the socket back.
            Self::park_or_dispose(state, deferred, rid, lease.conn, lease.pipe);
        }
    }

    /// Return a connection to the record as `Available`, or dispose of it
    /// when the record is gone, non-reusable, or the transport died.
    fn park_or_dispose(
        state: &mut PoolState,
        deferred: &mut Vec<Deferred>,
        id: SocketId,
        mut conn: Box<dyn PooledConn>,
        pipe: Option<Box<dyn SocketPipe>>,
    ) {
        let park = state
            .records
            .get(&id)
            .map_or(false, |r| r.reusable && conn.is_connected());
        if park {
            if let Some(rec) = state.records.get_mut(&id) {
                rec.status = SocketStatus::Available;
                rec.conn = Some(conn);
                rec.pipe = pipe;
                rec.idle_since = Some(Instant::now());
                return;
            }
        }
        let _ = Self::remove_record(state, id);
        conn.start_close();
        deferred.push(Deferred::Dispose {
            conn: Some(conn),
            pipe,
        });
    }

    /// Remove `id` from every structure at once: record table, key index,
    /// and pending-request table.
    fn remove_record(
        state: &mut PoolState,
        id: SocketId,
    ) -> (Option<SocketRecord>, Option<PendingAcquire>) {
        let rec = state.records.remove(&id);
        if let Some(rec) = &rec {
            state.index.remove(&rec.key, id);
        }
        let pend = state.pending.remove(&id);
        (rec, pend)
    }

    /// Execute side effects collected under the lock. Runs with the lock
    /// released: hooks and pipe/conn drop impls may reenter the pool.
    fn run_deferred(&self, actions: Vec<Deferred>) {
        for action in actions {
            match action {
                Deferred::Connect { id, dest } => {
                    let pool = self.clone();
                    let transport = Arc::clone(&self.shared.transport);
                    tokio::spawn(async move {
                        let result = transport.connect(&dest).await;
                        pool.finish_connect(id, result);
                    });
                }
                Deferred::Watch { id, closed } => {
                    let pool = self.clone();
                    tokio::spawn(async move {
                        closed.await;
                        pool.handle_closed(id);
                    });
                }
                Deferred::Enable { hook, id, conn } => {
                    hook.on_socket_connected(self.clone(), id, conn);
                }
                Deferred::Dispose { conn, pipe } => {
                    if let Some(mut pipe) = pipe {
                        pipe.shutdown();
                    }
                    if let Some(mut conn) = conn {
                        conn.start_close();
                    }
                }
                Deferred::Redispatch => {
                    let pool = self.clone();
                    tokio::spawn(async move {
                        let mut deferred = Vec::new();
                        {
                            let mut state = pool.lock();
                            SocketPool::dispatch_locked(&mut state, &mut deferred, None);
                        }
                        pool.run_deferred(deferred);
                    });
                }
            }
        }
    }
}
