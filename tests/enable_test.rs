//! Enable-phase tests: the connect hook, pipes, and rejection handling.

mod common;

use common::{settle, LinePipe, MockTransport};
use netpool::base::PoolError;
use netpool::socket::{
    ConnectHook, Destination, PoolConfig, PooledConn, SocketId, SocketKind, SocketPipe, SocketPool,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

fn dest(host: &str, port: u16) -> Destination {
    Destination::new([host], port, SocketKind::Tcp, false)
}

fn pool_with(transport: &MockTransport, max: usize) -> SocketPool {
    SocketPool::with_config(
        Arc::new(transport.clone()),
        PoolConfig {
            max_sockets: max,
            ..Default::default()
        },
    )
}

/// Enables every socket synchronously, attaching a line pipe.
struct ImmediateHook;

impl ConnectHook for ImmediateHook {
    fn on_socket_connected(&self, pool: SocketPool, id: SocketId, conn: Box<dyn PooledConn>) {
        let pipe: Box<dyn SocketPipe> = Box::new(LinePipe::new());
        pool.enable_socket(id, conn, Some(pipe)).unwrap();
    }
}

/// Rejects every socket.
struct RejectingHook;

impl ConnectHook for RejectingHook {
    fn on_socket_connected(&self, pool: SocketPool, id: SocketId, conn: Box<dyn PooledConn>) {
        drop(conn);
        pool.reject_socket(id, "handshake refused").unwrap();
    }
}

/// Enables from a spawned task, as a real protocol negotiator would.
struct AsyncHook;

impl ConnectHook for AsyncHook {
    fn on_socket_connected(&self, pool: SocketPool, id: SocketId, conn: Box<dyn PooledConn>) {
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            pool.enable_socket(id, conn, None).unwrap();
        });
    }
}

/// Parks the connection for the test to enable manually.
#[derive(Default)]
struct ManualHook {
    held: Mutex<Option<(SocketId, Box<dyn PooledConn>)>>,
}

impl ConnectHook for ManualHook {
    fn on_socket_connected(&self, _pool: SocketPool, id: SocketId, conn: Box<dyn PooledConn>) {
        *self.held.lock().unwrap() = Some((id, conn));
    }
}

/// Switches between enabling and rejecting.
struct SwitchHook {
    reject: AtomicBool,
}

impl SwitchHook {
    fn new() -> Self {
        Self {
            reject: AtomicBool::new(false),
        }
    }
}

impl ConnectHook for SwitchHook {
    fn on_socket_connected(&self, pool: SocketPool, id: SocketId, conn: Box<dyn PooledConn>) {
        if self.reject.load(Ordering::SeqCst) {
            drop(conn);
            pool.reject_socket(id, "switched to reject").unwrap();
        } else {
            pool.enable_socket(id, conn, None).unwrap();
        }
    }
}

#[tokio::test]
async fn test_enable_phase_attaches_pipe() {
    let transport = MockTransport::new();
    let pool = pool_with(&transport, 4);
    pool.set_connect_hook(Arc::new(ImmediateHook));

    let lease = pool
        .acquire(dest("a.example", 80), true, None)
        .await
        .unwrap();
    assert!(!lease.reused());
    assert!(lease.pipe().is_some());

    // The pipe travels with the socket through release and reuse.
    pool.release(lease).unwrap();
    let lease = pool
        .acquire(dest("a.example", 80), true, None)
        .await
        .unwrap();
    assert!(lease.reused());
    assert!(lease.pipe().is_some());
    assert_eq!(transport.connect_count(), 1);
    pool.release(lease).unwrap();
}

#[tokio::test]
async fn test_async_enable_resolves_waiting_request() {
    let transport = MockTransport::new();
    let pool = pool_with(&transport, 4);
    pool.set_connect_hook(Arc::new(AsyncHook));

    let lease = pool
        .acquire(dest("a.example", 80), true, None)
        .await
        .unwrap();
    assert!(lease.pipe().is_none());
    assert!(lease.conn().is_connected());
    pool.release(lease).unwrap();
}

#[tokio::test]
async fn test_enable_reject_surfaces_error() {
    let transport = MockTransport::new();
    let pool = pool_with(&transport, 4);
    pool.set_connect_hook(Arc::new(RejectingHook));

    let err = pool
        .acquire(dest("a.example", 80), true, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::EnableRejected { .. }));

    // Cleaned up before propagation.
    assert_eq!(pool.active_count(), 0);
    assert_eq!(pool.queued_count(), 0);
}

#[tokio::test]
async fn test_enable_reject_absorbed_by_available_socket() {
    let transport = MockTransport::new();
    let pool = pool_with(&transport, 4);
    let hook = Arc::new(SwitchHook::new());
    pool.set_connect_hook(hook.clone());

    let lease = pool
        .acquire(dest("a.example", 80), true, None)
        .await
        .unwrap();
    let first_id = lease.id();

    // A second same-key request spawns its own connect; it will be
    // rejected by the hook, but an idle same-key socket appears first.
    transport.pause();
    hook.reject.store(true, Ordering::SeqCst);
    let pool2 = pool.clone();
    let waiting =
        tokio::spawn(async move { pool2.acquire(dest("a.example", 80), true, None).await });
    settle().await;
    assert!(!waiting.is_finished());

    pool.release(lease).unwrap();
    settle().await;
    transport.resume();

    let lease = waiting.await.unwrap().unwrap();
    assert_eq!(lease.id(), first_id);
    assert!(lease.reused());
    pool.release(lease).unwrap();
}

#[tokio::test]
async fn test_speculative_enable_parks_socket_for_reuse() {
    let transport = MockTransport::new();
    let pool = pool_with(&transport, 4);
    let hook = Arc::new(ManualHook::default());
    pool.set_connect_hook(hook.clone());

    // The requester gives up while the hook still holds the connection.
    let pool2 = pool.clone();
    let waiting =
        tokio::spawn(async move { pool2.acquire(dest("a.example", 80), true, None).await });
    settle().await;
    waiting.abort();
    settle().await;

    let (id, conn) = hook.held.lock().unwrap().take().unwrap();
    pool.enable_socket(id, conn, None).unwrap();

    // Enabled with no claimant: parked and matchable.
    assert_eq!(pool.idle_count(), 1);
    let lease = pool
        .acquire(dest("a.example", 80), true, None)
        .await
        .unwrap();
    assert_eq!(lease.id(), id);
    assert!(lease.reused());
    assert_eq!(transport.connect_count(), 1);
    pool.release(lease).unwrap();
}

#[tokio::test]
async fn test_enable_socket_twice_is_usage_error() {
    let transport = MockTransport::new();
    let pool = pool_with(&transport, 4);
    let hook = Arc::new(ManualHook::default());
    pool.set_connect_hook(hook.clone());

    let pool2 = pool.clone();
    let waiting =
        tokio::spawn(async move { pool2.acquire(dest("a.example", 80), true, None).await });
    settle().await;

    let (id, conn) = hook.held.lock().unwrap().take().unwrap();
    pool.enable_socket(id, conn, None).unwrap();
    let lease = waiting.await.unwrap().unwrap();

    // Second enable for the same socket: contract violation, state intact.
    let stray = Box::new(common::MockConn::new(
        "stray".to_string(),
        Arc::new(netpool::socket::CloseMonitor::new()),
    ));
    let err = pool.enable_socket(id, stray, None).unwrap_err();
    assert!(err.is_usage());
    assert_eq!(pool.active_count(), 1);

    pool.release(lease).unwrap();
}

#[tokio::test]
async fn test_clear_connect_hook_skips_enable_phase() {
    let transport = MockTransport::new();
    let pool = pool_with(&transport, 4);
    pool.set_connect_hook(Arc::new(ImmediateHook));

    let lease = pool
        .acquire(dest("a.example", 80), true, None)
        .await
        .unwrap();
    assert!(lease.pipe().is_some());
    pool.discard(lease).unwrap();

    pool.clear_connect_hook();
    let lease = pool
        .acquire(dest("a.example", 80), true, None)
        .await
        .unwrap();
    assert!(lease.pipe().is_none());
    pool.release(lease).unwrap();
}
