//! The transport boundary the pool is built against.
//!
//! The pool never performs I/O itself; it owns connection *values* produced
//! by a [`Transport`] and moves them between its own bookkeeping, the enable
//! hook, and lease holders. Everything it needs from a connection is the
//! [`PooledConn`] surface: liveness, close initiation, and a one-shot closed
//! signal that fires for application- and peer-initiated closes alike.

use crate::base::error::PoolError;
use crate::socket::dest::Destination;
use std::{fmt, future::Future, pin::Pin, sync::Arc};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

/// Alias for the one-shot "this socket closed" future.
pub type ClosedSignal = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Alias for the `Future` type returned by a transport connect.
pub type Connecting = Pin<Box<dyn Future<Output = Result<Box<dyn PooledConn>, PoolError>> + Send>>;

/// A connected transport socket, owned by whoever currently holds it.
///
/// Ownership moves: pool → enable hook → lease holder → back to the pool on
/// release. The closed signal must remain valid across those moves, which is
/// why [`closed`](PooledConn::closed) returns a detached future rather than
/// borrowing the connection.
pub trait PooledConn: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug + 'static {
    /// Returns true if the socket is still connected.
    /// A non-blocking check, not a full liveness probe.
    fn is_connected(&self) -> bool;

    /// A future resolving exactly once when the socket closes, whether the
    /// close was initiated locally, by the peer, or by dropping the value.
    fn closed(&self) -> ClosedSignal;

    /// Begin closing the socket. Fires the closed signal; the actual
    /// teardown completes when the value is dropped.
    fn start_close(&mut self);
}

/// An attached protocol consumer/decoder travelling with a pooled socket.
///
/// Set by the enable hook once the enable phase completes; the pool stores
/// it while the socket is idle and hands it out with every lease.
pub trait SocketPipe: Send + fmt::Debug + 'static {
    /// Detach from the socket. Called when the pool disposes of the
    /// connection the pipe is attached to.
    fn shutdown(&mut self) {}
}

/// Creates outbound connections on behalf of the pool.
///
/// Implementations must be thread-safe; the pool runs many connects
/// concurrently. Name resolution belongs here, never in the pool.
pub trait Transport: Send + Sync + 'static {
    /// Connect to `dest`, trying its candidate hosts in order.
    fn connect(&self, dest: &Destination) -> Connecting;
}

/// Blanket implementation for Arc-wrapped transports.
impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn connect(&self, dest: &Destination) -> Connecting {
        (**self).connect(dest)
    }
}

/// Close-signal plumbing for [`PooledConn`] implementations.
///
/// Built on a `watch` channel: the signal fires when [`signal`]
/// (CloseMonitor::signal) is called or when the monitor (and with it the
/// connection) is dropped, and observers attached after the fact resolve
/// immediately.
#[derive(Debug)]
pub struct CloseMonitor {
    tx: watch::Sender<bool>,
}

impl CloseMonitor {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Fire the closed signal. Idempotent.
    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether the signal has fired.
    pub fn is_signaled(&self) -> bool {
        *self.tx.borrow()
    }

    /// A detached future resolving once the signal fires (or the monitor is
    /// dropped, which counts as closing).
    pub fn closed(&self) -> ClosedSignal {
        let mut rx = self.tx.subscribe();
        Box::pin(async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
    }
}

impl Default for CloseMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_monitor_signal_resolves_observers() {
        let monitor = CloseMonitor::new();
        let closed = monitor.closed();
        assert!(!monitor.is_signaled());

        monitor.signal();
        closed.await;
        assert!(monitor.is_signaled());

        // Observers attached after the fact resolve immediately.
        monitor.closed().await;
    }

    #[tokio::test]
    async fn test_monitor_drop_counts_as_close() {
        let monitor = CloseMonitor::new();
        let closed = monitor.closed();
        drop(monitor);
        closed.await;
    }
}
