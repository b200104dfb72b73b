//! Shared test doubles: a counting, pausable mock transport.

#![allow(dead_code)]

use netpool::base::PoolError;
use netpool::socket::{
    CloseMonitor, ClosedSignal, Connecting, Destination, PooledConn, SocketPipe, Transport,
};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;

/// In-memory connection: no real I/O, closable from the outside through a
/// shared [`CloseMonitor`].
#[derive(Debug)]
pub struct MockConn {
    label: String,
    monitor: Arc<CloseMonitor>,
}

impl MockConn {
    pub fn new(label: String, monitor: Arc<CloseMonitor>) -> Self {
        Self { label, monitor }
    }
}

impl AsyncRead for MockConn {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // EOF; pool tests never do real I/O.
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockConn {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl PooledConn for MockConn {
    fn is_connected(&self) -> bool {
        !self.monitor.is_signaled()
    }

    fn closed(&self) -> ClosedSignal {
        self.monitor.closed()
    }

    fn start_close(&mut self) {
        self.monitor.signal();
    }
}

struct MockInner {
    connects: AtomicUsize,
    fail: AtomicBool,
    pause_tx: watch::Sender<bool>,
    monitors: Mutex<Vec<(String, Arc<CloseMonitor>)>>,
}

/// Transport double: counts successful connects, can be paused (connects
/// stall until resumed), can be told to fail, and can close every
/// connection it ever produced.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (pause_tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(MockInner {
                connects: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                pause_tx,
                monitors: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Make subsequent connects fail with a refusal.
    pub fn set_fail(&self, fail: bool) {
        self.inner.fail.store(fail, Ordering::SeqCst);
    }

    /// Stall subsequent connects until [`resume`](Self::resume).
    pub fn pause(&self) {
        let _ = self.inner.pause_tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.inner.pause_tx.send(false);
    }

    /// Fire the closed signal of every connection produced so far.
    pub fn close_all(&self) {
        let monitors = self.inner.monitors.lock().unwrap();
        for (_, monitor) in monitors.iter() {
            monitor.signal();
        }
    }
}

impl Transport for MockTransport {
    fn connect(&self, dest: &Destination) -> Connecting {
        let inner = Arc::clone(&self.inner);
        let label = dest.label();
        Box::pin(async move {
            let mut paused = inner.pause_tx.subscribe();
            while *paused.borrow_and_update() {
                if paused.changed().await.is_err() {
                    break;
                }
            }

            if inner.fail.load(Ordering::SeqCst) {
                return Err(PoolError::connect_failed(
                    label,
                    io::Error::new(io::ErrorKind::ConnectionRefused, "mock refused"),
                ));
            }

            inner.connects.fetch_add(1, Ordering::SeqCst);
            let monitor = Arc::new(CloseMonitor::new());
            inner
                .monitors
                .lock()
                .unwrap()
                .push((label.clone(), Arc::clone(&monitor)));
            Ok(Box::new(MockConn::new(label, monitor)) as Box<dyn PooledConn>)
        })
    }
}

/// Minimal pipe for enable-phase tests: buffers lines with `BytesMut`.
#[derive(Debug, Default)]
pub struct LinePipe {
    buf: bytes::BytesMut,
    shut: bool,
}

impl LinePipe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn was_shut_down(&self) -> bool {
        self.shut
    }
}

impl SocketPipe for LinePipe {
    fn shutdown(&mut self) {
        self.shut = true;
        self.buf.clear();
    }
}

/// Yield a few times so spawned pool continuations (connect tasks, closed
/// observers, unscoped re-runs) get to run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
