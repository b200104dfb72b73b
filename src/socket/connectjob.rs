//! The default transport: resolve → TCP/UDP connect → optional TLS.
//!
//! Each candidate host of a destination is tried in order: IP literals skip
//! resolution entirely, hostnames go through the configured [`Resolve`]
//! implementation, and every resolved address is attempted before moving to
//! the next host.

use crate::base::context::IoResultExt;
use crate::base::error::PoolError;
use crate::dns::{GaiResolver, HostAddrs, Name, Resolve};
use crate::socket::conn::{CloseMonitor, ClosedSignal, Connecting, PooledConn, Transport};
use crate::socket::dest::{Destination, SocketKind};
use crate::socket::tls::TlsConfig;
use boring::ssl::{SslConnector, SslMethod};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};
use tokio_boring::SslStream;

enum NetStream {
    Tcp(TcpStream),
    Tls(SslStream<TcpStream>),
    Udp(UdpSocket),
}

impl fmt::Debug for NetStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetStream::Tcp(_) => f.write_str("NetStream::Tcp"),
            NetStream::Tls(_) => f.write_str("NetStream::Tls"),
            NetStream::Udp(_) => f.write_str("NetStream::Udp"),
        }
    }
}

/// A connection produced by [`NetTransport`]: plain TCP, TLS over TCP, or a
/// connected UDP socket.
#[derive(Debug)]
pub struct NetConn {
    stream: NetStream,
    monitor: CloseMonitor,
}

impl NetConn {
    fn new(stream: NetStream) -> Self {
        Self {
            stream,
            monitor: CloseMonitor::new(),
        }
    }

    pub fn tcp(stream: TcpStream) -> Self {
        Self::new(NetStream::Tcp(stream))
    }

    pub fn tls(stream: SslStream<TcpStream>) -> Self {
        Self::new(NetStream::Tls(stream))
    }

    pub fn udp(socket: UdpSocket) -> Self {
        Self::new(NetStream::Udp(socket))
    }

    /// Check if the underlying TCP socket is still connected.
    /// Uses peer_addr() plus a non-blocking peek as a lightweight liveness
    /// test; catches RST and FIN conditions.
    fn check_tcp_connected(stream: &TcpStream) -> bool {
        if stream.peer_addr().is_err() {
            return false;
        }

        let mut buf = [0u8; 1];
        match stream.try_read(&mut buf) {
            Ok(0) => false, // EOF
            Ok(_) => true,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }
}

impl AsyncRead for NetConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            NetStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            NetStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            NetStream::Udp(s) => s.poll_recv(cx, buf),
        }
    }
}

impl AsyncWrite for NetConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().stream {
            NetStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            NetStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            NetStream::Udp(s) => s.poll_send(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            NetStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            NetStream::Tls(s) => Pin::new(s).poll_flush(cx),
            NetStream::Udp(_) => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            NetStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            NetStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
            NetStream::Udp(_) => Poll::Ready(Ok(())),
        }
    }
}

impl PooledConn for NetConn {
    fn is_connected(&self) -> bool {
        if self.monitor.is_signaled() {
            return false;
        }
        match &self.stream {
            NetStream::Tcp(s) => Self::check_tcp_connected(s),
            NetStream::Tls(s) => Self::check_tcp_connected(s.get_ref()),
            NetStream::Udp(s) => s.peer_addr().is_ok(),
        }
    }

    fn closed(&self) -> ClosedSignal {
        self.monitor.closed()
    }

    fn start_close(&mut self) {
        self.monitor.signal();
    }
}

/// Default [`Transport`] implementation.
#[derive(Clone)]
pub struct NetTransport {
    resolver: Arc<dyn Resolve>,
    tls: TlsConfig,
    connect_timeout: Duration,
}

impl fmt::Debug for NetTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetTransport")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl NetTransport {
    pub fn new() -> Self {
        Self {
            resolver: Arc::new(GaiResolver::new()),
            tls: TlsConfig::default(),
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Replace the resolver (e.g. hickory-dns, or an overrides wrapper in
    /// tests).
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_tls_config(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn addrs_for(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, PoolError> {
        if let Some(parsed) = HostAddrs::try_parse(host, port) {
            return Ok(parsed.collect());
        }
        let resolved = self.resolver.resolve(Name::new(host)).await?;
        Ok(resolved
            .map(|addr| SocketAddr::new(addr.ip(), port))
            .collect())
    }

    async fn connect_tcp(
        &self,
        host: &str,
        addr: SocketAddr,
        tls: bool,
    ) -> Result<NetConn, PoolError> {
        let label = format!("{}:{}", host, addr.port());
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(PoolError::connect_failed(label, e)),
            Err(_) => {
                return Err(PoolError::connect_failed(
                    label,
                    io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                ))
            }
        };

        if tls {
            let tls_stream = self.tls_handshake(host, stream).await?;
            tracing::debug!(host = %host, addr = %addr, "tls connect complete");
            Ok(NetConn::tls(tls_stream))
        } else {
            tracing::debug!(host = %host, addr = %addr, "tcp connect complete");
            Ok(NetConn::tcp(stream))
        }
    }

    async fn connect_udp(&self, host: &str, addr: SocketAddr) -> Result<NetConn, PoolError> {
        let label = format!("{}:{}", host, addr.port());
        let bind_addr = if addr.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .connection_context(&label)?;
        socket.connect(addr).await.connection_context(&label)?;
        tracing::debug!(host = %host, addr = %addr, "udp connect complete");
        Ok(NetConn::udp(socket))
    }

    async fn tls_handshake(
        &self,
        host: &str,
        stream: TcpStream,
    ) -> Result<SslStream<TcpStream>, PoolError> {
        let handshake_err = |detail: String| PoolError::TlsHandshake {
            host: host.to_string(),
            detail,
        };

        let mut builder =
            SslConnector::builder(SslMethod::tls()).map_err(|e| handshake_err(e.to_string()))?;
        self.tls
            .apply_to_builder(&mut builder)
            .map_err(|e| handshake_err(e.to_string()))?;
        let connector = builder.build();
        let mut config = connector
            .configure()
            .map_err(|e| handshake_err(e.to_string()))?;

        // RFC 6066: no SNI for IP literals.
        if !TlsConfig::should_set_sni(host) {
            config.set_use_server_name_indication(false);
            config.set_verify_hostname(false);
        }

        let handshake =
            tokio::time::timeout(self.connect_timeout, tokio_boring::connect(config, host, stream))
                .await;
        match handshake {
            Ok(Ok(tls_stream)) => Ok(tls_stream),
            Ok(Err(e)) => {
                tracing::debug!(host = %host, error = ?e, "tls handshake failed");
                Err(handshake_err(format!("{e:?}")))
            }
            Err(_) => Err(handshake_err("handshake timed out".to_string())),
        }
    }
}

impl Default for NetTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for NetTransport {
    fn connect(&self, dest: &Destination) -> Connecting {
        let transport = self.clone();
        let dest = dest.clone();
        Box::pin(async move {
            if dest.kind() == SocketKind::Udp && dest.tls() {
                return Err(PoolError::connect_failed(
                    dest.label(),
                    io::Error::new(io::ErrorKind::Unsupported, "TLS over UDP is not supported"),
                ));
            }

            let mut last_err: Option<PoolError> = None;
            for host in dest.hosts() {
                let addrs = match transport.addrs_for(host, dest.port()).await {
                    Ok(addrs) => addrs,
                    Err(e) => {
                        last_err = Some(e);
                        continue;
                    }
                };

                for addr in addrs {
                    let attempt = match dest.kind() {
                        SocketKind::Tcp => transport.connect_tcp(host, addr, dest.tls()).await,
                        SocketKind::Udp => transport.connect_udp(host, addr).await,
                    };
                    match attempt {
                        Ok(conn) => return Ok(Box::new(conn) as Box<dyn PooledConn>),
                        Err(e) => {
                            tracing::debug!(host = %host, addr = %addr, error = %e, "connect attempt failed");
                            last_err = Some(e);
                        }
                    }
                }
            }

            Err(last_err.unwrap_or_else(|| {
                PoolError::connect_failed(
                    dest.label(),
                    io::Error::new(io::ErrorKind::NotFound, "no usable address"),
                )
            }))
        })
    }
}
