//! # netpool
//!
//! An outbound connection pool for asynchronous protocol clients.
//!
//! `netpool` owns the admission, matching, and reclamation of client sockets
//! to remote endpoints. Protocol logic never lives here: once a connection is
//! leased out, the pool does not know or care what bytes flow over it.
//!
//! ## Features
//!
//! - **Destination keying**: requests naming the same `(hosts, port, kind,
//!   tls)` destination share connections.
//! - **Admission control**: a global socket cap with eviction of idle
//!   connections under pressure.
//! - **Two-phase setup**: an optional asynchronous enable phase (protocol
//!   handshake, TLS upgrade) gates a socket becoming usable.
//! - **Session-fair dispatch**: lightweight session tokens bias which queued
//!   requests are served first after a release, without ever violating
//!   per-destination FIFO order.
//! - **Pluggable transport**: TCP, UDP, and BoringSSL TLS out of the box;
//!   anything implementing [`socket::Transport`] in tests.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use netpool::socket::{Destination, NetTransport, SocketKind, SocketPool};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let pool = SocketPool::new(Arc::new(NetTransport::new()));
//!     let dest = Destination::new(["mail.example.com"], 25, SocketKind::Tcp, false);
//!     let mut lease = pool.acquire(dest, true, None).await.unwrap();
//!     // ... use lease.conn_mut() for I/O ...
//!     pool.release(lease).unwrap();
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Core types and error definitions
//! - [`dns`] - Name resolution used by the default transport
//! - [`socket`] - The pool controller, transport boundary, and connect flow

pub mod base;
pub mod dns;
pub mod socket;
