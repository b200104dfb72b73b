//! The outbound socket pool and its transport boundary.
//!
//! - [`pool`]: the pool controller (admission, matching, eviction, dispatch)
//! - [`dest`]: destinations and their normalized reuse keys
//! - [`record`]: per-socket bookkeeping and the destination key index
//! - [`conn`]: the `PooledConn`/`Transport` traits the pool is built against
//! - [`connectjob`]: resolve → TCP/UDP → optional TLS default transport
//! - [`tls`]: TLS configuration applied to the BoringSSL connector

pub mod conn;
pub mod connectjob;
pub mod dest;
pub mod pool;
pub mod record;
pub mod tls;

pub use conn::{CloseMonitor, ClosedSignal, Connecting, PooledConn, SocketPipe, Transport};
pub use connectjob::{NetConn, NetTransport};
pub use dest::{DestKey, Destination, SocketKind};
pub use pool::{ConnectHook, Lease, PoolConfig, SocketPool};
pub use record::{Session, SocketId, SocketStatus};
pub use tls::TlsConfig;
