use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the pool and its default transport.
///
/// Variants are cloneable so a single failure can be fanned out to every
/// request that was waiting on the same destination; IO sources are shared
/// behind `Arc` for that reason.
#[derive(Debug, Error, Clone)]
pub enum PoolError {
    /// The destination was rejected before any pool state was touched.
    #[error("invalid destination: {reason}")]
    InvalidDestination { reason: String },

    /// No candidate host of the destination could be resolved.
    #[error("name not resolved for {domain}: {source}")]
    NameNotResolved {
        domain: String,
        source: Arc<io::Error>,
    },

    /// The transport-level connect failed for every resolved address.
    #[error("connect to {dest} failed: {source}")]
    ConnectFailedTo {
        dest: String,
        source: Arc<io::Error>,
    },

    /// TLS handshake with the destination failed.
    #[error("TLS handshake with {host} failed: {detail}")]
    TlsHandshake { host: String, detail: String },

    /// The enable phase refused the socket. Treated exactly like a connect
    /// failure: cleaned up first, absorbed by a same-key reuse when possible.
    #[error("enable phase rejected socket for {dest}: {reason}")]
    EnableRejected { dest: String, reason: String },

    /// The transport reported the socket closed while a request was still
    /// waiting on it.
    #[error("socket closed before it became usable")]
    ClosedBeforeUsable,

    /// Caller broke the pool contract (unknown identity, wrong status).
    /// The remaining pool state is left untouched.
    #[error("usage error: {detail}")]
    Usage { detail: String },

    /// An invariant that should never fail did. Fails the single affected
    /// request, never the runtime.
    #[error("internal consistency failure: {detail}")]
    InternalConsistency { detail: String },

    /// The pool was dropped while requests were still queued.
    #[error("socket pool shut down")]
    Shutdown,
}

impl PoolError {
    /// Build a [`PoolError::ConnectFailedTo`] from an IO error.
    pub fn connect_failed(dest: impl Into<String>, source: io::Error) -> Self {
        PoolError::ConnectFailedTo {
            dest: dest.into(),
            source: Arc::new(source),
        }
    }

    /// Build a [`PoolError::NameNotResolved`] from an IO error.
    pub fn name_not_resolved(domain: impl Into<String>, source: io::Error) -> Self {
        PoolError::NameNotResolved {
            domain: domain.into(),
            source: Arc::new(source),
        }
    }

    /// Build a [`PoolError::Usage`].
    pub fn usage(detail: impl Into<String>) -> Self {
        PoolError::Usage {
            detail: detail.into(),
        }
    }

    /// True for contract violations rather than runtime conditions.
    pub fn is_usage(&self) -> bool {
        matches!(self, PoolError::Usage { .. })
    }
}
