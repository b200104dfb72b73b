//! System resolver using getaddrinfo.
//!
//! Uses the operating system's native resolution via `getaddrinfo`, executed
//! in a blocking task so the async runtime never stalls. Respects system DNS
//! configuration (/etc/resolv.conf and friends).

use super::{Addrs, Name, Resolve, Resolving};
use crate::base::error::PoolError;
use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs},
};

/// System resolver backed by `getaddrinfo` in a thread pool.
///
/// Each resolution spawns a blocking task. For high connect rates prefer
/// [`HickoryResolver`](crate::dns::HickoryResolver), which is fully async.
#[derive(Clone, Debug, Default)]
pub struct GaiResolver;

impl GaiResolver {
    /// Creates a new `GaiResolver`.
    pub fn new() -> Self {
        Self
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let host = name.as_str().to_string();
            let domain = host.clone();

            let result = tokio::task::spawn_blocking(move || {
                tracing::debug!(host = %host, "resolving via getaddrinfo");
                (host.as_str(), 0u16)
                    .to_socket_addrs()
                    .map(|iter| iter.collect::<Vec<_>>())
            })
            .await;

            // Handle task join error (cancellation, panic)
            let addrs = result
                .map_err(|e| {
                    tracing::error!(error = %e, "resolution task failed");
                    PoolError::name_not_resolved(
                        domain.clone(),
                        io::Error::new(io::ErrorKind::Other, e.to_string()),
                    )
                })?
                .map_err(|e| {
                    tracing::debug!(domain = %domain, error = %e, "resolution failed");
                    PoolError::name_not_resolved(domain.clone(), e)
                })?;

            if addrs.is_empty() {
                return Err(PoolError::name_not_resolved(
                    domain,
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        "no addresses returned by getaddrinfo",
                    ),
                ));
            }

            tracing::debug!(domain = %domain, count = addrs.len(), "resolution complete");
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}

/// Addresses parsed directly from an IP-literal host.
///
/// The transport checks every candidate host against this first; a literal
/// bypasses name resolution entirely.
pub struct HostAddrs {
    addrs: Vec<SocketAddr>,
}

impl HostAddrs {
    /// Attempts to parse a host string as an IPv4 or IPv6 literal.
    ///
    /// Returns `None` for hostnames that require resolution. Brackets around
    /// IPv6 literals are accepted.
    pub fn try_parse(host: &str, port: u16) -> Option<Self> {
        if let Ok(addr) = host.parse::<Ipv4Addr>() {
            return Some(Self {
                addrs: vec![SocketAddr::V4(SocketAddrV4::new(addr, port))],
            });
        }

        let stripped = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(addr) = stripped.parse::<Ipv6Addr>() {
            return Some(Self {
                addrs: vec![SocketAddr::V6(SocketAddrV6::new(addr, port, 0, 0))],
            });
        }

        None
    }

    /// Returns true if no addresses are available.
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Returns the number of addresses.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }
}

impl Iterator for HostAddrs {
    type Item = SocketAddr;

    fn next(&mut self) -> Option<Self::Item> {
        if self.addrs.is_empty() {
            None
        } else {
            Some(self.addrs.remove(0))
        }
    }
}
