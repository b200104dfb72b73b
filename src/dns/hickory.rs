//! Async resolver backed by hickory-dns.
//!
//! Fully async resolution with system configuration auto-detection and
//! dual-stack (IPv4 + IPv6) lookups. Unlike [`GaiResolver`](super::GaiResolver)
//! it never spawns blocking tasks and keeps connections to DNS servers warm.

use super::{Addrs, Name, Resolve, Resolving};
use crate::base::error::PoolError;
use hickory_resolver::{
    config::{LookupIpStrategy, ResolverConfig},
    name_server::TokioConnectionProvider,
    TokioResolver,
};
use std::{net::SocketAddr, sync::LazyLock};

/// Async resolver shared across all instances via a static `LazyLock`.
///
/// Lazily initialized on first query from the system's DNS settings, falling
/// back to defaults when those cannot be read.
#[derive(Debug, Clone)]
pub struct HickoryResolver {
    resolver: &'static LazyLock<TokioResolver>,
}

impl HickoryResolver {
    /// Creates a new `HickoryResolver`.
    pub fn new() -> Self {
        static RESOLVER: LazyLock<TokioResolver> = LazyLock::new(|| {
            let mut builder = match TokioResolver::builder_tokio() {
                Ok(builder) => {
                    tracing::debug!("using system DNS configuration");
                    builder
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "failed to read system DNS config, using defaults"
                    );
                    TokioResolver::builder_with_config(
                        ResolverConfig::default(),
                        TokioConnectionProvider::default(),
                    )
                }
            };

            builder.options_mut().ip_strategy = LookupIpStrategy::Ipv4AndIpv6;

            builder.build()
        });

        Self {
            resolver: &RESOLVER,
        }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolve for HickoryResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.clone();
        Box::pin(async move {
            let domain = name.as_str();
            tracing::debug!(domain = %domain, "resolving via hickory-dns");

            let lookup = resolver.resolver.lookup_ip(domain).await.map_err(|e| {
                tracing::debug!(domain = %domain, error = %e, "hickory-dns lookup failed");
                PoolError::name_not_resolved(
                    domain,
                    std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()),
                )
            })?;

            let addrs: Vec<SocketAddr> = lookup.iter().map(|ip| SocketAddr::new(ip, 0)).collect();

            if addrs.is_empty() {
                return Err(PoolError::name_not_resolved(
                    domain,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses returned"),
                ));
            }

            tracing::debug!(domain = %domain, count = addrs.len(), "hickory-dns resolution complete");
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}
