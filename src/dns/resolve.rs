//! Core name resolution types and traits.

use crate::base::error::PoolError;
use std::{
    borrow::Cow, collections::HashMap, fmt, future::Future, net::SocketAddr, pin::Pin, sync::Arc,
};

/// A hostname to resolve into IP addresses.
///
/// Lightweight wrapper that keeps resolver signatures honest about what they
/// accept: one candidate host, never a whole destination.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name {
    host: Box<str>,
}

impl Name {
    /// Creates a new [`Name`] from any string-like type.
    #[inline]
    pub fn new(host: impl Into<Box<str>>) -> Self {
        Self { host: host.into() }
    }

    /// View the hostname as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.host
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value)
    }
}

impl From<String> for Name {
    fn from(value: String) -> Self {
        Name::new(value)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.host, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.host, f)
    }
}

/// Alias for an `Iterator` trait object over `SocketAddr`.
pub type Addrs = Box<dyn Iterator<Item = SocketAddr> + Send>;

/// Alias for the `Future` type returned by a resolver.
pub type Resolving = Pin<Box<dyn Future<Output = Result<Addrs, PoolError>> + Send>>;

/// Trait for name resolution.
///
/// Implementations must be thread-safe; the transport resolves candidate
/// hosts concurrently with other connects in flight.
///
/// Returned addresses carry port 0; the transport sets the destination port.
pub trait Resolve: Send + Sync {
    /// Resolves a hostname to IP addresses.
    fn resolve(&self, name: Name) -> Resolving;
}

/// Blanket implementation for Arc-wrapped resolvers.
impl<R: Resolve + ?Sized> Resolve for Arc<R> {
    fn resolve(&self, name: Name) -> Resolving {
        (**self).resolve(name)
    }
}

/// Resolver wrapper that consults a hostname override map first.
///
/// Useful for exercising the transport without real DNS, forcing specific
/// addresses for certain hosts, or local development names.
pub struct ResolverWithOverrides {
    inner: Arc<dyn Resolve>,
    overrides: Arc<HashMap<Cow<'static, str>, Vec<SocketAddr>>>,
}

impl ResolverWithOverrides {
    /// Creates a new resolver with the given overrides.
    ///
    /// `inner` handles every hostname absent from `overrides`.
    pub fn new(
        inner: Arc<dyn Resolve>,
        overrides: HashMap<Cow<'static, str>, Vec<SocketAddr>>,
    ) -> Self {
        Self {
            inner,
            overrides: Arc::new(overrides),
        }
    }

    /// Returns the number of configured overrides.
    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }
}

impl Resolve for ResolverWithOverrides {
    fn resolve(&self, name: Name) -> Resolving {
        if let Some(addrs) = self.overrides.get(name.as_str()) {
            let addrs: Addrs = Box::new(addrs.clone().into_iter());
            return Box::pin(std::future::ready(Ok(addrs)));
        }
        self.inner.resolve(name)
    }
}

impl fmt::Debug for ResolverWithOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverWithOverrides")
            .field("override_count", &self.overrides.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_name_roundtrip() {
        let name = Name::from("Example.com".to_string());
        assert_eq!(name.as_str(), "Example.com");
        assert_eq!(name.to_string(), "Example.com");
    }

    #[test]
    fn test_name_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(Name::new("example.com"));
        set.insert(Name::new("example.com"));
        assert_eq!(set.len(), 1);
    }

    struct MockResolver {
        response: Vec<SocketAddr>,
    }

    impl Resolve for MockResolver {
        fn resolve(&self, _name: Name) -> Resolving {
            let addrs = self.response.clone();
            Box::pin(async move { Ok(Box::new(addrs.into_iter()) as Addrs) })
        }
    }

    #[tokio::test]
    async fn test_override_hit() {
        let mock = Arc::new(MockResolver {
            response: vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 0)],
        });

        let mut overrides = HashMap::new();
        overrides.insert(
            Cow::Borrowed("override.local"),
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0)],
        );

        let resolver = ResolverWithOverrides::new(mock, overrides);
        let addrs: Vec<_> = resolver
            .resolve(Name::new("override.local"))
            .await
            .unwrap()
            .collect();

        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].ip(), IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[tokio::test]
    async fn test_override_miss_falls_through() {
        let mock = Arc::new(MockResolver {
            response: vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 0)],
        });

        let resolver = ResolverWithOverrides::new(mock, HashMap::new());
        let addrs: Vec<_> = resolver
            .resolve(Name::new("not-overridden.com"))
            .await
            .unwrap()
            .collect();

        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].ip(), IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));
    }
}
