//! Destinations and their normalized reuse keys.
//!
//! A destination may list several equivalent hostnames (round-robin mail
//! exchangers, mirrored stratum endpoints); the pool treats them as one
//! target for reuse purposes, and the transport tries them in order.

use crate::base::error::PoolError;
use std::fmt;

/// Transport flavor of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Tcp,
    Udp,
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketKind::Tcp => f.write_str("tcp"),
            SocketKind::Udp => f.write_str("udp"),
        }
    }
}

/// Normalized identifier of a reusable connection target.
///
/// Two requests with equal keys may share a socket; two requests with
/// different keys never do.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestKey(String);

impl DestKey {
    /// View the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An outbound connection target: candidate hosts, port, kind, TLS flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    hosts: Vec<String>,
    port: u16,
    kind: SocketKind,
    tls: bool,
}

impl Destination {
    /// Creates a destination from one or more candidate hosts.
    pub fn new(
        hosts: impl IntoIterator<Item = impl Into<String>>,
        port: u16,
        kind: SocketKind,
        tls: bool,
    ) -> Self {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
            port,
            kind,
            tls,
        }
    }

    /// Candidate hosts, in the order the transport should try them.
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    /// Checks the destination before any pool state is touched.
    ///
    /// Ports are `u16`, so the upper bound holds by construction; what is
    /// left to catch is port 0 and empty or blank host lists.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.port == 0 {
            return Err(PoolError::InvalidDestination {
                reason: "port must be in 1..=65535".to_string(),
            });
        }
        if self.hosts.is_empty() {
            return Err(PoolError::InvalidDestination {
                reason: "at least one host is required".to_string(),
            });
        }
        if self.hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(PoolError::InvalidDestination {
                reason: "blank host in destination".to_string(),
            });
        }
        Ok(())
    }

    /// Derives the normalized reuse key.
    ///
    /// Hosts are lower-cased and joined in request order; the key also
    /// carries port, kind, and a `-tls` marker, so `a:80` can never match
    /// `a:81` or `a:80` over TLS.
    pub fn key(&self) -> DestKey {
        let mut joined = String::new();
        for (i, host) in self.hosts.iter().enumerate() {
            if i > 0 {
                joined.push(',');
            }
            joined.push_str(&host.to_lowercase());
        }
        let suffix = if self.tls { "-tls" } else { "" };
        DestKey(format!("{}|{}|{}{}", joined, self.port, self.kind, suffix))
    }

    /// Short human-readable label for logs and error messages.
    pub fn label(&self) -> String {
        let host = self.hosts.first().map(String::as_str).unwrap_or("?");
        format!("{}:{}", host, self.port)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_case_insensitive() {
        let a = Destination::new(["Mail.Example.COM"], 25, SocketKind::Tcp, false);
        let b = Destination::new(["mail.example.com"], 25, SocketKind::Tcp, false);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_key_joins_multiple_hosts() {
        let d = Destination::new(["a.example", "b.example"], 53, SocketKind::Udp, false);
        assert_eq!(d.key().as_str(), "a.example,b.example|53|udp");
    }

    #[test]
    fn test_key_separates_ports() {
        let a = Destination::new(["a.example"], 80, SocketKind::Tcp, false);
        let b = Destination::new(["a.example"], 81, SocketKind::Tcp, false);
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_key_separates_tls() {
        let plain = Destination::new(["a.example"], 80, SocketKind::Tcp, false);
        let tls = Destination::new(["a.example"], 80, SocketKind::Tcp, true);
        assert_ne!(plain.key(), tls.key());
        assert!(tls.key().as_str().ends_with("-tls"));
    }

    #[test]
    fn test_key_separates_kinds() {
        let tcp = Destination::new(["a.example"], 53, SocketKind::Tcp, false);
        let udp = Destination::new(["a.example"], 53, SocketKind::Udp, false);
        assert_ne!(tcp.key(), udp.key());
    }

    #[test]
    fn test_validate_rejects_port_zero() {
        let d = Destination::new(["a.example"], 0, SocketKind::Tcp, false);
        assert!(matches!(
            d.validate(),
            Err(PoolError::InvalidDestination { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_hosts() {
        let d = Destination::new(Vec::<String>::new(), 80, SocketKind::Tcp, false);
        assert!(d.validate().is_err());

        let blank = Destination::new([""], 80, SocketKind::Tcp, false);
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_normal_destination() {
        let d = Destination::new(["a.example", "b.example"], 443, SocketKind::Tcp, true);
        assert!(d.validate().is_ok());
    }
}
