use boring::error::ErrorStack;
use boring::ssl::{SslConnectorBuilder, SslVerifyMode, SslVersion};

/// TLS client configuration for the default transport.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub min_version: Option<SslVersion>,
    pub max_version: Option<SslVersion>,
    /// ALPN protocol names, most preferred first. Empty disables ALPN.
    pub alpn_protos: Vec<String>,
    /// Verify the peer certificate chain. Disable only for tests against
    /// self-signed endpoints.
    pub verify_peer: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            min_version: Some(SslVersion::TLS1_2),
            max_version: Some(SslVersion::TLS1_3),
            alpn_protos: Vec::new(),
            verify_peer: true,
        }
    }
}

impl TlsConfig {
    /// Apply this configuration to an SSL connector builder.
    pub fn apply_to_builder(&self, builder: &mut SslConnectorBuilder) -> Result<(), ErrorStack> {
        if let Some(min) = self.min_version {
            builder.set_min_proto_version(Some(min))?;
        }
        if let Some(max) = self.max_version {
            builder.set_max_proto_version(Some(max))?;
        }

        if !self.alpn_protos.is_empty() {
            // Wire format: length-prefixed protocol names.
            let mut alpn_wire = Vec::new();
            for proto in &self.alpn_protos {
                alpn_wire.push(proto.len() as u8);
                alpn_wire.extend_from_slice(proto.as_bytes());
            }
            builder.set_alpn_protos(&alpn_wire)?;
        }

        builder.set_verify(if self.verify_peer {
            SslVerifyMode::PEER
        } else {
            SslVerifyMode::NONE
        });

        Ok(())
    }

    /// Check if SNI (Server Name Indication) should be set for this host.
    /// Per RFC 6066, SNI MUST NOT be set for raw IP addresses.
    pub fn should_set_sni(host: &str) -> bool {
        let stripped = host.trim_start_matches('[').trim_end_matches(']');
        stripped.parse::<std::net::IpAddr>().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sni_suppressed_for_ip_literals() {
        assert!(!TlsConfig::should_set_sni("127.0.0.1"));
        assert!(!TlsConfig::should_set_sni("[::1]"));
        assert!(TlsConfig::should_set_sni("example.com"));
    }
}
