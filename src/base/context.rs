//! Ergonomic error context helpers.
//!
//! Provides extension traits for adding context to `Result` types,
//! converting IO errors into context-rich `PoolError` variants.

use crate::base::error::PoolError;
use std::io;

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Add destination context to an IO error.
    ///
    /// # Example
    /// ```ignore
    /// use netpool::base::context::IoResultExt;
    ///
    /// let stream = TcpStream::connect(addr).await
    ///     .connection_context("mail.example.com:25")?;
    /// // Error: "connect to mail.example.com:25 failed: connection refused"
    /// ```
    fn connection_context(self, dest: &str) -> Result<T, PoolError>;

    /// Add name-resolution context to an IO error.
    fn resolve_context(self, domain: &str) -> Result<T, PoolError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn connection_context(self, dest: &str) -> Result<T, PoolError> {
        self.map_err(|e| PoolError::connect_failed(dest, e))
    }

    fn resolve_context(self, domain: &str) -> Result<T, PoolError> {
        self.map_err(|e| PoolError::name_not_resolved(domain, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_connection_context() {
        let result: Result<(), io::Error> =
            Err(Error::new(ErrorKind::ConnectionRefused, "refused"));
        let err = result.connection_context("example.com:443").unwrap_err();

        match err {
            PoolError::ConnectFailedTo { dest, .. } => {
                assert_eq!(dest, "example.com:443");
            }
            _ => panic!("Expected ConnectFailedTo"),
        }
    }

    #[test]
    fn test_resolve_context() {
        let result: Result<(), io::Error> = Err(Error::new(ErrorKind::NotFound, "no such host"));
        let err = result.resolve_context("unknown.example.com").unwrap_err();

        match err {
            PoolError::NameNotResolved { domain, .. } => {
                assert_eq!(domain, "unknown.example.com");
            }
            _ => panic!("Expected NameNotResolved"),
        }
    }
}
