//! Error types for certificate probing and exporter startup.
//!
//! Two families live here. [`ProbeError`] covers everything that can go
//! wrong while probing one endpoint; it is always contained within that
//! endpoint's probe and never stops the scheduler. [`ExporterError`] covers
//! the startup failures that terminate the process.

use std::fmt;
use std::io;

use crate::config::ConfigError;

/// Error type for a failed probe of a single endpoint.
///
/// Every variant names the endpoint address so a log line is enough to
/// tell which target failed and why.
#[derive(Debug)]
pub enum ProbeError {
    /// The configured address could not be turned into a host and port
    InvalidAddress {
        /// The address as configured
        address: String,
        /// Why it was rejected
        reason: String,
    },

    /// DNS resolution failed for the given hostname
    DnsResolution {
        /// The address whose host failed to resolve
        address: String,
        /// The underlying I/O error
        source: io::Error,
    },

    /// TCP connection failed to the target address
    ConnectionFailed {
        /// The address (host:port) that connection failed to
        address: String,
        /// The underlying I/O error
        source: io::Error,
    },

    /// TLS handshake failed
    HandshakeFailed {
        /// The address the handshake was attempted with
        address: String,
        /// Details about why the handshake failed
        details: String,
    },

    /// Connect or handshake did not complete within the probe timeout
    Timeout {
        /// The address that timed out
        address: String,
        /// Description of which operation timed out
        operation: String,
    },

    /// OpenSSL error while preparing the client or reading the chain
    OpenSSLError {
        /// The address being probed
        address: String,
        /// The underlying OpenSSL error
        details: String,
    },

    /// A generic error with a custom message
    Other {
        /// The address being probed
        address: String,
        /// Error message
        message: String,
    },
}

impl ProbeError {
    /// The endpoint address this error belongs to.
    pub fn address(&self) -> &str {
        match self {
            Self::InvalidAddress { address, .. }
            | Self::DnsResolution { address, .. }
            | Self::ConnectionFailed { address, .. }
            | Self::HandshakeFailed { address, .. }
            | Self::Timeout { address, .. }
            | Self::OpenSSLError { address, .. }
            | Self::Other { address, .. } => address,
        }
    }

    /// Maps an I/O error from a socket operation, turning the timeout kinds
    /// into [`ProbeError::Timeout`].
    pub(crate) fn from_io(address: &str, operation: &str, e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout {
                address: address.to_string(),
                operation: operation.to_string(),
            },
            _ => Self::ConnectionFailed {
                address: address.to_string(),
                source: e,
            },
        }
    }

    pub(crate) fn openssl(address: &str, e: openssl::error::ErrorStack) -> Self {
        Self::OpenSSLError {
            address: address.to_string(),
            details: e.to_string(),
        }
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAddress { address, reason } => {
                write!(f, "Invalid endpoint address '{}': {}", address, reason)
            }
            Self::DnsResolution { address, source } => {
                write!(f, "Failed to resolve host of {}: {}", address, source)
            }
            Self::ConnectionFailed { address, source } => {
                write!(f, "Connection failed to {}: {}", address, source)
            }
            Self::HandshakeFailed { address, details } => {
                write!(f, "TLS handshake with {} failed: {}", address, details)
            }
            Self::Timeout { address, operation } => {
                write!(f, "Operation timed out for {}: {}", address, operation)
            }
            Self::OpenSSLError { address, details } => {
                write!(f, "OpenSSL error for {}: {}", address, details)
            }
            Self::Other { address, message } => {
                write!(f, "Probe of {} failed: {}", address, message)
            }
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DnsResolution { source, .. } => Some(source),
            Self::ConnectionFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Fatal errors raised while starting the exporter.
#[derive(Debug)]
pub enum ExporterError {
    /// Configuration could not be loaded or is invalid
    Config(ConfigError),
    /// The exposition endpoint could not bind its listen address
    Bind {
        /// The address that failed to bind
        address: String,
        /// The underlying I/O error
        source: io::Error,
    },
    /// A metric could not be created or registered
    Metrics(prometheus::Error),
    /// The TLS client context could not be built
    Tls(openssl::error::ErrorStack),
    /// The HTTP server stopped with an error
    Serve(io::Error),
}

impl fmt::Display for ExporterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "Configuration error: {}", e),
            Self::Bind { address, source } => {
                write!(f, "Failed to bind listen address {}: {}", address, source)
            }
            Self::Metrics(e) => write!(f, "Metrics registry error: {}", e),
            Self::Tls(e) => write!(f, "TLS client setup error: {}", e),
            Self::Serve(e) => write!(f, "HTTP server error: {}", e),
        }
    }
}

impl std::error::Error for ExporterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Bind { source, .. } => Some(source),
            Self::Metrics(e) => Some(e),
            Self::Tls(e) => Some(e),
            Self::Serve(e) => Some(e),
        }
    }
}

impl From<ConfigError> for ExporterError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<openssl::error::ErrorStack> for ExporterError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Self::Tls(e)
    }
}

impl From<prometheus::Error> for ExporterError {
    fn from(e: prometheus::Error) -> Self {
        Self::Metrics(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProbeError::InvalidAddress {
            address: "bad host".to_string(),
            reason: "contains whitespace".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid endpoint address 'bad host': contains whitespace"
        );
    }

    #[test]
    fn test_timeout_kinds_map_to_timeout() {
        let err = ProbeError::from_io(
            "slow.example:443",
            "tls handshake",
            io::Error::new(io::ErrorKind::WouldBlock, "would block"),
        );
        assert!(matches!(err, ProbeError::Timeout { .. }));
        assert_eq!(err.address(), "slow.example:443");

        let err = ProbeError::from_io(
            "down.example:443",
            "tcp connect",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert!(matches!(err, ProbeError::ConnectionFailed { .. }));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_bind_error_names_address() {
        let err = ExporterError::Bind {
            address: "0.0.0.0:8080".to_string(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().contains("0.0.0.0:8080"));
    }
}
