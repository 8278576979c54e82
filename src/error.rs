use std::io;

use crate::store::StoreError;

/// Error taxonomy for the egress proxy.
///
/// The general policy is local recovery: anything that can be scoped to a
/// single secret or a single connection is logged and dropped there; only
/// startup-time failures abort construction.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Backing secret store failed (transient) or the path was absent.
    #[error("secret store: {0}")]
    Store(#[from] StoreError),

    /// Invalid or missing configuration at construction time.
    #[error("config: {0}")]
    Config(String),

    /// Dial or splice failure talking to a client or upstream.
    #[error("network: {0}")]
    Network(#[from] io::Error),

    /// Malformed request, missing SNI, undecodable metadata.
    #[error("protocol: {0}")]
    Protocol(String),

    /// CA generation, certificate parsing, or TLS handshake failure.
    #[error("crypto: {0}")]
    Crypto(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    #[test]
    fn store_error_converts() {
        let err: ProxyError = StoreError::NotFound("team/cert".into()).into();
        assert!(matches!(err, ProxyError::Store(StoreError::NotFound(_))));
        assert_eq!(err.to_string(), "secret store: not found: team/cert");
    }

    #[test]
    fn io_error_converts() {
        let io = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err: ProxyError = io.into();
        assert!(matches!(err, ProxyError::Network(_)));
    }
}
