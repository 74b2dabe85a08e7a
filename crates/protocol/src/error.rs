//! Error types for gateway calls.
//!
//! Every failure a caller can observe from a gateway call is one variant of
//! [`GatewayError`]. The variant says what went wrong; the message field keeps
//! the text the gateway (or the local system) produced.

use thiserror::Error;

/// Gateway error type covering all possible failure modes of a call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    // Local identity errors
    /// Device keys could not be created, read, or persisted.
    #[error("device identity error: {0}")]
    Identity(String),

    // Handshake errors
    /// The gateway rejected the connect request.
    #[error("gateway connect failed: {0}")]
    Auth(String),

    /// The gateway rejected the cached device token. The token has been
    /// evicted from the cache by the time this error is returned.
    #[error("gateway connect failed: {0}")]
    StaleToken(String),

    // Method errors
    /// The gateway rejected the business method call.
    #[error("{message}")]
    Method {
        /// The method that was called.
        method: String,
        /// The server-provided message, or a fallback naming the method.
        message: String,
    },

    // Connection errors
    /// Socket-level failure (connect refused, I/O error, protocol error).
    #[error("gateway connection error: {0}")]
    Transport(String),

    /// The socket closed before the call settled.
    #[error("gateway closed ({code}): {reason}")]
    ConnectionClosed {
        /// WebSocket close code, 1006 when the peer vanished without one.
        code: u16,
        /// Close reason text, possibly empty.
        reason: String,
    },

    /// No settling frame arrived before the deadline.
    #[error("gateway timeout after {timeout_ms}ms")]
    Timeout {
        /// The configured deadline.
        timeout_ms: u64,
    },

    // Encoding and crypto errors
    /// Failed to serialize an outgoing frame or persisted record.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Signature verification failed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// The gateway URL could not be parsed or has the wrong scheme.
    #[error("invalid gateway url: {0}")]
    InvalidUrl(String),
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Builds a method failure, falling back to a message naming the method.
    pub fn method(method: impl Into<String>, message: Option<String>) -> Self {
        let method = method.into();
        let message = message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| format!("gateway method {} failed", method));
        GatewayError::Method { method, message }
    }

    /// Returns true when the gateway refused to authenticate this device.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, GatewayError::Auth(_) | GatewayError::StaleToken(_))
    }

    /// Returns true for failures where re-invoking the call may succeed.
    ///
    /// This layer never retries; the flag is for callers that own retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport(_)
                | GatewayError::ConnectionClosed { .. }
                | GatewayError::Timeout { .. }
        )
    }
}

// Conversions from underlying crate errors

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for GatewayError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        GatewayError::InvalidSignature(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Identity(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_error_display() {
        let err = GatewayError::Timeout { timeout_ms: 1500 };
        assert_eq!(err.to_string(), "gateway timeout after 1500ms");
    }

    #[test]
    fn test_connection_closed_error_display() {
        let err = GatewayError::ConnectionClosed {
            code: 1008,
            reason: "unauthorized".to_string(),
        };
        assert_eq!(err.to_string(), "gateway closed (1008): unauthorized");

        let err = GatewayError::ConnectionClosed {
            code: 1006,
            reason: String::new(),
        };
        assert_eq!(err.to_string(), "gateway closed (1006): ");
    }

    #[test]
    fn test_auth_error_display() {
        let err = GatewayError::Auth("pairing required".to_string());
        assert_eq!(err.to_string(), "gateway connect failed: pairing required");

        let err = GatewayError::StaleToken("invalid device token".to_string());
        assert_eq!(err.to_string(), "gateway connect failed: invalid device token");
    }

    #[test]
    fn test_method_error_uses_server_message() {
        let err = GatewayError::method("board.list", Some("board not found".to_string()));
        assert_eq!(err.to_string(), "board not found");
    }

    #[test]
    fn test_method_error_fallback_names_method() {
        let err = GatewayError::method("board.list", None);
        assert_eq!(err.to_string(), "gateway method board.list failed");

        let err = GatewayError::method("status", Some("   ".to_string()));
        assert_eq!(err.to_string(), "gateway method status failed");
    }

    #[test]
    fn test_transport_error_display() {
        let err = GatewayError::Transport("connection refused".to_string());
        assert_eq!(err.to_string(), "gateway connection error: connection refused");
    }

    #[test]
    fn test_classification_flags() {
        assert!(GatewayError::Auth("x".into()).is_auth_failure());
        assert!(GatewayError::StaleToken("x".into()).is_auth_failure());
        assert!(!GatewayError::Timeout { timeout_ms: 1 }.is_auth_failure());

        assert!(GatewayError::Timeout { timeout_ms: 1 }.is_retryable());
        assert!(GatewayError::Transport("x".into()).is_retryable());
        assert!(!GatewayError::Identity("x".into()).is_retryable());
        assert!(!GatewayError::method("m", None).is_retryable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: GatewayError = json_err.into();
        assert!(matches!(err, GatewayError::Serialization(_)));
    }

    #[test]
    fn test_from_io_error_is_identity() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: GatewayError = io_err.into();
        assert!(matches!(err, GatewayError::Identity(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GatewayError>();
    }
}
