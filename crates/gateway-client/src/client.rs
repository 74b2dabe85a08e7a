//! Entry points for calling gateway methods.

use std::path::PathBuf;

use protocol::{GatewayError, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::config::Config;
use crate::handshake::Handshake;
use crate::identity::load_or_create_device_identity;
use crate::session::{self, CallMachine, CallOptions};

/// Everything a call needs to reach and authenticate with a gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDetails {
    /// `ws://` or `wss://` URL of the gateway.
    pub url: String,
    /// Shared token, used when no device token is cached.
    pub token: Option<String>,
    /// Shared password.
    pub password: Option<String>,
    /// Directory holding `identity/device.json` and `identity/device-auth.json`.
    pub state_dir: PathBuf,
}

/// Parses a gateway URL, accepting only WebSocket schemes.
pub fn parse_gateway_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| GatewayError::InvalidUrl(format!("{}: {}", raw, e)))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(GatewayError::InvalidUrl(format!(
            "{}: unsupported scheme {}",
            raw, other
        ))),
    }
}

/// Client for one gateway.
///
/// Holds no connection: each [`call`](Self::call) opens its own socket,
/// authenticates, makes one request, and closes the socket again.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    details: ConnectionDetails,
}

impl GatewayClient {
    /// Creates a client for the given connection details.
    pub fn new(details: ConnectionDetails) -> Self {
        Self { details }
    }

    /// Calls `method` with `params` and returns the response payload.
    ///
    /// Fails with [`GatewayError::Identity`] if the device identity cannot be
    /// loaded or created; every other failure comes from the call itself.
    pub async fn call(&self, method: &str, params: Value, options: CallOptions) -> Result<Value> {
        let url = parse_gateway_url(&self.details.url)?;
        let identity = load_or_create_device_identity(&self.details.state_dir)?;
        let handshake = Handshake::new(identity, &self.details);
        let machine = CallMachine::new(handshake, method, params, &options);

        tracing::debug!(method = %method, expect_final = options.expect_final, "calling gateway");
        let result = session::run(&url, machine, &options).await;
        if let Err(e) = &result {
            tracing::debug!(method = %method, error = %e, "gateway call failed");
        }
        result
    }

    /// Calls `method` and deserializes the payload into `T`.
    pub async fn call_typed<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<T> {
        let payload = self.call(method, params, options).await?;
        Ok(serde_json::from_value(payload)?)
    }
}

/// Calls `method` on the gateway described by `config`.
///
/// Options without a timeout use the configured `client.timeout_ms`.
pub async fn invoke(
    config: &Config,
    method: &str,
    params: Value,
    mut options: CallOptions,
) -> Result<Value> {
    options.timeout_ms = options.timeout_ms.or(Some(config.client.timeout_ms));
    GatewayClient::new(config.connection_details())
        .call(method, params, options)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_parse_gateway_url() {
        assert_eq!(parse_gateway_url("ws://127.0.0.1:18789").unwrap().port(), Some(18789));
        assert!(parse_gateway_url("wss://gateway.example.com/ws").is_ok());
        assert!(matches!(
            parse_gateway_url("https://gateway.example.com"),
            Err(GatewayError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_gateway_url("not a url"),
            Err(GatewayError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_url_fails_before_touching_state() {
        let temp_dir = TempDir::new().unwrap();
        let client = GatewayClient::new(ConnectionDetails {
            url: "http://127.0.0.1:1".to_string(),
            token: None,
            password: None,
            state_dir: temp_dir.path().to_path_buf(),
        });

        let result = client.call("status", json!({}), CallOptions::default()).await;
        assert!(matches!(result, Err(GatewayError::InvalidUrl(_))));
        assert!(!temp_dir.path().join("identity").exists());
    }

    #[tokio::test]
    async fn test_refused_connection_is_transport_error() {
        let temp_dir = TempDir::new().unwrap();
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = GatewayClient::new(ConnectionDetails {
            url: format!("ws://127.0.0.1:{}", port),
            token: None,
            password: None,
            state_dir: temp_dir.path().to_path_buf(),
        });

        let err = client
            .call("status", json!({}), CallOptions::new().with_timeout_ms(5_000))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)), "got {:?}", err);
        assert!(err.is_retryable());
        // The identity is created before the socket is opened.
        assert!(temp_dir.path().join("identity").join("device.json").exists());
    }
}
