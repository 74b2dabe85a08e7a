//! The authenticated `connect` exchange.
//!
//! A [`Handshake`] holds everything needed to build a signed connect request
//! for one call and to act on the gateway's answer: persisting a freshly
//! issued device token, or evicting a cached one the gateway no longer accepts.

use std::sync::OnceLock;

use protocol::{
    is_stale_device_token_error, now_ms, operator_scopes, AuthParams, ClientInfo, ConnectParams,
    DeviceAuthPayload, DeviceIdentity, GatewayError, HelloOk, RequestFrame, ResponseFrame,
    Result, CLIENT_DISPLAY_NAME, CLIENT_ID, CLIENT_MODE, CONNECT_METHOD, OPERATOR_ROLE,
    PROTOCOL_VERSION,
};

use crate::client::ConnectionDetails;
use crate::identity::DeviceAuthStore;

/// Fallback message when the gateway rejects a connect without saying why.
const CONNECT_FAILED: &str = "connect failed";

/// Returns the per-process client instance id.
pub fn instance_id() -> &'static str {
    static INSTANCE_ID: OnceLock<String> = OnceLock::new();
    INSTANCE_ID.get_or_init(|| uuid::Uuid::new_v4().to_string())
}

/// Where the token sent in `auth.token` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// A device token cached from an earlier handshake.
    Cached,
    /// The shared token from the connection settings.
    Shared,
    /// No token at all.
    None,
}

/// Connect state for one call.
pub struct Handshake {
    identity: DeviceIdentity,
    tokens: DeviceAuthStore,
    role: String,
    scopes: Vec<String>,
    token: Option<String>,
    token_source: TokenSource,
    password: Option<String>,
}

impl Handshake {
    /// Prepares a handshake as the operator role.
    ///
    /// A cached device token for this device takes precedence over the
    /// shared token in `details`.
    pub fn new(identity: DeviceIdentity, details: &ConnectionDetails) -> Self {
        let tokens = DeviceAuthStore::new(&details.state_dir);
        let role = OPERATOR_ROLE.to_string();

        let cached = tokens
            .get(identity.device_id(), &role)
            .map(|entry| entry.token);
        let (token, token_source) = match (cached, details.token.clone()) {
            (Some(token), _) => (Some(token), TokenSource::Cached),
            (None, Some(token)) => (Some(token), TokenSource::Shared),
            (None, None) => (None, TokenSource::None),
        };
        tracing::debug!(
            device_id = %identity.device_id(),
            token_source = ?token_source,
            password = details.password.is_some(),
            "prepared connect handshake"
        );

        Self {
            identity,
            tokens,
            role,
            scopes: operator_scopes(),
            token,
            token_source,
            password: details.password.clone(),
        }
    }

    /// Returns the device id this handshake authenticates as.
    pub fn device_id(&self) -> &str {
        self.identity.device_id()
    }

    /// Returns the requested role.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Returns where the outgoing token came from.
    pub fn token_source(&self) -> TokenSource {
        self.token_source
    }

    /// Builds a signed connect request. With a challenge `nonce` the device
    /// block is signed as `v2`, otherwise as `v1`.
    pub fn connect_request(&self, nonce: Option<&str>) -> Result<RequestFrame> {
        let payload = DeviceAuthPayload {
            device_id: self.identity.device_id().to_string(),
            client_id: CLIENT_ID.to_string(),
            client_mode: CLIENT_MODE.to_string(),
            role: self.role.clone(),
            scopes: self.scopes.clone(),
            signed_at_ms: now_ms(),
            token: self.token.clone(),
            nonce: nonce.map(str::to_string),
        };

        let params = ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: CLIENT_ID.to_string(),
                display_name: CLIENT_DISPLAY_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                platform: std::env::consts::OS.to_string(),
                mode: CLIENT_MODE.to_string(),
                instance_id: instance_id().to_string(),
            },
            caps: Vec::new(),
            role: self.role.clone(),
            scopes: self.scopes.clone(),
            device: payload.sign(&self.identity),
            auth: AuthParams::from_parts(self.token.clone(), self.password.clone()),
        };

        tracing::debug!(version = payload.version(), "signed connect request");
        Ok(RequestFrame::new(
            CONNECT_METHOD,
            Some(serde_json::to_value(&params)?),
        ))
    }

    /// Acts on the connect response.
    ///
    /// A rejection whose message marks the device token as stale evicts the
    /// cached token for this device and role before returning
    /// [`GatewayError::StaleToken`]. A successful hello that carries a device
    /// token stores it under the role and scopes the gateway granted, falling
    /// back to the requested ones.
    pub fn complete(&self, response: &ResponseFrame) -> Result<HelloOk> {
        if !response.ok {
            let message = response
                .error_message()
                .unwrap_or_else(|| CONNECT_FAILED.to_string());

            if is_stale_device_token_error(&message) {
                tracing::warn!(role = %self.role, "gateway rejected device token, evicting it");
                if let Err(e) = self.tokens.clear(self.identity.device_id(), &self.role) {
                    tracing::warn!(error = %e, "failed to evict stale device token");
                }
                return Err(GatewayError::StaleToken(message));
            }
            return Err(GatewayError::Auth(message));
        }

        let hello = HelloOk::from_payload(response.payload.as_ref());
        if hello.auth.is_none()
            && response
                .payload
                .as_ref()
                .is_some_and(|p| p.get("auth").is_some())
        {
            tracing::warn!("hello auth block has no usable device token");
        }
        if let Some(auth) = hello.auth.as_ref().filter(|a| !a.device_token.is_empty()) {
            let role = auth
                .role
                .clone()
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| self.role.clone());
            let scopes = auth.scopes.clone().unwrap_or_else(|| self.scopes.clone());
            if let Err(e) =
                self.tokens
                    .store(self.identity.device_id(), &role, &auth.device_token, &scopes)
            {
                tracing::warn!(error = %e, "failed to persist device token");
            }
        }

        tracing::debug!(protocol = ?hello.protocol, "gateway accepted connect");
        Ok(hello)
    }
}
