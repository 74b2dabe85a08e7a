//! Connect handshake messages and the device-auth signing payload.
//!
//! The first request on every socket is `connect`. Its `device` block proves
//! possession of the device key by signing a canonical pipe-delimited string:
//!
//! ```text
//! v1|deviceId|clientId|clientMode|role|scope1,scope2|signedAtMs|token
//! v2|deviceId|clientId|clientMode|role|scope1,scope2|signedAtMs|token|nonce
//! ```
//!
//! `v2` is used once the gateway has issued a `connect.challenge` nonce.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::DeviceIdentity;

/// Method name of the handshake request.
pub const CONNECT_METHOD: &str = "connect";

/// Protocol version spoken by this client (both bounds).
pub const PROTOCOL_VERSION: u32 = 3;

/// Client identifier announced in `client.id`.
pub const CLIENT_ID: &str = "gateway-client";

/// Client mode announced in `client.mode`.
pub const CLIENT_MODE: &str = "backend";

/// Human-readable client name announced in `client.displayName`.
pub const CLIENT_DISPLAY_NAME: &str = "gateway client";

/// Role requested by every call.
pub const OPERATOR_ROLE: &str = "operator";

/// Scopes requested by every call.
pub const OPERATOR_SCOPES: &[&str] = &["operator.admin", "operator.approvals", "operator.pairing"];

/// Returns the operator scopes as owned strings.
pub fn operator_scopes() -> Vec<String> {
    OPERATOR_SCOPES.iter().map(|s| s.to_string()).collect()
}

/// Message fragments the gateway uses when it rejects a cached device token.
///
/// The gateway exposes no structured code for this yet, so detection is a
/// case-insensitive substring match on the connect error message.
pub const STALE_DEVICE_TOKEN_MARKERS: &[&str] = &["invalid device token", "device token mismatch"];

/// Returns true when a connect error message means the device token is stale.
pub fn is_stale_device_token_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    STALE_DEVICE_TOKEN_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Inputs to the canonical device-auth signing string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAuthPayload {
    pub device_id: String,
    pub client_id: String,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub signed_at_ms: u64,
    pub token: Option<String>,
    pub nonce: Option<String>,
}

impl DeviceAuthPayload {
    /// Payload version: `v2` when a challenge nonce is present, else `v1`.
    pub fn version(&self) -> &'static str {
        if self.nonce.is_some() {
            "v2"
        } else {
            "v1"
        }
    }

    /// Builds the canonical pipe-delimited string that gets signed.
    pub fn canonical(&self) -> String {
        let mut parts = vec![
            self.version().to_string(),
            self.device_id.clone(),
            self.client_id.clone(),
            self.client_mode.clone(),
            self.role.clone(),
            self.scopes.join(","),
            self.signed_at_ms.to_string(),
            self.token.clone().unwrap_or_default(),
        ];
        if let Some(nonce) = &self.nonce {
            parts.push(nonce.clone());
        }
        parts.join("|")
    }

    /// Signs the payload with the device key and assembles the `device` block.
    pub fn sign(&self, identity: &DeviceIdentity) -> DeviceParams {
        DeviceParams {
            id: identity.device_id().to_string(),
            public_key: identity.public_key_base64url(),
            signature: identity.sign(&self.canonical()),
            signed_at: self.signed_at_ms,
            nonce: self.nonce.clone(),
        }
    }
}

/// The `client` block of a connect request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    pub instance_id: String,
}

/// The `device` block of a connect request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceParams {
    /// Device id (hex SHA-256 of the raw public key).
    pub id: String,
    /// Unpadded base64url raw public key.
    pub public_key: String,
    /// Unpadded base64url signature over the canonical payload.
    pub signature: String,
    /// Signing timestamp (ms since epoch).
    pub signed_at: u64,
    /// Challenge nonce, present on `v2` payloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// The `auth` block of a connect request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl AuthParams {
    /// Returns `None` when neither a token nor a password is available.
    pub fn from_parts(token: Option<String>, password: Option<String>) -> Option<Self> {
        if token.is_none() && password.is_none() {
            None
        } else {
            Some(Self { token, password })
        }
    }
}

/// Parameters of the `connect` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(default)]
    pub caps: Vec<String>,
    pub role: String,
    pub scopes: Vec<String>,
    pub device: DeviceParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
}

/// Device token issued in a successful hello.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAuth {
    pub device_token: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    #[serde(default)]
    pub issued_at_ms: Option<u64>,
}

/// The payload of a successful connect response. Only `auth` is consumed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HelloOk {
    #[serde(default)]
    pub protocol: Option<u32>,
    #[serde(default)]
    pub auth: Option<HelloAuth>,
}

impl HelloAuth {
    /// Reads an `auth` block. Requires a string `deviceToken`; any other field
    /// of an unexpected type is dropped rather than rejecting the block.
    pub fn from_value(auth: &Value) -> Option<Self> {
        let device_token = auth.get("deviceToken")?.as_str()?.to_string();
        let role = auth.get("role").and_then(Value::as_str).map(str::to_string);
        let scopes = auth.get("scopes").and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        });
        Some(Self {
            device_token,
            role,
            scopes,
            issued_at_ms: auth.get("issuedAtMs").and_then(Value::as_u64),
        })
    }
}

impl HelloOk {
    /// Reads a hello from a connect response payload.
    ///
    /// Fields are read independently, so a malformed `protocol` never costs
    /// the device token. An `auth` block without a string `deviceToken`
    /// yields no auth.
    pub fn from_payload(payload: Option<&Value>) -> Self {
        let Some(payload) = payload else {
            return Self::default();
        };
        Self {
            protocol: payload
                .get("protocol")
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok()),
            auth: payload.get("auth").and_then(HelloAuth::from_value),
        }
    }
}

/// Returns the current time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
