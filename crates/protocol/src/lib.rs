//! # Gateway Protocol Library
//!
//! This crate provides the wire types and cryptographic primitives for
//! talking to a gateway over its control-plane socket.
//!
//! ## Overview
//!
//! - **Frames**: the three JSON frame shapes (request, response, event) and a
//!   parser that silently drops anything malformed
//! - **Device Identity**: Ed25519 keypairs, SHA-256 device ids, PEM encoding,
//!   base64url signatures
//! - **Connect**: connect request parameters, the canonical signing payload,
//!   hello parsing, and stale-token classification
//! - **Errors**: one structured error enum for every call failure
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Business method payloads        │  opaque JSON
//! ├─────────────────────────────────────────┤
//! │      connect handshake (signed)         │  Ed25519, v1/v2 payloads
//! ├─────────────────────────────────────────┤
//! │          req / res / event              │  JSON frames
//! ├─────────────────────────────────────────┤
//! │              WebSocket                  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{DeviceAuthPayload, DeviceIdentity, Frame, RequestFrame};
//!
//! let identity = DeviceIdentity::generate();
//! println!("Device ID: {}", identity.device_id());
//!
//! let payload = DeviceAuthPayload {
//!     device_id: identity.device_id().to_string(),
//!     client_id: protocol::CLIENT_ID.to_string(),
//!     client_mode: protocol::CLIENT_MODE.to_string(),
//!     role: protocol::OPERATOR_ROLE.to_string(),
//!     scopes: protocol::operator_scopes(),
//!     signed_at_ms: 1_700_000_000_000,
//!     token: None,
//!     nonce: None,
//! };
//! let device = payload.sign(&identity);
//! assert!(identity.verify(&payload.canonical(), &device.signature).is_ok());
//!
//! let request = RequestFrame::new("status", None);
//! let text = request.encode().unwrap();
//! assert!(matches!(Frame::parse(&text), Some(Frame::Request(_))));
//! ```
//!
//! ## Modules
//!
//! - [`frames`]: Frame types and codec
//! - [`crypto`]: Device identity, fingerprints, and signatures
//! - [`connect`]: Handshake parameters and signing payload
//! - [`error`]: Error types

pub mod connect;
pub mod crypto;
pub mod error;
pub mod frames;

pub use connect::{
    is_stale_device_token_error, now_ms, operator_scopes, AuthParams, ClientInfo, ConnectParams,
    DeviceAuthPayload, DeviceParams, HelloAuth, HelloOk, CLIENT_DISPLAY_NAME, CLIENT_ID,
    CLIENT_MODE, CONNECT_METHOD, OPERATOR_ROLE, OPERATOR_SCOPES, PROTOCOL_VERSION,
};
pub use crypto::{fingerprint_public_key, verify_device_signature, DeviceIdentity};
pub use error::{GatewayError, Result};
pub use frames::{ErrorShape, EventFrame, Frame, RequestFrame, ResponseFrame};
