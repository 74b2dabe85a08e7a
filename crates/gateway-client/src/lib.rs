//! # Gateway Client Library
//!
//! Device-authenticated calls to a gateway over a single-shot WebSocket.
//!
//! ## Overview
//!
//! Every call is a fully independent round trip:
//!
//! - **Device Identity**: a per-installation Ed25519 keypair, created on first
//!   use and persisted under the state directory
//! - **Token Cache**: device tokens issued by the gateway, cached per role and
//!   bound to the device id
//! - **Handshake**: a signed `connect` request, re-signed if the gateway sends
//!   a challenge nonce
//! - **Session**: one method request after authentication, settled exactly
//!   once by its response, a socket failure, or the deadline
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │               GatewayClient::call / invoke               │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌────────────────┐   ┌────────────────────────────────┐ │
//! │  │   Handshake    │──▶│  Device Identity / Token Cache │ │
//! │  └────────────────┘   └────────────────────────────────┘ │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │          CallMachine (explicit call states)        │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │     session::run (WebSocket, delay, deadline)      │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gateway_client::{CallOptions, ConnectionDetails, GatewayClient};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = GatewayClient::new(ConnectionDetails {
//!         url: "ws://127.0.0.1:18789".to_string(),
//!         token: Some("shared-token".to_string()),
//!         password: None,
//!         state_dir: "/tmp/gatewayctl".into(),
//!     });
//!
//!     let status = client
//!         .call("status", json!({}), CallOptions::default())
//!         .await?;
//!     println!("{}", status);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`client`]: Call entry points
//! - [`config`]: Configuration file and environment handling
//! - [`handshake`]: Signed connect request and hello handling
//! - [`identity`]: Device identity and token cache persistence
//! - [`session`]: Call state machine and WebSocket driver

pub mod client;
pub mod config;
pub mod handshake;
pub mod identity;
pub mod session;

pub use client::{invoke, parse_gateway_url, ConnectionDetails, GatewayClient};
pub use config::{Config, ConfigError};
pub use handshake::{Handshake, TokenSource};
pub use identity::{DeviceAuthEntry, DeviceAuthStore, DeviceIdentityStore};
pub use protocol::{GatewayError, Result};
pub use session::{CallMachine, CallOptions, CallState, Step};
