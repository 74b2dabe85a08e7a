//! Generate device-auth test vectors for gateway interop testing.
//!
//! Run with: cargo run --package protocol --example test_vectors
//!
//! Ed25519 signatures are deterministic, so a fixed seed yields stable
//! device ids, payloads, and signatures that a gateway implementation can
//! check against.

use ed25519_dalek::SigningKey;
use protocol::{DeviceAuthPayload, DeviceIdentity};

fn main() {
    let identity = DeviceIdentity::from_signing_key(SigningKey::from_bytes(&[7u8; 32]));

    println!("deviceId:  {}", identity.device_id());
    println!("publicKey: {}", identity.public_key_base64url());
    println!();

    // Test vector 1: first connect, no token, no challenge
    let v1 = DeviceAuthPayload {
        device_id: identity.device_id().to_string(),
        client_id: protocol::CLIENT_ID.to_string(),
        client_mode: protocol::CLIENT_MODE.to_string(),
        role: protocol::OPERATOR_ROLE.to_string(),
        scopes: protocol::operator_scopes(),
        signed_at_ms: 1_704_067_200_000,
        token: None,
        nonce: None,
    };
    print_test_vector("v1_no_token", &identity, &v1);

    // Test vector 2: first connect with a shared token
    let v1_token = DeviceAuthPayload {
        token: Some("shared-secret".to_string()),
        ..v1.clone()
    };
    print_test_vector("v1_with_token", &identity, &v1_token);

    // Test vector 3: challenged connect
    let v2 = DeviceAuthPayload {
        token: Some("device-token".to_string()),
        nonce: Some("abc".to_string()),
        ..v1
    };
    print_test_vector("v2_challenged", &identity, &v2);
}

fn print_test_vector(name: &str, identity: &DeviceIdentity, payload: &DeviceAuthPayload) {
    let canonical = payload.canonical();
    let device = payload.sign(identity);
    println!("[{}]", name);
    println!("payload:   {}", canonical);
    println!("signature: {}", device.signature);
    println!();
}
