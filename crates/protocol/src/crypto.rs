//! Device identity keys, fingerprints, and signatures.
//!
//! A device is an Ed25519 keypair. Its identifier is the lowercase hex SHA-256
//! digest of the 32-byte raw public key. Keys are persisted as PEM (PKCS#8 for
//! the private key, SPKI for the public key); signatures travel as unpadded
//! base64url.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::{GatewayError, Result};

/// Computes the device id for a raw Ed25519 public key.
pub fn fingerprint_public_key(raw: &[u8; PUBLIC_KEY_LENGTH]) -> String {
    hex::encode(Sha256::digest(raw))
}

/// Encodes bytes as unpadded base64url.
pub fn base64url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decodes unpadded base64url, tolerating trailing `=` padding.
pub fn base64url_decode(input: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(input.trim_end_matches('='))
        .map_err(|e| GatewayError::Serialization(format!("invalid base64url: {}", e)))
}

/// Verifies a base64url signature over `payload` against a base64url raw
/// public key, the way the gateway checks a connect request.
pub fn verify_device_signature(public_key: &str, payload: &str, signature: &str) -> Result<()> {
    let key_bytes = base64url_decode(public_key)?;
    let key_arr: [u8; PUBLIC_KEY_LENGTH] = key_bytes.as_slice().try_into().map_err(|_| {
        GatewayError::InvalidPublicKey(format!(
            "expected {} bytes, got {}",
            PUBLIC_KEY_LENGTH,
            key_bytes.len()
        ))
    })?;
    let verifying_key = VerifyingKey::from_bytes(&key_arr)
        .map_err(|e| GatewayError::InvalidPublicKey(e.to_string()))?;

    let sig_bytes = base64url_decode(signature)?;
    let sig_arr: [u8; SIGNATURE_LENGTH] = sig_bytes.as_slice().try_into().map_err(|_| {
        GatewayError::InvalidSignature(format!(
            "expected {} bytes, got {}",
            SIGNATURE_LENGTH,
            sig_bytes.len()
        ))
    })?;

    verifying_key
        .verify(payload.as_bytes(), &Signature::from_bytes(&sig_arr))
        .map_err(GatewayError::from)
}

/// The identity of the local device, including the secret key.
#[derive(Clone)]
pub struct DeviceIdentity {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    device_id: String,
}

impl DeviceIdentity {
    /// Generates a new random device identity from the OS RNG.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Wraps an existing signing key, deriving the public key and device id.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let device_id = fingerprint_public_key(verifying_key.as_bytes());
        Self {
            signing_key,
            verifying_key,
            device_id,
        }
    }

    /// Restores an identity from its persisted PEM pair.
    ///
    /// Fails if either PEM is malformed or if the private key does not derive
    /// the stored public key.
    pub fn from_pem(private_key_pem: &str, public_key_pem: &str) -> Result<Self> {
        let signing_key = SigningKey::from_pkcs8_pem(private_key_pem)
            .map_err(|e| GatewayError::Identity(format!("invalid private key: {}", e)))?;
        let stored_public = VerifyingKey::from_public_key_pem(public_key_pem)
            .map_err(|e| GatewayError::InvalidPublicKey(e.to_string()))?;

        let identity = Self::from_signing_key(signing_key);
        if identity.verifying_key != stored_public {
            return Err(GatewayError::Identity(
                "private key does not match stored public key".to_string(),
            ));
        }
        Ok(identity)
    }

    /// Encodes the private key as PKCS#8 PEM.
    pub fn private_key_pem(&self) -> Result<String> {
        self.signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.as_str().to_string())
            .map_err(|e| GatewayError::Serialization(e.to_string()))
    }

    /// Encodes the public key as SPKI PEM.
    pub fn public_key_pem(&self) -> Result<String> {
        self.verifying_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| GatewayError::Serialization(e.to_string()))
    }

    /// Returns the raw 32-byte public key.
    pub fn public_key_raw(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    /// Returns the raw public key as unpadded base64url.
    pub fn public_key_base64url(&self) -> String {
        base64url_encode(self.verifying_key.as_bytes())
    }

    /// Returns the device id (hex SHA-256 of the raw public key).
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Signs a payload and returns the signature as unpadded base64url.
    pub fn sign(&self, payload: &str) -> String {
        let signature = self.signing_key.sign(payload.as_bytes());
        base64url_encode(&signature.to_bytes())
    }

    /// Verifies a base64url signature made by this device.
    pub fn verify(&self, payload: &str, signature: &str) -> Result<()> {
        verify_device_signature(&self.public_key_base64url(), payload, signature)
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("public_key", &self.public_key_base64url())
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}
