//! Persistent device identity.
//!
//! Each installation has one Ed25519 keypair stored at
//! `<state_dir>/identity/device.json`. The record is created on first use and
//! never regenerated unless its key material is missing or unusable. A record
//! whose stored `deviceId` disagrees with the fingerprint of its public key is
//! repaired in place: the id is corrected and the keys are kept.

use std::path::{Path, PathBuf};

use protocol::{now_ms, DeviceIdentity, GatewayError, Result};
use serde::{Deserialize, Serialize};

use super::persist;

/// Current on-disk format version.
const STORE_VERSION: u32 = 1;

/// On-disk form of the device identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredDeviceIdentity {
    version: u32,
    device_id: String,
    public_key_pem: String,
    private_key_pem: String,
    created_at_ms: u64,
}

impl StoredDeviceIdentity {
    fn from_identity(identity: &DeviceIdentity, created_at_ms: u64) -> Result<Self> {
        Ok(Self {
            version: STORE_VERSION,
            device_id: identity.device_id().to_string(),
            public_key_pem: identity.public_key_pem()?,
            private_key_pem: identity.private_key_pem()?,
            created_at_ms,
        })
    }
}

/// Outcome of inspecting a stored record.
enum Inspection {
    /// Keys are valid and the id matches.
    Valid(DeviceIdentity),
    /// Keys are valid but the stored id is wrong.
    NeedsRepair(DeviceIdentity, StoredDeviceIdentity),
    /// Record missing, unparseable, wrong version, or keys unusable.
    Unusable,
}

fn inspect(stored: Option<StoredDeviceIdentity>) -> Inspection {
    let Some(stored) = stored else {
        return Inspection::Unusable;
    };
    if stored.version != STORE_VERSION {
        tracing::warn!(version = stored.version, "unsupported device identity version");
        return Inspection::Unusable;
    }
    match DeviceIdentity::from_pem(&stored.private_key_pem, &stored.public_key_pem) {
        Ok(identity) if identity.device_id() == stored.device_id => Inspection::Valid(identity),
        Ok(identity) => Inspection::NeedsRepair(identity, stored),
        Err(e) => {
            tracing::warn!(error = %e, "stored device identity has unusable key material");
            Inspection::Unusable
        }
    }
}

/// Returns the identity file path under a state directory.
pub fn device_identity_path(state_dir: &Path) -> PathBuf {
    state_dir.join("identity").join("device.json")
}

/// Store for the local device identity.
pub struct DeviceIdentityStore {
    path: PathBuf,
}

impl DeviceIdentityStore {
    /// Creates a store rooted at `state_dir`. Nothing is read until
    /// [`load_or_create`](Self::load_or_create) is called.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: device_identity_path(state_dir),
        }
    }

    /// Returns the path to the identity file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the device identity, creating or repairing the record as needed.
    ///
    /// Read and parse failures count as "absent" and lead to a fresh keypair.
    /// Failing to persist a fresh keypair is an error: an identity that is not
    /// on disk would be replaced on the next call and never match its token.
    pub fn load_or_create(&self) -> Result<DeviceIdentity> {
        if let Inspection::Valid(identity) = inspect(persist::read_json(&self.path)) {
            return Ok(identity);
        }

        persist::with_exclusive_lock(&self.path, || {
            // Another process may have created or repaired the record while we
            // waited for the lock.
            match inspect(persist::read_json_unlocked(&self.path)) {
                Inspection::Valid(identity) => Ok(identity),
                Inspection::NeedsRepair(identity, stored) => {
                    self.repair(&identity, stored);
                    Ok(identity)
                }
                Inspection::Unusable => self.create(),
            }
        })
        .map_err(|e| GatewayError::Identity(format!("failed to lock device identity: {}", e)))?
    }

    fn repair(&self, identity: &DeviceIdentity, stored: StoredDeviceIdentity) {
        tracing::info!(
            stored_id = %stored.device_id,
            device_id = %identity.device_id(),
            "repairing device identity with mismatched id"
        );
        let repaired = StoredDeviceIdentity {
            device_id: identity.device_id().to_string(),
            ..stored
        };
        if let Err(e) = persist::write_json_private(&self.path, &repaired) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to persist repaired device identity");
        }
    }

    fn create(&self) -> Result<DeviceIdentity> {
        let identity = DeviceIdentity::generate();
        let stored = StoredDeviceIdentity::from_identity(&identity, now_ms())?;
        persist::write_json_private(&self.path, &stored).map_err(|e| {
            GatewayError::Identity(format!(
                "failed to write device identity {}: {}",
                self.path.display(),
                e
            ))
        })?;
        tracing::info!(device_id = %identity.device_id(), path = %self.path.display(), "created device identity");
        Ok(identity)
    }
}

/// Loads or creates the device identity under `state_dir`.
pub fn load_or_create_device_identity(state_dir: &Path) -> Result<DeviceIdentity> {
    DeviceIdentityStore::new(state_dir).load_or_create()
}
