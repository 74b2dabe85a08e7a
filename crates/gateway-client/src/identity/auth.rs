//! Cache of device tokens issued by the gateway.
//!
//! Tokens live at `<state_dir>/identity/device-auth.json`, keyed by role and
//! bound to the device id they were issued to. A cache written for another
//! device id is treated as empty: it is never merged into, only replaced.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use protocol::now_ms;
use serde::{Deserialize, Serialize};

use super::persist;

/// Current on-disk format version.
const STORE_VERSION: u32 = 1;

/// A cached token for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthEntry {
    pub token: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub updated_at_ms: u64,
}

/// The whole token cache file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthCache {
    pub version: u32,
    pub device_id: String,
    #[serde(default)]
    pub tokens: BTreeMap<String, DeviceAuthEntry>,
}

impl DeviceAuthCache {
    fn empty(device_id: &str) -> Self {
        Self {
            version: STORE_VERSION,
            device_id: device_id.to_string(),
            tokens: BTreeMap::new(),
        }
    }
}

/// Trims, de-duplicates, and sorts scopes; empty entries are dropped.
pub fn normalize_scopes(scopes: &[String]) -> Vec<String> {
    scopes
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Returns the token cache path under a state directory.
pub fn device_auth_path(state_dir: &Path) -> PathBuf {
    state_dir.join("identity").join("device-auth.json")
}

/// Store for cached device tokens.
pub struct DeviceAuthStore {
    path: PathBuf,
}

impl DeviceAuthStore {
    /// Creates a store rooted at `state_dir`.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: device_auth_path(state_dir),
        }
    }

    /// Returns the path to the cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the cache file. Missing or unparseable files yield `None`.
    pub fn load(&self) -> Option<DeviceAuthCache> {
        persist::read_json::<DeviceAuthCache>(&self.path)
            .filter(|cache| cache.version == STORE_VERSION)
    }

    /// Returns the cached token for `role`, only if the cache belongs to `device_id`.
    pub fn get(&self, device_id: &str, role: &str) -> Option<DeviceAuthEntry> {
        let cache = self.load()?;
        if cache.device_id != device_id {
            return None;
        }
        cache
            .tokens
            .get(role)
            .filter(|entry| !entry.token.is_empty())
            .cloned()
    }

    /// Returns every cached entry for `device_id`, ordered by role.
    pub fn load_all(&self, device_id: &str) -> Vec<DeviceAuthEntry> {
        match self.load() {
            Some(cache) if cache.device_id == device_id => cache.tokens.into_values().collect(),
            _ => Vec::new(),
        }
    }

    /// Replaces the entry for `role`, keeping other roles of the same device.
    ///
    /// If the existing file belongs to another device (or is unreadable), it is
    /// replaced by a fresh cache holding only this role.
    pub fn store(
        &self,
        device_id: &str,
        role: &str,
        token: &str,
        scopes: &[String],
    ) -> io::Result<DeviceAuthEntry> {
        let entry = DeviceAuthEntry {
            token: token.to_string(),
            role: role.to_string(),
            scopes: normalize_scopes(scopes),
            updated_at_ms: now_ms(),
        };

        persist::with_exclusive_lock(&self.path, || {
            let mut cache = persist::read_json_unlocked::<DeviceAuthCache>(&self.path)
                .filter(|c| c.version == STORE_VERSION && c.device_id == device_id)
                .unwrap_or_else(|| DeviceAuthCache::empty(device_id));
            cache.tokens.insert(role.to_string(), entry.clone());
            persist::write_json_private(&self.path, &cache)
        })??;

        tracing::info!(role = %role, scopes = ?entry.scopes, "stored device token");
        Ok(entry)
    }

    /// Removes the entry for `role` if the cache belongs to `device_id`.
    ///
    /// Returns whether an entry was removed. A cache for another device, or
    /// one without this role, is left untouched.
    pub fn clear(&self, device_id: &str, role: &str) -> io::Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }

        let removed = persist::with_exclusive_lock(&self.path, || -> io::Result<bool> {
            let Some(mut cache) = persist::read_json_unlocked::<DeviceAuthCache>(&self.path)
            else {
                return Ok(false);
            };
            if cache.version != STORE_VERSION
                || cache.device_id != device_id
                || cache.tokens.remove(role).is_none()
            {
                return Ok(false);
            }
            persist::write_json_private(&self.path, &cache)?;
            Ok(true)
        })??;

        if removed {
            tracing::info!(role = %role, "cleared device token");
        }
        Ok(removed)
    }
}
