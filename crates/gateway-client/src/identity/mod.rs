//! Device identity and token cache persistence.
//!
//! Both stores live under `<state_dir>/identity/` and share the locked,
//! owner-only JSON writer in [`persist`].

pub mod auth;
pub mod device;
pub mod persist;

pub use auth::{device_auth_path, DeviceAuthCache, DeviceAuthEntry, DeviceAuthStore};
pub use device::{device_identity_path, load_or_create_device_identity, DeviceIdentityStore};
