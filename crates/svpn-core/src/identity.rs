//! Device identity management.
//!
//! Each installation has a long-lived opaque identifier used as the lease
//! holder id. It is derived once from the OS machine id (hashed, never sent
//! raw) or from a random UUID, persisted, and reused on every run.

use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Prefix marking derived device identities.
const IDENTITY_PREFIX: &str = "d-";

/// Supplies the caller identity used to authenticate and attribute store calls.
pub trait IdentityProvider: Send + Sync {
    /// Return the identity, creating it on first use.
    fn ensure_identity(&self) -> Result<String>;
}

/// A persisted device identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    id: String,
}

impl DeviceIdentity {
    /// Wrap an existing identity string.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(Error::Identity("identity must not be empty".into()));
        }
        Ok(Self { id })
    }

    /// Derive a fresh identity from the OS machine id, or a random UUID when
    /// no machine id is available.
    pub fn derive() -> Self {
        let raw = os_machine_id().unwrap_or_else(|| {
            debug!("No OS machine id available; using random identity seed");
            uuid::Uuid::new_v4().to_string()
        });
        Self {
            id: fingerprint(&raw),
        }
    }

    /// The identity string.
    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// Save the identity to a file with restrictive permissions.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, &self.id)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Load an identity from a file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::new(content).map_err(|_| {
            Error::Identity(format!("identity file {} is empty", path.display()))
        })
    }

    /// Load from file, or derive a new identity and save it.
    ///
    /// An unreadable or empty file is replaced; a valid one is never
    /// regenerated.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            match Self::load_from_file(path) {
                Ok(identity) => return Ok(identity),
                Err(e) => {
                    info!(path = %path.display(), error = %e, "Replacing unusable identity file");
                }
            }
        }
        let identity = Self::derive();
        identity.save_to_file(path)?;
        info!(path = %path.display(), "Created device identity");
        Ok(identity)
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

impl IdentityProvider for DeviceIdentity {
    fn ensure_identity(&self) -> Result<String> {
        Ok(self.id.clone())
    }
}

/// Identity backed by a file that is created lazily on first use.
#[derive(Debug, Clone)]
pub struct FileIdentityProvider {
    path: std::path::PathBuf,
}

impl FileIdentityProvider {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl IdentityProvider for FileIdentityProvider {
    fn ensure_identity(&self) -> Result<String> {
        DeviceIdentity::load_or_create(&self.path).map(|identity| identity.id)
    }
}

/// Stable hashed identifier: `d-` followed by 32 hex chars of SHA-256.
pub fn fingerprint(raw: &str) -> String {
    let hash = Sha256::digest(raw.trim().as_bytes());
    let hex = hex::encode(hash);
    format!("{IDENTITY_PREFIX}{}", &hex[..32])
}

#[cfg(target_os = "linux")]
fn os_machine_id() -> Option<String> {
    ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
}

#[cfg(target_os = "macos")]
fn os_machine_id() -> Option<String> {
    let output = std::process::Command::new("ioreg")
        .args(["-rd1", "-c", "IOPlatformExpertDevice"])
        .output()
        .ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    let start = text.find("IOPlatformUUID\" = \"")? + "IOPlatformUUID\" = \"".len();
    let len = text[start..].find('"')?;
    Some(text[start..start + len].to_string()).filter(|s| !s.is_empty())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn os_machine_id() -> Option<String> {
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_prefixed_and_stable() {
        let a = fingerprint("machine-123");
        let b = fingerprint("machine-123\n");
        assert_eq!(a, b);
        assert!(a.starts_with("d-"));
        assert_eq!(a.len(), 2 + 32);
        assert_ne!(a, fingerprint("machine-124"));
    }

    #[test]
    fn load_or_create_persists_and_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("device.id");

        let first = DeviceIdentity::load_or_create(&path).unwrap();
        let second = DeviceIdentity::load_or_create(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first.as_str());
    }

    #[test]
    fn existing_identity_is_never_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.id");
        std::fs::write(&path, "d-custom\n").unwrap();

        let identity = DeviceIdentity::load_or_create(&path).unwrap();
        assert_eq!(identity.as_str(), "d-custom");
    }

    #[test]
    fn empty_identity_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.id");
        std::fs::write(&path, "  ").unwrap();

        let identity = DeviceIdentity::load_or_create(&path).unwrap();
        assert!(identity.as_str().starts_with("d-"));
    }

    #[cfg(unix)]
    #[test]
    fn identity_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.id");
        DeviceIdentity::load_or_create(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn file_provider_creates_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.id");
        let provider = FileIdentityProvider::new(&path);
        assert!(!path.exists());
        let id = provider.ensure_identity().unwrap();
        assert_eq!(provider.ensure_identity().unwrap(), id);
    }

    #[test]
    fn rejects_empty_identity() {
        assert!(DeviceIdentity::new("   ").is_err());
    }
}
