//! Ed25519 identities and their on-disk store.
//!
//! Identity files live under `~/.stardrift/identities/<name>.json`, one
//! identity per file, mode 0600 (directory 0700) on POSIX. The identity
//! id is the SHA-256 digest of the public key truncated to 16 bytes and
//! hex-encoded. Loading refuses any path whose resolved form escapes the
//! store directory, including via symlinks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::ClientError;
use crate::events::event::now_micros;

/// A named keypair plus derived identity id.
///
/// Immutable after creation except for `last_used`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub identity_id: String,
    /// Base64-encoded Ed25519 public key (32 bytes).
    pub public_key: String,
    /// Base64-encoded Ed25519 secret key (32 bytes).
    pub private_key: String,
    /// Microseconds since the Unix epoch.
    pub created_at: i64,
    pub last_used: i64,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Identity {
    /// Generate a fresh identity with a new Ed25519 keypair.
    pub fn generate(
        name: impl Into<String>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Identity {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        let verifying = signing.verifying_key();
        let now = now_micros();
        Identity {
            name: name.into(),
            identity_id: derive_identity_id(verifying.as_bytes()),
            public_key: BASE64.encode(verifying.as_bytes()),
            private_key: BASE64.encode(signing.to_bytes()),
            created_at: now,
            last_used: now,
            metadata,
        }
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, ClientError> {
        let signing = self.signing_key()?;
        Ok(signing.sign(data).to_bytes().to_vec())
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let verifying = match self.verifying_key() {
            Ok(key) => key,
            Err(_) => return false,
        };
        let signature = match Signature::from_slice(signature) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        verifying.verify(data, &signature).is_ok()
    }

    fn signing_key(&self) -> Result<SigningKey, ClientError> {
        let bytes = BASE64
            .decode(&self.private_key)
            .map_err(|e| ClientError::SignatureInvalid(format!("bad private key: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ClientError::SignatureInvalid("private key must be 32 bytes".into()))?;
        Ok(SigningKey::from_bytes(&bytes))
    }

    fn verifying_key(&self) -> Result<VerifyingKey, ClientError> {
        let bytes = BASE64
            .decode(&self.public_key)
            .map_err(|e| ClientError::SignatureInvalid(format!("bad public key: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ClientError::SignatureInvalid("public key must be 32 bytes".into()))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| ClientError::SignatureInvalid(e.to_string()))
    }
}

/// Identity id: hex of the first 16 bytes of SHA-256(public key).
pub fn derive_identity_id(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..16])
}

/// On-disk identity (and optional token) store.
pub struct IdentityStore {
    dir: PathBuf,
}

impl IdentityStore {
    /// Open (creating if needed) the default store at
    /// `~/.stardrift/identities`.
    pub fn open_default() -> Result<IdentityStore, ClientError> {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .ok_or_else(|| ClientError::Config("HOME is not set".into()))?;
        Self::open(home.join(".stardrift").join("identities"))
    }

    /// Open (creating if needed) a store at an explicit directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<IdentityStore, ClientError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| ClientError::Config(format!("creating {}: {}", dir.display(), e)))?;
        restrict_dir_permissions(&dir)?;
        Ok(IdentityStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create, persist and return a new identity.
    pub fn create(
        &self,
        name: &str,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<Identity, ClientError> {
        let identity = Identity::generate(name, metadata);
        self.save(&identity)?;
        info!(name, identity_id = %identity.identity_id, "created identity");
        Ok(identity)
    }

    pub fn save(&self, identity: &Identity) -> Result<(), ClientError> {
        let path = self.validated_path(&format!("{}.json", identity.name))?;
        let json = serde_json::to_string_pretty(identity)?;
        std::fs::write(&path, json)
            .map_err(|e| ClientError::Config(format!("writing {}: {}", path.display(), e)))?;
        restrict_file_permissions(&path)?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<Option<Identity>, ClientError> {
        let path = self.validated_path(&format!("{}.json", name))?;
        if !path.exists() {
            return Ok(None);
        }
        self.check_resolved_inside(&path)?;
        let json = std::fs::read_to_string(&path)
            .map_err(|e| ClientError::Config(format!("reading {}: {}", path.display(), e)))?;
        let identity: Identity = serde_json::from_str(&json)?;
        Ok(Some(identity))
    }

    /// Load an existing identity by name or create it if absent.
    pub fn get_or_create(&self, name: &str) -> Result<Identity, ClientError> {
        match self.load(name)? {
            Some(identity) => Ok(identity),
            None => self.create(name, BTreeMap::new()),
        }
    }

    pub fn list(&self) -> Result<Vec<Identity>, ClientError> {
        let mut out = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| ClientError::Config(format!("listing {}: {}", self.dir.display(), e)))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_identity = path.extension().map(|e| e == "json").unwrap_or(false)
                && !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(".token.json"))
                    .unwrap_or(false);
            if !is_identity {
                continue;
            }
            if self.check_resolved_inside(&path).is_err() {
                warn!(path = %path.display(), "skipping identity file outside store");
                continue;
            }
            match std::fs::read_to_string(&path)
                .ok()
                .and_then(|json| serde_json::from_str::<Identity>(&json).ok())
            {
                Some(identity) => out.push(identity),
                None => warn!(path = %path.display(), "skipping unreadable identity file"),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub fn delete(&self, name: &str) -> Result<bool, ClientError> {
        let path = self.validated_path(&format!("{}.json", name))?;
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)
            .map_err(|e| ClientError::Config(format!("deleting {}: {}", path.display(), e)))?;
        // The companion token file, if any, goes with it.
        let token_path = self.validated_path(&format!("{}.token.json", name))?;
        let _ = std::fs::remove_file(token_path);
        Ok(true)
    }

    pub fn touch_last_used(&self, name: &str) -> Result<(), ClientError> {
        if let Some(mut identity) = self.load(name)? {
            identity.last_used = now_micros();
            self.save(&identity)?;
        }
        Ok(())
    }

    /// Persist a token next to its identity, mode 0600.
    pub fn save_token(
        &self,
        name: &str,
        token: &crate::auth::token::AuthToken,
    ) -> Result<(), ClientError> {
        let path = self.validated_path(&format!("{}.token.json", name))?;
        std::fs::write(&path, serde_json::to_string_pretty(token)?)
            .map_err(|e| ClientError::Config(format!("writing {}: {}", path.display(), e)))?;
        restrict_file_permissions(&path)?;
        Ok(())
    }

    pub fn load_token(
        &self,
        name: &str,
    ) -> Result<Option<crate::auth::token::AuthToken>, ClientError> {
        let path = self.validated_path(&format!("{}.token.json", name))?;
        if !path.exists() {
            return Ok(None);
        }
        self.check_resolved_inside(&path)?;
        let json = std::fs::read_to_string(&path)
            .map_err(|e| ClientError::Config(format!("reading {}: {}", path.display(), e)))?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    // -- path validation --

    /// Build a path inside the store, rejecting separator or traversal
    /// tricks in the file name.
    fn validated_path(&self, file_name: &str) -> Result<PathBuf, ClientError> {
        let valid = !file_name.is_empty()
            && !file_name.starts_with('.')
            && file_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(ClientError::Config(format!(
                "invalid identity file name '{}'",
                file_name
            )));
        }
        Ok(self.dir.join(file_name))
    }

    /// Reject files whose resolved absolute path (symlinks followed) is
    /// not inside the store directory.
    fn check_resolved_inside(&self, path: &Path) -> Result<(), ClientError> {
        let resolved_dir = self
            .dir
            .canonicalize()
            .map_err(|e| ClientError::Config(format!("resolving store dir: {}", e)))?;
        let resolved = path
            .canonicalize()
            .map_err(|e| ClientError::Config(format!("resolving {}: {}", path.display(), e)))?;
        if !resolved.starts_with(&resolved_dir) {
            return Err(ClientError::Config(format!(
                "identity path {} escapes the store directory",
                path.display()
            )));
        }
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_dir_permissions(dir: &Path) -> Result<(), ClientError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| ClientError::Config(format!("chmod {}: {}", dir.display(), e)))
}

#[cfg(not(unix))]
fn restrict_dir_permissions(_dir: &Path) -> Result<(), ClientError> {
    Ok(())
}

#[cfg(unix)]
fn restrict_file_permissions(path: &Path) -> Result<(), ClientError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| ClientError::Config(format!("chmod {}: {}", path.display(), e)))
}

#[cfg(not(unix))]
fn restrict_file_permissions(_path: &Path) -> Result<(), ClientError> {
    Ok(())
}
