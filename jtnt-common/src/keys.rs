//! Ed25519 agent identity keys.
//!
//! The keypair is generated once at enrollment. The public key is pinned
//! by the hub; the private key stays on disk with owner-only permissions
//! and signs audit entries for the agent's lifetime.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::path::Path;
use thiserror::Error;

/// File name of the stored private key, relative to the certs directory.
pub const KEY_FILE: &str = "agent.key";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to read key file: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to write key file: {0}")]
    Write(#[source] std::io::Error),

    #[error("invalid key encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

/// An Ed25519 signing keypair.
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Generate a fresh keypair from the OS entropy source.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Base64 of the 32-byte public key, as sent in the enroll request.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.signing.verifying_key().as_bytes())
    }

    /// Persist the private key (base64 seed) with owner-only permissions.
    pub fn save(&self, dir: &Path) -> Result<(), KeyError> {
        std::fs::create_dir_all(dir).map_err(KeyError::Write)?;
        let path = dir.join(KEY_FILE);
        let encoded = BASE64.encode(self.signing.to_bytes());
        std::fs::write(&path, encoded.as_bytes()).map_err(KeyError::Write)?;
        set_owner_only(&path).map_err(KeyError::Write)?;
        Ok(())
    }

    /// Load a previously saved keypair.
    pub fn load(dir: &Path) -> Result<Self, KeyError> {
        let data = std::fs::read_to_string(dir.join(KEY_FILE)).map_err(KeyError::Read)?;
        let bytes = BASE64.decode(data.trim())?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| KeyError::Length {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
        })
    }
}

/// Decode a base64 public key into a verifying key.
pub fn parse_public_key(encoded: &str) -> Result<VerifyingKey, KeyError> {
    let bytes = BASE64.decode(encoded.trim())?;
    let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| KeyError::Length {
        expected: 32,
        actual: bytes.len(),
    })?;
    VerifyingKey::from_bytes(&arr).map_err(|_| KeyError::Length {
        expected: 32,
        actual: bytes.len(),
    })
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
