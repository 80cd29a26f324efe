//! Ed25519 signing key management.
//!
//! The active keypair lives on disk as a hex-encoded 64-byte private key
//! (seed followed by public key) with 0600 permissions. All writes are
//! atomic: temp file in the same directory, fsync, rename. Rotation backs
//! the previous file up to `<path>.old` and swaps the in-process key behind
//! a lock, so the ledger worker observes the new key on its next use.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroizing;

/// Size of an Ed25519 seed in bytes.
pub const SEED_SIZE: usize = 32;

/// Size of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a detached Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Errors that can occur during key operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeyError {
    /// The key file could not be read, parsed, or has unsafe permissions.
    #[error("failed to load signing key from {path}: {reason}")]
    KeyLoadFailed {
        /// Path of the offending key file.
        path: String,
        /// What went wrong.
        reason: String,
    },

    /// Rotation could not be completed; the previous key remains active.
    #[error("failed to rotate signing key: {reason}")]
    KeyRotateFailed {
        /// What went wrong.
        reason: String,
    },
}

/// The active Ed25519 keypair.
///
/// `sign` uses whichever key is active at call time; rotation replaces it
/// atomically on disk and in process.
pub struct Signer {
    path: PathBuf,
    active: RwLock<SigningKey>,
}

/// A rotation that has been generated but not yet persisted.
///
/// The ledger worker uses the window between [`Signer::begin_rotation`] and
/// [`Signer::commit_rotation`] to write the rekey event under the outgoing
/// key while already knowing the incoming public key.
pub struct PendingRotation {
    new_key: SigningKey,
}

impl PendingRotation {
    /// Hex encoding of the incoming public key.
    #[must_use]
    pub fn new_public_key_hex(&self) -> String {
        hex::encode(self.new_key.verifying_key().to_bytes())
    }
}

impl Signer {
    /// Loads the keypair at `path`, generating and persisting a fresh one
    /// if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::KeyLoadFailed`] if the file exists but cannot be
    /// parsed, has permissions wider than 0600, or a fresh key cannot be
    /// written.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, KeyError> {
        let path = path.as_ref().to_path_buf();

        let key = if path.exists() {
            read_key_file(&path)?
        } else {
            let key = SigningKey::generate(&mut OsRng);
            write_key_file(&path, &key).map_err(|e| KeyError::KeyLoadFailed {
                path: path.display().to_string(),
                reason: format!("could not persist generated key: {e}"),
            })?;
            key
        };

        Ok(Self {
            path,
            active: RwLock::new(key),
        })
    }

    /// Hex encoding of the active public key.
    #[must_use]
    pub fn public_key_hex(&self) -> String {
        let key = self.active.read().expect("signer lock poisoned");
        hex::encode(key.verifying_key().to_bytes())
    }

    /// Short identifier of the active signing key (leading 8 hex chars of
    /// the public key). The derivation is stable across rotations.
    #[must_use]
    pub fn key_id(&self) -> String {
        self.public_key_hex()[..8].to_string()
    }

    /// Produces a detached deterministic signature over `msg`.
    #[must_use]
    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_SIZE] {
        let key = self.active.read().expect("signer lock poisoned");
        key.sign(msg).to_bytes()
    }

    /// Verifies `sig` over `msg` against a raw 32-byte public key.
    #[must_use]
    pub fn verify(public_key: &[u8], msg: &[u8], sig: &[u8]) -> bool {
        let Ok(bytes) = <&[u8; PUBLIC_KEY_SIZE]>::try_from(public_key) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(bytes) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(sig) else {
            return false;
        };
        key.verify(msg, &sig).is_ok()
    }

    /// Generates the incoming keypair for a rotation without activating it.
    #[must_use]
    pub fn begin_rotation(&self) -> PendingRotation {
        PendingRotation {
            new_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Persists a pending rotation and activates the new key.
    ///
    /// The current file is renamed to `<path>.old`, the new key is written
    /// atomically, and the in-process key is swapped. Returns the old and
    /// new public keys as hex.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::KeyRotateFailed`] if the backup rename or the
    /// new key write fails; the previous key stays active in that case.
    pub fn commit_rotation(&self, pending: PendingRotation) -> Result<(String, String), KeyError> {
        let old_pub = self.public_key_hex();
        let new_pub = pending.new_public_key_hex();

        let backup = backup_path(&self.path);
        fs::rename(&self.path, &backup).map_err(|e| KeyError::KeyRotateFailed {
            reason: format!("could not back up key file to {}: {e}", backup.display()),
        })?;

        if let Err(e) = write_key_file(&self.path, &pending.new_key) {
            // Restore the backup so the active key stays loadable on disk.
            let _ = fs::rename(&backup, &self.path);
            return Err(KeyError::KeyRotateFailed {
                reason: format!("could not write new key file: {e}"),
            });
        }

        *self.active.write().expect("signer lock poisoned") = pending.new_key;
        Ok((old_pub, new_pub))
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".old");
    PathBuf::from(name)
}

fn read_key_file(path: &Path) -> Result<SigningKey, KeyError> {
    let load_err = |reason: String| KeyError::KeyLoadFailed {
        path: path.display().to_string(),
        reason,
    };

    let metadata = fs::metadata(path).map_err(|e| load_err(e.to_string()))?;
    let mode = metadata.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(load_err(format!(
            "insecure permissions {:o}; expected 0600",
            mode & 0o777
        )));
    }

    let contents = Zeroizing::new(
        fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?,
    );
    let bytes = Zeroizing::new(
        hex::decode(contents.trim()).map_err(|e| load_err(format!("invalid hex: {e}")))?,
    );
    if bytes.len() != SEED_SIZE + PUBLIC_KEY_SIZE {
        return Err(load_err(format!(
            "expected {} bytes, found {}",
            SEED_SIZE + PUBLIC_KEY_SIZE,
            bytes.len()
        )));
    }

    let mut seed = Zeroizing::new([0u8; SEED_SIZE]);
    seed.copy_from_slice(&bytes[..SEED_SIZE]);
    let key = SigningKey::from_bytes(&seed);

    if key.verifying_key().to_bytes() != bytes[SEED_SIZE..] {
        return Err(load_err(
            "public half does not match the seed; key file is corrupt".to_string(),
        ));
    }

    Ok(key)
}

/// Writes `key` to `path` atomically: 0600 temp file in the same
/// directory, fsync, rename.
fn write_key_file(path: &Path, key: &SigningKey) -> std::io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let dir = dir.map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let mut encoded = Zeroizing::new(String::with_capacity(2 * (SEED_SIZE + PUBLIC_KEY_SIZE)));
    encoded.push_str(&hex::encode(key.to_bytes()));
    encoded.push_str(&hex::encode(key.verifying_key().to_bytes()));

    // NamedTempFile is created 0600 on unix; set it explicitly anyway.
    let mut temp = tempfile::Builder::new()
        .prefix(".vouch_key_tmp")
        .tempfile_in(&dir)?;
    temp.as_file_mut().write_all(encoded.as_bytes())?;
    temp.as_file().sync_all()?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
