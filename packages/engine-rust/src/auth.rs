//! Device identity persistence and challenge signing.
//!
//! The engine treats credentials as opaque: whatever the key store emits for
//! a challenge is forwarded to the relay verbatim. The key store keeps a
//! random 32-byte device key plus the relay-assigned device id in a small
//! file under the storage root.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use uuid::Uuid;

use crate::error::{Result, StoreError};

const KEYSTORE_FILE: &str = "keystore.bin";

#[derive(Debug, Serialize, Deserialize)]
struct KeyStoreFile {
    #[serde(with = "serde_bytes")]
    key: Vec<u8>,
    device_id: Option<Uuid>,
}

/// Persistent device identity: an opaque signing key and, once registered,
/// the relay-assigned device id.
#[derive(Debug)]
pub struct KeyStore {
    path: PathBuf,
    key: Vec<u8>,
    device_id: Option<Uuid>,
}

impl KeyStore {
    /// Loads the key store under `root`, creating a fresh identity if none
    /// exists yet.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::StorageFailure`] on unreadable or undecodable
    /// key files.
    pub fn load_or_create(root: &Path) -> Result<Self> {
        let path = root.join(KEYSTORE_FILE);
        if path.exists() {
            let bytes = fs::read(&path)?;
            let file: KeyStoreFile = rmp_serde::from_slice(&bytes).map_err(|err| {
                StoreError::StorageFailure(format!("key store {} is unreadable: {err}", path.display()))
            })?;
            return Ok(Self {
                path,
                key: file.key,
                device_id: file.device_id,
            });
        }

        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(Uuid::new_v4().as_bytes());
        key.extend_from_slice(Uuid::new_v4().as_bytes());
        let store = Self {
            path,
            key,
            device_id: None,
        };
        store.persist()?;
        Ok(store)
    }

    /// The relay-assigned device id, if this device has registered.
    #[must_use]
    pub fn device_id(&self) -> Option<Uuid> {
        self.device_id
    }

    /// Records the device id assigned by the relay.
    pub fn set_device_id(&mut self, device_id: Uuid) -> Result<()> {
        self.device_id = Some(device_id);
        self.persist()
    }

    /// Produces the opaque credential for a login challenge.
    #[must_use]
    pub fn sign(&self, challenge: &[u8]) -> Vec<u8> {
        let mut hasher = Sha3_256::new();
        hasher.update(&self.key);
        hasher.update(challenge);
        hasher.finalize().to_vec()
    }

    fn persist(&self) -> Result<()> {
        let file = KeyStoreFile {
            key: self.key.clone(),
            device_id: self.device_id,
        };
        let bytes = rmp_serde::to_vec_named(&file).map_err(|err| {
            StoreError::StorageFailure(format!("key store encode failed: {err}"))
        })?;
        fs::write(&self.path, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn identity_persists_across_loads() {
        let dir = TempDir::new().unwrap();

        let mut first = KeyStore::load_or_create(dir.path()).unwrap();
        assert!(first.device_id().is_none());
        let signature = first.sign(b"challenge");

        let device_id = Uuid::new_v4();
        first.set_device_id(device_id).unwrap();
        drop(first);

        let second = KeyStore::load_or_create(dir.path()).unwrap();
        assert_eq!(second.device_id(), Some(device_id));
        assert_eq!(second.sign(b"challenge"), signature);
    }

    #[test]
    fn signatures_depend_on_the_challenge() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::load_or_create(dir.path()).unwrap();
        assert_ne!(store.sign(b"one"), store.sign(b"two"));
    }

    #[test]
    fn distinct_devices_have_distinct_keys() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = KeyStore::load_or_create(dir_a.path()).unwrap();
        let b = KeyStore::load_or_create(dir_b.path()).unwrap();
        assert_ne!(a.sign(b"challenge"), b.sign(b"challenge"));
    }
}
