use std::path::Path;
use std::sync::Mutex;

use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::{Error, Result};
use crate::models::{Service, sha256_hex};
use crate::storage::FileStore;

/// Webhook secrets, one per repository (branches of a repository share a
/// key). Every mutation hits the backing file synchronously so a freshly
/// issued key survives a crash.
pub struct KeyManager {
    store: Mutex<FileStore<String>>,
}

impl KeyManager {
    pub fn open(storage_dir: &Path) -> Self {
        KeyManager {
            store: Mutex::new(FileStore::open(storage_dir, "serviceKeys")),
        }
    }

    /// Issues a new secret. Fails if the repository already has one; the
    /// existing secret stays untouched.
    pub fn create_key(&self, service: &Service) -> Result<String> {
        let mut store = self.store.lock().expect("poisoned key store lock");
        let key_id = sha256_hex(&service.repository);
        if let Some(existing) = store.get(&key_id) {
            return Err(Error::AlreadyExists(format!(
                "Service already exists, key is {existing}"
            )));
        }

        let mut entropy = [0u8; 256];
        OsRng.fill_bytes(&mut entropy);
        let secret = sha256_hex(&hex::encode(entropy));

        store.set(&key_id, secret.clone())?;
        Ok(secret)
    }

    pub fn get_key(&self, service: &Service) -> Option<String> {
        let store = self.store.lock().expect("poisoned key store lock");
        store.get(&sha256_hex(&service.repository)).cloned()
    }

    /// Idempotent: deleting an absent key is not an error.
    pub fn delete_key(&self, service: &Service) -> Result<()> {
        let mut store = self.store.lock().expect("poisoned key store lock");
        store.delete(&sha256_hex(&service.repository))
    }

    pub fn reload(&self) {
        self.store.lock().expect("poisoned key store lock").reload();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(repository: &str, branch: &str) -> Service {
        Service {
            repository: repository.to_string(),
            branch: branch.to_string(),
        }
    }

    #[test]
    fn create_is_not_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyManager::open(dir.path());
        let svc = service("acme/app", "master");

        let secret = keys.create_key(&svc).unwrap();
        assert!(matches!(
            keys.create_key(&svc),
            Err(Error::AlreadyExists(_))
        ));
        // The original secret survives the failed second attempt.
        assert_eq!(keys.get_key(&svc), Some(secret));
    }

    #[test]
    fn key_is_shared_across_branches_of_a_repository() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyManager::open(dir.path());

        let secret = keys.create_key(&service("acme/app", "master")).unwrap();
        assert_eq!(keys.get_key(&service("acme/app", "feature-x")), Some(secret));
    }

    #[test]
    fn distinct_repositories_get_distinct_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyManager::open(dir.path());

        let a = keys.create_key(&service("acme/app", "master")).unwrap();
        let b = keys.create_key(&service("acme/other", "master")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyManager::open(dir.path());
        let svc = service("acme/app", "master");

        keys.create_key(&svc).unwrap();
        keys.delete_key(&svc).unwrap();
        keys.delete_key(&svc).unwrap();
        assert_eq!(keys.get_key(&svc), None);
    }
}
