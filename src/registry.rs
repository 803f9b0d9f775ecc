use std::path::Path;
use std::sync::Mutex;

use crate::error::Result;
use crate::models::{Service, StoredService, service_id};
use crate::storage::FileStore;

/// Durable mapping from service identity to its declared configuration.
pub struct ServiceRegistry {
    store: Mutex<FileStore<StoredService>>,
}

impl ServiceRegistry {
    pub fn open(storage_dir: &Path) -> Self {
        ServiceRegistry {
            store: Mutex::new(FileStore::open(storage_dir, "services")),
        }
    }

    /// Registers a service. A second create for the same identity is a
    /// no-op by design, not an error.
    pub fn create(&self, service: &Service, service_type: &str) -> Result<()> {
        let mut store = self.store.lock().expect("poisoned registry lock");
        let id = service_id(service);
        if store.has(&id) {
            return Ok(());
        }
        store.set(
            &id,
            StoredService {
                repository: service.repository.clone(),
                branch: service.branch.clone(),
                service_type: service_type.to_string(),
            },
        )
    }

    pub fn get(&self, id: &str) -> Option<StoredService> {
        let store = self.store.lock().expect("poisoned registry lock");
        store.get(id).cloned()
    }

    pub fn get_all(&self) -> Vec<StoredService> {
        let store = self.store.lock().expect("poisoned registry lock");
        store.get_all()
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut store = self.store.lock().expect("poisoned registry lock");
        store.delete(id)
    }

    pub fn reload(&self) {
        self.store.lock().expect("poisoned registry lock").reload();
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
    fn create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::open(dir.path());
        let svc = service("acme/app", "master");

        registry.create(&svc, "node").unwrap();
        registry.create(&svc, "deno").unwrap();

        let all = registry.get_all();
        assert_eq!(all.len(), 1);
        // The first registration wins.
        assert_eq!(all[0].service_type, "node");
    }

    #[test]
    fn branches_are_registered_independently() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::open(dir.path());

        registry.create(&service("acme/app", "master"), "node").unwrap();
        registry.create(&service("acme/app", "dev"), "node").unwrap();
        assert_eq!(registry.get_all().len(), 2);
    }

    #[test]
    fn delete_removes_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::open(dir.path());
        let svc = service("acme/app", "master");

        registry.create(&svc, "node").unwrap();
        registry.delete(&service_id(&svc)).unwrap();
        assert!(registry.get(&service_id(&svc)).is_none());
        assert!(registry.get_all().is_empty());
    }
}
