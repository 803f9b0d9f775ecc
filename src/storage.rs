use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// A flat name→record store persisted as a single JSON object. Every
/// mutation rewrites the whole file through a temp file and a rename, so
/// either the write lands or the prior file remains.
#[derive(Debug)]
pub struct FileStore<T> {
    path: PathBuf,
    data: HashMap<String, T>,
}

impl<T: Serialize + DeserializeOwned + Clone> FileStore<T> {
    /// Opens the store at `<dir>/<name>.json`. A missing or unreadable
    /// file starts the store empty.
    pub fn open(dir: &Path, name: &str) -> Self {
        let path = dir.join(format!("{name}.json"));
        let data = Self::load(&path);
        FileStore { path, data }
    }

    fn load(path: &Path) -> HashMap<String, T> {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(data) => data,
                Err(err) => {
                    log::warn!("Ignoring unreadable store at {path:?}: {err}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        }
    }

    /// Re-reads the backing file, discarding the in-memory view. Used when
    /// another process may have written the file since we opened it.
    pub fn reload(&mut self) {
        self.data = Self::load(&self.path);
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.data.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    pub fn get_all(&self) -> Vec<T> {
        self.data.values().cloned().collect()
    }

    pub fn set(&mut self, name: &str, value: T) -> Result<()> {
        self.data.insert(name.to_string(), value);
        self.save()
    }

    /// Removing an absent name is a no-op that still rewrites the file.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        self.data.remove(name);
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::File(self.path.clone(), e))?;
        }
        let contents = serde_json::to_string(&self.data)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents).map_err(|e| Error::File(tmp.clone(), e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| Error::File(self.path.clone(), e))?;
        Ok(())
    }
}
