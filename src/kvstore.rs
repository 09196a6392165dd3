//! Persistent key-value store (C1): atomic read/write/remove of small named
//! blobs. Only one key is used by the core, `model::STATE_KEY`, but the
//! contract is general.

use crate::error::{self, Result};
use snafu::{OptionExt, ResultExt};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

pub trait KeyValueStore {
    fn write_all(&self, key: &str, bytes: &[u8]) -> Result<()>;
    fn read_all(&self, key: &str) -> Result<Vec<u8>>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Writes each key as its own file in `dir`, through a tempfile created in
/// the same directory and persisted over the destination. This is the same
/// atomic-rename pattern used to write the update status file: the crash
/// window is "tempfile half-written", never "destination half-written".
pub struct FileKeyValueStore {
    dir: PathBuf,
}

impl FileKeyValueStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).context(error::CreateStoreDirSnafu { path: dir.clone() })?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn write_all(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let dest = self.path_for(key);
        let tempfile = tempfile::NamedTempFile::new_in(&self.dir).context(
            error::CreateTempfileSnafu {
                key: key.to_string(),
            },
        )?;
        fs::write(tempfile.path(), bytes).context(error::CreateTempfileSnafu {
            key: key.to_string(),
        })?;
        tempfile
            .persist(&dest)
            .context(error::PersistStoreFileSnafu { path: dest })?;
        Ok(())
    }

    fn read_all(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => error::NotFoundSnafu {
                key: key.to_string(),
            }
            .fail(),
            Err(source) => Err(source).context(error::ReadStoreKeySnafu {
                key: key.to_string(),
            }),
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(source).context(error::RemoveStoreKeySnafu {
                key: key.to_string(),
            }),
        }
    }
}

/// In-memory store backing unit tests, analogous to the fakes the examples
/// substitute for filesystem-backed collaborators.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn write_all(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read_all(&self, key: &str) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .get(key)
            .cloned()
            .context(error::NotFoundSnafu {
                key: key.to_string(),
            })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_roundtrips() {
        let store = MemoryKeyValueStore::new();
        store.write_all("state", b"hello").unwrap();
        assert_eq!(store.read_all("state").unwrap(), b"hello");
        store.remove("state").unwrap();
        assert!(matches!(
            store.read_all("state"),
            Err(error::Error::NotFound { .. })
        ));
    }

    #[test]
    fn file_store_roundtrips_and_is_atomic_on_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::new(dir.path()).unwrap();
        store.write_all("state", b"v1").unwrap();
        assert_eq!(store.read_all("state").unwrap(), b"v1");
        store.write_all("state", b"v2-longer-value").unwrap();
        assert_eq!(store.read_all("state").unwrap(), b"v2-longer-value");
        store.remove("state").unwrap();
        assert!(matches!(
            store.read_all("state"),
            Err(error::Error::NotFound { .. })
        ));
    }

    #[test]
    fn file_store_remove_of_missing_key_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyValueStore::new(dir.path()).unwrap();
        store.remove("nope").unwrap();
    }
}
