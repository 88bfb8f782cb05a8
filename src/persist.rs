use std::{fs, io, path::PathBuf, sync::Arc};

use anyhow::{Context, Error};
use async_trait::async_trait;

use crate::{
    core::Run,
    registry::{RegistrySnapshot, RegistryState},
};

/// Durable store for a single snapshot blob.
pub trait Store: Send + Sync {
    /// `None` means no blob was ever written.
    fn read(&self) -> Result<Option<Vec<u8>>, Error>;
    /// Replaces the blob atomically with respect to concurrent readers.
    fn write(&self, blob: &[u8]) -> Result<(), Error>;
}

/// Single-file store. Writes go through a temp file in the same directory and
/// a rename, so readers never observe a partial blob.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Store for FileStore {
    fn read(&self) -> Result<Option<Vec<u8>>, Error> {
        match fs::read(&self.path) {
            Ok(x) => Ok(Some(x)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("unable to read snapshot file"),
        }
    }

    fn write(&self, blob: &[u8]) -> Result<(), Error> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, blob).context("unable to write snapshot temp file")?;
        fs::rename(&tmp, &self.path).context("unable to move snapshot file into place")?;

        Ok(())
    }
}

pub fn persist(registry: &RegistryState, store: &dyn Store) -> Result<(), Error> {
    let snapshot = registry.snapshot();
    let blob = serde_json::to_vec(&snapshot).context("unable to encode snapshot")?;
    store.write(&blob)?;

    Ok(())
}

/// Feeds the stored snapshot into the state machine. Returns whether a blob
/// was found; decode errors bubble up so the caller can log and start empty.
pub fn restore(registry: &RegistryState, store: &dyn Store) -> Result<bool, Error> {
    let blob = match store.read()? {
        Some(x) => x,
        None => return Ok(false),
    };

    let snapshot: RegistrySnapshot =
        serde_json::from_slice(&blob).context("unable to decode stored snapshot")?;
    registry.restore(snapshot);

    Ok(true)
}

/// Periodic task writing the state machine to the durable store.
pub struct Persister {
    registry: Arc<RegistryState>,
    store: Arc<dyn Store>,
}

impl Persister {
    pub fn new(registry: Arc<RegistryState>, store: Arc<dyn Store>) -> Self {
        Self { registry, store }
    }
}

#[async_trait]
impl Run for Persister {
    async fn run(&mut self) -> Result<(), Error> {
        persist(&self.registry, self.store.as_ref())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{core::Clock, registry::InstanceMeta};

    struct FixedClock(u64);

    impl Clock for FixedClock {
        fn now_ms(&self) -> u64 {
            self.0
        }
    }

    fn state() -> RegistryState {
        RegistryState::new(Arc::new(FixedClock(1_000)))
    }

    #[test]
    fn test_persist_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("snapshot.json"));

        let source = state();
        let instance = InstanceMeta::new("http", "10.0.0.5", 8080, "api");
        source.register("user.service", instance.clone());
        source.renew("user.service", &instance);

        persist(&source, &store).unwrap();

        let target = state();
        assert!(restore(&target, &store).unwrap());

        assert_eq!(
            target.get_all("user.service"),
            source.get_all("user.service")
        );
        assert_eq!(target.version("user.service"), 1);
        assert_eq!(target.timestamps(), source.timestamps());
        assert_eq!(target.snapshot_version(), source.snapshot_version());
    }

    #[test]
    fn test_restore_missing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("snapshot.json"));

        let target = state();
        assert!(!restore(&target, &store).unwrap());
        assert_eq!(target.snapshot_version(), 0);
    }

    #[test]
    fn test_restore_corrupt_blob() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        fs::write(&path, b"{ truncated").unwrap();

        let store = FileStore::new(path);
        let target = state();
        assert!(restore(&target, &store).is_err());
        // In-memory state untouched
        assert_eq!(target.snapshot_version(), 0);
    }

    #[test]
    fn test_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let store = FileStore::new(path.clone());

        store.write(b"{}").unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
