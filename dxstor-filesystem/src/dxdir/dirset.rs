//! Reference-counted directory entries
//!
//! Mirrors the file set: one in-memory `DxDir` per path, shared by all
//! openers, evicted when the last handle drops. Writes are serialized
//! through the WAL: append + fsync, apply, checkpoint, all under the set's
//! persist lock.

use dxstor_core::{DxError, Result};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{DirMetadata, DxDir};
use crate::dxpath::DxPath;
use crate::wal::{Wal, WalRecord};

struct EntryInner {
    dir: RwLock<DxDir>,
    refs: AtomicUsize,
}

struct Shared {
    root: PathBuf,
    wal: Arc<Wal>,
    map: Mutex<HashMap<DxPath, Arc<EntryInner>>>,
    /// Serializes append → apply → checkpoint cycles.
    persist_lock: Mutex<()>,
}

/// Manager of all open `DxDir` entries.
#[derive(Clone)]
pub struct DirSet {
    shared: Arc<Shared>,
}

/// Handle over one open directory.
pub struct DirEntry {
    shared: Arc<Shared>,
    path: DxPath,
    inner: Arc<EntryInner>,
}

impl DirSet {
    pub fn new(root: PathBuf, wal: Arc<Wal>) -> Self {
        Self {
            shared: Arc::new(Shared {
                root,
                wal,
                map: Mutex::new(HashMap::new()),
                persist_lock: Mutex::new(()),
            }),
        }
    }

    fn handle(&self, path: DxPath, inner: Arc<EntryInner>) -> DirEntry {
        inner.refs.fetch_add(1, Ordering::SeqCst);
        DirEntry {
            shared: self.shared.clone(),
            path,
            inner,
        }
    }

    /// Open an existing directory.
    pub fn open(&self, path: &DxPath) -> Result<DirEntry> {
        let mut map = self.shared.map.lock();
        if let Some(inner) = map.get(path) {
            return Ok(self.handle(path.clone(), inner.clone()));
        }
        let dir = DxDir::load(path.clone(), &self.shared.root)?;
        let inner = Arc::new(EntryInner {
            dir: RwLock::new(dir),
            refs: AtomicUsize::new(0),
        });
        map.insert(path.clone(), inner.clone());
        Ok(self.handle(path.clone(), inner))
    }

    /// Create a new directory; fails with `PathOverload` if it exists.
    pub fn create(&self, path: &DxPath) -> Result<DirEntry> {
        let mut map = self.shared.map.lock();
        if map.contains_key(path) {
            return Err(DxError::PathOverload(path.to_string()));
        }
        let dir = DxDir::create(path.clone(), &self.shared.root)?;
        let inner = Arc::new(EntryInner {
            dir: RwLock::new(dir),
            refs: AtomicUsize::new(0),
        });
        map.insert(path.clone(), inner.clone());
        Ok(self.handle(path.clone(), inner))
    }

    /// Open the directory, creating it (and nothing else) if missing.
    pub fn open_or_create(&self, path: &DxPath) -> Result<DirEntry> {
        match self.open(path) {
            Ok(entry) => Ok(entry),
            Err(DxError::UnknownPath(_)) => match self.create(path) {
                Ok(entry) => Ok(entry),
                // lost a race against another creator
                Err(DxError::PathOverload(_)) => self.open(path),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    pub fn exists(&self, path: &DxPath) -> bool {
        let map = self.shared.map.lock();
        map.contains_key(path) || path.dxdir_sys_path(&self.shared.root).exists()
    }

    pub fn delete(&self, path: &DxPath) -> Result<()> {
        let mut map = self.shared.map.lock();
        if let Some(inner) = map.remove(path) {
            return inner.dir.write().delete();
        }
        let entry = DxDir::load(path.clone(), &self.shared.root);
        match entry {
            Ok(mut dir) => dir.delete(),
            Err(DxError::UnknownPath(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl DirEntry {
    pub fn dx_path(&self) -> &DxPath {
        &self.path
    }

    pub fn metadata(&self) -> DirMetadata {
        self.inner.dir.read().metadata().clone()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, DxDir> {
        self.inner.dir.read()
    }

    /// Update the aggregates and persist through the WAL.
    pub fn update_metadata(&self, update: DirMetadata) -> Result<()> {
        let _persist = self.shared.persist_lock.lock();
        let encoded = {
            let mut dir = self.inner.dir.write();
            dir.update_metadata(update);
            dir.encoded()
        };
        self.shared.wal.append(&WalRecord {
            path: self
                .path
                .dxdir_sys_path(std::path::Path::new(""))
                .to_string_lossy()
                .into_owned(),
            data: encoded,
        })?;
        self.inner.dir.read().write_to_disk()?;
        self.shared.wal.checkpoint()?;
        Ok(())
    }
}

impl Drop for DirEntry {
    fn drop(&mut self) {
        let mut map = self.shared.map.lock();
        if self.inner.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(current) = map.get(&self.path) {
                if Arc::ptr_eq(current, &self.inner) {
                    map.remove(&self.path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn set(root: &std::path::Path) -> DirSet {
        let (wal, _) = Wal::open(&root.join("wal.log")).unwrap();
        DirSet::new(root.join("filesystem"), Arc::new(wal))
    }

    #[test]
    fn test_open_or_create_and_share() {
        let tmp = tempdir().unwrap();
        let ds = set(tmp.path());
        let path = DxPath::new("a").unwrap();

        let first = ds.open_or_create(&path).unwrap();
        let second = ds.open_or_create(&path).unwrap();
        assert_eq!(first.metadata(), second.metadata());
        assert!(ds.exists(&path));
    }

    #[test]
    fn test_update_metadata_persists() {
        let tmp = tempdir().unwrap();
        let ds = set(tmp.path());
        let path = DxPath::new("b").unwrap();

        let entry = ds.open_or_create(&path).unwrap();
        let mut update = entry.metadata();
        update.num_files = 12;
        update.health = 90;
        entry.update_metadata(update).unwrap();
        drop(entry);

        let reopened = ds.open(&path).unwrap();
        assert_eq!(reopened.metadata().num_files, 12);
        assert_eq!(reopened.metadata().health, 90);
    }

    #[test]
    fn test_create_rejects_existing() {
        let tmp = tempdir().unwrap();
        let ds = set(tmp.path());
        let path = DxPath::new("c").unwrap();
        let _keep = ds.create(&path).unwrap();
        assert!(matches!(ds.create(&path), Err(DxError::PathOverload(_))));
    }
}
