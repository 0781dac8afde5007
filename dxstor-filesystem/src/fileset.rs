//! Reference-counted file entries
//!
//! The file set keeps at most one in-memory `DxFile` per path. Concurrent
//! openers share the entry; the entry is evicted once the last handle drops.
//! Lock order: the set map lock is always taken before any entry lock.

use dxstor_core::{DxError, Result};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::dxfile::{DxFile, NewFileParams};
use crate::dxpath::DxPath;

struct EntryInner {
    file: RwLock<DxFile>,
    refs: AtomicUsize,
}

struct Shared {
    root: PathBuf,
    map: Mutex<HashMap<DxPath, Arc<EntryInner>>>,
}

/// Manager of all open `DxFile` entries.
#[derive(Clone)]
pub struct FileSet {
    shared: Arc<Shared>,
}

/// Handle over one open file. Dropping the last handle for a path evicts
/// the in-memory entry.
pub struct FileEntry {
    shared: Arc<Shared>,
    path: DxPath,
    inner: Arc<EntryInner>,
}

impl FileSet {
    pub fn new(root: PathBuf) -> Self {
        Self {
            shared: Arc::new(Shared {
                root,
                map: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.shared.root
    }

    fn handle(&self, path: DxPath, inner: Arc<EntryInner>) -> FileEntry {
        inner.refs.fetch_add(1, Ordering::SeqCst);
        FileEntry {
            shared: self.shared.clone(),
            path,
            inner,
        }
    }

    /// Open an existing file, sharing any entry already in memory.
    pub fn open(&self, path: &DxPath) -> Result<FileEntry> {
        let mut map = self.shared.map.lock();
        if let Some(inner) = map.get(path) {
            return Ok(self.handle(path.clone(), inner.clone()));
        }
        let sys_path = path.dxfile_sys_path(&self.shared.root);
        let file = DxFile::load(&sys_path).map_err(|e| match e {
            DxError::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound => {
                DxError::UnknownPath(path.to_string())
            }
            other => other,
        })?;
        let inner = Arc::new(EntryInner {
            file: RwLock::new(file),
            refs: AtomicUsize::new(0),
        });
        map.insert(path.clone(), inner.clone());
        Ok(self.handle(path.clone(), inner))
    }

    /// Create a new file entry. With `overwrite` an existing entry at the
    /// path is deleted first; otherwise the path must be free.
    pub fn new_dx_file(&self, params: NewFileParams, overwrite: bool) -> Result<FileEntry> {
        let path = params.dx_path.clone();
        let sys_path = path.dxfile_sys_path(&self.shared.root);

        let mut map = self.shared.map.lock();
        let in_memory = map.contains_key(&path);
        if in_memory || sys_path.exists() {
            if !overwrite {
                return Err(DxError::PathOverload(path.to_string()));
            }
            if let Some(existing) = map.remove(&path) {
                existing.file.write().delete()?;
            } else {
                std::fs::remove_file(&sys_path)?;
            }
            debug!(path = %path, "replaced existing file entry");
        }

        let file = DxFile::create(&sys_path, params)?;
        let inner = Arc::new(EntryInner {
            file: RwLock::new(file),
            refs: AtomicUsize::new(0),
        });
        map.insert(path.clone(), inner.clone());
        Ok(self.handle(path, inner))
    }

    /// Whether a file exists at the path, in memory or on disk.
    pub fn exists(&self, path: &DxPath) -> bool {
        let map = self.shared.map.lock();
        map.contains_key(path) || path.dxfile_sys_path(&self.shared.root).exists()
    }

    /// Delete a file from the set and from disk.
    pub fn delete(&self, path: &DxPath) -> Result<()> {
        let mut map = self.shared.map.lock();
        if let Some(inner) = map.remove(path) {
            inner.file.write().delete()?;
            return Ok(());
        }
        let sys_path = path.dxfile_sys_path(&self.shared.root);
        match std::fs::remove_file(&sys_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DxError::UnknownPath(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Number of entries currently held in memory.
    pub fn open_entries(&self) -> usize {
        self.shared.map.lock().len()
    }
}

impl FileEntry {
    pub fn dx_path(&self) -> &DxPath {
        &self.path
    }

    pub fn read(&self) -> RwLockReadGuard<'_, DxFile> {
        self.inner.file.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, DxFile> {
        self.inner.file.write()
    }

    /// Open another handle over the same entry.
    pub fn duplicate(&self) -> FileEntry {
        self.inner.refs.fetch_add(1, Ordering::SeqCst);
        FileEntry {
            shared: self.shared.clone(),
            path: self.path.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl Drop for FileEntry {
    fn drop(&mut self) {
        let mut map = self.shared.map.lock();
        if self.inner.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            // evict only if the map still points at this same entry
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
    use dxstor_core::CipherKey;
    use tempfile::tempdir;

    fn params(path: &str) -> NewFileParams {
        NewFileParams {
            dx_path: DxPath::new(path).unwrap(),
            local_path: None,
            file_size: 1000,
            sector_size: 128,
            erasure_code_type: 1,
            min_sectors: 2,
            num_sectors: 4,
            cipher_code: 1,
            cipher_key: CipherKey::generate(),
            file_mode: 0o644,
        }
    }

    #[test]
    fn test_openers_share_one_entry() {
        let dir = tempdir().unwrap();
        let set = FileSet::new(dir.path().to_path_buf());

        let a = set.new_dx_file(params("x"), false).unwrap();
        let b = set.open(&DxPath::new("x").unwrap()).unwrap();
        assert_eq!(a.read().id(), b.read().id());
        assert_eq!(set.open_entries(), 1);

        drop(a);
        assert_eq!(set.open_entries(), 1);
        drop(b);
        assert_eq!(set.open_entries(), 0);

        // reopens from disk after eviction
        let c = set.open(&DxPath::new("x").unwrap()).unwrap();
        assert_eq!(c.read().file_size(), 1000);
    }

    #[test]
    fn test_new_without_overwrite_rejects_existing() {
        let dir = tempdir().unwrap();
        let set = FileSet::new(dir.path().to_path_buf());

        let first = set.new_dx_file(params("x"), false).unwrap();
        let first_id = first.read().id();
        assert!(matches!(
            set.new_dx_file(params("x"), false),
            Err(DxError::PathOverload(_))
        ));

        let second = set.new_dx_file(params("x"), true).unwrap();
        assert_ne!(second.read().id(), first_id);
    }

    #[test]
    fn test_open_missing() {
        let dir = tempdir().unwrap();
        let set = FileSet::new(dir.path().to_path_buf());
        assert!(matches!(
            set.open(&DxPath::new("nope").unwrap()),
            Err(DxError::UnknownPath(_))
        ));
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        let set = FileSet::new(dir.path().to_path_buf());
        let path = DxPath::new("gone").unwrap();
        set.new_dx_file(params("gone"), false).unwrap();
        set.delete(&path).unwrap();
        assert!(!set.exists(&path));
        assert!(matches!(set.delete(&path), Err(DxError::UnknownPath(_))));
    }
}
