//! Virtual paths
//!
//! A `DxPath` is the user-facing location of a file or directory inside the
//! storage client's namespace, independent of where the backing metadata
//! lives on disk. Paths are slash separated, relative, and normalized; the
//! empty path names the root directory.

use dxstor_core::{DxError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Extension of persisted file metadata.
pub const DXFILE_EXTENSION: &str = ".dxfile";

/// Name of the per-directory metadata file.
pub const DXDIR_FILENAME: &str = ".dxdir";

/// Normalized virtual path. The root directory is the empty path.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct DxPath(String);

impl DxPath {
    /// The root directory.
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Validate and normalize a user supplied path.
    pub fn new(path: &str) -> Result<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut components = Vec::new();
        for component in trimmed.split('/') {
            match component {
                "" | "." => continue,
                ".." => {
                    return Err(DxError::Validation(format!(
                        "path {:?} must not contain '..'",
                        path
                    )))
                }
                c if c == DXDIR_FILENAME => {
                    return Err(DxError::Validation(format!(
                        "path {:?} collides with directory metadata",
                        path
                    )))
                }
                c => components.push(c),
            }
        }
        if components.is_empty() {
            return Ok(Self::root());
        }
        Ok(Self(components.join("/")))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Final path component, or empty for the root.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// Parent directory; `None` for the root.
    pub fn parent(&self) -> Option<DxPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rsplit_once('/') {
            Some((parent, _)) => Some(Self(parent.to_string())),
            None => Some(Self::root()),
        }
    }

    /// Append a child component.
    pub fn join(&self, child: &str) -> Result<DxPath> {
        if self.is_root() {
            Self::new(child)
        } else {
            Self::new(&format!("{}/{}", self.0, child))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// On-disk directory backing this path.
    pub fn sys_dir(&self, root: &Path) -> PathBuf {
        if self.is_root() {
            root.to_path_buf()
        } else {
            root.join(&self.0)
        }
    }

    /// On-disk location of this path's `.dxfile` metadata.
    pub fn dxfile_sys_path(&self, root: &Path) -> PathBuf {
        root.join(format!("{}{}", self.0, DXFILE_EXTENSION))
    }

    /// On-disk location of this directory's `.dxdir` metadata.
    pub fn dxdir_sys_path(&self, root: &Path) -> PathBuf {
        self.sys_dir(root).join(DXDIR_FILENAME)
    }
}

impl fmt::Debug for DxPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DxPath({:?})", self.0)
    }
}

impl fmt::Display for DxPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "/")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
