//! Write-ahead log for directory metadata
//!
//! Every `.dxdir` mutation first appends a record here and fsyncs, then
//! applies to the target file. Recovery replays records that never made it
//! to their destination. Records carry a truncated blake3 checksum; a torn
//! tail record is discarded.

use dxstor_core::{DxError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CHECKSUM_SIZE: usize = 4;

/// A single logged mutation: the destination file and the exact bytes to
/// land there.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalRecord {
    /// Destination, relative to the filesystem root
    pub path: String,
    /// Full new contents of the destination file
    pub data: Vec<u8>,
}

/// Append-only write-ahead log
pub struct Wal {
    inner: Mutex<WalInner>,
    path: PathBuf,
}

struct WalInner {
    file: File,
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let digest = blake3::hash(payload);
    let mut out = [0u8; CHECKSUM_SIZE];
    out.copy_from_slice(&digest.as_bytes()[..CHECKSUM_SIZE]);
    out
}

impl Wal {
    /// Open (or create) the log and return any records that still need
    /// replaying from a previous run.
    pub fn open(path: &Path) -> Result<(Self, Vec<WalRecord>)> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let mut raw = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut raw)?;

        let mut records = Vec::new();
        let mut cursor = 0usize;
        while cursor + 4 + CHECKSUM_SIZE <= raw.len() {
            let len = u32::from_le_bytes(raw[cursor..cursor + 4].try_into().unwrap()) as usize;
            let body_start = cursor + 4 + CHECKSUM_SIZE;
            if body_start + len > raw.len() {
                warn!(offset = cursor, "discarding torn record at wal tail");
                break;
            }
            let expected = &raw[cursor + 4..body_start];
            let body = &raw[body_start..body_start + len];
            if checksum(body) != expected[..] {
                warn!(offset = cursor, "discarding corrupt record at wal tail");
                break;
            }
            match bincode::deserialize::<WalRecord>(body) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(offset = cursor, error = %e, "undecodable wal record, stopping replay");
                    break;
                }
            }
            cursor = body_start + len;
        }

        debug!(replay = records.len(), path = %path.display(), "wal opened");
        Ok((
            Self {
                inner: Mutex::new(WalInner { file }),
                path: path.to_path_buf(),
            },
            records,
        ))
    }

    /// Append a record and fsync before returning.
    pub fn append(&self, record: &WalRecord) -> Result<()> {
        let body = bincode::serialize(record)
            .map_err(|e| DxError::Corrupt(format!("wal encode: {}", e)))?;
        let mut framed = Vec::with_capacity(4 + CHECKSUM_SIZE + body.len());
        framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
        framed.extend_from_slice(&checksum(&body));
        framed.extend_from_slice(&body);

        let mut inner = self.inner.lock();
        inner.file.write_all(&framed)?;
        inner.file.sync_data()?;
        Ok(())
    }

    /// Drop all applied records. Called once every logged mutation has
    /// reached its destination.
    pub fn checkpoint(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.file.set_len(0)?;
        inner.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(path: &str, data: &[u8]) -> WalRecord {
        WalRecord {
            path: path.to_string(),
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("wal.log");

        {
            let (wal, replay) = Wal::open(&wal_path).unwrap();
            assert!(replay.is_empty());
            wal.append(&record("a/.dxdir", b"one")).unwrap();
            wal.append(&record("b/.dxdir", b"two")).unwrap();
        }

        let (_wal, replay) = Wal::open(&wal_path).unwrap();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0], record("a/.dxdir", b"one"));
        assert_eq!(replay[1], record("b/.dxdir", b"two"));
    }

    #[test]
    fn test_checkpoint_clears() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("wal.log");

        let (wal, _) = Wal::open(&wal_path).unwrap();
        wal.append(&record("a", b"x")).unwrap();
        wal.checkpoint().unwrap();
        drop(wal);

        let (_wal, replay) = Wal::open(&wal_path).unwrap();
        assert!(replay.is_empty());
    }

    #[test]
    fn test_torn_tail_discarded() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("wal.log");

        {
            let (wal, _) = Wal::open(&wal_path).unwrap();
            wal.append(&record("a", b"full")).unwrap();
        }
        // simulate a crash mid-append
        {
            let mut f = OpenOptions::new().append(true).open(&wal_path).unwrap();
            f.write_all(&[42u8, 0, 0, 0, 1, 2]).unwrap();
        }

        let (_wal, replay) = Wal::open(&wal_path).unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0], record("a", b"full"));
    }
}
