//! On-disk sector records.
//!
//! Every captured read lives in its own file directly under the storage
//! directory, named after its [`SectorKey`]. The store does no locking of its
//! own: it is only ever driven from the single filesystem dispatch thread.
//!
//! The capture/replay pair assumes a sector is never rewritten between two
//! reads of it. A record always holds the bytes of the most recent capture
//! for its key, so a read-modify-read workload replays the last read only.

mod key;

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

pub use key::{ParseKeyError, SectorKey};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no sector captured for {0}")]
    SectorNotFound(SectorKey),
    #[error("failed to write sector record {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read sector record {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create storage directory {}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to list storage directory {}", path.display())]
    List {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Outcome of [`ensure_dir`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirSetup {
    Created,
    AlreadyExists,
}

/// Create the storage directory if it is missing.
///
/// An existing directory is reported as [`DirSetup::AlreadyExists`]; every
/// other failure is returned as an error.
pub fn ensure_dir(path: &Path) -> Result<DirSetup, StoreError> {
    match fs::create_dir(path) {
        Ok(()) => {
            debug!("created storage directory {}", path.display());
            Ok(DirSetup::Created)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => {
            info!("{} already exists", path.display());
            Ok(DirSetup::AlreadyExists)
        }
        Err(source) => Err(StoreError::CreateDir {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub struct SectorStore {
    dir: PathBuf,
}

impl SectorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, key: SectorKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Persist `payload` under `key`, replacing any earlier record.
    ///
    /// The payload length is not checked against `key.length`: a short read
    /// is stored as-is under the length that was requested.
    pub fn capture(&self, key: SectorKey, payload: &[u8]) -> Result<(), StoreError> {
        let path = self.record_path(key);
        let write = |path: &Path| -> io::Result<()> {
            let mut file = File::create(path)?;
            file.write_all(payload)?;
            file.flush()
        };
        write(&path).map_err(|source| StoreError::Write { path, source })
    }

    /// Return the payload last captured for `key`
    pub fn retrieve(&self, key: SectorKey) -> Result<Vec<u8>, StoreError> {
        let path = self.record_path(key);
        match fs::read(&path) {
            Ok(payload) => Ok(payload),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::SectorNotFound(key)),
            Err(source) => Err(StoreError::Read { path, source }),
        }
    }

    /// Every record key present in the directory, in (offset, length) order.
    ///
    /// Entries that are not regular files or whose names are not record names
    /// are ignored.
    pub fn keys(&self) -> Result<Vec<SectorKey>, StoreError> {
        let list_err = |source| StoreError::List {
            path: self.dir.clone(),
            source,
        };
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(list_err)? {
            let entry = entry.map_err(list_err)?;
            let name = entry.file_name();
            if !entry.file_type().map_err(list_err)?.is_file() {
                debug!("skipping non-file {:?} in {}", name, self.dir.display());
                continue;
            }
            match name.to_str().map(str::parse::<SectorKey>) {
                Some(Ok(key)) => keys.push(key),
                _ => debug!("skipping {:?} in {}", name, self.dir.display()),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn retrieve_unknown_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = SectorStore::new(dir.path());
        let err = store.retrieve(SectorKey::new(4096, 512)).unwrap_err();
        assert!(matches!(err, StoreError::SectorNotFound(k) if k == SectorKey::new(4096, 512)));
    }

    #[test]
    fn last_capture_wins() {
        let dir = TempDir::new().unwrap();
        let store = SectorStore::new(dir.path());
        let key = SectorKey::new(0, 4);
        store.capture(key, b"aaaa").unwrap();
        store.capture(key, b"bb").unwrap();
        assert_eq!(store.retrieve(key).unwrap(), b"bb");
    }

    #[test]
    fn records_are_flat_files_named_by_key() {
        let dir = TempDir::new().unwrap();
        let store = SectorStore::new(dir.path());
        store.capture(SectorKey::new(1024, 512), &[7; 512]).unwrap();
        let on_disk = fs::read(dir.path().join("1024.512.r")).unwrap();
        assert_eq!(on_disk, vec![7; 512]);
    }

    #[test]
    fn keys_are_sorted_and_skip_foreign_files() {
        let dir = TempDir::new().unwrap();
        let store = SectorStore::new(dir.path());
        store.capture(SectorKey::new(4096, 512), b"x").unwrap();
        store.capture(SectorKey::new(0, 1024), b"y").unwrap();
        store.capture(SectorKey::new(0, 512), b"z").unwrap();
        fs::write(dir.path().join("README"), "not a sector").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        assert_eq!(
            store.keys().unwrap(),
            vec![
                SectorKey::new(0, 512),
                SectorKey::new(0, 1024),
                SectorKey::new(4096, 512),
            ]
        );
    }

    #[test]
    fn ensure_dir_twice_is_not_fatal() {
        let parent = TempDir::new().unwrap();
        let dir = parent.path().join("storage");
        assert_eq!(ensure_dir(&dir).unwrap(), DirSetup::Created);
        assert_eq!(ensure_dir(&dir).unwrap(), DirSetup::AlreadyExists);
    }

    #[test]
    fn ensure_dir_over_regular_file_fails() {
        let parent = TempDir::new().unwrap();
        let path = parent.path().join("storage");
        fs::write(&path, b"not a directory").unwrap();
        let err = ensure_dir(&path).unwrap_err();
        assert!(matches!(
            err,
            StoreError::CreateDir { source, .. } if source.kind() == io::ErrorKind::AlreadyExists
        ));
    }

    #[test]
    fn keys_skip_directories_with_record_names() {
        let dir = TempDir::new().unwrap();
        let store = SectorStore::new(dir.path());
        store.capture(SectorKey::new(0, 512), b"z").unwrap();
        fs::create_dir(dir.path().join("4096.512.r")).unwrap();
        assert_eq!(store.keys().unwrap(), vec![SectorKey::new(0, 512)]);
    }

    #[test]
    fn ensure_dir_without_parent_fails() {
        let parent = TempDir::new().unwrap();
        let dir = parent.path().join("missing").join("storage");
        assert!(matches!(ensure_dir(&dir), Err(StoreError::CreateDir { .. })));
    }

    #[test]
    fn capture_into_missing_dir_fails() {
        let parent = TempDir::new().unwrap();
        let store = SectorStore::new(parent.path().join("gone"));
        let err = store.capture(SectorKey::new(0, 1), b"x").unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));
    }
}
