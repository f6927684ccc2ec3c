//! Database directory management.
//!
//! File system layout:
//!
//! ```text
//! <db_path>/
//! ├─ LOCK      # Advisory lock for single-process access
//! └─ kv.log    # Root engine commit log
//! ```
//!
//! The LOCK file ensures only one process opens the database at a time.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const KV_LOG_FILE: &str = "kv.log";

/// Holds the database directory and its exclusive lock.
///
/// Only one `DatabaseDir` instance can exist per directory at a time; the
/// lock releases when the instance drops.
#[derive(Debug)]
pub(crate) struct DatabaseDir {
    path: PathBuf,
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens or creates a database directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (`DatabaseLocked`)
    /// - I/O errors occur
    pub(crate) fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "database directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_path = path.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the database directory path.
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path to the root engine's commit log.
    pub(crate) fn kv_log_path(&self) -> PathBuf {
        self.path.join(KV_LOG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("db");
        let opened = DatabaseDir::open(&db_path, true).unwrap();
        assert!(db_path.is_dir());
        assert_eq!(opened.kv_log_path(), db_path.join("kv.log"));
    }

    #[test]
    fn open_missing_without_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = DatabaseDir::open(&dir.path().join("absent"), false);
        assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));
    }

    #[test]
    fn second_open_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("db");
        let _held = DatabaseDir::open(&db_path, true).unwrap();

        let result = DatabaseDir::open(&db_path, true);
        assert!(matches!(result, Err(CoreError::DatabaseLocked)));
    }

    #[test]
    fn lock_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("db");
        drop(DatabaseDir::open(&db_path, true).unwrap());
        assert!(DatabaseDir::open(&db_path, true).is_ok());
    }
}
