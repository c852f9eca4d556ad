//! # File Factory
//!
//! A named, lazily-opened binding to one file path. The disk service holds
//! one factory per file (data and log) and asks it for the shared handle on
//! first use; until then the path is not touched, so opening a database
//! never creates a log file as a side effect.
//!
//! All methods serialise on the factory's internal lock; `close` and
//! `delete` are idempotent.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use tracing::debug;

use super::file::{RandomAccess, RandomAccessFile};

/// Lazily-opened, reference-held binding to one file path.
pub struct FileFactory {
    path: PathBuf,
    read_only: bool,
    handle: Mutex<Option<Arc<dyn RandomAccess>>>,
}

impl FileFactory {
    pub fn new<P: Into<PathBuf>>(path: P, read_only: bool) -> Self {
        Self {
            path: path.into(),
            read_only,
            handle: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// The shared handle, opened on first call. In read-write mode the
    /// file is created when missing.
    pub fn access(&self) -> Result<Arc<dyn RandomAccess>> {
        let mut handle = self.handle.lock();

        if let Some(open) = handle.as_ref() {
            return Ok(Arc::clone(open));
        }

        debug!(path = %self.path.display(), read_only = self.read_only, "opening file");
        let open: Arc<dyn RandomAccess> =
            Arc::new(RandomAccessFile::open(&self.path, self.read_only)?);
        *handle = Some(Arc::clone(&open));
        Ok(open)
    }

    /// True when the handle is open or the path exists on disk.
    pub fn exists(&self) -> bool {
        let handle = self.handle.lock();
        handle.is_some() || self.path.exists()
    }

    /// Byte length: the handle's if open, else the size on disk, else 0
    /// for a missing file.
    pub fn len(&self) -> Result<u64> {
        let handle = self.handle.lock();

        if let Some(open) = handle.as_ref() {
            return open.len();
        }

        match std::fs::metadata(&self.path) {
            Ok(metadata) => Ok(metadata.len()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(error) => Err(error)
                .wrap_err_with(|| format!("failed to stat '{}'", self.path.display())),
        }
    }

    /// Drops the open handle, if any.
    pub fn close(&self) {
        let mut handle = self.handle.lock();
        if handle.take().is_some() {
            debug!(path = %self.path.display(), "closed file");
        }
    }

    /// Closes the handle and removes the file from disk.
    pub fn delete(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        handle.take();

        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "deleted file");
                Ok(())
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error)
                .wrap_err_with(|| format!("failed to delete '{}'", self.path.display())),
        }
    }
}

impl std::fmt::Debug for FileFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileFactory")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("open", &self.handle.lock().is_some())
            .finish()
    }
}
