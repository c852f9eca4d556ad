//! # Open Settings
//!
//! Configuration surface recognised by the storage core. A settings value
//! describes *which* files to open and *how*: everything else (cache sizing,
//! queue behaviour) is fixed by [`crate::config::constants`].
//!
//! ## Options
//!
//! | Option       | Default  | Description                                     |
//! |--------------|----------|-------------------------------------------------|
//! | filename     | required | Path to the datafile; the log lives alongside   |
//! | read_only    | false    | Open both files read-only, reject all writes    |
//! | collation    | Binary   | Stored in the header pragma on initial creation |
//! | auto_rebuild | false    | Read by the engine shell, carried here verbatim |
//!
//! The log file path is derived from the datafile path by inserting `-log`
//! before the extension: `app.db` becomes `app-log.db`, `app` becomes
//! `app-log`.

use std::path::{Path, PathBuf};

use eyre::{ensure, Result};

/// String collation applied to document keys, fixed at creation time and
/// stored in the datafile header. Ignored on subsequent opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Collation {
    /// Byte-wise comparison.
    #[default]
    Binary,
    /// ASCII case-insensitive comparison.
    NoCase,
}

impl Collation {
    /// Stable numeric code persisted in the header pragma.
    pub fn code(self) -> u32 {
        match self {
            Collation::Binary => 1,
            Collation::NoCase => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Collation::Binary),
            2 => Some(Collation::NoCase),
            _ => None,
        }
    }
}

/// Options used when opening a [`crate::storage::DiskService`].
#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Path to the datafile.
    pub filename: PathBuf,
    /// Open both files read-only. Every mutating operation is rejected.
    pub read_only: bool,
    /// Collation pragma written to the header page on initial creation.
    pub collation: Collation,
    /// Whether the engine should rebuild automatically when the header's
    /// invalid-state flag is found set. The core stores the flag; acting on
    /// it is the engine's decision.
    pub auto_rebuild: bool,
}

impl StorageSettings {
    pub fn new<P: Into<PathBuf>>(filename: P) -> Self {
        Self {
            filename: filename.into(),
            read_only: false,
            collation: Collation::default(),
            auto_rebuild: false,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn collation(mut self, collation: Collation) -> Self {
        self.collation = collation;
        self
    }

    pub fn auto_rebuild(mut self, auto_rebuild: bool) -> Self {
        self.auto_rebuild = auto_rebuild;
        self
    }

    /// Path of the write-ahead log file: `-log` inserted before the
    /// datafile extension.
    pub fn log_path(&self) -> PathBuf {
        log_path_for(&self.filename)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.filename.file_name().is_some(),
            "datafile path '{}' has no file name",
            self.filename.display()
        );
        Ok(())
    }
}

fn log_path_for(data: &Path) -> PathBuf {
    let stem = data
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let name = match data.extension() {
        Some(ext) => format!("{}-log.{}", stem, ext.to_string_lossy()),
        None => format!("{}-log", stem),
    };

    data.with_file_name(name)
}
