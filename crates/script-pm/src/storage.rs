//! Local script storage
//!
//! Installed payloads live under a scripts directory:
//!
//! ```text
//! <scripts>/
//! ├── <qname>.cs | <qname>.lib.cs | <qname>.js   # payload
//! ├── packages/<qname>.json                      # installed record (sidecar)
//! ├── help/<qname>.md                            # optional help document
//! └── tmp/                                       # staging for atomic writes
//! ```

use crate::installed::InstalledModule;
use crate::manifest::{is_valid_qualified_name, ModuleKind};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error (file operations)
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    /// Sidecar (de)serialisation failed
    #[error("Sidecar error: {0}")]
    SidecarError(#[from] serde_json::Error),

    /// Name unusable as a file name
    #[error("Invalid qualified name: {0}")]
    InvalidName(String),

    /// Storage refuses writes
    #[error("Storage is read-only")]
    ReadOnly,
}

/// Where installed modules are persisted
pub trait ScriptStorage: Send + Sync {
    /// Store (or replace) a payload and its installed record
    ///
    /// Files the same module left behind under another kind are removed.
    fn write(&self, record: &InstalledModule, payload: &[u8]) -> Result<(), StorageError>;

    /// Store the help document of an installed module
    fn write_help(&self, record: &InstalledModule, content: &[u8]) -> Result<(), StorageError>;

    /// Remove a payload, its record and its help document
    fn delete(&self, record: &InstalledModule) -> Result<(), StorageError>;

    /// Read back every installed record
    fn load_installed(&self) -> Result<Vec<InstalledModule>, StorageError>;
}

/// Filesystem-backed storage
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Open (and create) storage rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(root.join("packages"))?;
        fs::create_dir_all(root.join("help"))?;
        fs::create_dir_all(root.join("tmp"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the payload file
    pub fn payload_path(&self, record: &InstalledModule) -> PathBuf {
        self.root.join(record.file_name())
    }

    /// Path of the sidecar record
    pub fn sidecar_path(&self, record: &InstalledModule) -> PathBuf {
        self.root
            .join("packages")
            .join(format!("{}.json", record.stem()))
    }

    /// Path of the help document
    pub fn help_path(&self, record: &InstalledModule) -> PathBuf {
        self.root.join("help").join(format!("{}.md", record.stem()))
    }

    fn tmp_path(&self, dest: &Path, ext: &str) -> PathBuf {
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.root
            .join("tmp")
            .join(format!("{}.{}.{}", file_name, std::process::id(), ext))
    }

    /// Write `bytes` to a synced staging file for `dest`
    fn stage(&self, dest: &Path, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        fs::create_dir_all(self.root.join("tmp"))?;
        let tmp_path = self.tmp_path(dest, "tmp");

        let mut tmp_file = fs::File::create(&tmp_path)?;
        if let Err(e) = tmp_file.write_all(bytes).and_then(|()| tmp_file.sync_all()) {
            drop(tmp_file);
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(tmp_path)
    }

    /// Write to a staging file first, then move into place
    fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let tmp_path = self.stage(dest, bytes)?;
        if let Err(e) = fs::rename(&tmp_path, dest) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(())
    }

    /// Move staged payload and sidecar into place as a pair
    ///
    /// The previous payload is parked in `tmp/` until the sidecar has been
    /// renamed, and put back if either rename fails.
    fn commit(
        &self,
        staged_payload: &Path,
        payload_path: &Path,
        staged_sidecar: &Path,
        sidecar_path: &Path,
    ) -> Result<(), StorageError> {
        let backup = self.tmp_path(payload_path, "bak");
        let had_previous = match fs::rename(payload_path, &backup) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        let renamed = fs::rename(staged_payload, payload_path)
            .and_then(|()| fs::rename(staged_sidecar, sidecar_path));
        if let Err(e) = renamed {
            if had_previous {
                let _ = fs::rename(&backup, payload_path);
            } else {
                let _ = fs::remove_file(payload_path);
            }
            return Err(e.into());
        }

        if had_previous {
            let _ = fs::remove_file(&backup);
        }
        Ok(())
    }

    /// Records for the same module stored under a different kind
    fn stale_records(&self, record: &InstalledModule) -> Vec<InstalledModule> {
        [ModuleKind::Script, ModuleKind::Library, ModuleKind::Scriptlet]
            .into_iter()
            .filter(|kind| *kind != record.kind)
            .filter_map(|kind| {
                let other = InstalledModule {
                    kind,
                    ..record.clone()
                };
                let bytes = fs::read(self.sidecar_path(&other)).ok()?;
                let stored: InstalledModule = serde_json::from_slice(&bytes).ok()?;
                (stored.qualified_name == record.qualified_name && stored.kind == kind)
                    .then_some(stored)
            })
            .collect()
    }

    /// Remove files of `stale` that `record` did not just overwrite
    fn remove_stale(&self, record: &InstalledModule, stale: &[InstalledModule]) {
        let current = [
            self.payload_path(record),
            self.sidecar_path(record),
            self.help_path(record),
        ];
        for old in stale {
            for path in [
                self.sidecar_path(old),
                self.payload_path(old),
                self.help_path(old),
            ] {
                if current.contains(&path) {
                    continue;
                }
                if let Err(e) = remove_if_exists(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove file of previous kind");
                }
            }
            debug!(module = %old.qualified_name, kind = %old.kind, "Removed files of previous kind");
        }
    }

    fn check_name(record: &InstalledModule) -> Result<(), StorageError> {
        if is_valid_qualified_name(&record.qualified_name) {
            Ok(())
        } else {
            Err(StorageError::InvalidName(record.qualified_name.clone()))
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl ScriptStorage for FsStorage {
    fn write(&self, record: &InstalledModule, payload: &[u8]) -> Result<(), StorageError> {
        Self::check_name(record)?;
        let sidecar = serde_json::to_vec_pretty(record)?;
        let stale = self.stale_records(record);

        let payload_path = self.payload_path(record);
        let sidecar_path = self.sidecar_path(record);
        let staged_payload = self.stage(&payload_path, payload)?;
        let staged_sidecar = match self.stage(&sidecar_path, &sidecar) {
            Ok(path) => path,
            Err(e) => {
                let _ = fs::remove_file(&staged_payload);
                return Err(e);
            }
        };

        if let Err(e) = self.commit(&staged_payload, &payload_path, &staged_sidecar, &sidecar_path)
        {
            let _ = fs::remove_file(&staged_payload);
            let _ = fs::remove_file(&staged_sidecar);
            return Err(e);
        }

        self.remove_stale(record, &stale);
        debug!(module = %record.qualified_name, bytes = payload.len(), "Payload stored");
        Ok(())
    }

    fn write_help(&self, record: &InstalledModule, content: &[u8]) -> Result<(), StorageError> {
        Self::check_name(record)?;
        self.write_atomic(&self.help_path(record), content)
    }

    fn delete(&self, record: &InstalledModule) -> Result<(), StorageError> {
        Self::check_name(record)?;
        remove_if_exists(&self.payload_path(record))?;
        remove_if_exists(&self.sidecar_path(record))?;
        remove_if_exists(&self.help_path(record))?;
        debug!(module = %record.qualified_name, "Payload removed");
        Ok(())
    }

    fn load_installed(&self) -> Result<Vec<InstalledModule>, StorageError> {
        let dir = self.root.join("packages");
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let record: InstalledModule = match fs::read(&path)
                .map_err(StorageError::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(StorageError::from))
            {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read sidecar");
                    continue;
                }
            };

            if !self.payload_path(&record).exists() {
                warn!(module = %record.qualified_name, "Sidecar without payload ignored");
                continue;
            }
            records.push(record);
        }

        records.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        Ok(records)
    }
}

/// In-memory storage for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, (InstalledModule, Vec<u8>)>>,
    help: Mutex<BTreeMap<String, Vec<u8>>>,
    read_only: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write and delete fail
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    /// Stored payload for a module
    pub fn payload(&self, qualified_name: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .get(qualified_name)
            .map(|(_, payload)| payload.clone())
    }

    /// Stored help document for a module
    pub fn help(&self, qualified_name: &str) -> Option<Vec<u8>> {
        self.help.lock().get(qualified_name).cloned()
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.read_only.load(Ordering::Acquire) {
            Err(StorageError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

impl ScriptStorage for MemoryStorage {
    fn write(&self, record: &InstalledModule, payload: &[u8]) -> Result<(), StorageError> {
        self.check_writable()?;
        self.entries.lock().insert(
            record.qualified_name.clone(),
            (record.clone(), payload.to_vec()),
        );
        Ok(())
    }

    fn write_help(&self, record: &InstalledModule, content: &[u8]) -> Result<(), StorageError> {
        self.check_writable()?;
        self.help
            .lock()
            .insert(record.qualified_name.clone(), content.to_vec());
        Ok(())
    }

    fn delete(&self, record: &InstalledModule) -> Result<(), StorageError> {
        self.check_writable()?;
        self.entries.lock().remove(&record.qualified_name);
        self.help.lock().remove(&record.qualified_name);
        Ok(())
    }

    fn load_installed(&self) -> Result<Vec<InstalledModule>, StorageError> {
        Ok(self
            .entries
            .lock()
            .values()
            .map(|(record, _)| record.clone())
            .collect())
    }
}
