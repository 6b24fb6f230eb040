use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::{check_key, KvPair, Store, StoreError, ENDPOINTS_PREFIX};

const RECORD_EXT: &str = "json";

/// Directory-backed store
///
/// Key `networks/net1` lives in `<root>/networks/net1.json`. Writes go to a
/// hidden temporary file first, are synced, and are renamed into place, so a
/// crash never leaves a half-written record behind.
///
/// Only the per-network endpoint directories are ever removed. The top-level
/// `networks/` and `endpoints/` directories stay once created.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}", key, RECORD_EXT))
    }

    fn collect(&self, dir: &Path, out: &mut Vec<KvPair>, prefix: &str) -> Result<(), StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        };

        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }

            if path.is_dir() {
                self.collect(&path, out, prefix)?;
                continue;
            }

            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(key) = self.key_for(&path) else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }

            let value = fs::read(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            out.push(KvPair { key, value });
        }

        Ok(())
    }

    /// Directory that may be removed once the record at `key` is gone
    fn prunable_dir(&self, key: &str) -> Option<PathBuf> {
        let network = key.strip_prefix(ENDPOINTS_PREFIX)?.split_once('/')?.0;
        Some(self.root.join(ENDPOINTS_PREFIX).join(network))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?.with_extension("");
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

impl Store for FileStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        check_key(key)?;
        let path = self.path_for(key);
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        let tmp = path.with_file_name(format!(".{}.tmp", file_name));

        // The endpoint directory may have been pruned by a delete in between
        match write_synced(&tmp, &path, value) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(io_err)?;
                }
                write_synced(&tmp, &path, value).map_err(io_err)
            }
            result => result.map_err(io_err),
        }
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        check_key(key)?;
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        check_key(key)?;
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(StoreError::Io { path, source }),
        }

        if let Some(dir) = self.prunable_dir(key) {
            prune_empty_dir(&dir);
        }
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<KvPair>, StoreError> {
        let dir = match prefix.rfind('/') {
            Some(idx) => self.root.join(&prefix[..idx]),
            None => self.root.clone(),
        };
        let mut out = Vec::new();
        self.collect(&dir, &mut out, prefix)?;
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}

fn write_synced(tmp: &Path, path: &Path, value: &[u8]) -> io::Result<()> {
    let mut file = File::create(tmp)?;
    file.write_all(value)?;
    file.sync_all()?;
    fs::rename(tmp, path)
}

/// Remove `dir` if it holds no entries
///
/// Failing to prune never fails the delete that triggered it.
fn prune_empty_dir(dir: &Path) {
    let empty = match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to read store directory");
            return;
        }
    };
    if !empty {
        return;
    }
    match fs::remove_dir(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to prune store directory"),
    }
}
