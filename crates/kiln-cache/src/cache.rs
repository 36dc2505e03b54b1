//! Content-addressed file cache.
//!
//! One subdirectory per key under the cache root; inside, a `manifest.json`
//! listing the logical file names and one numbered blob file per entry.
//! Entries are built in a temp directory and renamed into place, so readers
//! never observe a partial entry. Blobs are hardlinked in and out when the
//! filesystem allows it, which makes revival O(1) per file and lets the
//! link-count GC detect entries no live build output shares.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache entry {key}: {msg}")]
    Entry { key: String, msg: String },
}

impl CacheError {
    fn io(path: &Path, source: std::io::Error) -> CacheError {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn entry(key: &str, msg: impl Into<String>) -> CacheError {
        CacheError::Entry {
            key: key.to_string(),
            msg: msg.into(),
        }
    }
}

/// The stored file list of a cache entry, in blob order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub names: Vec<String>,
}

impl Manifest {
    fn new(names: Vec<String>) -> Manifest {
        Manifest { version: 1, names }
    }
}

/// Aggregate cache statistics for maintenance commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub unused: usize,
}

pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    /// Ensure `dir` exists and return a cache handle on it.
    pub fn create(dir: &Path) -> Result<FileCache, CacheError> {
        std::fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, e))?;
        Ok(FileCache {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_dir(&self, key: &str) -> Result<PathBuf, CacheError> {
        // Keys are hex digests; refuse anything that could escape the root.
        if key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(CacheError::entry(key, "malformed key"));
        }
        Ok(self.dir.join(key))
    }

    fn tmp_dir(&self) -> PathBuf {
        self.dir.join(format!("tmp-{}", uuid::Uuid::new_v4()))
    }

    /// Membership test, without reading the manifest.
    pub fn mem(&self, key: &str) -> bool {
        self.entry_dir(key).map(|d| d.is_dir()).unwrap_or(false)
    }

    /// Store an entry atomically, replacing any previous entry for `key`.
    ///
    /// `names` are the logical file names recorded in the manifest; `files`
    /// are the on-disk sources, in the same order.
    pub fn add(&self, key: &str, names: &[String], files: &[PathBuf]) -> Result<(), CacheError> {
        if names.len() != files.len() {
            return Err(CacheError::entry(
                key,
                format!("manifest length {} != file count {}", names.len(), files.len()),
            ));
        }
        let entry = self.entry_dir(key)?;
        let tmp = self.tmp_dir();
        std::fs::create_dir_all(&tmp).map_err(|e| CacheError::io(&tmp, e))?;

        let build = || -> Result<(), CacheError> {
            let manifest = Manifest::new(names.to_vec());
            let manifest_path = tmp.join(MANIFEST_FILE);
            let json = serde_json::to_vec_pretty(&manifest)
                .map_err(|e| CacheError::entry(key, format!("encoding manifest: {e}")))?;
            std::fs::write(&manifest_path, json).map_err(|e| CacheError::io(&manifest_path, e))?;

            for (i, file) in files.iter().enumerate() {
                let blob = tmp.join(i.to_string());
                link_or_copy(file, &blob)?;
            }
            Ok(())
        };

        if let Err(e) = build() {
            let _ = std::fs::remove_dir_all(&tmp);
            return Err(e);
        }

        // Replace: move any previous entry aside first so the final rename
        // lands on a free name.
        let mut old = None;
        if entry.exists() {
            let aside = self.tmp_dir();
            std::fs::rename(&entry, &aside).map_err(|e| CacheError::io(&entry, e))?;
            old = Some(aside);
        }
        let renamed = std::fs::rename(&tmp, &entry).map_err(|e| CacheError::io(&entry, e));
        if renamed.is_err() {
            let _ = std::fs::remove_dir_all(&tmp);
        }
        if let Some(aside) = old {
            let _ = std::fs::remove_dir_all(aside);
        }
        renamed?;
        debug!(key, files = files.len(), "cache add");
        Ok(())
    }

    /// Restore an entry's blobs into `targets`. Returns the manifest names on
    /// a hit, `None` on a miss.
    ///
    /// `targets` must line up with the stored manifest; parent directories
    /// are created as needed and existing target files are replaced.
    pub fn revive(&self, key: &str, targets: &[PathBuf]) -> Result<Option<Vec<String>>, CacheError> {
        let entry = self.entry_dir(key)?;
        let manifest = match self.read_manifest(key, &entry)? {
            None => return Ok(None),
            Some(m) => m,
        };
        if manifest.names.len() != targets.len() {
            return Err(CacheError::entry(
                key,
                format!(
                    "manifest has {} files, revival expected {}",
                    manifest.names.len(),
                    targets.len()
                ),
            ));
        }

        for (i, target) in targets.iter().enumerate() {
            let blob = entry.join(i.to_string());
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
            }
            if target.exists() {
                std::fs::remove_file(target).map_err(|e| CacheError::io(target, e))?;
            }
            link_or_copy(&blob, target)?;
        }

        self.touch(&entry);
        debug!(key, files = targets.len(), "cache revive");
        Ok(Some(manifest.names))
    }

    /// Return the manifest without materializing any file.
    pub fn find(&self, key: &str) -> Result<Option<Manifest>, CacheError> {
        let entry = self.entry_dir(key)?;
        self.read_manifest(key, &entry)
    }

    /// Delete the entry for `key`, if any.
    pub fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let entry = self.entry_dir(key)?;
        if !entry.is_dir() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&entry).map_err(|e| CacheError::io(&entry, e))?;
        Ok(true)
    }

    /// Delete every entry.
    pub fn delete_all(&self) -> Result<(), CacheError> {
        for key in self.keys()? {
            self.delete(&key)?;
        }
        Ok(())
    }

    /// List the keys currently stored.
    pub fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut keys = Vec::new();
        let it = std::fs::read_dir(&self.dir).map_err(|e| CacheError::io(&self.dir, e))?;
        for dent in it {
            let dent = dent.map_err(|e| CacheError::io(&self.dir, e))?;
            let name = dent.file_name().to_string_lossy().into_owned();
            if name.starts_with("tmp-") {
                continue;
            }
            if dent.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Delete entries whose blobs share no hardlink with any file outside
    /// the cache, approximated by a link count of 1 on every blob.
    pub fn delete_unused(&self) -> Result<usize, CacheError> {
        let mut deleted = 0;
        for key in self.keys()? {
            let entry = self.entry_dir(&key)?;
            if entry_is_unused(&entry)? {
                self.delete(&key)?;
                deleted += 1;
            }
        }
        debug!(deleted, "cache delete_unused");
        Ok(deleted)
    }

    /// Evict least-recently-used entries until the cache holds at most
    /// `max_bytes * (100 - pct) / 100` bytes.
    pub fn trim(&self, max_bytes: u64, pct: u8) -> Result<usize, CacheError> {
        let pct = pct.min(100) as u64;
        let target = max_bytes / 100 * (100 - pct);

        let mut entries: Vec<(String, u64, filetime::FileTime)> = Vec::new();
        let mut total = 0u64;
        for key in self.keys()? {
            let entry = self.entry_dir(&key)?;
            let bytes = entry_bytes(&entry)?;
            let used = entry_atime(&entry);
            total += bytes;
            entries.push((key, bytes, used));
        }

        if total <= target {
            return Ok(0);
        }

        // Oldest access first.
        entries.sort_by_key(|(_, _, used)| *used);
        let mut evicted = 0;
        for (key, bytes, _) in entries {
            if total <= target {
                break;
            }
            self.delete(&key)?;
            total = total.saturating_sub(bytes);
            evicted += 1;
        }
        debug!(evicted, total, target, "cache trim");
        Ok(evicted)
    }

    /// Entry count, byte total, and unused-entry count.
    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let mut stats = CacheStats::default();
        for key in self.keys()? {
            let entry = self.entry_dir(&key)?;
            stats.entries += 1;
            stats.bytes += entry_bytes(&entry)?;
            if entry_is_unused(&entry)? {
                stats.unused += 1;
            }
        }
        Ok(stats)
    }

    fn read_manifest(&self, key: &str, entry: &Path) -> Result<Option<Manifest>, CacheError> {
        let path = entry.join(MANIFEST_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(&path, e)),
        };
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| CacheError::entry(key, format!("corrupt manifest: {e}")))?;
        Ok(Some(manifest))
    }

    /// Record an access on the entry for LRU ordering. Best-effort.
    fn touch(&self, entry: &Path) {
        let now = filetime::FileTime::now();
        let _ = filetime::set_file_times(entry.join(MANIFEST_FILE), now, now);
    }
}

/// Hardlink `src` to `dst`, copying when the link fails (cross-device, or a
/// filesystem without hardlinks).
fn link_or_copy(src: &Path, dst: &Path) -> Result<(), CacheError> {
    match std::fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => match std::fs::copy(src, dst) {
            Ok(_) => Ok(()),
            Err(e) => Err(CacheError::io(src, e)),
        },
    }
}

fn entry_bytes(entry: &Path) -> Result<u64, CacheError> {
    let mut total = 0;
    for dent in walkdir::WalkDir::new(entry).min_depth(1) {
        let dent = dent.map_err(|e| CacheError::Entry {
            key: entry.display().to_string(),
            msg: format!("walking entry: {e}"),
        })?;
        if dent.file_type().is_file() {
            total += dent.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(total)
}

/// Access time of an entry, read from its manifest file. Falls back to
/// mtime on filesystems that do not track atime; `touch` sets both.
fn entry_atime(entry: &Path) -> filetime::FileTime {
    match std::fs::metadata(entry.join(MANIFEST_FILE)) {
        Ok(meta) => filetime::FileTime::from_last_access_time(&meta),
        Err(_) => filetime::FileTime::zero(),
    }
}

#[cfg(unix)]
fn entry_is_unused(entry: &Path) -> Result<bool, CacheError> {
    use std::os::unix::fs::MetadataExt;
    let it = std::fs::read_dir(entry).map_err(|e| CacheError::io(entry, e))?;
    for dent in it {
        let dent = dent.map_err(|e| CacheError::io(entry, e))?;
        if dent.file_name() == MANIFEST_FILE {
            continue;
        }
        let meta = dent.metadata().map_err(|e| CacheError::io(&dent.path(), e))?;
        if meta.is_file() && meta.nlink() > 1 {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(not(unix))]
fn entry_is_unused(_entry: &Path) -> Result<bool, CacheError> {
    // No portable link count; treat everything as used.
    Ok(false)
}
