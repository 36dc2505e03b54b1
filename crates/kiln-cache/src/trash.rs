//! Deletion via a trash directory.
//!
//! `trash` renames the doomed path into the trash under a unique name, which
//! makes build-visible deletion O(1); the accumulated corpses are purged
//! later, optionally on a background thread.

use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Trash {
    dir: PathBuf,
}

impl Trash {
    pub fn new(dir: PathBuf) -> Trash {
        Trash { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Move `path` into the trash. Missing paths are fine. When the rename
    /// cannot work (cross-device), falls back to deleting in place.
    pub fn trash(&self, path: &Path) -> std::io::Result<()> {
        let meta = match std::fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        std::fs::create_dir_all(&self.dir)?;
        let dst = self.dir.join(uuid::Uuid::new_v4().to_string());
        match std::fs::rename(path, &dst) {
            Ok(()) => Ok(()),
            Err(_) if meta.is_dir() => std::fs::remove_dir_all(path),
            Err(_) => std::fs::remove_file(path),
        }
    }

    /// Delete everything in the trash. With `block` false the work happens
    /// on a detached thread and errors are only logged.
    pub fn purge(&self, block: bool) -> std::io::Result<()> {
        let dir = self.dir.clone();
        if block {
            purge_dir(&dir)
        } else {
            std::thread::spawn(move || {
                if let Err(e) = purge_dir(&dir) {
                    warn!(dir = %dir.display(), "trash purge failed: {e}");
                }
            });
            Ok(())
        }
    }
}

fn purge_dir(dir: &Path) -> std::io::Result<()> {
    let it = match std::fs::read_dir(dir) {
        Ok(it) => it,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for dent in it {
        let dent = dent?;
        let path = dent.path();
        if dent.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trash_moves_files_out_of_sight() {
        let tmp = tempfile::tempdir().unwrap();
        let trash = Trash::new(tmp.path().join("trash"));

        let victim = tmp.path().join("victim.txt");
        std::fs::write(&victim, b"bye").unwrap();
        trash.trash(&victim).unwrap();

        assert!(!victim.exists());
        assert_eq!(std::fs::read_dir(trash.dir()).unwrap().count(), 1);
    }

    #[test]
    fn trash_missing_path_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let trash = Trash::new(tmp.path().join("trash"));
        trash.trash(&tmp.path().join("never-existed")).unwrap();
    }

    #[test]
    fn trash_handles_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let trash = Trash::new(tmp.path().join("trash"));

        let dir = tmp.path().join("build-out");
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("sub/f"), b"x").unwrap();
        trash.trash(&dir).unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn blocking_purge_empties_the_trash() {
        let tmp = tempfile::tempdir().unwrap();
        let trash = Trash::new(tmp.path().join("trash"));

        for i in 0..3 {
            let f = tmp.path().join(format!("f{i}"));
            std::fs::write(&f, b"x").unwrap();
            trash.trash(&f).unwrap();
        }
        trash.purge(true).unwrap();
        assert_eq!(std::fs::read_dir(trash.dir()).unwrap().count(), 0);
    }

    #[test]
    fn purge_of_missing_trash_dir_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let trash = Trash::new(tmp.path().join("trash"));
        trash.purge(true).unwrap();
    }
}
