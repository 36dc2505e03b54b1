//! Operation hashing and cache revival.
//!
//! The hash of an operation is a deterministic digest of its semantic inputs
//! only: what runs, with which arguments and stamped environment, over which
//! file contents. Scheduling order, absolute timestamps, and unstamped
//! variables stay out. Reads and stamped environments are hashed in sorted
//! order, so the digest is independent of enumeration order.
//!
//! File content hashes are memoized for the lifetime of the build: a file is
//! only hashed after the guard declared it ready, at which point its content
//! is final.

use crate::op::{Kind, Op, Sink, Status};
use kiln_cache::{CacheError, FileCache};
use kiln_hash::{Hash, HashFn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Deterministic, unambiguous input accumulator: every field is
/// length-prefixed so adjacent values cannot alias.
struct Stamp {
    buf: Vec<u8>,
}

impl Stamp {
    fn new() -> Stamp {
        Stamp { buf: Vec::new() }
    }

    fn add(&mut self, bytes: &[u8]) {
        self.buf.extend((bytes.len() as u64).to_le_bytes());
        self.buf.extend(bytes);
    }

    fn add_str(&mut self, s: &str) {
        self.add(s.as_bytes());
    }

    fn add_path(&mut self, p: &Path) {
        self.add(p.as_os_str().as_encoded_bytes());
    }

    fn add_u32(&mut self, v: u32) {
        self.add(&v.to_le_bytes());
    }

    fn add_i32(&mut self, v: i32) {
        self.add(&v.to_le_bytes());
    }

    fn add_hash(&mut self, h: &Hash) {
        self.add(h.as_bytes());
    }
}

pub struct Reviver {
    cache: FileCache,
    hash_fn: Box<dyn HashFn>,
    file_hashes: HashMap<PathBuf, Hash>,
}

impl Reviver {
    pub fn new(cache: FileCache, hash_fn: Box<dyn HashFn>) -> Reviver {
        Reviver {
            cache,
            hash_fn,
            file_hashes: HashMap::new(),
        }
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    pub fn hash_string(&self, s: &str) -> Hash {
        self.hash_fn.hash_bytes(s.as_bytes())
    }

    /// Content hash of `path`, memoized per build.
    pub fn hash_file(&mut self, path: &Path) -> std::io::Result<Hash> {
        memo_hash_file(&mut self.file_hashes, &*self.hash_fn, path)
    }

    /// Hash a cache-eligible operation over its semantic inputs. Declared
    /// reads (and the tool / stdin files of a spawn) that cannot be hashed
    /// are collected into the error.
    pub fn hash_op(&mut self, op: &Op) -> Result<Hash, Vec<PathBuf>> {
        debug_assert!(op.cache_eligible(), "hash_op on a {} op", op.kind.name());
        let mut stamp = Stamp::new();
        let mut missing: Vec<PathBuf> = Vec::new();
        stamp.add_str(op.kind.name());

        let mut add_file = |stamp: &mut Stamp, missing: &mut Vec<PathBuf>, path: &Path| {
            match memo_hash_file(&mut self.file_hashes, &*self.hash_fn, path) {
                Ok(h) => stamp.add_hash(&h),
                Err(_) => missing.push(path.to_path_buf()),
            }
        };

        match &op.kind {
            Kind::Spawn(s) => {
                add_file(&mut stamp, &mut missing, &s.tool);
                for arg in &s.args {
                    stamp.add_str(arg);
                }
                for (k, v) in &s.stamped_env {
                    stamp.add_str(k);
                    stamp.add_str(v);
                }
                stamp.add_path(&s.cwd);
                match &s.stdin {
                    Some(p) => stamp.add_path(p),
                    None => stamp.add_str("-"),
                }
                add_sink(&mut stamp, &s.stdout);
                add_sink(&mut stamp, &s.stderr);
                for code in &s.success_exits {
                    stamp.add_i32(*code);
                }
                stamp.add_str(&s.stamp);
                for read in &op.reads {
                    add_file(&mut stamp, &mut missing, read);
                }
            }
            Kind::Write(w) => {
                // The target participates: two stampless writes to distinct
                // files must not share a key.
                stamp.add_path(&w.target);
                stamp.add_str(&w.stamp);
                stamp.add_u32(w.mode);
                for read in &op.reads {
                    add_file(&mut stamp, &mut missing, read);
                }
            }
            Kind::Copy(c) => {
                add_file(&mut stamp, &mut missing, &c.src);
                stamp.add_path(&c.dst);
                stamp.add_u32(c.mode);
                match c.linenum {
                    Some(n) => stamp.add_u32(n),
                    None => stamp.add_str("-"),
                }
            }
            Kind::Mkdir(m) => {
                stamp.add_path(&m.dir);
                stamp.add_u32(m.mode);
            }
            _ => {}
        }

        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Err(missing);
        }
        Ok(self.hash_fn.hash_bytes(&stamp.buf))
    }

    /// Try to restore `op.writes` from the cache under `op.hash`. On a hit
    /// the operation is marked revived and Done; a rooted spawn gets its
    /// writes installed from the stored manifest.
    pub fn revive(&mut self, op: &mut Op) -> Result<bool, CacheError> {
        let key = op.hash.to_hex();
        let rooted = match op.writes_root() {
            Some(root) if op.writes.is_empty() => Some(root.to_path_buf()),
            _ => None,
        };
        let revived = match rooted {
            Some(root) => match self.cache.find(&key)? {
                None => false,
                Some(manifest) => {
                    let targets: Vec<PathBuf> =
                        manifest.names.iter().map(|n| root.join(n)).collect();
                    let hit = self.cache.revive(&key, &targets)?.is_some();
                    if hit {
                        op.set_writes(targets);
                    }
                    hit
                }
            },
            None => self.cache.revive(&key, &op.writes)?.is_some(),
        };

        if revived {
            op.revived = true;
            op.status = Status::Done;
            if let Kind::Spawn(s) = &mut op.kind {
                // The recorded execution succeeded; report the smallest
                // declared success exit.
                s.exit = Some(s.success_exits.first().copied().unwrap_or(0));
            }
            debug!(id = op.id, key, "op revived");
        }
        Ok(revived)
    }

    /// Record a completed operation's writes under its hash. `Ok(false)`
    /// when there is no manifest to store: no writes, or writes that are not
    /// regular files (a mkdir's directory re-executes instead of reviving).
    pub fn record(&mut self, op: &Op) -> Result<bool, CacheError> {
        if op.writes.is_empty() || !op.writes.iter().all(|w| w.is_file()) {
            return Ok(false);
        }
        let key = op.hash.to_hex();
        let names: Vec<String> = match op.writes_root() {
            Some(root) => op
                .writes
                .iter()
                .map(|w| {
                    w.strip_prefix(root)
                        .unwrap_or(w)
                        .to_string_lossy()
                        .into_owned()
                })
                .collect(),
            None => op
                .writes
                .iter()
                .map(|w| w.to_string_lossy().into_owned())
                .collect(),
        };
        self.cache.add(&key, &names, &op.writes)?;
        debug!(id = op.id, key, files = names.len(), "op recorded");
        Ok(true)
    }
}

fn add_sink(stamp: &mut Stamp, sink: &Sink) {
    match sink {
        Sink::Inherit => stamp.add_str("inherit"),
        Sink::Null => stamp.add_str("null"),
        Sink::File(p) => {
            stamp.add_str("file");
            stamp.add_path(p);
        }
    }
}

fn memo_hash_file(
    memo: &mut HashMap<PathBuf, Hash>,
    hash_fn: &dyn HashFn,
    path: &Path,
) -> std::io::Result<Hash> {
    if let Some(h) = memo.get(path) {
        return Ok(h.clone());
    }
    let h = hash_fn.hash_file(path)?;
    memo.insert(path.to_path_buf(), h.clone());
    Ok(h)
}
