//! Digest values and the pluggable hash algorithm seam.

use std::fmt;
use std::io::Read;
use std::path::Path;

/// An opaque digest. The empty digest is the distinguished `nil` value used
/// as the "not yet hashed" sentinel on operations.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(Box<[u8]>);

impl Hash {
    /// The nil hash: empty, never produced by an algorithm.
    pub fn nil() -> Hash {
        Hash(Box::from([]))
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_empty()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Hash {
        Hash(bytes.into_boxed_slice())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex form, used as the cache key.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(self.0.len() * 2);
        for b in self.0.iter() {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }

    /// Parse a hex string back into a digest.
    pub fn from_hex(hex: &str) -> anyhow::Result<Hash> {
        if hex.len() % 2 != 0 {
            anyhow::bail!("odd-length hex digest: {hex:?}");
        }
        let mut out = Vec::with_capacity(hex.len() / 2);
        for i in (0..hex.len()).step_by(2) {
            let byte = u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|e| anyhow::anyhow!("invalid hex digest {hex:?}: {e}"))?;
            out.push(byte);
        }
        Ok(Hash::from_bytes(out))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            f.write_str("Hash(nil)")
        } else {
            write!(f, "Hash({})", self.to_hex())
        }
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A hash algorithm. Implementations must be deterministic across runs and
/// platforms; digests are persisted in cache keys.
pub trait HashFn: Send + Sync {
    /// Short algorithm identifier (stable, lowercase).
    fn id(&self) -> &'static str;

    /// Hash a byte slice in memory.
    fn hash_bytes(&self, data: &[u8]) -> Hash;

    /// Hash a file's content. The default implementation streams through a
    /// 64KB buffer via `hash_reader`.
    fn hash_file(&self, path: &Path) -> std::io::Result<Hash> {
        let file = std::fs::File::open(path)?;
        self.hash_reader(Box::new(file))
    }

    /// Hash the content of an arbitrary reader.
    fn hash_reader(&self, reader: Box<dyn Read + '_>) -> std::io::Result<Hash>;
}

/// XXH3-64: the default operation hash.
#[derive(Debug, Clone, Copy, Default)]
pub struct Xxh3;

impl HashFn for Xxh3 {
    fn id(&self) -> &'static str {
        "xxh3"
    }

    fn hash_bytes(&self, data: &[u8]) -> Hash {
        let d = xxhash_rust::xxh3::xxh3_64(data);
        Hash::from_bytes(d.to_be_bytes().to_vec())
    }

    fn hash_reader(&self, mut reader: Box<dyn Read + '_>) -> std::io::Result<Hash> {
        let mut hasher = xxhash_rust::xxh3::Xxh3::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Hash::from_bytes(hasher.digest().to_be_bytes().to_vec()))
    }
}

/// BLAKE3-256: stronger digests for callers that want them.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3;

impl HashFn for Blake3 {
    fn id(&self) -> &'static str {
        "blake3"
    }

    fn hash_bytes(&self, data: &[u8]) -> Hash {
        Hash::from_bytes(blake3::hash(data).as_bytes().to_vec())
    }

    fn hash_reader(&self, mut reader: Box<dyn Read + '_>) -> std::io::Result<Hash> {
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Hash::from_bytes(hasher.finalize().as_bytes().to_vec()))
    }
}

/// Algorithm selector, e.g. from the `[memo] hash` config key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Xxh3,
    Blake3,
}

impl HashKind {
    pub fn from_id(id: &str) -> Option<HashKind> {
        match id {
            "xxh3" => Some(HashKind::Xxh3),
            "blake3" => Some(HashKind::Blake3),
            _ => None,
        }
    }

    pub fn to_fn(self) -> Box<dyn HashFn> {
        match self {
            HashKind::Xxh3 => Box::new(Xxh3),
            HashKind::Blake3 => Box::new(Blake3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn nil_is_nil() {
        assert!(Hash::nil().is_nil());
        assert!(!Xxh3.hash_bytes(b"").is_nil());
    }

    #[test]
    fn digest_widths() {
        assert_eq!(Xxh3.hash_bytes(b"kiln").as_bytes().len(), 8);
        assert_eq!(Blake3.hash_bytes(b"kiln").as_bytes().len(), 32);
    }

    #[test]
    fn hex_roundtrip() {
        let h = Xxh3.hash_bytes(b"hello kiln");
        let hex = h.to_hex();
        assert_eq!(hex.len(), 16);
        let back = Hash::from_hex(&hex).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn bad_hex_is_rejected() {
        assert!(Hash::from_hex("abc").is_err());
        assert!(Hash::from_hex("zz").is_err());
    }

    #[test]
    fn file_hash_matches_bytes_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let content = b"some file content that goes through the streaming path";
        std::fs::write(&path, content).unwrap();

        for alg in [&Xxh3 as &dyn HashFn, &Blake3 as &dyn HashFn] {
            let from_file = alg.hash_file(&path).unwrap();
            let from_bytes = alg.hash_bytes(content);
            assert_eq!(from_file, from_bytes, "{} file/bytes mismatch", alg.id());
        }
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Xxh3.hash_file(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn kind_from_id() {
        assert_eq!(HashKind::from_id("xxh3"), Some(HashKind::Xxh3));
        assert_eq!(HashKind::from_id("blake3"), Some(HashKind::Blake3));
        assert_eq!(HashKind::from_id("md5"), None);
    }

    proptest! {
        #[test]
        fn hash_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..=4096)) {
            prop_assert_eq!(Xxh3.hash_bytes(&data), Xxh3.hash_bytes(&data));
            prop_assert_eq!(Blake3.hash_bytes(&data), Blake3.hash_bytes(&data));
        }

        #[test]
        fn hex_roundtrips(data in proptest::collection::vec(any::<u8>(), 0..=1024)) {
            let h = Xxh3.hash_bytes(&data);
            prop_assert_eq!(Hash::from_hex(&h.to_hex()).unwrap(), h);
        }
    }
}
