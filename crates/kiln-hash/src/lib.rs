//! kiln-hash: content hashing for operations and files
//!
//! # Overview
//! - `Hash`: an opaque digest with a distinguished `nil` value
//! - `HashFn`: the pluggable algorithm seam (bytes and files)
//! - `Xxh3`: 64-bit non-cryptographic default, fast enough to hash every
//!   read of every operation
//! - `Blake3`: 256-bit alternative for callers that want collision margins
//!
//! The digest is used as a cache identity, not as a security boundary; the
//! default therefore optimizes for throughput.

pub mod digest;

pub use digest::{Blake3, Hash, HashFn, HashKind, Xxh3};
