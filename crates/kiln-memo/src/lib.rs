//! kiln-memo: the build memoization engine
//!
//! Client code declares read, write, copy, mkdir, delete, wait, notify, and
//! process-spawn operations against a [`Memo`]. Each operation is hashed over
//! its semantic inputs, revived from the content-addressed file cache when a
//! previous run already produced its outputs, and otherwise executed with
//! bounded parallelism. Continuations are delivered through one-shot
//! [`Fut`] values drained by the cooperative stir loop.
//!
//! # Module map
//! - `op`: the operation record and its kind payloads
//! - `guard`: file readiness tracking, gating operations on their reads
//! - `reviver`: operation hashing policy, cache revival and recording
//! - `executor`: semaphore-bounded execution of spawns and filesystem ops
//! - `fiber`: one-shot futures and the fiber-ready queue
//! - `tool`: tool declarations, environment stamping, response files
//! - `memo`: the public operation surface and the stir loop
//! - `store`: typed lazy per-build values

pub mod executor;
pub mod fiber;
pub mod guard;
pub mod memo;
pub mod op;
pub mod reviver;
pub mod store;
pub mod tool;

pub use fiber::{Abort, FiberResult, Fut};
pub use memo::{CopyOpts, Event, Memo, MemoBuilder, MemoError, SpawnBuilder, WriteOpts};
pub use op::{FailureKind, FileBytes, Kind, NotifyKind, Op, OpId, Sink, Status};
pub use store::{Key, Store};
pub use tool::{Cmd, ResponseFile, Tool};
