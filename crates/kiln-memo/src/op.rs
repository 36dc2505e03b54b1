//! Build operations.
//!
//! An operation is a plain data record: the memoizer creates it, the guard
//! holds it while its reads are pending, the executor owns it while it runs,
//! and it ends its life in the memoizer's finished-op list. All state
//! transitions are routed through the memoizer; operations carry no
//! back-pointers, which is what lets them move across the executor's task
//! boundary. Closure payloads (write producers, post-exec hooks) are `Send`
//! for the same reason.

use kiln_hash::Hash;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub type OpId = u64;

/// Bytes captured by a read operation, cheap to hand to several waiters.
pub type FileBytes = Arc<[u8]>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Reads not yet ready, or queued for execution.
    Waiting,
    /// A read became Never before the operation could run.
    Aborted,
    Done,
    Failed(FailureKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Child exited outside its success set, or an IO error during execution.
    Exec(Option<String>),
    /// Declared reads that could not be hashed.
    MissingReads(Vec<PathBuf>),
    /// Declared writes that never materialized on disk.
    MissingWrites(Vec<PathBuf>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    Info,
    Warn,
    Fail,
}

/// Destination for a spawned child's stdout or stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    Inherit,
    Null,
    File(PathBuf),
}

pub type WriteProducer = Box<dyn FnOnce() -> anyhow::Result<Vec<u8>> + Send>;
pub type PostExec = Box<dyn FnOnce(&mut Op) -> anyhow::Result<()> + Send>;

pub struct ReadOp {
    pub file: PathBuf,
    /// Filled by the executor, consumed at finish.
    pub data: Option<FileBytes>,
}

pub struct WriteOp {
    pub stamp: String,
    pub mode: u32,
    pub target: PathBuf,
    /// Not invoked when the operation is revived.
    pub producer: Option<WriteProducer>,
}

pub struct CopyOp {
    pub src: PathBuf,
    pub dst: PathBuf,
    pub mode: u32,
    /// Prefix the copy with a `#line <n> "<src>"` directive.
    pub linenum: Option<u32>,
}

pub struct MkdirOp {
    pub dir: PathBuf,
    pub mode: u32,
}

pub struct DeleteOp {
    pub path: PathBuf,
}

pub struct NotifyOp {
    pub kind: NotifyKind,
    pub msg: String,
}

pub struct SpawnOp {
    pub tool: PathBuf,
    pub args: Vec<String>,
    /// Exec-time environment, complete.
    pub env: Vec<(String, String)>,
    /// The subset that participates in the operation hash.
    pub stamped_env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub stamp: String,
    pub stdin: Option<PathBuf>,
    pub stdout: Sink,
    pub stderr: Sink,
    /// Sorted. The child must exit with one of these codes.
    pub success_exits: Vec<i32>,
    /// Writes are discovered under this root after execution.
    pub writes_root: Option<PathBuf>,
    pub post_exec: Option<PostExec>,
    pub response_file: Option<crate::tool::ResponseFile>,
    /// Captured exit code, set by the executor.
    pub exit: Option<i32>,
}

pub enum Kind {
    Read(ReadOp),
    Write(WriteOp),
    Copy(CopyOp),
    Mkdir(MkdirOp),
    Delete(DeleteOp),
    WaitFiles,
    Notify(NotifyOp),
    Spawn(SpawnOp),
}

impl Kind {
    pub fn name(&self) -> &'static str {
        match self {
            Kind::Read(_) => "read",
            Kind::Write(_) => "write",
            Kind::Copy(_) => "copy",
            Kind::Mkdir(_) => "mkdir",
            Kind::Delete(_) => "delete",
            Kind::WaitFiles => "wait-files",
            Kind::Notify(_) => "notify",
            Kind::Spawn(_) => "spawn",
        }
    }
}

impl fmt::Debug for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Read(r) => f.debug_struct("Read").field("file", &r.file).finish(),
            Kind::Write(w) => f
                .debug_struct("Write")
                .field("target", &w.target)
                .field("stamp", &w.stamp)
                .finish(),
            Kind::Copy(c) => f
                .debug_struct("Copy")
                .field("src", &c.src)
                .field("dst", &c.dst)
                .finish(),
            Kind::Mkdir(m) => f.debug_struct("Mkdir").field("dir", &m.dir).finish(),
            Kind::Delete(d) => f.debug_struct("Delete").field("path", &d.path).finish(),
            Kind::WaitFiles => f.write_str("WaitFiles"),
            Kind::Notify(n) => f
                .debug_struct("Notify")
                .field("kind", &n.kind)
                .field("msg", &n.msg)
                .finish(),
            Kind::Spawn(s) => f
                .debug_struct("Spawn")
                .field("tool", &s.tool)
                .field("args", &s.args)
                .field("exit", &s.exit)
                .finish(),
        }
    }
}

#[derive(Debug)]
pub struct Op {
    pub id: OpId,
    pub mark: String,
    /// Time since the memoizer's start.
    pub created: Duration,
    pub status: Status,
    /// Nil until the reviver hashed the operation.
    pub hash: Hash,
    pub revived: bool,
    /// Execution time, zero for revived operations.
    pub duration: Duration,
    /// Sorted, deduplicated.
    pub reads: Vec<PathBuf>,
    /// Sorted, deduplicated.
    pub writes: Vec<PathBuf>,
    pub kind: Kind,
}

impl Op {
    pub fn new(
        id: OpId,
        mark: String,
        created: Duration,
        mut reads: Vec<PathBuf>,
        mut writes: Vec<PathBuf>,
        kind: Kind,
    ) -> Op {
        reads.sort();
        reads.dedup();
        writes.sort();
        writes.dedup();
        Op {
            id,
            mark,
            created,
            status: Status::Waiting,
            hash: Hash::nil(),
            revived: false,
            duration: Duration::ZERO,
            reads,
            writes,
            kind,
        }
    }

    /// Replace the declared writes, keeping them sorted and deduplicated.
    pub fn set_writes(&mut self, mut writes: Vec<PathBuf>) {
        writes.sort();
        writes.dedup();
        self.writes = writes;
    }

    /// The writes-discovery root of a rooted spawn, if any.
    pub fn writes_root(&self) -> Option<&std::path::Path> {
        match &self.kind {
            Kind::Spawn(SpawnOp {
                writes_root: Some(root),
                ..
            }) => Some(root),
            _ => None,
        }
    }

    /// Only these kinds are hashed, revived, and recorded. The others always
    /// execute and keep a nil hash.
    pub fn cache_eligible(&self) -> bool {
        matches!(
            self.kind,
            Kind::Spawn(_) | Kind::Write(_) | Kind::Copy(_) | Kind::Mkdir(_)
        )
    }

    pub fn failed(&self) -> bool {
        matches!(self.status, Status::Failed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op_with(reads: Vec<PathBuf>, writes: Vec<PathBuf>, kind: Kind) -> Op {
        Op::new(1, "test".into(), Duration::ZERO, reads, writes, kind)
    }

    #[test]
    fn reads_and_writes_are_sorted_and_deduped() {
        let op = op_with(
            vec!["/b".into(), "/a".into(), "/b".into()],
            vec!["/z".into(), "/y".into(), "/z".into()],
            Kind::WaitFiles,
        );
        assert_eq!(op.reads, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(op.writes, vec![PathBuf::from("/y"), PathBuf::from("/z")]);
    }

    #[test]
    fn cache_eligibility_by_kind() {
        let read = op_with(
            vec![],
            vec![],
            Kind::Read(ReadOp {
                file: "/f".into(),
                data: None,
            }),
        );
        assert!(!read.cache_eligible());

        let mkdir = op_with(
            vec![],
            vec!["/d".into()],
            Kind::Mkdir(MkdirOp {
                dir: "/d".into(),
                mode: 0o755,
            }),
        );
        assert!(mkdir.cache_eligible());

        let wait = op_with(vec!["/f".into()], vec![], Kind::WaitFiles);
        assert!(!wait.cache_eligible());
    }

    #[test]
    fn new_ops_start_waiting_with_nil_hash() {
        let op = op_with(vec![], vec![], Kind::WaitFiles);
        assert_eq!(op.status, Status::Waiting);
        assert!(op.hash.is_nil());
        assert!(!op.revived);
    }
}
