//! File readiness tracking.
//!
//! Every file path the build touches is Unknown until something decides it:
//! Ready (it exists with final content) or Never (its producer failed).
//! Operations wait here until their last unmet read resolves. A path never
//! regresses from Ready or Never, and an operation becomes allowed exactly
//! once; aborted operations are still surfaced through `allowed` so the
//! memoizer can run their finish protocol.

use crate::op::{Op, OpId, Status};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileStatus {
    Ready,
    Never,
}

struct PendingOp {
    op: Op,
    awaits: BTreeSet<PathBuf>,
}

#[derive(Default)]
pub struct Guard {
    files: HashMap<PathBuf, FileStatus>,
    pending: HashMap<OpId, PendingOp>,
    awaiting: HashMap<PathBuf, Vec<OpId>>,
    allowed: VecDeque<Op>,
}

impl Guard {
    pub fn new() -> Guard {
        Guard::default()
    }

    /// Register an operation. It becomes allowed now (reads empty or all
    /// Ready), aborted-and-allowed (some read is Never), or pending.
    pub fn add(&mut self, mut op: Op) {
        let mut awaits = BTreeSet::new();
        let mut never = false;
        for read in &op.reads {
            match self.files.get(read) {
                Some(FileStatus::Ready) => {}
                Some(FileStatus::Never) => never = true,
                None => {
                    awaits.insert(read.clone());
                }
            }
        }
        if never {
            op.status = Status::Aborted;
            self.allowed.push_back(op);
            return;
        }
        if awaits.is_empty() {
            self.allowed.push_back(op);
            return;
        }
        for file in &awaits {
            self.awaiting.entry(file.clone()).or_default().push(op.id);
        }
        self.pending.insert(op.id, PendingOp { op, awaits });
    }

    /// Transition `file` to Ready. Idempotent; ignored if the file already
    /// reached Ready or Never.
    pub fn set_file_ready(&mut self, file: &Path) {
        if self.files.contains_key(file) {
            return;
        }
        self.files.insert(file.to_path_buf(), FileStatus::Ready);
        for id in self.awaiting.remove(file).unwrap_or_default() {
            let done = match self.pending.get_mut(&id) {
                None => continue,
                Some(pending) => {
                    pending.awaits.remove(file);
                    pending.awaits.is_empty()
                }
            };
            if done {
                let pending = self.pending.remove(&id).unwrap();
                self.allowed.push_back(pending.op);
            }
        }
    }

    /// Transition `file` to Never: abort every operation that reads it.
    pub fn set_file_never(&mut self, file: &Path) {
        if self.files.contains_key(file) {
            return;
        }
        self.files.insert(file.to_path_buf(), FileStatus::Never);
        for id in self.awaiting.remove(file).unwrap_or_default() {
            if let Some(mut pending) = self.pending.remove(&id) {
                // Unindex its other awaited files.
                for other in &pending.awaits {
                    if let Some(ids) = self.awaiting.get_mut(other) {
                        ids.retain(|i| *i != id);
                    }
                }
                pending.op.status = Status::Aborted;
                self.allowed.push_back(pending.op);
            }
        }
    }

    /// Pop one allowed operation, FIFO over allowance order.
    pub fn allowed(&mut self) -> Option<Op> {
        self.allowed.pop_front()
    }

    /// No operation is waiting or ready to be popped.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.allowed.is_empty()
    }

    /// Operations still gated on unmet reads, for deadlock diagnostics.
    pub fn pending_ops(&self) -> impl Iterator<Item = &Op> {
        self.pending.values().map(|p| &p.op)
    }

    /// The unmet reads of a pending operation.
    pub fn pending_awaits(&self, id: OpId) -> Option<&BTreeSet<PathBuf>> {
        self.pending.get(&id).map(|p| &p.awaits)
    }

    /// Files some pending operation still waits for.
    pub fn awaited_files(&self) -> impl Iterator<Item = &Path> {
        self.awaiting
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(file, _)| file.as_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Kind;
    use std::time::Duration;

    fn op(id: OpId, reads: &[&str], writes: &[&str]) -> Op {
        Op::new(
            id,
            "test".into(),
            Duration::ZERO,
            reads.iter().map(PathBuf::from).collect(),
            writes.iter().map(PathBuf::from).collect(),
            Kind::WaitFiles,
        )
    }

    #[test]
    fn no_reads_is_immediately_allowed() {
        let mut guard = Guard::new();
        guard.add(op(1, &[], &["/out"]));
        assert_eq!(guard.allowed().map(|o| o.id), Some(1));
        assert!(guard.allowed().is_none());
    }

    #[test]
    fn gated_until_last_read_ready() {
        let mut guard = Guard::new();
        guard.add(op(1, &["/a", "/b"], &[]));
        assert!(guard.allowed().is_none());

        guard.set_file_ready(Path::new("/a"));
        assert!(guard.allowed().is_none());

        guard.set_file_ready(Path::new("/b"));
        let op = guard.allowed().expect("op allowed");
        assert_eq!(op.id, 1);
        assert_eq!(op.status, Status::Waiting);
    }

    #[test]
    fn ready_before_add_counts() {
        let mut guard = Guard::new();
        guard.set_file_ready(Path::new("/a"));
        guard.add(op(1, &["/a"], &[]));
        assert_eq!(guard.allowed().map(|o| o.id), Some(1));
    }

    #[test]
    fn never_aborts_readers() {
        let mut guard = Guard::new();
        guard.add(op(1, &["/a", "/b"], &[]));
        guard.set_file_never(Path::new("/a"));

        let op = guard.allowed().expect("aborted op surfaced");
        assert_eq!(op.status, Status::Aborted);
        assert!(guard.is_idle());
    }

    #[test]
    fn never_before_add_aborts_immediately() {
        let mut guard = Guard::new();
        guard.set_file_never(Path::new("/a"));
        guard.add(op(1, &["/a"], &[]));
        assert_eq!(
            guard.allowed().map(|o| o.status),
            Some(Status::Aborted)
        );
    }

    #[test]
    fn ready_then_never_does_not_regress() {
        let mut guard = Guard::new();
        guard.set_file_ready(Path::new("/a"));
        guard.set_file_never(Path::new("/a"));
        guard.add(op(1, &["/a"], &[]));
        // /a stayed Ready, so the op is allowed, not aborted.
        assert_eq!(guard.allowed().map(|o| o.status), Some(Status::Waiting));
    }

    #[test]
    fn allowance_is_fifo() {
        let mut guard = Guard::new();
        guard.add(op(1, &[], &[]));
        guard.add(op(2, &[], &[]));
        guard.add(op(3, &["/x"], &[]));
        guard.set_file_ready(Path::new("/x"));

        let order: Vec<OpId> = std::iter::from_fn(|| guard.allowed().map(|o| o.id)).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn diagnostics_expose_awaited_files() {
        let mut guard = Guard::new();
        guard.add(op(1, &["/a"], &["/b"]));
        let awaited: Vec<_> = guard.awaited_files().collect();
        assert_eq!(awaited, vec![Path::new("/a")]);
        assert_eq!(guard.pending_ops().count(), 1);
        assert!(guard
            .pending_awaits(1)
            .unwrap()
            .contains(Path::new("/a")));
    }
}
