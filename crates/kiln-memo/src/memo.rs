//! The memoizer: public operation surface and the stir loop.
//!
//! A [`Memo`] is a cheap clone-able handle over single-threaded state; all
//! operation mutation happens on the driver thread between executor
//! collects, so nothing here locks. Client code declares operations, calls
//! [`Memo::stir`] until quiescence, then asks [`Memo::status`] what became
//! of the build.

use crate::executor::Executor;
use crate::fiber::{Abort, FiberFn, FiberQueue, FiberResult, Fut};
use crate::guard::Guard;
use crate::op::{
    CopyOp, DeleteOp, FailureKind, FileBytes, Kind, MkdirOp, NotifyKind, NotifyOp, Op, OpId,
    PostExec, ReadOp, Sink, SpawnOp, Status, WriteOp,
};
use crate::reviver::Reviver;
use crate::tool::{find_tool, Tool};
use kiln_cache::{FileCache, Trash};
use kiln_core::config::KilnConfig;
use kiln_core::paths;
use kiln_core::{KilnError, KilnResult};
use kiln_hash::{Hash, HashKind};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Advisory feedback events. Consumers log; the engine never depends on
/// observation.
pub enum Event<'a> {
    MissTool { tool: PathBuf, reason: String },
    /// The operation was handed to the executor (not fired on revival).
    ExecStart(&'a Op),
    /// The operation finished, revived or executed, in any final status.
    OpComplete(&'a Op),
}

/// Aggregate build outcome, from [`Memo::status`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoError {
    #[error("build finished with failed operations")]
    Failures,
    #[error("files never became ready: {0:?}")]
    NeverBecameReady(Vec<PathBuf>),
    #[error("dependency cycle among operations {0:?}")]
    Cycle(Vec<OpId>),
}

enum OpKont {
    Unit(Fut<()>),
    Bytes(Fut<FileBytes>),
    Exit(Fut<i32>),
}

struct MemoInner {
    start: Instant,
    cwd: PathBuf,
    env: BTreeMap<String, String>,
    guard: Guard,
    reviver: Reviver,
    exec: Executor,
    /// Finished operations, in completion order.
    ops: Vec<Op>,
    next_id: OpId,
    konts: HashMap<OpId, OpKont>,
    /// Files declared ready by the client rather than produced by an op.
    ready_roots: BTreeSet<PathBuf>,
    has_failures: bool,
}

#[derive(Clone)]
pub struct Memo {
    inner: Rc<RefCell<MemoInner>>,
    fibers: FiberQueue,
    feedback: Option<Rc<dyn Fn(Event<'_>)>>,
    mark: Rc<str>,
}

pub struct MemoBuilder {
    jobs: usize,
    hash: HashKind,
    cwd: Option<PathBuf>,
    env: Option<BTreeMap<String, String>>,
    cache_dir: Option<PathBuf>,
    trash_dir: Option<PathBuf>,
    tmp_dir: Option<PathBuf>,
    feedback: Option<Rc<dyn Fn(Event<'_>)>>,
}

impl MemoBuilder {
    pub fn new() -> MemoBuilder {
        MemoBuilder {
            jobs: 0,
            hash: HashKind::Xxh3,
            cwd: None,
            env: None,
            cache_dir: None,
            trash_dir: None,
            tmp_dir: None,
            feedback: None,
        }
    }

    /// Maximum concurrently executing operations; 0 means available
    /// parallelism.
    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn hash(mut self, kind: HashKind) -> Self {
        self.hash = kind;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// The environment operations capture; defaults to the process env.
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn trash_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trash_dir = Some(dir.into());
        self
    }

    pub fn tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = Some(dir.into());
        self
    }

    pub fn feedback(mut self, f: impl Fn(Event<'_>) + 'static) -> Self {
        self.feedback = Some(Rc::new(f));
        self
    }

    /// Take jobs, hash algorithm, and directories from a [`KilnConfig`],
    /// anchoring defaults under `base`.
    pub fn config(mut self, config: &KilnConfig, base: &Path) -> KilnResult<Self> {
        self.jobs = config.memo.jobs;
        self.hash = HashKind::from_id(&config.memo.hash).ok_or_else(|| {
            KilnError::Config(format!("unknown hash algorithm: {}", config.memo.hash))
        })?;
        let dir = config.dir_in(base);
        self.cache_dir = Some(config.cache_dir_in(base));
        self.trash_dir = Some(dir.join("trash"));
        self.tmp_dir = Some(dir.join("tmp"));
        Ok(self)
    }

    pub fn build(self) -> KilnResult<Memo> {
        let cwd = match self.cwd {
            Some(cwd) => cwd,
            None => std::env::current_dir()?,
        };
        let env = self
            .env
            .unwrap_or_else(|| std::env::vars().collect::<BTreeMap<_, _>>());
        let state_dir = cwd.join("_kiln");
        let cache_dir = self.cache_dir.unwrap_or_else(|| state_dir.join(".cache"));
        let trash_dir = self.trash_dir.unwrap_or_else(|| state_dir.join("trash"));
        let tmp_dir = self.tmp_dir.unwrap_or_else(|| state_dir.join("tmp"));

        let cache = FileCache::create(&cache_dir)
            .map_err(|e| KilnError::Cache(e.to_string()))?;
        let reviver = Reviver::new(cache, self.hash.to_fn());
        let exec = Executor::new(self.jobs, Trash::new(trash_dir), tmp_dir)?;

        Ok(Memo {
            inner: Rc::new(RefCell::new(MemoInner {
                start: Instant::now(),
                cwd,
                env,
                guard: Guard::new(),
                reviver,
                exec,
                ops: Vec::new(),
                next_id: 0,
                konts: HashMap::new(),
                ready_roots: BTreeSet::new(),
                has_failures: false,
            })),
            fibers: FiberQueue::new(),
            feedback: self.feedback,
            mark: Rc::from(""),
        })
    }
}

impl Default for MemoBuilder {
    fn default() -> Self {
        MemoBuilder::new()
    }
}

/// Options for [`Memo::write_with`].
pub struct WriteOpts {
    pub stamp: String,
    pub reads: Vec<PathBuf>,
    pub mode: u32,
}

impl Default for WriteOpts {
    fn default() -> Self {
        WriteOpts {
            stamp: String::new(),
            reads: Vec::new(),
            mode: 0o644,
        }
    }
}

/// Options for [`Memo::copy_with`].
pub struct CopyOpts {
    pub mode: u32,
    pub linenum: Option<u32>,
}

impl Default for CopyOpts {
    fn default() -> Self {
        CopyOpts {
            mode: 0o644,
            linenum: None,
        }
    }
}

impl Memo {
    pub fn builder() -> MemoBuilder {
        MemoBuilder::new()
    }

    /// A handle creating operations under `mark`, sharing all state.
    pub fn with_mark(&self, mark: &str) -> Memo {
        Memo {
            inner: Rc::clone(&self.inner),
            fibers: self.fibers.clone(),
            feedback: self.feedback.clone(),
            mark: Rc::from(mark),
        }
    }

    pub fn mark(&self) -> &str {
        &self.mark
    }

    pub fn cwd(&self) -> PathBuf {
        self.inner.borrow().cwd.clone()
    }

    pub fn jobs(&self) -> usize {
        self.inner.borrow().exec.jobs()
    }

    pub fn has_failures(&self) -> bool {
        self.inner.borrow().has_failures
    }

    /// Inspect the finished operations.
    pub fn with_ops<R>(&self, f: impl FnOnce(&[Op]) -> R) -> R {
        f(&self.inner.borrow().ops)
    }

    pub fn hash_string(&self, s: &str) -> Hash {
        self.inner.borrow().reviver.hash_string(s)
    }

    pub fn hash_file(&self, path: impl AsRef<Path>) -> std::io::Result<Hash> {
        let path = self.norm(path.as_ref());
        self.inner.borrow_mut().reviver.hash_file(&path)
    }

    /// Purge the trash directory; `block` waits for the purge.
    pub fn delete_trash(&self, block: bool) -> std::io::Result<()> {
        let trash = self.inner.borrow().exec.trash().clone();
        trash.purge(block)
    }

    /// Declare a pre-existing input file available. Idempotent.
    pub fn file_ready(&self, path: impl AsRef<Path>) {
        let path = self.norm(path.as_ref());
        let mut inner = self.inner.borrow_mut();
        inner.ready_roots.insert(path.clone());
        inner.guard.set_file_ready(&path);
    }

    /// A fresh undetermined future tied to this memoizer's fiber queue.
    pub fn fut<T: Clone + 'static>(&self) -> Fut<T> {
        Fut::new(self.fibers.clone())
    }

    /// Enqueue a fiber on the ready queue.
    pub fn spawn_fiber(&self, f: impl FnOnce() -> FiberResult + 'static) {
        self.fibers.push(Box::new(f));
    }

    // ── Operations ────────────────────────────────────────────────────────

    /// Read a file once it is ready.
    pub fn read(&self, file: impl AsRef<Path>) -> Fut<FileBytes> {
        let file = self.norm(file.as_ref());
        let fut = self.fut();
        let kind = Kind::Read(ReadOp {
            file: file.clone(),
            data: None,
        });
        self.push_op(vec![file], vec![], kind, Some(OpKont::Bytes(fut.clone())));
        fut
    }

    /// Write `target` with bytes computed by `producer`. The producer is not
    /// invoked when the operation is revived from the cache.
    pub fn write(
        &self,
        target: impl AsRef<Path>,
        producer: impl FnOnce() -> anyhow::Result<Vec<u8>> + Send + 'static,
    ) -> Fut<()> {
        self.write_with(WriteOpts::default(), target, producer)
    }

    pub fn write_with(
        &self,
        opts: WriteOpts,
        target: impl AsRef<Path>,
        producer: impl FnOnce() -> anyhow::Result<Vec<u8>> + Send + 'static,
    ) -> Fut<()> {
        let target = self.norm(target.as_ref());
        let reads: Vec<PathBuf> = opts.reads.iter().map(|r| self.norm(r)).collect();
        let fut = self.fut();
        let kind = Kind::Write(WriteOp {
            stamp: opts.stamp,
            mode: opts.mode,
            target: target.clone(),
            producer: Some(Box::new(producer)),
        });
        self.push_op(reads, vec![target], kind, Some(OpKont::Unit(fut.clone())));
        fut
    }

    /// Copy `src` to `dst` once `src` is ready.
    pub fn copy(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Fut<()> {
        self.copy_with(CopyOpts::default(), src, dst)
    }

    pub fn copy_with(
        &self,
        opts: CopyOpts,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
    ) -> Fut<()> {
        let src = self.norm(src.as_ref());
        let dst = self.norm(dst.as_ref());
        let fut = self.fut();
        let kind = Kind::Copy(CopyOp {
            src: src.clone(),
            dst: dst.clone(),
            mode: opts.mode,
            linenum: opts.linenum,
        });
        self.push_op(vec![src], vec![dst], kind, Some(OpKont::Unit(fut.clone())));
        fut
    }

    pub fn mkdir(&self, dir: impl AsRef<Path>) -> Fut<()> {
        self.mkdir_mode(dir, 0o755)
    }

    pub fn mkdir_mode(&self, dir: impl AsRef<Path>, mode: u32) -> Fut<()> {
        let dir = self.norm(dir.as_ref());
        let fut = self.fut();
        let kind = Kind::Mkdir(MkdirOp {
            dir: dir.clone(),
            mode,
        });
        self.push_op(vec![], vec![dir], kind, Some(OpKont::Unit(fut.clone())));
        fut
    }

    /// Move `path` to the trash.
    pub fn delete(&self, path: impl AsRef<Path>) -> Fut<()> {
        let path = self.norm(path.as_ref());
        let fut = self.fut();
        let kind = Kind::Delete(DeleteOp { path });
        self.push_op(vec![], vec![], kind, Some(OpKont::Unit(fut.clone())));
        fut
    }

    /// Determined once all `files` are ready.
    pub fn wait_files<I, P>(&self, files: I) -> Fut<()>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let reads: Vec<PathBuf> = files.into_iter().map(|f| self.norm(f.as_ref())).collect();
        let fut = self.fut();
        self.push_op(reads, vec![], Kind::WaitFiles, Some(OpKont::Unit(fut.clone())));
        fut
    }

    /// Surface a user-level message through the operation log.
    pub fn notify(&self, kind: NotifyKind, msg: impl Into<String>) {
        let kind = Kind::Notify(NotifyOp {
            kind,
            msg: msg.into(),
        });
        self.push_op(vec![], vec![], kind, None);
    }

    /// Record a build failure and return the abort sentinel for the current
    /// fiber to propagate.
    pub fn fail(&self, msg: impl Into<String>) -> Abort {
        self.notify(NotifyKind::Fail, msg);
        self.inner.borrow_mut().has_failures = true;
        Abort
    }

    /// Start building a spawn operation for `tool`.
    pub fn spawn<I, S>(&self, tool: &Tool, args: I) -> SpawnBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SpawnBuilder {
            memo: self.clone(),
            tool: tool.clone(),
            args: args.into_iter().map(Into::into).collect(),
            reads: Vec::new(),
            writes: Vec::new(),
            writes_root: None,
            stamp: String::new(),
            env: None,
            cwd: None,
            stdin: None,
            stdout: Sink::Inherit,
            stderr: Sink::Inherit,
            success_exits: vec![0],
            post_exec: None,
        }
    }

    // ── The stir loop ─────────────────────────────────────────────────────

    /// Drive the build. One iteration submits an allowed operation, finishes
    /// a completed one, or runs a ready fiber; with `block` true the loop
    /// waits on the executor instead of returning while work is in flight.
    pub fn stir(&self, block: bool) {
        loop {
            let allowed = self.inner.borrow_mut().guard.allowed();
            if let Some(op) = allowed {
                self.submit_op(op);
                continue;
            }
            let collected = self.inner.borrow_mut().exec.collect(false);
            if let Some(op) = collected {
                self.finish_op(op);
                continue;
            }
            if let Some(fiber) = self.fibers.pop() {
                self.run_fiber(fiber);
                continue;
            }
            if block {
                let collected = self.inner.borrow_mut().exec.collect(true);
                if let Some(op) = collected {
                    self.finish_op(op);
                    continue;
                }
            }
            break;
        }
    }

    /// Nothing waiting, executing, or queued.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.borrow();
        inner.guard.is_idle() && inner.exec.is_idle() && self.fibers.is_empty()
    }

    /// Aggregate outcome: `Failures` beats `Cycle` beats `NeverBecameReady`.
    pub fn status(&self) -> Result<(), MemoError> {
        let inner = self.inner.borrow();
        if inner.has_failures || inner.ops.iter().any(|o| o.failed()) {
            return Err(MemoError::Failures);
        }

        let pending: Vec<&Op> = inner.guard.pending_ops().collect();
        if pending.is_empty() {
            return Ok(());
        }

        let mut writer: HashMap<&Path, OpId> = HashMap::new();
        for op in &pending {
            for w in &op.writes {
                writer.insert(w.as_path(), op.id);
            }
        }

        let mut never: BTreeSet<PathBuf> = BTreeSet::new();
        let mut edges: HashMap<OpId, Vec<OpId>> = HashMap::new();
        for op in &pending {
            let awaits = match inner.guard.pending_awaits(op.id) {
                Some(a) => a,
                None => continue,
            };
            for file in awaits {
                match writer.get(file.as_path()) {
                    Some(producer) => edges.entry(op.id).or_default().push(*producer),
                    None => {
                        if !inner.ready_roots.contains(file) {
                            never.insert(file.clone());
                        }
                    }
                }
            }
        }

        if let Some(cycle) = find_cycle(&edges) {
            return Err(MemoError::Cycle(cycle));
        }
        if !never.is_empty() {
            return Err(MemoError::NeverBecameReady(never.into_iter().collect()));
        }
        Ok(())
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn norm(&self, path: &Path) -> PathBuf {
        let cwd = self.inner.borrow().cwd.clone();
        paths::absolute(path, &cwd)
    }

    fn emit(&self, event: Event<'_>) {
        if let Some(feedback) = &self.feedback {
            feedback(event);
        }
    }

    /// Create an operation record and register its continuation, without
    /// handing it to the guard.
    fn alloc_op(
        &self,
        reads: Vec<PathBuf>,
        writes: Vec<PathBuf>,
        kind: Kind,
        kont: Option<OpKont>,
    ) -> Op {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        if let Some(kont) = kont {
            inner.konts.insert(id, kont);
        }
        Op::new(
            id,
            self.mark.to_string(),
            inner.start.elapsed(),
            reads,
            writes,
            kind,
        )
    }

    fn push_op(
        &self,
        reads: Vec<PathBuf>,
        writes: Vec<PathBuf>,
        kind: Kind,
        kont: Option<OpKont>,
    ) -> OpId {
        let op = self.alloc_op(reads, writes, kind, kont);
        let id = op.id;
        self.inner.borrow_mut().guard.add(op);
        id
    }

    fn submit_op(&self, mut op: Op) {
        if op.status == Status::Aborted {
            return self.finish_op(op);
        }
        if op.cache_eligible() {
            let hashed = self.inner.borrow_mut().reviver.hash_op(&op);
            match hashed {
                Err(missing) => {
                    op.status = Status::Failed(FailureKind::MissingReads(missing));
                    return self.finish_op(op);
                }
                Ok(hash) => {
                    op.hash = hash;
                    let revived = self.inner.borrow_mut().reviver.revive(&mut op);
                    match revived {
                        Ok(true) => return self.finish_op(op),
                        Ok(false) => {}
                        // Never fatal: fall back to execution.
                        Err(e) => warn!(id = op.id, "cache revive failed: {e}"),
                    }
                }
            }
        }
        self.emit(Event::ExecStart(&op));
        self.inner.borrow_mut().exec.schedule(op);
    }

    fn finish_op(&self, mut op: Op) {
        if op.status == Status::Done && !op.revived {
            // Post-exec hook, before the missing-write check and recording:
            // a rooted spawn installs its discovered writes here.
            let hook: Option<PostExec> = match &mut op.kind {
                Kind::Spawn(s) => s.post_exec.take(),
                _ => None,
            };
            if let Some(hook) = hook {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| hook(&mut op)));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        op.status =
                            Status::Failed(FailureKind::Exec(Some(format!("post-exec: {e:#}"))));
                    }
                    Err(payload) => {
                        op.status = Status::Failed(FailureKind::Exec(Some(format!(
                            "post-exec panicked: {}",
                            panic_message(&payload)
                        ))));
                    }
                }
            }
        }
        if op.status == Status::Done && !op.revived {
            let missing: Vec<PathBuf> = op
                .writes
                .iter()
                .filter(|w| !w.exists())
                .cloned()
                .collect();
            if !missing.is_empty() {
                op.status = Status::Failed(FailureKind::MissingWrites(missing));
            }
        }

        match op.status.clone() {
            Status::Done => {
                if op.cache_eligible() && !op.revived {
                    let recorded = self.inner.borrow_mut().reviver.record(&op);
                    if let Err(e) = recorded {
                        // Best-effort: the op still completes.
                        warn!(id = op.id, "cache record failed: {e}");
                        self.notify(
                            NotifyKind::Warn,
                            format!("cache record failed for op {}: {e}", op.id),
                        );
                    }
                }
                {
                    let mut inner = self.inner.borrow_mut();
                    for w in &op.writes {
                        inner.guard.set_file_ready(w);
                    }
                }
                self.emit(Event::OpComplete(&op));
                let kont = self.inner.borrow_mut().konts.remove(&op.id);
                if let Some(kont) = kont {
                    self.continue_op(&mut op, kont);
                }
                debug!(id = op.id, kind = op.kind.name(), revived = op.revived, "op done");
                self.inner.borrow_mut().ops.push(op);
            }
            Status::Aborted => self.discontinue(op, false),
            Status::Failed(_) => self.discontinue(op, true),
            Status::Waiting => {
                debug_assert!(false, "op {} finished while Waiting", op.id);
                self.inner.borrow_mut().ops.push(op);
            }
        }
    }

    fn continue_op(&self, op: &mut Op, kont: OpKont) {
        match kont {
            OpKont::Unit(fut) => fut.set(()),
            OpKont::Bytes(fut) => {
                let data = match &mut op.kind {
                    Kind::Read(r) => r.data.take(),
                    _ => None,
                };
                fut.set(data.unwrap_or_else(|| std::sync::Arc::from(Vec::new().into_boxed_slice())));
            }
            OpKont::Exit(fut) => {
                let exit = match &op.kind {
                    Kind::Spawn(s) => s.exit.unwrap_or(0),
                    _ => 0,
                };
                fut.set(exit);
            }
        }
    }

    /// An op that will not produce its writes: mark them Never, drop the
    /// continuation, surface the record.
    fn discontinue(&self, op: Op, failure: bool) {
        {
            let mut inner = self.inner.borrow_mut();
            if failure {
                inner.has_failures = true;
            }
            for w in &op.writes {
                inner.guard.set_file_never(w);
            }
        }
        if failure {
            if let Status::Failed(fail) = &op.status {
                error!(id = op.id, kind = op.kind.name(), "op failed: {fail:?}");
            }
        }
        self.emit(Event::OpComplete(&op));
        let kont = self.inner.borrow_mut().konts.remove(&op.id);
        if let Some(kont) = kont {
            match kont {
                OpKont::Unit(fut) => fut.set_never(),
                OpKont::Bytes(fut) => fut.set_never(),
                OpKont::Exit(fut) => fut.set_never(),
            }
        }
        self.inner.borrow_mut().ops.push(op);
    }

    /// Fibers are sandboxed: `Err(Abort)` is an already-reported failure,
    /// a panic becomes a Notify(Fail) op and the build continues.
    fn run_fiber(&self, fiber: FiberFn) {
        match std::panic::catch_unwind(AssertUnwindSafe(fiber)) {
            Ok(Ok(())) => {}
            Ok(Err(Abort)) => {}
            Err(payload) => {
                let msg = panic_message(&payload);
                self.inner.borrow_mut().has_failures = true;
                self.notify(
                    NotifyKind::Fail,
                    format!("unexpected failure in continuation: {msg}"),
                );
            }
        }
    }
}

/// A spawn operation under construction; `submit` registers it.
pub struct SpawnBuilder {
    memo: Memo,
    tool: Tool,
    args: Vec<String>,
    reads: Vec<PathBuf>,
    writes: Vec<PathBuf>,
    writes_root: Option<PathBuf>,
    stamp: String,
    env: Option<BTreeMap<String, String>>,
    cwd: Option<PathBuf>,
    stdin: Option<PathBuf>,
    stdout: Sink,
    stderr: Sink,
    success_exits: Vec<i32>,
    post_exec: Option<PostExec>,
}

impl SpawnBuilder {
    pub fn reads<I, P>(mut self, reads: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.reads = reads.into_iter().map(|p| p.as_ref().to_path_buf()).collect();
        self
    }

    pub fn writes<I, P>(mut self, writes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.writes = writes
            .into_iter()
            .map(|p| p.as_ref().to_path_buf())
            .collect();
        self
    }

    /// Discover writes under `root` after execution instead of declaring
    /// them up front.
    pub fn writes_root(mut self, root: impl AsRef<Path>) -> Self {
        self.writes_root = Some(root.as_ref().to_path_buf());
        self
    }

    /// Extra bytes folded into the operation hash.
    pub fn stamp(mut self, stamp: impl Into<String>) -> Self {
        self.stamp = stamp.into();
        self
    }

    /// Replace the captured environment for this spawn.
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn cwd(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_path_buf());
        self
    }

    /// Feed stdin from a file; it is added to the operation's reads.
    pub fn stdin(mut self, file: impl AsRef<Path>) -> Self {
        self.stdin = Some(file.as_ref().to_path_buf());
        self
    }

    pub fn stdout(mut self, sink: Sink) -> Self {
        self.stdout = sink;
        self
    }

    pub fn stderr(mut self, sink: Sink) -> Self {
        self.stderr = sink;
        self
    }

    /// Exit codes counted as success; empty accepts any exit.
    pub fn success_exits<I: IntoIterator<Item = i32>>(mut self, exits: I) -> Self {
        self.success_exits = exits.into_iter().collect();
        self
    }

    /// Hook run on the driver after execution, before the missing-write
    /// check and cache recording.
    pub fn post_exec(
        mut self,
        hook: impl FnOnce(&mut Op) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        self.post_exec = Some(Box::new(hook));
        self
    }

    /// Register the spawn. The future carries the child's exit code; it is
    /// only determined when the exit lands in the success set.
    pub fn submit(self) -> Fut<i32> {
        let memo = self.memo.clone();
        let fut = memo.fut();

        let env = self
            .env
            .unwrap_or_else(|| memo.inner.borrow().env.clone());
        let path_var = env.get("PATH").cloned().or_else(|| {
            memo.inner.borrow().env.get("PATH").cloned()
        });

        let resolved = find_tool(&self.tool.name, path_var.as_deref());
        let tool_path = match resolved {
            Some(path) => path,
            None => {
                let reason = "not found in PATH".to_string();
                memo.emit(Event::MissTool {
                    tool: self.tool.name.clone(),
                    reason: reason.clone(),
                });
                // Surface the miss through the normal finish protocol,
                // bypassing the guard: the op is already doomed.
                let kind = Kind::Spawn(SpawnOp {
                    tool: self.tool.name.clone(),
                    args: self.args,
                    env: Vec::new(),
                    stamped_env: BTreeMap::new(),
                    cwd: memo.cwd(),
                    stamp: self.stamp,
                    stdin: None,
                    stdout: self.stdout,
                    stderr: self.stderr,
                    success_exits: self.success_exits,
                    writes_root: None,
                    post_exec: None,
                    response_file: self.tool.response_file,
                    exit: None,
                });
                let mut op = memo.alloc_op(vec![], vec![], kind, Some(OpKont::Exit(fut.clone())));
                op.status = Status::Failed(FailureKind::Exec(Some(format!(
                    "{}: {reason}",
                    self.tool.name.display()
                ))));
                memo.finish_op(op);
                return fut;
            }
        };

        let mut reads: Vec<PathBuf> = self.reads.iter().map(|r| memo.norm(r)).collect();
        let stdin = self.stdin.map(|p| memo.norm(&p));
        if let Some(stdin) = &stdin {
            reads.push(stdin.clone());
        }
        let writes: Vec<PathBuf> = self.writes.iter().map(|w| memo.norm(w)).collect();
        let writes_root = self.writes_root.map(|r| memo.norm(&r));
        let cwd = match self.cwd {
            Some(cwd) => memo.norm(&cwd),
            None => memo.cwd(),
        };

        let mut success_exits = self.success_exits;
        success_exits.sort_unstable();
        success_exits.dedup();

        let spawn_env = self.tool.spawn_env(&env);

        // A rooted spawn with no declared writes discovers them by walking
        // the root once the child exits.
        let mut post_exec = self.post_exec;
        if post_exec.is_none() && writes.is_empty() {
            if let Some(root) = &writes_root {
                let root = root.clone();
                post_exec = Some(Box::new(move |op: &mut Op| {
                    let mut found = Vec::new();
                    for entry in walkdir::WalkDir::new(&root) {
                        let entry = entry?;
                        if entry.file_type().is_file() {
                            found.push(entry.into_path());
                        }
                    }
                    op.set_writes(found);
                    Ok(())
                }) as PostExec);
            }
        }

        let kind = Kind::Spawn(SpawnOp {
            tool: tool_path,
            args: self.args,
            env: spawn_env.env,
            stamped_env: spawn_env.stamped,
            cwd,
            stamp: self.stamp,
            stdin,
            stdout: self.stdout,
            stderr: self.stderr,
            success_exits,
            writes_root,
            post_exec,
            response_file: self.tool.response_file,
            exit: None,
        });
        memo.push_op(reads, writes, kind, Some(OpKont::Exit(fut.clone())));
        fut
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Find a cycle in the pending-op dependency graph, if any.
fn find_cycle(edges: &HashMap<OpId, Vec<OpId>>) -> Option<Vec<OpId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }
    fn dfs(
        node: OpId,
        edges: &HashMap<OpId, Vec<OpId>>,
        colors: &mut HashMap<OpId, Color>,
        path: &mut Vec<OpId>,
    ) -> Option<Vec<OpId>> {
        colors.insert(node, Color::Gray);
        path.push(node);
        for next in edges.get(&node).into_iter().flatten() {
            match colors.get(next).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    let start = path.iter().position(|id| id == next).unwrap_or(0);
                    return Some(path[start..].to_vec());
                }
                Color::White => {
                    if let Some(cycle) = dfs(*next, edges, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }
        path.pop();
        colors.insert(node, Color::Black);
        None
    }

    let mut colors = HashMap::new();
    let mut nodes: Vec<OpId> = edges.keys().copied().collect();
    nodes.sort_unstable();
    for node in nodes {
        if colors.get(&node).copied().unwrap_or(Color::White) == Color::White {
            let mut path = Vec::new();
            if let Some(cycle) = dfs(node, edges, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}
