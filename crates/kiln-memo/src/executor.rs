//! Bounded-parallel operation execution.
//!
//! The executor owns a tokio runtime and a jobs semaphore. `schedule` hands
//! an operation to a runtime task and returns immediately; the task waits
//! for a permit, performs the work (child process, filesystem op, notify
//! log), and sends the operation back over a channel that `collect` drains
//! on the driver thread. Nothing here touches memoizer state.

use crate::op::{Kind, FailureKind, NotifyKind, Op, Sink, SpawnOp, Status};
use kiln_cache::Trash;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use anyhow::Context;

/// Command lines longer than this are moved into a response file when the
/// tool declares one. Conservative: Windows caps the line at 32767 chars.
const RESPONSE_FILE_LIMIT: usize = 32 * 1024;

pub struct Executor {
    rt: tokio::runtime::Runtime,
    sem: Arc<Semaphore>,
    jobs: usize,
    tx: mpsc::Sender<Op>,
    rx: mpsc::Receiver<Op>,
    in_flight: usize,
    trash: Trash,
    tmp_dir: PathBuf,
}

impl Executor {
    /// `jobs = 0` means available parallelism.
    pub fn new(jobs: usize, trash: Trash, tmp_dir: PathBuf) -> std::io::Result<Executor> {
        let jobs = if jobs == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        } else {
            jobs
        };
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(jobs.clamp(1, 8))
            .enable_all()
            .build()?;
        let (tx, rx) = mpsc::channel();
        Ok(Executor {
            rt,
            sem: Arc::new(Semaphore::new(jobs)),
            jobs,
            tx,
            rx,
            in_flight: 0,
            trash,
            tmp_dir,
        })
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    pub fn trash(&self) -> &Trash {
        &self.trash
    }

    /// Number of operations scheduled and not yet collected.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight == 0
    }

    /// Enqueue an operation for execution. Returns immediately; at most
    /// `jobs` operations make progress at once.
    pub fn schedule(&mut self, mut op: Op) {
        self.in_flight += 1;
        let sem = Arc::clone(&self.sem);
        let tx = self.tx.clone();
        let trash = self.trash.clone();
        let tmp_dir = self.tmp_dir.clone();
        self.rt.spawn(async move {
            let _permit = sem.acquire_owned().await.expect("jobs semaphore closed");
            let start = Instant::now();
            exec_op(&mut op, &trash, &tmp_dir).await;
            op.duration = start.elapsed();
            // The receiver only goes away when the whole executor does.
            let _ = tx.send(op);
        });
    }

    /// Pop one completed operation. With `block` true, waits while anything
    /// is in flight; otherwise returns `None` when nothing is ready.
    pub fn collect(&mut self, block: bool) -> Option<Op> {
        if self.in_flight == 0 {
            return None;
        }
        let op = if block {
            self.rx.recv().ok()
        } else {
            self.rx.try_recv().ok()
        };
        if op.is_some() {
            self.in_flight -= 1;
        }
        op
    }
}

async fn exec_op(op: &mut Op, trash: &Trash, tmp_dir: &Path) {
    let result = match &mut op.kind {
        Kind::Read(r) => match tokio::fs::read(&r.file).await {
            Ok(bytes) => {
                r.data = Some(Arc::from(bytes.into_boxed_slice()));
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("reading {}: {e}", r.file.display())),
        },
        Kind::Write(w) => exec_write(w).await,
        Kind::Copy(c) => exec_copy(c).await,
        Kind::Mkdir(m) => tokio::fs::create_dir_all(&m.dir)
            .await
            .with_context(|| format!("creating {}", m.dir.display()))
            .and_then(|()| set_mode(&m.dir, m.mode)),
        Kind::Delete(d) => trash
            .trash(&d.path)
            .with_context(|| format!("deleting {}", d.path.display())),
        Kind::WaitFiles => Ok(()),
        Kind::Notify(n) => {
            match n.kind {
                NotifyKind::Info => info!(target: "kiln::notify", "{}", n.msg),
                NotifyKind::Warn => warn!(target: "kiln::notify", "{}", n.msg),
                NotifyKind::Fail => error!(target: "kiln::notify", "{}", n.msg),
            }
            Ok(())
        }
        Kind::Spawn(s) => exec_spawn(s, tmp_dir).await,
    };
    op.status = match result {
        Ok(()) => Status::Done,
        Err(e) => Status::Failed(FailureKind::Exec(Some(format!("{e:#}")))),
    };
}

async fn exec_write(w: &mut crate::op::WriteOp) -> anyhow::Result<()> {
    let producer = w
        .producer
        .take()
        .ok_or_else(|| anyhow::anyhow!("write producer already consumed"))?;
    // Producers are user code: a panic must not take the executor task (and
    // the collect channel accounting) down with it.
    let bytes = std::panic::catch_unwind(std::panic::AssertUnwindSafe(producer))
        .unwrap_or_else(|_| Err(anyhow::anyhow!("write producer panicked")))
        .with_context(|| format!("producing {}", w.target.display()))?;
    tokio::fs::write(&w.target, bytes)
        .await
        .with_context(|| format!("writing {}", w.target.display()))?;
    set_mode(&w.target, w.mode)
}

async fn exec_copy(c: &crate::op::CopyOp) -> anyhow::Result<()> {
    match c.linenum {
        None => {
            tokio::fs::copy(&c.src, &c.dst)
                .await
                .with_context(|| format!("copying {} to {}", c.src.display(), c.dst.display()))?;
        }
        Some(line) => {
            let data = tokio::fs::read(&c.src)
                .await
                .with_context(|| format!("reading {}", c.src.display()))?;
            let mut out = format!("#line {} \"{}\"\n", line, c.src.display()).into_bytes();
            out.extend_from_slice(&data);
            tokio::fs::write(&c.dst, out)
                .await
                .with_context(|| format!("writing {}", c.dst.display()))?;
        }
    }
    set_mode(&c.dst, c.mode)
}

async fn exec_spawn(s: &mut SpawnOp, tmp_dir: &Path) -> anyhow::Result<()> {
    let mut args = s.args.clone();
    let mut response_file = None;
    if let Some(rf) = s.response_file {
        let line_len: usize = args.iter().map(|a| a.len() + 1).sum();
        if line_len > RESPONSE_FILE_LIMIT {
            let file = tmp_dir.join(format!("rsp-{}", uuid::Uuid::new_v4()));
            tokio::fs::create_dir_all(tmp_dir)
                .await
                .with_context(|| format!("creating {}", tmp_dir.display()))?;
            tokio::fs::write(&file, rf.content(&args))
                .await
                .with_context(|| format!("writing response file {}", file.display()))?;
            args = rf.cli(&file);
            response_file = Some(file);
        }
    }

    let mut cmd = tokio::process::Command::new(&s.tool);
    cmd.args(&args)
        .env_clear()
        .envs(s.env.iter().cloned())
        .current_dir(&s.cwd)
        .kill_on_drop(true);

    cmd.stdin(match &s.stdin {
        Some(p) => {
            let f = std::fs::File::open(p)
                .with_context(|| format!("opening stdin {}", p.display()))?;
            Stdio::from(f)
        }
        None => Stdio::null(),
    });
    cmd.stdout(sink_stdio(&s.stdout)?);
    cmd.stderr(sink_stdio(&s.stderr)?);

    let status = cmd
        .status()
        .await
        .with_context(|| format!("spawning {}", s.tool.display()))?;

    if let Some(file) = response_file {
        let _ = tokio::fs::remove_file(file).await;
    }

    match status.code() {
        None => anyhow::bail!("{}: killed by signal", s.tool.display()),
        Some(code) => {
            s.exit = Some(code);
            // An empty success set accepts any exit.
            if s.success_exits.is_empty() || s.success_exits.contains(&code) {
                Ok(())
            } else {
                anyhow::bail!("{} exited with {code}", s.tool.display())
            }
        }
    }
}

fn sink_stdio(sink: &Sink) -> anyhow::Result<Stdio> {
    Ok(match sink {
        Sink::Inherit => Stdio::inherit(),
        Sink::Null => Stdio::null(),
        Sink::File(p) => {
            let f = std::fs::File::create(p)
                .with_context(|| format!("creating {}", p.display()))?;
            Stdio::from(f)
        }
    })
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("setting mode on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{CopyOp, DeleteOp, MkdirOp, ReadOp, WriteOp};
    use std::time::Duration;

    fn executor(tmp: &Path) -> Executor {
        Executor::new(2, Trash::new(tmp.join("trash")), tmp.join("tmp")).unwrap()
    }

    fn op(id: u64, writes: Vec<PathBuf>, kind: Kind) -> Op {
        Op::new(id, "test".into(), Duration::ZERO, vec![], writes, kind)
    }

    fn run_one(exec: &mut Executor, op: Op) -> Op {
        exec.schedule(op);
        exec.collect(true).expect("op completes")
    }

    #[test]
    fn read_captures_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut exec = executor(tmp.path());
        let file = tmp.path().join("in.txt");
        std::fs::write(&file, b"payload").unwrap();

        let done = run_one(
            &mut exec,
            op(1, vec![], Kind::Read(ReadOp { file, data: None })),
        );
        assert_eq!(done.status, Status::Done);
        match &done.kind {
            Kind::Read(r) => assert_eq!(&r.data.as_ref().unwrap()[..], b"payload"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn read_of_missing_file_fails_exec() {
        let tmp = tempfile::tempdir().unwrap();
        let mut exec = executor(tmp.path());
        let done = run_one(
            &mut exec,
            op(
                1,
                vec![],
                Kind::Read(ReadOp {
                    file: tmp.path().join("absent"),
                    data: None,
                }),
            ),
        );
        assert!(matches!(
            done.status,
            Status::Failed(FailureKind::Exec(Some(_)))
        ));
    }

    #[test]
    fn write_runs_the_producer() {
        let tmp = tempfile::tempdir().unwrap();
        let mut exec = executor(tmp.path());
        let target = tmp.path().join("out.txt");

        let done = run_one(
            &mut exec,
            op(
                1,
                vec![target.clone()],
                Kind::Write(WriteOp {
                    stamp: String::new(),
                    mode: 0o644,
                    target: target.clone(),
                    producer: Some(Box::new(|| Ok(b"produced".to_vec()))),
                }),
            ),
        );
        assert_eq!(done.status, Status::Done);
        assert_eq!(std::fs::read(&target).unwrap(), b"produced");
    }

    #[test]
    fn copy_with_linenum_prefixes_a_directive() {
        let tmp = tempfile::tempdir().unwrap();
        let mut exec = executor(tmp.path());
        let src = tmp.path().join("src.c");
        let dst = tmp.path().join("dst.c");
        std::fs::write(&src, b"int x;\n").unwrap();

        let done = run_one(
            &mut exec,
            op(
                1,
                vec![dst.clone()],
                Kind::Copy(CopyOp {
                    src: src.clone(),
                    dst: dst.clone(),
                    mode: 0o644,
                    linenum: Some(12),
                }),
            ),
        );
        assert_eq!(done.status, Status::Done);
        let out = String::from_utf8(std::fs::read(&dst).unwrap()).unwrap();
        assert_eq!(out, format!("#line 12 \"{}\"\nint x;\n", src.display()));
    }

    #[test]
    fn mkdir_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let mut exec = executor(tmp.path());
        let dir = tmp.path().join("a/b/c");

        let done = run_one(
            &mut exec,
            op(
                1,
                vec![dir.clone()],
                Kind::Mkdir(MkdirOp {
                    dir: dir.clone(),
                    mode: 0o755,
                }),
            ),
        );
        assert_eq!(done.status, Status::Done);
        assert!(dir.is_dir());

        let done = run_one(
            &mut exec,
            op(2, vec![], Kind::Delete(DeleteOp { path: dir.clone() })),
        );
        assert_eq!(done.status, Status::Done);
        assert!(!dir.exists());
    }

    #[test]
    fn collect_nonblocking_on_empty_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let mut exec = executor(tmp.path());
        assert!(exec.collect(false).is_none());
        assert!(exec.collect(true).is_none());
        assert!(exec.is_idle());
    }

    #[cfg(unix)]
    #[test]
    fn spawn_captures_exit_and_checks_success_set() {
        let tmp = tempfile::tempdir().unwrap();
        let mut exec = executor(tmp.path());

        let spawn = |exits: Vec<i32>| {
            Kind::Spawn(SpawnOp {
                tool: "/bin/sh".into(),
                args: vec!["-c".into(), "exit 3".into()],
                env: vec![],
                stamped_env: Default::default(),
                cwd: tmp.path().to_path_buf(),
                stamp: String::new(),
                stdin: None,
                stdout: Sink::Null,
                stderr: Sink::Null,
                success_exits: exits,
                writes_root: None,
                post_exec: None,
                response_file: None,
                exit: None,
            })
        };

        let ok = run_one(&mut exec, op(1, vec![], spawn(vec![3])));
        assert_eq!(ok.status, Status::Done);
        match &ok.kind {
            Kind::Spawn(s) => assert_eq!(s.exit, Some(3)),
            _ => unreachable!(),
        }

        let bad = run_one(&mut exec, op(2, vec![], spawn(vec![0])));
        assert!(matches!(bad.status, Status::Failed(FailureKind::Exec(_))));
        match &bad.kind {
            Kind::Spawn(s) => assert_eq!(s.exit, Some(3), "exit captured on failure too"),
            _ => unreachable!(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn spawn_writes_stdout_to_file_sink() {
        let tmp = tempfile::tempdir().unwrap();
        let mut exec = executor(tmp.path());
        let out = tmp.path().join("echoed.txt");

        let done = run_one(
            &mut exec,
            op(
                1,
                vec![out.clone()],
                Kind::Spawn(SpawnOp {
                    tool: "/bin/sh".into(),
                    args: vec!["-c".into(), "echo hello".into()],
                    env: vec![],
                    stamped_env: Default::default(),
                    cwd: tmp.path().to_path_buf(),
                    stamp: String::new(),
                    stdin: None,
                    stdout: Sink::File(out.clone()),
                    stderr: Sink::Null,
                    success_exits: vec![0],
                    writes_root: None,
                    post_exec: None,
                    response_file: None,
                    exit: None,
                }),
            ),
        );
        assert_eq!(done.status, Status::Done);
        assert_eq!(std::fs::read(&out).unwrap(), b"hello\n");
    }
}
