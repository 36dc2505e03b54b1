//! Tool declarations and spawn environments.
//!
//! A tool names the variables of its environment that are relevant to its
//! output (`vars`, stamped into operation hashes) and the ones that are
//! forwarded at exec time but ignored for hashing (`unstamped_vars`,
//! defaulting to the usual temp-dir triple). PATH belongs to neither set:
//! the tool is identified by the hash of its file content, so its location
//! must not perturb cache keys.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variables forwarded but never stamped, by default.
pub const DEFAULT_UNSTAMPED_VARS: &[&str] = &["TMPDIR", "TEMP", "TMP"];

/// How to serialize an overlong command line into a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFile {
    /// NUL-separated arguments; the tool is invoked as `tool -args0 <file>`.
    Args0,
}

impl ResponseFile {
    /// The file content for `args`.
    pub fn content(&self, args: &[String]) -> Vec<u8> {
        match self {
            ResponseFile::Args0 => {
                let mut out = Vec::new();
                for arg in args {
                    out.extend_from_slice(arg.as_bytes());
                    out.push(0);
                }
                out
            }
        }
    }

    /// The replacement command line referencing the response file.
    pub fn cli(&self, file: &Path) -> Vec<String> {
        match self {
            ResponseFile::Args0 => {
                vec!["-args0".to_string(), file.display().to_string()]
            }
        }
    }
}

/// A command line: a tool and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub tool: PathBuf,
    pub args: Vec<String>,
}

impl Cmd {
    pub fn new(tool: impl Into<PathBuf>) -> Cmd {
        Cmd {
            tool: tool.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Cmd {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Cmd
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// A tool declaration.
#[derive(Debug, Clone)]
pub struct Tool {
    /// A bare name looked up in PATH, or an explicit path.
    pub name: PathBuf,
    /// Environment variables that affect the tool's output.
    pub vars: Vec<String>,
    /// Forwarded at exec time, excluded from hashing.
    pub unstamped_vars: Vec<String>,
    pub response_file: Option<ResponseFile>,
}

impl Tool {
    pub fn new(name: impl Into<PathBuf>) -> Tool {
        Tool {
            name: name.into(),
            vars: Vec::new(),
            unstamped_vars: DEFAULT_UNSTAMPED_VARS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            response_file: None,
        }
    }

    pub fn vars<I, S>(mut self, vars: I) -> Tool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vars = vars.into_iter().map(Into::into).collect();
        self
    }

    pub fn unstamped_vars<I, S>(mut self, vars: I) -> Tool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unstamped_vars = vars.into_iter().map(Into::into).collect();
        self
    }

    pub fn response_file(mut self, rf: ResponseFile) -> Tool {
        self.response_file = Some(rf);
        self
    }

    /// Split `env` into the exec-time environment and the stamped subset.
    pub fn spawn_env(&self, env: &BTreeMap<String, String>) -> SpawnEnv {
        let mut stamped = BTreeMap::new();
        let mut exec_env = Vec::new();
        for var in &self.vars {
            if let Some(value) = env.get(var) {
                stamped.insert(var.clone(), value.clone());
                exec_env.push((var.clone(), value.clone()));
            }
        }
        for var in &self.unstamped_vars {
            if let Some(value) = env.get(var) {
                exec_env.push((var.clone(), value.clone()));
            }
        }
        SpawnEnv {
            env: exec_env,
            stamped,
        }
    }
}

/// The environment a spawn runs with, and the part of it that is hashed.
#[derive(Debug, Clone)]
pub struct SpawnEnv {
    pub env: Vec<(String, String)>,
    pub stamped: BTreeMap<String, String>,
}

/// Look up a tool. A name containing a separator is checked directly;
/// otherwise each directory of `path` (the PATH value) is searched.
pub fn find_tool(name: &Path, path: Option<&str>) -> Option<PathBuf> {
    if name.components().count() > 1 {
        return is_executable(name).then(|| name.to_path_buf());
    }
    let path = path?;
    for dir in std::env::split_paths(path) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn stamped_env_is_the_declared_intersection() {
        let tool = Tool::new("cc").vars(["LANG", "CC_OPTS"]);
        let spawn_env = tool.spawn_env(&env(&[
            ("LANG", "C"),
            ("HOME", "/home/u"),
            ("TMPDIR", "/tmp"),
        ]));

        assert_eq!(spawn_env.stamped.len(), 1);
        assert_eq!(spawn_env.stamped.get("LANG").map(String::as_str), Some("C"));
        // TMPDIR is forwarded but unstamped; HOME is dropped entirely.
        assert!(spawn_env.env.iter().any(|(k, _)| k == "TMPDIR"));
        assert!(!spawn_env.env.iter().any(|(k, _)| k == "HOME"));
    }

    #[test]
    fn path_is_not_stamped_by_default() {
        let tool = Tool::new("cc");
        let spawn_env = tool.spawn_env(&env(&[("PATH", "/usr/bin")]));
        assert!(spawn_env.stamped.is_empty());
        assert!(spawn_env.env.is_empty());
    }

    #[test]
    fn args0_content_is_nul_separated() {
        let rf = ResponseFile::Args0;
        let content = rf.content(&["-o".into(), "out.o".into()]);
        assert_eq!(content, b"-o\0out.o\0");
        assert_eq!(
            rf.cli(Path::new("/tmp/rsp")),
            vec!["-args0".to_string(), "/tmp/rsp".to_string()]
        );
    }

    #[cfg(unix)]
    #[test]
    fn find_tool_searches_path_dirs() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let bin = tmp.path().join("mytool");
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let path = format!("/nonexistent:{}", tmp.path().display());
        assert_eq!(
            find_tool(Path::new("mytool"), Some(&path)),
            Some(bin.clone())
        );
        assert_eq!(find_tool(Path::new("missing"), Some(&path)), None);
        // Explicit paths bypass PATH.
        assert_eq!(find_tool(&bin, None), Some(bin));
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_files_are_not_tools() {
        let tmp = tempfile::tempdir().unwrap();
        let f = tmp.path().join("data.txt");
        std::fs::write(&f, b"not a tool").unwrap();
        let path = tmp.path().display().to_string();
        assert_eq!(find_tool(Path::new("data.txt"), Some(&path)), None);
    }
}
