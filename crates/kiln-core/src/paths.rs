//! Path normalization shared by the guard, reviver, and cache.
//!
//! Operation reads and writes are compared as plain keys, so every path that
//! enters the engine is absolutized against a fixed cwd and lexically
//! simplified. `canonicalize` is not usable here: declared writes do not
//! exist yet when the operation is created.

use std::path::{Component, Path, PathBuf};

/// Absolutize `path` against `cwd` and squash `.` / `..` components.
///
/// Purely lexical: `..` pops the previous component without consulting the
/// filesystem, which keeps keys stable for files that do not exist yet.
pub fn absolute(path: &Path, cwd: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };

    let mut out = PathBuf::new();
    for comp in joined.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                // Popping the root is a no-op: /..  is  /
                if !out.pop() && !out.has_root() {
                    out.push(comp.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Normalize a path against the process cwd.
pub fn absolute_cwd(path: &Path) -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    absolute(path, &cwd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_are_anchored() {
        let cwd = Path::new("/work/build");
        assert_eq!(
            absolute(Path::new("src/main.c"), cwd),
            PathBuf::from("/work/build/src/main.c")
        );
    }

    #[test]
    fn dot_components_are_squashed() {
        let cwd = Path::new("/work");
        assert_eq!(
            absolute(Path::new("./a/./b"), cwd),
            PathBuf::from("/work/a/b")
        );
        assert_eq!(
            absolute(Path::new("a/../b"), cwd),
            PathBuf::from("/work/b")
        );
    }

    #[test]
    fn absolute_input_ignores_cwd() {
        let cwd = Path::new("/elsewhere");
        assert_eq!(
            absolute(Path::new("/opt/tool"), cwd),
            PathBuf::from("/opt/tool")
        );
    }

    #[test]
    fn parent_of_root_stays_at_root() {
        let cwd = Path::new("/");
        assert_eq!(absolute(Path::new("../x"), cwd), PathBuf::from("/x"));
    }
}
