//! Path splitting, component validation and directory-tree walking.
//!
//! Pure helpers operating over `&Imfs` so they can be unit tested without a
//! live fd table (spec §4.1).

use smallvec::SmallVec;

use crate::error::{Errno, Result};
use crate::fs::Imfs;
use crate::node::{NodeIndex, MAX_NODE_NAME};

/// Sentinel `dir_fd` meaning "resolve relative to the filesystem root"
/// (there is no per-cage cwd in this core).
pub const AT_FDCWD: i32 = libc::AT_FDCWD;

/// Most paths this core resolves are a handful of components deep; inline
/// storage for up to 8 avoids a heap allocation for the common case.
pub type Components<'a> = SmallVec<[&'a str; 8]>;

/// Split a path into its `/`-separated components, dropping empty segments
/// produced by repeated slashes. Returns whether the path was absolute.
pub fn split(path: &str) -> (bool, Components<'_>) {
    let absolute = path.starts_with('/');
    let components = path.split('/').filter(|c| !c.is_empty()).collect();
    (absolute, components)
}

fn check_component_len(component: &str) -> Result<()> {
    if component.len() > MAX_NODE_NAME {
        Err(Errno::ENAMETOOLONG)
    } else {
        Ok(())
    }
}

/// Resolve `path` to a node index, starting from `dir_fd` (or the root for
/// `AT_FDCWD` or an absolute path).
///
/// A symlink component is followed once to its target node; the core does
/// not detect cycles (spec non-goal — cyclic symlinks must never be
/// constructed by `link`/`symlink`/`mkdir`).
pub fn resolve(imfs: &Imfs, cage: u64, dir_fd: i32, path: &str) -> Result<NodeIndex> {
    let (absolute, components) = split(path);

    let mut current = if absolute || dir_fd == AT_FDCWD {
        imfs.root_index()
    } else {
        imfs.fd_node(cage, dir_fd)?
    };

    for component in components {
        check_component_len(component)?;
        current = step(imfs, current, component)?;
    }

    Ok(current)
}

/// Resolve the parent directory of the final path component, returning
/// `(parent_index, last_component)` for creation calls (`openat(O_CREAT)`,
/// `mkdir`, `link`, `symlink`).
pub fn resolve_parent<'a>(
    imfs: &Imfs,
    cage: u64,
    dir_fd: i32,
    path: &'a str,
) -> Result<(NodeIndex, &'a str)> {
    let (absolute, components) = split(path);
    let (last, parents) = components.split_last().ok_or(Errno::ENOENT)?;

    check_component_len(last)?;

    let mut current = if absolute || dir_fd == AT_FDCWD {
        imfs.root_index()
    } else {
        imfs.fd_node(cage, dir_fd)?
    };

    for component in parents {
        check_component_len(component)?;
        current = step(imfs, current, component)?;
    }

    if !imfs.is_directory(current) {
        return Err(Errno::ENOTDIR);
    }

    Ok((current, last))
}

/// Advance from `dir` through a single named child, following one symlink
/// hop if the child resolves to one.
fn step(imfs: &Imfs, dir: NodeIndex, component: &str) -> Result<NodeIndex> {
    if !imfs.is_directory(dir) {
        return Err(Errno::ENOTDIR);
    }

    let child = imfs.lookup_child(dir, component).ok_or(Errno::ENOENT)?;
    Ok(imfs.symlink_target(child).unwrap_or(child))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_absolute_path() {
        let (abs, parts) = split("/a/b//c/");
        assert!(abs);
        assert_eq!(parts.as_slice(), ["a", "b", "c"]);
    }

    #[test]
    fn splits_relative_path() {
        let (abs, parts) = split("a/b");
        assert!(!abs);
        assert_eq!(parts.as_slice(), ["a", "b"]);
    }

    #[test]
    fn rejects_overlong_component() {
        let long = "x".repeat(MAX_NODE_NAME + 1);
        assert!(check_component_len(&long).is_err());
        assert!(check_component_len("ok").is_ok());
    }
}
