//! Bulk host <-> IMFS transfer at cage startup/shutdown (spec §4.8).
//!
//! The original loads a fixed on-disk image into `g_state` once at process
//! start and optionally writes it back out at exit, controlled by a
//! `PRELOADS`-style environment variable. This keeps that shape: preload
//! walks a host directory tree into the node pool before a cage runs, and
//! dump walks it back out afterward. Both are host-side (not guest-wasm)
//! operations and so use plain `std::fs`.

use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{Errno, Result};
use crate::fs::{Imfs, O_CREAT, O_RDONLY, O_WRONLY};

/// Parse a `PRELOADS` value: a newline-separated list of host paths (spec
/// §6), each to be loaded into the IMFS under the identical path. Blank
/// lines are skipped so a trailing newline doesn't produce an empty entry.
pub fn parse_preloads(value: &str) -> Vec<PathBuf> {
    value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Read `PRELOADS` from the environment and parse it; an unset or empty
/// variable yields no entries.
pub fn preloads_from_env() -> Vec<PathBuf> {
    match std::env::var("PRELOADS") {
        Ok(value) => parse_preloads(&value),
        Err(_) => Vec::new(),
    }
}

/// Load every host path in `host_paths` into the IMFS, each mounted at the
/// identical path it has on the host (spec §6), as `preloads_from_env`
/// yields them.
pub fn load_all(imfs: &Imfs, cage: u64, host_paths: &[PathBuf]) -> Result<()> {
    for host_path in host_paths {
        let mount_path = host_path.to_str().ok_or(Errno::EINVAL)?;
        load(imfs, cage, host_path, mount_path)?;
    }
    Ok(())
}

/// Recursively copy `host_dir` into the IMFS under `mount_path`, creating
/// intermediate directories as needed.
pub fn load(imfs: &Imfs, cage: u64, host_dir: &Path, mount_path: &str) -> Result<()> {
    imfs.mkdir(cage, mount_path, 0o755).ok(); // already exists is fine
    load_dir(imfs, cage, host_dir, mount_path)
}

fn load_dir(imfs: &Imfs, cage: u64, host_dir: &Path, mount_path: &str) -> Result<()> {
    let entries = std::fs::read_dir(host_dir).map_err(|_| Errno::ENOENT)?;
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            warn!("skipping non-UTF-8 host entry under {}", host_dir.display());
            continue;
        };
        let child_mount = format!("{}/{}", mount_path.trim_end_matches('/'), name);

        if file_type.is_dir() {
            imfs.mkdir(cage, &child_mount, 0o755).ok();
            load_dir(imfs, cage, &entry.path(), &child_mount)?;
        } else if file_type.is_file() {
            let data = std::fs::read(entry.path()).map_err(|_| Errno::EACCES)?;
            let fd = imfs.open(cage, &child_mount, O_CREAT | O_WRONLY, 0o644)?;
            imfs.write(cage, fd, &data)?;
            imfs.close(cage, fd)?;
            debug!("preloaded {} bytes into {child_mount}", data.len());
        }
    }
    Ok(())
}

/// Recursively copy `mount_path` out of the IMFS onto the host filesystem
/// under `host_dir`, the inverse of [`load`].
pub fn dump(imfs: &Imfs, cage: u64, mount_path: &str, host_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(host_dir).map_err(|_| Errno::EACCES)?;
    let mut stream = imfs.opendir(cage, mount_path)?;
    while let Some((name, _ino)) = imfs.readdir(&mut stream) {
        if name == "." || name == ".." {
            continue;
        }
        let child_mount = format!("{}/{}", mount_path.trim_end_matches('/'), name);
        let host_child = host_dir.join(&name);
        let st = imfs.lstat(cage, &child_mount)?;

        if st.mode & libc::S_IFMT == libc::S_IFDIR {
            dump(imfs, cage, &child_mount, &host_child)?;
        } else if st.mode & libc::S_IFMT == libc::S_IFREG {
            let fd = imfs.open(cage, &child_mount, O_RDONLY, 0)?;
            let mut buf = vec![0u8; st.size as usize];
            let mut total = 0;
            while total < buf.len() {
                let n = imfs.read(cage, fd, &mut buf[total..])?;
                if n == 0 {
                    break;
                }
                total += n;
            }
            buf.truncate(total);
            imfs.close(cage, fd)?;
            std::fs::write(&host_child, &buf).map_err(|_| Errno::EACCES)?;
        }
    }
    imfs.closedir(stream);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_newline_separated_paths() {
        let entries = parse_preloads("/a\n/b\n");
        assert_eq!(entries, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let entries = parse_preloads("/a\n\n  \n/b");
        assert_eq!(entries, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    #[test]
    fn preload_mounts_each_host_path_at_the_identical_path() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("note.txt"), b"hi").unwrap();

        let host_path = src.path().to_path_buf();
        let preloads = parse_preloads(&host_path.to_string_lossy());

        let imfs = Imfs::new();
        load_all(&imfs, 1, &preloads).unwrap();

        let mount_path = host_path.to_str().unwrap();
        let note_path = format!("{}/note.txt", mount_path.trim_end_matches('/'));
        let fd = imfs.open(1, &note_path, O_RDONLY, 0).unwrap();
        let mut buf = [0u8; 2];
        imfs.read(1, fd, &mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn load_then_dump_round_trip() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("hello.txt"), b"hi there").unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub").join("nested.txt"), b"deep").unwrap();

        let imfs = Imfs::new();
        load(&imfs, 1, src.path(), "/data").unwrap();

        let fd = imfs.open(1, "/data/hello.txt", O_RDONLY, 0).unwrap();
        let mut buf = [0u8; 8];
        imfs.read(1, fd, &mut buf).unwrap();
        assert_eq!(&buf, b"hi there");

        let dst = tempfile::tempdir().unwrap();
        dump(&imfs, 1, "/data", dst.path()).unwrap();
        let roundtripped = std::fs::read(dst.path().join("sub").join("nested.txt")).unwrap();
        assert_eq!(roundtripped, b"deep");
    }
}
