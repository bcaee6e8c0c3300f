//! File operations on IMFS: the service object that owns the node pool and
//! every cage's fd table, and the methods that are the POSIX-like surface
//! (spec §4.4).
//!
//! Source pattern note (spec §9): the original reaches this state through a
//! global `g_state` touched without synchronization. Here it is one
//! `Imfs` object whose methods are the operations, guarded by a single
//! `parking_lot::Mutex` (spec §5 explicitly allows single-big-lock
//! granularity as long as invariants 1-6 hold).

use std::collections::HashMap;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{Errno, Result};
use crate::fd::FdTable;
use crate::node::{
    truncate_name, Chunk, DirEntry, Node, NodeIndex, NodeKind, NodeStore, PipeState, Timespec,
    CHUNK_SIZE, PIPE_SIZE,
};
use crate::path;
use crate::pipe;

// open(2) flags this core understands; re-exported so callers don't need a
// direct `libc` dependency just to build an `openat` call.
pub use libc::{O_APPEND, O_CREAT, O_DIRECTORY, O_RDONLY, O_RDWR, O_WRONLY};

/// `lseek` whence values.
pub mod whence {
    pub const SEEK_SET: i32 = libc::SEEK_SET;
    pub const SEEK_CUR: i32 = libc::SEEK_CUR;
    pub const SEEK_END: i32 = libc::SEEK_END;
    /// Flagged as an open question (spec §9 #3): sparse-file semantics were
    /// never meaningful over chunked storage in the original. Rejected with
    /// `EINVAL` rather than guessed at.
    pub const SEEK_HOLE: i32 = libc::SEEK_HOLE;
    pub const SEEK_DATA: i32 = libc::SEEK_DATA;
}

/// `fcntl` operations. Only `F_GETFL` is implemented (spec §4.4).
pub const F_GETFL: i32 = libc::F_GETFL;

/// stat(2)-equivalent attributes (spec §4.4). A typed struct rather than a
/// raw `libc::stat` so the core stays portable across the platforms the
/// `stat` layout disagrees about, mirroring `fuser::FileAttr`.
#[derive(Copy, Clone, Debug)]
pub struct Stat {
    pub ino: u64,
    pub mode: u32,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub btime: Timespec,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub dev: u32,
}

// Stub stat fields, preserved from the original (`imfs.h`'s GET_UID/GET_GID/GET_DEV).
const STAT_UID: u32 = 501;
const STAT_GID: u32 = 20;
const STAT_DEV: u32 = 1;
const STAT_BLKSIZE: u32 = 512;

/// A directory stream handle, for `opendir`/`readdir`/`closedir` (declared
/// in the original's `imfs.h` as `I_DIR`, outside spec.md's listed
/// operations but supplemented here — see SPEC_FULL.md §3).
pub struct DirStream {
    node: NodeIndex,
    offset: usize,
}

struct State {
    nodes: NodeStore,
    fd_tables: HashMap<u64, FdTable>,
}

impl State {
    fn table_mut(&mut self, cage: u64) -> &mut FdTable {
        self.fd_tables.entry(cage).or_insert_with(FdTable::new)
    }

    fn table(&self, cage: u64) -> Option<&FdTable> {
        self.fd_tables.get(&cage)
    }
}

/// The in-memory filesystem: node pool plus every cage's fd table.
pub struct Imfs {
    state: Mutex<State>,
    root: NodeIndex,
}

impl Imfs {
    /// Create the root node and an empty set of per-cage fd tables (spec
    /// §4.9 step 1, `imfs_init`).
    pub fn new() -> Self {
        let mut nodes = NodeStore::new();
        let root = nodes
            .allocate("/", NodeKind::Directory { children: Vec::new() }, libc::S_IFDIR | 0o755, NodeIndex(0))
            .expect("node pool just created, cannot be exhausted");
        debug_assert_eq!(root.0, 0, "root must be the first node allocated");

        let root_node = nodes.get_mut(root);
        root_node.parent_index = root;
        root_node.kind = NodeKind::Directory {
            children: vec![
                DirEntry { name: ".".into(), child: root },
                DirEntry { name: "..".into(), child: root },
            ],
        };

        Imfs {
            state: Mutex::new(State {
                nodes,
                fd_tables: HashMap::new(),
            }),
            root,
        }
    }

    // ---- read-only helpers used by `path.rs` ----

    pub fn root_index(&self) -> NodeIndex {
        self.root
    }

    pub fn is_directory(&self, index: NodeIndex) -> bool {
        self.state.lock().nodes.get(index).is_directory()
    }

    pub fn lookup_child(&self, dir: NodeIndex, name: &str) -> Option<NodeIndex> {
        let state = self.state.lock();
        match &state.nodes.get(dir).kind {
            NodeKind::Directory { children } => {
                children.iter().find(|e| e.name == name).map(|e| e.child)
            }
            _ => None,
        }
    }

    pub fn symlink_target(&self, index: NodeIndex) -> Option<NodeIndex> {
        match &self.state.lock().nodes.get(index).kind {
            NodeKind::Symlink { target } => Some(*target),
            _ => None,
        }
    }

    pub fn fd_node(&self, cage: u64, fd: i32) -> Result<NodeIndex> {
        let state = self.state.lock();
        let table = state.table(cage).ok_or(Errno::EBADF)?;
        Ok(table.open_fd(fd)?.node_index)
    }

    fn resolve(&self, cage: u64, dir_fd: i32, path: &str) -> Result<NodeIndex> {
        path::resolve(self, cage, dir_fd, path)
    }

    fn resolve_parent<'a>(&self, cage: u64, dir_fd: i32, path: &'a str) -> Result<(NodeIndex, &'a str)> {
        path::resolve_parent(self, cage, dir_fd, path)
    }

    // ---- open / close ----

    /// `openat(cage, dir_fd, path, flags, mode)` (spec §4.4).
    pub fn openat(&self, cage: u64, dir_fd: i32, path: &str, flags: i32, mode: u32) -> Result<i32> {
        let (parent, name) = self.resolve_parent(cage, dir_fd, path)?;

        let mut state = self.state.lock();
        if !state.nodes.get(parent).is_directory() {
            return Err(Errno::ENOTDIR);
        }

        let existing = match &state.nodes.get(parent).kind {
            NodeKind::Directory { children } => children.iter().find(|e| e.name == name).map(|e| e.child),
            _ => return Err(Errno::ENOTDIR),
        };

        let node_index = if let Some(existing) = existing {
            // Open Question 1 (spec §9): the original fails with EEXIST
            // whenever O_CREAT is set on an existing target, regardless of
            // O_EXCL. That observed behavior is preserved rather than
            // relaxed to POSIX's O_CREAT|O_EXCL-only rule.
            if flags & O_CREAT != 0 {
                return Err(Errno::EEXIST);
            }
            let node = state.nodes.get(existing);
            let is_dir = node.is_directory();
            if is_dir && flags & O_DIRECTORY == 0 {
                return Err(Errno::EISDIR);
            }
            check_access(node.mode, flags)?;
            existing
        } else if flags & O_CREAT != 0 {
            let node = state
                .nodes
                .allocate(
                    name,
                    NodeKind::Regular { chunks: Vec::new(), total_size: 0 },
                    libc::S_IFREG | (mode & 0o7777),
                    parent,
                )
                .ok_or(Errno::ENOMEM)?;
            if let NodeKind::Directory { children } = &mut state.nodes.get_mut(parent).kind {
                children.push(DirEntry { name: truncate_name(name), child: node });
            }
            node
        } else {
            return Err(Errno::ENOENT);
        };

        // read-openers touch atime, write-openers touch mtime (spec §3)
        let now = Timespec::now();
        {
            let node = state.nodes.get_mut(node_index);
            if flags & libc::O_ACCMODE != O_WRONLY {
                node.atime = now;
            }
            if flags & libc::O_ACCMODE != O_RDONLY {
                node.mtime = now;
            }
        }

        let table = state.table_mut(cage);
        let fd = table.allocate(node_index, flags, None)?;
        state.nodes.get_mut(node_index).open_count += 1;
        debug!("openat(cage={cage}, path={path:?}) -> fd {fd}");
        Ok(fd)
    }

    /// `open` with implicit `AT_FDCWD`.
    pub fn open(&self, cage: u64, path: &str, flags: i32, mode: u32) -> Result<i32> {
        self.openat(cage, path::AT_FDCWD, path, flags, mode)
    }

    /// `close(cage, fd)` (spec §4.3).
    pub fn close(&self, cage: u64, fd: i32) -> Result<()> {
        let mut state = self.state.lock();
        let table = state.fd_tables.get_mut(&cage).ok_or(Errno::EBADF)?;
        let Some(node_index) = table.close(fd)? else {
            return Ok(()); // freeing a link slot never touches a node
        };

        let node = state.nodes.get_mut(node_index);
        node.open_count = node.open_count.saturating_sub(1);
        if node.doomed && node.open_count == 0 {
            state.nodes.free(node_index);
        }
        Ok(())
    }

    // ---- read / write ----

    /// `write(cage, fd, buf)` (spec §4.4).
    pub fn write(&self, cage: u64, fd: i32, buf: &[u8]) -> Result<usize> {
        let mut state = self.state.lock();
        let table = state.fd_tables.get_mut(&cage).ok_or(Errno::EBADF)?;
        let open = table.open_fd(fd)?;
        let node_index = open.node_index;
        let mut offset = open.offset;
        if open.flags & O_APPEND != 0 {
            if let NodeKind::Regular { total_size, .. } = &state.nodes.get(node_index).kind {
                offset = *total_size as i64;
            }
        }

        let n = write_node(&mut state.nodes, node_index, offset as usize, buf)?;
        let open = table.open_fd_mut(fd)?;
        open.offset += n as i64;
        Ok(n)
    }

    /// `pwrite(cage, fd, buf, offset)`: identical to `write` but does not
    /// advance the descriptor offset.
    pub fn pwrite(&self, cage: u64, fd: i32, buf: &[u8], offset: i64) -> Result<usize> {
        if offset < 0 {
            return Err(Errno::EINVAL);
        }
        let mut state = self.state.lock();
        let table = state.fd_tables.get_mut(&cage).ok_or(Errno::EBADF)?;
        let node_index = table.open_fd(fd)?.node_index;
        write_node(&mut state.nodes, node_index, offset as usize, buf)
    }

    /// `read(cage, fd, buf)` (spec §4.4). Dispatches to the pipe engine for
    /// pipe nodes.
    pub fn read(&self, cage: u64, fd: i32, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut state = self.state.lock();
            let table = state.fd_tables.get_mut(&cage).ok_or(Errno::EBADF)?;
            let open = table.open_fd(fd)?;
            let node_index = open.node_index;
            let offset = open.offset;
            let nonblocking = open.flags & libc::O_NONBLOCK != 0;

            let node = state.nodes.get_mut(node_index);
            match &mut node.kind {
                NodeKind::Regular { chunks, total_size } => {
                    let n = read_chunks(chunks, *total_size, offset as usize, buf);
                    node.atime = Timespec::now();
                    let open = table.open_fd_mut(fd)?;
                    open.offset += n as i64;
                    return Ok(n);
                }
                NodeKind::Directory { .. } => return Err(Errno::EISDIR),
                NodeKind::Pipe(pipe_state) => {
                    if pipe::has_data(pipe_state) {
                        return Ok(pipe::drain(pipe_state, buf));
                    }
                    let writer_live = pipe_state
                        .writer
                        .is_some_and(|(wcage, wfd)| {
                            state.fd_tables.get(&wcage).is_some_and(|t| t.is_live(wfd))
                        });
                    if !writer_live {
                        return Ok(0); // EOF: writer closed, buffer empty
                    }
                    if nonblocking {
                        return Err(Errno::EAGAIN);
                    }
                    drop(state);
                    std::thread::yield_now();
                    // retry from the top: this is the "busy-wait" blocking
                    // point the spec calls out (§5) — its only wakeup
                    // events are a write or the writer closing.
                }
                NodeKind::Symlink { .. } | NodeKind::Free => return Err(Errno::EBADF),
            }
        }
    }

    /// `pread(cage, fd, buf, offset)`.
    pub fn pread(&self, cage: u64, fd: i32, buf: &mut [u8], offset: i64) -> Result<usize> {
        if offset < 0 {
            return Err(Errno::EINVAL);
        }
        let mut state = self.state.lock();
        let table = state.fd_tables.get(&cage).ok_or(Errno::EBADF)?;
        let node_index = table.open_fd(fd)?.node_index;
        let node = state.nodes.get_mut(node_index);
        match &mut node.kind {
            NodeKind::Regular { chunks, total_size } => {
                let n = read_chunks(chunks, *total_size, offset as usize, buf);
                node.atime = Timespec::now();
                Ok(n)
            }
            NodeKind::Directory { .. } => Err(Errno::EISDIR),
            _ => Err(Errno::EINVAL),
        }
    }

    /// `readv`/`preadv`: loop over the buffer array, propagating the first error.
    pub fn readv(&self, cage: u64, fd: i32, bufs: &mut [&mut [u8]]) -> Result<usize> {
        let mut total = 0;
        for buf in bufs.iter_mut() {
            total += self.read(cage, fd, buf)?;
        }
        Ok(total)
    }

    pub fn preadv(&self, cage: u64, fd: i32, bufs: &mut [&mut [u8]], mut offset: i64) -> Result<usize> {
        let mut total = 0;
        for buf in bufs.iter_mut() {
            let n = self.pread(cage, fd, buf, offset)?;
            offset += n as i64;
            total += n;
        }
        Ok(total)
    }

    /// `writev`/`pwritev`: loop over the buffer array, propagating the first error.
    pub fn writev(&self, cage: u64, fd: i32, bufs: &[&[u8]]) -> Result<usize> {
        let mut total = 0;
        for buf in bufs {
            total += self.write(cage, fd, buf)?;
        }
        Ok(total)
    }

    pub fn pwritev(&self, cage: u64, fd: i32, bufs: &[&[u8]], mut offset: i64) -> Result<usize> {
        let mut total = 0;
        for buf in bufs {
            let n = self.pwrite(cage, fd, buf, offset)?;
            offset += n as i64;
            total += n;
        }
        Ok(total)
    }

    /// `lseek(cage, fd, offset, whence)`.
    pub fn lseek(&self, cage: u64, fd: i32, offset: i64, whence_value: i32) -> Result<i64> {
        if whence_value == whence::SEEK_HOLE || whence_value == whence::SEEK_DATA {
            return Err(Errno::EINVAL);
        }

        let mut state = self.state.lock();
        let table = state.fd_tables.get_mut(&cage).ok_or(Errno::EBADF)?;
        let open = table.open_fd(fd)?;
        let node_index = open.node_index;
        let current = open.offset;

        let size = match &state.nodes.get(node_index).kind {
            NodeKind::Regular { total_size, .. } => *total_size as i64,
            _ => 0,
        };

        let new_offset = match whence_value {
            whence::SEEK_SET => offset,
            whence::SEEK_CUR => current + offset,
            whence::SEEK_END => size + offset,
            _ => return Err(Errno::EINVAL),
        };

        if new_offset < 0 {
            return Err(Errno::EINVAL);
        }

        table.open_fd_mut(fd)?.offset = new_offset;
        Ok(new_offset)
    }

    // ---- dup ----

    pub fn dup(&self, cage: u64, old_fd: i32) -> Result<i32> {
        let mut state = self.state.lock();
        let table = state.fd_tables.get_mut(&cage).ok_or(Errno::EBADF)?;
        table.duplicate(old_fd, None)
    }

    pub fn dup2(&self, cage: u64, old_fd: i32, new_fd: i32) -> Result<i32> {
        let mut state = self.state.lock();
        let table = state.fd_tables.get_mut(&cage).ok_or(Errno::EBADF)?;
        if table.is_live(new_fd) {
            if let Some(node_index) = table.close(new_fd)? {
                let node = state.nodes.get_mut(node_index);
                node.open_count = node.open_count.saturating_sub(1);
                if node.doomed && node.open_count == 0 {
                    state.nodes.free(node_index);
                }
            }
            let table = state.fd_tables.get_mut(&cage).ok_or(Errno::EBADF)?;
            table.duplicate(old_fd, Some(new_fd))
        } else {
            table.duplicate(old_fd, Some(new_fd))
        }
    }

    // ---- directory operations ----

    /// `mkdir(cage, path, mode)` (spec §4.4). All three entries (self, `.`,
    /// `..`) are attached before the directory is linked into its parent,
    /// resolving Open Question 5 (atomicity): a node that never gets linked
    /// is simply never visible, so there is no partially-attached state to
    /// observe.
    pub fn mkdir(&self, cage: u64, path: &str, mode: u32) -> Result<()> {
        let (parent, name) = self.resolve_parent(cage, path::AT_FDCWD, path)?;
        self.mkdirat_impl(parent, name, mode)
    }

    /// `mkdirat(cage, dir_fd, path, mode)`.
    pub fn mkdirat(&self, cage: u64, dir_fd: i32, path: &str, mode: u32) -> Result<()> {
        let (parent, name) = self.resolve_parent(cage, dir_fd, path)?;
        self.mkdirat_impl(parent, name, mode)
    }

    fn mkdirat_impl(&self, parent: NodeIndex, name: &str, mode: u32) -> Result<()> {
        if name == "." || name == ".." {
            return Err(Errno::EINVAL);
        }

        let mut state = self.state.lock();
        if !state.nodes.get(parent).is_directory() {
            return Err(Errno::ENOTDIR);
        }
        let existing = match &state.nodes.get(parent).kind {
            NodeKind::Directory { children } => children.iter().any(|e| e.name == name),
            _ => false,
        };
        if existing {
            // P6 (mkdir idempotence): calling mkdir twice succeeds both times.
            return Ok(());
        }

        let node = state
            .nodes
            .allocate(name, NodeKind::Directory { children: Vec::new() }, libc::S_IFDIR | (mode & 0o7777), parent)
            .ok_or(Errno::ENOMEM)?;
        {
            let dir = state.nodes.get_mut(node);
            dir.kind = NodeKind::Directory {
                children: vec![
                    DirEntry { name: ".".into(), child: node },
                    DirEntry { name: "..".into(), child: parent },
                ],
            };
        }
        if let NodeKind::Directory { children } = &mut state.nodes.get_mut(parent).kind {
            children.push(DirEntry { name: truncate_name(name), child: node });
        }
        Ok(())
    }

    /// `rmdir(cage, path)`: refuses non-empty directories with `EBUSY`
    /// (empty means only `.`/`..` remain, spec §4.4).
    pub fn rmdir(&self, cage: u64, path: &str) -> Result<()> {
        let index = self.resolve(cage, path::AT_FDCWD, path)?;
        let mut state = self.state.lock();

        let is_empty = match &state.nodes.get(index).kind {
            NodeKind::Directory { children } => children.len() <= 2,
            _ => return Err(Errno::ENOTDIR),
        };
        if !is_empty {
            return Err(Errno::EBUSY);
        }

        self.unlink_locked(&mut state, index)
    }

    /// `unlink(cage, path)` / `remove(cage, path)`.
    pub fn unlink(&self, cage: u64, path: &str) -> Result<()> {
        let index = self.resolve(cage, path::AT_FDCWD, path)?;
        let mut state = self.state.lock();
        if state.nodes.get(index).is_directory() {
            return Err(Errno::EISDIR);
        }
        self.unlink_locked(&mut state, index)
    }

    /// `remove` is a synonym for `unlink` in this core (neither distinguishes
    /// file vs. directory removal beyond what `unlink`/`rmdir` already do).
    pub fn remove(&self, cage: u64, path: &str) -> Result<()> {
        self.unlink(cage, path)
    }

    fn unlink_locked(&self, state: &mut State, index: NodeIndex) -> Result<()> {
        let parent = state.nodes.get(index).parent_index;
        if let NodeKind::Directory { children } = &mut state.nodes.get_mut(parent).kind {
            children.retain(|e| e.child != index);
        }

        let node = state.nodes.get_mut(index);
        if node.open_count == 0 {
            state.nodes.free(index);
        } else {
            node.doomed = true;
        }
        Ok(())
    }

    /// `link`/`symlink` (spec §4.4, Open Question 2): both create a
    /// `Symlink`-kind node pointing at the target, matching the original's
    /// observed (non-POSIX) behavior rather than implementing true
    /// ref-counted hard links.
    pub fn symlink(&self, cage: u64, target_path: &str, link_path: &str) -> Result<()> {
        let target = self.resolve(cage, path::AT_FDCWD, target_path)?;
        let (parent, name) = self.resolve_parent(cage, path::AT_FDCWD, link_path)?;

        let mut state = self.state.lock();
        let node = state
            .nodes
            .allocate(name, NodeKind::Symlink { target }, libc::S_IFLNK | 0o777, parent)
            .ok_or(Errno::ENOMEM)?;
        if let NodeKind::Directory { children } = &mut state.nodes.get_mut(parent).kind {
            children.push(DirEntry { name: truncate_name(name), child: node });
        }
        Ok(())
    }

    pub fn link(&self, cage: u64, old_path: &str, new_path: &str) -> Result<()> {
        self.symlink(cage, old_path, new_path)
    }

    /// `rename` (spec §9, Open Question 6): a present, observed no-op.
    pub fn rename(&self, _cage: u64, _old_path: &str, _new_path: &str) -> Result<()> {
        debug!("rename is a no-op in this core");
        Ok(())
    }

    /// `chown` (spec §9, Open Question 6): a present, observed no-op.
    pub fn chown(&self, _cage: u64, _path: &str, _uid: u32, _gid: u32) -> Result<()> {
        debug!("chown is a no-op in this core");
        Ok(())
    }

    pub fn mkfifo(&self, _cage: u64, _path: &str, _mode: u32) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    pub fn mknod(&self, _cage: u64, _path: &str, _mode: u32, _dev: u64) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    pub fn bind(&self, _cage: u64, _sockfd: i32) -> Result<()> {
        Err(Errno::EOPNOTSUPP)
    }

    // ---- stat / chmod / fcntl ----

    fn stat_of(&self, node: &Node) -> Stat {
        let (size, blocks) = match &node.kind {
            NodeKind::Regular { total_size, .. } => (*total_size as u64, (*total_size as u64) / STAT_BLKSIZE as u64),
            _ => (0, 0),
        };
        Stat {
            ino: node.index.0 as u64,
            mode: node.mode,
            size,
            blksize: STAT_BLKSIZE,
            blocks,
            atime: node.atime,
            mtime: node.mtime,
            ctime: node.ctime,
            btime: node.btime,
            nlink: 1,
            uid: STAT_UID,
            gid: STAT_GID,
            dev: STAT_DEV,
        }
    }

    /// `stat`: follows symlinks.
    pub fn stat(&self, cage: u64, path: &str) -> Result<Stat> {
        let index = self.resolve(cage, path::AT_FDCWD, path)?;
        let state = self.state.lock();
        Ok(self.stat_of(state.nodes.get(index)))
    }

    /// `lstat`: does not follow a final symlink component.
    pub fn lstat(&self, cage: u64, path: &str) -> Result<Stat> {
        let (parent, name) = self.resolve_parent(cage, path::AT_FDCWD, path)?;
        let state = self.state.lock();
        let index = match &state.nodes.get(parent).kind {
            NodeKind::Directory { children } => children.iter().find(|e| e.name == name).map(|e| e.child),
            _ => None,
        }
        .ok_or(Errno::ENOENT)?;
        Ok(self.stat_of(state.nodes.get(index)))
    }

    pub fn fstat(&self, cage: u64, fd: i32) -> Result<Stat> {
        let state = self.state.lock();
        let table = state.table(cage).ok_or(Errno::EBADF)?;
        let index = table.open_fd(fd)?.node_index;
        Ok(self.stat_of(state.nodes.get(index)))
    }

    /// `chmod`/`fchmod`: replace the low 9 permission bits, preserving the
    /// type bits.
    pub fn chmod(&self, cage: u64, path: &str, mode: u32) -> Result<()> {
        let index = self.resolve(cage, path::AT_FDCWD, path)?;
        let mut state = self.state.lock();
        let node = state.nodes.get_mut(index);
        node.mode = (node.mode & !0o7777) | (mode & 0o7777);
        Ok(())
    }

    pub fn fchmod(&self, cage: u64, fd: i32, mode: u32) -> Result<()> {
        let mut state = self.state.lock();
        let table = state.fd_tables.get(&cage).ok_or(Errno::EBADF)?;
        let index = table.open_fd(fd)?.node_index;
        let node = state.nodes.get_mut(index);
        node.mode = (node.mode & !0o7777) | (mode & 0o7777);
        Ok(())
    }

    /// `fcntl`: only `F_GETFL` is implemented (spec §4.4).
    pub fn fcntl(&self, cage: u64, fd: i32, op: i32, _arg: i32) -> Result<i32> {
        let state = self.state.lock();
        let table = state.table(cage).ok_or(Errno::EBADF)?;
        if op == F_GETFL {
            Ok(table.open_fd(fd)?.flags)
        } else {
            Err(Errno::ENOSYS)
        }
    }

    /// `pathconf`/`fpathconf`: answers drawn from the original's `PC_CONSTS`
    /// table (`imfs.h`), indexed by the POSIX `_PC_*` name.
    pub fn pathconf(&self, _cage: u64, _path: &str, name: i32) -> Result<i64> {
        pathconf_value(name)
    }

    pub fn fpathconf(&self, _cage: u64, _fd: i32, name: i32) -> Result<i64> {
        pathconf_value(name)
    }

    // ---- pipe ----

    /// `pipe(cage) -> [read_fd, write_fd]` (spec §4.5).
    pub fn pipe(&self, cage: u64) -> Result<[i32; 2]> {
        let mut state = self.state.lock();
        let node = state
            .nodes
            .allocate(
                "pipe",
                NodeKind::Pipe(PipeState {
                    buffer: Box::new([0u8; PIPE_SIZE]),
                    write_offset: 0,
                    reader: None,
                    writer: None,
                }),
                libc::S_IFIFO | 0o600,
                self.root,
            )
            .ok_or(Errno::ENOMEM)?;

        let table = state.table_mut(cage);
        let read_fd = table.allocate(node, O_RDONLY, None)?;
        let write_fd = match table.allocate(node, O_WRONLY, None) {
            Ok(fd) => fd,
            Err(e) => {
                table.close(read_fd).ok();
                return Err(e);
            }
        };
        state.nodes.get_mut(node).open_count += 2;

        if let NodeKind::Pipe(pipe_state) = &mut state.nodes.get_mut(node).kind {
            pipe_state.reader = Some((cage, read_fd));
            pipe_state.writer = Some((cage, write_fd));
        }

        Ok([read_fd, write_fd])
    }

    // ---- directory streams ----

    pub fn opendir(&self, cage: u64, path: &str) -> Result<DirStream> {
        let index = self.resolve(cage, path::AT_FDCWD, path)?;
        if !self.is_directory(index) {
            return Err(Errno::ENOTDIR);
        }
        Ok(DirStream { node: index, offset: 0 })
    }

    /// Returns the next `(name, inode)` entry, or `None` at end of stream.
    pub fn readdir(&self, stream: &mut DirStream) -> Option<(String, u64)> {
        let state = self.state.lock();
        match &state.nodes.get(stream.node).kind {
            NodeKind::Directory { children } => {
                let entry = children.get(stream.offset)?;
                let result = (entry.name.clone(), entry.child.0 as u64);
                stream.offset += 1;
                Some(result)
            }
            _ => None,
        }
    }

    pub fn closedir(&self, _stream: DirStream) {}

    // ---- fd table inheritance (spec §9, Open Question 7) ----

    /// Copy `src_cage`'s fd table into `dst_cage`, incrementing every
    /// inherited node's `open_count`. Declared (as `imfs_copy_fd_tables` in
    /// the original) but, per the spec's own observation, never hooked into
    /// any fork path — callers decide when cross-cage descriptor
    /// inheritance should happen.
    pub fn copy_fd_tables(&self, src_cage: u64, dst_cage: u64) {
        let mut state = self.state.lock();
        let Some(src) = state.fd_tables.get(&src_cage) else {
            warn!("copy_fd_tables: source cage {src_cage} has no fd table");
            return;
        };
        let mut cloned = FdTable::new();
        for fd in src.live_entries() {
            if let Ok(open) = src.open_fd(fd) {
                if cloned.allocate(open.node_index, open.flags, Some(fd)).is_ok() {
                    state.nodes.get_mut(open.node_index).open_count += 1;
                }
            }
        }
        state.fd_tables.insert(dst_cage, cloned);
    }
}

impl Default for Imfs {
    fn default() -> Self {
        Self::new()
    }
}

fn check_access(mode: u32, flags: i32) -> Result<()> {
    let perms = crate::flags::Permissions::from_mode(mode);
    if perms.allows(crate::flags::OpenFlags(flags)) {
        Ok(())
    } else {
        Err(Errno::EACCES)
    }
}

fn write_node(nodes: &mut NodeStore, node_index: NodeIndex, offset: usize, buf: &[u8]) -> Result<usize> {
    let node = nodes.get_mut(node_index);
    let (chunks, total_size) = match &mut node.kind {
        NodeKind::Regular { chunks, total_size } => (chunks, total_size),
        NodeKind::Pipe(pipe_state) => return pipe::write(pipe_state, buf),
        _ => return Err(Errno::EISDIR),
    };

    let mut remaining = buf;
    let mut pos = offset;
    while !remaining.is_empty() {
        let chunk_idx = pos / CHUNK_SIZE;
        let chunk_off = pos % CHUNK_SIZE;
        while chunks.len() <= chunk_idx {
            chunks.push(Chunk {
                data: Box::new([0u8; CHUNK_SIZE]),
                used: 0,
            });
        }
        let chunk = &mut chunks[chunk_idx];
        let n = remaining.len().min(CHUNK_SIZE - chunk_off);
        chunk.data[chunk_off..chunk_off + n].copy_from_slice(&remaining[..n]);
        chunk.used = chunk.used.max(chunk_off + n);
        pos += n;
        remaining = &remaining[n..];
    }

    *total_size = (*total_size).max(offset + buf.len());
    node.mtime = Timespec::now();
    Ok(buf.len())
}

fn read_chunks(chunks: &[Chunk], total_size: usize, offset: usize, buf: &mut [u8]) -> usize {
    if offset >= total_size {
        return 0;
    }
    let available = total_size - offset;
    let to_read = buf.len().min(available);

    let mut pos = offset;
    let mut done = 0;
    while done < to_read {
        let chunk_idx = pos / CHUNK_SIZE;
        let chunk_off = pos % CHUNK_SIZE;
        let Some(chunk) = chunks.get(chunk_idx) else { break };
        let n = (to_read - done).min(CHUNK_SIZE - chunk_off);
        buf[done..done + n].copy_from_slice(&chunk.data[chunk_off..chunk_off + n]);
        pos += n;
        done += n;
    }
    done
}

/// `_PC_*` answers, taken from the original `imfs.h`'s `PC_CONSTS` table.
fn pathconf_value(name: i32) -> Result<i64> {
    const PC_CONSTS: [i64; 10] = [0, 10, 10, 10, (crate::node::MAX_NODE_NAME - 1) as i64, 10 * crate::node::MAX_NODE_NAME as i64, 10, 10, 10, 10];
    PC_CONSTS.get(name as usize).copied().ok_or(Errno::EINVAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_read_round_trip() {
        let imfs = Imfs::new();
        let fd = imfs.open(1, "/a.txt", O_CREAT | O_WRONLY, 0o777).unwrap();
        assert_eq!(imfs.write(1, fd, b"hi").unwrap(), 2);
        imfs.close(1, fd).unwrap();

        let fd = imfs.open(1, "/a.txt", O_RDONLY, 0).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(imfs.read(1, fd, &mut buf).unwrap(), 2);
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn dup_offset_sharing() {
        let imfs = Imfs::new();
        let fd = imfs.open(1, "/b", O_CREAT | O_RDWR, 0o777).unwrap();
        imfs.write(1, fd, b"0123456789").unwrap();
        imfs.lseek(1, fd, 0, whence::SEEK_SET).unwrap();
        imfs.dup2(1, fd, 100).unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(imfs.read(1, 100, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"01234");

        assert_eq!(imfs.read(1, fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"56789");
    }

    #[test]
    fn unlink_while_open_then_reopen_enoent() {
        let imfs = Imfs::new();
        let fd = imfs.open(1, "/c", O_CREAT | O_RDWR, 0o777).unwrap();
        imfs.write(1, fd, b"xyz").unwrap();
        imfs.unlink(1, "/c").unwrap();
        imfs.lseek(1, fd, 0, whence::SEEK_SET).unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(imfs.read(1, fd, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"xyz");

        assert!(imfs.open(1, "/c", O_RDONLY, 0).is_err());
    }

    #[test]
    fn mkdir_then_stat() {
        let imfs = Imfs::new();
        imfs.mkdir(1, "/d", 0o755).unwrap();
        let st = imfs.stat(1, "/d").unwrap();
        assert_eq!(st.mode & libc::S_IFMT, libc::S_IFDIR);
        assert_eq!(st.size, 0);
    }

    #[test]
    fn mkdir_twice_is_idempotent() {
        let imfs = Imfs::new();
        imfs.mkdir(1, "/d", 0o755).unwrap();
        imfs.mkdir(1, "/d", 0o755).unwrap();
        let mut count = 0;
        let mut stream = imfs.opendir(1, "/").unwrap();
        while let Some((name, _)) = imfs.readdir(&mut stream) {
            if name == "d" {
                count += 1;
            }
        }
        assert_eq!(count, 1);
    }

    #[test]
    fn rmdir_non_empty_is_ebusy() {
        let imfs = Imfs::new();
        imfs.mkdir(1, "/d", 0o755).unwrap();
        imfs.mkdir(1, "/d/e", 0o755).unwrap();
        assert!(matches!(imfs.rmdir(1, "/d"), Err(e) if e.code() == libc::EBUSY));
    }

    #[test]
    fn chunked_write_crossing_multiple_1kb_chunks() {
        let imfs = Imfs::new();
        let fd = imfs.open(1, "/big", O_CREAT | O_RDWR, 0o777).unwrap();
        let data = vec![7u8; 4096];
        assert_eq!(imfs.write(1, fd, &data).unwrap(), 4096);
        imfs.lseek(1, fd, 0, whence::SEEK_SET).unwrap();

        let mut buf = vec![0u8; 4096];
        assert_eq!(imfs.read(1, fd, &mut buf).unwrap(), 4096);
        assert_eq!(buf, data);
    }

    #[test]
    fn pipe_round_trip() {
        let imfs = Imfs::new();
        let [rfd, wfd] = imfs.pipe(1).unwrap();
        imfs.write(1, wfd, b"abc").unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(imfs.read(1, rfd, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn pipe_eof_after_writer_closed() {
        let imfs = Imfs::new();
        let [rfd, wfd] = imfs.pipe(1).unwrap();
        imfs.close(1, wfd).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(imfs.read(1, rfd, &mut buf).unwrap(), 0);
    }

    #[test]
    fn pwrite_pread_do_not_move_offset() {
        let imfs = Imfs::new();
        let fd = imfs.open(1, "/p", O_CREAT | O_RDWR, 0o777).unwrap();
        imfs.write(1, fd, b"zzzzzzzzzz").unwrap();
        let before = imfs.lseek(1, fd, 0, whence::SEEK_CUR).unwrap();
        imfs.pwrite(1, fd, b"AB", 2).unwrap();
        let mut buf = [0u8; 2];
        imfs.pread(1, fd, &mut buf, 2).unwrap();
        assert_eq!(&buf, b"AB");
        let after = imfs.lseek(1, fd, 0, whence::SEEK_CUR).unwrap();
        assert_eq!(before, after);
    }
}
