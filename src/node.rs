//! The node pool: a bounded arena of filesystem objects with a LIFO
//! free-list (spec §3, §4.2).
//!
//! Source pattern note (spec §9): the original uses a tagged
//! `struct`/`union` (`d_children`, `r_data`, `p_pipe`) reached through macro
//! accessors. Here `NodeKind` is a sum type holding only the fields valid
//! for its variant, and `NodeIndex` is an opaque handle into the arena
//! rather than a raw pointer.

use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum node name length in bytes, excluding the NUL terminator the
/// original C struct reserves a byte for (`MAX_NODE_NAME - 1` usable bytes).
pub const MAX_NODE_NAME: usize = 64;
/// Total node-pool capacity (spec §3 global state, `imfs.h`'s `MAX_NODES`).
pub const MAX_NODES: usize = 1024;
/// Size of one regular-file chunk.
pub const CHUNK_SIZE: usize = 1024;
/// Size of a pipe's ring buffer.
pub const PIPE_SIZE: usize = 1024;

/// Stable index into the node pool; used as the inode number.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct NodeIndex(pub u32);

impl NodeIndex {
    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A POSIX `timespec`-equivalent pair, monotonic-realtime at creation time.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timespec {
            sec: d.as_secs() as i64,
            nsec: d.subsec_nanos() as i64,
        }
    }
}

/// One fixed-size chunk of a regular file's byte stream.
#[derive(Clone)]
pub struct Chunk {
    pub data: Box<[u8; CHUNK_SIZE]>,
    pub used: usize,
}

impl Chunk {
    fn new() -> Self {
        Chunk {
            data: Box::new([0u8; CHUNK_SIZE]),
            used: 0,
        }
    }
}

/// A directory child entry: `"."` and `".."` are themselves entries of kind
/// `Symlink`, satisfying invariant 4 without special-casing lookup.
#[derive(Clone)]
pub struct DirEntry {
    pub name: String,
    pub child: NodeIndex,
}

/// Pipe-specific state: a bounded ring buffer plus back-pointers to the two
/// descriptors sharing it (spec §4.5). Wrap/overflow handling is the open
/// question resolved in `pipe.rs`.
pub struct PipeState {
    pub buffer: Box<[u8; PIPE_SIZE]>,
    pub write_offset: usize,
    pub reader: Option<(u64, i32)>,
    pub writer: Option<(u64, i32)>,
}

impl PipeState {
    fn new() -> Self {
        PipeState {
            buffer: Box::new([0u8; PIPE_SIZE]),
            write_offset: 0,
            reader: None,
            writer: None,
        }
    }
}

/// The kind-specific payload of a node. `Free` marks an unused pool slot.
pub enum NodeKind {
    Free,
    Regular {
        chunks: Vec<Chunk>,
        total_size: usize,
    },
    Directory {
        children: Vec<DirEntry>,
    },
    Symlink {
        target: NodeIndex,
    },
    Pipe(PipeState),
}

impl NodeKind {
    pub fn is_directory(&self) -> bool {
        matches!(self, NodeKind::Directory { .. })
    }

    pub fn is_free(&self) -> bool {
        matches!(self, NodeKind::Free)
    }
}

/// One filesystem object (spec §3 `Node`).
pub struct Node {
    pub index: NodeIndex,
    pub name: String,
    pub mode: u32,
    pub parent_index: NodeIndex,
    pub open_count: u32,
    pub doomed: bool,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub btime: Timespec,
    pub kind: NodeKind,
}

impl Node {
    fn free_slot(index: NodeIndex) -> Self {
        Node {
            index,
            name: String::new(),
            mode: 0,
            parent_index: index,
            open_count: 0,
            doomed: false,
            atime: Timespec::default(),
            mtime: Timespec::default(),
            ctime: Timespec::default(),
            btime: Timespec::default(),
            kind: NodeKind::Free,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind.is_directory()
    }
}

/// Truncate `name` to at most `MAX_NODE_NAME` bytes on a char boundary.
pub fn truncate_name(name: &str) -> String {
    if name.len() <= MAX_NODE_NAME {
        return name.to_string();
    }
    let mut end = MAX_NODE_NAME;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// The bounded node arena with a LIFO free-list (spec §4.2).
pub struct NodeStore {
    nodes: Vec<Node>,
    free: Vec<NodeIndex>,
}

impl NodeStore {
    pub fn new() -> Self {
        NodeStore {
            nodes: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Allocate a node, preferring the most recently freed slot so the
    /// pool's high-water mark stays low; fails with `None` (`ENOMEM` at the
    /// caller) when the pool is exhausted.
    pub fn allocate(&mut self, name: &str, kind: NodeKind, mode: u32, parent: NodeIndex) -> Option<NodeIndex> {
        let index = if let Some(index) = self.free.pop() {
            index
        } else if self.nodes.len() < MAX_NODES {
            let index = NodeIndex(self.nodes.len() as u32);
            self.nodes.push(Node::free_slot(index));
            index
        } else {
            return None;
        };

        let now = Timespec::now();
        let slot = &mut self.nodes[index.as_usize()];
        slot.name = truncate_name(name);
        slot.mode = mode;
        slot.parent_index = parent;
        slot.open_count = 0;
        slot.doomed = false;
        slot.atime = now;
        slot.mtime = now;
        slot.ctime = now;
        slot.btime = now;
        slot.kind = kind;

        Some(index)
    }

    /// Reclaim a node: push it back onto the free-list and mark the slot
    /// `Free` (invariant 2).
    pub fn free(&mut self, index: NodeIndex) {
        self.nodes[index.as_usize()].kind = NodeKind::Free;
        self.free.push(index);
    }

    pub fn get(&self, index: NodeIndex) -> &Node {
        &self.nodes[index.as_usize()]
    }

    pub fn get_mut(&mut self, index: NodeIndex) -> &mut Node {
        &mut self.nodes[index.as_usize()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

impl Default for NodeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_kind() -> NodeKind {
        NodeKind::Directory { children: Vec::new() }
    }

    #[test]
    fn allocate_reuses_freed_slot_lifo() {
        let mut store = NodeStore::new();
        let root = NodeIndex(0);
        store.nodes.push(Node::free_slot(root));

        let a = store.allocate("a", dir_kind(), 0o755, root).unwrap();
        let b = store.allocate("b", dir_kind(), 0o755, root).unwrap();
        store.free(a);
        store.free(b);

        // LIFO: b was freed last, so it comes back first.
        let reused = store.allocate("c", dir_kind(), 0o755, root).unwrap();
        assert_eq!(reused, b);
    }

    #[test]
    fn truncates_overlong_names() {
        let long = "x".repeat(100);
        let truncated = truncate_name(&long);
        assert_eq!(truncated.len(), MAX_NODE_NAME);
    }
}
