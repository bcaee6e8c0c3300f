//! Per-cage file-descriptor tables (spec §3 `FileDesc`, §4.3).
//!
//! Source pattern note (spec §9): the original links duplicated descriptors
//! through a raw `FileDesc.link` pointer. Here a dup'd slot is
//! `FdSlot::Link(fd)`, an index into the same cage's table; `resolve`
//! follows the chain to the terminal slot that actually owns a node.

use crate::error::{Errno, Result};
use crate::node::NodeIndex;

/// Per-cage fd table capacity (`imfs.h`'s `MAX_FDS`).
pub const MAX_FDS: usize = 1024;
/// The first fd number the core hands out; 0/1/2 are reserved for the
/// cage's inherited stdio and are never allocated by IMFS itself.
const FIRST_FD: i32 = 3;

/// A single open-file-description slot.
pub struct OpenFd {
    pub node_index: NodeIndex,
    pub offset: i64,
    pub flags: i32,
}

enum FdSlot {
    Free,
    Open(OpenFd),
    /// A dup'd descriptor: forwards all operations to another slot in the
    /// same cage's table (spec invariant 6: dup'd descriptors share offset
    /// and flags because they share the one underlying slot).
    Link(i32),
}

/// One cage's array of file descriptors, with a LIFO free-list and a
/// high-water mark (`next_fd`), mirroring the node pool's allocation policy.
pub struct FdTable {
    slots: Vec<FdSlot>,
    free: Vec<i32>,
    next_fd: i32,
}

impl FdTable {
    pub fn new() -> Self {
        FdTable {
            slots: Vec::new(),
            free: Vec::new(),
            next_fd: FIRST_FD,
        }
    }

    fn slot(&self, fd: i32) -> Result<&FdSlot> {
        if fd < 0 {
            return Err(Errno::EBADF);
        }
        self.slots.get(fd as usize).ok_or(Errno::EBADF)
    }

    fn slot_mut(&mut self, fd: i32) -> Result<&mut FdSlot> {
        if fd < 0 {
            return Err(Errno::EBADF);
        }
        self.slots.get_mut(fd as usize).ok_or(Errno::EBADF)
    }

    /// Follow the dup chain to the fd number that actually owns a node.
    pub fn resolve(&self, fd: i32) -> Result<i32> {
        let mut current = fd;
        loop {
            match self.slot(current)? {
                FdSlot::Open(_) => return Ok(current),
                FdSlot::Link(target) => current = *target,
                FdSlot::Free => return Err(Errno::EBADF),
            }
        }
    }

    pub fn open_fd(&self, fd: i32) -> Result<&OpenFd> {
        let terminal = self.resolve(fd)?;
        match self.slot(terminal)? {
            FdSlot::Open(open) => Ok(open),
            _ => Err(Errno::EBADF),
        }
    }

    pub fn open_fd_mut(&mut self, fd: i32) -> Result<&mut OpenFd> {
        let terminal = self.resolve(fd)?;
        match self.slot_mut(terminal)? {
            FdSlot::Open(open) => Ok(open),
            _ => Err(Errno::EBADF),
        }
    }

    fn reserve_slot(&mut self, requested: Option<i32>) -> Result<i32> {
        if let Some(requested) = requested {
            if requested < 0 || requested as usize >= MAX_FDS {
                return Err(Errno::EBADF);
            }
            while self.slots.len() <= requested as usize {
                self.slots.push(FdSlot::Free);
            }
            if requested >= self.next_fd {
                self.next_fd = requested + 1;
            }
            self.free.retain(|&f| f != requested);
            return Ok(requested);
        }

        if let Some(fd) = self.free.pop() {
            return Ok(fd);
        }
        if (self.next_fd as usize) >= MAX_FDS {
            return Err(Errno::EMFILE);
        }
        let fd = self.next_fd;
        self.next_fd += 1;
        while self.slots.len() <= fd as usize {
            self.slots.push(FdSlot::Free);
        }
        Ok(fd)
    }

    /// Install a terminal descriptor for `node` at the lowest free slot (or
    /// at a caller-chosen slot, used by `dup2`). Does not touch
    /// `node.open_count`; the caller (`fs.rs`) owns cross-component
    /// bookkeeping.
    pub fn allocate(&mut self, node_index: NodeIndex, flags: i32, requested: Option<i32>) -> Result<i32> {
        let fd = self.reserve_slot(requested)?;
        self.slots[fd as usize] = FdSlot::Open(OpenFd {
            node_index,
            offset: 0,
            flags,
        });
        Ok(fd)
    }

    /// Install a link descriptor pointing at `old_fd`'s terminal slot.
    pub fn duplicate(&mut self, old_fd: i32, requested: Option<i32>) -> Result<i32> {
        let terminal = self.resolve(old_fd)?;
        let fd = self.reserve_slot(requested)?;
        self.slots[fd as usize] = FdSlot::Link(terminal);
        Ok(fd)
    }

    /// Release `fd`. Returns `Some(node_index)` if this was the terminal
    /// slot for a node (the caller must decrement `open_count`), or `None`
    /// if `fd` was a link (freeing a link never affects a node).
    pub fn close(&mut self, fd: i32) -> Result<Option<NodeIndex>> {
        let slot = self.slot_mut(fd)?;
        let result = match std::mem::replace(slot, FdSlot::Free) {
            FdSlot::Free => return Err(Errno::EBADF),
            FdSlot::Link(_) => None,
            FdSlot::Open(open) => Some(open.node_index),
        };
        self.free.push(fd);
        Ok(result)
    }

    /// True if `fd` currently names a live slot (open or link).
    pub fn is_live(&self, fd: i32) -> bool {
        matches!(self.slot(fd), Ok(FdSlot::Open(_)) | Ok(FdSlot::Link(_)))
    }

    /// All fd numbers currently naming a live slot, ascending.
    pub fn live_entries(&self) -> Vec<i32> {
        (0..self.slots.len() as i32).filter(|&fd| self.is_live(fd)).collect()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dup_shares_terminal_slot() {
        let mut table = FdTable::new();
        let fd = table.allocate(NodeIndex(7), libc::O_RDWR, None).unwrap();
        let dup = table.duplicate(fd, None).unwrap();

        table.open_fd_mut(dup).unwrap().offset = 42;
        assert_eq!(table.open_fd(fd).unwrap().offset, 42);
    }

    #[test]
    fn close_link_does_not_return_node() {
        let mut table = FdTable::new();
        let fd = table.allocate(NodeIndex(1), 0, None).unwrap();
        let dup = table.duplicate(fd, None).unwrap();

        assert_eq!(table.close(dup).unwrap(), None);
        assert!(table.is_live(fd));
    }

    #[test]
    fn close_terminal_returns_node_for_release() {
        let mut table = FdTable::new();
        let fd = table.allocate(NodeIndex(3), 0, None).unwrap();
        assert_eq!(table.close(fd).unwrap(), Some(NodeIndex(3)));
        assert!(!table.is_live(fd));
    }

    #[test]
    fn dup2_requested_slot_reuses_number() {
        let mut table = FdTable::new();
        let fd = table.allocate(NodeIndex(3), 0, None).unwrap();
        let dup = table.duplicate(fd, Some(100)).unwrap();
        assert_eq!(dup, 100);
    }

    #[test]
    fn emfile_past_capacity() {
        let mut table = FdTable::new();
        table.next_fd = MAX_FDS as i32;
        assert!(matches!(
            table.allocate(NodeIndex(0), 0, None),
            Err(e) if e.code() == libc::EMFILE
        ));
    }
}
