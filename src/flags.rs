//! Typed wrappers over the raw `open`/`access` integer flags (spec §3).
//!
//! Mirrors the teacher's `open_flags`/`access_flags` split: `OpenFlags` is a
//! plain newtype with an `acc_mode()` accessor (the access-mode bits aren't
//! independent flags, so they don't fit a `bitflags!` set), while
//! [`Permissions`] is a genuine bitset and uses `bitflags!`.

use bitflags::bitflags;

/// How a file was opened: read-only, write-only, or read-write.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
#[allow(non_camel_case_types)]
pub enum OpenAccMode {
    O_RDONLY = libc::O_RDONLY,
    O_WRONLY = libc::O_WRONLY,
    O_RDWR = libc::O_RDWR,
}

/// Raw `open(2)` flags, as passed across the 3i boundary.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct OpenFlags(pub i32);

impl OpenFlags {
    pub fn acc_mode(self) -> OpenAccMode {
        match self.0 & libc::O_ACCMODE {
            libc::O_WRONLY => OpenAccMode::O_WRONLY,
            libc::O_RDWR => OpenAccMode::O_RDWR,
            _ => OpenAccMode::O_RDONLY,
        }
    }

    pub fn contains_raw(self, bit: i32) -> bool {
        self.0 & bit != 0
    }
}

bitflags! {
    /// The three permission bits this core checks on open (spec §4.4):
    /// there is a single stub owner/group/other identity, so only one set
    /// of bits is meaningful rather than the usual three.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct Permissions: u32 {
        const READ = libc::S_IROTH as u32;
        const WRITE = libc::S_IWOTH as u32;
        const EXEC = libc::S_IXOTH as u32;
    }
}

impl Permissions {
    pub fn from_mode(mode: u32) -> Self {
        Permissions::from_bits_truncate(mode)
    }

    /// Whether `flags`'s access mode is satisfiable given these permission
    /// bits.
    pub fn allows(self, flags: OpenFlags) -> bool {
        match flags.acc_mode() {
            OpenAccMode::O_RDONLY => self.contains(Permissions::READ),
            OpenAccMode::O_WRONLY => self.contains(Permissions::WRITE),
            OpenAccMode::O_RDWR => self.contains(Permissions::READ | Permissions::WRITE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_mode_needs_only_read_bit() {
        let perms = Permissions::from_mode(0o004);
        assert!(perms.allows(OpenFlags(libc::O_RDONLY)));
        assert!(!perms.allows(OpenFlags(libc::O_WRONLY)));
    }

    #[test]
    fn read_write_mode_needs_both_bits() {
        let perms = Permissions::from_mode(0o006);
        assert!(perms.allows(OpenFlags(libc::O_RDWR)));
        let write_only = Permissions::from_mode(0o002);
        assert!(!write_only.allows(OpenFlags(libc::O_RDWR)));
    }
}
