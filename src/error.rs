//! Error currency used across the IMFS core and the 3i call boundary.
//!
//! The core never panics or retries a failed sub-operation (spec §7); every
//! fallible method returns `Result<T, Errno>`. `errno` in the POSIX sense is
//! only materialized at the ABI boundary (`make_threei_call`, the grate
//! dispatcher, syscall wrappers) by converting the `Err` arm to `-code`.

use std::fmt;

/// A POSIX error number, wrapping the raw `libc::c_int` value.
///
/// Kept as a thin newtype rather than a big enum so that codes from error
/// sources we don't enumerate by hand (e.g. passed through from a future
/// networking backend) still round-trip losslessly.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Errno(pub libc::c_int);

macro_rules! errno_consts {
    ($($name:ident),* $(,)?) => {
        impl Errno {
            $(
                #[allow(missing_docs)]
                pub const $name: Errno = Errno(libc::$name);
            )*
        }
    };
}

errno_consts!(
    ENOENT, ENOTDIR, EISDIR, EEXIST, ENAMETOOLONG, EACCES, EBADF, EINVAL, EMFILE, ENOMEM, EBUSY,
    ENOSYS, EOPNOTSUPP, ETIMEDOUT, EAGAIN, EINTR, EOVERFLOW, EPIPE, ENOTCONN, ECONNREFUSED,
    EADDRINUSE, EFAULT,
);

impl Errno {
    /// Build an `Errno` from a raw code, e.g. one read back off the wire.
    pub const fn from_raw(code: libc::c_int) -> Self {
        Errno(code)
    }

    /// The raw `libc::c_int` value.
    pub const fn code(self) -> libc::c_int {
        self.0
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({})", self.0)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SAFETY: strerror returns a pointer to a static/thread-local buffer
        // that is valid at least until the next call to strerror.
        let msg = unsafe {
            let ptr = libc::strerror(self.0);
            std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
        };
        write!(f, "{msg} (errno {})", self.0)
    }
}

impl std::error::Error for Errno {}

impl From<Errno> for i32 {
    fn from(e: Errno) -> i32 {
        -e.0
    }
}

impl From<Errno> for i64 {
    fn from(e: Errno) -> i64 {
        -(e.0 as i64)
    }
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, Errno>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negates_at_boundary() {
        let e = Errno::ENOENT;
        let code: i32 = e.into();
        assert_eq!(code, -libc::ENOENT);
    }

    #[test]
    fn displays_strerror_text() {
        let msg = format!("{}", Errno::EEXIST);
        assert!(msg.contains("errno"));
    }
}
