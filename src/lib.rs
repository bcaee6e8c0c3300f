//! An in-memory POSIX-like filesystem and grate interposition layer for
//! sandboxed cages (spec §1).
//!
//! [`fs::Imfs`] is the filesystem core: a bounded node pool, per-cage
//! file-descriptor tables, and the POSIX-shaped operations built on top of
//! them (open/read/write/mkdir/pipe/...). [`threei`] and [`dispatch`]
//! implement the three-party call convention a grate uses to interpose on
//! another cage's syscalls; [`grate`] wires that together with process
//! lifecycle (fork/exec/wait) and [`preload`] (bulk host <-> IMFS transfer
//! at startup/shutdown).
//!
//! [`abi`] types the single `lind-syscall` host import this core's own
//! guest-side code would use on `wasm32`; on every other target it is
//! backed by an in-process simulation so the crate's test suite can
//! exercise handler routing and cross-cage copies without a real host.

pub mod abi;
pub mod address;
pub mod dispatch;
pub mod error;
pub mod fd;
pub mod flags;
pub mod fs;
pub mod grate;
pub mod node;
pub mod path;
pub mod pipe;
pub mod preload;
pub mod threei;

pub use error::{Errno, Result};
pub use fs::Imfs;
