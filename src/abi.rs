//! The host ABI contract (spec §6) and the Linux x86-64 syscall-number
//! subset the core understands.
//!
//! The host runtime itself is out of scope (spec §1): this module only
//! types the import surface it presents to a cage. On `wasm32` targets
//! these are real wasm imports from the `lind` module; on any other target
//! (i.e. running the core's own test suite on the host) they are backed by
//! a deterministic in-process stand-in so the rest of the crate can be
//! exercised without a wasmtime host.

/// Sentinel filled into unused 3i argument slots.
pub const UNUSED_ARG: u64 = 0xDEAD_BEEF_DEAD_BEEF;
/// Returned by `copy_data_between_cages` on a cross-cage access policy
/// violation ("LINDABORT").
pub const LINDABORT: u32 = 0xE001_0001;

/// Linux x86-64 syscall numbers for the subset this core handles (spec §6).
pub mod syscall_num {
    pub const READ: u32 = 0;
    pub const WRITE: u32 = 1;
    pub const OPEN: u32 = 2;
    pub const CLOSE: u32 = 3;
    pub const STAT: u32 = 4;
    pub const FSTAT: u32 = 5;
    pub const LSTAT: u32 = 6;
    pub const LSEEK: u32 = 8;
    pub const MMAP: u32 = 9;
    pub const MUNMAP: u32 = 11;
    pub const BRK: u32 = 12;
    pub const RT_SIGACTION: u32 = 13;
    pub const RT_SIGPROCMASK: u32 = 14;
    pub const PIPE: u32 = 22;
    pub const DUP: u32 = 32;
    pub const DUP2: u32 = 33;
    pub const FCNTL: u32 = 72;
    pub const GETEUID: u32 = 107;
    pub const RENAME: u32 = 82;
    pub const MKDIR: u32 = 83;
    pub const RMDIR: u32 = 84;
    pub const UNLINK: u32 = 87;
    pub const FORK: u32 = 57;
    pub const EXECVE: u32 = 59;
    pub const WAITPID: u32 = 61;
    pub const CLOCK_GETTIME: u32 = 228;
    pub const CLOCK_GETTIME_ALT: u32 = 191;
    pub const FUTEX: u32 = 202;
    pub const SBRK: u32 = 1004;
}

/// The raw `lind-syscall` import and its three siblings, typed as a normal
/// Rust function boundary (spec §6 table).
pub mod host {
    #[cfg(target_arch = "wasm32")]
    #[link(wasm_import_module = "lind")]
    unsafe extern "C" {
        #[link_name = "lind-syscall"]
        fn lind_syscall_raw(
            callnum: u32,
            callname: u64,
            arg1: u64,
            arg2: u64,
            arg3: u64,
            arg4: u64,
            arg5: u64,
            arg6: u64,
        ) -> i32;

        #[link_name = "lind-get-memory-base"]
        fn lind_get_memory_base_raw() -> u64;

        #[link_name = "lind-get-cage-id"]
        fn lind_get_cage_id_raw() -> u64;

        #[link_name = "debug-panic"]
        fn debug_panic_raw(msg_host_addr: u64);
    }

    /// Issue the generic syscall trap. A negative return means `-errno`.
    #[cfg(target_arch = "wasm32")]
    pub fn lind_syscall(
        callnum: u32,
        callname: u64,
        args: [u64; 6],
    ) -> i32 {
        unsafe {
            lind_syscall_raw(
                callnum, callname, args[0], args[1], args[2], args[3], args[4], args[5],
            )
        }
    }

    #[cfg(target_arch = "wasm32")]
    pub fn lind_get_memory_base(_cage_id: u64) -> u64 {
        unsafe { lind_get_memory_base_raw() }
    }

    #[cfg(target_arch = "wasm32")]
    pub fn lind_get_cage_id() -> u64 {
        unsafe { lind_get_cage_id_raw() }
    }

    #[cfg(target_arch = "wasm32")]
    pub fn debug_panic(msg_host_addr: u64) {
        unsafe { debug_panic_raw(msg_host_addr) }
    }

    /// Host-side stand-in used only when the core (or its tests) run on a
    /// non-wasm32 target: there is no real cage memory to find a base
    /// address for, so each cage is given a synthetic, stable base derived
    /// from its id. This never executes on the real sandbox.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn lind_syscall(_callnum: u32, _callname: u64, _args: [u64; 6]) -> i32 {
        -libc::ENOSYS
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub fn lind_get_memory_base(cage_id: u64) -> u64 {
        cage_id.wrapping_mul(0x1_0000_0000)
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub fn lind_get_cage_id() -> u64 {
        std::process::id() as u64
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub fn debug_panic(msg_host_addr: u64) {
        log::error!("debug-panic from guest, message at host addr {msg_host_addr:#x}");
    }
}
