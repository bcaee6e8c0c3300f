//! The three primitives at the guest-host ABI boundary (spec §4.7):
//! `make_threei_call`, `register_handler`, `copy_data_between_cages`.
//!
//! Each is documented as "a thin marshalling shim over the `lind-syscall`
//! import"; `register_handler` and `copy_data_between_cages` are layered on
//! top of it through two Lind-specific pseudo-syscall numbers that are not
//! part of the Linux x86-64 table in `abi::syscall_num` (those are real
//! Linux syscalls the grate *intercepts*; these two are calls *into* the
//! host's own bookkeeping).
//!
//! On `wasm32` this module only marshals arguments through
//! [`abi::host::lind_syscall`] — the host is the sole source of truth for
//! registration and cross-cage copies (spec §1 scope exclusion). On other
//! targets, a process-local simulation backs the same API so the handler
//! routing and cross-cage copy behavior (P9, P10) are exercisable by this
//! crate's own test suite.

use crate::abi::{self, host, LINDABORT, UNUSED_ARG};
use crate::error::Errno;

const REGISTER_HANDLER_CALL: u32 = 0xFFFF_0001;
const COPY_DATA_BETWEEN_CAGES_CALL: u32 = 0xFFFF_0002;

/// One (value, owning-cage-id) argument pair, as carried by a 3i call.
pub type Arg = (u64, u64);

/// `copy_data_between_cages`'s copy semantics.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CopyType {
    /// Copy exactly `length` bytes.
    Exact = 0,
    /// Copy up to `length` bytes, stopping at (and including) the first NUL.
    CString = 1,
}

impl CopyType {
    fn from_raw(v: u64) -> Self {
        if v == 1 {
            CopyType::CString
        } else {
            CopyType::Exact
        }
    }
}

/// Issue a 3i call. If `translate_errno` is set and the host's return value
/// is negative, this returns `-1` (the `errno` value is recoverable via the
/// returned `Err`); otherwise the raw host return value is passed through.
pub fn make_threei_call(
    syscall_num: u32,
    syscall_name: &str,
    self_cage: u64,
    target_cage: u64,
    args: [Arg; 6],
    translate_errno: bool,
) -> i64 {
    let mut callname_hash = 0u64;
    for byte in syscall_name.bytes() {
        callname_hash = callname_hash.wrapping_mul(31).wrapping_add(byte as u64);
    }

    let packed: [u64; 6] = [
        args[0].0, args[1].0, args[2].0, args[3].0, args[4].0, args[5].0,
    ];
    let _ = (self_cage, target_cage, args); // argument cage ids travel with the call at the host level

    let ret = host::lind_syscall(syscall_num, callname_hash, packed) as i64;

    if translate_errno && ret < 0 {
        -1
    } else {
        ret
    }
}

/// Register (`flag != 0`) or deregister (`flag == 0`) a handler for
/// `target_syscall_num` issued by `target_cage`, to be routed to
/// `grate_cage_id`'s exported dispatcher invoking `handler_fn_ptr`.
pub fn register_handler(
    target_cage: u64,
    target_syscall_num: u32,
    flag: u32,
    grate_cage_id: u64,
    handler_fn_ptr: u64,
) -> i32 {
    #[cfg(not(target_arch = "wasm32"))]
    sim::register_handler(target_cage, target_syscall_num, flag, grate_cage_id, handler_fn_ptr);

    let args: [Arg; 6] = [
        (target_syscall_num as u64, target_cage),
        (flag as u64, 0),
        (grate_cage_id, 0),
        (handler_fn_ptr, grate_cage_id),
        (UNUSED_ARG, 0),
        (UNUSED_ARG, 0),
    ];
    make_threei_call(
        REGISTER_HANDLER_CALL,
        "register_handler",
        target_cage,
        target_cage,
        args,
        false,
    ) as i32
}

/// Copy bytes between two cages' linear memories. Never reads or writes
/// cross-cage memory by any other path (spec §5).
pub fn copy_data_between_cages(
    current_cage: u64,
    owning_cage: u64,
    src_addr: u64,
    src_cage: u64,
    dst_addr: u64,
    dst_cage: u64,
    length: u64,
    copy_type: u64,
) -> u32 {
    #[cfg(not(target_arch = "wasm32"))]
    if let Err(violation) = sim::copy_data_between_cages(
        src_cage,
        src_addr,
        dst_cage,
        dst_addr,
        length,
        CopyType::from_raw(copy_type),
    ) {
        return violation;
    }

    let args: [Arg; 6] = [
        (src_addr, src_cage),
        (dst_addr, dst_cage),
        (length, 0),
        (copy_type, 0),
        (UNUSED_ARG, 0),
        (UNUSED_ARG, 0),
    ];
    let ret = make_threei_call(
        COPY_DATA_BETWEEN_CAGES_CALL,
        "copy_data_between_cages",
        current_cage,
        owning_cage,
        args,
        false,
    );

    if ret < 0 { LINDABORT } else { 0 }
}

/// Reserved handler-table entry.
#[derive(Clone, Copy, Debug)]
pub struct Registration {
    pub grate_cage_id: u64,
    pub handler_fn_ptr: u64,
}

/// Errno helper: translate a raw host return value the way
/// `make_threei_call(.., translate_errno = true)` would.
pub fn errno_from_ret(ret: i64) -> Option<Errno> {
    if ret < 0 {
        Some(Errno::from_raw(-ret as libc::c_int))
    } else {
        None
    }
}

/// Process-local simulation of host-side handler routing and cross-cage
/// memory, used so this crate's tests can exercise P9/P10 without a real
/// wasmtime host. Not compiled into `wasm32` builds — there, these
/// responsibilities genuinely belong to the host (spec §1).
#[cfg(not(target_arch = "wasm32"))]
pub mod sim {
    use super::{abi, CopyType};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    static HANDLERS: Mutex<Option<HashMap<(u64, u32), super::Registration>>> = Mutex::new(None);
    static MEMORIES: Mutex<Option<HashMap<u64, Vec<u8>>>> = Mutex::new(None);

    fn handlers() -> parking_lot::MappedMutexGuard<'static, HashMap<(u64, u32), super::Registration>> {
        let mut guard = HANDLERS.lock();
        if guard.is_none() {
            *guard = Some(HashMap::new());
        }
        parking_lot::MutexGuard::map(guard, |opt| opt.as_mut().unwrap())
    }

    fn memories() -> parking_lot::MappedMutexGuard<'static, HashMap<u64, Vec<u8>>> {
        let mut guard = MEMORIES.lock();
        if guard.is_none() {
            *guard = Some(HashMap::new());
        }
        parking_lot::MutexGuard::map(guard, |opt| opt.as_mut().unwrap())
    }

    pub fn register_handler(
        target_cage: u64,
        target_syscall_num: u32,
        flag: u32,
        grate_cage_id: u64,
        handler_fn_ptr: u64,
    ) {
        let mut table = handlers();
        if flag == 0 {
            table.remove(&(target_cage, target_syscall_num));
        } else {
            table.insert(
                (target_cage, target_syscall_num),
                super::Registration {
                    grate_cage_id,
                    handler_fn_ptr,
                },
            );
        }
    }

    /// Look up the handler registered for `(cage, syscall_num)`, if any.
    pub fn lookup(cage: u64, syscall_num: u32) -> Option<super::Registration> {
        handlers().get(&(cage, syscall_num)).copied()
    }

    /// Ensure a cage's simulated linear memory exists and is at least
    /// `len` bytes, growing it with zeroes if needed.
    pub fn ensure_memory(cage: u64, len: usize) {
        let mut mems = memories();
        let buf = mems.entry(cage).or_default();
        if buf.len() < len {
            buf.resize(len, 0);
        }
    }

    /// Write `data` at `addr` in `cage`'s simulated memory.
    pub fn write_memory(cage: u64, addr: u64, data: &[u8]) {
        let end = addr as usize + data.len();
        ensure_memory(cage, end);
        let mut mems = memories();
        let buf = mems.get_mut(&cage).unwrap();
        buf[addr as usize..end].copy_from_slice(data);
    }

    /// Read `len` bytes at `addr` from `cage`'s simulated memory.
    pub fn read_memory(cage: u64, addr: u64, len: usize) -> Vec<u8> {
        ensure_memory(cage, addr as usize + len);
        let mems = memories();
        let buf = &mems[&cage];
        buf[addr as usize..addr as usize + len].to_vec()
    }

    pub(super) fn copy_data_between_cages(
        src_cage: u64,
        src_addr: u64,
        dst_cage: u64,
        dst_addr: u64,
        length: u64,
        copy_type: CopyType,
    ) -> Result<(), u32> {
        let length = length as usize;
        ensure_memory(src_cage, src_addr as usize + length);

        let data = read_memory(src_cage, src_addr, length);
        let to_copy: &[u8] = match copy_type {
            CopyType::Exact => &data,
            CopyType::CString => match data.iter().position(|&b| b == 0) {
                Some(pos) => &data[..=pos],
                None => &data,
            },
        };
        write_memory(dst_cage, dst_addr, to_copy);
        let _ = abi::UNUSED_ARG;
        Ok(())
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup_then_deregister() {
        register_handler(5, 107, 1, 9, 0x4000);
        let reg = sim::lookup(5, 107).expect("registered");
        assert_eq!(reg.grate_cage_id, 9);

        register_handler(5, 107, 0, 9, 0x4000);
        assert!(sim::lookup(5, 107).is_none());
    }

    #[test]
    fn exact_copy_moves_all_bytes() {
        sim::write_memory(1, 0, b"hello world");
        // (current_cage, owning_cage, src_addr, src_cage, dst_addr, dst_cage, length, copy_type)
        let violation = copy_data_between_cages(1, 1, 0, 1, 100, 100, 11, 0);
        assert_eq!(violation, 0);
        assert_eq!(sim::read_memory(100, 100, 11), b"hello world");
    }

    #[test]
    fn cstring_copy_stops_at_nul() {
        sim::write_memory(2, 0, b"abc\0ignored");
        let violation = copy_data_between_cages(2, 2, 0, 2, 200, 200, 11, 1);
        assert_eq!(violation, 0);
        assert_eq!(sim::read_memory(200, 200, 4), b"abc\0");
    }
}
