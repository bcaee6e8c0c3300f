//! The grate syscall dispatcher (spec §4.7, §8 scenario 6).
//!
//! A grate intercepts syscalls issued by the cages it watches by
//! registering one handler per `(cage, syscall_num)` pair through
//! [`crate::threei::register_handler`]. When the host routes an intercepted
//! syscall back into the grate, it arrives here with the calling cage's id
//! and the original 3i arguments; [`Dispatcher::route`] finds the
//! registered handler and invokes it, translating a missing registration
//! into `ENOSYS` the same way an un-interposed syscall would fail.
//!
//! [`dispatcher`] is the literal entry point the host invokes (spec §4.8):
//! it takes the raw `handler_fn_ptr` the host hands back and tail-calls it,
//! rejecting a null pointer with `-1` before ever dereferencing it.
//! `handler_fn_ptr` in the 3i call is, on the real host, an index into the
//! grate's exported wasm table; here it is the address of an `extern "C"`
//! function, the closest non-wasm32 stand-in for "a pointer the host can
//! later invoke." [`Dispatcher`] sits above that: it keeps the actual Rust
//! closure a grate author writes and only forwards the bookkeeping (cage,
//! syscall number, a synthetic handler id standing in for `handler_fn_ptr`)
//! through `register_handler` — enough for this crate's own tests to
//! exercise interposition end to end without a real wasm table.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::Errno;
use crate::threei::{self, Arg};

/// A registered syscall interposition handler: receives the calling cage's
/// id and the six 3i argument pairs, returns the raw (non-negated) 3i
/// return value.
pub type HandlerFn = dyn Fn(u64, [Arg; 6]) -> i64 + Send + Sync;

/// One grate's table of intercepted `(cage, syscall_num)` handlers.
pub struct Dispatcher {
    grate_cage_id: u64,
    next_handler_id: Mutex<u64>,
    handlers: Mutex<HashMap<(u64, u32), Arc<HandlerFn>>>,
}

impl Dispatcher {
    pub fn new(grate_cage_id: u64) -> Self {
        Dispatcher {
            grate_cage_id,
            next_handler_id: Mutex::new(1),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn grate_cage_id(&self) -> u64 {
        self.grate_cage_id
    }

    /// Register `handler` to intercept `syscall_num` issued by `target_cage`.
    pub fn intercept<F>(&self, target_cage: u64, syscall_num: u32, handler: F)
    where
        F: Fn(u64, [Arg; 6]) -> i64 + Send + Sync + 'static,
    {
        let handler_id = {
            let mut next = self.next_handler_id.lock();
            let id = *next;
            *next += 1;
            id
        };

        threei::register_handler(target_cage, syscall_num, 1, self.grate_cage_id, handler_id);
        self.handlers
            .lock()
            .insert((target_cage, syscall_num), Arc::new(handler));
        debug!(
            "grate {} now intercepting syscall {syscall_num} from cage {target_cage}",
            self.grate_cage_id
        );
    }

    /// Remove a previously registered interposition.
    pub fn stop_intercepting(&self, target_cage: u64, syscall_num: u32) {
        threei::register_handler(target_cage, syscall_num, 0, self.grate_cage_id, 0);
        self.handlers.lock().remove(&(target_cage, syscall_num));
    }

    /// Route an intercepted call from `calling_cage` to its registered
    /// handler. Returns `-ENOSYS` (negated, ready to hand back to the
    /// caller as a raw return value) if nothing is registered.
    pub fn route(&self, calling_cage: u64, syscall_num: u32, args: [Arg; 6]) -> i64 {
        let handler = self.handlers.lock().get(&(calling_cage, syscall_num)).cloned();
        match handler {
            Some(handler) => handler(calling_cage, args),
            None => {
                warn!("no handler registered for syscall {syscall_num} from cage {calling_cage}");
                i64::from(Errno::ENOSYS)
            }
        }
    }
}

/// The raw handler signature a real host invokes through [`dispatcher`]
/// (spec §4.8): `fn(cage_id, arg1, arg1_cage, …, arg6, arg6_cage) -> i64`.
pub type RawHandler = extern "C" fn(
    u64, u64, u64, u64, u64, u64, u64, u64, u64, u64, u64, u64, u64,
) -> i64;

/// The well-known entry point the host invokes to route an intercepted
/// syscall into this grate (spec §4.8, §6 sentinel). Interprets
/// `handler_fn_ptr` as a pointer to a [`RawHandler`] and tail-calls it. A
/// null pointer is rejected with `-1` without ever being dereferenced.
pub fn dispatcher(
    handler_fn_ptr: u64,
    cage_id: u64,
    arg1: u64,
    arg1_cage: u64,
    arg2: u64,
    arg2_cage: u64,
    arg3: u64,
    arg3_cage: u64,
    arg4: u64,
    arg4_cage: u64,
    arg5: u64,
    arg5_cage: u64,
    arg6: u64,
    arg6_cage: u64,
) -> i64 {
    if handler_fn_ptr == 0 {
        warn!("dispatcher invoked with a null handler_fn_ptr");
        return -1;
    }

    let handler: RawHandler = unsafe { std::mem::transmute(handler_fn_ptr as usize) };
    handler(
        cage_id, arg1, arg1_cage, arg2, arg2_cage, arg3, arg3_cage, arg4, arg4_cage, arg5,
        arg5_cage, arg6, arg6_cage,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn unused_args() -> [Arg; 6] {
        [(0, 0); 6]
    }

    #[test]
    fn routes_to_registered_handler() {
        let dispatcher = Dispatcher::new(9);
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        dispatcher.intercept(5, 2, move |_cage, _args| {
            called_clone.store(true, Ordering::SeqCst);
            0
        });

        let ret = dispatcher.route(5, 2, unused_args());
        assert_eq!(ret, 0);
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn unregistered_syscall_is_enosys() {
        let dispatcher = Dispatcher::new(9);
        let ret = dispatcher.route(5, 99, unused_args());
        assert_eq!(ret, i64::from(Errno::ENOSYS));
    }

    #[test]
    fn stop_intercepting_removes_handler() {
        let dispatcher = Dispatcher::new(9);
        dispatcher.intercept(5, 2, |_cage, _args| 0);
        dispatcher.stop_intercepting(5, 2);
        assert_eq!(dispatcher.route(5, 2, unused_args()), i64::from(Errno::ENOSYS));
    }

    extern "C" fn sums_cage_and_args(
        cage_id: u64,
        arg1: u64,
        _arg1_cage: u64,
        arg2: u64,
        _arg2_cage: u64,
        _arg3: u64,
        _arg3_cage: u64,
        _arg4: u64,
        _arg4_cage: u64,
        _arg5: u64,
        _arg5_cage: u64,
        _arg6: u64,
        _arg6_cage: u64,
    ) -> i64 {
        (cage_id + arg1 + arg2) as i64
    }

    #[test]
    fn dispatcher_rejects_null_handler() {
        let ret = dispatcher(0, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0);
        assert_eq!(ret, -1);
    }

    #[test]
    fn dispatcher_tail_calls_the_handler() {
        let handler_fn_ptr = sums_cage_and_args as usize as u64;
        let ret = dispatcher(handler_fn_ptr, 3, 4, 0, 5, 0, 0, 0, 0, 0, 0, 0, 0, 0);
        assert_eq!(ret, 12);
    }
}
