//! Grate process lifecycle (spec §4.9): fork a child cage, let it run under
//! interposition, reap it, optionally preload/dump around the run.
//!
//! Mirrors the fork/exec/wait shape the host uses to launch a cage process,
//! the way `mnt::fuse_direct` forks an auto-unmount watchdog: `fork()`,
//! branch on `ForkResult`, the child replaces itself via `execvp` and never
//! returns, the parent records the pid and waits for it later.

use std::ffi::CString;
use std::path::PathBuf;

use log::{debug, error, info};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, fork, ForkResult, Pid};

use crate::dispatch::Dispatcher;
use crate::error::{Errno, Result};
use crate::fs::Imfs;
use crate::preload;

/// Identifies a cage that was forked as a child of the current process.
pub struct Cage {
    pub cage_id: u64,
    pid: Pid,
}

/// A single preload mount to set up before the cage's program runs, and
/// (optionally) dump back out after it exits.
pub struct Mount {
    pub host_path: PathBuf,
    pub mount_path: String,
    pub dump_on_exit: bool,
}

/// Fork and exec `program` with `args` as a new cage, after mounting every
/// entry in `mounts` into `imfs` under `cage_id`. The child never returns
/// from this function: on `execvp` failure it logs and exits with status
/// 127, matching the shell convention for "command not found".
pub fn spawn(
    imfs: &Imfs,
    cage_id: u64,
    program: &str,
    args: &[String],
    mounts: &[Mount],
) -> Result<Cage> {
    for mount in mounts {
        preload::load(imfs, cage_id, &mount.host_path, &mount.mount_path)?;
    }

    // SAFETY: the child branch only calls async-signal-safe functions
    // (execvp) before either succeeding or exiting, as required by fork(2)
    // in a multi-threaded process.
    match unsafe { fork() }.map_err(|_| Errno::EAGAIN)? {
        ForkResult::Child => {
            let c_program = CString::new(program).unwrap_or_default();
            let mut c_args: Vec<CString> = vec![c_program.clone()];
            c_args.extend(args.iter().map(|a| CString::new(a.as_str()).unwrap_or_default()));

            match execvp(&c_program, &c_args) {
                Ok(never) => match never {},
                Err(errno) => {
                    error!("execvp({program}) failed: {errno}");
                    std::process::exit(127);
                }
            }
        }
        ForkResult::Parent { child } => {
            info!("forked cage {cage_id} as pid {child}");
            Ok(Cage { cage_id, pid: child })
        }
    }
}

/// Wait for `cage` to exit, then run any dump-on-exit mounts back onto the
/// host, returning the child's exit status (spec §4.9 step 4).
pub fn wait_and_dump(imfs: &Imfs, cage: Cage, mounts: &[Mount]) -> Result<i32> {
    let status = waitpid(cage.pid, None).map_err(|_| Errno::EINVAL)?;
    let exit_code = match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => {
            debug!("cage {} killed by signal {signal}", cage.cage_id);
            128 + signal as i32
        }
        other => {
            debug!("cage {} ended with unexpected status {other:?}", cage.cage_id);
            -1
        }
    };

    for mount in mounts {
        if mount.dump_on_exit {
            if let Err(e) = preload::dump(imfs, cage.cage_id, &mount.mount_path, &mount.host_path) {
                error!("dump of {} failed: {e}", mount.mount_path);
            }
        }
    }

    Ok(exit_code)
}

/// Register every syscall a grate wants to interpose on for a target cage,
/// in one call, rather than repeating `intercept` calls at every call site.
pub fn attach_dispatcher<F>(dispatcher: &Dispatcher, target_cage: u64, syscalls: &[u32], handler: F)
where
    F: Fn(u64, [crate::threei::Arg; 6]) -> i64 + Send + Sync + Clone + 'static,
{
    for &syscall_num in syscalls {
        dispatcher.intercept(target_cage, syscall_num, handler.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_true_and_reap() {
        let imfs = Imfs::new();
        let cage = spawn(&imfs, 1, "/usr/bin/true", &[], &[]).unwrap();
        let code = wait_and_dump(&imfs, cage, &[]).unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn spawn_missing_program_exits_127() {
        let imfs = Imfs::new();
        let cage = spawn(&imfs, 2, "/nonexistent/not-a-real-binary", &[], &[]).unwrap();
        let code = wait_and_dump(&imfs, cage, &[]).unwrap();
        assert_eq!(code, 127);
    }
}
