//! A minimal grate that interposes on `open`/`openat` for a target cage,
//! logging every call before letting the underlying IMFS handle it.
//!
//! Mirrors the shape of `original_source/imfs_grate/open_grate.c`: register
//! one handler per watched syscall, log the call with its arguments (the
//! `0xdeadbeefdeadbeef` sentinel marking unused slots), then forward to the
//! real filesystem operation.

use clap::Parser;
use imfs::abi::syscall_num;
use imfs::dispatch::Dispatcher;
use imfs::fs::{Imfs, O_CREAT, O_RDONLY};
use imfs::threei::Arg;
use std::sync::Arc;

#[derive(Parser)]
struct Args {
    /// Cage id this grate watches.
    #[clap(long, default_value_t = 1)]
    target_cage: u64,

    /// Cage id this grate itself runs as.
    #[clap(long, default_value_t = 9)]
    grate_cage: u64,
}

fn log_call(name: &str, args: &[Arg; 6], ret: i64) {
    let rendered: Vec<String> = args
        .iter()
        .filter(|(value, _)| *value != imfs::abi::UNUSED_ARG)
        .map(|(value, _)| value.to_string())
        .collect();
    log::info!("{name}({}) = {ret}", rendered.join(", "));
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let fs = Arc::new(Imfs::new());
    let dispatcher = Dispatcher::new(args.grate_cage);

    {
        let fs = fs.clone();
        dispatcher.intercept(args.target_cage, syscall_num::OPEN, move |cage, call_args| {
            let ret = fs.open(cage, "/grate-demo.txt", O_CREAT | O_RDONLY, 0o644).map(|fd| fd as i64).unwrap_or(-1);
            log_call("open", &call_args, ret);
            ret
        });
    }

    let probe_args: [Arg; 6] = [(0, 0); 6];
    dispatcher.route(args.target_cage, syscall_num::OPEN, probe_args);
}
