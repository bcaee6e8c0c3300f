//! Mount a host directory into an `Imfs` via `PRELOADS`, list it back out,
//! and optionally dump it to a second host directory on exit — the
//! preload/dump analogue of `fuser`'s `passthrough`/`xmp` examples, which
//! pass every FUSE call straight through to an underlying host directory.

use clap::Parser;
use imfs::fs::Imfs;
use imfs::preload;
use std::path::PathBuf;

#[derive(Parser)]
struct Args {
    /// Host path to preload, mounted at the identical IMFS path (overrides
    /// PRELOADS, which takes a newline-separated list of such paths).
    #[clap(long)]
    mount: Option<PathBuf>,

    /// If set, dump the mounted tree back out here after listing it.
    #[clap(long)]
    dump_to: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let host_paths = match &args.mount {
        Some(path) => vec![path.clone()],
        None => preload::preloads_from_env(),
    };

    if host_paths.is_empty() {
        eprintln!("nothing to preload: pass --mount /some/host/dir or set PRELOADS");
        std::process::exit(1);
    }

    let fs = Imfs::new();
    const CAGE: u64 = 1;

    for host_path in &host_paths {
        let Some(mount_path) = host_path.to_str() else {
            eprintln!("skipping non-UTF-8 host path {}", host_path.display());
            continue;
        };

        if let Err(e) = preload::load(&fs, CAGE, host_path, mount_path) {
            eprintln!("failed to preload {}: {e}", host_path.display());
            continue;
        }

        let mut stream = fs.opendir(CAGE, mount_path).expect("just mounted this directory");
        println!("{mount_path}:");
        while let Some((name, ino)) = fs.readdir(&mut stream) {
            println!("  {ino:>6}  {name}");
        }
        fs.closedir(stream);

        if let Some(dump_to) = &args.dump_to {
            if let Err(e) = preload::dump(&fs, CAGE, mount_path, dump_to) {
                eprintln!("failed to dump {mount_path}: {e}");
            }
        }
    }
}
