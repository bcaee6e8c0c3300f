//! End-to-end scenarios exercising the public `Imfs` surface the way a cage
//! (or a test harness standing in for one) would (spec §8).

use imfs::fs::{whence, Imfs, O_CREAT, O_RDONLY, O_RDWR, O_WRONLY};
use imfs::threei::copy_data_between_cages;

#[test]
fn create_and_read() {
    let fs = Imfs::new();
    let fd = fs.open(1, "/a.txt", O_CREAT | O_WRONLY, 0o777).unwrap();
    assert_eq!(fs.write(1, fd, b"hi").unwrap(), 2);
    fs.close(1, fd).unwrap();

    let fd = fs.open(1, "/a.txt", O_RDONLY, 0).unwrap();
    let mut buf = [0u8; 2];
    assert_eq!(fs.read(1, fd, &mut buf).unwrap(), 2);
    assert_eq!(&buf, b"hi");
}

#[test]
fn dup_offset() {
    let fs = Imfs::new();
    let fd = fs.open(1, "/b", O_CREAT | O_RDWR, 0o777).unwrap();
    fs.write(1, fd, b"0123456789").unwrap();
    fs.lseek(1, fd, 0, whence::SEEK_SET).unwrap();
    fs.dup2(1, fd, 100).unwrap();

    let mut buf = [0u8; 5];
    assert_eq!(fs.read(1, 100, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"01234");

    assert_eq!(fs.read(1, fd, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"56789");
}

#[test]
fn unlink_while_open() {
    let fs = Imfs::new();
    let fd = fs.open(1, "/c", O_CREAT | O_RDWR, 0o777).unwrap();
    fs.write(1, fd, b"xyz").unwrap();
    fs.unlink(1, "/c").unwrap();
    fs.lseek(1, fd, 0, whence::SEEK_SET).unwrap();

    let mut buf = [0u8; 3];
    assert_eq!(fs.read(1, fd, &mut buf).unwrap(), 3);
    assert_eq!(&buf, b"xyz");

    let err = fs.open(1, "/c", O_RDONLY, 0).unwrap_err();
    assert_eq!(err.code(), libc::ENOENT);
}

#[test]
fn mkdir_then_stat() {
    let fs = Imfs::new();
    fs.mkdir(1, "/d", 0o755).unwrap();
    let st = fs.stat(1, "/d").unwrap();
    assert_eq!(st.mode & libc::S_IFMT, libc::S_IFDIR);
    assert_eq!(st.size, 0);
}

#[test]
fn pipe_echo() {
    let fs = Imfs::new();
    let [read_fd, write_fd] = fs.pipe(1).unwrap();
    fs.write(1, write_fd, b"abc").unwrap();
    let mut buf = [0u8; 3];
    assert_eq!(fs.read(1, read_fd, &mut buf).unwrap(), 3);
    assert_eq!(&buf, b"abc");
}

#[test]
fn grate_intercept() {
    use imfs::dispatch::Dispatcher;

    const GETEUID: u32 = 107;
    const CALLING_CAGE: u64 = 3;
    const GRATE_CAGE: u64 = 9;

    let dispatcher = Dispatcher::new(GRATE_CAGE);
    dispatcher.intercept(CALLING_CAGE, GETEUID, |_cage, _args| 10);
    assert!(imfs::threei::sim::lookup(CALLING_CAGE, GETEUID).is_some());

    let args = [(0u64, 0u64); 6];
    assert_eq!(dispatcher.route(CALLING_CAGE, GETEUID, args), 10);

    dispatcher.stop_intercepting(CALLING_CAGE, GETEUID);
    assert!(imfs::threei::sim::lookup(CALLING_CAGE, GETEUID).is_none());
    assert_eq!(
        dispatcher.route(CALLING_CAGE, GETEUID, args),
        i64::from(imfs::Errno::ENOSYS)
    );
}

#[test]
fn cross_cage_copy_exact_and_cstring() {
    imfs::threei::sim::write_memory(10, 0, b"payload!!!!");
    let violation = copy_data_between_cages(10, 10, 0, 10, 50, 50, 11, 0);
    assert_eq!(violation, 0);
    assert_eq!(imfs::threei::sim::read_memory(50, 50, 11), b"payload!!!!");

    imfs::threei::sim::write_memory(11, 0, b"trunc\0after");
    let violation = copy_data_between_cages(11, 11, 0, 11, 60, 60, 11, 1);
    assert_eq!(violation, 0);
    assert_eq!(imfs::threei::sim::read_memory(60, 60, 6), b"trunc\0");
}

#[test]
fn preload_then_dump_preserves_tree() {
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("note.txt"), b"remember this").unwrap();

    let fs = Imfs::new();
    imfs::preload::load(&fs, 1, src.path(), "/mnt").unwrap();

    let fd = fs.open(1, "/mnt/note.txt", O_RDONLY, 0).unwrap();
    let mut buf = [0u8; 13];
    fs.read(1, fd, &mut buf).unwrap();
    assert_eq!(&buf, b"remember this");

    let dst = tempfile::tempdir().unwrap();
    imfs::preload::dump(&fs, 1, "/mnt", dst.path()).unwrap();
    assert_eq!(std::fs::read(dst.path().join("note.txt")).unwrap(), b"remember this");
}

#[test]
fn preloads_env_mounts_each_host_path_at_the_identical_path() {
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("note.txt"), b"remember this").unwrap();
    let host_path = src.path().to_str().unwrap().to_string();

    let preloads = imfs::preload::parse_preloads(&format!("{host_path}\n"));
    assert_eq!(preloads, vec![std::path::PathBuf::from(&host_path)]);

    let fs = Imfs::new();
    imfs::preload::load_all(&fs, 1, &preloads).unwrap();

    let note_path = format!("{}/note.txt", host_path.trim_end_matches('/'));
    let fd = fs.open(1, &note_path, O_RDONLY, 0).unwrap();
    let mut buf = [0u8; 13];
    fs.read(1, fd, &mut buf).unwrap();
    assert_eq!(&buf, b"remember this");
}

#[test]
fn dispatcher_routes_registered_syscall_and_falls_back() {
    use imfs::dispatch::Dispatcher;

    let dispatcher = Dispatcher::new(9);
    dispatcher.intercept(3, 107, |_cage, _args| 10);

    let args = [(0u64, 0u64); 6];
    assert_eq!(dispatcher.route(3, 107, args), 10);

    dispatcher.stop_intercepting(3, 107);
    assert_eq!(dispatcher.route(3, 107, args), i64::from(imfs::Errno::ENOSYS));
}
