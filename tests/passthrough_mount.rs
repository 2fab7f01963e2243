//! End-to-end mount tests, in the style of `tests/slow_fs.rs`: spawn a real
//! FUSE mount backed by a temp directory and drive it through `std::fs`.
//! Requires a working FUSE installation on the test host (same assumption
//! the teacher's own `tests/slow_fs.rs` makes).

use std::fs;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use fuser::MountOption;
use nas_emu_fuse::fault::{FaultInjector, FaultKind, FaultOp, FaultRule};
use nas_emu_fuse::passthrough::PassthroughFs;
use tempfile::tempdir;

fn spawn(backing: &std::path::Path, mount: &std::path::Path, injector: FaultInjector) -> fuser::BackgroundSession {
    let shutdown = Arc::new(AtomicBool::new(false));
    let fs = PassthroughFs::new(backing.to_path_buf(), Arc::new(injector), shutdown);
    fuser::spawn_mount(
        fs,
        mount,
        &[MountOption::FSName("nas-emu-fuse-test".to_string()), MountOption::AutoUnmount],
    )
    .expect("mount should succeed")
}

#[test]
fn no_fault_passthrough_roundtrip() {
    let backing = tempdir().unwrap();
    let mount = tempdir().unwrap();
    let session = spawn(backing.path(), mount.path(), FaultInjector::new(vec![], 1));

    fs::write(mount.path().join("a.txt"), b"hello\n").unwrap();
    std::thread::sleep(Duration::from_millis(50));
    let content = fs::read(mount.path().join("a.txt")).unwrap();
    assert_eq!(content, b"hello\n");
    assert_eq!(fs::read(backing.path().join("a.txt")).unwrap(), b"hello\n");

    drop(session);
}

#[test]
fn deterministic_error_injection_on_write() {
    let backing = tempdir().unwrap();
    let mount = tempdir().unwrap();
    let rule = FaultRule {
        ops: [FaultOp::Write].into_iter().collect(),
        path_glob: None,
        min_size: None,
        max_size: None,
        probability: 1.0,
        kind: FaultKind::Error { errno: libc::EIO },
        seed: None,
    };
    let session = spawn(backing.path(), mount.path(), FaultInjector::new(vec![rule], 1));

    let result = fs::write(mount.path().join("b.txt"), b"x");
    assert!(result.is_err());
    assert!(!backing.path().join("b.txt").exists());

    drop(session);
}

#[test]
fn short_write_truncates_to_ratio() {
    let backing = tempdir().unwrap();
    let mount = tempdir().unwrap();
    let rule = FaultRule {
        ops: [FaultOp::Write].into_iter().collect(),
        path_glob: None,
        min_size: None,
        max_size: None,
        probability: 1.0,
        kind: FaultKind::ShortIo { ratio: 0.5 },
        seed: None,
    };
    let session = spawn(backing.path(), mount.path(), FaultInjector::new(vec![rule], 1));

    let data = vec![7u8; 1024];
    // A short write looks like a partial write to the caller; std::fs::write
    // would error on a short return, so use a raw File::write to observe it.
    {
        use std::io::Write;
        let mut f = fs::File::create(mount.path().join("c.bin")).unwrap();
        let n = f.write(&data).unwrap();
        assert_eq!(n, 512);
    }
    std::thread::sleep(Duration::from_millis(50));
    let backing_meta = fs::metadata(backing.path().join("c.bin")).unwrap();
    assert_eq!(backing_meta.len(), 512);

    drop(session);
}
