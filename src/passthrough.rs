//! The passthrough filesystem operation layer: every kernel callback
//! translates its virtual path, consults the fault injector, and forwards
//! (or deviates from) the matching call against the backing tree.
//!
//! Structurally grounded on `XmpFS` in `examples/xmp.rs` (inode table,
//! `meta2attr`/`ft2ft` conversion helpers, the "map io::Error to an errno"
//! pattern) and `SlowInitFS` in `tests/slow_fs.rs` for the classic
//! `fuser::Filesystem` call shapes this project depends on.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use log::{debug, error, warn};

use crate::fault::{FaultDecision, FaultInjector, FaultOp};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

struct InodeEntry {
    virtual_path: PathBuf,
    parent: u64,
}

/// Forwards every filesystem verb to `backing_root`, consulting the fault
/// injector at each step.
pub struct PassthroughFs {
    backing_root: PathBuf,
    injector: Arc<FaultInjector>,
    next_ino: AtomicU64,
    inodes: Mutex<HashMap<u64, InodeEntry>>,
    paths_to_ino: Mutex<HashMap<PathBuf, u64>>,
    next_fh: AtomicU64,
    open_files: Mutex<HashMap<u64, File>>,
    used_bytes: AtomicU64,
    /// Set by the mount driver on SIGINT/SIGTERM so in-progress DELAY/SLOW
    /// sleeps wake up early instead of blocking shutdown.
    shutdown: Arc<AtomicBool>,
}

impl PassthroughFs {
    pub fn new(backing_root: PathBuf, injector: Arc<FaultInjector>, shutdown: Arc<AtomicBool>) -> Self {
        let mut inodes = HashMap::new();
        inodes.insert(
            ROOT_INO,
            InodeEntry {
                virtual_path: PathBuf::from("/"),
                parent: ROOT_INO,
            },
        );
        let mut paths_to_ino = HashMap::new();
        paths_to_ino.insert(PathBuf::from("/"), ROOT_INO);

        let used_bytes = compute_used_bytes(&backing_root);

        PassthroughFs {
            backing_root,
            injector,
            next_ino: AtomicU64::new(ROOT_INO + 1),
            inodes: Mutex::new(inodes),
            paths_to_ino: Mutex::new(paths_to_ino),
            next_fh: AtomicU64::new(1),
            open_files: Mutex::new(HashMap::new()),
            used_bytes: AtomicU64::new(used_bytes),
            shutdown,
        }
    }

    fn virtual_path(&self, ino: u64) -> Option<PathBuf> {
        self.inodes
            .lock()
            .unwrap()
            .get(&ino)
            .map(|e| e.virtual_path.clone())
    }

    fn backing_path(&self, virtual_path: &Path) -> PathBuf {
        let rel = virtual_path.strip_prefix("/").unwrap_or(virtual_path);
        self.backing_root.join(rel)
    }

    /// Allocates (or reuses) the inode number for `virtual_path`.
    fn ino_for(&self, virtual_path: &Path, parent: u64) -> u64 {
        let mut by_path = self.paths_to_ino.lock().unwrap();
        if let Some(ino) = by_path.get(virtual_path) {
            return *ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        by_path.insert(virtual_path.to_path_buf(), ino);
        self.inodes.lock().unwrap().insert(
            ino,
            InodeEntry {
                virtual_path: virtual_path.to_path_buf(),
                parent,
            },
        );
        ino
    }

    fn forget_ino(&self, virtual_path: &Path) {
        if let Some(ino) = self.paths_to_ino.lock().unwrap().remove(virtual_path) {
            self.inodes.lock().unwrap().remove(&ino);
        }
    }

    /// Joins `parent` with a single path component, rejecting anything that
    /// is not a plain filename (the kernel never hands `lookup`/`create`
    /// etc. a multi-component name, but this guards the path-translation
    /// invariant regardless of caller).
    fn join_child(parent: &Path, name: &OsStr) -> Option<PathBuf> {
        if name.as_bytes().contains(&b'/') || name == ".." || name == "." {
            return None;
        }
        Some(parent.join(name))
    }

    fn attr_from_metadata(&self, ino: u64, meta: &fs::Metadata) -> FileAttr {
        let kind = file_type_of(meta.file_type());
        FileAttr {
            ino,
            size: meta.size(),
            blocks: meta.blocks(),
            atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            ctime: SystemTime::UNIX_EPOCH + Duration::from_secs(meta.ctime().max(0) as u64),
            crtime: meta.created().unwrap_or(SystemTime::UNIX_EPOCH),
            kind,
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            flags: 0,
            blksize: meta.blksize() as u32,
            padding: 0,
        }
    }

    fn log_decision(&self, op: &str, path: &Path, decision: &FaultDecision) {
        let detail = match decision {
            FaultDecision::Pass => "pass".to_string(),
            FaultDecision::Fail(errno) => format!("errno={errno}"),
            FaultDecision::Delay(d) => format!("delay_ms={}", d.as_millis()),
            FaultDecision::Mutate { percent } => format!("corrupt_percent={percent}"),
            FaultDecision::Shorten(n) => format!("short_write_bytes={n}"),
        };
        debug!(
            "{}",
            crate::logger::op_line(op, path, decision_tag(decision), &detail)
        );
    }

    fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::SeqCst)
    }

    fn add_used_bytes(&self, delta: i64) {
        if delta >= 0 {
            self.used_bytes.fetch_add(delta as u64, Ordering::SeqCst);
        } else {
            self.used_bytes.fetch_sub((-delta) as u64, Ordering::SeqCst);
        }
    }

    /// Sleeps `d`, but in short steps so a shutdown request is noticed
    /// promptly instead of blocking behind a single uninterruptible sleep.
    fn interruptible_sleep(&self, d: Duration) {
        const STEP: Duration = Duration::from_millis(50);
        let mut remaining = d;
        while remaining > Duration::ZERO {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let step = remaining.min(STEP);
            std::thread::sleep(step);
            remaining -= step;
        }
    }
}

fn decision_tag(decision: &FaultDecision) -> &'static str {
    match decision {
        FaultDecision::Pass => "PASS",
        FaultDecision::Fail(_) => "FAIL",
        FaultDecision::Delay(_) => "DELAY",
        FaultDecision::Mutate { .. } => "MUTATE",
        FaultDecision::Shorten(_) => "SHORTEN",
    }
}

fn file_type_of(t: fs::FileType) -> FileType {
    use std::os::unix::fs::FileTypeExt;
    match t {
        x if x.is_symlink() => FileType::Symlink,
        x if x.is_dir() => FileType::Directory,
        x if x.is_fifo() => FileType::NamedPipe,
        x if x.is_char_device() => FileType::CharDevice,
        x if x.is_block_device() => FileType::BlockDevice,
        x if x.is_socket() => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn errno_of(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

/// Sums file sizes under `root`, the "backing subtree" basis the space
/// exhaustion accounting is defined against (not host filesystem usage).
fn compute_used_bytes(root: &Path) -> u64 {
    fn walk(dir: &Path, total: &mut u64) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                walk(&entry.path(), total);
            } else {
                *total += meta.len();
            }
        }
    }
    let mut total = 0u64;
    walk(root, &mut total);
    total
}

impl Filesystem for PassthroughFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), i32> {
        debug!("nas-emu-fuse mounted, backing_root={}", self.backing_root.display());
        Ok(())
    }

    fn destroy(&mut self) {
        let counters = self.injector.counters_snapshot();
        debug!("unmounting; fault rule counters (invocations, faults): {counters:?}");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.virtual_path(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(child_path) = Self::join_child(&parent_path, name) else {
            reply.error(libc::EACCES);
            return;
        };

        let decision = self.injector.decide(FaultOp::Lookup, &child_path, 0, 0);
        self.log_decision("lookup", &child_path, &decision);
        if let FaultDecision::Fail(errno) = decision {
            reply.error(errno);
            return;
        }
        if let FaultDecision::Delay(d) = decision {
            self.interruptible_sleep(d);
        }

        let backing = self.backing_path(&child_path);
        match fs::symlink_metadata(&backing) {
            Ok(meta) => {
                let ino = self.ino_for(&child_path, parent);
                reply.entry(&TTL, &self.attr_from_metadata(ino, &meta), 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.virtual_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let decision = self.injector.decide(FaultOp::Getattr, &path, 0, 0);
        self.log_decision("getattr", &path, &decision);
        if let FaultDecision::Fail(errno) = decision {
            reply.error(errno);
            return;
        }
        if let FaultDecision::Delay(d) = decision {
            self.interruptible_sleep(d);
        }

        match fs::symlink_metadata(self.backing_path(&path)) {
            Ok(meta) => reply.attr(&TTL, &self.attr_from_metadata(ino, &meta)),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.virtual_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        // Each touched attribute class is checked against its own dedicated
        // FaultOp (CHMOD/CHOWN/TRUNCATE/UTIMENS) rather than the generic
        // SETATTR, so `target_operations = chmod` etc. rules actually match
        // the call that triggered them.
        let mut touched_ops: Vec<(FaultOp, &'static str)> = Vec::new();
        if mode.is_some() {
            touched_ops.push((FaultOp::Chmod, "chmod"));
        }
        if uid.is_some() || gid.is_some() {
            touched_ops.push((FaultOp::Chown, "chown"));
        }
        if size.is_some() {
            touched_ops.push((FaultOp::Truncate, "truncate"));
        }
        if atime.is_some() || mtime.is_some() {
            touched_ops.push((FaultOp::Utimens, "utimens"));
        }
        if touched_ops.is_empty() {
            touched_ops.push((FaultOp::Setattr, "setattr"));
        }

        let mut delay = None;
        for (op, label) in touched_ops {
            let decision = self.injector.decide(op, &path, size.unwrap_or(0), self.used_bytes());
            self.log_decision(label, &path, &decision);
            if let FaultDecision::Fail(errno) = decision {
                reply.error(errno);
                return;
            }
            if let FaultDecision::Delay(d) = decision {
                delay = Some(delay.map_or(d, |cur: Duration| cur.max(d)));
            }
        }
        if let Some(d) = delay {
            self.interruptible_sleep(d);
        }

        let backing = self.backing_path(&path);

        if let Some(mode) = mode {
            if let Err(e) = fs::set_permissions(&backing, fs::Permissions::from_mode(mode)) {
                reply.error(errno_of(&e));
                return;
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(e) = chown_path(&backing, uid, gid) {
                reply.error(errno_of(&e));
                return;
            }
        }
        if let Some(new_size) = size {
            let old_len = fs::metadata(&backing).map(|m| m.len()).unwrap_or(0);
            match OpenOptions::new().write(true).open(&backing).and_then(|f| f.set_len(new_size)) {
                Ok(()) => self.add_used_bytes(new_size as i64 - old_len as i64),
                Err(e) => {
                    reply.error(errno_of(&e));
                    return;
                }
            }
        }
        if atime.is_some() || mtime.is_some() {
            if let Err(e) = set_times(&backing, atime, mtime) {
                reply.error(errno_of(&e));
                return;
            }
        }

        match fs::symlink_metadata(&backing) {
            Ok(meta) => reply.attr(&TTL, &self.attr_from_metadata(ino, &meta)),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.virtual_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let decision = self.injector.decide(FaultOp::Readlink, &path, 0, 0);
        self.log_decision("readlink", &path, &decision);
        if let FaultDecision::Fail(errno) = decision {
            reply.error(errno);
            return;
        }
        match fs::read_link(self.backing_path(&path)) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.virtual_path(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(child_path) = Self::join_child(&parent_path, name) else {
            reply.error(libc::EACCES);
            return;
        };
        let decision = self.injector.decide(FaultOp::Mkdir, &child_path, 0, 0);
        self.log_decision("mkdir", &child_path, &decision);
        if let FaultDecision::Fail(errno) = decision {
            reply.error(errno);
            return;
        }
        if let FaultDecision::Delay(d) = decision {
            self.interruptible_sleep(d);
        }

        let backing = self.backing_path(&child_path);
        if let Err(e) = fs::create_dir(&backing) {
            reply.error(errno_of(&e));
            return;
        }
        let _ = fs::set_permissions(&backing, fs::Permissions::from_mode(mode & 0o7777));
        match fs::symlink_metadata(&backing) {
            Ok(meta) => {
                let ino = self.ino_for(&child_path, parent);
                reply.entry(&TTL, &self.attr_from_metadata(ino, &meta), 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.virtual_path(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(child_path) = Self::join_child(&parent_path, name) else {
            reply.error(libc::EACCES);
            return;
        };
        let decision = self.injector.decide(FaultOp::Mknod, &child_path, 0, self.used_bytes());
        self.log_decision("mknod", &child_path, &decision);
        if let FaultDecision::Fail(errno) = decision {
            reply.error(errno);
            return;
        }

        let backing = self.backing_path(&child_path);
        match OpenOptions::new().write(true).create_new(true).open(&backing) {
            Ok(_) => {
                let _ = fs::set_permissions(&backing, fs::Permissions::from_mode(mode & 0o7777));
                match fs::symlink_metadata(&backing) {
                    Ok(meta) => {
                        let ino = self.ino_for(&child_path, parent);
                        reply.entry(&TTL, &self.attr_from_metadata(ino, &meta), 0);
                    }
                    Err(e) => reply.error(errno_of(&e)),
                }
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.virtual_path(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(child_path) = Self::join_child(&parent_path, name) else {
            reply.error(libc::EACCES);
            return;
        };
        let decision = self.injector.decide(FaultOp::Unlink, &child_path, 0, 0);
        self.log_decision("unlink", &child_path, &decision);
        if let FaultDecision::Fail(errno) = decision {
            reply.error(errno);
            return;
        }

        let backing = self.backing_path(&child_path);
        let old_len = fs::metadata(&backing).map(|m| m.len()).unwrap_or(0);
        match fs::remove_file(&backing) {
            Ok(()) => {
                self.add_used_bytes(-(old_len as i64));
                self.forget_ino(&child_path);
                reply.ok();
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.virtual_path(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(child_path) = Self::join_child(&parent_path, name) else {
            reply.error(libc::EACCES);
            return;
        };
        let decision = self.injector.decide(FaultOp::Rmdir, &child_path, 0, 0);
        self.log_decision("rmdir", &child_path, &decision);
        if let FaultDecision::Fail(errno) = decision {
            reply.error(errno);
            return;
        }

        match fs::remove_dir(self.backing_path(&child_path)) {
            Ok(()) => {
                self.forget_ino(&child_path);
                reply.ok();
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.virtual_path(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(child_path) = Self::join_child(&parent_path, name) else {
            reply.error(libc::EACCES);
            return;
        };
        let decision = self.injector.decide(FaultOp::Symlink, &child_path, 0, 0);
        self.log_decision("symlink", &child_path, &decision);
        if let FaultDecision::Fail(errno) = decision {
            reply.error(errno);
            return;
        }

        let backing = self.backing_path(&child_path);
        if let Err(e) = std::os::unix::fs::symlink(link, &backing) {
            reply.error(errno_of(&e));
            return;
        }
        match fs::symlink_metadata(&backing) {
            Ok(meta) => {
                let ino = self.ino_for(&child_path, parent);
                reply.entry(&TTL, &self.attr_from_metadata(ino, &meta), 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(parent_path), Some(newparent_path)) =
            (self.virtual_path(parent), self.virtual_path(newparent))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let (Some(src), Some(dst)) = (
            Self::join_child(&parent_path, name),
            Self::join_child(&newparent_path, newname),
        ) else {
            reply.error(libc::EACCES);
            return;
        };
        let decision = self.injector.decide(FaultOp::Rename, &src, 0, 0);
        self.log_decision("rename", &src, &decision);
        if let FaultDecision::Fail(errno) = decision {
            reply.error(errno);
            return;
        }

        match fs::rename(self.backing_path(&src), self.backing_path(&dst)) {
            Ok(()) => {
                let mut by_path = self.paths_to_ino.lock().unwrap();
                if let Some(ino) = by_path.remove(&src) {
                    by_path.insert(dst.clone(), ino);
                    if let Some(entry) = self.inodes.lock().unwrap().get_mut(&ino) {
                        entry.virtual_path = dst;
                        entry.parent = newparent;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (Some(path), Some(newparent_path)) =
            (self.virtual_path(ino), self.virtual_path(newparent))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(dst) = Self::join_child(&newparent_path, newname) else {
            reply.error(libc::EACCES);
            return;
        };
        let decision = self.injector.decide(FaultOp::Link, &dst, 0, 0);
        self.log_decision("link", &dst, &decision);
        if let FaultDecision::Fail(errno) = decision {
            reply.error(errno);
            return;
        }

        let backing_dst = self.backing_path(&dst);
        if let Err(e) = fs::hard_link(self.backing_path(&path), &backing_dst) {
            reply.error(errno_of(&e));
            return;
        }
        match fs::symlink_metadata(&backing_dst) {
            Ok(meta) => {
                let new_ino = self.ino_for(&dst, newparent);
                reply.entry(&TTL, &self.attr_from_metadata(new_ino, &meta), 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.virtual_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let decision = self.injector.decide(FaultOp::Open, &path, 0, 0);
        self.log_decision("open", &path, &decision);
        if let FaultDecision::Fail(errno) = decision {
            reply.error(errno);
            return;
        }
        if let FaultDecision::Delay(d) = decision {
            self.interruptible_sleep(d);
        }

        let backing = self.backing_path(&path);
        let mut options = OpenOptions::new();
        let accmode = flags & libc::O_ACCMODE;
        options.read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR);
        options.write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR);
        match options.open(&backing) {
            Ok(file) => {
                let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
                self.open_files.lock().unwrap().insert(fh, file);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_path) = self.virtual_path(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(child_path) = Self::join_child(&parent_path, name) else {
            reply.error(libc::EACCES);
            return;
        };
        let decision = self.injector.decide(FaultOp::Create, &child_path, 0, self.used_bytes());
        self.log_decision("create", &child_path, &decision);
        if let FaultDecision::Fail(errno) = decision {
            reply.error(errno);
            return;
        }

        let backing = self.backing_path(&child_path);
        let mut options = OpenOptions::new();
        options.create(true).truncate(flags & libc::O_TRUNC != 0);
        let accmode = flags & libc::O_ACCMODE;
        options.read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR);
        options.write(accmode != libc::O_RDONLY);
        match options.open(&backing) {
            Ok(file) => {
                let _ = fs::set_permissions(&backing, fs::Permissions::from_mode(mode & 0o7777));
                let meta = match file.metadata() {
                    Ok(m) => m,
                    Err(e) => {
                        reply.error(errno_of(&e));
                        return;
                    }
                };
                let ino = self.ino_for(&child_path, parent);
                let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
                self.open_files.lock().unwrap().insert(fh, file);
                reply.created(&TTL, &self.attr_from_metadata(ino, &meta), 0, fh, 0);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.virtual_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let decision = self.injector.decide(FaultOp::Read, &path, size as u64, 0);
        self.log_decision("read", &path, &decision);
        if let FaultDecision::Fail(errno) = decision {
            reply.error(errno);
            return;
        }
        if let FaultDecision::Delay(d) = decision {
            self.interruptible_sleep(d);
        }

        let files = self.open_files.lock().unwrap();
        let Some(file) = files.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        match file.read_at(&mut buf, offset as u64) {
            Ok(n) => {
                buf.truncate(n);
                if let FaultDecision::Mutate { percent } = decision {
                    self.injector.corrupt(&mut buf, percent);
                }
                reply.data(&buf);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.virtual_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let decision = self
            .injector
            .decide(FaultOp::Write, &path, data.len() as u64, self.used_bytes());
        self.log_decision("write", &path, &decision);
        if let FaultDecision::Fail(errno) = decision {
            reply.error(errno);
            return;
        }
        if let FaultDecision::Delay(d) = decision {
            self.interruptible_sleep(d);
        }

        let payload_len = match decision {
            FaultDecision::Shorten(n) => n.min(data.len()),
            _ => data.len(),
        };
        let mut owned;
        let payload: &[u8] = if let FaultDecision::Mutate { percent } = decision {
            owned = data[..payload_len].to_vec();
            self.injector.corrupt(&mut owned, percent);
            &owned
        } else {
            &data[..payload_len]
        };

        let files = self.open_files.lock().unwrap();
        let Some(file) = files.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let backing = self.backing_path(&path);
        let old_len = fs::metadata(&backing).map(|m| m.len()).unwrap_or(0);
        match file.write_at(payload, offset as u64) {
            Ok(n) => {
                let new_len = fs::metadata(&backing).map(|m| m.len()).unwrap_or(old_len);
                self.add_used_bytes(new_len as i64 - old_len as i64);
                reply.written(n as u32);
            }
            Err(e) => reply.error(errno_of(&e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let path = self.virtual_path(ino).unwrap_or_default();
        let decision = self.injector.decide(FaultOp::Flush, &path, 0, 0);
        self.log_decision("flush", &path, &decision);
        if let FaultDecision::Fail(errno) = decision {
            reply.error(errno);
            return;
        }
        let files = self.open_files.lock().unwrap();
        match files.get(&fh).map(|f| f.sync_data()) {
            Some(Ok(())) | None => reply.ok(),
            Some(Err(e)) => reply.error(errno_of(&e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let path = self.virtual_path(ino).unwrap_or_default();
        // Always honored to the kernel even if the close below fails.
        if let Some(file) = self.open_files.lock().unwrap().remove(&fh) {
            if let Err(e) = file.sync_all() {
                warn!("{}", crate::logger::op_line("release", &path, "FAIL", &format!("close sync failed: {e}")));
            }
        }
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let path = self.virtual_path(ino).unwrap_or_default();
        let decision = self.injector.decide(FaultOp::Fsync, &path, 0, 0);
        self.log_decision("fsync", &path, &decision);
        if let FaultDecision::Fail(errno) = decision {
            reply.error(errno);
            return;
        }
        let files = self.open_files.lock().unwrap();
        match files.get(&fh).map(|f| f.sync_all()) {
            Some(Ok(())) | None => reply.ok(),
            Some(Err(e)) => reply.error(errno_of(&e)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = self.virtual_path(ino).unwrap_or_default();
        let decision = self.injector.decide(FaultOp::Opendir, &path, 0, 0);
        self.log_decision("opendir", &path, &decision);
        if let FaultDecision::Fail(errno) = decision {
            reply.error(errno);
            return;
        }
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.virtual_path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let decision = self.injector.decide(FaultOp::Readdir, &path, 0, 0);
        self.log_decision("readdir", &path, &decision);
        if let FaultDecision::Fail(errno) = decision {
            reply.error(errno);
            return;
        }

        let parent_ino = self
            .inodes
            .lock()
            .unwrap()
            .get(&ino)
            .map(|e| e.parent)
            .unwrap_or(ROOT_INO);

        let mut entries: Vec<(u64, FileType, std::ffi::OsString)> = vec![
            (ino, FileType::Directory, ".".into()),
            (parent_ino, FileType::Directory, "..".into()),
        ];

        let backing = self.backing_path(&path);
        match fs::read_dir(&backing) {
            Ok(dir_entries) => {
                for entry in dir_entries.flatten() {
                    let Ok(meta) = entry.metadata() else { continue };
                    let child_path = path.join(entry.file_name());
                    let child_ino = self.ino_for(&child_path, ino);
                    entries.push((child_ino, file_type_of(meta.file_type()), entry.file_name()));
                }
            }
            Err(e) => {
                reply.error(errno_of(&e));
                return;
            }
        }

        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let path = self.virtual_path(ino).unwrap_or_default();
        let decision = self.injector.decide(FaultOp::Fsyncdir, &path, 0, 0);
        self.log_decision("fsyncdir", &path, &decision);
        match decision {
            FaultDecision::Fail(errno) => reply.error(errno),
            _ => reply.ok(),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let path = self.virtual_path(ino).unwrap_or_default();
        let decision = self.injector.decide(FaultOp::Statfs, &path, 0, 0);
        self.log_decision("statfs", &path, &decision);
        if let FaultDecision::Fail(errno) = decision {
            reply.error(errno);
            return;
        }

        let stat = match backing_statvfs(&self.backing_root) {
            Ok(s) => s,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let free_bytes = match self.injector.space_threshold() {
            Some(threshold) => threshold.saturating_sub(self.used_bytes()),
            None => stat.free_bytes,
        };
        let bsize = stat.block_size.max(1);
        reply.statfs(
            stat.total_blocks,
            free_bytes / bsize,
            free_bytes / bsize,
            stat.files,
            stat.files_free,
            stat.block_size as u32,
            255,
            stat.block_size as u32,
        );
    }
}

struct StatvfsResult {
    total_blocks: u64,
    free_bytes: u64,
    block_size: u64,
    files: u64,
    files_free: u64,
}

fn backing_statvfs(path: &Path) -> Result<StatvfsResult, i32> {
    use std::ffi::CString;
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| libc::EINVAL)?;
    unsafe {
        let mut buf: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut buf) != 0 {
            return Err(*libc::__errno_location());
        }
        Ok(StatvfsResult {
            total_blocks: buf.f_blocks,
            free_bytes: buf.f_bavail * buf.f_frsize,
            block_size: buf.f_frsize,
            files: buf.f_files,
            files_free: buf.f_ffree,
        })
    }
}

fn chown_path(path: &Path, uid: Option<u32>, gid: Option<u32>) -> std::io::Result<()> {
    use std::ffi::CString;
    let c_path = CString::new(path.as_os_str().as_bytes())?;
    let uid = uid.map(|u| u as libc::uid_t).unwrap_or(u32::MAX as libc::uid_t);
    let gid = gid.map(|g| g as libc::gid_t).unwrap_or(u32::MAX as libc::gid_t);
    let rc = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn set_times(
    path: &Path,
    atime: Option<TimeOrNow>,
    mtime: Option<TimeOrNow>,
) -> std::io::Result<()> {
    let resolve = |t: TimeOrNow| -> filetime::FileTime {
        match t {
            TimeOrNow::SpecificTime(t) => filetime::FileTime::from_system_time(t),
            TimeOrNow::Now => filetime::FileTime::from_system_time(SystemTime::now()),
        }
    };
    let existing = fs::metadata(path)?;
    let current_atime = filetime::FileTime::from_last_access_time(&existing);
    let current_mtime = filetime::FileTime::from_last_modification_time(&existing);
    let new_atime = atime.map(resolve).unwrap_or(current_atime);
    let new_mtime = mtime.map(resolve).unwrap_or(current_mtime);
    filetime::set_file_times(path, new_atime, new_mtime).map_err(|e| {
        error!("set_file_times failed for {}: {e}", path.display());
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultInjector;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn fs_over(root: &Path) -> PassthroughFs {
        PassthroughFs::new(
            root.to_path_buf(),
            Arc::new(FaultInjector::new(vec![], 1)),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn root_inode_resolves_to_slash() {
        let dir = tempdir().unwrap();
        let fs = fs_over(dir.path());
        assert_eq!(fs.virtual_path(ROOT_INO), Some(PathBuf::from("/")));
    }

    #[test]
    fn backing_path_joins_under_root() {
        let dir = tempdir().unwrap();
        let fs = fs_over(dir.path());
        let backing = fs.backing_path(Path::new("/a/b.txt"));
        assert_eq!(backing, dir.path().join("a/b.txt"));
    }

    #[test]
    fn join_child_rejects_traversal_and_slashes() {
        assert!(PassthroughFs::join_child(Path::new("/"), OsStr::new("..")).is_none());
        assert!(PassthroughFs::join_child(Path::new("/"), OsStr::new("a/b")).is_none());
        assert!(PassthroughFs::join_child(Path::new("/"), OsStr::new("a.txt")).is_some());
    }

    #[test]
    fn ino_for_path_is_stable_across_calls() {
        let dir = tempdir().unwrap();
        let fs = fs_over(dir.path());
        let a = fs.ino_for(Path::new("/x.txt"), ROOT_INO);
        let b = fs.ino_for(Path::new("/x.txt"), ROOT_INO);
        assert_eq!(a, b);
    }

    #[test]
    fn compute_used_bytes_sums_files_recursively() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 10]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b"), vec![0u8; 5]).unwrap();
        assert_eq!(compute_used_bytes(dir.path()), 15);
    }
}
