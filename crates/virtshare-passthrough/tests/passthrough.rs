//! End-to-end behavior of the passthrough filesystem against a real
//! exported directory.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use tempfile::TempDir;
use virtshare_fuse::abi::{FileLock, FsOptions, SetattrValid, LOCK_OFFSET_MAX, ROOT_ID};
use virtshare_fuse::filesystem::{
    Context, Extensions, FileSystem, GetxattrReply, ZeroCopyReader, ZeroCopyWriter,
};
use virtshare_passthrough::{CachePolicy, Config, PassthroughFs};

fn ctx() -> Context {
    Context {
        uid: unsafe { libc::geteuid() },
        gid: unsafe { libc::getegid() },
        pid: std::process::id() as libc::pid_t,
    }
}

fn cname(name: &str) -> CString {
    CString::new(name).unwrap()
}

fn export(config_tweak: impl FnOnce(&mut Config)) -> (TempDir, PassthroughFs) {
    let dir = TempDir::new().unwrap();
    let mut config = Config {
        source: dir.path().to_path_buf(),
        ..Config::default()
    };
    config_tweak(&mut config);
    let fs = PassthroughFs::new(config).unwrap();
    fs.init(FsOptions::all()).unwrap();
    (dir, fs)
}

/// Reply-buffer double: collects READ data into a vector.
#[derive(Default)]
struct SinkWriter {
    data: Vec<u8>,
}

impl ZeroCopyWriter for SinkWriter {
    fn write_from_file_at(&mut self, fd: RawFd, count: usize, offset: u64) -> io::Result<usize> {
        let mut buf = vec![0u8; count];
        let res = unsafe {
            libc::pread64(fd, buf.as_mut_ptr().cast(), count, offset as libc::off64_t)
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        buf.truncate(res as usize);
        self.data.extend_from_slice(&buf);
        Ok(res as usize)
    }

    fn available_bytes(&self) -> usize {
        usize::MAX
    }
}

/// Request-buffer double: feeds WRITE payload from a vector.
struct SourceReader {
    data: Vec<u8>,
}

impl ZeroCopyReader for SourceReader {
    fn read_to_file_at(&mut self, fd: RawFd, count: usize, offset: u64) -> io::Result<usize> {
        let count = count.min(self.data.len());
        let res = unsafe {
            libc::pwrite64(
                fd,
                self.data.as_ptr().cast(),
                count,
                offset as libc::off64_t,
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        self.data.drain(..res as usize);
        Ok(res as usize)
    }

    fn available_bytes(&self) -> usize {
        self.data.len()
    }
}

#[test]
fn test_stat_root_reflects_host() {
    use std::os::linux::fs::MetadataExt;

    let (dir, fs) = export(|_| {});
    let md = std::fs::metadata(dir.path()).unwrap();

    let (st, timeout) = fs.getattr(ctx(), ROOT_ID, None).unwrap();
    assert_eq!(st.st_ino, md.st_ino());
    assert_eq!(st.st_mode, md.st_mode());
    // Default cache policy is auto: one second of attribute caching.
    assert_eq!(timeout, Duration::from_secs(1));
}

#[test]
fn test_create_write_read_round_trip() {
    let (_dir, fs) = export(|_| {});

    let (entry, handle, _) = fs
        .create(
            ctx(),
            ROOT_ID,
            &cname("hello"),
            0o100644,
            (libc::O_RDWR | libc::O_CREAT | libc::O_EXCL) as u32,
            0,
            0,
            Extensions::default(),
        )
        .unwrap();
    let handle = handle.unwrap();
    assert_ne!(entry.inode, ROOT_ID);

    let mut src = SourceReader {
        data: b"hi\n".to_vec(),
    };
    let written = fs
        .write(ctx(), entry.inode, handle, &mut src, 3, 0, None, false, false, 0)
        .unwrap();
    assert_eq!(written, 3);

    let mut sink = SinkWriter::default();
    let read = fs
        .read(ctx(), entry.inode, handle, &mut sink, 4, 0, None, 0)
        .unwrap();
    assert_eq!(read, 3);
    assert_eq!(sink.data, b"hi\n");

    fs.release(ctx(), entry.inode, 0, handle, false, false, None)
        .unwrap();
    // The handle is gone: a second release must fail.
    assert!(fs
        .release(ctx(), entry.inode, 0, handle, false, false, None)
        .is_err());
}

#[test]
fn test_lookup_dedupes_by_identity() {
    let (dir, fs) = export(|_| {});
    std::fs::write(dir.path().join("f"), b"x").unwrap();

    let e1 = fs.lookup(ctx(), ROOT_ID, &cname("f")).unwrap();
    let e2 = fs.lookup(ctx(), ROOT_ID, &cname("f")).unwrap();
    assert_eq!(e1.inode, e2.inode);
    assert_eq!(fs.inode_count(), 2);

    // Two lookups need two forgotten references before the inode dies.
    fs.forget(ctx(), e1.inode, 1);
    assert_eq!(fs.inode_count(), 2);
    fs.forget(ctx(), e1.inode, 1);
    assert_eq!(fs.inode_count(), 1);
}

#[test]
fn test_root_dotdot_is_root() {
    let (_dir, fs) = export(|_| {});

    let entry = fs.lookup(ctx(), ROOT_ID, &cname("..")).unwrap();
    assert_eq!(entry.inode, ROOT_ID);

    let entry = fs.lookup(ctx(), ROOT_ID, &cname(".")).unwrap();
    assert_eq!(entry.inode, ROOT_ID);

    let err = fs.lookup(ctx(), ROOT_ID, &cname("../etc/passwd")).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
}

#[test]
fn test_names_with_slash_or_dots_rejected() {
    let (_dir, fs) = export(|_| {});

    for name in ["a/b", ".", ".."] {
        let err = fs.unlink(ctx(), ROOT_ID, &cname(name)).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL), "unlink {name}");

        let err = fs
            .mkdir(ctx(), ROOT_ID, &cname(name), 0o755, 0, Extensions::default())
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL), "mkdir {name}");
    }
}

#[test]
fn test_rename_overwrites_and_forgets() {
    let (dir, fs) = export(|_| {});
    std::fs::write(dir.path().join("a"), b"from a").unwrap();
    std::fs::write(dir.path().join("b"), b"from b").unwrap();

    let ino_a = fs.lookup(ctx(), ROOT_ID, &cname("a")).unwrap().inode;
    let ino_b = fs.lookup(ctx(), ROOT_ID, &cname("b")).unwrap().inode;
    assert_ne!(ino_a, ino_b);

    fs.rename(ctx(), ROOT_ID, &cname("a"), ROOT_ID, &cname("b"), 0)
        .unwrap();

    let err = fs.lookup(ctx(), ROOT_ID, &cname("a")).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    assert_eq!(fs.lookup(ctx(), ROOT_ID, &cname("b")).unwrap().inode, ino_a);

    // The displaced inode dies with its last guest reference.
    fs.forget(ctx(), ino_b, 1);
    assert_eq!(fs.inode_count(), 2);
}

#[test]
fn test_rename_exchange_flag() {
    let (dir, fs) = export(|_| {});
    std::fs::write(dir.path().join("x"), b"xx").unwrap();
    std::fs::write(dir.path().join("y"), b"yy").unwrap();

    fs.rename(
        ctx(),
        ROOT_ID,
        &cname("x"),
        ROOT_ID,
        &cname("y"),
        libc::RENAME_EXCHANGE,
    )
    .unwrap();

    assert_eq!(std::fs::read(dir.path().join("x")).unwrap(), b"yy");
    assert_eq!(std::fs::read(dir.path().join("y")).unwrap(), b"xx");
}

#[test]
fn test_mkdir_unlink_rmdir() {
    let (dir, fs) = export(|_| {});

    let entry = fs
        .mkdir(ctx(), ROOT_ID, &cname("sub"), 0o755, 0, Extensions::default())
        .unwrap();
    assert!(dir.path().join("sub").is_dir());

    std::fs::write(dir.path().join("sub/file"), b"z").unwrap();
    let file_entry = fs.lookup(ctx(), entry.inode, &cname("file")).unwrap();

    fs.unlink(ctx(), entry.inode, &cname("file")).unwrap();
    assert!(!dir.path().join("sub/file").exists());
    // The guest still owes a forget for its lookup.
    fs.forget(ctx(), file_entry.inode, 1);

    fs.rmdir(ctx(), ROOT_ID, &cname("sub")).unwrap();
    assert!(!dir.path().join("sub").exists());
    fs.forget(ctx(), entry.inode, 1);
    assert_eq!(fs.inode_count(), 1);
}

#[test]
fn test_symlink_and_readlink() {
    let (_dir, fs) = export(|_| {});

    let entry = fs
        .symlink(
            ctx(),
            &cname("target/elsewhere"),
            ROOT_ID,
            &cname("ln"),
            Extensions::default(),
        )
        .unwrap();
    assert_eq!(entry.attr.st_mode & libc::S_IFMT, libc::S_IFLNK);

    let target = fs.readlink(ctx(), entry.inode).unwrap();
    assert_eq!(target, b"target/elsewhere");
}

#[test]
fn test_link_bumps_lookup_count() {
    let (dir, fs) = export(|_| {});
    std::fs::write(dir.path().join("orig"), b"data").unwrap();

    let entry = fs.lookup(ctx(), ROOT_ID, &cname("orig")).unwrap();
    let linked = fs
        .link(ctx(), entry.inode, ROOT_ID, &cname("hard"))
        .unwrap();
    assert_eq!(linked.inode, entry.inode);
    assert_eq!(linked.attr.st_nlink, 2);

    // One forget per handout.
    fs.forget(ctx(), entry.inode, 2);
    assert_eq!(fs.inode_count(), 1);
}

#[test]
fn test_setattr_truncate_and_times() {
    let (dir, fs) = export(|_| {});
    std::fs::write(dir.path().join("f"), b"0123456789").unwrap();
    let entry = fs.lookup(ctx(), ROOT_ID, &cname("f")).unwrap();

    let mut attr: libc::stat64 = unsafe { std::mem::zeroed() };
    attr.st_size = 4;
    let (st, _) = fs
        .setattr(ctx(), entry.inode, attr, None, SetattrValid::SIZE)
        .unwrap();
    assert_eq!(st.st_size, 4);

    let mut attr: libc::stat64 = unsafe { std::mem::zeroed() };
    attr.st_mtime = 1_000_000;
    attr.st_mtime_nsec = 500;
    let (st, _) = fs
        .setattr(ctx(), entry.inode, attr, None, SetattrValid::MTIME)
        .unwrap();
    assert_eq!(st.st_mtime, 1_000_000);

    let (st, _) = fs.getattr(ctx(), entry.inode, None).unwrap();
    assert_eq!(st.st_size, 4);
    assert_eq!(st.st_mtime, 1_000_000);
}

#[test]
fn test_writeback_rewrites_wronly_open() {
    let (dir, fs) = export(|c| c.writeback = true);
    std::fs::write(dir.path().join("f"), b"payload").unwrap();
    let entry = fs.lookup(ctx(), ROOT_ID, &cname("f")).unwrap();

    let (handle, _) = fs
        .open(ctx(), entry.inode, libc::O_WRONLY as u32, 0)
        .unwrap();
    let handle = handle.unwrap();

    // With writeback caching the kernel may read through a write-only
    // handle; the server must have upgraded it to O_RDWR.
    let mut sink = SinkWriter::default();
    let read = fs
        .read(ctx(), entry.inode, handle, &mut sink, 7, 0, None, 0)
        .unwrap();
    assert_eq!(read, 7);
    assert_eq!(sink.data, b"payload");
}

#[test]
fn test_open_rejects_creation_flags() {
    let (dir, fs) = export(|_| {});
    std::fs::write(dir.path().join("f"), b"x").unwrap();
    let entry = fs.lookup(ctx(), ROOT_ID, &cname("f")).unwrap();

    let err = fs
        .open(
            ctx(),
            entry.inode,
            (libc::O_RDWR | libc::O_CREAT) as u32,
            0,
        )
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
}

#[test]
fn test_lock_lifecycle_with_flush() {
    let (dir, fs) = export(|_| {});
    std::fs::write(dir.path().join("locked"), b"data").unwrap();
    let entry = fs.lookup(ctx(), ROOT_ID, &cname("locked")).unwrap();
    let (handle, _) = fs
        .open(ctx(), entry.inode, libc::O_RDWR as u32, 0)
        .unwrap();
    let handle = handle.unwrap();

    let owner = 0xdead_beef;
    let other = 0xfeed_face;
    let whole = FileLock {
        start: 0,
        end: LOCK_OFFSET_MAX,
        lock_type: libc::F_WRLCK as u32,
        pid: 0,
    };

    fs.setlk(ctx(), entry.inode, handle, owner, whole, false)
        .unwrap();

    // Another owner probing the range sees the write lock, pid opaque.
    let seen = fs
        .getlk(ctx(), entry.inode, handle, other, whole)
        .unwrap();
    assert_eq!(seen.lock_type, libc::F_WRLCK as u32);
    assert_eq!(seen.pid, 0);

    // Blocking requests are refused outright.
    let err = fs
        .setlk(ctx(), entry.inode, handle, other, whole, true)
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EOPNOTSUPP));

    // FLUSH with the holder's owner releases everything it held.
    fs.flush(ctx(), entry.inode, handle, owner).unwrap();
    let seen = fs
        .getlk(ctx(), entry.inode, handle, other, whole)
        .unwrap();
    assert_eq!(seen.lock_type, libc::F_UNLCK as u32);
}

#[test]
fn test_readdir_lists_entries() {
    let (dir, fs) = export(|_| {});
    std::fs::write(dir.path().join("one"), b"1").unwrap();
    std::fs::write(dir.path().join("two"), b"2").unwrap();

    let (handle, _) = fs.opendir(ctx(), ROOT_ID, 0).unwrap();
    let handle = handle.unwrap();

    let mut names = Vec::new();
    fs.readdir(ctx(), ROOT_ID, handle, 4096, 0, &mut |entry| {
        names.push(String::from_utf8_lossy(entry.name).into_owned());
        Ok(1)
    })
    .unwrap();
    names.sort();
    assert_eq!(names, vec![".", "..", "one", "two"]);

    fs.releasedir(ctx(), ROOT_ID, 0, handle).unwrap();
    assert!(fs.releasedir(ctx(), ROOT_ID, 0, handle).is_err());
}

#[test]
fn test_readdirplus_balances_counts_on_full_buffer() {
    let (dir, fs) = export(|_| {});
    std::fs::write(dir.path().join("only"), b"1").unwrap();

    let (handle, _) = fs.opendir(ctx(), ROOT_ID, 0).unwrap();
    let handle = handle.unwrap();

    // Reject every entry, as if the reply buffer were full: no lookup
    // counts may stick.
    fs.readdirplus(ctx(), ROOT_ID, handle, 16, 0, &mut |_, _| Ok(0))
        .unwrap();
    assert_eq!(fs.inode_count(), 1);

    // Accepting them registers the real child only (dot entries carry no
    // lookup).
    let mut seen_child = false;
    fs.readdirplus(ctx(), ROOT_ID, handle, 4096, 0, &mut |de, entry| {
        if de.name == b"only" {
            seen_child = true;
            assert_ne!(entry.inode, 0);
        } else {
            assert_eq!(entry.inode, 0);
        }
        Ok(1)
    })
    .unwrap();
    assert!(seen_child);
    assert_eq!(fs.inode_count(), 2);
}

#[test]
fn test_destroy_empties_table() {
    let (dir, fs) = export(|_| {});
    std::fs::write(dir.path().join("a"), b"").unwrap();
    std::fs::write(dir.path().join("b"), b"").unwrap();

    fs.lookup(ctx(), ROOT_ID, &cname("a")).unwrap();
    fs.lookup(ctx(), ROOT_ID, &cname("b")).unwrap();
    assert_eq!(fs.inode_count(), 3);

    fs.destroy();
    assert_eq!(fs.inode_count(), 1);

    // The root keeps answering after the drain.
    assert!(fs.getattr(ctx(), ROOT_ID, None).is_ok());
}

#[test]
fn test_statfs_and_fallocate_and_lseek() {
    let (dir, fs) = export(|_| {});
    std::fs::write(dir.path().join("f"), b"0123456789").unwrap();
    let entry = fs.lookup(ctx(), ROOT_ID, &cname("f")).unwrap();

    let st = fs.statfs(ctx(), ROOT_ID).unwrap();
    assert!(st.f_bsize > 0);

    let (handle, _) = fs
        .open(ctx(), entry.inode, libc::O_RDWR as u32, 0)
        .unwrap();
    let handle = handle.unwrap();

    fs.fallocate(ctx(), entry.inode, handle, 0, 0, 64).unwrap();
    let (st, _) = fs.getattr(ctx(), entry.inode, None).unwrap();
    assert_eq!(st.st_size, 64);

    let pos = fs
        .lseek(ctx(), entry.inode, handle, 0, libc::SEEK_END as u32)
        .unwrap();
    assert_eq!(pos, 64);
}

#[test]
fn test_copy_file_range() {
    let (dir, fs) = export(|_| {});
    std::fs::write(dir.path().join("src"), b"copy me").unwrap();
    std::fs::write(dir.path().join("dst"), b"").unwrap();

    let src = fs.lookup(ctx(), ROOT_ID, &cname("src")).unwrap();
    let dst = fs.lookup(ctx(), ROOT_ID, &cname("dst")).unwrap();
    let (h_src, _) = fs.open(ctx(), src.inode, libc::O_RDONLY as u32, 0).unwrap();
    let (h_dst, _) = fs.open(ctx(), dst.inode, libc::O_RDWR as u32, 0).unwrap();

    let copied = fs
        .copy_file_range(
            ctx(),
            src.inode,
            h_src.unwrap(),
            0,
            dst.inode,
            h_dst.unwrap(),
            0,
            7,
            0,
        )
        .unwrap();
    assert_eq!(copied, 7);
    assert_eq!(std::fs::read(dir.path().join("dst")).unwrap(), b"copy me");
}

#[test]
fn test_xattr_disabled_answers_enosys() {
    let (dir, fs) = export(|_| {});
    std::fs::write(dir.path().join("f"), b"x").unwrap();
    let entry = fs.lookup(ctx(), ROOT_ID, &cname("f")).unwrap();

    let err = fs
        .getxattr(ctx(), entry.inode, &cname("user.test"), 0)
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOSYS));
}

#[test]
fn test_xattr_enabled_round_trip() {
    let (dir, fs) = export(|c| c.xattr = true);
    std::fs::write(dir.path().join("f"), b"x").unwrap();
    let entry = fs.lookup(ctx(), ROOT_ID, &cname("f")).unwrap();

    let name = cname("user.virtshare.attr");
    match fs.setxattr(ctx(), entry.inode, &name, b"v", 0, 0) {
        Ok(()) => {}
        // tmpfs without user_xattr support
        Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => return,
        Err(e) => panic!("setxattr: {e}"),
    }

    match fs.getxattr(ctx(), entry.inode, &name, 0).unwrap() {
        GetxattrReply::Count(n) => assert_eq!(n, 1),
        other => panic!("expected size probe, got {other:?}"),
    }
    match fs.getxattr(ctx(), entry.inode, &name, 64).unwrap() {
        GetxattrReply::Value(v) => assert_eq!(v, b"v"),
        other => panic!("expected value, got {other:?}"),
    }

    fs.removexattr(ctx(), entry.inode, &name).unwrap();
    let err = fs.getxattr(ctx(), entry.inode, &name, 64).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENODATA));
}

#[test]
fn test_fsync_without_handle_uses_ephemeral_fd() {
    let (dir, fs) = export(|_| {});
    std::fs::write(dir.path().join("f"), b"x").unwrap();
    let entry = fs.lookup(ctx(), ROOT_ID, &cname("f")).unwrap();

    fs.fsync(ctx(), entry.inode, false, None).unwrap();
    fs.fsync(ctx(), entry.inode, true, None).unwrap();
}

#[test]
fn test_cache_none_disables_readdirplus() {
    let dir = TempDir::new().unwrap();
    let fs = PassthroughFs::new(Config {
        source: dir.path().to_path_buf(),
        cache: CachePolicy::None,
        ..Config::default()
    })
    .unwrap();

    let enabled = fs.init(FsOptions::all()).unwrap();
    assert!(!enabled.contains(FsOptions::DO_READDIRPLUS));

    // An explicit opt-in wins over the cache policy.
    let fs = PassthroughFs::new(Config {
        source: dir.path().to_path_buf(),
        cache: CachePolicy::None,
        readdirplus: Some(true),
        ..Config::default()
    })
    .unwrap();
    let enabled = fs.init(FsOptions::all()).unwrap();
    assert!(enabled.contains(FsOptions::DO_READDIRPLUS));
}
