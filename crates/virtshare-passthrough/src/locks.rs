//! POSIX lock tracking with open-file-description locks.
//!
//! Guest processes identify themselves by an opaque lock owner. OFD locks
//! are keyed on the file description, so each (inode, owner) pair gets its
//! own descriptor: dropping the record closes the descriptor, which
//! atomically releases every lock that owner held on the inode.

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use virtshare_fuse::abi::{FileLock, LOCK_OFFSET_MAX};

use crate::inode::Inode;
use crate::procfs::ProcSelfFd;

/// Dedicated lock descriptor for one (inode, owner) pair.
#[derive(Debug)]
pub struct LockRecord {
    file: File,
}

impl LockRecord {
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Find or create the lock record for `owner` on `inode`.
pub fn acquire_record(
    inode: &Inode,
    proc_self_fd: &ProcSelfFd,
    owner: u64,
) -> io::Result<Arc<LockRecord>> {
    let mut table = inode.locks().lock().unwrap();
    if let Some(record) = table.get(&owner) {
        return Ok(Arc::clone(record));
    }

    // A fresh description on the same object, used for locks only.
    let file = proc_self_fd.open_fd(inode.raw_fd(), libc::O_RDWR)?;
    let record = Arc::new(LockRecord { file });
    table.insert(owner, Arc::clone(&record));
    Ok(record)
}

/// Drop `owner`'s record on `inode`, releasing its locks when no other
/// reference remains.
pub fn release_records(inode: &Inode, owner: u64) {
    inode.locks().lock().unwrap().remove(&owner);
}

/// Wire lock range to the host representation.
pub fn flock_from_wire(lock: &FileLock) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock.lock_type as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = lock.start as libc::off_t;
    fl.l_len = if lock.end == LOCK_OFFSET_MAX {
        0
    } else {
        (lock.end - lock.start + 1) as libc::off_t
    };
    fl
}

/// Host lock back to the wire, with the pid kept opaque: OFD locks have no
/// meaningful owner pid to report.
pub fn flock_to_wire(fl: &libc::flock) -> FileLock {
    let mut lock = FileLock {
        lock_type: fl.l_type as u32,
        pid: 0,
        ..FileLock::default()
    };
    if i32::from(fl.l_type) != libc::F_UNLCK {
        lock.start = fl.l_start as u64;
        lock.end = if fl.l_len == 0 {
            LOCK_OFFSET_MAX
        } else {
            (fl.l_start + fl.l_len - 1) as u64
        };
    }
    lock
}

/// Apply a non-blocking OFD lock operation.
pub fn set_ofd_lock(fd: RawFd, fl: &libc::flock) -> io::Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_OFD_SETLK, fl) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Test which lock would block `fl`, updating it in place.
pub fn get_ofd_lock(fd: RawFd, fl: &mut libc::flock) -> io::Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_OFD_GETLK, fl) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;
    use std::os::unix::io::FromRawFd;

    use super::*;
    use crate::inode::InodeIds;

    fn make_inode(path: &std::path::Path) -> Inode {
        let c = CString::new(path.to_str().unwrap()).unwrap();
        let fd = unsafe { libc::open(c.as_ptr(), libc::O_PATH | libc::O_CLOEXEC) };
        assert!(fd >= 0);
        let file = unsafe { File::from_raw_fd(fd) };
        use std::os::linux::fs::MetadataExt;
        let md = std::fs::metadata(path).unwrap();
        Inode::new(
            file,
            InodeIds {
                ino: md.st_ino(),
                dev: md.st_dev(),
            },
            md.st_mode(),
        )
    }

    fn whole_file_lock(lock_type: u32) -> FileLock {
        FileLock {
            start: 0,
            end: LOCK_OFFSET_MAX,
            lock_type,
            pid: 0,
        }
    }

    #[test]
    fn test_record_reused_per_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked");
        std::fs::write(&path, b"data").unwrap();
        let inode = make_inode(&path);
        let proc_self_fd = ProcSelfFd::open().unwrap();

        let a1 = acquire_record(&inode, &proc_self_fd, 1).unwrap();
        let a2 = acquire_record(&inode, &proc_self_fd, 1).unwrap();
        let b = acquire_record(&inode, &proc_self_fd, 2).unwrap();

        assert_eq!(a1.raw_fd(), a2.raw_fd());
        assert_ne!(a1.raw_fd(), b.raw_fd());
    }

    #[test]
    fn test_lock_conflict_and_release_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked");
        std::fs::write(&path, b"data").unwrap();
        let inode = make_inode(&path);
        let proc_self_fd = ProcSelfFd::open().unwrap();

        // Owner 1 takes a write lock on the whole file.
        let rec1 = acquire_record(&inode, &proc_self_fd, 1).unwrap();
        let fl = flock_from_wire(&whole_file_lock(libc::F_WRLCK as u32));
        set_ofd_lock(rec1.raw_fd(), &fl).unwrap();

        // Owner 2 sees the conflict.
        let rec2 = acquire_record(&inode, &proc_self_fd, 2).unwrap();
        let mut probe = flock_from_wire(&whole_file_lock(libc::F_WRLCK as u32));
        get_ofd_lock(rec2.raw_fd(), &mut probe).unwrap();
        assert_eq!(i32::from(probe.l_type), libc::F_WRLCK);

        // Releasing owner 1's record drops the lock.
        drop(rec1);
        release_records(&inode, 1);
        let mut probe = flock_from_wire(&whole_file_lock(libc::F_WRLCK as u32));
        get_ofd_lock(rec2.raw_fd(), &mut probe).unwrap();
        assert_eq!(i32::from(probe.l_type), libc::F_UNLCK);
    }

    #[test]
    fn test_wire_conversions() {
        let wire = FileLock {
            start: 10,
            end: 19,
            lock_type: libc::F_RDLCK as u32,
            pid: 77,
        };
        let fl = flock_from_wire(&wire);
        assert_eq!(fl.l_start, 10);
        assert_eq!(fl.l_len, 10);

        let back = flock_to_wire(&fl);
        assert_eq!(back.start, 10);
        assert_eq!(back.end, 19);
        // Server-opaque pid.
        assert_eq!(back.pid, 0);

        let to_eof = FileLock {
            start: 5,
            end: LOCK_OFFSET_MAX,
            lock_type: libc::F_WRLCK as u32,
            pid: 0,
        };
        let fl = flock_from_wire(&to_eof);
        assert_eq!(fl.l_len, 0);
        assert_eq!(flock_to_wire(&fl).end, LOCK_OFFSET_MAX);
    }
}
