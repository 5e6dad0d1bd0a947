//! Inode identity and lifetime.
//!
//! A host object discovered through lookup is pinned by an `O_PATH`
//! descriptor and keyed by `(st_dev, st_ino)`; at most one live [`Inode`]
//! carries a given key. Two counts govern its life:
//!
//! - the *lookup count*, untrusted, mirrors how many references the guest
//!   kernel holds and is decremented by FORGET. It lives in the table and
//!   is only touched under the table lock.
//! - the *reference count* is the `Arc` strong count: every handler that
//!   resolves an id clones the `Arc`, so an inode evicted from the table
//!   stays alive until the last in-flight handler drops it.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use tracing::warn;
use virtshare_fuse::abi::ROOT_ID;

use crate::handles::Slab;
use crate::locks::LockRecord;

/// Host identity of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeIds {
    pub ino: libc::ino64_t,
    pub dev: libc::dev_t,
}

/// One discovered host object.
#[derive(Debug)]
pub struct Inode {
    file: File,
    ids: InodeIds,
    /// `S_IFMT` bits cached at discovery; picks the access strategy for
    /// operations that cannot open the object (xattr on specials).
    filetype: u32,
    /// Guest lock-owner to OFD lock record.
    locks: Mutex<HashMap<u64, Arc<LockRecord>>>,
}

impl Inode {
    pub fn new(file: File, ids: InodeIds, mode: u32) -> Inode {
        Inode {
            file,
            ids,
            filetype: mode & libc::S_IFMT,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The `O_PATH` descriptor naming this object.
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn ids(&self) -> InodeIds {
        self.ids
    }

    pub fn filetype(&self) -> u32 {
        self.filetype
    }

    /// Whether a plain re-open through `/proc/self/fd` is safe for this
    /// object class.
    pub fn is_reg_or_dir(&self) -> bool {
        self.filetype == libc::S_IFREG || self.filetype == libc::S_IFDIR
    }

    pub fn locks(&self) -> &Mutex<HashMap<u64, Arc<LockRecord>>> {
        &self.locks
    }
}

#[derive(Debug)]
struct InodeSlot {
    inode: Arc<Inode>,
    nlookup: u64,
}

/// The identity table: protocol id to inode, plus the `(dev, ino)` reverse
/// index. Structural changes happen under the owner's write lock.
#[derive(Debug, Default)]
pub struct InodeTable {
    slots: Slab<InodeSlot>,
    by_ids: HashMap<InodeIds, u64>,
}

impl InodeTable {
    /// Install the root inode at its protocol-fixed id. Slot 0 is taken
    /// out of circulation (id 0 means "no inode" on the wire); the root
    /// starts with a lookup count of 2 and is never evicted.
    pub fn new(root: Arc<Inode>) -> InodeTable {
        let mut table = InodeTable::default();
        table.slots.reserve_unused(0);
        table.by_ids.insert(root.ids(), ROOT_ID);
        let pinned = table.slots.reserve(
            ROOT_ID as usize,
            InodeSlot {
                inode: root,
                nlookup: 2,
            },
        );
        assert!(pinned, "fresh table must have id 1 free");
        table
    }

    pub fn get(&self, id: u64) -> Option<Arc<Inode>> {
        self.slots
            .get(id as usize)
            .map(|slot| Arc::clone(&slot.inode))
    }

    /// Resolve a freshly stat'ed object to its id, registering it if it is
    /// new. The probe descriptor is consumed: kept for a new inode, closed
    /// (dropped) on an identity hit. The lookup count rises by one either
    /// way.
    pub fn get_or_insert(&mut self, probe: File, ids: InodeIds, mode: u32) -> (u64, Arc<Inode>) {
        if let Some(&id) = self.by_ids.get(&ids) {
            let slot = self.slots.get_mut(id as usize).expect("index is in sync");
            slot.nlookup += 1;
            return (id, Arc::clone(&slot.inode));
        }

        let inode = Arc::new(Inode::new(probe, ids, mode));
        let id = self.slots.insert(InodeSlot {
            inode: Arc::clone(&inode),
            nlookup: 1,
        }) as u64;
        self.by_ids.insert(ids, id);
        (id, inode)
    }

    /// Find a stat'ed object without a probe descriptor, bumping its lookup
    /// count. Used by operations that must balance the count themselves
    /// (unlink, rename).
    pub fn bump_by_ids(&mut self, ids: InodeIds) -> Option<(u64, Arc<Inode>)> {
        let id = *self.by_ids.get(&ids)?;
        let slot = self.slots.get_mut(id as usize).expect("index is in sync");
        slot.nlookup += 1;
        Some((id, Arc::clone(&slot.inode)))
    }

    /// Bump the lookup count of a known id (LINK handing out the same
    /// inode again).
    pub fn bump(&mut self, id: u64) {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            slot.nlookup += 1;
        }
    }

    /// Subtract `count` forgotten lookups; evict at zero. The guest is not
    /// trusted to balance its forgets, so underflow clamps, and the root
    /// never reaches zero.
    pub fn forget(&mut self, id: u64, count: u64) {
        let Some(slot) = self.slots.get_mut(id as usize) else {
            return;
        };

        if count > slot.nlookup {
            warn!(id, count, nlookup = slot.nlookup, "forget underflow");
            slot.nlookup = 0;
        } else {
            slot.nlookup -= count;
        }

        if slot.nlookup == 0 && id != ROOT_ID {
            let slot = self.slots.remove(id as usize).expect("slot exists");
            self.by_ids.remove(&slot.inode.ids());
            // In-flight handlers may still hold the Arc; the descriptor
            // closes when the last one drops it.
        }
    }

    /// Release every outstanding lookup count. The root stays pinned with
    /// its initial count.
    pub fn drain(&mut self) {
        self.slots.retain(|id, _| id as u64 == ROOT_ID);
        let root_ids = self
            .slots
            .get(ROOT_ID as usize)
            .map(|slot| slot.inode.ids());
        self.by_ids.retain(|ids, _| Some(*ids) == root_ids);
        if let Some(slot) = self.slots.get_mut(ROOT_ID as usize) {
            slot.nlookup = 2;
        }
    }

    /// Number of live inodes, the root included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[cfg(test)]
    pub fn nlookup(&self, id: u64) -> Option<u64> {
        self.slots.get(id as usize).map(|slot| slot.nlookup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_path(path: &std::path::Path) -> (File, InodeIds, u32) {
        let c = std::ffi::CString::new(path.to_str().unwrap()).unwrap();
        let fd = unsafe {
            libc::open(c.as_ptr(), libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC)
        };
        assert!(fd >= 0);
        let file = unsafe { <File as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };
        let md = std::fs::symlink_metadata(path).unwrap();
        use std::os::linux::fs::MetadataExt;
        (
            file,
            InodeIds {
                ino: md.st_ino(),
                dev: md.st_dev(),
            },
            md.st_mode(),
        )
    }

    fn table_with_root(dir: &std::path::Path) -> InodeTable {
        let (file, ids, mode) = open_path(dir);
        InodeTable::new(Arc::new(Inode::new(file, ids, mode)))
    }

    #[test]
    fn test_same_identity_yields_same_id() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let mut table = table_with_root(dir.path());

        let (file, ids, mode) = open_path(&dir.path().join("f"));
        let (id1, _) = table.get_or_insert(file, ids, mode);

        let (file, ids, mode) = open_path(&dir.path().join("f"));
        let (id2, _) = table.get_or_insert(file, ids, mode);

        assert_eq!(id1, id2);
        assert_eq!(table.nlookup(id1), Some(2));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_forget_balances_lookups() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let mut table = table_with_root(dir.path());

        let (file, ids, mode) = open_path(&dir.path().join("f"));
        let (id, _inode) = table.get_or_insert(file, ids, mode);
        let (file, _, _) = open_path(&dir.path().join("f"));
        table.get_or_insert(file, ids, mode);

        table.forget(id, 1);
        assert!(table.get(id).is_some());
        table.forget(id, 1);
        assert!(table.get(id).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_forget_underflow_clamps() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let mut table = table_with_root(dir.path());

        let (file, ids, mode) = open_path(&dir.path().join("f"));
        let (id, _) = table.get_or_insert(file, ids, mode);

        table.forget(id, u64::MAX);
        assert!(table.get(id).is_none());
    }

    #[test]
    fn test_root_survives_forget_and_drain() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let mut table = table_with_root(dir.path());

        table.forget(ROOT_ID, u64::MAX);
        assert!(table.get(ROOT_ID).is_some());

        let (file, ids, mode) = open_path(&dir.path().join("f"));
        table.get_or_insert(file, ids, mode);
        assert_eq!(table.len(), 2);

        table.drain();
        assert_eq!(table.len(), 1);
        assert!(table.get(ROOT_ID).is_some());
    }

    #[test]
    fn test_evicted_inode_outlives_table_reference() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let mut table = table_with_root(dir.path());

        let (file, ids, mode) = open_path(&dir.path().join("f"));
        let (id, inode) = table.get_or_insert(file, ids, mode);
        table.forget(id, 1);

        // The table no longer knows the inode, but the handler's reference
        // keeps the descriptor usable.
        assert!(table.get(id).is_none());
        let mut st: libc::stat64 = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::fstatat64(
                inode.raw_fd(),
                c"".as_ptr(),
                &mut st,
                libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        assert_eq!(rc, 0);
        assert_eq!(st.st_ino, ids.ino);
    }
}
