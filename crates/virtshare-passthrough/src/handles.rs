//! Dense id maps for objects exposed to the guest.
//!
//! Inode ids, file handles and directory handles are all protocol-visible
//! integers, so they come from slabs that reuse small keys instead of hash
//! maps with arbitrary ones.

use std::ffi::CStr;
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::ptr::NonNull;
use std::sync::Mutex;

/// Slab with an intrusive freelist.
///
/// Keys are handed out smallest-free-first and reused after removal.
/// `reserve` pins a specific key, which the startup code uses to give the
/// root inode its protocol-mandated id.
#[derive(Debug)]
pub struct Slab<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<usize>,
    len: usize,
}

#[derive(Debug)]
enum Slot<T> {
    Occupied(T),
    Free { next: Option<usize> },
}

impl<T> Slab<T> {
    pub fn new() -> Slab<T> {
        Slab {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert `value`, returning its key.
    pub fn insert(&mut self, value: T) -> usize {
        self.len += 1;
        match self.free_head {
            Some(key) => {
                let next = match self.slots[key] {
                    Slot::Free { next } => next,
                    Slot::Occupied(_) => unreachable!("freelist points at occupied slot"),
                };
                self.free_head = next;
                self.slots[key] = Slot::Occupied(value);
                key
            }
            None => {
                self.slots.push(Slot::Occupied(value));
                self.slots.len() - 1
            }
        }
    }

    /// Occupy a specific `key`, creating and free-listing any gap below it.
    ///
    /// Returns `false` when the key is already taken.
    pub fn reserve(&mut self, key: usize, value: T) -> bool {
        while self.slots.len() <= key {
            let idx = self.slots.len();
            self.slots.push(Slot::Free {
                next: self.free_head,
            });
            self.free_head = Some(idx);
        }
        match self.slots[key] {
            Slot::Occupied(_) => false,
            Slot::Free { .. } => {
                self.unlink_free(key);
                self.slots[key] = Slot::Occupied(value);
                self.len += 1;
                true
            }
        }
    }

    /// Take `key` out of circulation without storing anything: the slot
    /// can no longer be allocated or resolved. Used to pin down key 0,
    /// which is not a valid protocol id.
    pub fn reserve_unused(&mut self, key: usize) {
        while self.slots.len() <= key {
            let idx = self.slots.len();
            self.slots.push(Slot::Free {
                next: self.free_head,
            });
            self.free_head = Some(idx);
        }
        debug_assert!(matches!(self.slots[key], Slot::Free { .. }));
        self.unlink_free(key);
        self.slots[key] = Slot::Free { next: None };
    }

    pub fn get(&self, key: usize) -> Option<&T> {
        match self.slots.get(key) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut T> {
        match self.slots.get_mut(key) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: usize) -> Option<T> {
        match self.slots.get_mut(key) {
            Some(slot @ Slot::Occupied(_)) => {
                let old = std::mem::replace(
                    slot,
                    Slot::Free {
                        next: self.free_head,
                    },
                );
                self.free_head = Some(key);
                self.len -= 1;
                match old {
                    Slot::Occupied(value) => Some(value),
                    Slot::Free { .. } => unreachable!(),
                }
            }
            _ => None,
        }
    }

    /// Remove every entry `keep` rejects.
    pub fn retain(&mut self, mut keep: impl FnMut(usize, &T) -> bool) {
        for key in 0..self.slots.len() {
            if let Slot::Occupied(value) = &self.slots[key] {
                if !keep(key, value) {
                    self.remove(key);
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots.iter().enumerate().filter_map(|(key, slot)| match slot {
            Slot::Occupied(value) => Some((key, value)),
            Slot::Free { .. } => None,
        })
    }

    fn unlink_free(&mut self, key: usize) {
        let mut cursor = self.free_head;
        let mut prev: Option<usize> = None;
        while let Some(idx) = cursor {
            let next = match self.slots[idx] {
                Slot::Free { next } => next,
                Slot::Occupied(_) => unreachable!("freelist points at occupied slot"),
            };
            if idx == key {
                match prev {
                    Some(prev_idx) => {
                        self.slots[prev_idx] = Slot::Free { next };
                    }
                    None => self.free_head = next,
                }
                return;
            }
            prev = cursor;
            cursor = next;
        }
    }
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One open file exposed to the guest.
#[derive(Debug)]
pub struct HandleData {
    inode: u64,
    file: File,
}

impl HandleData {
    pub fn new(inode: u64, file: File) -> HandleData {
        HandleData { inode, file }
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// One directory entry pulled off a [`DirStream`], owned so it can be held
/// across reply-buffer boundaries.
#[derive(Debug, Clone)]
pub struct OwnedDirent {
    pub ino: u64,
    /// Stream offset of the entry *after* this one.
    pub off: i64,
    pub type_: u32,
    pub name: Vec<u8>,
}

#[derive(Debug)]
struct DirState {
    /// Last stream position handed to the guest; a readdir at this offset
    /// continues without seeking.
    offset: i64,
    /// Entry read but not yet emitted because the reply buffer was full.
    pending: Option<OwnedDirent>,
}

/// Wrapper owning a host directory stream.
///
/// Shared by handle lookups so a concurrent RELEASEDIR cannot close the
/// stream under a reader; the last reference dropping closes it.
#[derive(Debug)]
pub struct DirStream {
    dir: DirPtr,
    state: Mutex<DirState>,
}

// The raw DIR pointer is only touched under the state mutex.
#[derive(Debug)]
struct DirPtr(NonNull<libc::DIR>);
unsafe impl Send for DirPtr {}
unsafe impl Sync for DirPtr {}

impl DirStream {
    /// Take ownership of `file` (an `O_RDONLY` directory fd) as a stream.
    pub fn from_file(file: File) -> io::Result<DirStream> {
        let fd = file.into_raw_fd();
        let dir = unsafe { libc::fdopendir(fd) };
        match NonNull::new(dir) {
            Some(dir) => Ok(DirStream {
                dir: DirPtr(dir),
                state: Mutex::new(DirState {
                    offset: 0,
                    pending: None,
                }),
            }),
            None => {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                Err(err)
            }
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        unsafe { libc::dirfd(self.dir.0.as_ptr()) }
    }

    /// Iterate entries starting at `offset`, seeking only when the stream
    /// is not already positioned there. `emit` returns `false` when its
    /// buffer is full; the rejected entry is kept for the next call.
    pub fn for_each_from(
        &self,
        offset: i64,
        mut emit: impl FnMut(&OwnedDirent) -> io::Result<bool>,
    ) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();

        if offset != state.offset {
            unsafe { libc::seekdir(self.dir.0.as_ptr(), offset) };
            state.pending = None;
            state.offset = offset;
        }

        loop {
            let entry = match state.pending.take() {
                Some(entry) => entry,
                None => match self.next_entry()? {
                    Some(entry) => entry,
                    None => return Ok(()),
                },
            };

            match emit(&entry) {
                Ok(true) => state.offset = entry.off,
                Ok(false) => {
                    state.pending = Some(entry);
                    return Ok(());
                }
                Err(e) => {
                    state.pending = Some(entry);
                    return Err(e);
                }
            }
        }
    }

    fn next_entry(&self) -> io::Result<Option<OwnedDirent>> {
        // readdir returning NULL means either end-of-stream or error;
        // errno tells them apart.
        unsafe { *libc::__errno_location() = 0 };
        let entry = unsafe { libc::readdir64(self.dir.0.as_ptr()) };
        if entry.is_null() {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                None | Some(0) => Ok(None),
                _ => Err(err),
            };
        }

        let entry = unsafe { &*entry };
        let name = unsafe { CStr::from_ptr(entry.d_name.as_ptr()) };
        Ok(Some(OwnedDirent {
            ino: entry.d_ino,
            off: entry.d_off,
            type_: u32::from(entry.d_type),
            name: name.to_bytes().to_vec(),
        }))
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.dir.0.as_ptr()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slab_insert_get_remove() {
        let mut slab = Slab::new();
        let a = slab.insert("a");
        let b = slab.insert("b");
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(slab.get(a), Some(&"a"));
        assert_eq!(slab.len(), 2);

        assert_eq!(slab.remove(a), Some("a"));
        assert_eq!(slab.get(a), None);
        assert_eq!(slab.remove(a), None);
        assert_eq!(slab.len(), 1);
    }

    #[test]
    fn test_slab_reuses_freed_keys() {
        let mut slab = Slab::new();
        let a = slab.insert(1);
        let b = slab.insert(2);
        slab.insert(3);

        slab.remove(b);
        slab.remove(a);

        // Freed keys come back before the slab grows.
        let x = slab.insert(4);
        let y = slab.insert(5);
        let z = slab.insert(6);
        assert!(x < 3 && y < 3);
        assert_eq!(z, 3);
    }

    #[test]
    fn test_slab_reserve_pins_key() {
        let mut slab = Slab::new();
        assert!(slab.reserve(1, "root"));
        assert_eq!(slab.get(1), Some(&"root"));
        assert!(!slab.reserve(1, "other"));

        // Slot 0 was free-listed by the gap fill and is handed out first.
        assert_eq!(slab.insert("first"), 0);
        assert_eq!(slab.insert("second"), 2);
    }

    #[test]
    fn test_slab_reserve_unused_blocks_key() {
        let mut slab = Slab::new();
        slab.reserve_unused(0);
        assert_eq!(slab.get(0), None::<&&str>);

        // Key 0 is never handed out again.
        assert_eq!(slab.insert("a"), 1);
        slab.remove(1);
        assert_eq!(slab.insert("b"), 1);
    }

    #[test]
    fn test_slab_retain() {
        let mut slab = Slab::new();
        for i in 0..6 {
            slab.insert(i);
        }
        slab.retain(|_, v| v % 2 == 0);
        assert_eq!(slab.len(), 3);
        let kept: Vec<_> = slab.iter().map(|(_, v)| *v).collect();
        assert_eq!(kept, vec![0, 2, 4]);
    }

    #[test]
    fn test_dir_stream_lists_and_reseeks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::write(dir.path().join("b"), b"").unwrap();

        let file = File::open(dir.path()).unwrap();
        let stream = DirStream::from_file(file).unwrap();

        let mut names = Vec::new();
        stream
            .for_each_from(0, |entry| {
                names.push(String::from_utf8_lossy(&entry.name).into_owned());
                Ok(true)
            })
            .unwrap();
        names.sort();
        assert_eq!(names, vec![".", "..", "a", "b"]);

        // Restarting from offset zero rewinds.
        let mut count = 0;
        stream
            .for_each_from(0, |_| {
                count += 1;
                Ok(true)
            })
            .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn test_dir_stream_keeps_rejected_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("only"), b"").unwrap();

        let file = File::open(dir.path()).unwrap();
        let stream = DirStream::from_file(file).unwrap();

        // Reject everything: the first entry must be replayed next time.
        let mut first = None;
        stream
            .for_each_from(0, |entry| {
                first = Some(entry.name.clone());
                Ok(false)
            })
            .unwrap();

        let mut replayed = None;
        stream
            .for_each_from(0, |entry| {
                replayed = Some(entry.name.clone());
                Ok(false)
            })
            .unwrap();
        assert_eq!(first, replayed);
    }
}
