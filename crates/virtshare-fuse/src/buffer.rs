//! Scatter/gather cursors over virtqueue descriptor chains.
//!
//! A request chain carries device-readable descriptors (the FUSE request)
//! followed by device-writable descriptors (room for the reply). [`Reader`]
//! consumes the readable part, [`Writer`] fills the writable part. Both
//! operate directly on mapped guest memory so bulk data is never copied
//! through an intermediate buffer.

use std::collections::VecDeque;
use std::ffi::CString;
use std::io::{self, Read, Write};
use std::mem::{size_of, MaybeUninit};
use std::ops::Deref;
use std::os::unix::io::RawFd;

use virtio_queue::DescriptorChain;
use vm_memory::{ByteValued, GuestMemory, GuestMemoryRegion, VolatileSlice};

fn invalid_chain<E: std::error::Error + Send + Sync + 'static>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Cursor over the device-readable portion of a descriptor chain.
pub struct Reader<'a> {
    buffers: VecDeque<VolatileSlice<'a>>,
    bytes_consumed: usize,
}

impl<'a> Reader<'a> {
    /// Collect the readable descriptors of `chain`, resolving each into a
    /// volatile slice of `mem`.
    pub fn new<M, T>(mem: &'a M, chain: DescriptorChain<T>) -> io::Result<Reader<'a>>
    where
        M: GuestMemory + ?Sized,
        M::R: GuestMemoryRegion<B = ()>,
        T: Deref + Clone,
        T::Target: GuestMemory,
    {
        let mut buffers = VecDeque::new();
        for desc in chain {
            if desc.is_write_only() {
                break;
            }
            let slice = mem
                .get_slice(desc.addr(), desc.len() as usize)
                .map_err(invalid_chain)?;
            buffers.push_back(slice);
        }

        Ok(Reader {
            buffers,
            bytes_consumed: 0,
        })
    }

    /// Bytes not yet consumed.
    pub fn available_bytes(&self) -> usize {
        self.buffers.iter().map(VolatileSlice::len).sum()
    }

    /// Bytes consumed so far.
    pub fn bytes_read(&self) -> usize {
        self.bytes_consumed
    }

    /// Read one wire struct from the head of the buffer.
    pub fn read_obj<T: ByteValued>(&mut self) -> io::Result<T> {
        let mut out = MaybeUninit::<T>::uninit();
        // ByteValued types accept any byte pattern, so filling the value
        // byte-wise and assuming init is sound.
        let buf = unsafe {
            std::slice::from_raw_parts_mut(out.as_mut_ptr().cast::<u8>(), size_of::<T>())
        };
        self.read_exact(buf)?;
        Ok(unsafe { out.assume_init() })
    }

    /// Read a NUL-terminated string from the head of the buffer, consuming
    /// the terminator.
    pub fn read_cstring(&mut self) -> io::Result<CString> {
        let mut collected = Vec::new();
        loop {
            let slice = match self.buffers.front() {
                Some(s) => *s,
                None => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
            };
            let mut chunk = vec![0u8; slice.len()];
            slice.copy_to(&mut chunk[..]);
            if let Some(pos) = chunk.iter().position(|&b| b == 0) {
                collected.extend_from_slice(&chunk[..pos]);
                self.consume(pos + 1);
                break;
            }
            collected.extend_from_slice(&chunk);
            self.consume(chunk.len());
        }
        CString::new(collected).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
    }

    /// Splice up to `count` bytes from the buffer into `fd` at `offset`,
    /// without copying them through server memory.
    pub fn read_to_file_at(&mut self, fd: RawFd, count: usize, offset: u64) -> io::Result<usize> {
        let mut total = 0usize;
        let mut off = offset;
        while total < count {
            let mut iovecs = Vec::new();
            let mut guards = Vec::new();
            let mut len = 0usize;
            for slice in &self.buffers {
                if len >= count - total {
                    break;
                }
                let take = (count - total - len).min(slice.len());
                let guard = slice.ptr_guard_mut();
                iovecs.push(libc::iovec {
                    iov_base: guard.as_ptr().cast::<libc::c_void>(),
                    iov_len: take,
                });
                guards.push(guard);
                len += take;
            }
            if iovecs.is_empty() {
                break;
            }
            let ret = unsafe {
                libc::pwritev(fd, iovecs.as_ptr(), iovecs.len() as libc::c_int, off as libc::off_t)
            };
            drop(guards);
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            let written = ret as usize;
            self.consume(written);
            total += written;
            off += written as u64;
            if written < len {
                break;
            }
        }
        Ok(total)
    }

    fn consume(&mut self, mut count: usize) {
        while count > 0 {
            let slice = match self.buffers.pop_front() {
                Some(s) => s,
                None => return,
            };
            if count < slice.len() {
                // Safe split: count is strictly inside the slice.
                let rest = slice.offset(count).expect("offset within slice");
                self.buffers.push_front(rest);
                self.bytes_consumed += count;
                return;
            }
            count -= slice.len();
            self.bytes_consumed += slice.len();
        }
    }
}

impl Read for Reader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let slice = match self.buffers.front() {
            Some(s) => *s,
            None => return Ok(0),
        };
        let count = buf.len().min(slice.len());
        slice.copy_to(&mut buf[..count]);
        self.consume(count);
        Ok(count)
    }
}

/// Cursor over the device-writable portion of a descriptor chain.
pub struct Writer<'a> {
    buffers: VecDeque<VolatileSlice<'a>>,
    bytes_written: usize,
}

impl<'a> Writer<'a> {
    /// Collect the writable descriptors of `chain`.
    pub fn new<M, T>(mem: &'a M, chain: DescriptorChain<T>) -> io::Result<Writer<'a>>
    where
        M: GuestMemory + ?Sized,
        M::R: GuestMemoryRegion<B = ()>,
        T: Deref + Clone,
        T::Target: GuestMemory,
    {
        let mut buffers = VecDeque::new();
        for desc in chain {
            if !desc.is_write_only() {
                continue;
            }
            let slice = mem
                .get_slice(desc.addr(), desc.len() as usize)
                .map_err(invalid_chain)?;
            buffers.push_back(slice);
        }

        Ok(Writer {
            buffers,
            bytes_written: 0,
        })
    }

    /// Room left for reply bytes.
    pub fn available_bytes(&self) -> usize {
        self.buffers.iter().map(VolatileSlice::len).sum()
    }

    /// Bytes committed to guest memory so far.
    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    /// Write one wire struct at the cursor.
    pub fn write_obj<T: ByteValued>(&mut self, obj: T) -> io::Result<()> {
        self.write_all(obj.as_slice())
    }

    /// Split the writable area: `self` keeps the first `offset` bytes, the
    /// returned writer owns the rest. Used to reserve header room before a
    /// handler produces the data that determines the header contents.
    pub fn split_at(&mut self, offset: usize) -> io::Result<Writer<'a>> {
        let mut remaining = offset;
        let mut head = VecDeque::new();
        while remaining > 0 {
            let slice = match self.buffers.pop_front() {
                Some(s) => s,
                None => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
            };
            if remaining < slice.len() {
                let first = slice.subslice(0, remaining).expect("subslice within slice");
                let rest = slice.offset(remaining).expect("offset within slice");
                head.push_back(first);
                self.buffers.push_front(rest);
                remaining = 0;
            } else {
                remaining -= slice.len();
                head.push_back(slice);
            }
        }

        let tail = std::mem::replace(&mut self.buffers, head);
        Ok(Writer {
            buffers: tail,
            bytes_written: 0,
        })
    }

    /// Fill the writable area with up to `count` bytes read from `fd` at
    /// `offset`. Returns the number of bytes actually read, which is short
    /// when the file ends first.
    pub fn write_from_file_at(&mut self, fd: RawFd, count: usize, offset: u64) -> io::Result<usize> {
        let mut total = 0usize;
        let mut off = offset;
        while total < count {
            let mut iovecs = Vec::new();
            let mut guards = Vec::new();
            let mut len = 0usize;
            for slice in &self.buffers {
                if len >= count - total {
                    break;
                }
                let take = (count - total - len).min(slice.len());
                let guard = slice.ptr_guard_mut();
                iovecs.push(libc::iovec {
                    iov_base: guard.as_ptr().cast::<libc::c_void>(),
                    iov_len: take,
                });
                guards.push(guard);
                len += take;
            }
            if iovecs.is_empty() {
                break;
            }
            let ret = unsafe {
                libc::preadv(fd, iovecs.as_ptr(), iovecs.len() as libc::c_int, off as libc::off_t)
            };
            drop(guards);
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            if ret == 0 {
                break;
            }
            let read = ret as usize;
            self.advance(read);
            total += read;
            off += read as u64;
            if read < len {
                break;
            }
        }
        Ok(total)
    }

    fn advance(&mut self, mut count: usize) {
        while count > 0 {
            let slice = match self.buffers.pop_front() {
                Some(s) => s,
                None => return,
            };
            if count < slice.len() {
                let rest = slice.offset(count).expect("offset within slice");
                self.buffers.push_front(rest);
                self.bytes_written += count;
                return;
            }
            count -= slice.len();
            self.bytes_written += slice.len();
        }
    }
}

impl Write for Writer<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let slice = match self.buffers.front() {
            Some(s) => *s,
            None => {
                return Err(io::Error::from_raw_os_error(libc::ENOSPC));
            }
        };
        let count = buf.len().min(slice.len());
        slice.copy_from(&buf[..count]);
        self.advance(count);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        // Writes land directly in guest memory.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read as _, Write as _};

    use virtio_queue::mock::MockSplitQueue;
    use virtio_queue::Descriptor;
    use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

    use super::*;
    use crate::abi::InHeader;

    const VRING_DESC_F_NEXT: u16 = 0x1;
    const VRING_DESC_F_WRITE: u16 = 0x2;

    fn test_memory() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap()
    }

    #[test]
    fn test_reader_consumes_readable_descriptors() {
        let mem = test_memory();
        let vq = MockSplitQueue::new(&mem, 16);
        let chain = vq
            .build_desc_chain(&[
                Descriptor::new(0x1000, 8, VRING_DESC_F_NEXT, 1),
                Descriptor::new(0x2000, 8, 0, 0),
            ])
            .unwrap();

        mem.write_slice(&[1, 2, 3, 4, 5, 6, 7, 8], GuestAddress(0x1000))
            .unwrap();
        mem.write_slice(&[9, 10, 11, 12, 13, 14, 15, 16], GuestAddress(0x2000))
            .unwrap();

        let mut reader = Reader::new(&mem, chain).unwrap();
        assert_eq!(reader.available_bytes(), 16);

        let mut buf = [0u8; 10];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(reader.bytes_read(), 10);
        assert_eq!(reader.available_bytes(), 6);
    }

    #[test]
    fn test_reader_obj_and_cstring() {
        let mem = test_memory();
        let vq = MockSplitQueue::new(&mem, 16);
        let chain = vq
            .build_desc_chain(&[Descriptor::new(0x1000, 0x100, 0, 0)])
            .unwrap();

        let header = InHeader {
            len: 48,
            opcode: 1,
            unique: 42,
            nodeid: 1,
            uid: 1000,
            gid: 1000,
            pid: 1234,
            ..InHeader::default()
        };
        mem.write_slice(header.as_slice(), GuestAddress(0x1000))
            .unwrap();
        mem.write_slice(b"hello\0", GuestAddress(0x1000 + 40)).unwrap();

        let mut reader = Reader::new(&mem, chain).unwrap();
        let parsed: InHeader = reader.read_obj().unwrap();
        assert_eq!(parsed.unique, 42);
        assert_eq!(parsed.uid, 1000);

        let name = reader.read_cstring().unwrap();
        assert_eq!(name.as_bytes(), b"hello");
    }

    #[test]
    fn test_reader_rejects_truncated_obj() {
        let mem = test_memory();
        let vq = MockSplitQueue::new(&mem, 16);
        let chain = vq
            .build_desc_chain(&[Descriptor::new(0x1000, 4, 0, 0)])
            .unwrap();

        let mut reader = Reader::new(&mem, chain).unwrap();
        assert!(reader.read_obj::<InHeader>().is_err());
    }

    #[test]
    fn test_writer_fills_writable_descriptors() {
        let mem = test_memory();
        let vq = MockSplitQueue::new(&mem, 16);
        let chain = vq
            .build_desc_chain(&[
                Descriptor::new(0x1000, 8, VRING_DESC_F_NEXT, 1),
                Descriptor::new(0x2000, 4, VRING_DESC_F_NEXT | VRING_DESC_F_WRITE, 2),
                Descriptor::new(0x3000, 4, VRING_DESC_F_WRITE, 0),
            ])
            .unwrap();

        let mut writer = Writer::new(&mem, chain).unwrap();
        assert_eq!(writer.available_bytes(), 8);

        writer.write_all(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(writer.bytes_written(), 6);

        let mut buf = [0u8; 4];
        mem.read_slice(&mut buf, GuestAddress(0x2000)).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        let mut buf2 = [0u8; 2];
        mem.read_slice(&mut buf2, GuestAddress(0x3000)).unwrap();
        assert_eq!(buf2, [5, 6]);
    }

    #[test]
    fn test_writer_split_reserves_header_room() {
        let mem = test_memory();
        let vq = MockSplitQueue::new(&mem, 16);
        let chain = vq
            .build_desc_chain(&[Descriptor::new(0x1000, 0x100, VRING_DESC_F_WRITE, 0)])
            .unwrap();

        let mut header_writer = Writer::new(&mem, chain).unwrap();
        let mut data_writer = header_writer.split_at(16).unwrap();
        assert_eq!(header_writer.available_bytes(), 16);
        assert_eq!(data_writer.available_bytes(), 0x100 - 16);

        data_writer.write_all(b"payload").unwrap();
        header_writer.write_all(&[0xffu8; 16]).unwrap();

        let mut buf = [0u8; 7];
        mem.read_slice(&mut buf, GuestAddress(0x1010)).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn test_writer_reports_overflow() {
        let mem = test_memory();
        let vq = MockSplitQueue::new(&mem, 16);
        let chain = vq
            .build_desc_chain(&[Descriptor::new(0x1000, 4, VRING_DESC_F_WRITE, 0)])
            .unwrap();

        let mut writer = Writer::new(&mem, chain).unwrap();
        assert!(writer.write_all(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_file_round_trip_through_guest_memory() {
        use std::io::Seek;

        let mem = test_memory();
        let vq = MockSplitQueue::new(&mem, 16);

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.rewind().unwrap();

        // Fill writable descriptors straight from the file.
        let chain = vq
            .build_desc_chain(&[Descriptor::new(0x1000, 16, VRING_DESC_F_WRITE, 0)])
            .unwrap();
        let mut writer = Writer::new(&mem, chain).unwrap();
        let n = writer
            .write_from_file_at(std::os::unix::io::AsRawFd::as_raw_fd(&file), 16, 0)
            .unwrap();
        assert_eq!(n, 10);

        // And write a readable descriptor back out to another file.
        let chain = vq
            .build_desc_chain(&[Descriptor::new(0x1000, 10, 0, 0)])
            .unwrap();
        let mut reader = Reader::new(&mem, chain).unwrap();
        let out = tempfile::tempfile().unwrap();
        let n = reader
            .read_to_file_at(std::os::unix::io::AsRawFd::as_raw_fd(&out), 10, 0)
            .unwrap();
        assert_eq!(n, 10);

        let mut check = String::new();
        let mut out = out;
        out.rewind().unwrap();
        out.read_to_string(&mut check).unwrap();
        assert_eq!(check, "0123456789");
    }
}
