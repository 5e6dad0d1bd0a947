//! Session handshake and dispatch behavior through real descriptor chains.

use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use virtio_queue::mock::MockSplitQueue;
use virtio_queue::Descriptor;
use vm_memory::{ByteValued, Bytes, GuestAddress, GuestMemoryMmap};

use virtshare_fuse::abi::*;
use virtshare_fuse::filesystem::{Context, Entry, FileSystem};
use virtshare_fuse::{Reader, Server, Writer};

const VRING_DESC_F_NEXT: u16 = 0x1;
const VRING_DESC_F_WRITE: u16 = 0x2;

const REQ_ADDR: u64 = 0x1000;
const REPLY_ADDR: u64 = 0x3000;
const REPLY_LEN: u32 = 0x1000;

/// Records which operations were dispatched; lookup succeeds for "present".
#[derive(Default)]
struct RecordingFs {
    lookups: AtomicUsize,
    destroys: AtomicUsize,
}

impl FileSystem for RecordingFs {
    fn init(&self, capable: FsOptions) -> io::Result<FsOptions> {
        Ok(capable & (FsOptions::ASYNC_READ | FsOptions::WRITEBACK_CACHE))
    }

    fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
    }

    fn lookup(&self, _ctx: Context, parent: u64, name: &CString) -> io::Result<Entry> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if parent == ROOT_ID && name.as_bytes() == b"present" {
            let mut st: libc::stat64 = unsafe { std::mem::zeroed() };
            st.st_ino = 33;
            st.st_mode = libc::S_IFREG | 0o644;
            Ok(Entry {
                inode: 2,
                generation: 0,
                attr: st,
                attr_timeout: Duration::from_secs(1),
                entry_timeout: Duration::from_secs(1),
            })
        } else {
            Err(io::Error::from_raw_os_error(libc::ENOENT))
        }
    }
}

fn send<'a>(
    mem: &'a GuestMemoryMmap,
    server: &Server<RecordingFs>,
    header: InHeader,
    body: &[u8],
) -> OutHeader {
    let vq = MockSplitQueue::new(mem, 16);

    let mut request = header.as_slice().to_vec();
    request.extend_from_slice(body);
    mem.write_slice(&request, GuestAddress(REQ_ADDR)).unwrap();

    let chain = vq
        .build_desc_chain(&[
            Descriptor::new(REQ_ADDR, request.len() as u32, VRING_DESC_F_NEXT, 1),
            Descriptor::new(REPLY_ADDR, REPLY_LEN, VRING_DESC_F_WRITE, 0),
        ])
        .unwrap();

    let reader = Reader::new(mem, chain.clone()).unwrap();
    let writer = Writer::new(mem, chain).unwrap();
    server.handle_message(reader, writer).unwrap();

    let mut out = OutHeader::default();
    let mut buf = vec![0u8; size_of::<OutHeader>()];
    mem.read_slice(&mut buf, GuestAddress(REPLY_ADDR)).unwrap();
    out.as_mut_slice().copy_from_slice(&buf);
    out
}

fn header(opcode: Opcode, unique: u64, nodeid: u64, body_len: usize) -> InHeader {
    InHeader {
        len: (size_of::<InHeader>() + body_len) as u32,
        opcode: opcode as u32,
        unique,
        nodeid,
        uid: 1000,
        gid: 1000,
        pid: 4242,
        ..InHeader::default()
    }
}

fn init_in(minor: u32) -> InitIn {
    InitIn {
        major: 7,
        minor,
        max_readahead: 65536,
        flags: u32::MAX,
        flags2: 0,
        ..InitIn::default()
    }
}

#[test]
fn test_request_before_init_is_rejected() {
    let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap();
    let server = Server::new(RecordingFs::default());

    let name = b"present\0";
    let out = send(
        &mem,
        &server,
        header(Opcode::Lookup, 7, ROOT_ID, name.len()),
        name,
    );

    assert_eq!(out.unique, 7);
    assert_eq!(out.error, -libc::EIO);
    assert_eq!(server.filesystem().lookups.load(Ordering::SeqCst), 0);
}

#[test]
fn test_init_rejects_old_minor() {
    let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap();
    let server = Server::new(RecordingFs::default());

    let arg = init_in(27);
    let out = send(
        &mem,
        &server,
        header(Opcode::Init, 1, 0, size_of::<InitIn>()),
        arg.as_slice(),
    );
    assert_eq!(out.error, -libc::EPROTO);
}

#[test]
fn test_init_then_lookup_round_trip() {
    let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap();
    let server = Server::new(RecordingFs::default());

    let arg = init_in(36);
    let out = send(
        &mem,
        &server,
        header(Opcode::Init, 1, 0, size_of::<InitIn>()),
        arg.as_slice(),
    );
    assert_eq!(out.error, 0);

    // The negotiated state reached the session.
    assert!(server.options().contains(FsOptions::ASYNC_READ));
    assert_eq!(server.protocol_version(), (7, 36));

    let name = b"present\0";
    let out = send(
        &mem,
        &server,
        header(Opcode::Lookup, 2, ROOT_ID, name.len()),
        name,
    );
    assert_eq!(out.error, 0);
    assert_eq!(
        out.len as usize,
        size_of::<OutHeader>() + size_of::<EntryOut>()
    );

    let mut entry = EntryOut::default();
    let mut buf = vec![0u8; size_of::<EntryOut>()];
    mem.read_slice(
        &mut buf,
        GuestAddress(REPLY_ADDR + size_of::<OutHeader>() as u64),
    )
    .unwrap();
    entry.as_mut_slice().copy_from_slice(&buf);
    assert_eq!(entry.nodeid, 2);
    assert_eq!(entry.attr.ino, 33);

    let name = b"absent\0";
    let out = send(
        &mem,
        &server,
        header(Opcode::Lookup, 3, ROOT_ID, name.len()),
        name,
    );
    assert_eq!(out.error, -libc::ENOENT);
    assert_eq!(out.unique, 3);
}

#[test]
fn test_reinit_drains_session_first() {
    let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap();
    let server = Server::new(RecordingFs::default());

    let arg = init_in(36);
    send(
        &mem,
        &server,
        header(Opcode::Init, 1, 0, size_of::<InitIn>()),
        arg.as_slice(),
    );
    assert_eq!(server.filesystem().destroys.load(Ordering::SeqCst), 0);

    // A guest reboot re-sends INIT on the live session.
    send(
        &mem,
        &server,
        header(Opcode::Init, 2, 0, size_of::<InitIn>()),
        arg.as_slice(),
    );
    assert_eq!(server.filesystem().destroys.load(Ordering::SeqCst), 1);
}

#[test]
fn test_destroy_then_request_is_rejected() {
    let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap();
    let server = Server::new(RecordingFs::default());

    let arg = init_in(36);
    send(
        &mem,
        &server,
        header(Opcode::Init, 1, 0, size_of::<InitIn>()),
        arg.as_slice(),
    );

    let out = send(&mem, &server, header(Opcode::Destroy, 2, 0, 0), &[]);
    assert_eq!(out.error, 0);
    assert_eq!(server.filesystem().destroys.load(Ordering::SeqCst), 1);

    let name = b"present\0";
    let out = send(
        &mem,
        &server,
        header(Opcode::Lookup, 3, ROOT_ID, name.len()),
        name,
    );
    assert_eq!(out.error, -libc::EIO);
}

#[test]
fn test_unknown_opcode_answers_enosys() {
    let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap();
    let server = Server::new(RecordingFs::default());

    let arg = init_in(36);
    send(
        &mem,
        &server,
        header(Opcode::Init, 1, 0, size_of::<InitIn>()),
        arg.as_slice(),
    );

    let mut h = header(Opcode::Lookup, 9, ROOT_ID, 0);
    h.opcode = 9999;
    let out = send(&mem, &server, h, &[]);
    assert_eq!(out.error, -libc::ENOSYS);
}

#[test]
fn test_interrupt_tracks_unique_ids() {
    let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap();
    let server = Server::new(RecordingFs::default());

    let arg = init_in(36);
    send(
        &mem,
        &server,
        header(Opcode::Init, 1, 0, size_of::<InitIn>()),
        arg.as_slice(),
    );

    let body = InterruptIn { unique: 55 };
    send(
        &mem,
        &server,
        header(Opcode::Interrupt, 2, 0, size_of::<InterruptIn>()),
        body.as_slice(),
    );
    assert!(server.is_interrupted(55));

    // Once the targeted request completes the flag is gone.
    let name = b"present\0";
    send(&mem, &server, header(Opcode::Lookup, 55, ROOT_ID, name.len()), name);
    assert!(!server.is_interrupted(55));
}
