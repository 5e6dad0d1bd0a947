//! vhost-user backend: virtqueue processing for the FUSE device.
//!
//! The vhost-user harness owns the master socket, the guest memory table
//! and one epoll thread per virtqueue; each thread waits on its queue's
//! kick eventfd and a kill eventfd. This module adds the FUSE layer: pop
//! descriptor chains, hand each one to the request dispatcher (inline or
//! on the worker pool), copy nothing that does not need copying, and push
//! the used element back.

use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam_channel::Sender;
use tracing::{debug, error, warn};
use vhost::vhost_user::message::{VhostUserProtocolFeatures, VhostUserVirtioFeatures};
use vhost_user_backend::{VhostUserBackend, VringMutex, VringT};
use virtio_bindings::virtio_config::VIRTIO_F_VERSION_1;
use virtio_bindings::virtio_ring::{VIRTIO_RING_F_EVENT_IDX, VIRTIO_RING_F_INDIRECT_DESC};
use virtio_queue::{DescriptorChain, QueueOwnedT};
use vm_memory::{GuestAddressSpace, GuestMemoryAtomic, GuestMemoryLoadGuard, GuestMemoryMmap};
use vmm_sys_util::epoll::EventSet;
use vmm_sys_util::eventfd::EventFd;
use virtshare_fuse::{Reader, Server, Writer};
use virtshare_passthrough::PassthroughFs;

/// Control queue index.
const HIPRIO_QUEUE: u16 = 0;
/// Request queue index.
const REQUEST_QUEUE: u16 = 1;

const NUM_QUEUES: usize = 2;
const QUEUE_SIZE: usize = 1024;

type AtomicMem = GuestMemoryAtomic<GuestMemoryMmap>;
type Chain = DescriptorChain<GuestMemoryLoadGuard<GuestMemoryMmap>>;

fn other<E: std::fmt::Display>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

thread_local! {
    static CLONE_FS_DONE: Cell<bool> = const { Cell::new(false) };
}

/// Give this thread a private filesystem context, once. Handlers `fchdir`
/// for xattr access on special files; without CLONE_FS that would move
/// every sibling thread's working directory.
fn ensure_private_fs_context() {
    CLONE_FS_DONE.with(|done| {
        if done.get() {
            return;
        }
        if unsafe { libc::unshare(libc::CLONE_FS) } != 0 {
            // Startup validated this; failing now means the environment
            // changed under us.
            error!(
                error = %io::Error::last_os_error(),
                "unshare(CLONE_FS) failed on worker thread"
            );
            std::process::abort();
        }
        done.set(true);
    });
}

/// Fixed-size worker pool fed over an unbounded channel.
struct ThreadPool {
    sender: Sender<Box<dyn FnOnce() + Send>>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl ThreadPool {
    fn new(size: usize) -> ThreadPool {
        let (sender, receiver) = crossbeam_channel::unbounded::<Box<dyn FnOnce() + Send>>();
        let workers = (0..size)
            .map(|i| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("virtshared-worker-{i}"))
                    .spawn(move || {
                        ensure_private_fs_context();
                        // The loop ends when the sender side is dropped.
                        for job in receiver.iter() {
                            job();
                        }
                    })
                    .expect("spawn worker thread")
            })
            .collect();
        ThreadPool { sender, workers }
    }

    fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if self.sender.send(Box::new(job)).is_err() {
            warn!("worker pool is shut down, dropping request");
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Disconnect the channel, then wait for in-flight requests.
        let (dead_sender, _) = crossbeam_channel::bounded(0);
        self.sender = dead_sender;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// The FUSE device backend handed to the vhost-user daemon harness.
pub struct FsBackend {
    server: Arc<Server<PassthroughFs>>,
    mem: RwLock<Option<AtomicMem>>,
    event_idx: AtomicBool,
    /// One kill eventfd per queue thread; also signalled on SIGTERM.
    exit_events: Vec<EventFd>,
    pool: Option<ThreadPool>,
}

impl FsBackend {
    pub fn new(server: Arc<Server<PassthroughFs>>, thread_pool_size: usize) -> io::Result<FsBackend> {
        let exit_events = (0..NUM_QUEUES)
            .map(|_| EventFd::new(libc::EFD_NONBLOCK))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FsBackend {
            server,
            mem: RwLock::new(None),
            event_idx: AtomicBool::new(false),
            exit_events,
            pool: (thread_pool_size > 0).then(|| ThreadPool::new(thread_pool_size)),
        })
    }

    /// Ask every queue thread to wind down.
    pub fn request_exit(&self) {
        for event in &self.exit_events {
            if let Err(e) = event.write(1) {
                error!(error = %e, "failed to signal queue exit");
            }
        }
    }

    /// Raw descriptors of the exit eventfds, for the signal handler.
    pub fn exit_event_fds(&self) -> Vec<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;
        self.exit_events.iter().map(|e| e.as_raw_fd()).collect()
    }

    fn process_queue(&self, vring: &VringMutex) -> io::Result<()> {
        let mem = self
            .mem
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| other("guest memory is not mapped"))?;

        let chains: Vec<Chain> = vring
            .get_mut()
            .get_queue_mut()
            .iter(mem.memory())
            .map_err(other)?
            .collect();

        let event_idx = self.event_idx.load(Ordering::Relaxed);
        for chain in chains {
            match &self.pool {
                Some(pool) => {
                    let server = Arc::clone(&self.server);
                    let vring = vring.clone();
                    pool.execute(move || handle_chain(&server, &vring, chain, event_idx));
                }
                None => handle_chain(&self.server, vring, chain, event_idx),
            }
        }
        Ok(())
    }
}

/// Process one popped chain: parse, dispatch, push the used element.
///
/// A chain that produced no reply (no-reply message, or a failed handler)
/// is still pushed with length zero so every pop has its matching push.
fn handle_chain(
    server: &Server<PassthroughFs>,
    vring: &VringMutex,
    chain: Chain,
    event_idx: bool,
) {
    ensure_private_fs_context();

    let head_index = chain.head_index();
    let mem = chain.memory();

    let len = Reader::new(mem, chain.clone())
        .and_then(|reader| Writer::new(mem, chain.clone()).map(|writer| (reader, writer)))
        .map_err(other)
        .and_then(|(reader, writer)| server.handle_message(reader, writer).map_err(other))
        .unwrap_or_else(|e| {
            error!(error = %e, "request failed without a reply");
            0
        });

    if let Err(e) = vring.add_used(head_index, len as u32) {
        error!(error = %e, "failed to return used descriptor");
        return;
    }

    let notify = if event_idx {
        vring.needs_notification().unwrap_or(true)
    } else {
        true
    };
    if notify {
        if let Err(e) = vring.signal_used_queue() {
            error!(error = %e, "failed to signal used queue");
        }
    }
}

impl VhostUserBackend for FsBackend {
    type Bitmap = ();
    type Vring = VringMutex;

    fn num_queues(&self) -> usize {
        NUM_QUEUES
    }

    fn max_queue_size(&self) -> usize {
        QUEUE_SIZE
    }

    fn features(&self) -> u64 {
        1 << VIRTIO_F_VERSION_1
            | 1 << VIRTIO_RING_F_INDIRECT_DESC
            | 1 << VIRTIO_RING_F_EVENT_IDX
            | VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits()
    }

    fn protocol_features(&self) -> VhostUserProtocolFeatures {
        VhostUserProtocolFeatures::MQ
            | VhostUserProtocolFeatures::REPLY_ACK
            | VhostUserProtocolFeatures::CONFIGURE_MEM_SLOTS
    }

    fn set_event_idx(&self, enabled: bool) {
        self.event_idx.store(enabled, Ordering::Relaxed);
    }

    fn update_memory(&self, mem: AtomicMem) -> io::Result<()> {
        debug!("guest memory table updated");
        *self.mem.write().unwrap() = Some(mem);
        Ok(())
    }

    fn queues_per_thread(&self) -> Vec<u64> {
        // One epoll thread per queue.
        vec![1 << HIPRIO_QUEUE, 1 << REQUEST_QUEUE]
    }

    fn exit_event(&self, thread_index: usize) -> Option<EventFd> {
        self.exit_events
            .get(thread_index)
            .and_then(|event| event.try_clone().ok())
    }

    fn handle_event(
        &self,
        device_event: u16,
        evset: EventSet,
        vrings: &[VringMutex],
        _thread_id: usize,
    ) -> io::Result<()> {
        if evset != EventSet::IN {
            return Err(other(format!("unexpected event set {evset:?}")));
        }

        let vring = match device_event {
            HIPRIO_QUEUE | REQUEST_QUEUE => vrings
                .get(device_event as usize)
                .ok_or_else(|| other("queue index out of range"))?,
            other_event => {
                return Err(other(format!("unknown device event {other_event}")));
            }
        };

        if self.event_idx.load(Ordering::Relaxed) {
            // With EVENT_IDX the guest only kicks when asked to; drain
            // until enabling notifications reports an empty ring.
            loop {
                vring.disable_notification().map_err(other)?;
                self.process_queue(vring)?;
                if !vring.enable_notification().map_err(other)? {
                    break;
                }
            }
        } else {
            self.process_queue(vring)?;
        }
        Ok(())
    }
}
