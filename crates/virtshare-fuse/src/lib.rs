//! FUSE-over-virtio protocol layer.
//!
//! Wire definitions, descriptor-chain codecs, the [`FileSystem`] trait and
//! the [`Server`] dispatcher that connects them. The transport (vhost-user
//! virtqueues) and the filesystem implementation live in their own crates.

use thiserror::Error;

pub mod abi;
pub mod buffer;
pub mod filesystem;
pub mod server;

pub use buffer::{Reader, Writer};
pub use filesystem::{Context, Entry, FileSystem};
pub use server::Server;

/// Transport-level failures while handling a request chain.
///
/// Per-operation failures never surface here; they become error replies to
/// the guest. An `Error` means the chain itself was unusable.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to decode request header: {0}")]
    DecodeMessage(#[source] std::io::Error),

    #[error("failed to encode reply: {0}")]
    EncodeMessage(#[source] std::io::Error),

    #[error("request header carries impossible length {0}")]
    InvalidHeaderLength(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
