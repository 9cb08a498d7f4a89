//! Server side of the Network Block Device (NBD) wire protocol.
//!
//! The crate implements the fixed-newstyle handshake and the transmission
//! phase over any reliable byte stream, and dispatches block I/O to a
//! pluggable [`Backend`]. TCP plumbing lives in [`server::Server`]; two
//! ready-made backends (in-memory and file-backed) live in [`backend`].
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description.

pub mod backend;
pub mod proto;
pub mod server;

pub use backend::{
    Backend, BackendFactory, ExportInfo, FileBackend, FileBackendFactory, MemBackend,
    MemBackendFactory,
};
pub use server::{handle_client, Server};
