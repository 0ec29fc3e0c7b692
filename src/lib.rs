//! Core of a peer-to-peer block synchronization protocol.
//!
//! Two nodes exchange file-metadata indexes, serve block requests, and
//! keep the link alive over one framed, deflate-compressed byte stream.
//! The crate owns the wire codec, the connection state machine, the
//! request/reply correlation table, keep-alive, and the index-delta
//! computation. Everything else is a collaborator:
//!
//! - the file/block store behind the [`Receiver`] capability,
//! - the transport supplying the byte-stream reader and writer,
//! - the application that drives sync policy and owns the connection.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use syncproto::{Connection, Receiver};
//!
//! # async fn open(store: Arc<dyn Receiver>) {
//! let (stream, _remote) = tokio::io::duplex(64 * 1024);
//! let (reader, writer) = tokio::io::split(stream);
//! let conn = Connection::new("node-b", reader, writer, store);
//!
//! let data = conn.request("photos/a.jpg", 0, 128 * 1024, &[0xab; 32]).await;
//! # let _ = data;
//! # }
//! ```
//!
//! The connection spawns its reader loop and keep-alive task on the
//! current tokio runtime. A broken link terminates all outstanding calls
//! with [`SyncError::Closed`]; there is no retransmission across
//! connections.

pub mod error;
pub mod protocol;

pub use error::{Result, SyncError};
pub use protocol::{
    BlockInfo, Connection, ConnectionConfig, FileFlags, FileInfo, Header, MessageType, Receiver,
    Request, Statistics, PROTOCOL_VERSION,
};
