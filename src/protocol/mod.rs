//! The block exchange protocol core.
//!
//! A framed, deflate-compressed, bidirectional message channel between
//! two peer nodes. On one connection each side is simultaneously client
//! and server, with many outstanding operations multiplexed over a
//! single transport:
//!
//! ```text
//! owner ops (Index / Request / Ping)          inbound frames
//!            |                                      |
//!            v                                      v
//!   +----------------+   write mutex    +--------------------+
//!   |  FrameWriter   | <--------------- |    reader loop     |
//!   |  (deflate out) |    pong/response |  (deflate in)      |
//!   +----------------+                  +--------------------+
//!            |                             |            |
//!            v                             v            v
//!        transport                   Receiver      pending calls
//! ```
//!
//! Correlated messages (Request/Response, Ping/Pong) share a 12-bit id
//! space assigned modulo 4096 by the sender. The first outgoing index is
//! full; every later one is a delta of entries whose modification stamp
//! changed.

pub mod codec;
pub mod connection;
pub mod message;

mod compress;
mod pending;

pub use codec::{ByteCounter, FrameReader, FrameWriter, MAX_FIELD_LEN, MAX_SEQUENCE_LEN};
pub use connection::{Connection, ConnectionConfig, Receiver, Statistics};
pub use message::{
    BlockInfo, FileFlags, FileInfo, Header, MessageType, Request, MSG_ID_MASK, PROTOCOL_VERSION,
};
