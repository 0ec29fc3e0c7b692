//! Message types and header packing for the block exchange protocol.
//!
//! Wire format: all multi-byte integers are big-endian. Strings and byte
//! slices are length-prefixed (u32 len + bytes); sequences are u32 count +
//! elements. The header packs into a single u32.

use bytes::Bytes;

/// Protocol version carried in the header. Unknown versions are fatal.
pub const PROTOCOL_VERSION: u8 = 0;

/// Outgoing message ids wrap modulo 4096 (12 bits on the wire).
pub const MSG_ID_MASK: u16 = 0x0fff;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Index = 1,
    Request = 2,
    Response = 3,
    Ping = 4,
    Pong = 5,
    IndexUpdate = 6,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Index),
            2 => Some(Self::Request),
            3 => Some(Self::Response),
            4 => Some(Self::Ping),
            5 => Some(Self::Pong),
            6 => Some(Self::IndexUpdate),
            _ => None,
        }
    }
}

// =============================================================================
// Header
// =============================================================================

/// Frame header, packed big-endian into 32 bits:
///
/// ```text
/// | version:4 | msg_id:12 | msg_type:8 | reserved:8 |
/// ```
///
/// Reserved bits are zero on write and ignored on read. The message type
/// is kept raw here so that unknown codes survive until dispatch, where
/// they are treated as a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_id: u16,
    pub msg_type: u8,
}

impl Header {
    pub fn new(msg_id: u16, msg_type: MessageType) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_id: msg_id & MSG_ID_MASK,
            msg_type: msg_type as u8,
        }
    }

    /// Pack into the wire representation.
    pub fn encode(self) -> u32 {
        ((self.version as u32 & 0x0f) << 28)
            | ((self.msg_id as u32 & MSG_ID_MASK as u32) << 16)
            | ((self.msg_type as u32) << 8)
    }

    /// Unpack from the wire representation.
    pub fn decode(v: u32) -> Self {
        Self {
            version: ((v >> 28) & 0x0f) as u8,
            msg_id: ((v >> 16) & MSG_ID_MASK as u32) as u16,
            msg_type: ((v >> 8) & 0xff) as u8,
        }
    }
}

// =============================================================================
// File Flags
// =============================================================================

bitflags::bitflags! {
    /// Typed view of the `FileInfo` flags word. The low 12 bits carry Unix
    /// permissions; the delta engine never interprets any of this.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileFlags: u32 {
        const DELETED = 1 << 12;
        const INVALID = 1 << 13;
        const NO_PERM_BITS = 1 << 14;
    }
}

// =============================================================================
// Index entries
// =============================================================================

/// Descriptor of one file version, as exchanged in Index/IndexUpdate
/// frames. `name` is the folder-relative path; `modified` is a unix-epoch
/// stamp treated as an opaque version by the delta logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub flags: u32,
    pub modified: i64,
    pub blocks: Vec<BlockInfo>,
}

impl FileInfo {
    /// Typed view of the flags word.
    pub fn file_flags(&self) -> FileFlags {
        FileFlags::from_bits_truncate(self.flags)
    }

    /// Whether this entry announces a deletion.
    pub fn is_deleted(&self) -> bool {
        self.file_flags().contains(FileFlags::DELETED)
    }

    /// Sum of block lengths.
    pub fn size(&self) -> u64 {
        self.blocks.iter().map(|b| b.length as u64).sum()
    }
}

/// A single content-addressed extent of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub length: u32,
    pub hash: Bytes,
}

// =============================================================================
// Request
// =============================================================================

/// A block request: fetch `size` bytes of `name` at `offset`, expected to
/// hash to `hash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub name: String,
    pub offset: u64,
    pub size: u32,
    pub hash: Bytes,
}

// =============================================================================
// Tests
// =============================================================================
