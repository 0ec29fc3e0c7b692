//! Framed reader/writer for the block exchange wire format.
//!
//! All multi-byte integers are big-endian. Strings and byte slices are
//! length-prefixed (u32 len + bytes); sequences are u32 count + elements.
//! Frame bodies are built in a `BytesMut` and written in one piece; reads
//! pull fields straight off the stream.
//!
//! Each side keeps a cumulative byte counter. The counters sit behind a
//! shared atomic so the statistics sampler can read them from another task
//! without touching the codec itself.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SyncError};
use crate::protocol::message::{BlockInfo, FileInfo, Header, Request};

/// Upper bound for any single length-prefixed field. Checked before
/// allocation so a corrupt or hostile length cannot OOM the process.
pub const MAX_FIELD_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Upper bound for any sequence count.
pub const MAX_SEQUENCE_LEN: u32 = 1 << 20;

fn invalid_data(msg: String) -> SyncError {
    SyncError::Codec(io::Error::new(io::ErrorKind::InvalidData, msg))
}

/// Monotonic byte counter shared between a codec half and its observers.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Cumulative bytes moved through this side of the codec.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Serializes frames onto an `AsyncWrite`.
pub struct FrameWriter<W> {
    w: W,
    tot: ByteCounter,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(w: W) -> Self {
        Self {
            w,
            tot: ByteCounter::default(),
        }
    }

    /// Handle on the cumulative bytes-written counter.
    pub fn counter(&self) -> ByteCounter {
        self.tot.clone()
    }

    /// Unwrap the underlying writer.
    pub fn into_inner(self) -> W {
        self.w
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.w.write_all(buf).await?;
        self.tot.add(buf.len() as u64);
        Ok(())
    }

    pub async fn write_header(&mut self, hdr: Header) -> Result<()> {
        self.write_all(&hdr.encode().to_be_bytes()).await
    }

    /// Write a sequence of file entries (the body of an Index or
    /// IndexUpdate frame).
    pub async fn write_index<'a, I>(&mut self, files: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a FileInfo>,
        I::IntoIter: ExactSizeIterator,
    {
        let files = files.into_iter();
        let mut buf = BytesMut::new();
        buf.put_u32(files.len() as u32);
        for f in files {
            encode_file_info(&mut buf, f);
        }
        self.write_all(&buf).await
    }

    pub async fn write_request(&mut self, req: &Request) -> Result<()> {
        let name = req.name.as_bytes();
        let mut buf = BytesMut::with_capacity(4 + name.len() + 8 + 4 + 4 + req.hash.len());
        put_bytes(&mut buf, name);
        buf.put_u64(req.offset);
        buf.put_u32(req.size);
        put_bytes(&mut buf, &req.hash);
        self.write_all(&buf).await
    }

    pub async fn write_response(&mut self, data: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(4 + data.len());
        put_bytes(&mut buf, data);
        self.write_all(&buf).await
    }

    /// Flush the frame out of the compressor so the peer's reader can make
    /// progress. Called after every frame, inside the write critical
    /// section.
    pub async fn flush(&mut self) -> Result<()> {
        self.w.flush().await?;
        Ok(())
    }
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
}

fn encode_file_info(buf: &mut BytesMut, f: &FileInfo) {
    put_bytes(buf, f.name.as_bytes());
    buf.put_u32(f.flags);
    buf.put_i64(f.modified);
    buf.put_u32(f.blocks.len() as u32);
    for b in &f.blocks {
        buf.put_u32(b.length);
        put_bytes(buf, &b.hash);
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Deserializes frames from an `AsyncRead`.
pub struct FrameReader<R> {
    r: R,
    tot: ByteCounter,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(r: R) -> Self {
        Self {
            r,
            tot: ByteCounter::default(),
        }
    }

    /// Handle on the cumulative bytes-read counter.
    pub fn counter(&self) -> ByteCounter {
        self.tot.clone()
    }

    async fn read_u32(&mut self) -> Result<u32> {
        let v = self.r.read_u32().await?;
        self.tot.add(4);
        Ok(v)
    }

    async fn read_u64(&mut self) -> Result<u64> {
        let v = self.r.read_u64().await?;
        self.tot.add(8);
        Ok(v)
    }

    async fn read_i64(&mut self) -> Result<i64> {
        let v = self.r.read_i64().await?;
        self.tot.add(8);
        Ok(v)
    }

    async fn read_count(&mut self) -> Result<u32> {
        let n = self.read_u32().await?;
        if n > MAX_SEQUENCE_LEN {
            return Err(invalid_data(format!(
                "sequence count {} exceeds limit {}",
                n, MAX_SEQUENCE_LEN
            )));
        }
        Ok(n)
    }

    async fn read_bytes(&mut self) -> Result<Bytes> {
        let len = self.read_u32().await?;
        if len > MAX_FIELD_LEN {
            return Err(invalid_data(format!(
                "field length {} exceeds limit {}",
                len, MAX_FIELD_LEN
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.r.read_exact(&mut buf).await?;
        self.tot.add(len as u64);
        Ok(Bytes::from(buf))
    }

    async fn read_string(&mut self) -> Result<String> {
        let raw = self.read_bytes().await?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| invalid_data(format!("invalid UTF-8 in string field: {}", e)))
    }

    pub async fn read_header(&mut self) -> Result<Header> {
        Ok(Header::decode(self.read_u32().await?))
    }

    /// Read the body of an Index or IndexUpdate frame.
    pub async fn read_index(&mut self) -> Result<Vec<FileInfo>> {
        let count = self.read_count().await?;
        let mut files = Vec::new();
        for _ in 0..count {
            files.push(self.read_file_info().await?);
        }
        Ok(files)
    }

    async fn read_file_info(&mut self) -> Result<FileInfo> {
        let name = self.read_string().await?;
        let flags = self.read_u32().await?;
        let modified = self.read_i64().await?;
        let block_count = self.read_count().await?;
        let mut blocks = Vec::new();
        for _ in 0..block_count {
            let length = self.read_u32().await?;
            let hash = self.read_bytes().await?;
            blocks.push(BlockInfo { length, hash });
        }
        Ok(FileInfo {
            name,
            flags,
            modified,
            blocks,
        })
    }

    pub async fn read_request(&mut self) -> Result<Request> {
        let name = self.read_string().await?;
        let offset = self.read_u64().await?;
        let size = self.read_u32().await?;
        let hash = self.read_bytes().await?;
        Ok(Request {
            name,
            offset,
            size,
            hash,
        })
    }

    pub async fn read_response(&mut self) -> Result<Bytes> {
        self.read_bytes().await
    }
}

// =============================================================================
// Tests
// =============================================================================
