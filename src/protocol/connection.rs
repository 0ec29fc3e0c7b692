//! Connection state machine for the block exchange protocol.
//!
//! One connection multiplexes request/response, index exchange, and
//! keep-alive over a single compressed transport. Each side is both
//! client and server: the reader loop serves inbound requests while
//! callers issue their own.
//!
//! Locking is split three ways so the reader never serializes against
//! writers: the write mutex guards the codec writer, `next_id`, and the
//! delta map; the pending-call table has its own lock; `last_receive` a
//! third. Byte counters and latency are single-writer atomics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex, RwLock};

use crate::error::{Result, SyncError};
use crate::protocol::codec::{ByteCounter, FrameReader, FrameWriter};
use crate::protocol::compress::{self, CompressedReader, CompressedWriter};
use crate::protocol::message::{
    FileInfo, Header, MessageType, Request, MSG_ID_MASK, PROTOCOL_VERSION,
};
use crate::protocol::pending::PendingCalls;

const TRACE_TARGET: &str = "syncproto::connection";

// =============================================================================
// Receiver capability
// =============================================================================

/// The external collaborator that consumes indexes, serves block
/// requests, and is told when the connection goes away.
///
/// `index`, `index_update`, and `close` are invoked synchronously on the
/// reader loop and should return quickly. `request` runs on its own task,
/// so a slow block fetch never stalls inbound frames.
#[async_trait]
pub trait Receiver: Send + Sync + 'static {
    /// A full index arrived from the peer node.
    fn index(&self, node_id: &str, files: Vec<FileInfo>);

    /// A delta update arrived from the peer node.
    fn index_update(&self, node_id: &str, files: Vec<FileInfo>);

    /// The peer asks for a block. An `Err` is logged locally and conveyed
    /// to the peer as an empty response body; the wire format has no
    /// error channel.
    async fn request(
        &self,
        node_id: &str,
        name: &str,
        offset: u64,
        size: u32,
        hash: &[u8],
    ) -> anyhow::Result<Bytes>;

    /// The connection transitioned to closed. Invoked exactly once.
    fn close(&self, node_id: &str);
}

// =============================================================================
// Configuration
// =============================================================================

/// Keep-alive tuning. Defaults match the protocol's liveness contract;
/// tests shrink them to milliseconds.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Quiet time on the inbound side before a liveness ping is sent.
    pub idle_threshold: Duration,
    /// How long a liveness ping may go unanswered before the connection
    /// is closed.
    pub ping_timeout: Duration,
    /// Cadence of the keep-alive task.
    pub tick_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(5 * 60),
            ping_timeout: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of connection throughput and latency. Rates are deltas since
/// the previous `statistics()` call.
#[derive(Debug, Clone, Copy)]
pub struct Statistics {
    pub at: Instant,
    pub in_bytes_total: u64,
    pub in_bytes_per_sec: u64,
    pub out_bytes_total: u64,
    pub out_bytes_per_sec: u64,
    /// Exponentially smoothed ping round-trip.
    pub latency: Duration,
}

struct Sample {
    at: Instant,
    in_bytes: u64,
    out_bytes: u64,
}

// =============================================================================
// Connection
// =============================================================================

struct WriteState {
    codec: FrameWriter<CompressedWriter>,
    next_id: u16,
    /// name -> last-sent modified. Absent until the first outgoing index;
    /// names are never removed (deletions travel as flagged entries).
    index_sent: Option<HashMap<String, i64>>,
}

struct Inner {
    node_id: String,
    receiver: Arc<dyn Receiver>,
    write: Mutex<WriteState>,
    pending: PendingCalls,
    closed: AtomicBool,
    last_receive: RwLock<Instant>,
    latency_ns: AtomicU64,
    bytes_in: ByteCounter,
    bytes_out: ByteCounter,
    last_stats: Mutex<Sample>,
}

/// Handle on one peer link. Cloneable; all clones share the same
/// connection state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Wrap the transport halves in compression and framing, start the
    /// reader loop and the keep-alive task, and return the handle.
    ///
    /// `node_id` identifies the remote peer; it is handed back to the
    /// receiver on every callback. The transport itself is never closed
    /// by this layer; the owner tears it down after `Receiver::close`.
    pub fn new(
        node_id: impl Into<String>,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        receiver: Arc<dyn Receiver>,
    ) -> Self {
        Self::with_config(node_id, reader, writer, receiver, ConnectionConfig::default())
    }

    pub fn with_config(
        node_id: impl Into<String>,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        receiver: Arc<dyn Receiver>,
        config: ConnectionConfig,
    ) -> Self {
        let codec_in = FrameReader::new(compress::reader(reader));
        let codec_out = FrameWriter::new(compress::writer(writer));
        let bytes_in = codec_in.counter();
        let bytes_out = codec_out.counter();

        let inner = Arc::new(Inner {
            node_id: node_id.into(),
            receiver,
            write: Mutex::new(WriteState {
                codec: codec_out,
                next_id: 0,
                index_sent: None,
            }),
            pending: PendingCalls::new(),
            closed: AtomicBool::new(false),
            last_receive: RwLock::new(Instant::now()),
            latency_ns: AtomicU64::new(0),
            bytes_in,
            bytes_out,
            last_stats: Mutex::new(Sample {
                at: Instant::now(),
                in_bytes: 0,
                out_bytes: 0,
            }),
        });

        tokio::spawn(reader_loop(inner.clone(), codec_in));
        tokio::spawn(keepalive_loop(inner.clone(), config));

        Self { inner }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Send the file list to the peer. The first call transmits a full
    /// Index; every later call transmits an IndexUpdate containing only
    /// the entries whose name is new or whose modification stamp changed.
    ///
    /// Fire-and-forget: a codec error closes the connection.
    pub async fn index(&self, files: &[FileInfo]) {
        if self.inner.is_closed() {
            return;
        }
        let res = {
            let mut guard = self.inner.write.lock().await;
            let ws = &mut *guard;

            let (msg_type, to_send): (MessageType, Vec<&FileInfo>) = match ws.index_sent.take() {
                None => {
                    ws.index_sent =
                        Some(files.iter().map(|f| (f.name.clone(), f.modified)).collect());
                    (MessageType::Index, files.iter().collect())
                }
                Some(mut sent) => {
                    let mut diff = Vec::new();
                    for f in files {
                        if sent.get(&f.name) != Some(&f.modified) {
                            sent.insert(f.name.clone(), f.modified);
                            diff.push(f);
                        }
                    }
                    ws.index_sent = Some(sent);
                    (MessageType::IndexUpdate, diff)
                }
            };

            tracing::trace!(
                target: TRACE_TARGET,
                node_id = %self.inner.node_id,
                msg_type = ?msg_type,
                entries = to_send.len(),
                "send index"
            );

            let id = ws.next_id;
            let res: Result<()> = async {
                ws.codec.write_header(Header::new(id, msg_type)).await?;
                ws.codec.write_index(to_send).await?;
                ws.codec.flush().await
            }
            .await;
            ws.next_id = (id + 1) & MSG_ID_MASK;
            res
        };
        if res.is_err() {
            self.inner.close().await;
        }
    }

    /// Fetch a block from the peer. Resolves when the correlated response
    /// arrives, or fails with `SyncError::Closed` if the connection goes
    /// away first.
    pub async fn request(&self, name: &str, offset: u64, size: u32, hash: &[u8]) -> Result<Bytes> {
        if self.inner.is_closed() {
            return Err(SyncError::Closed);
        }
        let req = Request {
            name: name.to_string(),
            offset,
            size,
            hash: Bytes::copy_from_slice(hash),
        };

        let rx = {
            let mut guard = self.inner.write.lock().await;
            let ws = &mut *guard;
            let id = ws.next_id;
            let rx = match self.inner.pending.register(id).await {
                Some(rx) => rx,
                None => return Err(SyncError::Closed),
            };
            let res: Result<()> = async {
                ws.codec
                    .write_header(Header::new(id, MessageType::Request))
                    .await?;
                ws.codec.write_request(&req).await?;
                ws.codec.flush().await
            }
            .await;
            if let Err(err) = res {
                drop(guard);
                self.inner.close().await;
                return Err(err);
            }
            ws.next_id = (id + 1) & MSG_ID_MASK;
            rx
        };

        rx.await.map_err(|_| SyncError::Closed)
    }

    /// Measure the round trip to the peer. Returns the elapsed time on
    /// pong, `None` if the connection closed first, and folds the
    /// measurement into the smoothed latency.
    pub async fn ping(&self) -> Option<Duration> {
        if self.inner.is_closed() {
            return None;
        }
        let (rx, start) = {
            let mut guard = self.inner.write.lock().await;
            let ws = &mut *guard;
            let id = ws.next_id;
            let rx = self.inner.pending.register(id).await?;
            let start = Instant::now();
            let res: Result<()> = async {
                ws.codec
                    .write_header(Header::new(id, MessageType::Ping))
                    .await?;
                ws.codec.flush().await
            }
            .await;
            if res.is_err() {
                drop(guard);
                self.inner.close().await;
                return None;
            }
            ws.next_id = (id + 1) & MSG_ID_MASK;
            (rx, start)
        };

        match rx.await {
            Ok(_) => {
                let latency = start.elapsed();
                let prev = self.inner.latency_ns.load(Ordering::Relaxed);
                self.inner
                    .latency_ns
                    .store((prev + latency.as_nanos() as u64) / 2, Ordering::Relaxed);
                Some(latency)
            }
            Err(_) => None,
        }
    }

    /// Snapshot byte totals, rates since the previous snapshot, and
    /// smoothed latency.
    pub async fn statistics(&self) -> Statistics {
        let mut last = self.inner.last_stats.lock().await;
        let now = Instant::now();
        let secs = now.duration_since(last.at).as_secs_f64();
        let in_total = self.inner.bytes_in.get();
        let out_total = self.inner.bytes_out.get();
        let (in_rate, out_rate) = if secs > 0.0 {
            (
                ((in_total - last.in_bytes) as f64 / secs) as u64,
                ((out_total - last.out_bytes) as f64 / secs) as u64,
            )
        } else {
            (0, 0)
        };
        *last = Sample {
            at: now,
            in_bytes: in_total,
            out_bytes: out_total,
        };
        Statistics {
            at: now,
            in_bytes_total: in_total,
            in_bytes_per_sec: in_rate,
            out_bytes_total: out_total,
            out_bytes_per_sec: out_rate,
            latency: Duration::from_nanos(self.inner.latency_ns.load(Ordering::Relaxed)),
        }
    }

    /// Close the connection: cancel every pending call and notify the
    /// receiver. Idempotent; only the first call has any effect.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(target: TRACE_TARGET, node_id = %self.node_id, "connection closed");
        self.pending.cancel_all().await;
        self.receiver.close(&self.node_id);
    }
}

// =============================================================================
// Reader loop
// =============================================================================

async fn reader_loop(inner: Arc<Inner>, mut codec: FrameReader<CompressedReader>) {
    while !inner.is_closed() {
        if let Err(err) = read_one(&inner, &mut codec).await {
            if !inner.is_closed() {
                match &err {
                    SyncError::Protocol(msg) => {
                        tracing::warn!(
                            target: TRACE_TARGET,
                            node_id = %inner.node_id,
                            "protocol error: {}",
                            msg
                        );
                    }
                    _ => {
                        tracing::debug!(
                            target: TRACE_TARGET,
                            node_id = %inner.node_id,
                            error = %err,
                            "read loop ended"
                        );
                    }
                }
            }
            inner.close().await;
            break;
        }
    }
}

/// Read and dispatch a single inbound frame. Any error closes the
/// connection.
async fn read_one(inner: &Arc<Inner>, codec: &mut FrameReader<CompressedReader>) -> Result<()> {
    let hdr = codec.read_header().await?;
    if hdr.version != PROTOCOL_VERSION {
        return Err(SyncError::Protocol(format!(
            "unknown message version {:#x}",
            hdr.version
        )));
    }

    *inner.last_receive.write().await = Instant::now();

    match MessageType::from_u8(hdr.msg_type) {
        Some(MessageType::Index) => {
            let files = codec.read_index().await?;
            inner.receiver.index(&inner.node_id, files);
        }
        Some(MessageType::IndexUpdate) => {
            let files = codec.read_index().await?;
            inner.receiver.index_update(&inner.node_id, files);
        }
        Some(MessageType::Request) => {
            let req = codec.read_request().await?;
            tokio::spawn(serve_request(inner.clone(), hdr.msg_id, req));
        }
        Some(MessageType::Response) => {
            let data = codec.read_response().await?;
            if !inner.pending.fulfill(hdr.msg_id, data).await {
                // Late reply after cancellation, or a duplicate.
                tracing::trace!(
                    target: TRACE_TARGET,
                    node_id = %inner.node_id,
                    msg_id = hdr.msg_id,
                    "orphan response"
                );
            }
        }
        Some(MessageType::Ping) => {
            let mut ws = inner.write.lock().await;
            let res: Result<()> = async {
                ws.codec
                    .write_header(Header::new(hdr.msg_id, MessageType::Pong))
                    .await?;
                ws.codec.flush().await
            }
            .await;
            res?;
        }
        Some(MessageType::Pong) => {
            if !inner.pending.fulfill(hdr.msg_id, Bytes::new()).await {
                tracing::trace!(
                    target: TRACE_TARGET,
                    node_id = %inner.node_id,
                    msg_id = hdr.msg_id,
                    "orphan pong"
                );
            }
        }
        None => {
            return Err(SyncError::Protocol(format!(
                "unknown message type {:#x}",
                hdr.msg_type
            )));
        }
    }
    Ok(())
}

/// Serve one inbound block request off the reader loop.
async fn serve_request(inner: Arc<Inner>, msg_id: u16, req: Request) {
    let data = match inner
        .receiver
        .request(&inner.node_id, &req.name, req.offset, req.size, &req.hash)
        .await
    {
        Ok(data) => data,
        Err(err) => {
            // The wire has no error channel; an empty body stands in and
            // the receiver's error stays local.
            tracing::warn!(
                target: TRACE_TARGET,
                node_id = %inner.node_id,
                name = %req.name,
                error = %err,
                "block request failed"
            );
            Bytes::new()
        }
    };

    let res = {
        let mut ws = inner.write.lock().await;
        let res: Result<()> = async {
            ws.codec
                .write_header(Header::new(msg_id, MessageType::Response))
                .await?;
            ws.codec.write_response(&data).await?;
            ws.codec.flush().await
        }
        .await;
        res
    };
    if res.is_err() {
        inner.close().await;
    }
}

// =============================================================================
// Keep-alive
// =============================================================================

async fn keepalive_loop(inner: Arc<Inner>, config: ConnectionConfig) {
    loop {
        tokio::time::sleep(config.tick_interval).await;
        if inner.is_closed() {
            return;
        }
        let idle = inner.last_receive.read().await.elapsed();
        if idle <= config.idle_threshold {
            continue;
        }

        // One single-shot slot per probe; the ping itself runs on its own
        // task so the timeout clock starts immediately.
        let (tx, rx) = oneshot::channel();
        let conn = Connection {
            inner: inner.clone(),
        };
        tokio::spawn(async move {
            if let Some(latency) = conn.ping().await {
                let _ = tx.send(latency);
            }
        });

        match tokio::time::timeout(config.ping_timeout, rx).await {
            Ok(Ok(latency)) => {
                tracing::trace!(
                    target: TRACE_TARGET,
                    node_id = %inner.node_id,
                    latency_ms = latency.as_secs_f64() * 1000.0,
                    "liveness ping"
                );
            }
            _ => {
                tracing::warn!(
                    target: TRACE_TARGET,
                    node_id = %inner.node_id,
                    "ping timeout, closing connection"
                );
                inner.close().await;
                return;
            }
        }
    }
}
