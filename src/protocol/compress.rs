//! Streaming deflate wrap for the transport halves.
//!
//! Both directions run through deflate at the fastest setting, throughput
//! over ratio. The encoder's `flush` performs a deflate sync flush, so a
//! flushed frame is immediately decodable on the far side; the connection
//! flushes after every frame inside the write critical section.

use async_compression::tokio::bufread::DeflateDecoder;
use async_compression::tokio::write::DeflateEncoder;
use async_compression::Level;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Type-erased transport halves, so `Connection` is not generic over the
/// concrete stream type.
pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub(crate) type CompressedReader = DeflateDecoder<BufReader<BoxedReader>>;
pub(crate) type CompressedWriter = DeflateEncoder<BoxedWriter>;

/// Wrap the inbound half in a streaming deflate decompressor.
pub(crate) fn reader(r: impl AsyncRead + Send + Unpin + 'static) -> CompressedReader {
    DeflateDecoder::new(BufReader::new(Box::new(r) as BoxedReader))
}

/// Wrap the outbound half in a streaming deflate compressor, fastest
/// setting.
pub(crate) fn writer(w: impl AsyncWrite + Send + Unpin + 'static) -> CompressedWriter {
    DeflateEncoder::with_quality(Box::new(w) as BoxedWriter, Level::Fastest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_flush_makes_frames_decodable_mid_stream() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut enc = writer(a);
        let mut dec = reader(b);

        // Without a stream end, data must still arrive after each flush.
        enc.write_all(b"first frame").await.unwrap();
        enc.flush().await.unwrap();

        let mut buf = [0u8; 11];
        dec.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first frame");

        enc.write_all(b"second").await.unwrap();
        enc.flush().await.unwrap();

        let mut buf = [0u8; 6];
        dec.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"second");
    }

    #[tokio::test]
    async fn test_roundtrip_large_payload() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut enc = writer(a);
        let mut dec = reader(b);

        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        let expect = payload.clone();

        let send = tokio::spawn(async move {
            enc.write_all(&payload).await.unwrap();
            enc.flush().await.unwrap();
        });

        let mut got = vec![0u8; expect.len()];
        dec.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expect);
        send.await.unwrap();
    }
}
