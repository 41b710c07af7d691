//! Copy loops between transport streams and relay links
//!
//! Every loop takes an `on_activity` hook, invoked whenever bytes move, to
//! feed the idle supervisor. The splice path is an explicit capability
//! check: transports that already hold decrypted-but-undelivered bytes
//! (a TLS record reader, for instance) expose them through
//! [`RawBufferSource`] and the relay forwards them without re-framing.
//! Correctness never depends on the capability being present.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RelayError, SessionError};
use crate::protocol::{decode_chunk, encode_chunk, encode_chunk_end, MAX_CHUNK_SIZE};

use super::link::{LinkReader, LinkWriter};

/// Optional zero-copy capability: bytes the transport has read off the
/// wire but not yet delivered through its `AsyncRead` surface.
///
/// The default implementation reports no such buffer, which routes the
/// relay through the generic copy loop.
pub trait RawBufferSource {
    fn take_buffered(&mut self) -> Option<Bytes> {
        None
    }
}

impl RawBufferSource for tokio::net::TcpStream {}
impl RawBufferSource for tokio::io::DuplexStream {}

/// Collect a transport's raw backlog without blocking. Empty when the
/// capability is absent or already drained.
pub fn take_raw_buffered<S>(source: &mut S) -> Vec<Bytes>
where
    S: RawBufferSource,
{
    let mut backlog = Vec::new();
    while let Some(raw) = source.take_buffered() {
        if !raw.is_empty() {
            backlog.push(raw);
        }
    }
    backlog
}

/// Forward a collected raw backlog into a link, bypassing the body
/// codec. Returns the bytes moved.
///
/// Link writes observe capacity backpressure, so this must only run once
/// something is draining the other end.
pub async fn splice_raw_buffer<F>(
    backlog: Vec<Bytes>,
    writer: &LinkWriter,
    mut on_activity: F,
) -> Result<u64, RelayError>
where
    F: FnMut(),
{
    let mut total = 0u64;
    for raw in backlog {
        total += raw.len() as u64;
        writer.write(raw).await?;
        on_activity();
    }
    Ok(total)
}

/// Generic uplink: drain a byte stream into a link until EOF
pub async fn copy_stream_to_link<R, F>(
    stream: &mut R,
    writer: &LinkWriter,
    buffer_size: usize,
    mut on_activity: F,
) -> Result<u64, SessionError>
where
    R: AsyncRead + Unpin,
    F: FnMut(),
{
    let mut total = 0u64;
    let mut buf = BytesMut::with_capacity(buffer_size);
    loop {
        buf.reserve(buffer_size);
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            writer.close_write();
            return Ok(total);
        }
        total += n as u64;
        writer.write(buf.split().freeze()).await?;
        on_activity();
    }
}

/// Generic downlink: drain a link into a byte stream until Eof
pub async fn copy_link_to_stream<W, F>(
    reader: &mut LinkReader,
    stream: &mut W,
    mut on_activity: F,
) -> Result<u64, SessionError>
where
    W: AsyncWrite + Unpin,
    F: FnMut(),
{
    let mut total = 0u64;
    loop {
        match reader.read().await {
            Ok(data) => {
                stream.write_all(&data).await?;
                total += data.len() as u64;
                on_activity();
            }
            Err(RelayError::Eof) => {
                stream.flush().await?;
                return Ok(total);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Chunked uplink: the stream carries length-prefixed frames; forward the
/// payloads and stop at the zero-length terminator.
pub async fn copy_chunked_stream_to_link<R, F>(
    stream: &mut R,
    writer: &LinkWriter,
    buffer_size: usize,
    mut on_activity: F,
) -> Result<u64, SessionError>
where
    R: AsyncRead + Unpin,
    F: FnMut(),
{
    let mut total = 0u64;
    let mut buf = BytesMut::with_capacity(buffer_size);
    loop {
        while let Some(frame) = decode_chunk(&mut buf)? {
            if frame.is_empty() {
                writer.close_write();
                return Ok(total);
            }
            total += frame.len() as u64;
            writer.write(frame).await?;
            on_activity();
        }

        buf.reserve(buffer_size);
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            if buf.is_empty() {
                // Peer closed without a terminator; treat as orderly end
                writer.close_write();
                return Ok(total);
            }
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed inside a chunk frame",
            )));
        }
    }
}

/// Chunked downlink: frame link buffers for the stream, ending with the
/// zero-length terminator.
pub async fn copy_link_to_chunked_stream<W, F>(
    reader: &mut LinkReader,
    stream: &mut W,
    mut on_activity: F,
) -> Result<u64, SessionError>
where
    W: AsyncWrite + Unpin,
    F: FnMut(),
{
    let mut total = 0u64;
    let mut out = BytesMut::new();
    loop {
        match reader.read().await {
            Ok(data) => {
                for piece in data.chunks(MAX_CHUNK_SIZE) {
                    encode_chunk(piece, &mut out)?;
                }
                stream.write_all(&out).await?;
                out.clear();
                total += data.len() as u64;
                on_activity();
            }
            Err(RelayError::Eof) => {
                encode_chunk_end(&mut out);
                stream.write_all(&out).await?;
                stream.flush().await?;
                return Ok(total);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::link::link;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Test transport with a pre-buffered raw region, as a TLS wrapper
    /// holding decrypted bytes would expose
    struct RawBacklog {
        pending: Vec<Bytes>,
    }

    impl RawBufferSource for RawBacklog {
        fn take_buffered(&mut self) -> Option<Bytes> {
            if self.pending.is_empty() {
                None
            } else {
                Some(self.pending.remove(0))
            }
        }
    }

    #[tokio::test]
    async fn test_splice_drains_raw_buffer() {
        let mut source = RawBacklog {
            pending: vec![Bytes::from_static(b"trapped "), Bytes::from_static(b"bytes")],
        };
        let backlog = take_raw_buffered(&mut source);
        assert_eq!(backlog.len(), 2);
        assert!(source.take_buffered().is_none());

        let (mut reader, writer) = link(1024);
        let activity = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&activity);

        let moved = splice_raw_buffer(backlog, &writer, move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .await
        .unwrap();

        assert_eq!(moved, 13);
        assert_eq!(activity.load(Ordering::Relaxed), 2);
        assert_eq!(reader.read().await.unwrap().as_ref(), b"trapped ");
        assert_eq!(reader.read().await.unwrap().as_ref(), b"bytes");
    }

    #[tokio::test]
    async fn test_splice_absent_capability_is_noop() {
        let (client, _server) = tokio::io::duplex(64);
        let mut client = client;
        let backlog = take_raw_buffered(&mut client);
        assert!(backlog.is_empty());

        let (_reader, writer) = link(1024);
        let moved = splice_raw_buffer(backlog, &writer, || {}).await.unwrap();
        assert_eq!(moved, 0);
    }

    #[tokio::test]
    async fn test_copy_stream_to_link_round_trip() {
        let (client, mut server) = tokio::io::duplex(256);
        let (mut reader, writer) = link(1024);

        let feeder = tokio::spawn(async move {
            server.write_all(b"payload moving uplink").await.unwrap();
            drop(server);
        });

        let activity = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&activity);
        let mut client = client;
        let total = copy_stream_to_link(&mut client, &writer, 64, move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .await
        .unwrap();

        assert_eq!(total, 21);
        assert!(activity.load(Ordering::Relaxed) >= 1);

        let mut collected = Vec::new();
        loop {
            match reader.read().await {
                Ok(b) => collected.extend_from_slice(&b),
                Err(RelayError::Eof) => break,
                Err(e) => panic!("{}", e),
            }
        }
        assert_eq!(collected, b"payload moving uplink");
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_link_to_stream_round_trip() {
        let (mut client, server) = tokio::io::duplex(256);
        let (mut link_reader, writer) = link(1024);

        let pump = tokio::spawn(async move {
            let mut server = server;
            copy_link_to_stream(&mut link_reader, &mut server, || {}).await
        });

        writer.write(Bytes::from_static(b"going ")).await.unwrap();
        writer.write(Bytes::from_static(b"down")).await.unwrap();
        writer.close_write();

        assert_eq!(pump.await.unwrap().unwrap(), 10);
        let mut out = vec![0u8; 10];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"going down");
    }

    #[tokio::test]
    async fn test_chunked_uplink_stops_at_terminator() {
        let (client, mut server) = tokio::io::duplex(256);
        let (mut reader, writer) = link(1024);

        let feeder = tokio::spawn(async move {
            let mut framed = BytesMut::new();
            encode_chunk(b"one", &mut framed).unwrap();
            encode_chunk(b"two", &mut framed).unwrap();
            encode_chunk_end(&mut framed);
            // Trailing garbage past the terminator must not be consumed
            // as payload
            framed.extend_from_slice(b"junk");
            server.write_all(&framed).await.unwrap();
        });

        let mut client = client;
        let total = copy_chunked_stream_to_link(&mut client, &writer, 64, || {})
            .await
            .unwrap();
        assert_eq!(total, 6);
        assert_eq!(reader.read().await.unwrap().as_ref(), b"one");
        assert_eq!(reader.read().await.unwrap().as_ref(), b"two");
        assert_eq!(reader.read().await, Err(RelayError::Eof));
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn test_chunked_uplink_eof_inside_frame() {
        let (client, mut server) = tokio::io::duplex(256);
        let (_reader, writer) = link(1024);

        let feeder = tokio::spawn(async move {
            // Claim 100 bytes, deliver 3, then close
            server.write_all(&[0x00, 0x64]).await.unwrap();
            server.write_all(b"abc").await.unwrap();
            drop(server);
        });

        let mut client = client;
        let result = copy_chunked_stream_to_link(&mut client, &writer, 64, || {}).await;
        assert!(matches!(result, Err(SessionError::Io(_))));
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn test_chunked_downlink_frames_and_terminates() {
        let (mut client, server) = tokio::io::duplex(256);
        let (mut link_reader, writer) = link(1024);

        let pump = tokio::spawn(async move {
            let mut server = server;
            copy_link_to_chunked_stream(&mut link_reader, &mut server, || {}).await
        });

        writer.write(Bytes::from_static(b"framed")).await.unwrap();
        writer.close_write();
        assert_eq!(pump.await.unwrap().unwrap(), 6);

        let mut wire = BytesMut::new();
        let mut tmp = [0u8; 64];
        loop {
            match client.read(&mut tmp).await {
                Ok(0) => break,
                Ok(n) => wire.extend_from_slice(&tmp[..n]),
                Err(e) => panic!("{}", e),
            }
            if wire.len() >= 2 + 6 + 2 {
                break;
            }
        }
        assert_eq!(decode_chunk(&mut wire).unwrap().unwrap().as_ref(), b"framed");
        let end = decode_chunk(&mut wire).unwrap().unwrap();
        assert!(end.is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_propagates_out_of_copy() {
        let (client, mut server) = tokio::io::duplex(64);
        let (reader, writer) = link(1024);
        let interrupter = writer.interrupter();
        drop(reader);
        interrupter.interrupt();

        let handle = tokio::spawn(async move {
            let mut client = client;
            copy_stream_to_link(&mut client, &writer, 64, || {}).await
        });
        // Once bytes arrive, the next link write observes the interrupt
        server.write_all(b"data").await.unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Relay(RelayError::Interrupted))
        ));
    }
}
