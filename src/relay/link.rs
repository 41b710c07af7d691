//! Bounded pipe connecting a decoded request's body to its dispatched flow
//!
//! One direction = one link: an ordered queue of buffers with independent
//! liveness per side. `close_write` is the orderly end of stream;
//! `interrupt` abandons the pipe and unblocks both sides immediately, and
//! is callable from outside the blocked tasks via a cloned handle.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::RelayError;

struct State {
    queue: VecDeque<Bytes>,
    /// Bytes currently queued
    buffered: usize,
    write_closed: bool,
    interrupted: bool,
    reader_dropped: bool,
}

struct Shared {
    state: Mutex<State>,
    /// Signalled when data arrives or the stream ends
    readable: Notify,
    /// Signalled when queue space frees up
    writable: Notify,
    capacity: usize,
}

/// Create a link. `capacity` bounds in-flight bytes: a writer suspends
/// while the queue already holds at least `capacity` bytes.
pub fn link(capacity: usize) -> (LinkReader, LinkWriter) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            buffered: 0,
            write_closed: false,
            interrupted: false,
            reader_dropped: false,
        }),
        readable: Notify::new(),
        writable: Notify::new(),
        capacity: capacity.max(1),
    });
    (
        LinkReader {
            shared: Arc::clone(&shared),
        },
        LinkWriter { shared },
    )
}

/// Handle that can abandon a link from outside its blocked tasks
#[derive(Clone)]
pub struct LinkInterrupter {
    shared: Arc<Shared>,
}

impl LinkInterrupter {
    pub fn interrupt(&self) {
        self.shared.interrupt();
    }
}

impl Shared {
    fn interrupt(&self) {
        {
            let mut state = self.state.lock();
            state.interrupted = true;
            state.queue.clear();
            state.buffered = 0;
        }
        self.readable.notify_one();
        self.writable.notify_one();
    }
}

/// Consuming side of a link
pub struct LinkReader {
    shared: Arc<Shared>,
}

impl LinkReader {
    /// Take the next buffer. Suspends while the queue is empty; `Eof`
    /// after the writer closed and the queue drained.
    pub async fn read(&mut self) -> Result<Bytes, RelayError> {
        loop {
            let notified = self.shared.readable.notified();
            {
                let mut state = self.shared.state.lock();
                if state.interrupted {
                    return Err(RelayError::Interrupted);
                }
                if let Some(buf) = state.queue.pop_front() {
                    state.buffered -= buf.len();
                    drop(state);
                    self.shared.writable.notify_one();
                    return Ok(buf);
                }
                if state.write_closed {
                    return Err(RelayError::Eof);
                }
            }
            notified.await;
        }
    }

    pub fn interrupter(&self) -> LinkInterrupter {
        LinkInterrupter {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn interrupt(&self) {
        self.shared.interrupt();
    }
}

impl Drop for LinkReader {
    fn drop(&mut self) {
        self.shared.state.lock().reader_dropped = true;
        self.shared.writable.notify_one();
    }
}

/// Producing side of a link
pub struct LinkWriter {
    shared: Arc<Shared>,
}

impl LinkWriter {
    /// Queue a buffer. Suspends while the queue is at capacity; fails once
    /// the write side closed, the reader went away, or the link was
    /// interrupted.
    pub async fn write(&self, data: Bytes) -> Result<(), RelayError> {
        if data.is_empty() {
            return Ok(());
        }
        loop {
            let notified = self.shared.writable.notified();
            {
                let mut state = self.shared.state.lock();
                if state.interrupted {
                    return Err(RelayError::Interrupted);
                }
                if state.write_closed || state.reader_dropped {
                    return Err(RelayError::Closed);
                }
                if state.buffered < self.shared.capacity {
                    state.buffered += data.len();
                    state.queue.push_back(data);
                    drop(state);
                    self.shared.readable.notify_one();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Orderly end of stream: the reader drains what is queued, then Eof
    pub fn close_write(&self) {
        self.shared.state.lock().write_closed = true;
        self.shared.readable.notify_one();
    }

    pub fn interrupter(&self) -> LinkInterrupter {
        LinkInterrupter {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn interrupt(&self) {
        self.shared.interrupt();
    }
}

impl Drop for LinkWriter {
    fn drop(&mut self) {
        self.close_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut reader, writer) = link(1024);
        writer.write(Bytes::from_static(b"hello")).await.unwrap();
        writer.write(Bytes::from_static(b"world")).await.unwrap();
        assert_eq!(reader.read().await.unwrap().as_ref(), b"hello");
        assert_eq!(reader.read().await.unwrap().as_ref(), b"world");
    }

    #[tokio::test]
    async fn test_eof_after_close_write() {
        let (mut reader, writer) = link(1024);
        writer.write(Bytes::from_static(b"tail")).await.unwrap();
        writer.close_write();

        // Queued data drains before Eof
        assert_eq!(reader.read().await.unwrap().as_ref(), b"tail");
        assert_eq!(reader.read().await, Err(RelayError::Eof));
        // Eof is sticky
        assert_eq!(reader.read().await, Err(RelayError::Eof));
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (_reader, writer) = link(1024);
        writer.close_write();
        assert_eq!(
            writer.write(Bytes::from_static(b"late")).await,
            Err(RelayError::Closed)
        );
    }

    #[tokio::test]
    async fn test_write_after_reader_dropped_fails() {
        let (reader, writer) = link(1024);
        drop(reader);
        assert_eq!(
            writer.write(Bytes::from_static(b"orphan")).await,
            Err(RelayError::Closed)
        );
    }

    #[tokio::test]
    async fn test_backpressure_blocks_writer() {
        let (mut reader, writer) = link(8);
        writer.write(Bytes::from_static(b"12345678")).await.unwrap();

        // Queue is at capacity: the next write must suspend
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            writer.write(Bytes::from_static(b"more")),
        )
        .await;
        assert!(blocked.is_err(), "writer should block at capacity");

        // Draining unblocks it
        let pending = writer.write(Bytes::from_static(b"more"));
        let (read, written) = tokio::join!(reader.read(), pending);
        assert_eq!(read.unwrap().as_ref(), b"12345678");
        written.unwrap();
        assert_eq!(reader.read().await.unwrap().as_ref(), b"more");
    }

    #[tokio::test]
    async fn test_interrupt_unblocks_reader() {
        let (mut reader, writer) = link(1024);
        let interrupter = writer.interrupter();

        let handle = tokio::spawn(async move { reader.read().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        interrupter.interrupt();

        assert_eq!(handle.await.unwrap(), Err(RelayError::Interrupted));
        // Writer observes the interrupt too
        assert_eq!(
            writer.write(Bytes::from_static(b"x")).await,
            Err(RelayError::Interrupted)
        );
    }

    #[tokio::test]
    async fn test_interrupt_unblocks_writer() {
        let (reader, writer) = link(4);
        writer.write(Bytes::from_static(b"full")).await.unwrap();
        let interrupter = reader.interrupter();

        let handle = tokio::spawn(async move {
            writer.write(Bytes::from_static(b"blocked")).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        interrupter.interrupt();

        assert_eq!(handle.await.unwrap(), Err(RelayError::Interrupted));
    }

    #[tokio::test]
    async fn test_payload_integrity_large() {
        // Chunk-boundary stress: >10 MB pushed through a small window
        let total = 10 * 1024 * 1024 + 13;
        let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let (mut reader, writer) = link(64 * 1024);
        let producer = tokio::spawn(async move {
            for piece in payload.chunks(4096 + 7) {
                writer
                    .write(Bytes::copy_from_slice(piece))
                    .await
                    .unwrap();
            }
            // writer drop closes the stream
        });

        let mut received = Vec::with_capacity(total);
        loop {
            match reader.read().await {
                Ok(buf) => received.extend_from_slice(&buf),
                Err(RelayError::Eof) => break,
                Err(e) => panic!("unexpected relay error: {}", e),
            }
        }
        producer.await.unwrap();
        assert_eq!(received.len(), expected.len());
        assert_eq!(received, expected, "byte order and length must survive");
    }

    #[tokio::test]
    async fn test_empty_and_single_byte_payloads() {
        let (mut reader, writer) = link(16);
        // Empty write is a no-op
        writer.write(Bytes::new()).await.unwrap();
        writer.write(Bytes::from_static(b"x")).await.unwrap();
        writer.close_write();

        assert_eq!(reader.read().await.unwrap().as_ref(), b"x");
        assert_eq!(reader.read().await, Err(RelayError::Eof));
    }

    #[tokio::test]
    async fn test_writer_drop_is_close_write() {
        let (mut reader, writer) = link(1024);
        writer.write(Bytes::from_static(b"last")).await.unwrap();
        drop(writer);
        assert_eq!(reader.read().await.unwrap().as_ref(), b"last");
        assert_eq!(reader.read().await, Err(RelayError::Eof));
    }
}
