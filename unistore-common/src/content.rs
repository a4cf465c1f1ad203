//! Payload shapes accepted by `StorageBackend::put`.
//!
//! A caller hands over whatever it has: an in-memory buffer, something to
//! read from, or a sequence of chunks that is pushed as they become
//! available. Backends match on the variant instead of sniffing the shape at
//! runtime.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Poll};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// Ordered chunks terminated by completion (end of stream) or by an error.
pub type ChunkStream = BoxStream<'static, io::Result<Bytes>>;

pub enum Content {
    /// Buffer, string or byte sequence held entirely in memory.
    Bytes(Bytes),
    /// Pull-based source, read until EOF.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    /// Push-based lazy sequence; see [`Content::channel`].
    Sequence(ChunkStream),
}

impl Content {
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Content::Reader(Box::new(reader))
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Content::Sequence(stream.boxed())
    }

    /// Create a push-based sequence and the handle that feeds it.
    ///
    /// Chunks are delivered in the order they were sent. The sequence
    /// completes only through [`ChunkSender::finish`] and fails through
    /// [`ChunkSender::fail`]. A sender dropped without either ends the
    /// sequence with `UnexpectedEof`, so a producer that bails out early
    /// never yields a truncated object. `capacity` bounds how many chunks may
    /// be in flight before `send` waits for the consumer.
    pub fn channel(capacity: usize) -> (ChunkSender, Content) {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let finished = Arc::new(AtomicBool::new(false));
        let done = finished.clone();
        let mut ended = false;
        let chunks = stream::poll_fn(move |cx| {
            if ended {
                return Poll::Ready(None);
            }
            match ready!(rx.poll_recv(cx)) {
                Some(item) => Poll::Ready(Some(item)),
                None => {
                    ended = true;
                    if done.load(Ordering::Acquire) {
                        Poll::Ready(None)
                    } else {
                        Poll::Ready(Some(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "chunk sequence ended without finish",
                        ))))
                    }
                }
            }
        });
        (ChunkSender { tx, finished }, Content::Sequence(chunks.boxed()))
    }

    /// Drain the content, in order, into one contiguous buffer.
    pub async fn into_bytes(self) -> io::Result<Bytes> {
        match self {
            Content::Bytes(data) => Ok(data),
            Content::Reader(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
            Content::Sequence(mut chunks) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = chunks.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Content::Bytes(_) => "bytes",
            Content::Reader(_) => "reader",
            Content::Sequence(_) => "sequence",
        }
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Content::Bytes(data) => f.debug_tuple("Bytes").field(&data.len()).finish(),
            other => f.debug_tuple(other.kind()).finish(),
        }
    }
}

impl From<Bytes> for Content {
    fn from(data: Bytes) -> Self {
        Content::Bytes(data)
    }
}

impl From<Vec<u8>> for Content {
    fn from(data: Vec<u8>) -> Self {
        Content::Bytes(Bytes::from(data))
    }
}

impl From<String> for Content {
    fn from(data: String) -> Self {
        Content::Bytes(Bytes::from(data))
    }
}

impl From<&'static str> for Content {
    fn from(data: &'static str) -> Self {
        Content::Bytes(Bytes::from_static(data.as_bytes()))
    }
}

impl From<&'static [u8]> for Content {
    fn from(data: &'static [u8]) -> Self {
        Content::Bytes(Bytes::from_static(data))
    }
}

/// The consumer of a push-based sequence went away before it completed.
#[derive(Debug, thiserror::Error)]
#[error("Chunk sequence consumer has been dropped")]
pub struct SequenceClosed;

/// Producer side of [`Content::channel`].
#[derive(Debug)]
pub struct ChunkSender {
    tx: mpsc::Sender<io::Result<Bytes>>,
    finished: Arc<AtomicBool>,
}

impl ChunkSender {
    pub async fn send(&self, chunk: impl Into<Bytes>) -> Result<(), SequenceClosed> {
        self.tx.send(Ok(chunk.into())).await.map_err(|_| SequenceClosed)
    }

    /// Terminate the sequence with an error; the put consuming it fails.
    pub async fn fail(self, err: io::Error) -> Result<(), SequenceClosed> {
        self.tx.send(Err(err)).await.map_err(|_| SequenceClosed)
    }

    /// Complete the sequence. Chunks already sent are delivered first.
    pub fn finish(self) {
        self.finished.store(true, Ordering::Release);
    }
}
