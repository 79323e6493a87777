//! Stream Framing
//!
//! A `Register` stream is one TCP connection carrying newline-delimited JSON.
//! The client opens with a [`StreamHeader`] naming the method, after which
//! every line is one tagged message. Outbound traffic is queued through a
//! bounded channel drained by a dedicated writer task so that senders never
//! block on a slow peer.

use super::error::{TransportError, TransportResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Largest single frame accepted from a peer
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Outbound messages buffered per stream before senders see backpressure
pub const SEND_BUFFER: usize = 10_000;

/// The only method the endpoint serves
pub const REGISTER_METHOD: &str = "/kaytu.plugin.v1.Plugin/Register";

/// First line written by the client on a new stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    pub method: String,
    #[serde(default)]
    pub protocol: String,
}

impl StreamHeader {
    pub fn register() -> Self {
        Self {
            method: REGISTER_METHOD.to_string(),
            protocol: crate::core::version::PLUGIN_PROTOCOL.to_string(),
        }
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.method != REGISTER_METHOD {
            return Err(TransportError::UnknownMethod(self.method.clone()));
        }
        Ok(())
    }
}

/// Reads newline-delimited JSON frames
pub struct FrameReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::with_capacity(4096),
        }
    }

    /// Next decoded frame, or `None` once the peer has closed the stream
    pub async fn recv<M: DeserializeOwned>(&mut self) -> TransportResult<Option<M>> {
        let limit = MAX_FRAME_BYTES as u64 + 1;
        loop {
            self.buf.clear();
            let read = (&mut self.inner)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await?;
            if read == 0 {
                return Ok(None);
            }
            if self.buf.last() != Some(&b'\n') && read as u64 >= limit {
                return Err(TransportError::FrameTooLarge {
                    size: read,
                    limit: MAX_FRAME_BYTES,
                });
            }

            let line = trim_line(&self.buf);
            if line.is_empty() {
                continue;
            }
            return serde_json::from_slice(line)
                .map(Some)
                .map_err(TransportError::Decode);
        }
    }
}

fn trim_line(buf: &[u8]) -> &[u8] {
    let mut end = buf.len();
    while end > 0 && matches!(buf[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &buf[..end]
}

/// Writes newline-delimited JSON frames
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { inner: writer }
    }

    pub async fn send<M: Serialize>(&mut self, msg: &M) -> TransportResult<()> {
        let mut frame = serde_json::to_vec(msg).map_err(TransportError::Encode)?;
        frame.push(b'\n');
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> TransportResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Cloneable, non-blocking handle onto a stream's outbound queue
pub struct StreamSender<M> {
    tx: mpsc::Sender<M>,
    closed: Arc<watch::Sender<bool>>,
}

impl<M> Clone for StreamSender<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<M> std::fmt::Debug for StreamSender<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSender")
            .field("capacity", &self.tx.max_capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<M> StreamSender<M> {
    /// Queue a message without waiting
    ///
    /// Fails with [`TransportError::Backpressure`] when the queue is full and
    /// with [`TransportError::Closed`] once the stream has been closed.
    pub fn send(&self, msg: M) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure {
                capacity: self.tx.max_capacity(),
            },
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Queue a message, waiting for room when the queue is full
    ///
    /// Fails with [`TransportError::Closed`] if the stream closes first.
    pub async fn send_waiting(&self, msg: M) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            sent = self.tx.send(msg) => sent.map_err(|_| TransportError::Closed),
            _ = self.closed() => Err(TransportError::Closed),
        }
    }

    /// Stop accepting messages; already queued ones are still written
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.tx.is_closed()
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        wait_closed(&mut rx).await;
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Spawn the writer task for a stream with the default buffer size
pub fn spawn_writer<M, W>(writer: W) -> (StreamSender<M>, JoinHandle<TransportResult<()>>)
where
    M: Serialize + Send + Sync + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_with_capacity(writer, SEND_BUFFER)
}

pub fn spawn_writer_with_capacity<M, W>(
    writer: W,
    capacity: usize,
) -> (StreamSender<M>, JoinHandle<TransportResult<()>>)
where
    M: Serialize + Send + Sync + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<M>(capacity.max(1));
    let (closed_tx, mut closed_rx) = watch::channel(false);
    let sender = StreamSender {
        tx,
        closed: Arc::new(closed_tx),
    };

    let handle = tokio::spawn(async move {
        let mut frames = FrameWriter::new(writer);
        loop {
            tokio::select! {
                biased;
                msg = rx.recv() => match msg {
                    Some(msg) => frames.send(&msg).await?,
                    None => break,
                },
                _ = wait_closed(&mut closed_rx) => {
                    while let Ok(msg) = rx.try_recv() {
                        frames.send(&msg).await?;
                    }
                    break;
                }
            }
        }
        rx.close();
        // Peer may already be gone
        let _ = frames.shutdown().await;
        Ok(())
    });

    (sender, handle)
}
