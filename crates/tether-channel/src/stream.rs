//! Newline-delimited JSON over an async byte stream.
//!
//! Lets a bridge span a process boundary: a pipe to a sandboxed child, a
//! Unix socket, a TCP connection. One writer task drains the outbound queue,
//! one reader task decodes lines and fans each JSON value out to listeners.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::channel::{Channel, ChannelError, InboundListener, Listeners, Unsubscribe};

/// Longest accepted inbound line, in bytes.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Channel over a reader/writer pair.
///
/// Must be created inside a tokio runtime.
pub struct StreamChannel {
    outbound: mpsc::UnboundedSender<String>,
    listeners: Arc<Listeners<Value>>,
    shutdown: CancellationToken,
    failure: Arc<Failure>,
}

/// The I/O error that shut the channel down, kept for later sends.
#[derive(Default)]
struct Failure(Mutex<Option<(io::ErrorKind, String)>>);

impl Failure {
    fn record(&self, err: &io::Error) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some((err.kind(), err.to_string()));
        }
    }

    fn get(&self) -> Option<io::Error> {
        self.0
            .lock()
            .as_ref()
            .map(|(kind, message)| io::Error::new(*kind, message.clone()))
    }
}

impl std::fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamChannel")
            .field("listeners", &self.listeners.len())
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl StreamChannel {
    /// Spawn reader and writer tasks over `reader` and `writer`.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let listeners: Arc<Listeners<Value>> = Arc::default();
        let shutdown = CancellationToken::new();
        let failure: Arc<Failure> = Arc::default();

        drop(tokio::spawn(write_loop(
            FramedWrite::new(writer, LinesCodec::new()),
            rx,
            shutdown.clone(),
            Arc::clone(&failure),
        )));
        drop(tokio::spawn(read_loop(
            FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            Arc::clone(&listeners),
            shutdown.clone(),
            Arc::clone(&failure),
        )));

        Self {
            outbound: tx,
            listeners,
            shutdown,
            failure,
        }
    }

    /// Split a bidirectional stream and wrap both halves.
    pub fn connect<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }

    /// Queue `message` for writing, surfacing local failures.
    ///
    /// Once the stream has failed, every send reports that I/O error.
    pub fn try_send(&self, message: &Value) -> Result<(), ChannelError> {
        if self.shutdown.is_cancelled() {
            return Err(self.failure.get().map_or(ChannelError::Closed, ChannelError::Io));
        }
        let line = serde_json::to_string(message)?;
        self.outbound.send(line).map_err(|_| ChannelError::Closed)
    }

    /// Stop both tasks. Later sends are dropped.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) was called or the stream ended.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the channel has shut down.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Channel for StreamChannel {
    fn send(&self, message: Value) {
        if let Err(err) = self.try_send(&message) {
            debug!(error = %err, "stream send dropped");
        }
    }

    fn add_listener(&self, listener: InboundListener) -> Unsubscribe {
        self.listeners.add(listener)
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, LinesCodec>,
    mut rx: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
    failure: Arc<Failure>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            line = rx.recv() => {
                let Some(line) = line else { break };
                if let Err(err) = sink.send(line).await {
                    warn!(error = %err, "stream write failed, closing channel");
                    if let LinesCodecError::Io(err) = &err {
                        failure.record(err);
                    }
                    shutdown.cancel();
                    break;
                }
            }
        }
    }
    let _ = SinkExt::<String>::close(&mut sink).await;
}

async fn read_loop<R>(
    mut stream: FramedRead<R, LinesCodec>,
    listeners: Arc<Listeners<Value>>,
    shutdown: CancellationToken,
    failure: Arc<Failure>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(line)) => match serde_json::from_str::<Value>(&line) {
                    Ok(value) => {
                        let _ = listeners.dispatch(&value);
                    }
                    Err(err) => trace!(error = %err, "ignoring non-JSON line"),
                },
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(max = MAX_LINE_LENGTH, "inbound line too long, skipped");
                }
                Some(Err(LinesCodecError::Io(err))) => {
                    warn!(error = %err, "stream read failed, closing channel");
                    failure.record(&err);
                    shutdown.cancel();
                    break;
                }
                None => {
                    debug!("stream ended");
                    shutdown.cancel();
                    break;
                }
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
