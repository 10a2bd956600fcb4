//! Length-prefixed UTF-16 message channel between the orchestrator and a test host.
//!
//! Wire format: `length: i32 (little-endian byte count)` followed by `length` bytes of
//! UTF-16LE text. A zero length is an empty message. A negative, odd or oversized length
//! means the stream is desynchronized; the channel closes and never reads again.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Header size in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest accepted payload in bytes.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Peer did not connect (or could not be reached) within the bound.
    #[error("no connection on {endpoint} within {after:?}")]
    ConnectTimeout {
        /// Socket path or channel name.
        endpoint: String,
        /// Elapsed bound.
        after: Duration,
    },
    /// A header declared an impossible payload length.
    #[error("protocol desynchronized: frame header declared {declared_len} bytes")]
    ProtocolDesync {
        /// Decoded header value.
        declared_len: i64,
    },
    /// Outgoing message does not fit a frame.
    #[error("message of {len} bytes exceeds the frame limit of {} bytes", MAX_FRAME_LEN)]
    FrameTooLarge {
        /// Encoded payload length.
        len: usize,
    },
    /// The decoder was used after it closed.
    #[error("channel is closed")]
    Closed,
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Encode one message as header plus UTF-16LE payload.
pub fn encode_frame(text: &str) -> Result<Vec<u8>, ChannelError> {
    let payload_len = text.encode_utf16().count() * 2;
    if payload_len > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge { len: payload_len });
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + payload_len);
    frame.extend_from_slice(&(payload_len as i32).to_le_bytes());
    for unit in text.encode_utf16() {
        frame.extend_from_slice(&unit.to_le_bytes());
    }
    Ok(frame)
}

fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Decoder phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// Collecting the 4-byte length.
    AwaitingHeader,
    /// Collecting the payload.
    AwaitingBody,
    /// Terminal.
    Closed,
}

/// Incremental frame decoder. Bytes may arrive in arbitrary chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecoderState,
    header: [u8; HEADER_LEN],
    header_filled: usize,
    body: Vec<u8>,
    cursor: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Decoder awaiting a header.
    pub fn new() -> Self {
        Self {
            state: DecoderState::AwaitingHeader,
            header: [0; HEADER_LEN],
            header_filled: 0,
            body: Vec::new(),
            cursor: 0,
        }
    }

    /// Current phase.
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Feed bytes, appending every completed message to `out`.
    ///
    /// Messages completed before a desynchronizing header are still delivered; after the
    /// error the decoder is closed.
    pub fn push(&mut self, mut input: &[u8], out: &mut Vec<String>) -> Result<(), ChannelError> {
        loop {
            match self.state {
                DecoderState::Closed => return Err(ChannelError::Closed),
                DecoderState::AwaitingHeader => {
                    if input.is_empty() {
                        return Ok(());
                    }
                    let take = (HEADER_LEN - self.header_filled).min(input.len());
                    self.header[self.header_filled..self.header_filled + take]
                        .copy_from_slice(&input[..take]);
                    self.header_filled += take;
                    input = &input[take..];
                    if self.header_filled < HEADER_LEN {
                        continue;
                    }
                    self.header_filled = 0;

                    let declared = i32::from_le_bytes(self.header);
                    if declared < 0 || declared as usize > MAX_FRAME_LEN || declared % 2 != 0 {
                        self.state = DecoderState::Closed;
                        return Err(ChannelError::ProtocolDesync {
                            declared_len: i64::from(declared),
                        });
                    }
                    if declared == 0 {
                        out.push(String::new());
                        continue;
                    }
                    self.body = vec![0; declared as usize];
                    self.cursor = 0;
                    self.state = DecoderState::AwaitingBody;
                }
                DecoderState::AwaitingBody => {
                    if input.is_empty() {
                        return Ok(());
                    }
                    let take = (self.body.len() - self.cursor).min(input.len());
                    self.body[self.cursor..self.cursor + take].copy_from_slice(&input[..take]);
                    self.cursor += take;
                    input = &input[take..];
                    if self.cursor == self.body.len() {
                        out.push(decode_utf16le(&self.body));
                        self.body = Vec::new();
                        self.cursor = 0;
                        self.state = DecoderState::AwaitingHeader;
                    }
                }
            }
        }
    }
}

/// Received messages, in wire order. Yields `None` once the channel closed.
pub type Inbox = mpsc::UnboundedReceiver<String>;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Duplex framed channel over any byte stream.
///
/// A dedicated reader task decodes frames and forwards them to the [`Inbox`]; there is never
/// more than one read in flight. Sends take the writer lock for the whole frame so headers
/// and bodies of concurrent senders never interleave.
pub struct FramedChannel {
    name: String,
    writer: Arc<Mutex<Option<BoxedWriter>>>,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for FramedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedChannel")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl FramedChannel {
    /// Wrap a connected stream and start its reader task.
    pub fn new<S>(stream: S, name: impl Into<String>) -> (Self, Inbox)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let name = name.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let writer: Arc<Mutex<Option<BoxedWriter>>> =
            Arc::new(Mutex::new(Some(Box::new(write_half))));
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(
            read_half,
            tx,
            writer.clone(),
            closed.clone(),
            name.clone(),
        ));

        (
            Self {
                name,
                writer,
                closed,
                reader,
            },
            rx,
        )
    }

    /// Connect to a listening orchestrator socket, waiting up to `timeout` for it to appear.
    #[cfg(unix)]
    pub async fn connect(
        path: &std::path::Path,
        timeout: Duration,
    ) -> Result<(Self, Inbox), ChannelError> {
        let endpoint = path.display().to_string();
        let attempt = async {
            loop {
                match tokio::net::UnixStream::connect(path).await {
                    Ok(stream) => return Ok(stream),
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    Err(err) => return Err(ChannelError::Io(err)),
                }
            }
        };
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(stream)) => Ok(Self::new(stream, endpoint)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ChannelError::ConnectTimeout {
                endpoint,
                after: timeout,
            }),
        }
    }

    /// Channel name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the pipe broke, the peer left, a desync was seen, or [`Self::close`] ran.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one message.
    ///
    /// On a closed channel the message is dropped silently; a peer that vanished mid-write
    /// closes the channel the same way. Other IO failures are returned.
    pub async fn send(&self, text: &str) -> Result<(), ChannelError> {
        let frame = encode_frame(text)?;
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            debug!(channel = %self.name, "dropping message for closed channel");
            return Ok(());
        };

        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                trace!(channel = %self.name, bytes = frame.len(), "frame sent");
                Ok(())
            }
            Err(err) => {
                self.closed.store(true, Ordering::Release);
                guard.take();
                if matches!(
                    err.kind(),
                    io::ErrorKind::BrokenPipe
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::UnexpectedEof
                ) {
                    debug!(channel = %self.name, %err, "peer gone; message dropped");
                    Ok(())
                } else {
                    Err(err.into())
                }
            }
        }
    }

    /// Close the pipe and stop reading. Calling it again is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) && self.reader.is_finished() {
            return;
        }
        self.reader.abort();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        debug!(channel = %self.name, "channel closed");
    }
}

impl Drop for FramedChannel {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.reader.abort();
    }
}

async fn read_loop<R>(
    mut reader: R,
    tx: mpsc::UnboundedSender<String>,
    writer: Arc<Mutex<Option<BoxedWriter>>>,
    closed: Arc<AtomicBool>,
    name: String,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut messages = Vec::new();

    'read: while !closed.load(Ordering::Acquire) {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(channel = %name, "peer closed the pipe");
                break;
            }
            Ok(n) => n,
            Err(err) => {
                debug!(channel = %name, %err, "read failed");
                break;
            }
        };

        let decoded = decoder.push(&buf[..n], &mut messages);
        for message in messages.drain(..) {
            if tx.send(message).is_err() {
                debug!(channel = %name, "inbox dropped");
                break 'read;
            }
        }
        if let Err(err) = decoded {
            warn!(channel = %name, %err, "closing channel");
            break;
        }
    }

    closed.store(true, Ordering::Release);
    if let Some(mut writer) = writer.lock().await.take() {
        let _ = writer.shutdown().await;
    }
}

/// Orchestrator-side listener handing out one channel per connecting host.
#[cfg(unix)]
#[derive(Debug)]
pub struct ChannelListener {
    listener: tokio::net::UnixListener,
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl ChannelListener {
    /// Bind a Unix socket at `path`, replacing a stale socket file.
    pub fn bind(path: impl Into<std::path::PathBuf>) -> Result<Self, ChannelError> {
        let path = path.into();
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let listener = tokio::net::UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }

    /// Socket path to hand to the host.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Wait up to `timeout` for one host to connect.
    pub async fn accept(&self, timeout: Duration) -> Result<(FramedChannel, Inbox), ChannelError> {
        match tokio::time::timeout(timeout, self.listener.accept()).await {
            Ok(Ok((stream, _))) => Ok(FramedChannel::new(
                stream,
                self.path.display().to_string(),
            )),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(ChannelError::ConnectTimeout {
                endpoint: self.path.display().to_string(),
                after: timeout,
            }),
        }
    }
}

#[cfg(unix)]
impl Drop for ChannelListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
