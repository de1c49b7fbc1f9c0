//! Session engine: one request in flight, four exchange shapes.
//!
//! ```text
//! single-shot        REQ ──> OK | ERROR
//! streaming-read     REQ ──> MORE_DATA* ──> OK(summary) | ERROR
//! chunked-write      REQ(path) ──> OK(ready) ; { CHUNK ──> MORE_DATA }* ; EMPTY ──> OK | ERROR
//! cancellable        REQ ──> MORE_DATA* ... CANCEL ──> MORE_DATA* ──> OK(confirmation)
//! ```
//!
//! An ERROR reply is reported as [`SessionError::CommandFailed`] and leaves the
//! session usable. Everything else that goes wrong is fatal to the connection.
//! Data accumulated before an ERROR is dropped here and never returned.

mod ops;

pub use ops::WordCountMode;

use std::future::Future;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::error::{Result, SessionError};
use crate::protocol::{
    write_frame, FrameReader, Opcode, Request, Response, Status, MAX_PAYLOAD,
};

/// How long to wait for the agent to confirm a CANCEL
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for an (optional) reply to EXIT
pub const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub cancel_timeout: Duration,
    pub exit_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
        }
    }
}

// =============================================================================
// Exchange results
// =============================================================================

/// Result of a streaming-read exchange.
///
/// `records` are the MORE_DATA payloads in arrival order. `summary` is the
/// payload of the terminal OK and is never part of the stream: for a
/// download it is a status message, not file content.
#[derive(Debug, Clone, Default)]
pub struct StreamReply {
    pub records: Vec<Bytes>,
    pub summary: Bytes,
}

impl StreamReply {
    /// All stream payloads concatenated, summary excluded
    pub fn data(&self) -> Bytes {
        match self.records.len() {
            0 => Bytes::new(),
            1 => self.records[0].clone(),
            _ => {
                let mut buf = BytesMut::with_capacity(self.len());
                for r in &self.records {
                    buf.extend_from_slice(r);
                }
                buf.freeze()
            }
        }
    }

    /// Total stream bytes
    pub fn len(&self) -> usize {
        self.records.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary_text(&self) -> String {
        String::from_utf8_lossy(&self.summary).into_owned()
    }
}

/// Result of an upload or append
#[derive(Debug, Clone)]
pub struct TransferReply {
    /// Payload of the ready acknowledgement
    pub ready: String,
    /// Data chunks sent, terminator excluded
    pub chunks: usize,
    pub bytes: u64,
    /// Payload of the final OK
    pub summary: String,
}

/// Per-frame progress for transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// 1-based chunk number
    pub chunk: usize,
    pub chunk_len: usize,
    pub total: u64,
}

/// How a tail stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailEnd {
    /// We sent CANCEL and the agent confirmed it
    Cancelled { confirmation: String },
    /// The agent ended the stream on its own with OK
    Finished { message: String },
}

#[derive(Debug, Clone)]
pub struct TailReply {
    pub end: TailEnd,
    pub frames: usize,
    pub bytes: u64,
}

/// Counters for one connection
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub requests: u64,
    pub responses: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub commands_failed: u64,
}

// =============================================================================
// Session
// =============================================================================

/// One authenticated connection.
pub struct Session<R, W> {
    reader: FrameReader<R>,
    writer: W,
    config: SessionConfig,
    stats: SessionStats,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Wrap an already authenticated connection.
    pub fn new(reader: FrameReader<R>, writer: W, config: SessionConfig) -> Self {
        Self {
            reader,
            writer,
            config,
            stats: SessionStats::default(),
        }
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    async fn send(&mut self, req: &Request) -> Result<()> {
        tracing::debug!(opcode = ?req.opcode, len = req.payload.len(), "request");
        write_frame(&mut self.writer, &req.encode()).await?;
        self.stats.requests += 1;
        self.stats.bytes_sent += req.payload.len() as u64;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Response> {
        let resp = self.reader.read_response().await?;
        tracing::trace!(status = ?resp.status, len = resp.payload.len(), "response");
        self.stats.responses += 1;
        self.stats.bytes_received += resp.payload.len() as u64;
        Ok(resp)
    }

    fn failed(&mut self, resp: &Response) -> SessionError {
        self.stats.commands_failed += 1;
        SessionError::CommandFailed(resp.text())
    }

    fn violation(opcode: Opcode, status: Status, stage: &'static str) -> SessionError {
        tracing::error!(?opcode, ?status, stage, "protocol violation");
        SessionError::ProtocolViolation {
            opcode,
            status,
            stage,
        }
    }

    // -------------------------------------------------------------------------
    // Single-shot
    // -------------------------------------------------------------------------

    /// Send one request and take exactly one terminal reply.
    pub async fn single_shot(&mut self, req: Request) -> Result<Bytes> {
        self.send(&req).await?;
        let resp = self.recv().await?;
        match resp.status {
            Status::Ok => Ok(resp.payload),
            Status::Error => Err(self.failed(&resp)),
            Status::MoreData => Err(Self::violation(req.opcode, resp.status, "reply")),
        }
    }

    // -------------------------------------------------------------------------
    // Streaming read
    // -------------------------------------------------------------------------

    /// Send one request and collect MORE_DATA frames until a terminal status.
    ///
    /// `on_frame` sees each stream payload as it arrives (progress only; the
    /// payloads are not valid output until this returns `Ok`).
    pub async fn stream_read<F>(&mut self, req: Request, mut on_frame: F) -> Result<StreamReply>
    where
        F: FnMut(Progress),
    {
        self.send(&req).await?;

        let mut records = Vec::new();
        let mut total = 0u64;
        loop {
            let resp = self.recv().await?;
            match resp.status {
                Status::MoreData => {
                    total += resp.payload.len() as u64;
                    records.push(resp.payload);
                    on_frame(Progress {
                        chunk: records.len(),
                        chunk_len: records.last().map_or(0, Bytes::len),
                        total,
                    });
                }
                Status::Ok => {
                    return Ok(StreamReply {
                        records,
                        summary: resp.payload,
                    })
                }
                Status::Error => {
                    if !records.is_empty() {
                        tracing::debug!(
                            opcode = ?req.opcode,
                            discarded = total,
                            "stream aborted, dropping partial data"
                        );
                    }
                    return Err(self.failed(&resp));
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Chunked write
    // -------------------------------------------------------------------------

    /// Ready handshake, one MORE_DATA-acknowledged request per chunk, then an
    /// empty terminator.
    ///
    /// Chunks are filled to exactly [`MAX_PAYLOAD`] bytes except the last, so
    /// a source of `L` bytes goes out as `ceil(L / 4088)` chunks.
    pub async fn chunked_write<S, F>(
        &mut self,
        opcode: Opcode,
        remote_path: &str,
        mut source: S,
        mut on_chunk: F,
    ) -> Result<TransferReply>
    where
        S: AsyncRead + Unpin,
        F: FnMut(Progress),
    {
        let ready = self
            .single_shot(outgoing(opcode, remote_path.as_bytes().to_vec())?)
            .await?;
        let ready = String::from_utf8_lossy(&ready).into_owned();

        let mut chunks = 0usize;
        let mut total = 0u64;
        let mut buf = vec![0u8; MAX_PAYLOAD];
        loop {
            let n = fill_chunk(&mut source, &mut buf).await?;
            if n == 0 {
                break;
            }

            self.send(&outgoing(opcode, buf[..n].to_vec())?).await?;
            let resp = self.recv().await?;
            match resp.status {
                Status::MoreData => {}
                Status::Error => return Err(self.failed(&resp)),
                Status::Ok => return Err(Self::violation(opcode, resp.status, "chunk ack")),
            }

            chunks += 1;
            total += n as u64;
            on_chunk(Progress {
                chunk: chunks,
                chunk_len: n,
                total,
            });
        }

        // Zero-length chunk marks end of transfer
        self.send(&Request::empty(opcode)).await?;
        let resp = self.recv().await?;
        match resp.status {
            Status::Ok => Ok(TransferReply {
                ready,
                chunks,
                bytes: total,
                summary: resp.text(),
            }),
            Status::Error => Err(self.failed(&resp)),
            Status::MoreData => Err(Self::violation(opcode, resp.status, "completion")),
        }
    }

    // -------------------------------------------------------------------------
    // Cancellable stream
    // -------------------------------------------------------------------------

    /// Follow a growing remote file until the agent stops or `cancel` fires.
    ///
    /// When `cancel` completes a CANCEL request goes out on the same
    /// connection. Frames already in flight are still delivered to `on_data`;
    /// the next OK is the confirmation and ends the stream.
    pub async fn tail_follow<C, F>(
        &mut self,
        path: &str,
        cancel: C,
        mut on_data: F,
    ) -> Result<TailReply>
    where
        C: Future<Output = ()>,
        F: FnMut(&[u8]),
    {
        enum Next {
            Frame(Result<Response>),
            Cancel,
        }

        self.send(&outgoing(Opcode::TailFollow, path.as_bytes().to_vec())?)
            .await?;

        let mut cancel = std::pin::pin!(cancel);
        // Set once CANCEL is sent; bounds the whole wait for confirmation
        let mut deadline: Option<tokio::time::Instant> = None;
        let mut frames = 0usize;
        let mut bytes = 0u64;

        loop {
            let cancelled = deadline.is_some();
            let next = if let Some(deadline) = deadline {
                match tokio::time::timeout_at(deadline, self.recv()).await {
                    Ok(r) => Next::Frame(r),
                    Err(_) => {
                        return Err(SessionError::Timeout(
                            self.config.cancel_timeout,
                            "cancel confirmation",
                        ))
                    }
                }
            } else {
                tokio::select! {
                    r = self.reader.read_response() => Next::Frame(r),
                    () = &mut cancel => Next::Cancel,
                }
            };

            let resp = match next {
                Next::Cancel => {
                    tracing::info!(path, "cancelling tail");
                    self.send(&Request::empty(Opcode::Cancel)).await?;
                    deadline = Some(tokio::time::Instant::now() + self.config.cancel_timeout);
                    continue;
                }
                Next::Frame(r) => r?,
            };

            if !cancelled {
                // recv() is bypassed inside select! so count here
                self.stats.responses += 1;
                self.stats.bytes_received += resp.payload.len() as u64;
            }

            match resp.status {
                Status::MoreData => {
                    frames += 1;
                    bytes += resp.payload.len() as u64;
                    on_data(&resp.payload);
                }
                Status::Ok => {
                    let text = resp.text();
                    let end = if cancelled {
                        TailEnd::Cancelled { confirmation: text }
                    } else {
                        TailEnd::Finished { message: text }
                    };
                    return Ok(TailReply { end, frames, bytes });
                }
                Status::Error => return Err(self.failed(&resp)),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Exit
    // -------------------------------------------------------------------------

    /// Tell the agent to terminate.
    ///
    /// Agents may exit without answering, so silence or a disconnect within
    /// the exit timeout counts as success. Returns the reply text if any.
    pub async fn exit(&mut self) -> Result<Option<String>> {
        self.send(&Request::empty(Opcode::Exit)).await?;

        match tokio::time::timeout(self.config.exit_timeout, self.recv()).await {
            Err(_) | Ok(Err(SessionError::ConnectionClosed)) => Ok(None),
            Ok(Err(e)) => Err(e),
            Ok(Ok(resp)) => match resp.status {
                Status::Ok => Ok(Some(resp.text())),
                Status::Error => Err(self.failed(&resp)),
                Status::MoreData => Err(Self::violation(Opcode::Exit, resp.status, "reply")),
            },
        }
    }
}

/// Build a request from operator input. A payload that cannot fit is
/// refused here, before anything reaches the wire.
pub(crate) fn outgoing(opcode: Opcode, payload: impl Into<Bytes>) -> Result<Request> {
    Request::new(opcode, payload).map_err(SessionError::NotSent)
}

/// Read until `buf` is full or the source is exhausted.
async fn fill_chunk<S: AsyncRead + Unpin>(source: &mut S, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

// =============================================================================
// Tests
// =============================================================================
