//! In-process fake agent for integration tests.
//!
//! Speaks the agent side of the protocol over any byte stream: answers the
//! auth handshake, then serves requests against an in-memory file table.
//! Tail streams emit a line every 20 ms and check for CANCEL between lines,
//! so a cancel is confirmed within roughly 20 ms.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use tether::protocol::{write_frame, FrameReader, Opcode, Request, Response, Status, FRAME_SIZE, MAX_PAYLOAD};
use tether::session::{Session, SessionConfig};

pub const CWD: &str = "/home/agent";
pub const TAIL_INTERVAL: Duration = Duration::from_millis(20);

pub type DuplexSession = Session<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// What the agent saw, returned when it stops
#[derive(Debug, Default)]
pub struct AgentLog {
    pub requests: Vec<Request>,
    pub files: BTreeMap<String, Vec<u8>>,
    /// Data chunks received per upload/append, terminator excluded
    pub chunk_sizes: Vec<usize>,
    pub timestamps: Vec<(String, i64, i64)>,
    pub cancelled: bool,
}

impl AgentLog {
    pub fn opcodes(&self) -> Vec<Opcode> {
        self.requests.iter().map(|r| r.opcode).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeAgent {
    pub files: BTreeMap<String, Vec<u8>>,
    /// End tail streams with OK after this many lines instead of waiting for CANCEL
    pub tail_limit: Option<usize>,
    /// Answer EXIT with OK instead of hanging up
    pub reply_to_exit: bool,
}

impl FakeAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.to_string(), data.into());
        self
    }

    /// Run over a duplex pipe, returning the controller-side session.
    pub fn spawn_duplex(self, config: SessionConfig) -> (DuplexSession, JoinHandle<AgentLog>) {
        let (ctrl, agent) = duplex(FRAME_SIZE * 16);
        let (c_rd, c_wr) = tokio::io::split(ctrl);
        let (a_rd, a_wr) = tokio::io::split(agent);
        let handle = tokio::spawn(self.serve(a_rd, a_wr));
        (Session::new(FrameReader::new(c_rd), c_wr, config), handle)
    }

    /// Connect to a listener, authenticate, then serve.
    ///
    /// Returns the ack byte and, when accepted, the log once the controller
    /// ends the session.
    pub async fn connect(self, addr: SocketAddr, secret: &[u8]) -> (u8, Option<AgentLog>) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(secret).await.unwrap();

        let mut ack = [0u8; 1];
        if stream.read_exact(&mut ack).await.is_err() {
            return (0, None);
        }
        if ack[0] != 0x01 {
            return (ack[0], None);
        }

        let (rd, wr) = stream.into_split();
        (ack[0], Some(self.serve(rd, wr).await))
    }

    /// Serve requests until EXIT or the controller disconnects.
    pub async fn serve<R, W>(mut self, rd: R, mut wr: W) -> AgentLog
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = FrameReader::new(rd);
        let mut log = AgentLog::default();

        while let Ok(req) = reader.read_request().await {
            log.requests.push(req.clone());
            let path = String::from_utf8_lossy(&req.payload).into_owned();

            match req.opcode {
                Opcode::Pwd => ok(&mut wr, CWD).await,
                Opcode::GetStats => match self.files.get(&path) {
                    Some(data) => ok(&mut wr, format!("File: {path}\nSize: {} bytes", data.len())).await,
                    None => err(&mut wr, format!("stat failed: {path}: No such file or directory")).await,
                },
                Opcode::ListDir => {
                    let names: Vec<&str> = self
                        .files
                        .keys()
                        .filter_map(|k| k.strip_prefix(path.trim_end_matches('/')))
                        .filter_map(|k| k.strip_prefix('/'))
                        .collect();
                    ok(&mut wr, names.join("\n")).await
                }
                Opcode::Download => match self.files.get(&path) {
                    Some(data) => {
                        for chunk in data.chunks(MAX_PAYLOAD) {
                            more(&mut wr, chunk.to_vec()).await;
                        }
                        ok(&mut wr, format!("Download complete: {} bytes", data.len())).await
                    }
                    None => err(&mut wr, "Failed to open file").await,
                },
                Opcode::BinaryGrep => self.grep(&req.payload, &mut wr).await,
                Opcode::Substitute => self.substitute(&req.payload, &mut wr).await,
                Opcode::TailFollow => self.tail(&path, &mut reader, &mut wr, &mut log).await,
                Opcode::Cancel => err(&mut wr, "Nothing to cancel").await,
                Opcode::Upload | Opcode::Append => {
                    if !self.transfer(req.opcode, &path, &mut reader, &mut wr, &mut log).await {
                        break;
                    }
                }
                Opcode::SetTimestamps => {
                    let parts: Vec<&str> = path.rsplitn(3, ' ').collect();
                    match parts.as_slice() {
                        [m, a, p] => match (a.parse(), m.parse()) {
                            (Ok(a), Ok(m)) => {
                                log.timestamps.push((p.to_string(), a, m));
                                ok(&mut wr, "Timestamps updated").await
                            }
                            _ => err(&mut wr, "Invalid timestamp").await,
                        },
                        _ => err(&mut wr, "Invalid arguments").await,
                    }
                }
                Opcode::WordCount => self.word_count(&req.payload, &mut wr).await,
                Opcode::Djb2Hash => match self.files.get(&path) {
                    Some(data) => ok(&mut wr, format!("{:08x}  {path}", djb2(data))).await,
                    None => err(&mut wr, "Failed to open file").await,
                },
                Opcode::RunInMemory => err(&mut wr, "memfd_create not available").await,
                Opcode::ProcMaps => {
                    ok(&mut wr, "00400000-00452000 r-xp 00000000 08:02 173521 /agent").await
                }
                Opcode::Exit => {
                    if self.reply_to_exit {
                        ok(&mut wr, "Agent exiting").await;
                    }
                    break;
                }
            }
        }

        log.files = self.files;
        log
    }

    async fn grep<W: AsyncWrite + Unpin>(&self, payload: &[u8], wr: &mut W) {
        let mut parts = payload.splitn(2, |b| *b == 0);
        let path = String::from_utf8_lossy(parts.next().unwrap_or_default()).into_owned();
        let Ok(needle) = hex::decode(parts.next().unwrap_or_default()) else {
            return err(wr, "Invalid hex pattern").await;
        };
        let Some(data) = self.files.get(&path) else {
            return err(wr, "Failed to open file").await;
        };

        let mut found = 0;
        if !needle.is_empty() {
            for (offset, window) in data.windows(needle.len()).enumerate() {
                if window == needle.as_slice() {
                    found += 1;
                    more(wr, format!("Match at offset 0x{offset:08x}\n")).await;
                }
            }
        }
        ok(wr, format!("Found {found} matches")).await
    }

    async fn substitute<W: AsyncWrite + Unpin>(&self, payload: &[u8], wr: &mut W) {
        let parts: Vec<String> = payload
            .split(|b| *b == 0)
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect();
        let [path, search, replace] = parts.as_slice() else {
            return err(wr, "Invalid arguments").await;
        };
        let Some(data) = self.files.get(path) else {
            return err(wr, "Failed to open file").await;
        };

        let text = String::from_utf8_lossy(data);
        let count = text.matches(search.as_str()).count();
        let out = text.replace(search.as_str(), replace);
        for chunk in out.as_bytes().chunks(MAX_PAYLOAD) {
            more(wr, chunk.to_vec()).await;
        }
        ok(wr, format!("{count} replacements")).await
    }

    async fn tail<R, W>(&self, path: &str, reader: &mut FrameReader<R>, wr: &mut W, log: &mut AgentLog)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if !self.files.contains_key(path) {
            return err(wr, "Failed to open file").await;
        }

        let mut line = 0usize;
        loop {
            if let Some(limit) = self.tail_limit {
                if line == limit {
                    return ok(wr, "EOF reached").await;
                }
            }

            line += 1;
            more(wr, format!("line {line}\n")).await;

            match tokio::time::timeout(TAIL_INTERVAL, reader.read_request()).await {
                Err(_) => continue,
                Ok(Ok(req)) if req.opcode == Opcode::Cancel => {
                    log.requests.push(req);
                    log.cancelled = true;
                    // One frame was already in flight when CANCEL arrived
                    more(wr, "in flight\n").await;
                    return ok(wr, "Tail cancelled").await;
                }
                Ok(Ok(req)) => {
                    log.requests.push(req);
                    return err(wr, "Unexpected request during tail").await;
                }
                Ok(Err(_)) => return,
            }
        }
    }

    /// Returns false if the controller went away mid-transfer.
    async fn transfer<R, W>(
        &mut self,
        opcode: Opcode,
        path: &str,
        reader: &mut FrameReader<R>,
        wr: &mut W,
        log: &mut AgentLog,
    ) -> bool
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if path.starts_with("/readonly") {
            err(wr, "Failed to open destination: Permission denied").await;
            return true;
        }
        ok(wr, "Ready to receive file").await;

        let mut received = Vec::new();
        loop {
            let Ok(chunk) = reader.read_request().await else {
                return false;
            };
            log.requests.push(chunk.clone());
            if chunk.opcode != opcode {
                err(wr, "Unexpected opcode during transfer").await;
                return true;
            }
            if chunk.payload.is_empty() {
                break;
            }
            log.chunk_sizes.push(chunk.payload.len());
            received.extend_from_slice(&chunk.payload);
            more(wr, "Chunk received").await;
        }

        let total = received.len();
        let entry = self.files.entry(path.to_string()).or_default();
        if opcode == Opcode::Append {
            entry.extend_from_slice(&received);
        } else {
            *entry = received;
        }
        ok(wr, format!("Transfer complete: {total} bytes")).await;
        true
    }

    async fn word_count<W: AsyncWrite + Unpin>(&self, payload: &[u8], wr: &mut W) {
        let (flag, path) = match payload.iter().position(|b| *b == 0) {
            Some(i) => (Some(&payload[..i]), &payload[i + 1..]),
            None => (None, payload),
        };
        let path = String::from_utf8_lossy(path).into_owned();
        let Some(data) = self.files.get(&path) else {
            return err(wr, "Failed to open file").await;
        };

        let lines = data.iter().filter(|b| **b == b'\n').count();
        let words = String::from_utf8_lossy(data).split_whitespace().count();
        let out = match flag {
            Some(b"-l") => format!("{lines} {path}"),
            Some(b"-c") => format!("{} {path}", data.len()),
            _ => format!("{lines} {words} {} {path}", data.len()),
        };
        ok(wr, out).await
    }
}

pub fn djb2(data: &[u8]) -> u32 {
    data.iter()
        .fold(5381u32, |h, b| h.wrapping_mul(33).wrapping_add(u32::from(*b)))
}

async fn respond<W: AsyncWrite + Unpin>(wr: &mut W, status: Status, payload: impl Into<Bytes>) {
    let frame = Response::new(status, payload).unwrap().encode();
    // The controller may already be gone; tests assert on its side
    let _ = write_frame(wr, &frame).await;
}

pub async fn ok<W: AsyncWrite + Unpin>(wr: &mut W, payload: impl Into<Bytes>) {
    respond(wr, Status::Ok, payload).await
}

pub async fn err<W: AsyncWrite + Unpin>(wr: &mut W, payload: impl Into<Bytes>) {
    respond(wr, Status::Error, payload).await
}

pub async fn more<W: AsyncWrite + Unpin>(wr: &mut W, payload: impl Into<Bytes>) {
    respond(wr, Status::MoreData, payload).await
}

/// Deterministic test content
pub fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
