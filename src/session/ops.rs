//! Typed calls, one per opcode. Payload encodings match the deployed agent.

use std::future::Future;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{outgoing, Progress, Session, StreamReply, TailReply, TransferReply};
use crate::error::Result;
use crate::protocol::{Opcode, Request};

/// `wc` flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WordCountMode {
    #[default]
    All,
    /// `-l`
    Lines,
    /// `-c`
    Bytes,
}

impl WordCountMode {
    fn flag(self) -> Option<&'static str> {
        match self {
            Self::All => None,
            Self::Lines => Some("-l"),
            Self::Bytes => Some("-c"),
        }
    }
}

/// NUL-separated argument list
fn nul_joined(parts: &[&[u8]]) -> Bytes {
    let mut buf = BytesMut::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            buf.put_u8(0);
        }
        buf.put_slice(part);
    }
    buf.freeze()
}

fn path_request(opcode: Opcode, path: &str) -> Result<Request> {
    outgoing(opcode, path.as_bytes().to_vec())
}

fn text(payload: Bytes) -> String {
    String::from_utf8_lossy(&payload).into_owned()
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub async fn stats_of(&mut self, path: &str) -> Result<String> {
        let req = path_request(Opcode::GetStats, path)?;
        self.single_shot(req).await.map(text)
    }

    pub async fn list_dir(&mut self, path: &str) -> Result<String> {
        let req = path_request(Opcode::ListDir, path)?;
        self.single_shot(req).await.map(text)
    }

    pub async fn pwd(&mut self) -> Result<String> {
        self.single_shot(Request::empty(Opcode::Pwd)).await.map(text)
    }

    pub async fn download<F>(&mut self, path: &str, on_frame: F) -> Result<StreamReply>
    where
        F: FnMut(Progress),
    {
        let req = path_request(Opcode::Download, path)?;
        self.stream_read(req, on_frame).await
    }

    /// Search `path` for a byte pattern given as lowercase hex.
    /// Each returned record is one match.
    pub async fn binary_grep(&mut self, path: &str, hex_pattern: &str) -> Result<StreamReply> {
        let payload = nul_joined(&[path.as_bytes(), hex_pattern.as_bytes()]);
        self.stream_read(outgoing(Opcode::BinaryGrep, payload)?, |_| {})
            .await
    }

    pub async fn substitute(
        &mut self,
        path: &str,
        search: &str,
        replace: &str,
    ) -> Result<StreamReply> {
        let payload = nul_joined(&[path.as_bytes(), search.as_bytes(), replace.as_bytes()]);
        self.stream_read(outgoing(Opcode::Substitute, payload)?, |_| {})
            .await
    }

    pub async fn tail<C, F>(&mut self, path: &str, cancel: C, on_data: F) -> Result<TailReply>
    where
        C: Future<Output = ()>,
        F: FnMut(&[u8]),
    {
        self.tail_follow(path, cancel, on_data).await
    }

    pub async fn upload<S, F>(&mut self, remote: &str, source: S, on_chunk: F) -> Result<TransferReply>
    where
        S: AsyncRead + Unpin,
        F: FnMut(Progress),
    {
        self.chunked_write(Opcode::Upload, remote, source, on_chunk)
            .await
    }

    pub async fn append<S, F>(&mut self, remote: &str, source: S, on_chunk: F) -> Result<TransferReply>
    where
        S: AsyncRead + Unpin,
        F: FnMut(Progress),
    {
        self.chunked_write(Opcode::Append, remote, source, on_chunk)
            .await
    }

    /// Set access and modification time, in seconds since the epoch.
    pub async fn set_timestamps(&mut self, path: &str, atime: i64, mtime: i64) -> Result<String> {
        let payload = format!("{path} {atime} {mtime}");
        self.single_shot(outgoing(Opcode::SetTimestamps, payload.into_bytes())?)
            .await
            .map(text)
    }

    pub async fn word_count(&mut self, path: &str, mode: WordCountMode) -> Result<String> {
        let payload = match mode.flag() {
            Some(flag) => nul_joined(&[flag.as_bytes(), path.as_bytes()]),
            None => Bytes::copy_from_slice(path.as_bytes()),
        };
        self.single_shot(outgoing(Opcode::WordCount, payload)?)
            .await
            .map(text)
    }

    pub async fn djb2_hash(&mut self, path: &str) -> Result<String> {
        let req = path_request(Opcode::Djb2Hash, path)?;
        self.single_shot(req).await.map(text)
    }

    pub async fn run_in_memory(&mut self, path: &str) -> Result<String> {
        let req = path_request(Opcode::RunInMemory, path)?;
        self.single_shot(req).await.map(text)
    }

    pub async fn proc_maps(&mut self) -> Result<String> {
        self.single_shot(Request::empty(Opcode::ProcMaps))
            .await
            .map(text)
    }
}
