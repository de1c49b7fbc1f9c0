//! Exact-length reads over a byte stream.
//!
//! A TCP read may return fewer bytes than asked for. Every frame boundary must
//! be honoured exactly or the rest of the connection desynchronizes, so reads
//! are accumulated in a `BytesMut` until the requested count is reached.
//!
//! The buffer lives in the reader, not in the future: dropping a pending
//! [`FrameReader::read_exact`] (a lost `select!` branch, an expired timeout)
//! keeps whatever was already received for the next call.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SessionError};
use crate::protocol::frame::{Request, Response, FRAME_SIZE};

/// Buffered reader that hands out exact byte counts.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(FRAME_SIZE * 2),
        }
    }

    /// Read exactly `n` bytes.
    ///
    /// Fails with [`SessionError::ConnectionClosed`] as soon as the stream
    /// reports end-of-file before `n` bytes have arrived.
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        while self.buf.len() < n {
            self.buf.reserve(n - self.buf.len());
            let read = self.inner.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(SessionError::ConnectionClosed);
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Read and decode one response frame.
    pub async fn read_response(&mut self) -> Result<Response> {
        let frame = self.read_exact(FRAME_SIZE).await?;
        Ok(Response::decode(frame)?)
    }

    /// Read and decode one request frame (counterpart side).
    pub async fn read_request(&mut self) -> Result<Request> {
        let frame = self.read_exact(FRAME_SIZE).await?;
        Ok(Request::decode(frame)?)
    }

    /// Bytes received but not yet handed out
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Write one encoded frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await?;
    w.flush().await?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{Opcode, Status};
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_reassembles_short_reads() {
        let (mut tx, rx) = duplex(8);
        let mut reader = FrameReader::new(rx);

        let writer = tokio::spawn(async move {
            for chunk in b"hello world".chunks(3) {
                tx.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let got = reader.read_exact(11).await.unwrap();
        assert_eq!(got.as_ref(), b"hello world");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_before_count_is_connection_closed() {
        let (mut tx, rx) = duplex(64);
        tx.write_all(b"abc").await.unwrap();
        drop(tx);

        let mut reader = FrameReader::new(rx);
        let err = reader.read_exact(4).await.unwrap_err();
        assert!(matches!(err, SessionError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_surplus_bytes_kept_for_next_read() {
        let (mut tx, rx) = duplex(64);
        tx.write_all(b"abcdef").await.unwrap();

        let mut reader = FrameReader::new(rx);
        assert_eq!(reader.read_exact(2).await.unwrap().as_ref(), b"ab");
        assert_eq!(reader.buffered(), 4);
        assert_eq!(reader.read_exact(4).await.unwrap().as_ref(), b"cdef");
    }

    #[tokio::test]
    async fn test_dropped_read_keeps_partial_frame() {
        let (mut tx, rx) = duplex(FRAME_SIZE * 2);
        let mut reader = FrameReader::new(rx);

        let frame = Response::new(Status::MoreData, &b"tail line\n"[..])
            .unwrap()
            .encode();
        tx.write_all(&frame[..1000]).await.unwrap();

        // Abandon a read mid-frame, as a lost select! branch would.
        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), reader.read_response()).await;
        assert!(timed_out.is_err());
        assert_eq!(reader.buffered(), 1000);

        tx.write_all(&frame[1000..]).await.unwrap();
        let resp = reader.read_response().await.unwrap();
        assert_eq!(resp.status, Status::MoreData);
        assert_eq!(resp.payload.as_ref(), b"tail line\n");
    }

    #[tokio::test]
    async fn test_request_roundtrip_over_stream() {
        let (mut tx, rx) = duplex(FRAME_SIZE);
        let req = Request::new(Opcode::Download, &b"/etc/hostname"[..]).unwrap();

        let send = req.encode();
        let writer = tokio::spawn(async move { write_frame(&mut tx, &send).await });

        let mut reader = FrameReader::new(rx);
        let got = reader.read_request().await.unwrap();
        assert_eq!(got, req);
        writer.await.unwrap().unwrap();
    }
}
