//! Fixed-size request/response frames.
//!
//! Every frame on the wire is exactly [`FRAME_SIZE`] bytes, in both directions.
//! There is no variable-length framing at the transport level.
//!
//! ```text
//! +---------+----------+--------------+---------------------------+
//! | code u8 | 3 x 0x00 | len u32 (BE) | payload (4088, zero pad)  |
//! +---------+----------+--------------+---------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Total size of every frame
pub const FRAME_SIZE: usize = 4096;

/// Header: code byte, 3 reserved bytes, big-endian length
pub const HEADER_SIZE: usize = 8;

/// Payload area of every frame
pub const MAX_PAYLOAD: usize = FRAME_SIZE - HEADER_SIZE;

// =============================================================================
// Opcodes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    GetStats = 0x01,
    ListDir = 0x02,
    Pwd = 0x03,
    Download = 0x04,
    BinaryGrep = 0x05,
    TailFollow = 0x06,
    Cancel = 0x07,
    Exit = 0x08,
    Upload = 0x09,
    Append = 0x0A,
    SetTimestamps = 0x0B,
    WordCount = 0x0C,
    Djb2Hash = 0x0D,
    Substitute = 0x0E,
    RunInMemory = 0x0F,
    ProcMaps = 0x10,
}

/// How the counterpart answers a given opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    /// Exactly one OK or ERROR
    SingleShot,
    /// MORE_DATA* then a terminal status
    StreamingRead,
    /// Ready ack, MORE_DATA per chunk, terminal on the empty chunk
    ChunkedWrite,
    /// MORE_DATA until the counterpart stops or a CANCEL is confirmed
    CancellableStream,
}

impl Opcode {
    pub const ALL: [Opcode; 16] = [
        Self::GetStats,
        Self::ListDir,
        Self::Pwd,
        Self::Download,
        Self::BinaryGrep,
        Self::TailFollow,
        Self::Cancel,
        Self::Exit,
        Self::Upload,
        Self::Append,
        Self::SetTimestamps,
        Self::WordCount,
        Self::Djb2Hash,
        Self::Substitute,
        Self::RunInMemory,
        Self::ProcMaps,
    ];

    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::GetStats),
            0x02 => Some(Self::ListDir),
            0x03 => Some(Self::Pwd),
            0x04 => Some(Self::Download),
            0x05 => Some(Self::BinaryGrep),
            0x06 => Some(Self::TailFollow),
            0x07 => Some(Self::Cancel),
            0x08 => Some(Self::Exit),
            0x09 => Some(Self::Upload),
            0x0A => Some(Self::Append),
            0x0B => Some(Self::SetTimestamps),
            0x0C => Some(Self::WordCount),
            0x0D => Some(Self::Djb2Hash),
            0x0E => Some(Self::Substitute),
            0x0F => Some(Self::RunInMemory),
            0x10 => Some(Self::ProcMaps),
            _ => None,
        }
    }

    /// Exchange shape the counterpart uses for this opcode.
    ///
    /// CANCEL has no exchange of its own; it is only legal inside a tail stream.
    pub fn exchange(self) -> Exchange {
        match self {
            Self::Download | Self::BinaryGrep | Self::Substitute => Exchange::StreamingRead,
            Self::Upload | Self::Append => Exchange::ChunkedWrite,
            Self::TailFollow | Self::Cancel => Exchange::CancellableStream,
            Self::GetStats
            | Self::ListDir
            | Self::Pwd
            | Self::Exit
            | Self::SetTimestamps
            | Self::WordCount
            | Self::Djb2Hash
            | Self::RunInMemory
            | Self::ProcMaps => Exchange::SingleShot,
        }
    }

    /// Whether MORE_DATA is ever a legal reply to this opcode
    pub fn allows_more_data(self) -> bool {
        self.exchange() != Exchange::SingleShot
    }
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    Error = 0x01,
    MoreData = 0x02,
}

impl Status {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Ok),
            0x01 => Some(Self::Error),
            0x02 => Some(Self::MoreData),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::MoreData
    }
}

// =============================================================================
// Header helpers
// =============================================================================

fn put_frame(code: u8, payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= MAX_PAYLOAD);

    let mut buf = BytesMut::with_capacity(FRAME_SIZE);
    buf.put_u8(code);
    buf.put_bytes(0, 3);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.put_bytes(0, MAX_PAYLOAD - payload.len());
    buf.freeze()
}

/// Split a raw frame into (code, meaningful payload). Reserved bytes are ignored.
fn take_frame(mut frame: Bytes) -> Result<(u8, Bytes), FrameError> {
    if frame.len() != FRAME_SIZE {
        return Err(FrameError::BadFrameSize(frame.len()));
    }

    let code = frame.get_u8();
    frame.advance(3);
    let len = frame.get_u32() as usize;
    if len > MAX_PAYLOAD {
        return Err(FrameError::PayloadLengthOutOfRange(len));
    }

    Ok((code, frame.split_to(len)))
}

// =============================================================================
// Request
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Request {
    /// Build a request, rejecting payloads that cannot fit in one frame.
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Result<Self, FrameError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        Ok(Self { opcode, payload })
    }

    /// Request with no payload (PWD, PROC_MAPS, CANCEL, EXIT, end-of-transfer)
    pub fn empty(opcode: Opcode) -> Self {
        Self {
            opcode,
            payload: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        put_frame(self.opcode as u8, &self.payload)
    }

    pub fn decode(frame: Bytes) -> Result<Self, FrameError> {
        let (code, payload) = take_frame(frame)?;
        let opcode = Opcode::from_u8(code).ok_or(FrameError::UnknownOpcode(code))?;
        Ok(Self { opcode, payload })
    }
}

// =============================================================================
// Response
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub payload: Bytes,
}

impl Response {
    pub fn new(status: Status, payload: impl Into<Bytes>) -> Result<Self, FrameError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        Ok(Self { status, payload })
    }

    pub fn encode(&self) -> Bytes {
        put_frame(self.status as u8, &self.payload)
    }

    pub fn decode(frame: Bytes) -> Result<Self, FrameError> {
        let (code, payload) = take_frame(frame)?;
        let status = Status::from_u8(code).ok_or(FrameError::UnknownStatus(code))?;
        Ok(Self { status, payload })
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let req = Request::new(Opcode::ListDir, &b"/tmp"[..]).unwrap();
        let frame = req.encode();

        assert_eq!(frame.len(), FRAME_SIZE);
        assert_eq!(frame[0], 0x02);
        assert_eq!(&frame[1..4], &[0, 0, 0]);
        assert_eq!(&frame[4..8], &[0, 0, 0, 4]);
        assert_eq!(&frame[8..12], b"/tmp");
        assert!(frame[12..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_empty_request_is_all_zero_after_opcode() {
        let frame = Request::empty(Opcode::Pwd).encode();
        assert_eq!(frame[0], 0x03);
        assert!(frame[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_full_payload_fits() {
        let payload = vec![0xAB; MAX_PAYLOAD];
        let req = Request::new(Opcode::Upload, payload.clone()).unwrap();
        let frame = req.encode();
        assert_eq!(frame.len(), FRAME_SIZE);
        assert_eq!(&frame[4..8], &(MAX_PAYLOAD as u32).to_be_bytes());
        assert_eq!(&frame[HEADER_SIZE..], &payload[..]);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let err = Request::new(Opcode::Upload, vec![0u8; MAX_PAYLOAD + 1]).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge(4089)));
    }

    #[test]
    fn test_response_decode_ignores_reserved_and_padding() {
        let mut raw = vec![0u8; FRAME_SIZE];
        raw[0] = 0x02;
        raw[1] = 0xFF;
        raw[2] = 0xEE;
        raw[3] = 0xDD;
        raw[7] = 3;
        raw[8..11].copy_from_slice(b"abc");
        raw[11] = b'x';

        let resp = Response::decode(Bytes::from(raw)).unwrap();
        assert_eq!(resp.status, Status::MoreData);
        assert_eq!(resp.payload.as_ref(), b"abc");
    }

    #[test]
    fn test_response_decode_wrong_size() {
        let err = Response::decode(Bytes::from(vec![0u8; FRAME_SIZE - 1])).unwrap_err();
        assert!(matches!(err, FrameError::BadFrameSize(4095)));

        let err = Response::decode(Bytes::from(vec![0u8; FRAME_SIZE + 1])).unwrap_err();
        assert!(matches!(err, FrameError::BadFrameSize(4097)));
    }

    #[test]
    fn test_response_decode_length_out_of_range() {
        let mut raw = vec![0u8; FRAME_SIZE];
        raw[4..8].copy_from_slice(&4089u32.to_be_bytes());
        let err = Response::decode(Bytes::from(raw)).unwrap_err();
        assert!(matches!(err, FrameError::PayloadLengthOutOfRange(4089)));
    }

    #[test]
    fn test_response_decode_unknown_status() {
        let mut raw = vec![0u8; FRAME_SIZE];
        raw[0] = 0x07;
        let err = Response::decode(Bytes::from(raw)).unwrap_err();
        assert!(matches!(err, FrameError::UnknownStatus(0x07)));
    }

    #[test]
    fn test_opcode_from_u8() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_u8(op as u8), Some(op));
        }
        assert_eq!(Opcode::from_u8(0x00), None);
        assert_eq!(Opcode::from_u8(0x11), None);
    }

    #[test]
    fn test_exchange_shapes() {
        assert_eq!(Opcode::Pwd.exchange(), Exchange::SingleShot);
        assert_eq!(Opcode::Exit.exchange(), Exchange::SingleShot);
        assert_eq!(Opcode::Download.exchange(), Exchange::StreamingRead);
        assert_eq!(Opcode::Substitute.exchange(), Exchange::StreamingRead);
        assert_eq!(Opcode::Append.exchange(), Exchange::ChunkedWrite);
        assert_eq!(Opcode::TailFollow.exchange(), Exchange::CancellableStream);

        assert!(!Opcode::RunInMemory.allows_more_data());
        assert!(Opcode::BinaryGrep.allows_more_data());
    }

    #[test]
    fn test_status_terminal() {
        assert!(Status::Ok.is_terminal());
        assert!(Status::Error.is_terminal());
        assert!(!Status::MoreData.is_terminal());
    }
}
