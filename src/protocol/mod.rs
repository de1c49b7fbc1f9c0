//! Wire protocol: fixed 4096-byte frames, big-endian lengths.

pub mod frame;
pub mod reader;

pub use frame::{
    Exchange, Opcode, Request, Response, Status, FRAME_SIZE, HEADER_SIZE, MAX_PAYLOAD,
};
pub use reader::{write_frame, FrameReader};
