//! tether: listener and controller for fixed-frame remote file agents.
//!
//! An agent connects in, presents a shared secret, and then answers
//! 4096-byte request frames one at a time. This crate owns the controller
//! side: framing, the auth gate, the session engine with its four exchange
//! shapes, and the operator console on top.

pub mod auth;
pub mod cli;
pub mod command;
pub mod config;
pub mod console;
pub mod dispatch;
pub mod downloads;
pub mod error;
pub mod listener;
pub mod protocol;
pub mod session;

pub use auth::AuthGate;
pub use command::Command;
pub use config::ListenerConfig;
pub use error::{AuthError, CommandError, FrameError, SessionError};
pub use protocol::{FrameReader, Opcode, Request, Response, Status};
pub use session::{Session, SessionConfig, StreamReply};
