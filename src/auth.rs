//! Shared-secret handshake, run once per accepted connection.
//!
//! ```text
//! ┌────────────────┐  secret matches   ┌───────────────┐
//! │ AwaitingSecret │──────────────────>│ Authenticated │  ack 0x01
//! └────────────────┘                   └───────────────┘
//!         │ mismatch / deadline / EOF
//!         ↓
//!   ┌──────────┐
//!   │ Rejected │  ack 0x00 (best effort), connection dropped
//!   └──────────┘
//! ```
//!
//! The agent sends the secret verbatim as the first bytes after connecting.
//! No RPC frame is read before the gate reaches `Authenticated`.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{AuthError, SessionError};
use crate::protocol::FrameReader;

/// Secret used by the deployed agents
pub const DEFAULT_SECRET: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];

/// How long a fresh connection has to present the secret
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(2);

pub const ACK_ACCEPT: u8 = 0x01;
pub const ACK_REJECT: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    AwaitingSecret,
    Authenticated,
    Rejected,
}

/// Pure handshake state. Decides, the driver does the I/O.
#[derive(Debug)]
pub struct Handshake {
    state: GateState,
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            state: GateState::AwaitingSecret,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// Feed the bytes the agent presented. Returns the ack byte to send.
    ///
    /// Only the first call has an effect; the handshake never re-runs.
    pub fn receive(&mut self, presented: &[u8], secret: &[u8]) -> u8 {
        if self.state != GateState::AwaitingSecret {
            return self.ack();
        }
        self.state = if constant_time_eq(presented, secret) {
            GateState::Authenticated
        } else {
            GateState::Rejected
        };
        self.ack()
    }

    /// Deadline expired or the peer vanished before a full secret arrived.
    pub fn abort(&mut self) -> u8 {
        if self.state == GateState::AwaitingSecret {
            self.state = GateState::Rejected;
        }
        self.ack()
    }

    fn ack(&self) -> u8 {
        match self.state {
            GateState::Authenticated => ACK_ACCEPT,
            _ => ACK_REJECT,
        }
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Gate configuration shared by every connection the listener accepts.
#[derive(Debug, Clone)]
pub struct AuthGate {
    secret: Arc<[u8]>,
    timeout: Duration,
}

impl AuthGate {
    pub fn new(secret: impl Into<Arc<[u8]>>, timeout: Duration) -> Self {
        Self {
            secret: secret.into(),
            timeout,
        }
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the handshake on a fresh connection.
    ///
    /// On `Ok` the agent has been sent `0x01` and the reader is positioned at
    /// the first RPC frame. On `Err` a `0x00` has been attempted and the
    /// caller must drop the connection.
    pub async fn authenticate<R, W>(
        &self,
        reader: &mut FrameReader<R>,
        writer: &mut W,
    ) -> Result<(), AuthError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut handshake = Handshake::new();

        let presented =
            tokio::time::timeout(self.timeout, reader.read_exact(self.secret.len())).await;

        let (ack, outcome) = match presented {
            Ok(Ok(bytes)) => {
                let ack = handshake.receive(&bytes, &self.secret);
                let outcome = if handshake.state() == GateState::Authenticated {
                    Ok(())
                } else {
                    Err(AuthError::Mismatch {
                        received: hex::encode(&bytes),
                    })
                };
                (ack, outcome)
            }
            Ok(Err(SessionError::Io(e))) => (handshake.abort(), Err(AuthError::Io(e))),
            Ok(Err(_)) => (handshake.abort(), Err(AuthError::Disconnected)),
            Err(_) => (handshake.abort(), Err(AuthError::Timeout(self.timeout))),
        };

        match outcome {
            Ok(()) => {
                writer.write_all(&[ack]).await?;
                writer.flush().await?;
                tracing::info!("agent authenticated");
                Ok(())
            }
            Err(e) => {
                // Best effort: the peer may already be gone.
                if writer.write_all(&[ack]).await.is_ok() {
                    let _ = writer.flush().await;
                }
                tracing::warn!(error = %e, "authentication failed");
                Err(e)
            }
        }
    }
}

impl Default for AuthGate {
    fn default() -> Self {
        Self::new(DEFAULT_SECRET.to_vec(), DEFAULT_AUTH_TIMEOUT)
    }
}
