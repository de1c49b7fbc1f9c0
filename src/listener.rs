//! TCP listener: accept, authenticate, run one session at a time.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use colored::Colorize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::net::{TcpListener, TcpStream};

use crate::auth::AuthGate;
use crate::config::ListenerConfig;
use crate::console::{run_session, SessionEnd, SessionScript};
use crate::dispatch::{Dispatcher, Interrupt};
use crate::downloads::DownloadStore;
use crate::protocol::FrameReader;
use crate::session::{Session, SessionConfig};

/// How a connection was disposed of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Rejected,
    Ended(SessionEnd),
    /// Fatal session error, already reported
    Failed,
}

pub struct Listener {
    listener: TcpListener,
    gate: AuthGate,
    dispatcher: Dispatcher,
    script: SessionScript,
    session_config: SessionConfig,
}

impl Listener {
    pub async fn bind(config: &ListenerConfig, interrupt: Interrupt) -> Result<Self> {
        let listener = TcpListener::bind(config.addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.addr))?;
        Ok(Self::from_tcp(listener, config, interrupt))
    }

    /// Wrap an already bound socket.
    pub fn from_tcp(listener: TcpListener, config: &ListenerConfig, interrupt: Interrupt) -> Self {
        Self {
            listener,
            gate: AuthGate::new(config.secret.clone(), config.auth_timeout),
            dispatcher: Dispatcher::new(DownloadStore::new(config.downloads_dir.clone()), interrupt),
            script: SessionScript {
                rc: config.rc.clone(),
                oncon: config.oncon.clone(),
            },
            session_config: config.session.clone(),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Serve until the interrupt fires while waiting for a connection.
    pub async fn serve<I>(&self, input: &mut Lines<I>) -> Result<()>
    where
        I: AsyncBufRead + Unpin,
    {
        println!(
            "{} Server listening on {}",
            "[*]".cyan(),
            self.local_addr()?
        );

        loop {
            println!("{} Waiting for agent connection...", "[*]".cyan());

            let accepted = tokio::select! {
                r = self.listener.accept() => r,
                () = self.dispatcher.interrupt().wait() => {
                    println!("\n{} Server shutting down...", "[*]".cyan());
                    tracing::info!("listener stopped");
                    return Ok(());
                }
            };

            match accepted {
                Ok((stream, peer)) => {
                    self.handle(stream, peer, input).await;
                }
                Err(e) => {
                    // Per-connection failures (e.g. reset before accept) are not fatal
                    tracing::warn!(error = %e, "accept failed");
                }
            }
        }
    }

    /// Authenticate one connection and, if it passes, run its session.
    pub async fn handle<I>(&self, stream: TcpStream, peer: SocketAddr, input: &mut Lines<I>) -> Outcome
    where
        I: AsyncBufRead + Unpin,
    {
        println!("\n{} Agent connected from {peer}", "[+]".green());
        tracing::info!(%peer, "connection accepted");

        let _ = stream.set_nodelay(true);
        let (rd, mut wr) = stream.into_split();
        let mut reader = FrameReader::new(rd);

        println!(
            "Waiting for authentication (timeout: {:?})...",
            self.gate.timeout()
        );
        if let Err(e) = self.gate.authenticate(&mut reader, &mut wr).await {
            println!("{} Authentication failed: {e}", "✗".red());
            println!("{} Closing connection", "[-]".red());
            return Outcome::Rejected;
        }
        println!("{} Authentication successful", "✓".green());

        let mut session = Session::new(reader, wr, self.session_config.clone());
        let result = run_session(&self.dispatcher, &mut session, &self.script, input).await;

        let stats = session.stats();
        let outcome = match result {
            Ok(end) => {
                tracing::info!(
                    %peer,
                    ?end,
                    requests = stats.requests,
                    bytes_received = stats.bytes_received,
                    bytes_sent = stats.bytes_sent,
                    commands_failed = stats.commands_failed,
                    "session ended"
                );
                Outcome::Ended(end)
            }
            Err(e) => {
                println!("\n{} Session error: {e}", "✗".red());
                println!("Agent disconnected");
                tracing::warn!(
                    %peer,
                    error = %e,
                    requests = stats.requests,
                    "session failed"
                );
                Outcome::Failed
            }
        };

        println!("\n{} Connection closed", "[-]".red());
        outcome
    }
}

/// Bind per `config` and serve the operator on stdin until Ctrl-C.
pub async fn run(config: ListenerConfig) -> Result<()> {
    let listener = Listener::bind(&config, Interrupt::CtrlC).await?;
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    listener.serve(&mut input).await
}
