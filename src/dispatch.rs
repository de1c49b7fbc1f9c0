//! Runs parsed commands against a session and reports to the operator.
//!
//! Results go to stdout; structured events go through `tracing`. An ERROR
//! from the agent is printed and the session carries on. Only fatal
//! [`SessionError`]s are returned to the caller.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::command::{Command, GrepPattern, HELP};
use crate::config::expand_tilde;
use crate::downloads::DownloadStore;
use crate::error::Result;
use crate::protocol::Opcode;
use crate::session::{Progress, Session, TailEnd};

/// What the caller should do after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Source of the operator's "stop" signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// SIGINT / Ctrl-C
    CtrlC,
    /// Fires after a fixed delay, for scripted use
    After(Duration),
}

impl Interrupt {
    /// Resolve on the next interrupt. Only signals delivered after the call
    /// count.
    pub async fn wait(self) {
        match self {
            Self::CtrlC => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "cannot listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            }
            Self::After(delay) => tokio::time::sleep(delay).await,
        }
    }
}

fn marker_info() -> colored::ColoredString {
    "[*]".cyan()
}

fn marker_ok() -> colored::ColoredString {
    "[+]".green()
}

fn report_error(msg: impl std::fmt::Display) {
    println!("{} {msg}", "Error:".red().bold());
}

fn flush_stdout() {
    let _ = std::io::stdout().flush();
}

fn bytes_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb
}

fn stream_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("  {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb
}

/// Executes commands for one listener; shared by every session it runs.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    downloads: DownloadStore,
    interrupt: Interrupt,
}

impl Dispatcher {
    pub fn new(downloads: DownloadStore, interrupt: Interrupt) -> Self {
        Self {
            downloads,
            interrupt,
        }
    }

    pub fn downloads(&self) -> &DownloadStore {
        &self.downloads
    }

    pub fn interrupt(&self) -> Interrupt {
        self.interrupt
    }

    /// Parse and run one line. Parse errors and agent ERRORs are reported
    /// here; an `Err` means the session is over.
    pub async fn run_line<R, W>(&self, session: &mut Session<R, W>, line: &str) -> Result<Flow>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let cmd = match Command::parse(line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => return Ok(Flow::Continue),
            Err(e) => {
                report_error(e);
                return Ok(Flow::Continue);
            }
        };

        match self.execute(session, cmd).await {
            Err(e) if !e.is_fatal() => {
                report_error(e);
                Ok(Flow::Continue)
            }
            other => other,
        }
    }

    pub async fn execute<R, W>(&self, session: &mut Session<R, W>, cmd: Command) -> Result<Flow>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        tracing::debug!(?cmd, "execute");

        match cmd {
            Command::Stats { path } => {
                println!("{} Getting stats for: {path}", marker_info());
                println!("{}", session.stats_of(&path).await?);
            }
            Command::List { path } => {
                println!("{} Listing directory: {path}", marker_info());
                println!("{}", session.list_dir(&path).await?);
            }
            Command::Pwd => {
                println!("{} Getting current directory...", marker_info());
                println!("{}", session.pwd().await?);
            }
            Command::Download { path } => self.download(session, &path).await?,
            Command::Upload { local, remote } => {
                self.transfer(session, Opcode::Upload, &local, &remote)
                    .await?
            }
            Command::Append { local, remote } => {
                self.transfer(session, Opcode::Append, &local, &remote)
                    .await?
            }
            Command::BinaryGrep { path, hex, pattern } => {
                match pattern {
                    GrepPattern::Hex => {
                        println!("{} Searching '{path}' for hex pattern: {hex}", marker_info())
                    }
                    GrepPattern::Text(text) => {
                        println!("{} Searching '{path}' for pattern: {text}", marker_info());
                        println!("    Hex pattern: {hex}");
                    }
                }
                let reply = session.binary_grep(&path, &hex).await?;
                for record in &reply.records {
                    print!("{}", String::from_utf8_lossy(record));
                }
                flush_stdout();
                let summary = reply.summary_text();
                if !summary.is_empty() {
                    println!("{summary}");
                }
            }
            Command::Substitute {
                path,
                search,
                replace,
            } => {
                println!("{} Running sed on: {path}", marker_info());
                println!("    Search:  '{search}'");
                println!("    Replace: '{replace}'");
                let reply = session.substitute(&path, &search, &replace).await?;
                let rule = "=".repeat(60);
                println!("{rule}");
                println!("{}", String::from_utf8_lossy(&reply.data()));
                println!("{rule}");
                let summary = reply.summary_text();
                if !summary.is_empty() {
                    println!("{summary}");
                }
            }
            Command::Tail { path } => self.tail(session, &path).await?,
            Command::Timestomp { path, atime, mtime } => {
                println!(
                    "{} Setting timestamps on {path} (atime={atime}, mtime={mtime})",
                    marker_info()
                );
                println!("{}", session.set_timestamps(&path, atime, mtime).await?);
            }
            Command::WordCount { path, mode } => {
                println!("{}", session.word_count(&path, mode).await?);
            }
            Command::Djb2 { path } => {
                println!("{}", session.djb2_hash(&path).await?);
            }
            Command::RunRwx { path } => {
                println!("{} Running from memory: {path}", marker_info());
                println!("{}", session.run_in_memory(&path).await?);
            }
            Command::Maps => {
                println!("{}", session.proc_maps().await?);
            }
            Command::Help => println!("{HELP}"),
            Command::Exit => {
                println!("{} Sending exit command...", marker_info());
                match session.exit().await {
                    Ok(Some(reply)) if !reply.is_empty() => println!("  {reply}"),
                    Ok(_) => {}
                    Err(e) if !e.is_fatal() => report_error(e),
                    Err(e) => return Err(e),
                }
                println!("Goodbye!");
                return Ok(Flow::Exit);
            }
        }

        Ok(Flow::Continue)
    }

    async fn download<R, W>(&self, session: &mut Session<R, W>, path: &str) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        println!("{} Downloading file: {path}", marker_info());

        let pb = stream_spinner();
        let reply = session
            .download(path, |p: Progress| {
                pb.set_message(format!(
                    "Received chunk {}: {} bytes (total: {} bytes)",
                    p.chunk, p.chunk_len, p.total
                ));
                pb.tick();
            })
            .await;
        pb.finish_and_clear();
        let reply = reply?;

        println!(
            "{} Download complete: {} bytes in {} chunks",
            marker_ok(),
            reply.len(),
            reply.records.len()
        );

        match self.downloads.save(path, &reply.data()).await {
            Ok(saved) => println!("  Saved as: {}", saved.display()),
            Err(e) => {
                tracing::warn!(error = %e, "saving download failed");
                report_error(format!("{e:#}"));
            }
        }
        Ok(())
    }

    async fn transfer<R, W>(
        &self,
        session: &mut Session<R, W>,
        opcode: Opcode,
        local: &Path,
        remote: &str,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let verb = if opcode == Opcode::Append {
            "Appending"
        } else {
            "Uploading"
        };
        println!(
            "{} {verb} '{}' to agent path: {remote}",
            marker_info(),
            local.display()
        );

        // Nothing goes on the wire unless the source can be read
        let local = expand_tilde(local);
        let file = match tokio::fs::File::open(&local).await {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(path = %local.display(), error = %e, "local source unavailable");
                report_error(format!("Local file '{}' not found", local.display()));
                return Ok(());
            }
        };
        let len = match file.metadata().await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let pb = bytes_bar(len);
        let on_chunk = |p: Progress| {
            pb.set_position(p.total);
            pb.set_message(format!("chunk {}", p.chunk));
        };
        let reply = match opcode {
            Opcode::Append => session.append(remote, file, on_chunk).await,
            _ => session.upload(remote, file, on_chunk).await,
        };
        pb.finish_and_clear();
        let reply = reply?;

        println!("  {}", reply.ready);
        println!(
            "{} {} ({} bytes in {} chunks)",
            marker_ok(),
            reply.summary,
            reply.bytes,
            reply.chunks
        );
        Ok(())
    }

    async fn tail<R, W>(&self, session: &mut Session<R, W>, path: &str) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        println!("{} Tailing file: {path}", marker_info());
        println!("    (Press Ctrl+C to cancel)");

        let reply = session
            .tail(path, self.interrupt.wait(), |data| {
                print!("{}", String::from_utf8_lossy(data));
                flush_stdout();
            })
            .await?;

        match reply.end {
            TailEnd::Cancelled { confirmation } => {
                println!("\n{} {confirmation}", marker_info());
            }
            TailEnd::Finished { message } if !message.is_empty() => println!("\n{message}"),
            TailEnd::Finished { .. } => {}
        }
        tracing::info!(path, frames = reply.frames, bytes = reply.bytes, "tail ended");
        Ok(())
    }
}
