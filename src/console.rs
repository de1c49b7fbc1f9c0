//! Per-connection operator loop: RC script, on-connect command, prompt.

use std::io::Write;
use std::path::{Path, PathBuf};

use colored::Colorize;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, Lines};

use crate::dispatch::{Dispatcher, Flow};
use crate::error::Result;
use crate::session::Session;

pub const PROMPT: &str = "agent> ";

/// Commands run automatically at the start of every session
#[derive(Debug, Clone, Default)]
pub struct SessionScript {
    pub rc: Option<PathBuf>,
    pub oncon: Option<String>,
}

/// Why a session ended without a fatal error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// `exit` from a script or the prompt
    Exit,
    /// Operator input ran out; EXIT was sent on their behalf
    InputClosed,
}

/// RC file lines worth running, with their 1-based line numbers.
pub fn rc_commands(text: &str) -> Vec<(usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .collect()
}

fn banner() {
    println!("{}", "=".repeat(60));
}

async fn run_rc<R, W>(
    dispatcher: &Dispatcher,
    session: &mut Session<R, W>,
    rc: &Path,
) -> Result<Flow>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let text = match tokio::fs::read_to_string(rc).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("{} RC file not found: {}", "✗".red(), rc.display());
            return Ok(Flow::Continue);
        }
        Err(e) => {
            println!("{} Error reading RC file: {e}", "✗".red());
            return Ok(Flow::Continue);
        }
    };

    println!("\n{} Running commands from RC file: {}", "[*]".cyan(), rc.display());
    banner();
    for (line_no, line) in rc_commands(&text) {
        println!("\n{} {line}", format!("[RC:{line_no}]").as_str().yellow());
        if dispatcher.run_line(session, line).await? == Flow::Exit {
            return Ok(Flow::Exit);
        }
    }
    println!();
    banner();
    println!("{} RC file execution complete", "[*]".cyan());
    banner();
    Ok(Flow::Continue)
}

/// Drive one authenticated session until it ends.
///
/// `input` supplies operator lines and outlives the session, so the next
/// connection keeps reading from the same stream.
pub async fn run_session<R, W, I>(
    dispatcher: &Dispatcher,
    session: &mut Session<R, W>,
    script: &SessionScript,
    input: &mut Lines<I>,
) -> Result<SessionEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    I: AsyncBufRead + Unpin,
{
    println!();
    banner();
    println!("Connected to agent. Type 'help' for commands.");
    banner();

    if let Some(rc) = &script.rc {
        if run_rc(dispatcher, session, rc).await? == Flow::Exit {
            return Ok(SessionEnd::Exit);
        }
    }

    if let Some(cmd) = &script.oncon {
        println!("\n{} Running on-connect command: {cmd}", "[*]".cyan());
        banner();
        if dispatcher.run_line(session, cmd).await? == Flow::Exit {
            return Ok(SessionEnd::Exit);
        }
        banner();
    }

    loop {
        print!("\n{PROMPT}");
        let _ = std::io::stdout().flush();

        let line = tokio::select! {
            line = input.next_line() => line,
            () = dispatcher.interrupt().wait() => {
                println!("\nUse 'exit' command to quit");
                continue;
            }
        };

        match line {
            Ok(Some(line)) => {
                if dispatcher.run_line(session, line.trim()).await? == Flow::Exit {
                    return Ok(SessionEnd::Exit);
                }
            }
            Ok(None) => {
                println!();
                dispatcher.run_line(session, "exit").await?;
                return Ok(SessionEnd::InputClosed);
            }
            Err(e) => {
                tracing::warn!(error = %e, "operator input failed");
                dispatcher.run_line(session, "exit").await?;
                return Ok(SessionEnd::InputClosed);
            }
        }
    }
}
