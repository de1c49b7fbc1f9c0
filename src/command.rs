//! Operator commands.
//!
//! A line typed at the prompt (or read from an RC file) is split with
//! shell-like quoting and parsed into a [`Command`]. Parsing never touches
//! the connection, so a bad line costs nothing on the wire.

use std::path::PathBuf;

use crate::error::CommandError;
use crate::session::WordCountMode;

// =============================================================================
// Tokenizer
// =============================================================================

/// Split a command line into words.
///
/// Follows POSIX shell rules for the subset that matters here: whitespace
/// separates words, single quotes are literal, double quotes allow `\"`,
/// `\\`, `\$` and `` \` `` escapes, and a bare backslash escapes the next
/// character.
pub fn split_line(line: &str) -> Result<Vec<String>, CommandError> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err(CommandError::UnterminatedQuote),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => word.push(c),
                            Some('\n') => {}
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => return Err(CommandError::UnterminatedQuote),
                        },
                        Some(c) => word.push(c),
                        None => return Err(CommandError::UnterminatedQuote),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some('\n') => {}
                    Some(c) => word.push(c),
                    None => return Err(CommandError::TrailingEscape),
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }

    if in_word {
        words.push(word);
    }
    Ok(words)
}

// =============================================================================
// Commands
// =============================================================================

/// How a bgrep pattern was given
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrepPattern {
    /// Plain text, hex-encoded before sending
    Text(String),
    /// Already hex, validated and lowercased
    Hex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Stats { path: String },
    List { path: String },
    Pwd,
    Download { path: String },
    Upload { local: PathBuf, remote: String },
    Append { local: PathBuf, remote: String },
    BinaryGrep { path: String, hex: String, pattern: GrepPattern },
    Substitute { path: String, search: String, replace: String },
    Tail { path: String },
    Timestomp { path: String, atime: i64, mtime: i64 },
    WordCount { path: String, mode: WordCountMode },
    Djb2 { path: String },
    RunRwx { path: String },
    Maps,
    Help,
    Exit,
}

mod usage {
    pub const STATS: &str = "stats <path>";
    pub const LS: &str = "ls <path>";
    pub const DOWNLOAD: &str = "download <path>";
    pub const UPLOAD: &str = "upload <local_path> <remote_path>";
    pub const APPEND: &str = "append <local_path> <remote_path>";
    pub const BGREP: &str = "bgrep <path> <pattern>";
    pub const BGREP_HEX: &str = "bgrep --hex <path> <hex_pattern>";
    pub const SED: &str = "sed <path> <search> <replace>";
    pub const TAILF: &str = "tailf <path>";
    pub const TIMESTOMP: &str = "timestomp <path> <atime> <mtime>";
    pub const WC: &str = "wc [-l|-c] <path>";
    pub const DJB2SUM: &str = "djb2sum <path>";
    pub const RUNRWX: &str = "runrwx <path>";
}

pub const HELP: &str = "
Available commands:
  stats <path>                      - Get file statistics
  ls <path>                         - List directory contents
  pwd                               - Get current working directory
  download <path>                   - Download file from agent
  upload <local_path> <remote_path> - Upload local file to agent
  append <local_path> <remote_path> - Append local file to remote file on agent
  bgrep <path> <pattern>            - Search file for binary pattern (auto hex-encodes)
  bgrep --hex <path> <hex_pattern>  - Search with pre-encoded hex pattern (e.g. deadbeef)
  sed <path> <search> <replace>     - Find and replace text in file
  tailf <path>                      - Tail file continuously (Ctrl+C to cancel)
  timestomp <path> <atime> <mtime>  - Set access/modification time (epoch seconds)
  wc [-l|-c] <path>                 - Count lines, words and bytes
  djb2sum <path>                    - DJB2 hash of a file
  runrwx <path>                     - Load and run a binary from memory
  maps                              - Show the agent's memory maps
  help                              - Show this help
  exit                              - Exit and disconnect agent
";

/// Validate a hex pattern and normalize it to lowercase.
pub fn normalize_hex(pattern: &str) -> Result<String, CommandError> {
    let hex = pattern.to_ascii_lowercase();
    if hex.len() % 2 != 0 {
        return Err(CommandError::OddHexLength);
    }
    if let Some(c) = hex.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(CommandError::InvalidHexChar(c));
    }
    Ok(hex)
}

fn timestamp(s: &str) -> Result<i64, CommandError> {
    s.parse()
        .map_err(|_| CommandError::InvalidTimestamp(s.to_string()))
}

impl Command {
    /// Parse one line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let words = split_line(line)?;
        let Some((name, args)) = words.split_first() else {
            return Ok(None);
        };

        let arg = |i: usize, usage: &'static str| {
            args.get(i).cloned().ok_or(CommandError::Usage(usage))
        };

        let cmd = match name.to_lowercase().as_str() {
            "stats" => Self::Stats {
                path: arg(0, usage::STATS)?,
            },
            "ls" => Self::List {
                path: arg(0, usage::LS)?,
            },
            "pwd" => Self::Pwd,
            "download" => Self::Download {
                path: arg(0, usage::DOWNLOAD)?,
            },
            "upload" => Self::Upload {
                local: PathBuf::from(arg(0, usage::UPLOAD)?),
                remote: arg(1, usage::UPLOAD)?,
            },
            "append" => Self::Append {
                local: PathBuf::from(arg(0, usage::APPEND)?),
                remote: arg(1, usage::APPEND)?,
            },
            "bgrep" if args.first().map(String::as_str) == Some("--hex") => {
                let path = arg(1, usage::BGREP_HEX)?;
                let hex = normalize_hex(&arg(2, usage::BGREP_HEX)?)?;
                Self::BinaryGrep {
                    path,
                    hex,
                    pattern: GrepPattern::Hex,
                }
            }
            "bgrep" => {
                let path = arg(0, usage::BGREP)?;
                let text = arg(1, usage::BGREP)?;
                Self::BinaryGrep {
                    path,
                    hex: hex::encode(text.as_bytes()),
                    pattern: GrepPattern::Text(text),
                }
            }
            "sed" => Self::Substitute {
                path: arg(0, usage::SED)?,
                search: arg(1, usage::SED)?,
                replace: arg(2, usage::SED)?,
            },
            "tailf" => Self::Tail {
                path: arg(0, usage::TAILF)?,
            },
            "timestomp" => Self::Timestomp {
                path: arg(0, usage::TIMESTOMP)?,
                atime: timestamp(&arg(1, usage::TIMESTOMP)?)?,
                mtime: timestamp(&arg(2, usage::TIMESTOMP)?)?,
            },
            "wc" => {
                let (mode, at) = match args.first().map(String::as_str) {
                    Some("-l") => (WordCountMode::Lines, 1),
                    Some("-c") => (WordCountMode::Bytes, 1),
                    _ => (WordCountMode::All, 0),
                };
                Self::WordCount {
                    path: arg(at, usage::WC)?,
                    mode,
                }
            }
            "djb2sum" => Self::Djb2 {
                path: arg(0, usage::DJB2SUM)?,
            },
            "runrwx" => Self::RunRwx {
                path: arg(0, usage::RUNRWX)?,
            },
            "maps" => Self::Maps,
            "help" => Self::Help,
            "exit" => Self::Exit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };

        Ok(Some(cmd))
    }
}
