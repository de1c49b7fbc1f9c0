use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};

use crate::config::{resolve, FileConfig, ListenerConfig, Overrides};

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version, about = "Listen for a remote file agent and drive it interactively")]
#[command(long_about = "Listen for a remote file agent and drive it interactively.

The agent connects in, proves it knows the shared secret, and is then
controlled from the `agent>` prompt (type `help` there for commands).

Examples:
  tether 4444                          # listen on 0.0.0.0:4444
  tether 127.0.0.1 4444                # listen on one interface
  tether 4444 --oncon 'ls /'           # run a command as soon as an agent connects
  tether 4444 --rc ./startup.rc        # run a script of commands on connect
  tether --config ~/.config/tether.toml")]
pub struct Cli {
    /// [BIND] PORT (bind address defaults to 0.0.0.0)
    #[arg(value_name = "ADDR")]
    pub target: Vec<String>,

    /// Command to run automatically on connection (e.g. "ls /")
    #[arg(long)]
    pub oncon: Option<String>,

    /// File with newline-separated commands to run on connection
    #[arg(long)]
    pub rc: Option<PathBuf>,

    /// Directory downloaded files are saved to [default: ./downloads]
    #[arg(long, env = "TETHER_DOWNLOADS_DIR")]
    pub downloads_dir: Option<PathBuf>,

    /// Shared secret agents must present, as hex [default: deadbeef]
    #[arg(long, env = "TETHER_SECRET", hide_env_values = true)]
    pub secret: Option<String>,

    /// Seconds a new connection has to authenticate [default: 2]
    #[arg(long, value_name = "SECS")]
    pub auth_timeout: Option<f64>,

    /// TOML config file; command-line values take precedence
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// `[BIND] PORT` -> (bind, port)
fn split_target(target: &[String]) -> Result<(Option<IpAddr>, Option<u16>)> {
    let port = |s: &str| {
        s.parse::<u16>()
            .with_context(|| format!("Invalid port: {s}"))
    };
    let bind = |s: &str| {
        s.parse::<IpAddr>()
            .with_context(|| format!("Invalid bind address: {s}"))
    };

    match target {
        [] => Ok((None, None)),
        [p] => Ok((None, Some(port(p)?))),
        [b, p] => Ok((Some(bind(b)?), Some(port(p)?))),
        _ => bail!("Expected [BIND] PORT"),
    }
}

impl Cli {
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    pub fn overrides(&self) -> Result<Overrides> {
        let (bind, port) = split_target(&self.target)?;
        Ok(Overrides {
            bind,
            port,
            oncon: self.oncon.clone(),
            rc: self.rc.clone(),
            downloads_dir: self.downloads_dir.clone(),
            secret: self.secret.clone(),
            auth_timeout_secs: self.auth_timeout,
        })
    }

    /// Load the config file (if any) and merge the command line over it.
    pub fn into_config(self) -> Result<ListenerConfig> {
        let file = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        resolve(file, self.overrides()?)
    }
}
