//! Listener configuration.
//!
//! Values come from an optional TOML file and the command line; the command
//! line wins. The result is an immutable [`ListenerConfig`] handed to the
//! listener, never process-wide state.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::auth::{DEFAULT_AUTH_TIMEOUT, DEFAULT_SECRET};
use crate::session::{SessionConfig, DEFAULT_CANCEL_TIMEOUT};

pub const DEFAULT_DOWNLOADS_DIR: &str = "./downloads";

/// Expand a leading `~` component to the operator's home directory.
///
/// Anything else, `~user` included, comes back borrowed and unchanged.
pub fn expand_tilde(path: &Path) -> Cow<'_, Path> {
    expand_tilde_in(path, dirs::home_dir().as_deref())
}

fn expand_tilde_in<'a>(path: &'a Path, home: Option<&Path>) -> Cow<'a, Path> {
    let mut components = path.components();
    match (components.next(), home) {
        (Some(Component::Normal(first)), Some(home)) if first == "~" => {
            let rest = components.as_path();
            if rest.as_os_str().is_empty() {
                Cow::Owned(home.to_path_buf())
            } else {
                Cow::Owned(home.join(rest))
            }
        }
        _ => Cow::Borrowed(path),
    }
}

/// Parse a secret given as hex (`deadbeef`, `DE AD BE EF`, `0xdeadbeef`).
pub fn parse_secret(s: &str) -> Result<Vec<u8>> {
    let compact: String = s
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    let secret = hex::decode(&compact).with_context(|| format!("Invalid hex secret: {s}"))?;
    if secret.is_empty() {
        anyhow::bail!("Secret must not be empty");
    }
    Ok(secret)
}

/// Optional TOML configuration file. Every key may be omitted.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub oncon: Option<String>,
    pub rc: Option<PathBuf>,
    pub downloads_dir: Option<PathBuf>,
    pub secret: Option<String>,
    pub auth_timeout_secs: Option<f64>,
    pub cancel_timeout_secs: Option<f64>,
}

impl FileConfig {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("Invalid config file")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let path = expand_tilde(path);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&text)
    }
}

/// Everything the listener needs, resolved.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub addr: SocketAddr,
    /// Command run once per authenticated session, after the RC file
    pub oncon: Option<String>,
    /// File of newline-separated commands run first in every session
    pub rc: Option<PathBuf>,
    pub downloads_dir: PathBuf,
    pub secret: Vec<u8>,
    pub auth_timeout: Duration,
    pub session: SessionConfig,
}

impl ListenerConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            oncon: None,
            rc: None,
            downloads_dir: PathBuf::from(DEFAULT_DOWNLOADS_DIR),
            secret: DEFAULT_SECRET.to_vec(),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            session: SessionConfig::default(),
        }
    }
}

/// Command-line overrides, already parsed by clap.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub oncon: Option<String>,
    pub rc: Option<PathBuf>,
    pub downloads_dir: Option<PathBuf>,
    pub secret: Option<String>,
    pub auth_timeout_secs: Option<f64>,
}

fn secs(value: f64, what: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("Invalid {what}: {value}"))
}

/// Merge file values and command-line overrides.
pub fn resolve(file: FileConfig, cli: Overrides) -> Result<ListenerConfig> {
    let port = cli
        .port
        .or(file.port)
        .context("A port is required (argument or `port` in the config file)")?;
    let bind = cli
        .bind
        .or(file.bind)
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    let mut config = ListenerConfig::new(SocketAddr::new(bind, port));
    config.oncon = cli.oncon.or(file.oncon);
    config.rc = cli.rc.or(file.rc).map(|p| expand_tilde(&p).into_owned());
    if let Some(dir) = cli.downloads_dir.or(file.downloads_dir) {
        config.downloads_dir = expand_tilde(&dir).into_owned();
    }
    if let Some(secret) = cli.secret.or(file.secret) {
        config.secret = parse_secret(&secret)?;
    }
    if let Some(t) = cli.auth_timeout_secs.or(file.auth_timeout_secs) {
        config.auth_timeout = secs(t, "auth timeout")?;
    }
    config.session.cancel_timeout = match file.cancel_timeout_secs {
        Some(t) => secs(t, "cancel timeout")?,
        None => DEFAULT_CANCEL_TIMEOUT,
    };

    Ok(config)
}
