use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ipnet::Ipv6Net;

use crate::error::{Error, Result};

/// Tunnel encapsulation negotiated with the broker.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TunnelMode {
    /// IPv6 in IPv4 (protocol 41).
    V6V4,
    /// IPv6 in UDP over IPv4, used to cross NAT.
    V6UdpV4,
    /// IPv4 in IPv6.
    V4V6,
}

impl TunnelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelMode::V6V4 => "v6v4",
            TunnelMode::V6UdpV4 => "v6udpv4",
            TunnelMode::V4V6 => "v4v6",
        }
    }
    pub fn is_nat_traversal(&self) -> bool {
        *self == TunnelMode::V6UdpV4
    }
}

impl FromStr for TunnelMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v6v4" => Ok(TunnelMode::V6V4),
            "v6udpv4" => Ok(TunnelMode::V6UdpV4),
            "v4v6" => Ok(TunnelMode::V4V6),
            _ => Err(Error::UnknownMode(s.to_string())),
        }
    }
}

impl fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One established tunnel, as handed out by the broker.
///
/// Read-only for the local setup; build one with [`crate::DescriptorBuilder`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TunnelDescriptor {
    pub mode: TunnelMode,
    pub client_address_ipv4: Ipv4Addr,
    pub server_address_ipv4: Ipv4Addr,
    pub client_address_ipv6: Ipv6Addr,
    pub server_address_ipv6: Ipv6Addr,
    pub keepalive_address_ipv6: Ipv6Addr,
    /// Raw interval in seconds, exactly as received.
    pub keepalive_interval: Option<String>,
    /// Routed prefix delegated to this client, if any.
    pub prefix: Option<Ipv6Net>,
}

impl TunnelDescriptor {
    /// Keepalive interval in seconds; `0` disables keepalive.
    ///
    /// An absent or unparsable value is not an error, it only means no
    /// keepalive was requested.
    pub fn keepalive_interval(&self) -> u64 {
        match self.keepalive_interval.as_deref().map(str::trim) {
            None | Some("") => 0,
            Some(raw) => match raw.parse::<u64>() {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("ignoring keepalive interval {raw:?}: {e}");
                    0
                }
            },
        }
    }
}

/// Role advertised to the configuration script.
#[derive(Clone, Copy, Default, Debug, Eq, PartialEq)]
pub enum HostType {
    #[default]
    Host,
    Router,
}

impl HostType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostType::Host => "host",
            HostType::Router => "router",
        }
    }
}

impl FromStr for HostType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(HostType::Host),
            "router" => Ok(HostType::Router),
            _ => Err(Error::InvalidConfig(format!("host_type {s:?}"))),
        }
    }
}

/// Platform network tools handed through to the configuration script.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetTools {
    pub if_tunnel_v6v4: String,
    pub if_tunnel_v6udpv4: String,
    pub if_tunnel_v4v6: String,
    /// Interface that receives the delegated prefix when acting as a router.
    pub if_prefix: Option<String>,
    pub host_type: HostType,
}

impl Default for NetTools {
    fn default() -> Self {
        NetTools {
            if_tunnel_v6v4: "sit1".into(),
            if_tunnel_v6udpv4: "tun".into(),
            if_tunnel_v4v6: "sit0".into(),
            if_prefix: None,
            host_type: HostType::Host,
        }
    }
}

impl NetTools {
    pub fn interface_for(&self, mode: TunnelMode) -> &str {
        match mode {
            TunnelMode::V6V4 => &self.if_tunnel_v6v4,
            TunnelMode::V6UdpV4 => &self.if_tunnel_v6udpv4,
            TunnelMode::V4V6 => &self.if_tunnel_v4v6,
        }
    }
}

const DEFAULT_LOG_FILE: &str = "tsp-local.log";

/// Behaviour of the local setup itself.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LocalConfig {
    pub template_dir: PathBuf,
    /// Script name without the `.sh` suffix.
    pub template: String,
    /// Log verbosity, 0 to 3.
    pub verbose: u8,
    pub daemonize: bool,
    /// `None` waits for the script forever.
    pub script_timeout: Option<Duration>,
    pub log_file: Option<PathBuf>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        LocalConfig {
            template_dir: PathBuf::from("template"),
            template: "linux".into(),
            verbose: 1,
            daemonize: true,
            script_timeout: None,
            log_file: None,
        }
    }
}

impl LocalConfig {
    pub fn script_path(&self) -> PathBuf {
        self.template_dir.join(format!("{}.sh", self.template))
    }

    /// Where log output should go; stderr is gone once detached, so a
    /// daemonized setup always gets a file.
    pub fn log_path(&self) -> Option<PathBuf> {
        match (&self.log_file, self.daemonize) {
            (Some(path), _) => Some(path.clone()),
            (None, true) => Some(PathBuf::from(DEFAULT_LOG_FILE)),
            (None, false) => None,
        }
    }
}

/// Everything read from the client configuration file.
#[derive(Clone, Default, Debug, Eq, PartialEq)]
pub struct Settings {
    pub local: LocalConfig,
    pub tools: NetTools,
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        text.parse()
    }

    pub fn level_filter(&self) -> log::LevelFilter {
        match self.local.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "template_dir" => self.local.template_dir = PathBuf::from(value),
            "template" => self.local.template = value.to_string(),
            "verbose" => {
                let v: u8 = value.parse()?;
                if v > 3 {
                    return Err(Error::InvalidConfig(format!("verbose {v} out of range")));
                }
                self.local.verbose = v;
            }
            "daemonize" => self.local.daemonize = parse_bool(key, value)?,
            "script_timeout" => {
                let secs: u64 = value.parse()?;
                self.local.script_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            "log_file" => {
                self.local.log_file = (!value.is_empty()).then(|| PathBuf::from(value))
            }
            "if_tunnel_v6v4" => self.tools.if_tunnel_v6v4 = value.to_string(),
            "if_tunnel_v6udpv4" => self.tools.if_tunnel_v6udpv4 = value.to_string(),
            "if_tunnel_v4v6" => self.tools.if_tunnel_v4v6 = value.to_string(),
            "if_prefix" => {
                self.tools.if_prefix = (!value.is_empty()).then(|| value.to_string())
            }
            "host_type" => self.tools.host_type = value.parse()?,
            _ => return Err(Error::InvalidConfig(format!("unknown key {key:?}"))),
        }
        Ok(())
    }
}

impl FromStr for Settings {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut settings = Settings::default();
        for (n, line) in s.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::InvalidConfig(format!(
                    "line {}: expected key=value",
                    n + 1
                )));
            };
            settings.set(key.trim(), value.trim().trim_matches('"'))?;
        }
        Ok(settings)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(Error::InvalidConfig(format!("{key}: expected yes or no"))),
    }
}
