//! Tunnel Endpoints
//!
//! A server to connect to, and the chain of one or two servers that make
//! up a connection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Loopback port stunnel listens on for SSL-wrapped tunnels
pub const SSL_WRAPPER_PORT: u16 = 1413;

/// Loopback port ssh forwards for SSH-wrapped tunnels
pub const SSH_WRAPPER_PORT: u16 = 1412;

/// Transport protocol of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[serde(alias = "UDP")]
    Udp,
    #[serde(alias = "TCP")]
    Tcp,
    /// Tunnel bytes carried by stunnel
    #[serde(alias = "SSL")]
    Ssl,
    /// Tunnel bytes carried by an ssh port forward
    #[serde(alias = "SSH")]
    Ssh,
}

impl Protocol {
    /// Does a wrapper process carry the tunnel?
    pub fn is_wrapped(&self) -> bool {
        matches!(self, Protocol::Ssl | Protocol::Ssh)
    }

    /// Local port the wrapper listens on
    pub fn wrapper_port(&self) -> Option<u16> {
        match self {
            Protocol::Ssl => Some(SSL_WRAPPER_PORT),
            Protocol::Ssh => Some(SSH_WRAPPER_PORT),
            _ => None,
        }
    }

    /// Protocol the tunnel binary itself speaks
    pub fn transport(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp | Protocol::Ssl | Protocol::Ssh => "tcp",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::Ssl => "ssl",
            Protocol::Ssh => "ssh",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            "ssl" => Ok(Protocol::Ssl),
            "ssh" => Ok(Protocol::Ssh),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// One server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEndpoint {
    /// Display name
    pub name: String,
    /// Provider identity (`Airvpn`, `Mullvad`, `PIA`, or anything else)
    pub provider: String,
    /// Real server address
    pub address: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    /// User-supplied tunnel profile, for providers without a template
    #[serde(default)]
    pub profile: Option<PathBuf>,
}

impl TunnelEndpoint {
    /// Create an endpoint without a profile
    pub fn new(
        name: impl Into<String>,
        provider: impl Into<String>,
        address: IpAddr,
        port: u16,
        protocol: Protocol,
    ) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            address,
            port,
            protocol,
            profile: None,
        }
    }

    /// Attach a profile file
    pub fn with_profile(mut self, profile: impl Into<PathBuf>) -> Self {
        self.profile = Some(profile.into());
        self
    }
}

impl fmt::Display for TunnelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{}/{})", self.name, self.address, self.port, self.protocol)
    }
}

/// Position of a tunnel in its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HopRole {
    /// The only tunnel
    Single,
    /// First tunnel of a two-hop chain
    Intermediate,
    /// Second tunnel of a two-hop chain, carrying user traffic
    Terminal,
}

impl fmt::Display for HopRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HopRole::Single => f.write_str("single"),
            HopRole::Intermediate => f.write_str("hop"),
            HopRole::Terminal => f.write_str("terminal"),
        }
    }
}

/// Zero or one intermediate hop plus the terminal hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopChain {
    intermediate: Option<TunnelEndpoint>,
    terminal: TunnelEndpoint,
}

impl HopChain {
    /// Chain with a single tunnel
    pub fn single(endpoint: TunnelEndpoint) -> Self {
        Self {
            intermediate: None,
            terminal: endpoint,
        }
    }

    /// Chain tunnelling `terminal` through `hop`
    pub fn via(hop: TunnelEndpoint, terminal: TunnelEndpoint) -> Self {
        Self {
            intermediate: Some(hop),
            terminal,
        }
    }

    pub fn intermediate(&self) -> Option<&TunnelEndpoint> {
        self.intermediate.as_ref()
    }

    pub fn terminal(&self) -> &TunnelEndpoint {
        &self.terminal
    }

    /// Role of the terminal endpoint
    pub fn terminal_role(&self) -> HopRole {
        if self.intermediate.is_some() {
            HopRole::Terminal
        } else {
            HopRole::Single
        }
    }

    /// All endpoints, intermediate first
    pub fn endpoints(&self) -> impl Iterator<Item = &TunnelEndpoint> {
        self.intermediate.iter().chain(std::iter::once(&self.terminal))
    }
}
