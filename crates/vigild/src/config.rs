//! Daemon Configuration
//!
//! Loaded from a TOML file (`/etc/vigil/vigild.toml` unless overridden).
//! Every key is optional; a missing file means all defaults.
//!
//! ```toml
//! root_dir = "/usr/share/vigil"
//!
//! [firewall]
//! mode = "secure"
//! allow_ping = false
//! disable_ipv6 = true
//!
//! [dns]
//! fallback = ["208.67.222.222", "208.67.220.220"]
//!
//! [tunnel]
//! hop_timeout_secs = 60
//! ```

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use vigil_firewall::Mode;
use vigil_tunnel::{CommandConfig, OrchestratorConfig, TunnelEndpoint};

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vigil/vigild.toml";

/// Environment variable overriding the config location
pub const CONFIG_ENV: &str = "VIGILD_CONFIG";

/// Config errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Rule documents, provider templates, hop scripts, keys
    pub root_dir: PathBuf,
    /// Keep firewall changes in memory and skip sysctl
    pub dry_run: bool,
    pub firewall: FirewallSection,
    pub dns: DnsSection,
    pub tunnel: TunnelSection,
    /// Connect at startup
    pub autoconnect: Option<AutoConnect>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/usr/share/vigil"),
            dry_run: false,
            firewall: FirewallSection::default(),
            dns: DnsSection::default(),
            tunnel: TunnelSection::default(),
            autoconnect: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallSection {
    pub mode: Mode,
    pub allow_ping: bool,
    pub disable_ipv6: bool,
}

impl Default for FirewallSection {
    fn default() -> Self {
        Self {
            mode: Mode::Secure,
            allow_ping: false,
            disable_ipv6: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSection {
    /// Resolvers used for bootstrap lookups and when the server pushes none
    pub fallback: [IpAddr; 2],
    /// Always use the fallback resolvers
    pub force_fallback: bool,
    pub resolv_conf: PathBuf,
    pub backup: PathBuf,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            fallback: [
                IpAddr::from([208, 67, 222, 222]),
                IpAddr::from([208, 67, 220, 220]),
            ],
            force_fallback: false,
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            backup: PathBuf::from("/etc/resolv.conf.vigil.bak"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSection {
    pub openvpn: PathBuf,
    pub stunnel: PathBuf,
    pub ssh: PathBuf,
    /// Provider templates; `root_dir` when unset
    pub template_dir: Option<PathBuf>,
    /// Rendered configs; `root_dir` when unset
    pub work_dir: Option<PathBuf>,
    /// `hop.sh` / `hop_down.sh`; `root_dir` when unset
    pub script_dir: Option<PathBuf>,
    /// `<root_dir>/certs/sshtunnel.key` when unset
    pub ssh_key: Option<PathBuf>,
    pub hop_timeout_secs: u64,
    pub wrapper_settle_ms: u64,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            openvpn: PathBuf::from("openvpn"),
            stunnel: PathBuf::from("stunnel"),
            ssh: PathBuf::from("ssh"),
            template_dir: None,
            work_dir: None,
            script_dir: None,
            ssh_key: None,
            hop_timeout_secs: 60,
            wrapper_settle_ms: 2000,
        }
    }
}

/// Server (and optional first hop) to connect to at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoConnect {
    pub server: TunnelEndpoint,
    #[serde(default)]
    pub hop: Option<TunnelEndpoint>,
}

impl DaemonConfig {
    /// Parse TOML
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a file; a missing file gives the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("{} not found, using default configuration", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Config location: first argument, then `VIGILD_CONFIG`, then the default
    pub fn locate(arg: Option<String>, env: Option<String>) -> PathBuf {
        arg.or(env)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn template_dir(&self) -> PathBuf {
        self.tunnel
            .template_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.clone())
    }

    pub fn work_dir(&self) -> PathBuf {
        self.tunnel
            .work_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.clone())
    }

    /// Settings for the connection orchestrator
    pub fn orchestrator(&self) -> OrchestratorConfig {
        let tunnel = &self.tunnel;
        OrchestratorConfig {
            commands: CommandConfig {
                openvpn: tunnel.openvpn.clone(),
                stunnel: tunnel.stunnel.clone(),
                ssh: tunnel.ssh.clone(),
                script_dir: tunnel
                    .script_dir
                    .clone()
                    .unwrap_or_else(|| self.root_dir.clone()),
                ssh_key: tunnel
                    .ssh_key
                    .clone()
                    .unwrap_or_else(|| self.root_dir.join("certs").join("sshtunnel.key")),
            },
            fallback_dns: (self.dns.fallback[0], self.dns.fallback[1]),
            force_fallback_dns: self.dns.force_fallback,
            hop_timeout: Duration::from_secs(tunnel.hop_timeout_secs),
            wrapper_settle: Duration::from_millis(tunnel.wrapper_settle_ms),
        }
    }
}
