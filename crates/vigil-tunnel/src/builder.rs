//! Tunnel Config Builder
//!
//! Renders a per-attempt OpenVPN config (and stunnel config for SSL
//! endpoints) from a provider template or a user profile.
//!
//! # Rewrites
//!
//! - `proto ...` becomes the endpoint's transport
//! - `remote ...` becomes the endpoint's address and port
//! - Wrapped endpoints (SSL/SSH) get a host route for the real server
//!   through the physical gateway, and `remote` points at the wrapper's
//!   loopback port instead
//!
//! Templates are only read. Rendered files go to the work directory and
//! are overwritten on every attempt.

use crate::endpoint::{Protocol, TunnelEndpoint};
use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Providers that ship a template under the template directory
pub const SUPPORTED_PROVIDERS: &[&str] = &["Airvpn", "Mullvad", "PIA"];

/// Template for the stunnel config of SSL endpoints
const SSL_TEMPLATE: &str = "ssl_config";

/// Config build errors
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("No template for provider {provider} and no profile given")]
    NoTemplate { provider: String },

    #[error("Failed to read template {}: {source}", path.display())]
    Template {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Refusing to overwrite template {}", .0.display())]
    WouldOverwrite(PathBuf),
}

/// Wrapper process needed by an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrapperConfig {
    /// stunnel with a rendered config
    Ssl { config_path: PathBuf },
    /// ssh port forward to the real server
    Ssh { host: IpAddr, port: u16 },
}

/// Result of a successful build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltConfig {
    /// Rendered tunnel config
    pub config_path: PathBuf,
    /// Directory the tunnel binary runs in (profile directory for user profiles)
    pub working_dir: Option<PathBuf>,
    pub wrapper: Option<WrapperConfig>,
}

/// Renders tunnel configs into a work directory
#[derive(Debug, Clone)]
pub struct TunnelConfigBuilder {
    template_dir: PathBuf,
    work_dir: PathBuf,
}

impl TunnelConfigBuilder {
    pub fn new(template_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            template_dir: template_dir.into(),
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Template an endpoint is rendered from
    pub fn template_for(&self, endpoint: &TunnelEndpoint) -> Result<PathBuf, BuildError> {
        if is_supported(&endpoint.provider) {
            return Ok(self
                .template_dir
                .join(format!("{}_config", endpoint.provider)));
        }
        endpoint.profile.clone().ok_or_else(|| BuildError::NoTemplate {
            provider: endpoint.provider.clone(),
        })
    }

    /// Render the config for `endpoint` as `<work_dir>/<artifact>.ovpn`
    pub fn build(&self, endpoint: &TunnelEndpoint, artifact: &str) -> Result<BuiltConfig, BuildError> {
        let template = self.template_for(endpoint)?;
        let content = read_template(&template)?;

        let config_path = self.work_dir.join(format!("{artifact}.ovpn"));
        if config_path == template {
            return Err(BuildError::WouldOverwrite(template));
        }
        self.write(&config_path, &render_tunnel_config(&content, endpoint))?;

        let wrapper = match endpoint.protocol {
            Protocol::Ssl => {
                let ssl_template = self.template_dir.join(SSL_TEMPLATE);
                let ssl_content = read_template(&ssl_template)?;
                let ssl_path = self.work_dir.join(format!("{artifact}.ssl"));
                self.write(&ssl_path, &render_ssl_config(&ssl_content, endpoint))?;
                Some(WrapperConfig::Ssl {
                    config_path: ssl_path,
                })
            }
            Protocol::Ssh => Some(WrapperConfig::Ssh {
                host: endpoint.address,
                port: endpoint.port,
            }),
            Protocol::Udp | Protocol::Tcp => None,
        };

        let working_dir = if is_supported(&endpoint.provider) {
            None
        } else {
            template.parent().map(Path::to_path_buf)
        };

        debug!("Config for {endpoint} written to {}", config_path.display());
        Ok(BuiltConfig {
            config_path,
            working_dir,
            wrapper,
        })
    }

    fn write(&self, path: &Path, content: &str) -> Result<(), BuildError> {
        fs::create_dir_all(&self.work_dir).map_err(|source| BuildError::Write {
            path: self.work_dir.clone(),
            source,
        })?;
        fs::write(path, content).map_err(|source| BuildError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn is_supported(provider: &str) -> bool {
    SUPPORTED_PROVIDERS.contains(&provider)
}

fn read_template(path: &Path) -> Result<String, BuildError> {
    fs::read_to_string(path).map_err(|source| BuildError::Template {
        path: path.to_path_buf(),
        source,
    })
}

/// Route to the real server that bypasses the tunnel
fn host_route(address: IpAddr) -> String {
    match address {
        IpAddr::V4(v4) => format!("route {v4} 255.255.255.255 net_gateway"),
        IpAddr::V6(v6) => format!("route-ipv6 {v6}/128 net_gateway"),
    }
}

/// Rewrite an OpenVPN config for an endpoint
pub fn render_tunnel_config(template: &str, endpoint: &TunnelEndpoint) -> String {
    let (remote, port) = match endpoint.protocol.wrapper_port() {
        Some(port) => ("127.0.0.1".to_string(), port),
        None => (endpoint.address.to_string(), endpoint.port),
    };
    let mut routed = !endpoint.protocol.is_wrapped();
    let mut lines: Vec<String> = Vec::new();

    for line in template.lines() {
        if line.starts_with("proto ") {
            lines.push(format!("proto {}", endpoint.protocol.transport()));
        } else if line.starts_with("remote ") {
            if !routed {
                lines.push(host_route(endpoint.address));
                routed = true;
            }
            lines.push(format!("remote {remote} {port}"));
        } else {
            lines.push(line.to_string());
        }
    }
    if !routed {
        lines.push(host_route(endpoint.address));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Point a stunnel config at the endpoint
pub fn render_ssl_config(template: &str, endpoint: &TunnelEndpoint) -> String {
    let target = SocketAddr::new(endpoint.address, endpoint.port);
    let mut out = String::with_capacity(template.len());
    for line in template.lines() {
        if line.starts_with("connect") {
            out.push_str(&format!("connect = {target}"));
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "client\ndev tun\nproto udp\nremote 0.0.0.0 1194\nnobind\n";

    fn endpoint(provider: &str, protocol: Protocol, port: u16) -> TunnelEndpoint {
        TunnelEndpoint::new("exit", provider, "198.51.100.7".parse().unwrap(), port, protocol)
    }

    #[test]
    fn test_render_plain() {
        let out = render_tunnel_config(TEMPLATE, &endpoint("Mullvad", Protocol::Tcp, 443));
        assert!(out.contains("proto tcp\n"));
        assert!(out.contains("remote 198.51.100.7 443\n"));
        assert!(!out.contains("net_gateway"));
        assert!(out.starts_with("client\ndev tun\n"));
    }

    #[test]
    fn test_render_ssl_redirects_to_loopback() {
        let out = render_tunnel_config(TEMPLATE, &endpoint("Airvpn", Protocol::Ssl, 443));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines,
            [
                "client",
                "dev tun",
                "proto tcp",
                "route 198.51.100.7 255.255.255.255 net_gateway",
                "remote 127.0.0.1 1413",
                "nobind",
            ]
        );
    }

    #[test]
    fn test_render_ssh_uses_ssh_port() {
        let out = render_tunnel_config(TEMPLATE, &endpoint("Airvpn", Protocol::Ssh, 22));
        assert!(out.contains("remote 127.0.0.1 1412\n"));
        assert!(out.contains("proto tcp\n"));
    }

    #[test]
    fn test_route_appended_without_remote_line() {
        let out = render_tunnel_config("client\n", &endpoint("Airvpn", Protocol::Ssh, 22));
        assert!(out.ends_with("route 198.51.100.7 255.255.255.255 net_gateway\n"));
    }

    #[test]
    fn test_render_ssl_config() {
        let out = render_ssl_config(
            "client = yes\n[openvpn]\naccept = 1413\nconnect = 1.1.1.1:443\n",
            &endpoint("Airvpn", Protocol::Ssl, 443),
        );
        assert!(out.contains("connect = 198.51.100.7:443\n"));
        assert!(out.contains("accept = 1413\n"));
    }

    #[test]
    fn test_build_supported_provider() {
        let templates = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        fs::write(templates.path().join("Airvpn_config"), TEMPLATE).unwrap();
        fs::write(templates.path().join("ssl_config"), "connect = x\n").unwrap();

        let builder = TunnelConfigBuilder::new(templates.path(), work.path());
        let built = builder
            .build(&endpoint("Airvpn", Protocol::Ssl, 443), "temp")
            .unwrap();

        assert_eq!(built.config_path, work.path().join("temp.ovpn"));
        assert!(built.working_dir.is_none());
        let ssl_path = work.path().join("temp.ssl");
        assert_eq!(
            built.wrapper,
            Some(WrapperConfig::Ssl {
                config_path: ssl_path.clone()
            })
        );
        assert_eq!(
            fs::read_to_string(ssl_path).unwrap(),
            "connect = 198.51.100.7:443\n"
        );

        // Template untouched
        assert_eq!(
            fs::read_to_string(templates.path().join("Airvpn_config")).unwrap(),
            TEMPLATE
        );
    }

    #[test]
    fn test_build_user_profile() {
        let templates = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let profile_dir = tempfile::tempdir().unwrap();
        let profile = profile_dir.path().join("office.ovpn");
        fs::write(&profile, TEMPLATE).unwrap();

        let builder = TunnelConfigBuilder::new(templates.path(), work.path());
        let built = builder
            .build(&endpoint("Office", Protocol::Udp, 1194).with_profile(&profile), "hop")
            .unwrap();

        assert_eq!(built.working_dir.as_deref(), Some(profile_dir.path()));
        assert!(built.wrapper.is_none());
        let rendered = fs::read_to_string(work.path().join("hop.ovpn")).unwrap();
        assert!(rendered.contains("remote 198.51.100.7 1194"));
    }

    #[test]
    fn test_build_missing_template() {
        let templates = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let builder = TunnelConfigBuilder::new(templates.path(), work.path());

        let result = builder.build(&endpoint("PIA", Protocol::Udp, 1194), "temp");
        assert!(matches!(result, Err(BuildError::Template { .. })));
        assert!(!work.path().join("temp.ovpn").exists());

        let result = builder.build(&endpoint("Unknown", Protocol::Udp, 1194), "temp");
        assert!(matches!(result, Err(BuildError::NoTemplate { .. })));
    }

    #[test]
    fn test_build_refuses_to_overwrite_profile() {
        let work = tempfile::tempdir().unwrap();
        let profile = work.path().join("temp.ovpn");
        fs::write(&profile, TEMPLATE).unwrap();

        let builder = TunnelConfigBuilder::new(work.path(), work.path());
        let result = builder.build(&endpoint("Office", Protocol::Udp, 1194).with_profile(&profile), "temp");
        assert!(matches!(result, Err(BuildError::WouldOverwrite(_))));
    }
}
