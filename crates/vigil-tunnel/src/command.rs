//! Tunnel and wrapper command lines

use crate::builder::{BuiltConfig, WrapperConfig};
use crate::endpoint::{HopChain, HopRole, SSH_WRAPPER_PORT};
use crate::process::{CommandSpec, ProcessRole};
use std::path::PathBuf;

/// Port the provider's ssh gateway forwards to on its side
const SSH_REMOTE_PORT: u16 = 2018;

/// User the provider's ssh gateway accepts
const SSH_USER: &str = "sshtunnel";

/// Binaries and helper files used to build command lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandConfig {
    pub openvpn: PathBuf,
    pub stunnel: PathBuf,
    pub ssh: PathBuf,
    /// Directory holding `hop.sh` and `hop_down.sh`
    pub script_dir: PathBuf,
    pub ssh_key: PathBuf,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            openvpn: PathBuf::from("openvpn"),
            stunnel: PathBuf::from("stunnel"),
            ssh: PathBuf::from("ssh"),
            script_dir: PathBuf::from("/usr/share/vigil"),
            ssh_key: PathBuf::from("/usr/share/vigil/certs/sshtunnel.key"),
        }
    }
}

/// OpenVPN command for one hop of `chain`
///
/// Chained hops skip pushed routes and hand routing to the hop scripts:
/// the intermediate hop routes the terminal server through itself, the
/// terminal hop takes the default route.
pub fn tunnel_command(
    config: &CommandConfig,
    built: &BuiltConfig,
    role: HopRole,
    chain: &HopChain,
) -> CommandSpec {
    let mut args = vec![
        "--config".to_string(),
        built.config_path.display().to_string(),
    ];

    match role {
        HopRole::Single => {}
        HopRole::Intermediate => {
            let hop = chain
                .intermediate()
                .map(|e| e.address)
                .unwrap_or(chain.terminal().address);
            let server = chain.terminal().address;
            let up = config.script_dir.join("hop.sh");
            let down = config.script_dir.join("hop_down.sh");
            args.extend([
                "--route-nopull".to_string(),
                "--script-security".to_string(),
                "2".to_string(),
                "--up".to_string(),
                format!("{} -f {hop} {server}", up.display()),
                "--down".to_string(),
                format!("{} {hop}", down.display()),
            ]);
        }
        HopRole::Terminal => {
            let up = config.script_dir.join("hop.sh");
            args.extend([
                "--route-nopull".to_string(),
                "--script-security".to_string(),
                "2".to_string(),
                "--up".to_string(),
                format!("{} -s", up.display()),
            ]);
        }
    }

    CommandSpec {
        program: config.openvpn.clone(),
        args,
        working_dir: built.working_dir.clone(),
        role: ProcessRole::Tunnel(role),
    }
}

/// Command for the wrapper process of an SSL or SSH endpoint
pub fn wrapper_command(config: &CommandConfig, wrapper: &WrapperConfig) -> CommandSpec {
    match wrapper {
        WrapperConfig::Ssl { config_path } => CommandSpec {
            program: config.stunnel.clone(),
            args: vec![config_path.display().to_string()],
            working_dir: None,
            role: ProcessRole::SslWrapper,
        },
        WrapperConfig::Ssh { host, port } => CommandSpec {
            program: config.ssh.clone(),
            args: vec![
                "-i".to_string(),
                config.ssh_key.display().to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=accept-new".to_string(),
                "-L".to_string(),
                format!("{SSH_WRAPPER_PORT}:127.0.0.1:{SSH_REMOTE_PORT}"),
                format!("{SSH_USER}@{host}"),
                "-p".to_string(),
                port.to_string(),
                "-N".to_string(),
                "-T".to_string(),
                "-v".to_string(),
            ],
            working_dir: None,
            role: ProcessRole::SshWrapper,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Protocol, TunnelEndpoint};

    fn built(path: &str) -> BuiltConfig {
        BuiltConfig {
            config_path: PathBuf::from(path),
            working_dir: None,
            wrapper: None,
        }
    }

    fn chain() -> HopChain {
        HopChain::via(
            TunnelEndpoint::new("hop", "Mullvad", "192.0.2.1".parse().unwrap(), 1194, Protocol::Udp),
            TunnelEndpoint::new("exit", "PIA", "192.0.2.2".parse().unwrap(), 1194, Protocol::Udp),
        )
    }

    #[test]
    fn test_single_command() {
        let cmd = tunnel_command(
            &CommandConfig::default(),
            &built("/run/vigil/temp.ovpn"),
            HopRole::Single,
            &chain(),
        );
        assert_eq!(cmd.program, PathBuf::from("openvpn"));
        assert_eq!(cmd.args, ["--config", "/run/vigil/temp.ovpn"]);
    }

    #[test]
    fn test_intermediate_hop_scripts() {
        let cmd = tunnel_command(
            &CommandConfig::default(),
            &built("/run/vigil/hop.ovpn"),
            HopRole::Intermediate,
            &chain(),
        );
        assert_eq!(
            cmd.args,
            [
                "--config",
                "/run/vigil/hop.ovpn",
                "--route-nopull",
                "--script-security",
                "2",
                "--up",
                "/usr/share/vigil/hop.sh -f 192.0.2.1 192.0.2.2",
                "--down",
                "/usr/share/vigil/hop_down.sh 192.0.2.1",
            ]
        );
        assert_eq!(cmd.role, ProcessRole::Tunnel(HopRole::Intermediate));
    }

    #[test]
    fn test_terminal_hop_script() {
        let cmd = tunnel_command(
            &CommandConfig::default(),
            &built("/run/vigil/temp.ovpn"),
            HopRole::Terminal,
            &chain(),
        );
        assert_eq!(cmd.args.last().unwrap(), "/usr/share/vigil/hop.sh -s");
    }

    #[test]
    fn test_ssh_wrapper() {
        let cmd = wrapper_command(
            &CommandConfig::default(),
            &WrapperConfig::Ssh {
                host: "192.0.2.9".parse().unwrap(),
                port: 22,
            },
        );
        assert_eq!(cmd.role, ProcessRole::SshWrapper);
        assert!(cmd.args.contains(&"1412:127.0.0.1:2018".to_string()));
        assert!(cmd.args.contains(&"sshtunnel@192.0.2.9".to_string()));
        let port = cmd.args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(cmd.args[port + 1], "22");
    }

    #[test]
    fn test_ssl_wrapper() {
        let cmd = wrapper_command(
            &CommandConfig::default(),
            &WrapperConfig::Ssl {
                config_path: PathBuf::from("/run/vigil/temp.ssl"),
            },
        );
        assert_eq!(cmd.program, PathBuf::from("stunnel"));
        assert_eq!(cmd.args, ["/run/vigil/temp.ssl"]);
    }
}
