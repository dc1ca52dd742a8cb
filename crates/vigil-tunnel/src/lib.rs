//! Vigil Tunnel - OpenVPN Connection Orchestration
//!
//! Brings up one or two chained OpenVPN tunnels (optionally carried by
//! stunnel or ssh), keeps DNS pointed at the tunnel and opens the
//! firewall only as far as the tunnel needs.
//!
//! # Architecture
//!
//! ```text
//! connect(chain)
//!      │
//!      ▼
//! ┌──────────────────────┐  build   ┌─────────────────────┐
//! │ ConnectionOrchestrator│────────▶│ TunnelConfigBuilder │
//! │                      │          └─────────────────────┘
//! │  driver task         │  spawn   ┌─────────────────────┐   lines   ┌────────────┐
//! │  consumer task(s) ◀──│──────────│ ProcessSupervisor   │──────────▶│ classifier │
//! │                      │          └─────────────────────┘           └────────────┘
//! │                      │ exceptions ┌────────────────┐  resolver ┌─────────────────┐
//! │                      │───────────▶│ FirewallEngine │           │ DnsConfigurator │
//! └──────────────────────┘            └────────────────┘           └─────────────────┘
//! ```
//!
//! # Multi-hop
//!
//! The terminal hop is never spawned before the intermediate hop has
//! completed its handshake; the wait is bounded by a configurable timeout.

mod builder;
mod classifier;
mod command;
mod dns;
mod endpoint;
mod orchestrator;
mod process;

pub use builder::{
    BuildError, BuiltConfig, SUPPORTED_PROVIDERS, TunnelConfigBuilder, WrapperConfig,
    render_ssl_config, render_tunnel_config,
};
pub use classifier::{HARD_TERMINATION, LineEvent, classify};
pub use command::{CommandConfig, tunnel_command, wrapper_command};
pub use dns::{DnsConfigurator, DnsError, DnsSnapshot, ResolvConf};
pub use endpoint::{HopChain, HopRole, Protocol, SSH_WRAPPER_PORT, SSL_WRAPPER_PORT, TunnelEndpoint};
pub use orchestrator::{
    ConnectionOrchestrator, ConnectionState, DEFAULT_INTERFACE, Notification, OrchestratorConfig,
    OrchestratorError,
};
pub use process::{
    ChildProcess, CommandSpec, Launcher, OutputLines, ProcessHandle, ProcessRole,
    ProcessSupervisor, SpawnError, Spawned, TERMINATE_GRACE, TokioLauncher,
};
