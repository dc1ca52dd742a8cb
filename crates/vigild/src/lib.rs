//! vigild - Privileged VPN Daemon
//!
//! Ties the kill-switch firewall and the tunnel orchestrator together
//! behind one [`Service`], configured from a TOML file.
//!
//! # Startup
//!
//! 1. Load [`DaemonConfig`]
//! 2. Apply the configured firewall mode, IPv6 toggle and ping policy
//! 3. Connect if `autoconnect` is set
//!
//! Front ends then drive the [`Service`] operations and follow progress
//! through [`Service::subscribe`].

pub mod bootstrap;
pub mod config;
pub mod service;

pub use bootstrap::{BootstrapError, BootstrapResolver, provider_host};
pub use config::{AutoConnect, CONFIG_ENV, ConfigError, DEFAULT_CONFIG_PATH, DaemonConfig};
pub use service::Service;
