//! Provider Bootstrap
//!
//! Before any tunnel exists the kill switch drops everything, so fetching
//! server lists from a provider's website needs a narrow exception. The
//! site is resolved through the fallback resolvers and the last answer is
//! allowed.

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// Per-query timeout for bootstrap lookups
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Bootstrap errors
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Could not resolve {host}: {reason}")]
    Lookup { host: String, reason: String },

    #[error("No addresses for {0}")]
    NoAddresses(String),
}

/// Website a provider's server lists come from
pub fn provider_host(provider: &str) -> Option<&'static str> {
    match provider {
        "Airvpn" => Some("www.airvpn.org"),
        "Mullvad" => Some("www.mullvad.net"),
        "PIA" => Some("www.privateinternetaccess.com"),
        _ => None,
    }
}

/// Resolves provider hosts through fixed name servers
pub struct BootstrapResolver {
    resolver: TokioAsyncResolver,
}

impl BootstrapResolver {
    /// Plain DNS over UDP/TCP port 53 to `servers`, one attempt each
    pub fn new(servers: &[IpAddr]) -> Self {
        let config = ResolverConfig::from_parts(
            None,
            vec![],
            NameServerConfigGroup::from_ips_clear(servers, 53, true),
        );
        let mut opts = ResolverOpts::default();
        opts.timeout = LOOKUP_TIMEOUT;
        opts.attempts = 1;
        opts.cache_size = 0;

        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }

    /// Last address returned for `host`
    pub async fn resolve_last(&self, host: &str) -> Result<IpAddr, BootstrapError> {
        debug!("Resolving {host}");
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| BootstrapError::Lookup {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        lookup
            .iter()
            .last()
            .ok_or_else(|| BootstrapError::NoAddresses(host.to_string()))
    }
}
