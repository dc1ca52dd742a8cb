//! Daemon Service
//!
//! The operations a front end drives: firewall mode, ping policy,
//! connect/disconnect, first-hop selection, provider bootstrap and the
//! IPv6 toggle. Notifications come from [`Service::subscribe`].

use crate::bootstrap::{BootstrapResolver, provider_host};
use crate::config::DaemonConfig;
use anyhow::{Context, Result, anyhow};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tracing::{error, info, warn};
use vigil_firewall::{
    Exception, FilterBackend, FirewallEngine, IptablesBackend, MemoryBackend, Mode, RuleStore,
};
use vigil_tunnel::{
    ConnectionOrchestrator, ConnectionState, DnsConfigurator, HopChain, Launcher, Notification,
    ResolvConf, TokioLauncher, TunnelConfigBuilder, TunnelEndpoint,
};

/// Privileged daemon facade
pub struct Service {
    config: DaemonConfig,
    firewall: Arc<FirewallEngine>,
    orchestrator: ConnectionOrchestrator,
    dns: Arc<dyn DnsConfigurator>,
    /// First hop used by `connect` when none is given
    hop: RwLock<Option<TunnelEndpoint>>,
}

impl Service {
    /// Production wiring (iptables, real processes, resolv.conf)
    ///
    /// With `dry_run` the firewall is emulated in memory.
    pub fn from_config(config: DaemonConfig) -> Self {
        let backend: Arc<dyn FilterBackend> = if config.dry_run {
            info!("Dry run: firewall changes stay in memory");
            Arc::new(MemoryBackend::new())
        } else {
            Arc::new(IptablesBackend::new())
        };
        let dns = Arc::new(ResolvConf::new(
            config.dns.resolv_conf.clone(),
            config.dns.backup.clone(),
        ));
        Self::new(config, backend, Arc::new(TokioLauncher), dns)
    }

    pub fn new(
        config: DaemonConfig,
        backend: Arc<dyn FilterBackend>,
        launcher: Arc<dyn Launcher>,
        dns: Arc<dyn DnsConfigurator>,
    ) -> Self {
        let firewall = Arc::new(FirewallEngine::new(
            RuleStore::in_dir(&config.root_dir),
            backend,
        ));
        let orchestrator = ConnectionOrchestrator::new(
            config.orchestrator(),
            firewall.clone(),
            TunnelConfigBuilder::new(config.template_dir(), config.work_dir()),
            launcher,
            dns.clone(),
        );

        Self {
            config,
            firewall,
            orchestrator,
            dns,
            hop: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Startup sequence: firewall mode, IPv6 toggle, ping policy
    pub async fn load_firewall(&self) -> Result<()> {
        let section = self.config.firewall.clone();
        self.apply_firewall(section.mode).await?;
        if let Err(e) = self.disable_ipv6(section.disable_ipv6).await {
            warn!("{e:#}");
        }
        self.allow_ping(section.allow_ping).await
    }

    /// Flush and re-apply the rule sets for `mode`
    pub async fn apply_firewall(&self, mode: Mode) -> Result<()> {
        let firewall = self.firewall.clone();
        tokio::task::spawn_blocking(move || firewall.apply_rule_set(mode))
            .await
            .context("firewall task panicked")?
            .context("applying firewall rules")
    }

    pub async fn allow_ping(&self, enabled: bool) -> Result<()> {
        let firewall = self.firewall.clone();
        tokio::task::spawn_blocking(move || firewall.allow_ping(enabled))
            .await
            .context("firewall task panicked")?
            .context("applying ping rules")
    }

    /// Connect to `server`, through `hop` or the hop chosen with [`set_hop`](Self::set_hop)
    pub async fn connect(&self, server: TunnelEndpoint, hop: Option<TunnelEndpoint>) -> Result<()> {
        let hop = match hop {
            Some(hop) => Some(hop),
            None => self.hop.read().await.clone(),
        };
        let chain = match hop {
            Some(hop) => HopChain::via(hop, server),
            None => HopChain::single(server),
        };
        self.orchestrator
            .connect(chain)
            .await
            .context("starting connection")
    }

    /// Choose (or clear) the first hop for later connections
    pub async fn set_hop(&self, hop: Option<TunnelEndpoint>) {
        match &hop {
            Some(endpoint) => info!("First hop set to {endpoint}"),
            None => info!("First hop cleared"),
        }
        *self.hop.write().await = hop;
    }

    pub async fn disconnect(&self) {
        self.orchestrator.disconnect().await;
    }

    pub async fn state(&self) -> ConnectionState {
        self.orchestrator.state().await
    }

    /// Name of the tunnel interface
    pub async fn tun_device(&self) -> String {
        self.orchestrator.interface().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.orchestrator.subscribe()
    }

    fn fallback_dns(&self) -> (IpAddr, IpAddr) {
        (self.config.dns.fallback[0], self.config.dns.fallback[1])
    }

    async fn with_firewall<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&FirewallEngine) + Send + 'static,
    {
        let firewall = self.firewall.clone();
        tokio::task::spawn_blocking(move || f(&firewall))
            .await
            .context("firewall task panicked")
    }

    /// Let the daemon reach a provider's website while the kill switch is on
    ///
    /// Opens DNS (and ping) to the fallback resolvers, points the system at
    /// them, and allows the provider site's address. The site exception is
    /// left for the next firewall flush to clear.
    pub async fn allow_provider_ip(&self, provider: &str) -> Result<()> {
        let (primary, secondary) = self.fallback_dns();
        info!("iptables: temporarily allowing DNS requests");
        self.with_firewall(move |firewall| {
            firewall.allow_temporary(&Exception::DnsServers(primary, secondary));
            firewall.allow_temporary(&Exception::ResolverPing(primary));
        })
        .await?;
        self.dns
            .apply(primary, Some(secondary))
            .context("pointing DNS at fallback resolvers")?;

        let Some(host) = provider_host(provider) else {
            return Ok(());
        };
        info!("iptables: temporarily creating rule to allow access to {host}");
        let resolver = BootstrapResolver::new(&[primary, secondary]);
        match resolver.resolve_last(host).await {
            Ok(address) => {
                self.with_firewall(move |firewall| {
                    firewall.allow_temporary(&Exception::Host(address));
                })
                .await
            }
            Err(e) => {
                error!("{e}");
                Err(anyhow!(e))
            }
        }
    }

    /// Close the DNS exception opened by [`allow_provider_ip`](Self::allow_provider_ip)
    pub async fn block_dns(&self) -> Result<()> {
        let (primary, secondary) = self.fallback_dns();
        info!("iptables: deleting exception for DNS requests");
        self.with_firewall(move |firewall| {
            firewall.block_temporary(&Exception::DnsServers(primary, secondary));
            firewall.block_temporary(&Exception::ResolverPing(primary));
        })
        .await
    }

    /// Turn IPv6 off (or back on) system-wide
    pub async fn disable_ipv6(&self, disable: bool) -> Result<()> {
        let setting = format!("net.ipv6.conf.all.disable_ipv6={}", u8::from(disable));
        if self.config.dry_run {
            info!("Dry run: skipping sysctl -w {setting}");
            return Ok(());
        }

        let status = tokio::process::Command::new("sysctl")
            .arg("-w")
            .arg(&setting)
            .status()
            .await
            .context("running sysctl")?;
        if !status.success() {
            return Err(anyhow!("sysctl -w {setting} failed with {status}"));
        }

        if disable {
            info!("Disabled ipv6");
        } else {
            info!("(Re-)enabled ipv6");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use vigil_firewall::{Family, Rule};
    use vigil_tunnel::{
        ChildProcess, CommandSpec, HopRole, OutputLines, ProcessRole, Protocol, SpawnError,
        Spawned,
    };

    const RULES: &str = r#"{
        "flush": [["-F"], ["-P", "OUTPUT", "ACCEPT"]],
        "flushv6": [["-F"]],
        "defaults": [["-P", "OUTPUT", "DROP"], ["-A", "OUTPUT", "-o", "lo", "-j", "ACCEPT"]],
        "defaultsv6": [],
        "ipv4rules": [["-A", "OUTPUT", "-o", "tun+", "-j", "ACCEPT"]],
        "ipv6rules": [],
        "unsecure": [["-P", "OUTPUT", "ACCEPT"]],
        "unsecurev6": [],
        "allowping": [["-A", "OUTPUT", "-p", "icmp", "-j", "ACCEPT"]]
    }"#;

    struct IdleChild {
        pid: u32,
        exited: bool,
    }

    impl ChildProcess for IdleChild {
        fn id(&self) -> u32 {
            self.pid
        }

        fn terminate(&mut self) -> std::io::Result<()> {
            self.exited = true;
            Ok(())
        }

        fn has_exited(&mut self) -> bool {
            self.exited
        }
    }

    /// Records launches; processes print nothing and exit when terminated
    #[derive(Default)]
    struct RecordingLauncher {
        launched: Mutex<Vec<CommandSpec>>,
    }

    impl Launcher for RecordingLauncher {
        fn launch(&self, spec: &CommandSpec) -> Result<Spawned, SpawnError> {
            let mut launched = self.launched.lock().unwrap();
            launched.push(spec.clone());
            // Dropping the sender ends the stream right away
            let (_tx, output) = OutputLines::channel(1);
            Ok(Spawned {
                child: Box::new(IdleChild {
                    pid: launched.len() as u32,
                    exited: false,
                }),
                output,
            })
        }
    }

    struct Fixture {
        _root: TempDir,
        service: Service,
        backend: Arc<MemoryBackend>,
        launcher: Arc<RecordingLauncher>,
        resolv: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("firewall.json"), RULES).unwrap();
        fs::write(
            root.path().join("Mullvad_config"),
            "client\nproto udp\nremote 0.0.0.0 1194\n",
        )
        .unwrap();
        let resolv = root.path().join("resolv.conf");
        fs::write(&resolv, "nameserver 192.168.1.1\n").unwrap();

        let config = DaemonConfig {
            root_dir: root.path().to_path_buf(),
            dry_run: true,
            ..DaemonConfig::default()
        };
        let backend = Arc::new(MemoryBackend::new());
        let launcher = Arc::new(RecordingLauncher::default());
        let dns = Arc::new(ResolvConf::new(&resolv, root.path().join("resolv.conf.bak")));
        let service = Service::new(config, backend.clone(), launcher.clone(), dns);

        Fixture {
            _root: root,
            service,
            backend,
            launcher,
            resolv,
        }
    }

    fn endpoint(name: &str, last_octet: u8) -> TunnelEndpoint {
        TunnelEndpoint::new(
            name,
            "Mullvad",
            IpAddr::from([198, 51, 100, last_octet]),
            1194,
            Protocol::Udp,
        )
    }

    fn rule(tokens: &[&str]) -> Rule {
        Rule::new(tokens.iter().copied())
    }

    async fn wait_terminated(events: &mut broadcast::Receiver<Notification>) {
        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if event == Notification::Terminated {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_load_firewall() {
        let f = fixture();
        f.service.load_firewall().await.unwrap();

        let active = f.backend.active_rules(Family::V4);
        assert!(active.contains(&rule(&["-A", "OUTPUT", "-o", "tun+", "-j", "ACCEPT"])));
        assert!(!active.contains(&rule(&["-A", "OUTPUT", "-p", "icmp", "-j", "ACCEPT"])));
        assert_eq!(f.backend.policy(Family::V4, "OUTPUT").as_deref(), Some("DROP"));

        f.service.allow_ping(true).await.unwrap();
        assert!(f
            .backend
            .active_rules(Family::V4)
            .contains(&rule(&["-A", "OUTPUT", "-p", "icmp", "-j", "ACCEPT"])));

        f.service.apply_firewall(Mode::Permissive).await.unwrap();
        assert_eq!(f.backend.policy(Family::V4, "OUTPUT").as_deref(), Some("ACCEPT"));
    }

    #[tokio::test]
    async fn test_missing_rules_is_an_error() {
        let f = fixture();
        fs::remove_file(f.service.config().root_dir.join("firewall.json")).unwrap();
        assert!(f.service.apply_firewall(Mode::Secure).await.is_err());
    }

    #[tokio::test]
    async fn test_set_hop_is_used_by_connect() {
        let f = fixture();
        let mut events = f.service.subscribe();

        f.service.set_hop(Some(endpoint("hop", 1))).await;
        f.service.connect(endpoint("exit", 2), None).await.unwrap();
        wait_terminated(&mut events).await;

        let roles: Vec<ProcessRole> = f
            .launcher
            .launched
            .lock()
            .unwrap()
            .iter()
            .map(|spec| spec.role)
            .collect();
        // The silent first hop exits before connecting, so the second never starts
        assert_eq!(roles, [ProcessRole::Tunnel(HopRole::Intermediate)]);
        assert_eq!(f.service.state().await, ConnectionState::Disconnected);
        assert_eq!(f.service.tun_device().await, "tun0");
    }

    #[tokio::test]
    async fn test_provider_bootstrap_for_unknown_provider() {
        let f = fixture();
        f.service.allow_provider_ip("Office").await.unwrap();

        let (primary, _) = f.service.fallback_dns();
        let dns_rule = rule(&[
            "-A", "OUTPUT", "-p", "udp", "-d", &primary.to_string(), "--dport", "53", "-j",
            "ACCEPT",
        ]);
        assert!(f.backend.active_rules(Family::V4).contains(&dns_rule));
        let resolv = fs::read_to_string(&f.resolv).unwrap();
        assert!(resolv.contains(&format!("nameserver {primary}")));

        f.service.block_dns().await.unwrap();
        assert!(f.backend.active_rules(Family::V4).is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_skips_sysctl() {
        let f = fixture();
        f.service.disable_ipv6(true).await.unwrap();
        f.service.disable_ipv6(false).await.unwrap();
    }
}
