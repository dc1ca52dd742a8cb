//! Connection Orchestrator
//!
//! Drives one connection attempt at a time from the tunnel's output.
//!
//! # States
//!
//! ```text
//! IDLE ──connect──▶ CONNECTING ──handshake──▶ CONNECTED
//!                       │                         │
//!                       └──── failure ──▶ FAILING ◀┘
//!                                           │ teardown
//!          disconnect (any active state) ──▶ DISCONNECTED
//! ```
//!
//! # Tasks
//!
//! - A driver task per attempt: DNS snapshot, firewall exceptions,
//!   wrapper and tunnel spawns. It waits for an intermediate hop to
//!   connect before spawning the terminal hop.
//! - One output-consumer task per tunnel process (at most two). Lines
//!   are handled strictly in stream order.
//!
//! Cancellation is process termination: the consumers see their streams
//! end and exit. Every attempt carries a number; work belonging to a
//! superseded attempt is dropped under the session lock, so nothing is
//! spawned or configured after teardown has started.

use crate::builder::{BuildError, BuiltConfig, TunnelConfigBuilder, WrapperConfig};
use crate::classifier::{LineEvent, classify};
use crate::command::{CommandConfig, tunnel_command, wrapper_command};
use crate::dns::{DnsConfigurator, DnsSnapshot};
use crate::endpoint::{HopChain, HopRole, TunnelEndpoint};
use crate::process::{
    CommandSpec, Launcher, OutputLines, ProcessHandle, ProcessRole, ProcessSupervisor, SpawnError,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vigil_firewall::{Exception, FirewallEngine, RuleOutcome};

/// Interface name reported before a tunnel has announced one
pub const DEFAULT_INTERFACE: &str = "tun0";

/// How long disconnect waits for attempt tasks to wind down
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    /// Tearing down after a failure
    Failing,
    Disconnected,
}

impl ConnectionState {
    /// Does an attempt (or its teardown) still own the session?
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Failing
        )
    }
}

/// Event reported to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A tunnel finished its handshake
    Connected { role: HopRole, server: String },
    /// The tunnel binary is retrying; the attempt goes on
    RetryPause { role: HopRole },
    /// Credentials were rejected; the attempt is over
    AuthFailed { role: HopRole },
    /// The attempt failed for another reason
    Failed { reason: String },
    /// Processes are gone and teardown is complete
    Terminated,
}

/// Orchestrator errors
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("A connection attempt is already active")]
    Busy,

    #[error("Config error: {0}")]
    Build(#[from] BuildError),

    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Connection attempt was cancelled")]
    Cancelled,
}

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub commands: CommandConfig,
    /// Used when the server pushes no DNS, or always with `force_fallback_dns`
    pub fallback_dns: (IpAddr, IpAddr),
    pub force_fallback_dns: bool,
    /// Longest wait for an intermediate hop to connect
    pub hop_timeout: Duration,
    /// Pause after starting an ssh wrapper
    pub wrapper_settle: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            commands: CommandConfig::default(),
            fallback_dns: (
                IpAddr::from([208, 67, 222, 222]),
                IpAddr::from([208, 67, 220, 220]),
            ),
            force_fallback_dns: false,
            hop_timeout: Duration::from_secs(60),
            wrapper_settle: Duration::from_secs(2),
        }
    }
}

/// Why an attempt ended
#[derive(Debug)]
enum Outcome {
    Failed(String),
    AuthFailed,
    Terminated,
}

/// Daemon-lifetime connection state
#[derive(Default)]
struct Session {
    state: ConnectionState,
    attempt: u64,
    dns_snapshot: Option<DnsSnapshot>,
    /// Addresses with an open host exception
    exceptions: Vec<IpAddr>,
    interface: Option<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Is `attempt` the current one, and not yet failing?
    fn is_live(&self, attempt: u64) -> bool {
        self.attempt == attempt
            && matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected
            )
    }
}

/// Everything the driver needs for one attempt
struct Plan {
    attempt: u64,
    chain: HopChain,
    hop: Option<BuiltConfig>,
    terminal: BuiltConfig,
}

struct Inner {
    config: OrchestratorConfig,
    firewall: Arc<FirewallEngine>,
    builder: TunnelConfigBuilder,
    supervisor: ProcessSupervisor,
    dns: Arc<dyn DnsConfigurator>,
    session: Mutex<Session>,
    events: broadcast::Sender<Notification>,
}

/// Owns the connection state machine
#[derive(Clone)]
pub struct ConnectionOrchestrator {
    inner: Arc<Inner>,
}

impl ConnectionOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        firewall: Arc<FirewallEngine>,
        builder: TunnelConfigBuilder,
        launcher: Arc<dyn Launcher>,
        dns: Arc<dyn DnsConfigurator>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                config,
                firewall,
                builder,
                supervisor: ProcessSupervisor::new(launcher),
                dns,
                session: Mutex::new(Session::default()),
                events,
            }),
        }
    }

    /// Receive notifications
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.events.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.session.lock().await.state
    }

    /// Last tunnel interface announced (`tun0` until one is)
    pub async fn interface(&self) -> String {
        self.inner
            .session
            .lock()
            .await
            .interface
            .clone()
            .unwrap_or_else(|| DEFAULT_INTERFACE.to_string())
    }

    /// Processes currently registered
    pub async fn processes(&self) -> Vec<ProcessHandle> {
        self.inner.supervisor.running().await
    }

    /// Start connecting through `chain`
    ///
    /// Configs are rendered before anything is started; a build failure is
    /// returned here and nothing is spawned. Otherwise returns as soon as
    /// the attempt is dispatched.
    pub async fn connect(&self, chain: HopChain) -> Result<(), OrchestratorError> {
        if self.inner.session.lock().await.state.is_active() {
            return Err(OrchestratorError::Busy);
        }

        // Template I/O stays off the async workers and outside the lock
        let inner = self.inner.clone();
        let to_build = chain.clone();
        let (hop, terminal) = tokio::task::spawn_blocking(move || {
            let hop = to_build
                .intermediate()
                .map(|endpoint| inner.builder.build(endpoint, "hop"))
                .transpose()?;
            let terminal = inner.builder.build(to_build.terminal(), "temp")?;
            Ok::<_, BuildError>((hop, terminal))
        })
        .await
        .map_err(|_| OrchestratorError::Cancelled)??;

        let mut session = self.inner.session.lock().await;
        // Another attempt may have started while the configs were rendered
        if session.state.is_active() {
            return Err(OrchestratorError::Busy);
        }

        session.attempt += 1;
        session.state = ConnectionState::Connecting;
        session.tasks.retain(|task| !task.is_finished());
        let attempt = session.attempt;

        match chain.intermediate() {
            Some(hop) => info!("Connecting to {} via {}", chain.terminal(), hop),
            None => info!("Connecting to {}", chain.terminal()),
        }

        let plan = Plan {
            attempt,
            chain,
            hop,
            terminal,
        };
        let inner = self.inner.clone();
        session.tasks.push(tokio::spawn(inner.drive(plan)));
        Ok(())
    }

    /// Stop the current attempt and tear everything down
    pub async fn disconnect(&self) {
        let tasks = {
            let mut session = self.inner.session.lock().await;
            session.attempt += 1;
            if session.state.is_active() {
                session.state = ConnectionState::Failing;
            }
            std::mem::take(&mut session.tasks)
        };

        info!("Disconnecting");
        self.inner.teardown().await;
        self.inner.notify(Notification::Terminated);

        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await.is_err() {
                warn!("Connection task did not stop in time; aborting it");
                abort.abort();
            }
        }
    }
}

impl Inner {
    fn notify(&self, notification: Notification) {
        // No subscribers is fine
        let _ = self.events.send(notification);
    }

    async fn live_session(&self, attempt: u64) -> Option<MutexGuard<'_, Session>> {
        let session = self.session.lock().await;
        session.is_live(attempt).then_some(session)
    }

    async fn drive(self: Arc<Self>, plan: Plan) {
        let Plan {
            attempt,
            chain,
            hop,
            terminal,
        } = plan;

        self.snapshot_dns(attempt).await;
        for endpoint in chain.endpoints() {
            self.open_exception(attempt, endpoint.address).await;
        }

        if let (Some(hop_endpoint), Some(hop_config)) = (chain.intermediate(), hop.as_ref()) {
            let (connected_tx, mut connected_rx) = watch::channel(false);
            let started = self
                .start_tunnel(
                    attempt,
                    hop_endpoint,
                    hop_config,
                    HopRole::Intermediate,
                    &chain,
                    Some(connected_tx),
                )
                .await;
            if let Err(e) = started {
                self.finish(attempt, Outcome::Failed(e.to_string())).await;
                return;
            }

            let waited =
                tokio::time::timeout(self.config.hop_timeout, hop_connected(&mut connected_rx))
                    .await;

            match waited {
                Ok(true) => debug!("First hop connected; starting second hop"),
                // The hop's own consumer has already ended the attempt
                Ok(false) => return,
                Err(_) => {
                    let reason = format!(
                        "{hop_endpoint} did not connect within {:?}",
                        self.config.hop_timeout
                    );
                    self.finish(attempt, Outcome::Failed(reason)).await;
                    return;
                }
            }
        }

        let started = self
            .start_tunnel(
                attempt,
                chain.terminal(),
                &terminal,
                chain.terminal_role(),
                &chain,
                None,
            )
            .await;
        if let Err(e) = started {
            self.finish(attempt, Outcome::Failed(e.to_string())).await;
        }
    }

    /// Start the wrapper (if any) and the tunnel for one hop
    async fn start_tunnel(
        self: &Arc<Self>,
        attempt: u64,
        endpoint: &TunnelEndpoint,
        built: &BuiltConfig,
        role: HopRole,
        chain: &HopChain,
        connected: Option<watch::Sender<bool>>,
    ) -> Result<(), OrchestratorError> {
        if let Some(wrapper) = &built.wrapper {
            let spec = wrapper_command(&self.config.commands, wrapper);
            let (_, output) = self.spawn_for(attempt, &spec).await?;
            self.track(tokio::spawn(log_output(spec.role, output))).await;

            if matches!(wrapper, WrapperConfig::Ssh { .. }) {
                tokio::time::sleep(self.config.wrapper_settle).await;
            }
        }

        let spec = tunnel_command(&self.config.commands, built, role, chain);
        match role {
            HopRole::Intermediate => info!("Establishing connection to {} - first hop", endpoint.name),
            HopRole::Terminal => info!("Establishing connection to {} - second hop", endpoint.name),
            HopRole::Single => info!("Establishing connection to {}", endpoint.name),
        }
        let (_, output) = self.spawn_for(attempt, &spec).await?;

        let inner = self.clone();
        let server = endpoint.name.clone();
        let consumer = tokio::spawn(async move {
            inner.consume(attempt, role, server, output, connected).await;
        });
        self.track(consumer).await;
        Ok(())
    }

    /// Spawn under the session lock, only while `attempt` is live
    async fn spawn_for(
        &self,
        attempt: u64,
        spec: &CommandSpec,
    ) -> Result<(ProcessHandle, OutputLines), OrchestratorError> {
        let Some(_session) = self.live_session(attempt).await else {
            return Err(OrchestratorError::Cancelled);
        };
        Ok(self.supervisor.spawn(spec).await?)
    }

    async fn track(&self, task: JoinHandle<()>) {
        self.session.lock().await.tasks.push(task);
    }

    /// Handle one tunnel's output until it ends
    async fn consume(
        self: Arc<Self>,
        attempt: u64,
        role: HopRole,
        server: String,
        mut output: OutputLines,
        connected: Option<watch::Sender<bool>>,
    ) {
        // First pushed DNS wins for this stream
        let mut dns_learned = false;

        let outcome = loop {
            let Some(line) = output.next_line().await else {
                break Outcome::Failed(format!("OpenVPN ({role}) for {server} exited unexpectedly"));
            };
            info!("OpenVPN: {line}");

            match classify(&line) {
                LineEvent::HandshakeComplete => {
                    if !dns_learned {
                        self.apply_fallback_dns(attempt).await;
                        dns_learned = true;
                    }
                    match &connected {
                        Some(tx) => {
                            let _ = tx.send(true);
                        }
                        None => self.mark_connected(attempt).await,
                    }
                    info!("Successfully connected to {server}");
                    self.notify(Notification::Connected {
                        role,
                        server: server.clone(),
                    });
                }
                LineEvent::InterfaceAssigned(name) => {
                    if let Some(mut session) = self.live_session(attempt).await {
                        debug!("Tunnel interface: {name}");
                        session.interface = Some(name);
                    }
                }
                LineEvent::DnsPush(servers) => {
                    if dns_learned {
                        debug!("Ignoring further pushed DNS servers");
                        continue;
                    }
                    dns_learned = true;
                    if self.config.force_fallback_dns {
                        self.apply_fallback_dns(attempt).await;
                    } else if let Some(&primary) = servers.first() {
                        self.apply_dns(attempt, primary, servers.get(1).copied())
                            .await;
                    }
                }
                LineEvent::RetryPause => {
                    warn!("Connection attempt to {server} failed; retrying");
                    self.notify(Notification::RetryPause { role });
                }
                LineEvent::AuthFailure => {
                    error!("Authentication error while connecting to {server}");
                    self.notify(Notification::AuthFailed { role });
                    break Outcome::AuthFailed;
                }
                LineEvent::HardTermination => break Outcome::Terminated,
                LineEvent::Other => {}
            }
        };

        debug!("OpenVPN ({role}) output ended: {outcome:?}");
        self.finish(attempt, outcome).await;
    }

    async fn mark_connected(&self, attempt: u64) {
        if let Some(mut session) = self.live_session(attempt).await {
            session.state = ConnectionState::Connected;
        }
    }

    async fn snapshot_dns(&self, attempt: u64) {
        let Some(mut session) = self.live_session(attempt).await else {
            return;
        };
        if session.dns_snapshot.is_some() {
            return;
        }
        match self.dns.snapshot() {
            Ok(snapshot) => session.dns_snapshot = Some(snapshot),
            Err(e) => warn!("Could not save DNS configuration: {e}"),
        }
    }

    async fn apply_dns(&self, attempt: u64, primary: IpAddr, secondary: Option<IpAddr>) {
        let Some(_session) = self.live_session(attempt).await else {
            return;
        };
        if let Err(e) = self.dns.apply(primary, secondary) {
            warn!("Could not update DNS: {e}");
        }
    }

    async fn apply_fallback_dns(&self, attempt: u64) {
        let (primary, secondary) = self.config.fallback_dns;
        self.apply_dns(attempt, primary, Some(secondary)).await;
    }

    async fn open_exception(&self, attempt: u64, address: IpAddr) {
        let Some(mut session) = self.live_session(attempt).await else {
            return;
        };
        let outcomes = self
            .with_firewall(move |firewall| firewall.allow_temporary(&Exception::Host(address)))
            .await
            .unwrap_or_default();

        // A rule that was already there is not ours to remove later
        if outcomes.contains(&RuleOutcome::Applied) {
            session.exceptions.push(address);
            info!("iptables: created rule for {address}");
        } else {
            debug!("iptables: rule for {address} already present");
        }
    }

    /// Run a firewall call off the async workers
    async fn with_firewall<F, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&FirewallEngine) -> T + Send + 'static,
        T: Send + 'static,
    {
        let firewall = self.firewall.clone();
        match tokio::task::spawn_blocking(move || f(&firewall)).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Firewall task failed: {e}");
                None
            }
        }
    }

    /// End `attempt` after a failure or unexpected exit
    async fn finish(&self, attempt: u64, outcome: Outcome) {
        {
            let mut session = self.session.lock().await;
            if !session.is_live(attempt) {
                return;
            }
            session.state = ConnectionState::Failing;
        }

        if let Outcome::Failed(reason) = &outcome {
            error!("Connection failed: {reason}");
            self.notify(Notification::Failed {
                reason: reason.clone(),
            });
        }
        self.teardown().await;
        self.notify(Notification::Terminated);
    }

    /// Restore DNS, stop processes, close exceptions
    ///
    /// Each step runs even when an earlier one fails.
    async fn teardown(&self) {
        let (snapshot, exceptions) = {
            let mut session = self.session.lock().await;
            (
                session.dns_snapshot.take(),
                std::mem::take(&mut session.exceptions),
            )
        };

        match snapshot {
            Some(snapshot) => {
                if let Err(e) = self.dns.restore(&snapshot) {
                    warn!("Could not restore DNS configuration: {e}");
                }
            }
            None => warn!("No saved DNS configuration to restore"),
        }

        self.supervisor.terminate_all().await;

        for address in exceptions {
            self.with_firewall(move |firewall| firewall.block_temporary(&Exception::Host(address)))
                .await;
            debug!("iptables: removed rule for {address}");
        }

        self.session.lock().await.state = ConnectionState::Disconnected;
        info!("Disconnected");
    }
}

/// Resolves to `true` once the hop reports CONNECTED, `false` if its consumer ends first
async fn hop_connected(rx: &mut watch::Receiver<bool>) -> bool {
    loop {
        if *rx.borrow_and_update() {
            return true;
        }
        if rx.changed().await.is_err() {
            return *rx.borrow();
        }
    }
}

/// Forward a wrapper's output to the log
async fn log_output(role: ProcessRole, mut output: OutputLines) {
    while let Some(line) = output.next_line().await {
        info!("{role}: {line}");
    }
    debug!("{role} output ended");
}
