//! Process Supervisor
//!
//! Starts the tunnel and wrapper binaries, exposes their merged
//! stdout/stderr as a line stream, and keeps a registry of running
//! processes so a disconnect can terminate all of them.
//!
//! # Ownership
//!
//! ```text
//! ProcessSupervisor
//!   ├── Launcher            (spawns; tokio::process in production)
//!   └── registry: pid ─▶ ManagedProcess { child, role }
//!
//! spawn() ─▶ (ProcessHandle, OutputLines)
//!                               └── consumed once by the orchestrator
//! ```
//!
//! Termination is SIGTERM first. A process stays registered until it has
//! exited; one still running after the grace period is killed.

use crate::classifier::HARD_TERMINATION;
use crate::endpoint::HopRole;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

/// Buffered output lines per process
const OUTPUT_BUFFER: usize = 256;

/// How long a terminated process gets to exit before it is killed
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Exit polling interval while waiting out the grace period
const REAP_INTERVAL: Duration = Duration::from_millis(50);

/// What a process does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    /// OpenVPN for one hop
    Tunnel(HopRole),
    SslWrapper,
    SshWrapper,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Tunnel(_) => f.write_str("OpenVPN"),
            ProcessRole::SslWrapper => f.write_str("stunnel"),
            ProcessRole::SshWrapper => f.write_str("ssh"),
        }
    }
}

/// Program, arguments and working directory of one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub role: ProcessRole,
}

/// Spawn errors
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Failed to start {}: {source}", program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} exited before reporting a pid", .0.display())]
    NoPid(PathBuf),
}

/// A running child process
pub trait ChildProcess: Send {
    fn id(&self) -> u32;

    /// Ask the process to exit; a process that is already gone is not an error
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the process down after it ignored `terminate`
    fn kill(&mut self) -> io::Result<()> {
        self.terminate()
    }

    fn has_exited(&mut self) -> bool;
}

/// A freshly started process and its output
pub struct Spawned {
    pub child: Box<dyn ChildProcess>,
    pub output: OutputLines,
}

/// Starts processes
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &CommandSpec) -> Result<Spawned, SpawnError>;
}

/// Line stream of one process
///
/// Finite: ends when the process closes its output, or right after a line
/// containing the terminator. Consuming it is destructive.
pub struct OutputLines {
    rx: mpsc::Receiver<String>,
    terminator: Option<&'static str>,
    finished: bool,
}

impl OutputLines {
    /// Create a stream and the sender that feeds it
    pub fn channel(capacity: usize) -> (mpsc::Sender<String>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                rx,
                terminator: None,
                finished: false,
            },
        )
    }

    /// End the stream after the first line containing `marker`
    pub fn until(mut self, marker: &'static str) -> Self {
        self.terminator = Some(marker);
        self
    }

    /// Next line, or `None` once the stream has ended
    pub async fn next_line(&mut self) -> Option<String> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(line) => {
                if self.terminator.is_some_and(|marker| line.contains(marker)) {
                    self.finished = true;
                    self.rx.close();
                }
                Some(line)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }
}

/// Launcher backed by `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

impl Launcher for TokioLauncher {
    fn launch(&self, spec: &CommandSpec) -> Result<Spawned, SpawnError> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| SpawnError::Launch {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child
            .id()
            .ok_or_else(|| SpawnError::NoPid(spec.program.clone()))?;

        let (tx, output) = OutputLines::channel(OUTPUT_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        let output = match spec.role {
            ProcessRole::Tunnel(_) => output.until(HARD_TERMINATION),
            _ => output,
        };
        Ok(Spawned {
            child: Box::new(TokioChild { child, pid }),
            output,
        })
    }
}

/// Forward raw lines; invalid UTF-8 is replaced, never fatal
async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Output read failed: {e}");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']).to_string();
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

struct TokioChild {
    child: tokio::process::Child,
    pid: u32,
}

impl ChildProcess for TokioChild {
    fn id(&self) -> u32 {
        self.pid
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if self.has_exited() {
            return Ok(());
        }
        let pid = i32::try_from(self.pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        self.kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}

/// Registry entry
struct ManagedProcess {
    child: Box<dyn ChildProcess>,
    role: ProcessRole,
}

/// Identifies a registered process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pub pid: u32,
    pub role: ProcessRole,
}

/// Spawns, tracks and terminates external processes
pub struct ProcessSupervisor {
    launcher: Arc<dyn Launcher>,
    registry: Mutex<HashMap<u32, ManagedProcess>>,
    grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        Self {
            launcher,
            registry: Mutex::new(HashMap::new()),
            grace: TERMINATE_GRACE,
        }
    }

    /// Override how long terminated processes get before being killed
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Start a process and register it under its role
    pub async fn spawn(&self, spec: &CommandSpec) -> Result<(ProcessHandle, OutputLines), SpawnError> {
        debug!("Starting {}: {} {}", spec.role, spec.program.display(), spec.args.join(" "));
        let Spawned { child, output } = self.launcher.launch(spec)?;

        let handle = ProcessHandle {
            pid: child.id(),
            role: spec.role,
        };
        self.registry.lock().await.insert(
            handle.pid,
            ManagedProcess {
                child,
                role: spec.role,
            },
        );
        info!("{} started (pid {})", handle.role, handle.pid);
        Ok((handle, output))
    }

    /// Terminate one process; unknown or exited processes are a no-op
    ///
    /// Returns once the process has exited (or was killed after the grace
    /// period); only then is it deregistered.
    pub async fn terminate(&self, handle: ProcessHandle) {
        let signalled = {
            let mut registry = self.registry.lock().await;
            match registry.get_mut(&handle.pid) {
                Some(process) => {
                    stop(handle.pid, process);
                    vec![handle.pid]
                }
                None => Vec::new(),
            }
        };
        self.reap(signalled).await;
    }

    /// Terminate every registered process and wait for them to exit
    pub async fn terminate_all(&self) {
        let signalled: Vec<u32> = {
            let mut registry = self.registry.lock().await;
            for (&pid, process) in registry.iter_mut() {
                stop(pid, process);
            }
            registry.keys().copied().collect()
        };
        self.reap(signalled).await;
    }

    /// Wait for `pids` to exit, killing whatever outlives the grace period
    async fn reap(&self, mut pids: Vec<u32>) {
        let deadline = tokio::time::Instant::now() + self.grace;
        loop {
            {
                let mut registry = self.registry.lock().await;
                pids.retain(|pid| match registry.get_mut(pid) {
                    Some(process) => {
                        if process.child.has_exited() {
                            debug!("{} (pid {pid}) exited", process.role);
                            registry.remove(pid);
                            false
                        } else {
                            true
                        }
                    }
                    None => false,
                });
            }
            if pids.is_empty() {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(REAP_INTERVAL).await;
        }

        let mut registry = self.registry.lock().await;
        for pid in pids {
            if let Some(mut process) = registry.remove(&pid) {
                warn!("{} (pid {pid}) ignored SIGTERM; killing it", process.role);
                if let Err(e) = process.child.kill() {
                    warn!("Failed to kill {} (pid {pid}): {e}", process.role);
                }
            }
        }
    }

    /// Registered processes
    pub async fn running(&self) -> Vec<ProcessHandle> {
        let registry = self.registry.lock().await;
        registry
            .iter()
            .map(|(&pid, process)| ProcessHandle {
                pid,
                role: process.role,
            })
            .collect()
    }
}

fn stop(pid: u32, process: &mut ManagedProcess) {
    match process.child.terminate() {
        Ok(()) => debug!("{} (pid {pid}) asked to exit", process.role),
        Err(e) => warn!("Failed to terminate {} (pid {pid}): {e}", process.role),
    }
}
