//! Filter Backends
//!
//! The engine talks to the kernel filter tables through [`FilterBackend`].
//! [`IptablesBackend`] shells out to `iptables`/`ip6tables`.

use crate::rule::{Family, Rule};
use std::process::{Command, Stdio};
use tracing::debug;

/// Executes rules against a set of filter tables
pub trait FilterBackend: Send + Sync {
    /// Run one rule; a non-zero exit (including a failed `-C`) is an error
    fn execute(&self, family: Family, rule: &Rule) -> Result<(), BackendError>;

    /// Dump the active rules in `-S` format
    fn list(&self, family: Family) -> Result<String, BackendError>;
}

/// Backend errors
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {status}: {stderr}")]
    Failed {
        program: &'static str,
        status: i32,
        stderr: String,
    },
}

/// `iptables` / `ip6tables` backend
#[derive(Debug, Clone)]
pub struct IptablesBackend {
    /// Pass `--wait` so concurrent callers queue on the xtables lock
    wait: bool,
}

impl IptablesBackend {
    /// Create a backend that waits for the xtables lock
    pub fn new() -> Self {
        Self { wait: true }
    }

    fn command(&self, family: Family) -> Command {
        let mut cmd = Command::new(family.program());
        if self.wait {
            cmd.arg("--wait");
        }
        cmd.stdin(Stdio::null());
        cmd
    }
}

impl Default for IptablesBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterBackend for IptablesBackend {
    fn execute(&self, family: Family, rule: &Rule) -> Result<(), BackendError> {
        let program = family.program();
        let output = self
            .command(family)
            .args(rule.tokens())
            .output()
            .map_err(|source| BackendError::Spawn { program, source })?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!("{program} {rule}: {stderr}");
            Err(BackendError::Failed {
                program,
                status: output.status.code().unwrap_or(-1),
                stderr,
            })
        }
    }

    fn list(&self, family: Family) -> Result<String, BackendError> {
        let program = family.program();
        let output = self
            .command(family)
            .arg("-S")
            .output()
            .map_err(|source| BackendError::Spawn { program, source })?;

        if !output.status.success() {
            return Err(BackendError::Failed {
                program,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
