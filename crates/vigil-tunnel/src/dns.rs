//! DNS Configuration
//!
//! The orchestrator points the system resolver at the tunnel's DNS
//! servers through [`DnsConfigurator`], and restores the previous
//! configuration on teardown. [`ResolvConf`] does this by rewriting
//! `/etc/resolv.conf` after copying it aside.

use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// DNS errors
#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("Failed to back up {}: {source}", path.display())]
    Snapshot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write {}: {source}", path.display())]
    Apply {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No DNS backup at {}", .0.display())]
    MissingBackup(PathBuf),

    #[error("Failed to restore {}: {source}", path.display())]
    Restore {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Pre-connection resolver state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsSnapshot {
    /// Where the saved configuration lives
    pub location: PathBuf,
}

/// System resolver configuration
pub trait DnsConfigurator: Send + Sync {
    /// Save the current configuration
    fn snapshot(&self) -> Result<DnsSnapshot, DnsError>;

    /// Use `primary` (and `secondary`) for all lookups
    fn apply(&self, primary: IpAddr, secondary: Option<IpAddr>) -> Result<(), DnsError>;

    /// Put back a saved configuration
    fn restore(&self, snapshot: &DnsSnapshot) -> Result<(), DnsError>;
}

/// `resolv.conf` writer
#[derive(Debug, Clone)]
pub struct ResolvConf {
    path: PathBuf,
    backup: PathBuf,
}

impl ResolvConf {
    pub fn new(path: impl Into<PathBuf>, backup: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup: backup.into(),
        }
    }

    /// `/etc/resolv.conf`, backed up to `/etc/resolv.conf.vigil.bak`
    pub fn system() -> Self {
        Self::new("/etc/resolv.conf", "/etc/resolv.conf.vigil.bak")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DnsConfigurator for ResolvConf {
    fn snapshot(&self) -> Result<DnsSnapshot, DnsError> {
        fs::copy(&self.path, &self.backup).map_err(|source| DnsError::Snapshot {
            path: self.path.clone(),
            source,
        })?;
        debug!("Backed up {} to {}", self.path.display(), self.backup.display());
        Ok(DnsSnapshot {
            location: self.backup.clone(),
        })
    }

    fn apply(&self, primary: IpAddr, secondary: Option<IpAddr>) -> Result<(), DnsError> {
        let mut content = String::from("# Generated by vigild\n");
        content.push_str(&format!("nameserver {primary}\n"));
        if let Some(secondary) = secondary.filter(|s| *s != primary) {
            content.push_str(&format!("nameserver {secondary}\n"));
        }

        fs::write(&self.path, content).map_err(|source| DnsError::Apply {
            path: self.path.clone(),
            source,
        })?;
        match secondary {
            Some(secondary) => info!("DNS: using {primary} and {secondary}"),
            None => info!("DNS: using {primary}"),
        }
        Ok(())
    }

    fn restore(&self, snapshot: &DnsSnapshot) -> Result<(), DnsError> {
        if !snapshot.location.exists() {
            return Err(DnsError::MissingBackup(snapshot.location.clone()));
        }
        fs::copy(&snapshot.location, &self.path).map_err(|source| DnsError::Restore {
            path: self.path.clone(),
            source,
        })?;
        info!("DNS: restored original configuration");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolv(dir: &Path) -> ResolvConf {
        let conf = ResolvConf::new(dir.join("resolv.conf"), dir.join("resolv.conf.bak"));
        fs::write(conf.path(), "nameserver 192.168.1.1\n").unwrap();
        conf
    }

    #[test]
    fn test_apply_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let conf = resolv(dir.path());

        let snapshot = conf.snapshot().unwrap();
        conf.apply("10.8.0.1".parse().unwrap(), Some("10.8.0.2".parse().unwrap()))
            .unwrap();
        let written = fs::read_to_string(conf.path()).unwrap();
        assert!(written.contains("nameserver 10.8.0.1\nnameserver 10.8.0.2\n"));

        conf.restore(&snapshot).unwrap();
        assert_eq!(
            fs::read_to_string(conf.path()).unwrap(),
            "nameserver 192.168.1.1\n"
        );
    }

    #[test]
    fn test_single_server() {
        let dir = tempfile::tempdir().unwrap();
        let conf = resolv(dir.path());

        conf.apply("10.8.0.1".parse().unwrap(), None).unwrap();
        let written = fs::read_to_string(conf.path()).unwrap();
        assert_eq!(written.matches("nameserver").count(), 1);
    }

    #[test]
    fn test_restore_without_backup() {
        let dir = tempfile::tempdir().unwrap();
        let conf = resolv(dir.path());
        let snapshot = DnsSnapshot {
            location: dir.path().join("missing.bak"),
        };

        assert!(matches!(conf.restore(&snapshot), Err(DnsError::MissingBackup(_))));
    }
}
