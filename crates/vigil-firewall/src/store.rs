//! Rule Store
//!
//! Loads the managed rule sets from a JSON document. The primary document
//! is the user-editable `firewall.json`; the packaged
//! `firewall_default.json` is used when the primary one is missing or
//! unparsable.

use crate::rule::{Family, Rule};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, error};

/// Firewall mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Kill switch active: default policy plus allow/block lists
    #[default]
    Secure,
    /// Kill switch relaxed: only the `unsecure` rules
    Permissive,
}

impl FromStr for Mode {
    type Err = FirewallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "secure" | "on" | "1" => Ok(Mode::Secure),
            "permissive" | "off" | "0" => Ok(Mode::Permissive),
            _ => Err(FirewallError::Parse(format!("unknown firewall mode: {s}"))),
        }
    }
}

/// Complete set of managed rules
///
/// Every key is required; a document missing one is rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub flush: Vec<Rule>,
    pub flushv6: Vec<Rule>,
    pub defaults: Vec<Rule>,
    pub defaultsv6: Vec<Rule>,
    pub ipv4rules: Vec<Rule>,
    pub ipv6rules: Vec<Rule>,
    pub unsecure: Vec<Rule>,
    pub unsecurev6: Vec<Rule>,
    pub allowping: Vec<Rule>,
}

impl RuleSet {
    /// Parse a JSON rule document
    pub fn from_json(content: &str) -> Result<Self, FirewallError> {
        serde_json::from_str(content).map_err(|e| FirewallError::Parse(e.to_string()))
    }

    /// Load a JSON rule document from disk
    pub fn from_json_file(path: &Path) -> Result<Self, FirewallError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FirewallError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    /// Rules that reset chains and policies
    pub fn flush(&self, family: Family) -> &[Rule] {
        match family {
            Family::V4 => &self.flush,
            Family::V6 => &self.flushv6,
        }
    }

    /// Baseline secure policy
    pub fn defaults(&self, family: Family) -> &[Rule] {
        match family {
            Family::V4 => &self.defaults,
            Family::V6 => &self.defaultsv6,
        }
    }

    /// Kill-switch allow/block rules
    pub fn kill_switch(&self, family: Family) -> &[Rule] {
        match family {
            Family::V4 => &self.ipv4rules,
            Family::V6 => &self.ipv6rules,
        }
    }

    /// Rules applied in permissive mode
    pub fn unsecure(&self, family: Family) -> &[Rule] {
        match family {
            Family::V4 => &self.unsecure,
            Family::V6 => &self.unsecurev6,
        }
    }

    /// Rules that are never treated as foreign when snapshotting
    pub fn managed(&self, family: Family) -> impl Iterator<Item = &Rule> {
        self.kill_switch(family).iter().chain(self.flush(family))
    }
}

/// Location of the rule documents
#[derive(Debug, Clone)]
pub struct RuleStore {
    primary: PathBuf,
    fallback: PathBuf,
}

impl RuleStore {
    /// Create a store from explicit paths
    pub fn new(primary: impl Into<PathBuf>, fallback: impl Into<PathBuf>) -> Self {
        Self {
            primary: primary.into(),
            fallback: fallback.into(),
        }
    }

    /// Store rooted at a daemon directory (`firewall.json`, `firewall_default.json`)
    pub fn in_dir(root: &Path) -> Self {
        Self::new(root.join("firewall.json"), root.join("firewall_default.json"))
    }

    /// Path of the primary document
    pub fn primary(&self) -> &Path {
        &self.primary
    }

    /// Load the current rule set
    pub fn load(&self) -> Result<RuleSet, FirewallError> {
        match RuleSet::from_json_file(&self.primary) {
            Ok(rules) => return Ok(rules),
            Err(e) => debug!("{e} - loading default firewall configuration"),
        }

        RuleSet::from_json_file(&self.fallback).map_err(|e| {
            error!("Failed to load firewall configuration: {e}");
            FirewallError::NoUsableConfig
        })
    }
}

/// Firewall errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum FirewallError {
    #[error("No usable firewall configuration")]
    NoUsableConfig,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
