//! Firewall Engine
//!
//! Reconciles the kernel filter tables with the managed rule sets.
//!
//! # Apply cycle
//!
//! 1. Load the rule set (primary document, then packaged default)
//! 2. Snapshot foreign rules for v4 and v6
//! 3. Apply `flush` rules
//! 4. Replay the foreign snapshot
//! 5. Secure: `defaults` then kill-switch rules; permissive: `unsecure`
//!
//! Every rule goes through [`FirewallEngine::apply_rule`], which skips
//! rules that are already active. Failures are logged and the batch
//! carries on.

use crate::backend::FilterBackend;
use crate::rule::{Family, Rule};
use crate::store::{FirewallError, Mode, RuleSet, RuleStore};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of applying a single rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    /// The rule was executed
    Applied,
    /// An equivalent rule was already active; nothing was executed
    AlreadyActive,
    /// The filter tool rejected the rule
    Failed,
}

/// Active rules not owned by the managed rule sets
///
/// Captured right before a flush and replayed right after it.
#[derive(Debug, Clone)]
pub struct ForeignRuleSnapshot {
    family: Family,
    rules: Vec<Rule>,
}

impl ForeignRuleSnapshot {
    /// Build a snapshot from `-S` output
    ///
    /// Rules equivalent to a `flush` or kill-switch rule are left out,
    /// and each rule is kept once.
    pub fn from_listing(family: Family, listing: &str, managed: &RuleSet) -> Self {
        let owned: Vec<&Rule> = managed.managed(family).collect();
        let mut rules: Vec<Rule> = Vec::new();

        for line in listing.lines() {
            let Some(rule) = Rule::parse(line) else {
                continue;
            };
            let rule = rule.without_host_suffix(family);

            if owned.iter().any(|m| m.is_equivalent(&rule)) {
                continue;
            }
            if !rules.iter().any(|r| r.is_equivalent(&rule)) {
                rules.push(rule);
            }
        }

        Self { family, rules }
    }

    /// Family the snapshot was taken from
    pub fn family(&self) -> Family {
        self.family
    }

    /// Snapshotted rules, in listing order
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Narrow ACCEPT exception punched in front of the default-drop policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    /// UDP/53 to and from a resolver pair
    DnsServers(IpAddr, IpAddr),
    /// ICMP to and from a bootstrap resolver
    ResolverPing(IpAddr),
    /// All outbound traffic to one host (tunnel endpoint, provider site)
    Host(IpAddr),
}

impl Exception {
    /// Insert-form rules that open this exception
    pub fn rules(&self) -> Vec<(Family, Rule)> {
        match *self {
            Exception::DnsServers(primary, secondary) => {
                let mut servers = vec![primary];
                if secondary != primary {
                    servers.push(secondary);
                }
                servers
                    .into_iter()
                    .flat_map(|server| {
                        let family = Family::of(server);
                        let addr = server.to_string();
                        [
                            (
                                family,
                                Rule::new([
                                    "-I", "OUTPUT", "1", "-p", "udp", "-d", &addr, "--dport", "53",
                                    "-j", "ACCEPT",
                                ]),
                            ),
                            (
                                family,
                                Rule::new([
                                    "-I", "INPUT", "1", "-p", "udp", "-s", &addr, "--sport", "53",
                                    "-j", "ACCEPT",
                                ]),
                            ),
                        ]
                    })
                    .collect()
            }
            Exception::ResolverPing(server) => {
                let family = Family::of(server);
                let proto = match family {
                    Family::V4 => "icmp",
                    Family::V6 => "ipv6-icmp",
                };
                let addr = server.to_string();
                vec![
                    (
                        family,
                        Rule::new(["-I", "OUTPUT", "1", "-p", proto, "-d", &addr, "-j", "ACCEPT"]),
                    ),
                    (
                        family,
                        Rule::new(["-I", "INPUT", "1", "-p", proto, "-s", &addr, "-j", "ACCEPT"]),
                    ),
                ]
            }
            Exception::Host(host) => {
                let addr = host.to_string();
                vec![(
                    Family::of(host),
                    Rule::new(["-I", "OUTPUT", "1", "-d", &addr, "-j", "ACCEPT"]),
                )]
            }
        }
    }
}

/// Applies managed rule sets and temporary exceptions
pub struct FirewallEngine {
    store: RuleStore,
    backend: Arc<dyn FilterBackend>,
}

impl FirewallEngine {
    /// Create an engine over a rule store and a filter backend
    pub fn new(store: RuleStore, backend: Arc<dyn FilterBackend>) -> Self {
        Self { store, backend }
    }

    /// Rule store in use
    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    /// Apply one rule idempotently
    ///
    /// Append/insert rules are first checked for existence and skipped
    /// when already active. Deletes and other actions are executed as-is.
    pub fn apply_rule(&self, family: Family, rule: &Rule) -> RuleOutcome {
        if let Some(check) = rule.check_form() {
            if self.backend.execute(family, &check).is_ok() {
                debug!("{family}: {rule} already exists");
                return RuleOutcome::AlreadyActive;
            }
        }

        match self.backend.execute(family, rule) {
            Ok(()) => {
                debug!("{family}: applied {rule}");
                RuleOutcome::Applied
            }
            Err(e) => {
                warn!("{family}: failed to apply {rule}: {e}");
                RuleOutcome::Failed
            }
        }
    }

    /// Apply a batch; returns how many rules failed
    fn apply_all(&self, family: Family, rules: &[Rule]) -> usize {
        rules
            .iter()
            .map(|rule| self.apply_rule(family, rule))
            .filter(|outcome| *outcome == RuleOutcome::Failed)
            .count()
    }

    /// Capture the foreign rules currently active for one family
    pub fn snapshot(&self, family: Family, managed: &RuleSet) -> ForeignRuleSnapshot {
        match self.backend.list(family) {
            Ok(listing) => ForeignRuleSnapshot::from_listing(family, &listing, managed),
            Err(e) => {
                warn!("{family}: could not list active rules: {e}");
                ForeignRuleSnapshot {
                    family,
                    rules: Vec::new(),
                }
            }
        }
    }

    /// Flush, replay foreign rules and apply the rules for `mode`
    pub fn apply_rule_set(&self, mode: Mode) -> Result<(), FirewallError> {
        let rules = self.store.load()?;

        let snapshots: Vec<ForeignRuleSnapshot> = Family::all()
            .iter()
            .map(|&family| self.snapshot(family, &rules))
            .collect();

        for &family in Family::all() {
            self.apply_all(family, rules.flush(family));
        }
        info!("iptables: flushed existing rules");

        for snapshot in &snapshots {
            if !snapshot.is_empty() {
                debug!(
                    "{}: restoring {} pre-existing rule(s)",
                    snapshot.family(),
                    snapshot.len()
                );
            }
            self.apply_all(snapshot.family(), snapshot.rules());
        }

        let failed = match mode {
            Mode::Secure => {
                let mut failed = 0;
                for &family in Family::all() {
                    failed += self.apply_all(family, rules.defaults(family));
                }
                for &family in Family::all() {
                    failed += self.apply_all(family, rules.kill_switch(family));
                }
                info!("iptables: activated firewall");
                failed
            }
            Mode::Permissive => {
                let failed = Family::all()
                    .iter()
                    .map(|&family| self.apply_all(family, rules.unsecure(family)))
                    .sum();
                info!("iptables: deactivated firewall");
                failed
            }
        };

        if failed > 0 {
            warn!("iptables: {failed} rule(s) could not be applied");
        }
        Ok(())
    }

    /// Apply the `allowping` rules when enabled; a no-op otherwise
    pub fn allow_ping(&self, enabled: bool) -> Result<(), FirewallError> {
        if !enabled {
            return Ok(());
        }
        let rules = self.store.load()?;
        self.apply_all(Family::V4, &rules.allowping);
        info!("iptables: ping allowed");
        Ok(())
    }

    /// Open a temporary exception
    ///
    /// Returns one outcome per rule; `AlreadyActive` rules belong to
    /// someone else and should not be removed by the caller.
    pub fn allow_temporary(&self, exception: &Exception) -> Vec<RuleOutcome> {
        debug!("iptables: temporarily allowing {exception:?}");
        exception
            .rules()
            .into_iter()
            .map(|(family, rule)| self.apply_rule(family, &rule))
            .collect()
    }

    /// Remove a temporary exception opened by [`allow_temporary`](Self::allow_temporary)
    pub fn block_temporary(&self, exception: &Exception) {
        debug!("iptables: deleting exception {exception:?}");
        for (family, rule) in exception.rules() {
            if let Some(delete) = rule.delete_form() {
                self.apply_rule(family, &delete);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use std::fs;
    use tempfile::TempDir;

    fn rule(tokens: &[&str]) -> Rule {
        Rule::new(tokens.iter().copied())
    }

    fn engine_with(doc: &str) -> (TempDir, Arc<MemoryBackend>, FirewallEngine) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("firewall.json"), doc).unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let engine = FirewallEngine::new(RuleStore::in_dir(dir.path()), backend.clone());
        (dir, backend, engine)
    }

    const SCENARIO: &str = r#"{
        "flush": [["-F", "INPUT"]],
        "flushv6": [],
        "defaults": [],
        "defaultsv6": [],
        "ipv4rules": [["-A", "OUTPUT", "-d", "1.2.3.4", "-j", "ACCEPT"]],
        "ipv6rules": [],
        "unsecure": [],
        "unsecurev6": [],
        "allowping": [["-A", "OUTPUT", "-p", "icmp", "-j", "ACCEPT"]]
    }"#;

    const KILL_SWITCH: &str = r#"{
        "flush": [["-F"], ["-P", "OUTPUT", "ACCEPT"]],
        "flushv6": [["-F"]],
        "defaults": [["-P", "OUTPUT", "DROP"], ["-A", "OUTPUT", "-o", "lo", "-j", "ACCEPT"]],
        "defaultsv6": [["-P", "OUTPUT", "DROP"]],
        "ipv4rules": [["-A", "OUTPUT", "-o", "tun+", "-j", "ACCEPT"]],
        "ipv6rules": [["-A", "OUTPUT", "-o", "tun+", "-j", "ACCEPT"]],
        "unsecure": [["-P", "OUTPUT", "ACCEPT"]],
        "unsecurev6": [["-P", "OUTPUT", "ACCEPT"]],
        "allowping": []
    }"#;

    #[test]
    fn test_end_to_end_scenario() {
        let (_dir, backend, engine) = engine_with(SCENARIO);
        let foreign = rule(&["-A", "OUTPUT", "-d", "9.9.9.9", "-j", "ACCEPT"]);
        backend.execute(Family::V4, &foreign).unwrap();

        engine.apply_rule_set(Mode::Secure).unwrap();

        let active = backend.active_rules(Family::V4);
        assert_eq!(active.len(), 2);
        assert!(active.contains(&foreign));
        assert!(active.contains(&rule(&["-A", "OUTPUT", "-d", "1.2.3.4", "-j", "ACCEPT"])));
    }

    #[test]
    fn test_idempotent_apply() {
        let (_dir, backend, engine) = engine_with(KILL_SWITCH);

        engine.apply_rule_set(Mode::Secure).unwrap();
        let first = backend.active_rules(Family::V4);
        let first_v6 = backend.active_rules(Family::V6);

        engine.apply_rule_set(Mode::Secure).unwrap();
        assert_eq!(backend.active_rules(Family::V4), first);
        assert_eq!(backend.active_rules(Family::V6), first_v6);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_foreign_rule_survives_flush_exactly_once() {
        let (_dir, backend, engine) = engine_with(KILL_SWITCH);
        let foreign = rule(&["-A", "INPUT", "-s", "192.168.1.0/24", "-j", "ACCEPT"]);
        backend.execute(Family::V4, &foreign).unwrap();

        engine.apply_rule_set(Mode::Secure).unwrap();
        engine.apply_rule_set(Mode::Secure).unwrap();

        let count = backend
            .active_rules(Family::V4)
            .iter()
            .filter(|r| r.is_equivalent(&foreign))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_mode_toggling() {
        let (_dir, backend, engine) = engine_with(KILL_SWITCH);
        let tun = rule(&["-A", "OUTPUT", "-o", "tun+", "-j", "ACCEPT"]);

        engine.apply_rule_set(Mode::Secure).unwrap();
        assert!(backend.active_rules(Family::V4).contains(&tun));
        assert_eq!(backend.policy(Family::V4, "OUTPUT").as_deref(), Some("DROP"));

        engine.apply_rule_set(Mode::Permissive).unwrap();
        assert!(!backend.active_rules(Family::V4).contains(&tun));
        assert!(!backend.active_rules(Family::V6).contains(&tun));
        assert_eq!(backend.policy(Family::V4, "OUTPUT").as_deref(), Some("ACCEPT"));
        assert_eq!(backend.policy(Family::V6, "OUTPUT").as_deref(), Some("ACCEPT"));
    }

    #[test]
    fn test_failed_rule_does_not_abort_batch() {
        let doc = r#"{
            "flush": [], "flushv6": [], "defaults": [], "defaultsv6": [],
            "ipv4rules": [
                ["-A", "OUTPUT", "-o", "lo", "-j", "ACCEPT"],
                ["--bogus"],
                ["-A", "OUTPUT", "-o", "tun+", "-j", "ACCEPT"]
            ],
            "ipv6rules": [], "unsecure": [], "unsecurev6": [], "allowping": []
        }"#;
        let (_dir, backend, engine) = engine_with(doc);

        engine.apply_rule_set(Mode::Secure).unwrap();
        assert_eq!(backend.active_rules(Family::V4).len(), 2);
    }

    #[test]
    fn test_permuted_rule_counts_as_existing() {
        let (_dir, backend, engine) = engine_with(SCENARIO);
        backend
            .execute(Family::V4, &rule(&["-A", "OUTPUT", "-j", "ACCEPT", "-d", "1.2.3.4"]))
            .unwrap();

        let outcome = engine.apply_rule(
            Family::V4,
            &rule(&["-A", "OUTPUT", "-d", "1.2.3.4", "-j", "ACCEPT"]),
        );
        assert_eq!(outcome, RuleOutcome::AlreadyActive);
        assert_eq!(backend.active_rules(Family::V4).len(), 1);
    }

    #[test]
    fn test_snapshot_skips_managed_and_duplicates() {
        let managed = RuleSet::from_json(SCENARIO).unwrap();
        let listing = "-P INPUT ACCEPT\n\
                       -A OUTPUT -d 1.2.3.4/32 -j ACCEPT\n\
                       -A OUTPUT -d 9.9.9.9/32 -j ACCEPT\n\
                       -A OUTPUT -j ACCEPT -d 9.9.9.9\n\
                       -F INPUT\n\n";

        let snapshot = ForeignRuleSnapshot::from_listing(Family::V4, listing, &managed);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.rules()[0], rule(&["-P", "INPUT", "ACCEPT"]));
        assert_eq!(
            snapshot.rules()[1],
            rule(&["-A", "OUTPUT", "-d", "9.9.9.9", "-j", "ACCEPT"])
        );
    }

    #[test]
    fn test_no_usable_config_applies_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let engine = FirewallEngine::new(RuleStore::in_dir(dir.path()), backend.clone());

        let result = engine.apply_rule_set(Mode::Secure);
        assert!(matches!(result, Err(FirewallError::NoUsableConfig)));
        assert!(backend.history().is_empty());
    }

    #[test]
    fn test_allow_ping() {
        let (_dir, backend, engine) = engine_with(SCENARIO);

        engine.allow_ping(false).unwrap();
        assert!(backend.history().is_empty());

        engine.allow_ping(true).unwrap();
        assert_eq!(backend.active_rules(Family::V4).len(), 1);
    }

    #[test]
    fn test_dns_exception_roundtrip() {
        let (_dir, backend, engine) = engine_with(SCENARIO);
        let dns = Exception::DnsServers("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap());

        engine.allow_temporary(&dns);
        assert_eq!(backend.active_rules(Family::V4).len(), 4);

        // Opening twice does not stack rules
        engine.allow_temporary(&dns);
        assert_eq!(backend.active_rules(Family::V4).len(), 4);

        engine.block_temporary(&dns);
        assert!(backend.active_rules(Family::V4).is_empty());
    }

    #[test]
    fn test_host_exception_goes_first() {
        let (_dir, backend, engine) = engine_with(SCENARIO);
        backend
            .execute(Family::V4, &rule(&["-A", "OUTPUT", "-j", "DROP"]))
            .unwrap();

        engine.allow_temporary(&Exception::Host("203.0.113.7".parse().unwrap()));
        let active = backend.active_rules(Family::V4);
        assert_eq!(
            active[0],
            rule(&["-A", "OUTPUT", "-d", "203.0.113.7", "-j", "ACCEPT"])
        );
    }

    #[test]
    fn test_exception_reports_existing_rule() {
        let (_dir, backend, engine) = engine_with(SCENARIO);
        let host = Exception::Host("203.0.113.9".parse().unwrap());
        backend
            .execute(Family::V4, &rule(&["-A", "OUTPUT", "-d", "203.0.113.9", "-j", "ACCEPT"]))
            .unwrap();

        assert_eq!(engine.allow_temporary(&host), [RuleOutcome::AlreadyActive]);
        assert_eq!(backend.active_rules(Family::V4).len(), 1);

        let other = Exception::Host("203.0.113.10".parse().unwrap());
        assert_eq!(engine.allow_temporary(&other), [RuleOutcome::Applied]);
    }

    #[test]
    fn test_v6_exception_uses_v6_tables() {
        let (_dir, backend, engine) = engine_with(SCENARIO);
        engine.allow_temporary(&Exception::ResolverPing("2001:db8::53".parse().unwrap()));

        assert!(backend.active_rules(Family::V4).is_empty());
        let active = backend.active_rules(Family::V6);
        assert_eq!(active.len(), 2);
        assert!(active[0].tokens().contains(&"ipv6-icmp".to_string()));
    }
}
