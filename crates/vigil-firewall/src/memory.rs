//! In-Memory Filter Backend
//!
//! Emulates the subset of `iptables` used by the kill switch: append,
//! insert, delete, check, flush, policy, chain create/delete and `-S`
//! listing. Used for dry runs (no kernel changes) and in tests.
//!
//! Rule matching for `-C` and `-D` is order-insensitive, like the engine's
//! own notion of rule identity.

use crate::backend::{BackendError, FilterBackend};
use crate::rule::{Family, Rule};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

const PROGRAM: &str = "memory";
const BUILTIN_CHAINS: &[&str] = &["INPUT", "FORWARD", "OUTPUT"];

/// Chains of one table, in creation order
#[derive(Debug, Default, Clone)]
struct Table {
    chains: Vec<(String, Vec<Vec<String>>)>,
    policies: BTreeMap<String, String>,
}

impl Table {
    fn filter() -> Self {
        let mut table = Self::default();
        for chain in BUILTIN_CHAINS {
            table.chains.push((chain.to_string(), Vec::new()));
            table.policies.insert(chain.to_string(), "ACCEPT".to_string());
        }
        table
    }

    fn chain_mut(&mut self, name: &str) -> &mut Vec<Vec<String>> {
        let idx = match self.chains.iter().position(|(n, _)| n == name) {
            Some(idx) => idx,
            None => {
                self.chains.push((name.to_string(), Vec::new()));
                self.chains.len() - 1
            }
        };
        &mut self.chains[idx].1
    }

    fn find(&self, chain: &str, spec: &[String]) -> Option<usize> {
        let wanted = Rule::new(spec.iter().cloned());
        self.chains
            .iter()
            .find(|(n, _)| n == chain)
            .and_then(|(_, rules)| {
                rules
                    .iter()
                    .position(|r| Rule::new(r.iter().cloned()).is_equivalent(&wanted))
            })
    }
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<(Family, String), Table>,
    history: Vec<(Family, Rule)>,
}

impl State {
    fn table(&mut self, family: Family, name: &str) -> &mut Table {
        self.tables
            .entry((family, name.to_string()))
            .or_insert_with(|| {
                if name == "filter" {
                    Table::filter()
                } else {
                    Table::default()
                }
            })
    }
}

/// In-memory emulation of the kernel filter tables
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    /// Create empty tables (builtin chains, ACCEPT policies)
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a panicking test; the data is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Active `-A` rules of the filter table, in chain order
    pub fn active_rules(&self, family: Family) -> Vec<Rule> {
        let mut state = self.lock();
        let table = state.table(family, "filter");
        table
            .chains
            .iter()
            .flat_map(|(chain, rules)| {
                rules.iter().map(move |spec| {
                    Rule::new(
                        ["-A".to_string(), chain.clone()]
                            .into_iter()
                            .chain(spec.iter().cloned()),
                    )
                })
            })
            .collect()
    }

    /// Policy of a filter chain
    pub fn policy(&self, family: Family, chain: &str) -> Option<String> {
        let mut state = self.lock();
        state.table(family, "filter").policies.get(chain).cloned()
    }

    /// Every rule executed so far, including failed ones
    pub fn history(&self) -> Vec<(Family, Rule)> {
        self.lock().history.clone()
    }

    fn fail(message: impl Into<String>) -> BackendError {
        BackendError::Failed {
            program: PROGRAM,
            status: 1,
            stderr: message.into(),
        }
    }

    fn apply(state: &mut State, family: Family, tokens: &[String]) -> Result<(), BackendError> {
        let (table_name, rest) = match tokens {
            [flag, table, rest @ ..] if flag == "-t" || flag == "--table" => (table.as_str(), rest),
            rest => ("filter", rest),
        };
        let table = state.table(family, table_name);

        match rest {
            [cmd, chain, spec @ ..] if cmd == "-A" => {
                table.chain_mut(chain).push(spec.to_vec());
                Ok(())
            }
            [cmd, chain, spec @ ..] if cmd == "-I" => {
                let (pos, spec) = match spec.split_first() {
                    Some((pos, tail)) if pos.parse::<usize>().is_ok() => {
                        (pos.parse::<usize>().unwrap_or(1).max(1), tail)
                    }
                    _ => (1, spec),
                };
                let rules = table.chain_mut(chain);
                if pos > rules.len() + 1 {
                    return Err(Self::fail("Index of insertion too big"));
                }
                rules.insert(pos - 1, spec.to_vec());
                Ok(())
            }
            [cmd, chain, spec @ ..] if cmd == "-D" => {
                if let Some(n) = single_index(spec) {
                    let rules = table.chain_mut(chain);
                    if n == 0 || n > rules.len() {
                        return Err(Self::fail("Index of deletion too big"));
                    }
                    rules.remove(n - 1);
                    return Ok(());
                }
                match table.find(chain, spec) {
                    Some(idx) => {
                        table.chain_mut(chain).remove(idx);
                        Ok(())
                    }
                    None => Err(Self::fail("Bad rule (does a matching rule exist in that chain?)")),
                }
            }
            [cmd, chain, spec @ ..] if cmd == "-C" => match table.find(chain, spec) {
                Some(_) => Ok(()),
                None => Err(Self::fail("Bad rule (does a matching rule exist in that chain?)")),
            },
            [cmd] if cmd == "-F" => {
                for (_, rules) in table.chains.iter_mut() {
                    rules.clear();
                }
                Ok(())
            }
            [cmd, chain] if cmd == "-F" => {
                table.chain_mut(chain).clear();
                Ok(())
            }
            [cmd] if cmd == "-X" => {
                table
                    .chains
                    .retain(|(name, _)| BUILTIN_CHAINS.contains(&name.as_str()));
                Ok(())
            }
            [cmd, chain] if cmd == "-X" => {
                table.chains.retain(|(name, _)| name != chain);
                Ok(())
            }
            [cmd, chain] if cmd == "-N" => {
                if table.chains.iter().any(|(name, _)| name == chain) {
                    return Err(Self::fail("Chain already exists"));
                }
                table.chains.push((chain.clone(), Vec::new()));
                Ok(())
            }
            [cmd, chain, target] if cmd == "-P" => {
                if !BUILTIN_CHAINS.contains(&chain.as_str()) {
                    return Err(Self::fail("Bad built-in chain name"));
                }
                table.policies.insert(chain.clone(), target.clone());
                Ok(())
            }
            [cmd, ..] if cmd == "-Z" => Ok(()),
            _ => Err(BackendError::Failed {
                program: PROGRAM,
                status: 2,
                stderr: format!("unsupported rule: {}", Rule::new(tokens.iter().cloned())),
            }),
        }
    }
}

impl FilterBackend for MemoryBackend {
    fn execute(&self, family: Family, rule: &Rule) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.history.push((family, rule.clone()));
        Self::apply(&mut state, family, rule.tokens())
    }

    fn list(&self, family: Family) -> Result<String, BackendError> {
        let mut state = self.lock();
        let table = state.table(family, "filter").clone();
        let mut out = String::new();

        for chain in BUILTIN_CHAINS {
            let policy = table.policies.get(*chain).map_or("ACCEPT", String::as_str);
            out.push_str(&format!("-P {chain} {policy}\n"));
        }
        for (chain, _) in &table.chains {
            if !BUILTIN_CHAINS.contains(&chain.as_str()) {
                out.push_str(&format!("-N {chain}\n"));
            }
        }
        for (chain, rules) in &table.chains {
            for spec in rules {
                let listed = Rule::new(
                    ["-A".to_string(), chain.clone()]
                        .into_iter()
                        .chain(with_host_prefixes(spec, family)),
                );
                out.push_str(&format!("{listed}\n"));
            }
        }
        Ok(out)
    }
}

/// `-D chain <n>` deletes by rule number
fn single_index(spec: &[String]) -> Option<usize> {
    match spec {
        [num] => num.parse().ok(),
        _ => None,
    }
}

/// Render addresses the way the filter tool lists them (`1.2.3.4/32`)
fn with_host_prefixes(spec: &[String], family: Family) -> Vec<String> {
    let mut out = Vec::with_capacity(spec.len());
    let mut address_next = false;
    for token in spec {
        if address_next && !token.contains('/') && token.parse::<IpAddr>().is_ok() {
            out.push(format!("{token}{}", family.host_suffix()));
        } else {
            out.push(token.clone());
        }
        address_next = matches!(
            token.as_str(),
            "-s" | "-d" | "--source" | "--destination"
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(tokens: &[&str]) -> Rule {
        Rule::new(tokens.iter().copied())
    }

    #[test]
    fn test_append_check_delete() {
        let fw = MemoryBackend::new();
        let r = rule(&["-A", "OUTPUT", "-d", "1.2.3.4", "-j", "ACCEPT"]);

        fw.execute(Family::V4, &r).unwrap();
        assert!(fw.execute(Family::V4, &r.check_form().unwrap()).is_ok());

        fw.execute(Family::V4, &r.delete_form().unwrap()).unwrap();
        assert!(fw.execute(Family::V4, &r.check_form().unwrap()).is_err());
        assert!(fw.active_rules(Family::V4).is_empty());
    }

    #[test]
    fn test_insert_position() {
        let fw = MemoryBackend::new();
        fw.execute(Family::V4, &rule(&["-A", "OUTPUT", "-o", "lo", "-j", "ACCEPT"]))
            .unwrap();
        fw.execute(Family::V4, &rule(&["-I", "OUTPUT", "1", "-d", "5.5.5.5", "-j", "ACCEPT"]))
            .unwrap();

        let active = fw.active_rules(Family::V4);
        assert_eq!(active[0], rule(&["-A", "OUTPUT", "-d", "5.5.5.5", "-j", "ACCEPT"]));

        let too_far = rule(&["-I", "INPUT", "3", "-j", "ACCEPT"]);
        assert!(fw.execute(Family::V4, &too_far).is_err());
    }

    #[test]
    fn test_flush_and_policy() {
        let fw = MemoryBackend::new();
        fw.execute(Family::V4, &rule(&["-A", "INPUT", "-i", "lo", "-j", "ACCEPT"])).unwrap();
        fw.execute(Family::V4, &rule(&["-A", "OUTPUT", "-o", "lo", "-j", "ACCEPT"])).unwrap();
        fw.execute(Family::V4, &rule(&["-F", "INPUT"])).unwrap();
        fw.execute(Family::V4, &rule(&["-P", "OUTPUT", "DROP"])).unwrap();

        assert_eq!(fw.active_rules(Family::V4).len(), 1);
        assert_eq!(fw.policy(Family::V4, "OUTPUT").as_deref(), Some("DROP"));
        assert!(fw.execute(Family::V4, &rule(&["-P", "custom", "DROP"])).is_err());
    }

    #[test]
    fn test_families_are_separate() {
        let fw = MemoryBackend::new();
        fw.execute(Family::V6, &rule(&["-A", "OUTPUT", "-j", "DROP"])).unwrap();
        assert!(fw.active_rules(Family::V4).is_empty());
        assert_eq!(fw.active_rules(Family::V6).len(), 1);
    }

    #[test]
    fn test_listing_format() {
        let fw = MemoryBackend::new();
        fw.execute(Family::V4, &rule(&["-N", "vigil"])).unwrap();
        fw.execute(Family::V4, &rule(&["-A", "OUTPUT", "-d", "9.9.9.9", "-j", "ACCEPT"]))
            .unwrap();

        let listing = fw.list(Family::V4).unwrap();
        let lines: Vec<&str> = listing.lines().collect();
        assert_eq!(lines[0], "-P INPUT ACCEPT");
        assert_eq!(lines[3], "-N vigil");
        assert_eq!(lines[4], "-A OUTPUT -d 9.9.9.9/32 -j ACCEPT");
    }

    #[test]
    fn test_unsupported_rule() {
        let fw = MemoryBackend::new();
        assert!(fw.execute(Family::V4, &rule(&["--bogus"])).is_err());
        assert_eq!(fw.history().len(), 1);
    }
}
