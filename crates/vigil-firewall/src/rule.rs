//! Packet-Filter Rules
//!
//! A rule is the argument vector of one `iptables`/`ip6tables` call,
//! e.g. `["-A", "OUTPUT", "-d", "1.2.3.4", "-j", "ACCEPT"]`.
//!
//! Two rules are the same rule when their tokens form the same multiset,
//! so `-d 1.2.3.4 -j ACCEPT` and `-j ACCEPT -d 1.2.3.4` compare equal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Address family a rule belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Both families, v4 first
    pub fn all() -> &'static [Family] {
        &[Family::V4, Family::V6]
    }

    /// Family of an address
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// Filter tool for this family
    pub fn program(&self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }

    /// Prefix suffix the filter tool appends to single-host addresses
    pub fn host_suffix(&self) -> &'static str {
        match self {
            Family::V4 => "/32",
            Family::V6 => "/128",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

/// What a rule does to its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// `-A chain ...`
    Append,
    /// `-I chain [pos] ...`
    Insert,
    /// `-D chain ...`
    Delete,
    /// `-C chain ...`
    Check,
    /// Anything else (`-F`, `-P`, `-N`, `-X`, ...)
    Other,
}

impl Action {
    fn from_flag(flag: &str) -> Self {
        match flag {
            "-A" | "--append" => Action::Append,
            "-I" | "--insert" => Action::Insert,
            "-D" | "--delete" => Action::Delete,
            "-C" | "--check" => Action::Check,
            _ => Action::Other,
        }
    }
}

/// One packet-filter directive
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rule(Vec<String>);

impl Rule {
    /// Create a rule from tokens
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tokens.into_iter().map(Into::into).collect())
    }

    /// Parse one line of `iptables -S` output
    ///
    /// Returns `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let tokens = split_line(line);
        if tokens.is_empty() {
            None
        } else {
            Some(Self(tokens))
        }
    }

    /// Raw tokens
    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    /// Is the rule empty?
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Index of the action flag (`-A`, `-I`, ...), skipping a leading `-t <table>`
    fn action_index(&self) -> usize {
        match self.0.first().map(String::as_str) {
            Some("-t") | Some("--table") => 2,
            _ => 0,
        }
    }

    /// Action of this rule
    pub fn action(&self) -> Action {
        self.0
            .get(self.action_index())
            .map(|flag| Action::from_flag(flag))
            .unwrap_or(Action::Other)
    }

    /// Order-insensitive, multiplicity-sensitive comparison
    pub fn is_equivalent(&self, other: &Rule) -> bool {
        if self.0.len() != other.0.len() {
            return false;
        }
        let mut a: Vec<&str> = self.0.iter().map(String::as_str).collect();
        let mut b: Vec<&str> = other.0.iter().map(String::as_str).collect();
        a.sort_unstable();
        b.sort_unstable();
        a == b
    }

    /// Existence-check form of an append/insert rule
    ///
    /// `-I OUTPUT 1 -d x -j ACCEPT` becomes `-C OUTPUT -d x -j ACCEPT`.
    /// Returns `None` for every other action.
    pub fn check_form(&self) -> Option<Rule> {
        match self.action() {
            Action::Append | Action::Insert => Some(self.rewrite("-C")),
            _ => None,
        }
    }

    /// Deletion form of an append/insert rule
    pub fn delete_form(&self) -> Option<Rule> {
        match self.action() {
            Action::Append | Action::Insert => Some(self.rewrite("-D")),
            Action::Delete => Some(self.clone()),
            _ => None,
        }
    }

    /// Replace the action flag, dropping an insert position
    fn rewrite(&self, flag: &str) -> Rule {
        let idx = self.action_index();
        let mut tokens = self.0.clone();
        let was_insert = self.action() == Action::Insert;
        tokens[idx] = flag.to_string();

        let pos = idx + 2;
        if was_insert && tokens.get(pos).is_some_and(|t| t.parse::<u32>().is_ok()) {
            tokens.remove(pos);
        }
        Rule(tokens)
    }

    /// Strip the single-host prefix the filter tool adds when listing
    pub(crate) fn without_host_suffix(self, family: Family) -> Rule {
        let suffix = family.host_suffix();
        Rule(
            self.0
                .into_iter()
                .map(|t| match t.strip_suffix(suffix) {
                    Some(addr) if addr.parse::<IpAddr>().is_ok() => addr.to_string(),
                    _ => t,
                })
                .collect(),
        )
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if token.is_empty() || token.contains(char::is_whitespace) {
                write!(f, "\"{}\"", token.replace('"', "\\\""))?;
            } else {
                f.write_str(token)?;
            }
        }
        Ok(())
    }
}

/// Split a line into shell-style words (quotes and backslash escapes)
fn split_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some('"') if c == '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                        in_token = true;
                    }
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }

    if in_token {
        tokens.push(current);
    }
    tokens
}
