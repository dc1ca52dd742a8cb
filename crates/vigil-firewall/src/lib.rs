//! Vigil Firewall - Kill-Switch Rule Reconciliation
//!
//! Applies the packet-filter rule sets that make up the kill switch,
//! without taking exclusive ownership of the kernel filter tables.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   load    ┌──────────────────┐   execute / list   ┌───────────────┐
//! │  RuleStore   │──────────▶│  FirewallEngine  │───────────────────▶│ FilterBackend │
//! │ (JSON files) │           │                  │                    │ iptables /    │
//! └──────────────┘           │ snapshot foreign │◀───────────────────│ in-memory     │
//!                            │ flush, replay    │    `-S` listing    └───────────────┘
//!                            │ defaults, allow  │
//!                            └──────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Idempotent**: append/insert rules are checked for existence first
//! - **Foreign-rule preservation**: rules installed by other tools survive a flush
//! - **Best effort**: one failing rule never aborts the rest of a batch

mod backend;
mod engine;
mod memory;
mod rule;
mod store;

pub use backend::{BackendError, FilterBackend, IptablesBackend};
pub use engine::{Exception, FirewallEngine, ForeignRuleSnapshot, RuleOutcome};
pub use memory::MemoryBackend;
pub use rule::{Action, Family, Rule};
pub use store::{FirewallError, Mode, RuleSet, RuleStore};
