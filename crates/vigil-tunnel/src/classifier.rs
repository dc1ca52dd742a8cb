//! OpenVPN Output Classifier
//!
//! Maps one line of tunnel output to the event that drives the
//! connection state machine. Matching is table-driven: the first pattern
//! whose marker occurs in the line wins.
//!
//! | Marker | Event |
//! |---|---|
//! | `SIGTERM[hard,] received, process exiting` | [`LineEvent::HardTermination`] |
//! | `SIGTERM[soft,auth-failure]` | [`LineEvent::AuthFailure`] |
//! | `Initialization Sequence Completed` | [`LineEvent::HandshakeComplete`] |
//! | `TUN/TAP device` | [`LineEvent::InterfaceAssigned`] |
//! | `PUSH: Received control message:` | [`LineEvent::DnsPush`] (if it carries DNS options) |
//! | `Restart pause` | [`LineEvent::RetryPause`] |

use std::net::IpAddr;

/// Marks the end of a tunnel's output after a termination signal
pub const HARD_TERMINATION: &str = "SIGTERM[hard,] received, process exiting";

/// Most DNS servers taken from one pushed control message
pub const MAX_PUSHED_DNS: usize = 2;

/// Event derived from one output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    HandshakeComplete,
    /// Name of the tunnel interface
    InterfaceAssigned(String),
    /// DNS servers pushed by the server (one or two)
    DnsPush(Vec<IpAddr>),
    /// The tunnel binary is retrying on its own
    RetryPause,
    AuthFailure,
    HardTermination,
    /// Nothing the state machine cares about
    Other,
}

struct LinePattern {
    marker: &'static str,
    classify: fn(&str) -> LineEvent,
}

const PATTERNS: &[LinePattern] = &[
    LinePattern {
        marker: HARD_TERMINATION,
        classify: |_| LineEvent::HardTermination,
    },
    LinePattern {
        marker: "SIGTERM[soft,auth-failure]",
        classify: |_| LineEvent::AuthFailure,
    },
    LinePattern {
        marker: "Initialization Sequence Completed",
        classify: |_| LineEvent::HandshakeComplete,
    },
    LinePattern {
        marker: "TUN/TAP device",
        classify: interface_name,
    },
    LinePattern {
        marker: "PUSH: Received control message:",
        classify: pushed_dns,
    },
    LinePattern {
        marker: "Restart pause",
        classify: |_| LineEvent::RetryPause,
    },
];

/// Classify one line of tunnel output
pub fn classify(line: &str) -> LineEvent {
    PATTERNS
        .iter()
        .find(|p| line.contains(p.marker))
        .map(|p| (p.classify)(line))
        .unwrap_or(LineEvent::Other)
}

/// `... TUN/TAP device tun0 opened`
fn interface_name(line: &str) -> LineEvent {
    line.split("TUN/TAP device")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .map(|name| LineEvent::InterfaceAssigned(name.to_string()))
        .unwrap_or(LineEvent::Other)
}

/// `PUSH: Received control message: 'PUSH_REPLY,dhcp-option DNS 10.8.0.1,...'`
fn pushed_dns(line: &str) -> LineEvent {
    let servers: Vec<IpAddr> = line
        .split(',')
        .filter_map(|option| {
            let mut words = option.trim().trim_matches('\'').split_whitespace();
            match (words.next(), words.next(), words.next()) {
                (Some("dhcp-option"), Some("DNS" | "DNS6"), Some(addr)) => {
                    addr.trim_matches(|c| c == '\'' || c == '"').parse().ok()
                }
                _ => None,
            }
        })
        .take(MAX_PUSHED_DNS)
        .collect();

    if servers.is_empty() {
        LineEvent::Other
    } else {
        LineEvent::DnsPush(servers)
    }
}
