//! Port management: the Port Registry (C2), Port Discovery (C3), and the
//! Trace Tap (C4).

pub mod discovery;
pub mod registry;
pub mod trace;

pub use discovery::{
    discover_all, find, DiscoveryDeps, ManagementPortSource, RelayPortSource, TunnelPortEntry,
};
pub use registry::{PortMapping, PortRegistry, PortRegistrySnapshot};
pub use trace::{TraceCategory, TraceEvent, TraceTap};

/// Protocol of a forwarded port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ssh,
    Http,
    Https,
    Tcp,
    Unknown,
}

impl Protocol {
    pub fn from_keyword(s: &str) -> Self {
        let lower = s.to_ascii_lowercase();
        if lower.contains("ssh") {
            Protocol::Ssh
        } else if lower.contains("https") {
            Protocol::Https
        } else if lower.contains("http") {
            Protocol::Http
        } else if lower.contains("tcp") {
            Protocol::Tcp
        } else {
            Protocol::Unknown
        }
    }
}

/// What a mapping is used for, derived from its remote port (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Rpc,
    Ssh,
    User,
    Management,
}

impl Category {
    pub fn classify(remote_port: u16) -> Self {
        if remote_port == crate::config::RPC_REMOTE_PORT {
            Category::Rpc
        } else if crate::config::SSH_REMOTE_PORTS.contains(&remote_port) {
            Category::Ssh
        } else if crate::config::MANAGEMENT_REMOTE_PORT_RANGE.contains(&remote_port) {
            Category::Management
        } else {
            Category::User
        }
    }
}

/// Where a mapping came from, also the tie-break priority order (highest
/// first) per §3's invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    TraceFallback,
    ManagementApi,
    TunnelObject,
    WaitForForwarded,
    Listeners,
}

impl Source {
    /// Higher is higher priority. Declaration order above is lowest-to-highest
    /// so `Ord` derives the right comparison directly.
    pub fn priority(self) -> u8 {
        self as u8
    }
}
