//! Port Discovery (C3).
//!
//! Given a live relay handle and the tunnel's management-API client, merges
//! mappings from the four ordered strategies of spec §4.3. The Registry
//! resolves priority between strategies; this module only concatenates.
//!
//! Grounded on the dev-tunnels reference file's `TunnelPort`/relay-port
//! accessors for strategies 1 and 3, and on the teacher's plain-string
//! parsing style (`tunnl/src/proxy.rs`'s `extract_subdomain`) generalized to
//! the URI-port regex the spec names explicitly.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use regex::Regex;
use std::sync::OnceLock;
use tokio::net::TcpStream;

use crate::config;
use crate::error::BrokerError;

use super::{trace::TraceTap, PortMapping, Protocol, Source};

/// One entry from the tunnel object's embedded port array, or from the
/// management API's list-ports response. Both shapes are identical on the
/// wire (`portNumber` + an optional `forwardingUri` the relay publishes).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TunnelPortEntry {
    #[serde(rename = "portNumber")]
    pub port_number: u16,
    #[serde(rename = "forwardingUri")]
    pub forwarding_uri: Option<String>,
    #[serde(default, rename = "protocol")]
    pub protocol: Option<String>,
}

/// Strategy 1 + strategy 4 (targeted `wait_for_forwarded`) collaborator: the
/// relay client. Implemented by `crate::relay::RelayHandle`.
#[async_trait]
pub trait RelayPortSource: Send + Sync {
    /// Walk the tunnel's embedded port array (strategy 1).
    fn tunnel_object_ports(&self) -> Vec<TunnelPortEntry>;

    /// Snapshot of the forwarding service's listener table: local_port ->
    /// remote_port (strategy 3).
    fn listeners(&self) -> HashMap<u16, u16>;

    /// Ask the relay to wait for `remote_port` to be forwarded, returning the
    /// local port it was bound to, if any, within `deadline`.
    async fn wait_for_forwarded(&self, remote_port: u16, deadline: Duration) -> Option<u16>;
}

/// Strategy 2 collaborator: the provider's manage-scope list-ports endpoint.
/// Implemented by `crate::provider::ProviderClient`.
#[async_trait]
pub trait ManagementPortSource: Send + Sync {
    async fn list_ports(&self, manage_token: &str) -> Result<Vec<TunnelPortEntry>, BrokerError>;
}

pub struct DiscoveryDeps<'a> {
    pub relay: &'a dyn RelayPortSource,
    pub management: &'a dyn ManagementPortSource,
    pub manage_token: &'a str,
    pub trace: Option<&'a TraceTap>,
}

fn port_uri_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Anchored to the end so a path segment after the port (`:41000/path`)
    // does not get mistaken for a trailing port.
    RE.get_or_init(|| Regex::new(r":(\d+)/?$").expect("valid regex"))
}

fn extract_port(uri: &str) -> Option<u16> {
    port_uri_regex().captures(uri)?.get(1)?.as_str().parse().ok()
}

fn protocol_of(entry: &TunnelPortEntry) -> Protocol {
    entry
        .protocol
        .as_deref()
        .map(Protocol::from_keyword)
        .unwrap_or(Protocol::Unknown)
}

fn mappings_from_entries(entries: &[TunnelPortEntry], source: Source) -> Vec<PortMapping> {
    entries
        .iter()
        .filter_map(|entry| {
            let uri = entry.forwarding_uri.as_deref()?;
            let local_port = extract_port(uri)?;
            Some(PortMapping::new(
                local_port,
                entry.port_number,
                protocol_of(entry),
                source,
            ))
        })
        .collect()
}

/// Run strategies 1–3 and return their concatenated results. The Registry
/// resolves priority; ordering here does not matter.
pub async fn discover_all(deps: &DiscoveryDeps<'_>) -> Vec<PortMapping> {
    let mut mappings = Vec::new();

    // Strategy 1: tunnel object.
    let tunnel_entries = deps.relay.tunnel_object_ports();
    mappings.extend(mappings_from_entries(&tunnel_entries, Source::TunnelObject));

    // Strategy 2: management API.
    match deps.management.list_ports(deps.manage_token).await {
        Ok(entries) => mappings.extend(mappings_from_entries(&entries, Source::ManagementApi)),
        Err(e) => warn!("management API port listing failed: {}", e),
    }

    // Strategy 3: forwarding-service listeners.
    for (local_port, remote_port) in deps.relay.listeners() {
        mappings.push(PortMapping::new(
            local_port,
            remote_port,
            Protocol::Unknown,
            Source::Listeners,
        ));
    }

    debug!("port discovery (all strategies) found {} mappings", mappings.len());
    mappings
}

/// Targeted discovery for a single remote port, per §4.3's `find`.
pub async fn find(
    remote_port: u16,
    deadline: Duration,
    deps: &DiscoveryDeps<'_>,
    registry: &super::PortRegistry,
) -> Option<u16> {
    if let Some(local_port) = deps.relay.wait_for_forwarded(remote_port, deadline).await {
        registry
            .upsert(vec![PortMapping::new(
                local_port,
                remote_port,
                Protocol::Unknown,
                Source::WaitForForwarded,
            )])
            .await;
        return Some(local_port);
    }

    // Refresh the registry from the ordered strategies and search again.
    let fresh = discover_all(deps).await;
    registry.upsert(fresh).await;
    let snapshot = registry.snapshot().await;
    if let Some(found) = find_in_snapshot(&snapshot, remote_port) {
        return Some(found);
    }

    // Trace fallback: only if the other strategies came up empty.
    if let Some(tap) = deps.trace {
        if let Some(local_port) = tap.find_local_port_for_remote(remote_port).await {
            registry
                .upsert(vec![PortMapping::new(
                    local_port,
                    remote_port,
                    Protocol::Unknown,
                    Source::TraceFallback,
                )])
                .await;
            return Some(local_port);
        }
    }

    // Probe the fixed fallback list.
    let candidates: &[u16] = if remote_port == config::RPC_REMOTE_PORT {
        config::DEFAULT_RPC_FALLBACK_PORTS
    } else if config::SSH_REMOTE_PORTS.contains(&remote_port) {
        config::DEFAULT_SSH_FALLBACK_PORTS
    } else {
        &[]
    };

    for &candidate in candidates {
        if probe_tcp(candidate).await {
            return Some(candidate);
        }
    }

    None
}

fn find_in_snapshot(
    snapshot: &super::PortRegistrySnapshot,
    remote_port: u16,
) -> Option<u16> {
    if let Some(m) = &snapshot.rpc {
        if m.remote_port == remote_port {
            return Some(m.local_port);
        }
    }
    if let Some(m) = &snapshot.ssh {
        if m.remote_port == remote_port {
            return Some(m.local_port);
        }
    }
    snapshot
        .user
        .iter()
        .chain(snapshot.management.iter())
        .find(|m| m.remote_port == remote_port)
        .map(|m| m.local_port)
}

async fn probe_tcp(local_port: u16) -> bool {
    let addr = format!("127.0.0.1:{}", local_port);
    matches!(
        tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(&addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_port_matches_trailing_port() {
        assert_eq!(extract_port("https://host:41000/"), Some(41000));
        assert_eq!(extract_port("https://host:41000"), Some(41000));
        assert_eq!(extract_port("https://host:41000/path"), None);
        assert_eq!(extract_port("https://host/no-port"), None);
    }

    #[test]
    fn protocol_inference_is_case_insensitive() {
        assert_eq!(Protocol::from_keyword("SSH"), Protocol::Ssh);
        assert_eq!(Protocol::from_keyword("Http"), Protocol::Http);
        assert_eq!(Protocol::from_keyword("tcp"), Protocol::Tcp);
        assert_eq!(Protocol::from_keyword("carrier-pigeon"), Protocol::Unknown);
    }

    #[test]
    fn mappings_from_entries_skips_entries_without_uri() {
        let entries = vec![
            TunnelPortEntry {
                port_number: 22,
                forwarding_uri: Some("https://host:2222/".to_string()),
                protocol: Some("ssh".to_string()),
            },
            TunnelPortEntry {
                port_number: 80,
                forwarding_uri: None,
                protocol: None,
            },
        ];
        let mappings = mappings_from_entries(&entries, Source::TunnelObject);
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].local_port, 2222);
        assert_eq!(mappings[0].remote_port, 22);
    }
}
