//! Crate-level scenario test: Port Discovery driving the Port Registry end
//! to end with fake relay/management collaborators, the way the teacher's
//! `state.rs` exercised `AppState` under concurrent access but here across
//! module boundaries instead of within one struct.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tunnel_broker::error::BrokerError;
use tunnel_broker::ports::{
    discover_all, find, DiscoveryDeps, ManagementPortSource, PortRegistry, RelayPortSource,
    TunnelPortEntry,
};

struct FakeRelay {
    tunnel_ports: Vec<TunnelPortEntry>,
    listeners: HashMap<u16, u16>,
}

#[async_trait]
impl RelayPortSource for FakeRelay {
    fn tunnel_object_ports(&self) -> Vec<TunnelPortEntry> {
        self.tunnel_ports.clone()
    }

    fn listeners(&self) -> HashMap<u16, u16> {
        self.listeners.clone()
    }

    async fn wait_for_forwarded(&self, remote_port: u16, _deadline: Duration) -> Option<u16> {
        self.listeners.iter().find_map(|(l, r)| (*r == remote_port).then_some(*l))
    }
}

struct FakeManagement {
    entries: Vec<TunnelPortEntry>,
}

#[async_trait]
impl ManagementPortSource for FakeManagement {
    async fn list_ports(&self, _manage_token: &str) -> Result<Vec<TunnelPortEntry>, BrokerError> {
        Ok(self.entries.clone())
    }
}

#[tokio::test]
async fn discover_all_merges_tunnel_object_and_management_strategies() {
    let relay = FakeRelay {
        tunnel_ports: vec![TunnelPortEntry {
            port_number: 16634,
            forwarding_uri: Some("https://relay.example:41000/".to_string()),
            protocol: Some("tcp".to_string()),
        }],
        listeners: HashMap::new(),
    };
    let management = FakeManagement {
        entries: vec![TunnelPortEntry {
            port_number: 2222,
            forwarding_uri: Some("https://relay.example:42000/".to_string()),
            protocol: Some("ssh".to_string()),
        }],
    };

    let deps = DiscoveryDeps {
        relay: &relay,
        management: &management,
        manage_token: "manage-token",
        trace: None,
    };

    let mappings = discover_all(&deps).await;
    assert_eq!(mappings.len(), 2);

    let registry = PortRegistry::new();
    registry.upsert(mappings).await;
    let snapshot = registry.snapshot().await;

    assert_eq!(snapshot.rpc.as_ref().unwrap().local_port, 41000);
    assert_eq!(snapshot.ssh.as_ref().unwrap().local_port, 42000);
}

#[tokio::test]
async fn find_prefers_wait_for_forwarded_over_tunnel_object() {
    let mut listeners = HashMap::new();
    listeners.insert(51000u16, 16634u16);

    let relay = FakeRelay {
        tunnel_ports: vec![TunnelPortEntry {
            port_number: 16634,
            forwarding_uri: Some("https://relay.example:41000/".to_string()),
            protocol: Some("tcp".to_string()),
        }],
        listeners,
    };
    let management = FakeManagement { entries: vec![] };

    let deps = DiscoveryDeps {
        relay: &relay,
        management: &management,
        manage_token: "manage-token",
        trace: None,
    };

    let registry = PortRegistry::new();
    let found = find(16634, Duration::from_secs(1), &deps, &registry).await;
    assert_eq!(found, Some(51000));
}

#[tokio::test]
async fn find_returns_none_when_no_strategy_and_no_probe_candidates() {
    let relay = FakeRelay {
        tunnel_ports: vec![],
        listeners: HashMap::new(),
    };
    let management = FakeManagement { entries: vec![] };

    let deps = DiscoveryDeps {
        relay: &relay,
        management: &management,
        manage_token: "manage-token",
        trace: None,
    };

    let registry = PortRegistry::new();
    // 9999 is not the RPC port and not an SSH port, so there is no fallback
    // probe list, and no strategy produces a mapping for it.
    let found = find(9999, Duration::from_millis(50), &deps, &registry).await;
    assert_eq!(found, None);
}
