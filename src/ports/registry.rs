//! Port Registry (C2).
//!
//! Maintains the authoritative in-memory map of forwarded ports. Grounded on
//! the teacher's `AppState` (`tunnl/src/state.rs`): an `RwLock`-guarded map
//! with async accessor methods that return owned clones, so readers always
//! see a consistent snapshot without holding the lock. The subscription
//! fanout is new — built on `tokio::sync::watch`, the same primitive the
//! dev-tunnels reference file uses for its `ports_tx`/`ports_rx` pair.

use std::collections::HashMap;
use std::time::SystemTime;

use log::debug;
use tokio::sync::watch;
use tokio::sync::RwLock;

use super::{Category, Protocol, Source};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PortMapping {
    pub local_port: u16,
    pub remote_port: u16,
    pub protocol: Protocol,
    pub category: Category,
    pub source: Source,
    pub is_active: bool,
}

impl PortMapping {
    pub fn new(local_port: u16, remote_port: u16, protocol: Protocol, source: Source) -> Self {
        Self {
            local_port,
            remote_port,
            protocol,
            category: Category::classify(remote_port),
            source,
            is_active: true,
        }
    }
}

/// Immutable value delivered to subscribers on every registry change.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PortRegistrySnapshot {
    pub rpc: Option<PortMapping>,
    pub ssh: Option<PortMapping>,
    pub user: Vec<PortMapping>,
    pub management: Vec<PortMapping>,
    #[serde(skip)]
    pub last_updated: Option<SystemTime>,
}

/// Key used for uniqueness/priority resolution: `(local_port, remote_port)`.
type Key = (u16, u16);

struct Inner {
    mappings: HashMap<Key, PortMapping>,
}

pub struct PortRegistry {
    inner: RwLock<Inner>,
    tx: watch::Sender<PortRegistrySnapshot>,
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PortRegistry {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PortRegistrySnapshot::default());
        Self {
            inner: RwLock::new(Inner {
                mappings: HashMap::new(),
            }),
            tx,
        }
    }

    /// O(1) clone of the current immutable view.
    pub async fn snapshot(&self) -> PortRegistrySnapshot {
        self.tx.borrow().clone()
    }

    /// Apply priority rules from §3 and publish an updated snapshot.
    pub async fn upsert(&self, mappings: Vec<PortMapping>) {
        if mappings.is_empty() {
            return;
        }
        let mut guard = self.inner.write().await;
        for mapping in mappings {
            let key = (mapping.local_port, mapping.remote_port);
            match guard.mappings.get(&key) {
                Some(existing) if existing.source.priority() > mapping.source.priority() => {
                    // Lower-priority source loses; keep the existing mapping.
                }
                _ => {
                    guard.mappings.insert(key, mapping);
                }
            }
        }
        self.publish(&guard);
    }

    /// Remove any mapping whose `local_port` matches.
    pub async fn remove(&self, local_port: u16) {
        let mut guard = self.inner.write().await;
        let before = guard.mappings.len();
        guard.mappings.retain(|k, _| k.0 != local_port);
        if guard.mappings.len() != before {
            self.publish(&guard);
        }
    }

    /// Deliver a snapshot on every change. The returned receiver always
    /// yields the full current snapshot; callers that `.changed().await`
    /// then `.borrow()` see at-least-once delivery with the latest value,
    /// matching §4.2's "coalescing is permitted" guarantee.
    pub fn subscribe(&self) -> watch::Receiver<PortRegistrySnapshot> {
        self.tx.subscribe()
    }

    fn publish(&self, guard: &Inner) {
        let mut snapshot = PortRegistrySnapshot {
            last_updated: Some(SystemTime::now()),
            ..Default::default()
        };
        for mapping in guard.mappings.values() {
            match mapping.category {
                Category::Rpc => snapshot.rpc = Some(mapping.clone()),
                Category::Ssh => snapshot.ssh = Some(mapping.clone()),
                Category::Management => snapshot.management.push(mapping.clone()),
                Category::User => snapshot.user.push(mapping.clone()),
            }
        }
        debug!(
            "port registry updated: rpc={:?} ssh={:?} user={} management={}",
            snapshot.rpc.as_ref().map(|m| m.local_port),
            snapshot.ssh.as_ref().map(|m| m.local_port),
            snapshot.user.len(),
            snapshot.management.len()
        );
        // A send error means there are no subscribers left; that's fine.
        let _ = self.tx.send(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(local: u16, remote: u16, source: Source) -> PortMapping {
        PortMapping::new(local, remote, Protocol::Tcp, source)
    }

    #[tokio::test]
    async fn upsert_classifies_rpc_and_ssh_slots() {
        let registry = PortRegistry::new();
        registry
            .upsert(vec![
                mapping(41000, 16634, Source::TunnelObject),
                mapping(42000, 2222, Source::TunnelObject),
            ])
            .await;
        let snap = registry.snapshot().await;
        assert_eq!(snap.rpc.unwrap().local_port, 41000);
        assert_eq!(snap.ssh.unwrap().local_port, 42000);
    }

    #[tokio::test]
    async fn higher_priority_source_wins_on_conflict() {
        let registry = PortRegistry::new();
        registry
            .upsert(vec![mapping(9000, 3000, Source::TraceFallback)])
            .await;
        registry
            .upsert(vec![mapping(9000, 3000, Source::Listeners)])
            .await;
        let snap = registry.snapshot().await;
        assert_eq!(snap.user[0].source, Source::Listeners);
    }

    #[tokio::test]
    async fn lower_priority_source_does_not_overwrite() {
        let registry = PortRegistry::new();
        registry
            .upsert(vec![mapping(9000, 3000, Source::Listeners)])
            .await;
        registry
            .upsert(vec![mapping(9000, 3000, Source::TraceFallback)])
            .await;
        let snap = registry.snapshot().await;
        assert_eq!(snap.user[0].source, Source::Listeners);
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let registry = PortRegistry::new();
        let batch = vec![mapping(9000, 3000, Source::TunnelObject)];
        registry.upsert(batch.clone()).await;
        registry.upsert(batch).await;
        let snap = registry.snapshot().await;
        assert_eq!(snap.user.len(), 1);
    }

    #[tokio::test]
    async fn remove_clears_rpc_and_ssh_slots() {
        let registry = PortRegistry::new();
        registry
            .upsert(vec![mapping(41000, 16634, Source::TunnelObject)])
            .await;
        registry.remove(41000).await;
        let snap = registry.snapshot().await;
        assert!(snap.rpc.is_none());
    }

    #[tokio::test]
    async fn subscribers_receive_full_snapshots() {
        let registry = PortRegistry::new();
        let mut rx = registry.subscribe();
        registry
            .upsert(vec![mapping(9000, 3000, Source::TunnelObject)])
            .await;
        rx.changed().await.unwrap();
        let snap = rx.borrow().clone();
        assert_eq!(snap.user.len(), 1);
    }

    #[tokio::test]
    async fn empty_upsert_is_a_no_op() {
        let registry = PortRegistry::new();
        registry.upsert(vec![]).await;
        let snap = registry.snapshot().await;
        assert!(snap.last_updated.is_none());
    }
}
