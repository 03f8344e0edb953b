//! Network Monitor (C1): publishes an online/offline + link-type stream and
//! supports active connectivity probes. See spec §4 (component table) and
//! §4.8 (auto-sync offline-skip).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkType {
    WiFi,
    Cellular,
    Ethernet,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectiveType {
    #[serde(rename = "4g")]
    FourG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "slow-2g")]
    Slow2G,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    pub online: bool,
    pub link: LinkType,
    pub effective: Option<EffectiveType>,
}

impl NetworkState {
    pub fn offline() -> Self {
        Self {
            online: false,
            link: LinkType::Unknown,
            effective: None,
        }
    }

    pub fn online(link: LinkType) -> Self {
        Self {
            online: true,
            link,
            effective: None,
        }
    }
}

#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    /// Current known state, without necessarily performing a fresh probe.
    fn current(&self) -> NetworkState;

    /// Actively probes connectivity (e.g. a lightweight reachability
    /// request) and updates the published state.
    async fn probe(&self) -> NetworkState;

    /// A stream of state changes, for the engine/scheduler to subscribe to.
    fn subscribe(&self) -> watch::Receiver<NetworkState>;
}

/// A monitor whose state is pushed in by the embedder (platform
/// connectivity callbacks), rather than derived from an active probe.
pub struct ManualNetworkMonitor {
    tx: watch::Sender<NetworkState>,
}

impl ManualNetworkMonitor {
    pub fn new(initial: NetworkState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn set_state(&self, state: NetworkState) {
        let _ = self.tx.send(state);
    }
}

#[async_trait]
impl NetworkMonitor for ManualNetworkMonitor {
    fn current(&self) -> NetworkState {
        *self.tx.borrow()
    }

    async fn probe(&self) -> NetworkState {
        self.current()
    }

    fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_monitor_reflects_pushed_state() {
        let monitor = ManualNetworkMonitor::new(NetworkState::offline());
        assert!(!monitor.current().online);
        monitor.set_state(NetworkState::online(LinkType::WiFi));
        assert!(monitor.current().online);
        assert_eq!(monitor.current().link, LinkType::WiFi);
    }

    #[tokio::test]
    async fn subscribers_observe_transitions() {
        let monitor = ManualNetworkMonitor::new(NetworkState::offline());
        let mut rx = monitor.subscribe();
        monitor.set_state(NetworkState::online(LinkType::Cellular));
        rx.changed().await.unwrap();
        assert!(rx.borrow().online);
    }
}
