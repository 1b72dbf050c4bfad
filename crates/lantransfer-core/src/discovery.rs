//! mDNS advertisement of this device and browsing for peers.
//!
//! Announces `_lantransfer._tcp.local.` with the device's friendly name and
//! watches for other instances of the same service. Browse events are
//! consumed on a tokio task, so peer callbacks are always delivered on the
//! owning executor rather than the daemon's native thread.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, TransferError};
use crate::events::DiscoveryEvent;
use crate::util::{self, SERVICE_TYPE};

/// A reachable device on the local network.
#[derive(Debug, Clone, Serialize)]
pub struct Peer {
    /// Human-readable device name from the TXT record.
    pub name: String,
    pub address: Ipv4Addr,
    pub port: u16,
    /// mDNS service instance name; stable while the peer stays registered.
    pub device_id: String,
}

impl Peer {
    /// Base URL of this peer's transfer server.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

// Peer identity is (address, port); the instance name is only the map key.
impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for Peer {}

/// Advertises this device and maintains the table of discovered peers.
pub struct DiscoveryService {
    port: u16,
    device_name: String,
    events: UnboundedSender<DiscoveryEvent>,
    daemon: Option<ServiceDaemon>,
    service_fullname: Option<String>,
    peers: Arc<Mutex<HashMap<String, Peer>>>,
    browse_task: Option<JoinHandle<()>>,
}

impl DiscoveryService {
    pub fn new(port: u16, device_name: String, events: UnboundedSender<DiscoveryEvent>) -> Self {
        Self {
            port,
            device_name,
            events,
            daemon: None,
            service_fullname: None,
            peers: Arc::new(Mutex::new(HashMap::new())),
            browse_task: None,
        }
    }

    /// Currently known peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.lock().unwrap().values().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.daemon.is_some()
    }

    /// Register our service and start browsing for peers.
    pub async fn start(&mut self) -> Result<()> {
        if self.daemon.is_some() {
            return Ok(());
        }

        let local_ip = util::local_ip();
        let daemon = ServiceDaemon::new()
            .map_err(|e| TransferError::Discovery(format!("failed to create mDNS daemon: {e}")))?;

        let properties = [("version", "1.0"), ("device", self.device_name.as_str())];
        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            &self.device_name,
            &format!("{}.local.", self.device_name),
            std::net::IpAddr::V4(local_ip),
            self.port,
            &properties[..],
        )
        .map_err(|e| TransferError::Discovery(format!("invalid service info: {e}")))?;

        let fullname = service_info.get_fullname().to_string();
        daemon
            .register(service_info)
            .map_err(|e| TransferError::Discovery(format!("failed to register service: {e}")))?;
        info!(
            "advertising {} as {} on {}:{}",
            SERVICE_TYPE, self.device_name, local_ip, self.port
        );

        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| TransferError::Discovery(format!("failed to browse: {e}")))?;

        let peers = self.peers.clone();
        let events = self.events.clone();
        let local = (local_ip, self.port);
        let own_fullname = fullname.clone();
        self.browse_task = Some(tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(resolved) => {
                        if resolved.get_fullname() == own_fullname {
                            continue;
                        }
                        upsert_peer(&peers, &events, local, &resolved);
                    }
                    ServiceEvent::ServiceRemoved(_, removed_fullname) => {
                        drop_peer(&peers, &events, &removed_fullname);
                    }
                    other => {
                        debug!("mDNS browse event: {:?}", other);
                    }
                }
            }
        }));

        self.daemon = Some(daemon);
        self.service_fullname = Some(fullname);
        Ok(())
    }

    /// Unregister our service, stop browsing, and clear the peer table.
    pub async fn stop(&mut self) {
        if let Some(task) = self.browse_task.take() {
            task.abort();
        }
        if let Some(daemon) = self.daemon.take() {
            if let Some(fullname) = self.service_fullname.take() {
                if let Err(e) = daemon.unregister(&fullname) {
                    warn!("failed to unregister mDNS service: {}", e);
                }
            }
            if let Err(e) = daemon.shutdown() {
                warn!("failed to shut down mDNS daemon: {}", e);
            }
        }
        self.peers.lock().unwrap().clear();
        info!("discovery stopped");
    }
}

/// Insert or refresh a resolved peer. A changed address, port, or device
/// name is treated as remove-then-add so listeners see a consistent
/// lifecycle. `Peer` equality is identity only (address, port); change
/// detection here must also cover renames.
fn upsert_peer(
    peers: &Mutex<HashMap<String, Peer>>,
    events: &UnboundedSender<DiscoveryEvent>,
    local: (Ipv4Addr, u16),
    info: &ServiceInfo,
) {
    let Some(address) = info.get_addresses().iter().find_map(|addr| match addr {
        IpAddr::V4(v4) => Some(*v4),
        IpAddr::V6(_) => None,
    }) else {
        debug!("service {} resolved without an IPv4 address", info.get_fullname());
        return;
    };
    let port = info.get_port();
    if (address, port) == local {
        return;
    }

    let fullname = info.get_fullname().to_string();
    let peer = Peer {
        name: info
            .get_property_val_str("device")
            .unwrap_or(&fullname)
            .to_string(),
        address,
        port,
        device_id: fullname.clone(),
    };

    let mut table = peers.lock().unwrap();
    match table.get(&fullname) {
        Some(existing) if *existing == peer && existing.name == peer.name => {}
        Some(existing) => {
            let _ = events.send(DiscoveryEvent::PeerRemoved(existing.clone()));
            info!("peer updated: {} at {}:{}", peer.name, address, port);
            table.insert(fullname, peer.clone());
            let _ = events.send(DiscoveryEvent::PeerAdded(peer));
        }
        None => {
            info!("peer added: {} at {}:{}", peer.name, address, port);
            table.insert(fullname, peer.clone());
            let _ = events.send(DiscoveryEvent::PeerAdded(peer));
        }
    }
}

fn drop_peer(
    peers: &Mutex<HashMap<String, Peer>>,
    events: &UnboundedSender<DiscoveryEvent>,
    fullname: &str,
) {
    if let Some(peer) = peers.lock().unwrap().remove(fullname) {
        info!("peer removed: {} at {}:{}", peer.name, peer.address, peer.port);
        let _ = events.send(DiscoveryEvent::PeerRemoved(peer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn resolved(instance: &str, device: &str, ip: &str, port: u16) -> ServiceInfo {
        ServiceInfo::new(
            SERVICE_TYPE,
            instance,
            &format!("{instance}.local."),
            ip,
            port,
            &[("version", "1.0"), ("device", device)][..],
        )
        .unwrap()
    }

    #[test]
    fn peer_url_and_identity() {
        let a = Peer {
            name: "alpha".into(),
            address: "192.168.1.42".parse().unwrap(),
            port: 8765,
            device_id: "alpha._lantransfer._tcp.local.".into(),
        };
        let b = Peer {
            name: "renamed".into(),
            address: "192.168.1.42".parse().unwrap(),
            port: 8765,
            device_id: "other._lantransfer._tcp.local.".into(),
        };
        assert_eq!(a.url(), "http://192.168.1.42:8765");
        assert_eq!(a, b);
    }

    #[test]
    fn upsert_emits_added_once_for_repeated_resolutions() {
        let peers = Mutex::new(HashMap::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let local = ("192.168.1.10".parse().unwrap(), 8765);

        let info = resolved("beta", "Beta Laptop", "192.168.1.20", 8765);
        upsert_peer(&peers, &tx, local, &info);
        upsert_peer(&peers, &tx, local, &info);

        match rx.try_recv().unwrap() {
            DiscoveryEvent::PeerAdded(peer) => {
                assert_eq!(peer.name, "Beta Laptop");
                assert_eq!(peer.port, 8765);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(peers.lock().unwrap().len(), 1);
    }

    #[test]
    fn upsert_skips_our_own_endpoint() {
        let peers = Mutex::new(HashMap::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let local = ("192.168.1.10".parse().unwrap(), 8765);

        let info = resolved("self", "Self", "192.168.1.10", 8765);
        upsert_peer(&peers, &tx, local, &info);

        assert!(rx.try_recv().is_err());
        assert!(peers.lock().unwrap().is_empty());
    }

    #[test]
    fn changed_endpoint_is_remove_then_add() {
        let peers = Mutex::new(HashMap::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let local = ("192.168.1.10".parse().unwrap(), 8765);

        upsert_peer(&peers, &tx, local, &resolved("gamma", "Gamma", "192.168.1.30", 8765));
        upsert_peer(&peers, &tx, local, &resolved("gamma", "Gamma", "192.168.1.31", 8765));

        assert!(matches!(rx.try_recv().unwrap(), DiscoveryEvent::PeerAdded(_)));
        match rx.try_recv().unwrap() {
            DiscoveryEvent::PeerRemoved(peer) => {
                assert_eq!(peer.address.to_string(), "192.168.1.30");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.try_recv().unwrap() {
            DiscoveryEvent::PeerAdded(peer) => {
                assert_eq!(peer.address.to_string(), "192.168.1.31");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn renamed_device_is_remove_then_add() {
        let peers = Mutex::new(HashMap::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let local = ("192.168.1.10".parse().unwrap(), 8765);

        upsert_peer(&peers, &tx, local, &resolved("epsilon", "Old Name", "192.168.1.50", 8765));
        assert!(matches!(rx.try_recv().unwrap(), DiscoveryEvent::PeerAdded(_)));

        // same endpoint, new device property
        upsert_peer(&peers, &tx, local, &resolved("epsilon", "New Name", "192.168.1.50", 8765));

        match rx.try_recv().unwrap() {
            DiscoveryEvent::PeerRemoved(peer) => assert_eq!(peer.name, "Old Name"),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.try_recv().unwrap() {
            DiscoveryEvent::PeerAdded(peer) => assert_eq!(peer.name, "New Name"),
            other => panic!("unexpected event: {other:?}"),
        }

        let table = peers.lock().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.values().next().unwrap().name, "New Name");
    }

    #[test]
    fn drop_peer_emits_removed() {
        let peers = Mutex::new(HashMap::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let local = ("192.168.1.10".parse().unwrap(), 8765);

        let info = resolved("delta", "Delta", "192.168.1.40", 9000);
        upsert_peer(&peers, &tx, local, &info);
        let _ = rx.try_recv();

        drop_peer(&peers, &tx, info.get_fullname());
        assert!(matches!(rx.try_recv().unwrap(), DiscoveryEvent::PeerRemoved(_)));
        assert!(peers.lock().unwrap().is_empty());

        // unknown names are a no-op
        drop_peer(&peers, &tx, "nope._lantransfer._tcp.local.");
        assert!(rx.try_recv().is_err());
    }
}
