//! Periodic liveness verification.
//!
//! mDNS both under-reports departures (a device that loses power never sends
//! a goodbye) and occasionally over-reports them, so the registry gets two
//! eviction tracks: explicit removal notices act immediately, probe failures
//! only act after three strikes. The probe itself is a QUIC round trip.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::timeout;

use crate::device::DiscoveredDevice;
use crate::error::{Result, ServiceError};
use crate::protocol::Message;
use crate::registry::DeviceRegistry;
use crate::transport::{self, Transport};

pub const VERIFY_INTERVAL: Duration = Duration::from_secs(5);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Reachability probe, abstracted so tests can script outcomes.
pub trait Prober: Send + Sync {
    fn probe(&self, addr: SocketAddr) -> BoxFuture<'static, bool>;
}

/// Production probe: QUIC connect + Ping/Pong within PROBE_TIMEOUT.
pub struct QuicProber {
    transport: Transport,
}

impl QuicProber {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    async fn ping(transport: Transport, addr: SocketAddr) -> Result<()> {
        let conn = transport.connect(addr).await?;
        let (send, recv) = conn.open_bi().await.map_err(ServiceError::from)?;
        let mut writer = transport::frame_writer(send);
        transport::write_message(&mut writer, &Message::Ping).await?;
        writer
            .get_mut()
            .finish()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        let mut reader = transport::frame_reader(recv);
        match transport::read_message(&mut reader).await? {
            Some(Message::Pong) => Ok(()),
            other => Err(ServiceError::Protocol(format!(
                "expected Pong, got {:?}",
                other
            ))),
        }
    }
}

impl Prober for QuicProber {
    fn probe(&self, addr: SocketAddr) -> BoxFuture<'static, bool> {
        let transport = self.transport.clone();
        Box::pin(async move {
            matches!(
                timeout(PROBE_TIMEOUT, Self::ping(transport, addr)).await,
                Ok(Ok(()))
            )
        })
    }
}

/// One verification cycle over a snapshot of the registry. The lock is only
/// held to apply each probe outcome, never across the probe itself, so a
/// re-announcement arriving mid-probe still lands before the failure is
/// counted. Returns the devices evicted this cycle.
pub async fn verify_once(
    registry: &Arc<Mutex<DeviceRegistry>>,
    prober: &dyn Prober,
) -> Vec<DiscoveredDevice> {
    let snapshot: Vec<(String, SocketAddr)> = {
        let reg = registry.lock().unwrap();
        reg.list().iter().map(|d| (d.device_id.clone(), d.addr())).collect()
    };

    let mut evicted = Vec::new();
    for (device_id, addr) in snapshot {
        let reachable = prober.probe(addr).await;
        let mut reg = registry.lock().unwrap();
        if reachable {
            reg.clear_failures(&device_id);
        } else if let Some(device) = reg.record_failure(&device_id) {
            tracing::info!(
                "Evicting {} after {} failed probes",
                device_id,
                crate::registry::MAX_PROBE_FAILURES
            );
            evicted.push(device);
        }
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::now_secs;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ScriptedProber {
        reachable: AtomicBool,
    }

    impl ScriptedProber {
        fn new(reachable: bool) -> Self {
            Self {
                reachable: AtomicBool::new(reachable),
            }
        }

        fn set(&self, reachable: bool) {
            self.reachable.store(reachable, Ordering::SeqCst);
        }
    }

    impl Prober for ScriptedProber {
        fn probe(&self, _addr: SocketAddr) -> BoxFuture<'static, bool> {
            let up = self.reachable.load(Ordering::SeqCst);
            Box::pin(async move { up })
        }
    }

    fn registry_with_device(id: &str) -> Arc<Mutex<DeviceRegistry>> {
        let mut reg = DeviceRegistry::new();
        reg.announce(
            &crate::identity::advertised_name(crate::identity::label(id)),
            DiscoveredDevice {
                device_id: id.to_string(),
                device_name: "host".into(),
                user_id: "u".into(),
                user_nickname: "n".into(),
                ip_address: "127.0.0.1".parse().unwrap(),
                port: 1,
                discovered_at: now_secs(),
                last_seen: now_secs(),
            },
        );
        Arc::new(Mutex::new(reg))
    }

    const ID: &str = "dddddddddddddddd0000000000000000";

    #[tokio::test]
    async fn three_failed_cycles_evict() {
        let registry = registry_with_device(ID);
        let prober = ScriptedProber::new(false);

        assert!(verify_once(&registry, &prober).await.is_empty());
        assert!(verify_once(&registry, &prober).await.is_empty());
        let evicted = verify_once(&registry, &prober).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].device_id, ID);
        assert!(registry.lock().unwrap().get(ID).is_none());
    }

    #[tokio::test]
    async fn success_resets_the_count() {
        let registry = registry_with_device(ID);
        let prober = ScriptedProber::new(false);

        verify_once(&registry, &prober).await;
        verify_once(&registry, &prober).await;
        prober.set(true);
        verify_once(&registry, &prober).await;
        assert_eq!(registry.lock().unwrap().failure_count(ID), 0);

        // Next failure counts from one again
        prober.set(false);
        assert!(verify_once(&registry, &prober).await.is_empty());
        assert!(registry.lock().unwrap().get(ID).is_some());
    }

    #[tokio::test]
    async fn reachable_devices_stay() {
        let registry = registry_with_device(ID);
        let prober = ScriptedProber::new(true);
        for _ in 0..5 {
            assert!(verify_once(&registry, &prober).await.is_empty());
        }
        assert!(registry.lock().unwrap().get(ID).is_some());
    }
}
