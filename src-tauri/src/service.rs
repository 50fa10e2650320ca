//! Service lifecycle: one running instance per user identity.
//!
//! `Service::start` brings up the QUIC transport, the mDNS
//! advertiser/browser, the liveness loop and the accept loop; `shutdown`
//! cancels all of them and does not return until their resources are
//! released. The restart-if-running rule lives one level up in AppState.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionManager, PeerConnection, PeerConnectionRequest};
use crate::device::{now_secs, DiscoveredDevice};
use crate::discovery::Discovery;
use crate::error::{Result, ServiceError};
use crate::events::ServiceEvent;
use crate::liveness::{self, QuicProber};
use crate::platform::{PlatformAdapter, SessionLockGuard};
use crate::protocol::Message;
use crate::registry::DeviceRegistry;
use crate::transfer::TransferEngine;
use crate::transport::{self, Transport};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub user_id: String,
    pub user_nickname: String,
    pub device_id: String,
    pub device_name: String,
    /// 0 picks an ephemeral port.
    pub port: u16,
    pub download_dir: PathBuf,
    /// Disabled in tests so no multicast socket is needed; announcements are
    /// injected through `announce_device` instead.
    pub enable_mdns: bool,
}

/// Shared handles the background tasks work against.
#[derive(Clone)]
struct ServiceCtx {
    registry: Arc<Mutex<DeviceRegistry>>,
    connections: Arc<Mutex<ConnectionManager>>,
    transfers: TransferEngine,
    events: broadcast::Sender<ServiceEvent>,
}

pub struct Service {
    config: ServiceConfig,
    port: u16,
    ctx: ServiceCtx,
    transport: Transport,
    discovery: Option<Discovery>,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    _session_lock: SessionLockGuard,
}

impl Service {
    pub async fn start(
        config: ServiceConfig,
        platform: &dyn PlatformAdapter,
        events: broadcast::Sender<ServiceEvent>,
    ) -> Result<Self> {
        let session_lock = platform.acquire_session_lock(&config.user_id)?;

        let transport = Transport::new(config.port)?;
        let port = transport.local_addr()?.port();
        tracing::info!(
            "Transfer service starting for {} ({}) on port {}",
            config.user_nickname,
            config.user_id,
            port
        );

        let ctx = ServiceCtx {
            registry: Arc::new(Mutex::new(DeviceRegistry::new())),
            connections: Arc::new(Mutex::new(ConnectionManager::new())),
            transfers: TransferEngine::new(events.clone(), config.download_dir.clone()),
            events,
        };

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        // mDNS advertise + browse
        let discovery = if config.enable_mdns {
            let mut discovery = Discovery::new()?;
            discovery.register(&config.device_id, &config.user_id, &config.user_nickname, port)?;
            let receiver = discovery.browse()?;
            tasks.push(tokio::spawn(browse_loop(
                receiver,
                config.device_id.clone(),
                ctx.clone(),
                cancel.clone(),
            )));
            Some(discovery)
        } else {
            None
        };

        // Inbound streams
        tasks.push(tokio::spawn(accept_loop(
            transport.endpoint.clone(),
            ctx.clone(),
            cancel.clone(),
        )));

        // Periodic liveness verification
        tasks.push(tokio::spawn(liveness_loop(
            QuicProber::new(transport.clone()),
            ctx.clone(),
            cancel.clone(),
        )));

        Ok(Self {
            config,
            port,
            ctx,
            transport,
            discovery,
            cancel,
            tasks,
            _session_lock: session_lock,
        })
    }

    /// Cancel every task and wait for sockets, advertiser and sessions to
    /// tear down. Synchronous with respect to resource release.
    pub async fn shutdown(mut self) {
        tracing::info!("Stopping transfer service for {}", self.config.user_id);
        self.cancel.cancel();
        self.ctx.transfers.shutdown().await;
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        // Unregister sends the mDNS goodbye on drop
        drop(self.discovery.take());
        self.transport.shutdown().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.ctx.events.subscribe()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }

    /// This device as peers see it in announcements and connect requests.
    pub fn self_device(&self) -> DiscoveredDevice {
        let ip = local_ip_address::local_ip()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        DiscoveredDevice {
            device_id: self.config.device_id.clone(),
            device_name: self.config.device_name.clone(),
            user_id: self.config.user_id.clone(),
            user_nickname: self.config.user_nickname.clone(),
            ip_address: ip,
            port: self.port,
            discovered_at: now_secs(),
            last_seen: now_secs(),
        }
    }

    pub fn list_devices(&self) -> Vec<DiscoveredDevice> {
        self.ctx.registry.lock().unwrap().list()
    }

    /// Feed one announcement into the registry, exactly as the browse loop
    /// does for resolved mDNS services.
    pub fn announce_device(&self, fullname: &str, device: DiscoveredDevice) {
        apply_announcement(&self.ctx, fullname, device);
    }

    /// Explicit removal notice; bypasses the failure counter.
    pub fn service_removed(&self, fullname: &str) {
        apply_removal(&self.ctx, fullname);
    }

    pub async fn request_connection(&self, device_id: &str) -> Result<String> {
        let device = {
            let registry = self.ctx.registry.lock().unwrap();
            registry
                .get(device_id)
                .cloned()
                .ok_or_else(|| ServiceError::DeviceNotFound(device_id.to_string()))?
        };

        let connection_id = self
            .ctx
            .connections
            .lock()
            .unwrap()
            .begin_request(device.clone());

        let request = Message::ConnectRequest {
            connection_id: connection_id.clone(),
            device: self.self_device(),
        };
        if let Err(e) = self.transport.send_message(device.addr(), &request).await {
            // Wire never saw the request; forget the pending attempt
            let _ = self
                .ctx
                .connections
                .lock()
                .unwrap()
                .on_response(&connection_id, false);
            return Err(e);
        }

        Ok(connection_id)
    }

    pub async fn respond(&self, connection_id: &str, accept: bool) -> Result<()> {
        let (request, established) = self
            .ctx
            .connections
            .lock()
            .unwrap()
            .respond(connection_id, accept)?;

        let response = Message::ConnectResponse {
            connection_id: connection_id.to_string(),
            accepted: accept,
        };
        if let Err(e) = self
            .transport
            .send_message(request.from_device.addr(), &response)
            .await
        {
            tracing::warn!("Failed to deliver connect response: {}", e);
        }

        if let Some(conn) = established {
            let _ = self
                .ctx
                .events
                .send(ServiceEvent::ConnectionEstablished(conn));
        }
        Ok(())
    }

    pub async fn disconnect(&self, connection_id: &str) -> Result<()> {
        let conn = self
            .ctx
            .connections
            .lock()
            .unwrap()
            .disconnect(connection_id)?;
        self.ctx.transfers.cancel_connection(connection_id);

        let notice = Message::Disconnect {
            connection_id: connection_id.to_string(),
        };
        if let Err(e) = self
            .transport
            .send_message(conn.peer_device.addr(), &notice)
            .await
        {
            tracing::warn!("Failed to deliver disconnect notice: {}", e);
        }

        let _ = self.ctx.events.send(ServiceEvent::ConnectionClosed {
            connection_id: connection_id.to_string(),
        });
        Ok(())
    }

    pub fn list_active(&self) -> Vec<PeerConnection> {
        self.ctx.connections.lock().unwrap().list_active()
    }

    pub fn list_pending(&self) -> Vec<PeerConnectionRequest> {
        self.ctx.connections.lock().unwrap().list_pending()
    }

    pub async fn send_files(&self, connection_id: &str, paths: Vec<PathBuf>) -> Result<String> {
        if paths.is_empty() {
            return Err(ServiceError::NoFilesSelected);
        }
        let conn = self
            .ctx
            .connections
            .lock()
            .unwrap()
            .get_active(connection_id)
            .cloned()
            .ok_or_else(|| ServiceError::ConnectionNotFound(connection_id.to_string()))?;
        self.ctx
            .transfers
            .send_files(self.transport.clone(), conn, paths)
    }
}

fn apply_announcement(ctx: &ServiceCtx, fullname: &str, device: DiscoveredDevice) {
    ctx.registry.lock().unwrap().announce(fullname, device.clone());
    let _ = ctx.events.send(ServiceEvent::DeviceUpdated(device));
}

fn apply_removal(ctx: &ServiceCtx, fullname: &str) {
    let removed = ctx.registry.lock().unwrap().service_removed(fullname);
    for device_id in removed {
        let _ = ctx.events.send(ServiceEvent::DeviceRemoved { device_id });
    }
}

async fn browse_loop(
    receiver: mdns_sd::Receiver<mdns_sd::ServiceEvent>,
    local_device_id: String,
    ctx: ServiceCtx,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            e = receiver.recv_async() => match e {
                Ok(e) => e,
                Err(_) => break, // daemon gone
            },
            _ = cancel.cancelled() => break,
        };
        match event {
            mdns_sd::ServiceEvent::ServiceResolved(info) => {
                let Some(ip) = info.get_addresses().iter().next().copied() else {
                    continue;
                };
                let id = info
                    .get_property_val_str("id")
                    .unwrap_or("unknown")
                    .to_string();
                if id == local_device_id {
                    continue; // our own announcement
                }
                let device = DiscoveredDevice {
                    device_id: id,
                    device_name: info
                        .get_property_val_str("h")
                        .unwrap_or("Unknown Device")
                        .to_string(),
                    user_id: info.get_property_val_str("u").unwrap_or("").to_string(),
                    user_nickname: info.get_property_val_str("n").unwrap_or("").to_string(),
                    ip_address: ip,
                    port: info.get_port(),
                    discovered_at: now_secs(),
                    last_seen: now_secs(),
                };
                tracing::debug!(
                    "Resolved {} ({}) at {}:{}",
                    device.device_id,
                    device.user_nickname,
                    device.ip_address,
                    device.port
                );
                apply_announcement(&ctx, info.get_fullname(), device);
            }
            mdns_sd::ServiceEvent::ServiceRemoved(_ty, fullname) => {
                apply_removal(&ctx, &fullname);
            }
            _ => {}
        }
    }
}

async fn liveness_loop(prober: QuicProber, ctx: ServiceCtx, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(liveness::VERIFY_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; skip it so a fresh service doesn't probe
    // an empty registry
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => break,
        }
        let evicted = liveness::verify_once(&ctx.registry, &prober).await;
        for device in evicted {
            let _ = ctx.events.send(ServiceEvent::DeviceRemoved {
                device_id: device.device_id,
            });
        }
    }
}

async fn accept_loop(endpoint: quinn::Endpoint, ctx: ServiceCtx, cancel: CancellationToken) {
    loop {
        let incoming = tokio::select! {
            i = endpoint.accept() => match i {
                Some(i) => i,
                None => break, // endpoint closed
            },
            _ = cancel.cancelled() => break,
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let connection = match incoming.await {
                Ok(c) => c,
                Err(e) => {
                    tracing::debug!("Inbound connection failed: {}", e);
                    return;
                }
            };
            let remote = connection.remote_address();
            while let Ok((send, recv)) = connection.accept_bi().await {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_stream(send, recv, remote, ctx).await {
                        tracing::debug!("Stream from {} ended with error: {}", remote, e);
                    }
                });
            }
        });
    }
}

async fn handle_stream(
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    remote: SocketAddr,
    ctx: ServiceCtx,
) -> Result<()> {
    let mut reader = transport::frame_reader(recv);
    let mut writer = transport::frame_writer(send);

    let Some(msg) = transport::read_message(&mut reader).await? else {
        return Ok(());
    };

    match msg {
        Message::Ping => {
            transport::write_message(&mut writer, &Message::Pong).await?;
        }
        Message::ConnectRequest {
            connection_id,
            device,
        } => {
            tracing::info!(
                "Connection request {} from {} ({})",
                connection_id,
                device.user_nickname,
                remote
            );
            let request = ctx
                .connections
                .lock()
                .unwrap()
                .on_incoming_request(&connection_id, device);
            let _ = ctx.events.send(ServiceEvent::ConnectionRequested(request));
        }
        Message::ConnectResponse {
            connection_id,
            accepted,
        } => match ctx
            .connections
            .lock()
            .unwrap()
            .on_response(&connection_id, accepted)
        {
            Ok(Some(conn)) => {
                let _ = ctx.events.send(ServiceEvent::ConnectionEstablished(conn));
            }
            Ok(None) => {
                let _ = ctx
                    .events
                    .send(ServiceEvent::ConnectionRejected { connection_id });
            }
            Err(e) => tracing::warn!("Spurious connect response from {}: {}", remote, e),
        },
        Message::Disconnect { connection_id } => {
            if ctx
                .connections
                .lock()
                .unwrap()
                .on_peer_disconnect(&connection_id)
                .is_some()
            {
                ctx.transfers.cancel_connection(&connection_id);
                let _ = ctx
                    .events
                    .send(ServiceEvent::ConnectionClosed { connection_id });
            }
        }
        Message::FileOffer {
            session_id,
            connection_id,
            files,
            total_bytes,
        } => {
            let known = ctx
                .connections
                .lock()
                .unwrap()
                .get_active(&connection_id)
                .is_some();
            if !known {
                transport::write_message(
                    &mut writer,
                    &Message::OfferReject {
                        session_id,
                        reason: "connection not active".to_string(),
                    },
                )
                .await?;
                return Ok(());
            }
            // The session task owns the stream from here on
            ctx.transfers
                .spawn_receive(session_id, connection_id, files, total_bytes, reader, writer);
        }
        other => {
            tracing::warn!("Unexpected control message from {}: {:?}", remote, other);
        }
    }
    Ok(())
}
