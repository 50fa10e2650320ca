//! App-level state: the running service slot plus the event fanout.
//!
//! The slot is a tokio mutex so start/stop serialize against in-flight
//! commands. Starting while a service is already running stops the old
//! instance first and never fails for that reason alone; stopping an idle
//! service is a real error the UI can show.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::connection::{PeerConnection, PeerConnectionRequest};
use crate::device::DiscoveredDevice;
use crate::error::{Result, ServiceError};
use crate::events::ServiceEvent;
use crate::platform::PlatformAdapter;
use crate::service::{Service, ServiceConfig};

pub struct AppState {
    service: tokio::sync::Mutex<Option<Service>>,
    pub events: broadcast::Sender<ServiceEvent>,
    pub platform: Arc<dyn PlatformAdapter>,
}

impl AppState {
    pub fn new(platform: Arc<dyn PlatformAdapter>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            service: tokio::sync::Mutex::new(None),
            events,
            platform,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    /// Start (or restart) the service for the given identity.
    pub async fn start_service(&self, config: ServiceConfig) -> Result<()> {
        let mut slot = self.service.lock().await;
        if let Some(old) = slot.take() {
            tracing::info!("Service already running for {}; restarting", old.user_id());
            old.shutdown().await;
        }
        let service = Service::start(config, &*self.platform, self.events.clone()).await?;
        *slot = Some(service);
        Ok(())
    }

    pub async fn stop_service(&self) -> Result<()> {
        let mut slot = self.service.lock().await;
        let service = slot.take().ok_or(ServiceError::ServiceNotRunning)?;
        service.shutdown().await;
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.service.lock().await.is_some()
    }

    pub async fn list_devices(&self) -> Result<Vec<DiscoveredDevice>> {
        let slot = self.service.lock().await;
        Ok(slot
            .as_ref()
            .ok_or(ServiceError::ServiceNotRunning)?
            .list_devices())
    }

    pub async fn request_connection(&self, device_id: &str) -> Result<String> {
        let slot = self.service.lock().await;
        slot.as_ref()
            .ok_or(ServiceError::ServiceNotRunning)?
            .request_connection(device_id)
            .await
    }

    pub async fn respond_to_connection(&self, connection_id: &str, accept: bool) -> Result<()> {
        let slot = self.service.lock().await;
        slot.as_ref()
            .ok_or(ServiceError::ServiceNotRunning)?
            .respond(connection_id, accept)
            .await
    }

    pub async fn disconnect(&self, connection_id: &str) -> Result<()> {
        let slot = self.service.lock().await;
        slot.as_ref()
            .ok_or(ServiceError::ServiceNotRunning)?
            .disconnect(connection_id)
            .await
    }

    pub async fn list_active(&self) -> Result<Vec<PeerConnection>> {
        let slot = self.service.lock().await;
        Ok(slot
            .as_ref()
            .ok_or(ServiceError::ServiceNotRunning)?
            .list_active())
    }

    pub async fn list_pending(&self) -> Result<Vec<PeerConnectionRequest>> {
        let slot = self.service.lock().await;
        Ok(slot
            .as_ref()
            .ok_or(ServiceError::ServiceNotRunning)?
            .list_pending())
    }

    pub async fn send_files(&self, connection_id: &str, paths: Vec<PathBuf>) -> Result<String> {
        let slot = self.service.lock().await;
        slot.as_ref()
            .ok_or(ServiceError::ServiceNotRunning)?
            .send_files(connection_id, paths)
            .await
    }

    /// Run a closure against the running service (tests use this to inject
    /// discovery announcements).
    pub async fn with_service<T>(&self, f: impl FnOnce(&Service) -> T) -> Result<T> {
        let slot = self.service.lock().await;
        Ok(f(slot.as_ref().ok_or(ServiceError::ServiceNotRunning)?))
    }
}
