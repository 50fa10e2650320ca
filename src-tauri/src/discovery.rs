use local_ip_address::local_ip;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use crate::error::{Result, ServiceError};
use crate::identity::{self, SERVICE_TYPE};

pub struct Discovery {
    daemon: ServiceDaemon,
    registered_service: Option<String>, // Stores fullname of registered service
}

impl Discovery {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()?;
        Ok(Self {
            daemon,
            registered_service: None,
        })
    }

    /// Advertise this device. The instance name is the 15-char label; the
    /// full 32-char device id and the user identity ride in TXT properties.
    pub fn register(
        &mut self,
        device_id: &str,
        user_id: &str,
        user_nickname: &str,
        port: u16,
    ) -> Result<()> {
        // If already registered, unregister first
        if let Some(fullname) = &self.registered_service {
            tracing::info!("Unregistering old service: {}", fullname);
            let _ = self.daemon.unregister(fullname);
        }

        let ip = local_ip().map_err(|e| ServiceError::Discovery(e.to_string()))?;

        let label = identity::label(device_id);
        let m_hostname = format!("{}.local.", label);

        // Actual system hostname for UI display
        let system_hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "Unknown Device".to_string());

        let properties = [
            ("version", "0.1.0"),
            ("id", device_id),
            ("u", user_id),          // u = account user id
            ("n", user_nickname),    // n = account nickname
            ("h", &system_hostname), // h = visible hostname
        ];

        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            label,
            &m_hostname,
            &ip.to_string(),
            port,
            &properties[..],
        )?;

        // Store fullname for unregistering later
        let fullname = service_info.get_fullname().to_string();

        self.daemon.register(service_info)?;
        tracing::info!(
            "Registered service: {} ({}) on {}:{}",
            device_id,
            fullname,
            ip,
            port
        );

        self.registered_service = Some(fullname);

        Ok(())
    }

    pub fn browse(&self) -> Result<mdns_sd::Receiver<ServiceEvent>> {
        let receiver = self.daemon.browse(SERVICE_TYPE)?;
        Ok(receiver)
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        if let Some(fullname) = &self.registered_service {
            tracing::info!("Unregistering service: {}", fullname);
            if let Err(e) = self.daemon.unregister(fullname) {
                tracing::error!("Failed to unregister service: {}", e);
            }
            // Give the daemon time to send the goodbye packet before we drop it (and likely kill its background thread)
            std::thread::sleep(std::time::Duration::from_millis(300));
        }
    }
}
