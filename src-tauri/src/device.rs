use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    pub device_id: String,
    pub device_name: String,
    pub user_id: String,
    pub user_nickname: String,
    pub ip_address: std::net::IpAddr,
    pub port: u16,
    pub discovered_at: u64,
    pub last_seen: u64,
}

impl DiscoveredDevice {
    pub fn addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip_address, self.port)
    }
}

/// Seconds since the Unix epoch, for discovered_at / last_seen stamps.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
