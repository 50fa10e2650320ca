//! Connection request/accept/reject lifecycle.
//!
//! Per attempt: none -> requested -> {accepted -> connected -> disconnected}
//! | rejected. The manager is pure bookkeeping; the service owns the wire
//! traffic and wraps this in a mutex alongside the registry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::device::{now_secs, DiscoveredDevice};
use crate::error::{Result, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConnection {
    pub connection_id: String,
    pub peer_device: DiscoveredDevice,
    pub established_at: u64,
    pub status: ConnectionStatus,
    pub is_initiator: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConnectionRequest {
    pub connection_id: String,
    pub from_device: DiscoveredDevice,
    pub requested_at: u64,
}

#[derive(Default)]
pub struct ConnectionManager {
    pending_outgoing: HashMap<String, DiscoveredDevice>,
    pending_incoming: HashMap<String, PeerConnectionRequest>,
    active: HashMap<String, PeerConnection>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new outgoing request towards `device`. Returns the generated
    /// connection id; the caller sends the wire request.
    pub fn begin_request(&mut self, device: DiscoveredDevice) -> String {
        let connection_id = uuid::Uuid::new_v4().to_string();
        self.pending_outgoing.insert(connection_id.clone(), device);
        connection_id
    }

    /// Peer answered one of our outgoing requests. On accept the request
    /// becomes a connected PeerConnection (we are the initiator).
    pub fn on_response(&mut self, connection_id: &str, accepted: bool) -> Result<Option<PeerConnection>> {
        let device = self
            .pending_outgoing
            .remove(connection_id)
            .ok_or_else(|| ServiceError::ConnectionNotFound(connection_id.to_string()))?;
        if !accepted {
            return Ok(None);
        }
        let conn = PeerConnection {
            connection_id: connection_id.to_string(),
            peer_device: device,
            established_at: now_secs(),
            status: ConnectionStatus::Connected,
            is_initiator: true,
        };
        self.active.insert(connection_id.to_string(), conn.clone());
        Ok(Some(conn))
    }

    /// A remote peer asked to connect; surface the pending request for
    /// accept/reject.
    pub fn on_incoming_request(
        &mut self,
        connection_id: &str,
        from_device: DiscoveredDevice,
    ) -> PeerConnectionRequest {
        let request = PeerConnectionRequest {
            connection_id: connection_id.to_string(),
            from_device,
            requested_at: now_secs(),
        };
        self.pending_incoming
            .insert(connection_id.to_string(), request.clone());
        request
    }

    /// Local accept/reject of a pending incoming request. Accept transitions
    /// it into a connected PeerConnection (we are not the initiator).
    pub fn respond(
        &mut self,
        connection_id: &str,
        accept: bool,
    ) -> Result<(PeerConnectionRequest, Option<PeerConnection>)> {
        let request = self
            .pending_incoming
            .remove(connection_id)
            .ok_or_else(|| ServiceError::ConnectionNotFound(connection_id.to_string()))?;
        if !accept {
            return Ok((request, None));
        }
        let conn = PeerConnection {
            connection_id: connection_id.to_string(),
            peer_device: request.from_device.clone(),
            established_at: now_secs(),
            status: ConnectionStatus::Connected,
            is_initiator: false,
        };
        self.active.insert(connection_id.to_string(), conn.clone());
        Ok((request, Some(conn)))
    }

    /// Local disconnect. The record is returned (status flipped) so the
    /// caller can notify the peer and cancel transfer sessions.
    pub fn disconnect(&mut self, connection_id: &str) -> Result<PeerConnection> {
        let mut conn = self
            .active
            .remove(connection_id)
            .ok_or_else(|| ServiceError::ConnectionNotFound(connection_id.to_string()))?;
        conn.status = ConnectionStatus::Disconnected;
        Ok(conn)
    }

    /// Remote peer disconnected; nothing to error on if we never knew it.
    pub fn on_peer_disconnect(&mut self, connection_id: &str) -> Option<PeerConnection> {
        let mut conn = self.active.remove(connection_id)?;
        conn.status = ConnectionStatus::Disconnected;
        Some(conn)
    }

    pub fn get_active(&self, connection_id: &str) -> Option<&PeerConnection> {
        self.active.get(connection_id)
    }

    pub fn list_active(&self) -> Vec<PeerConnection> {
        self.active.values().cloned().collect()
    }

    pub fn list_pending(&self) -> Vec<PeerConnectionRequest> {
        self.pending_incoming.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            device_id: id.to_string(),
            device_name: "host-b".to_string(),
            user_id: "user-2".to_string(),
            user_nickname: "Bob".to_string(),
            ip_address: "192.168.1.20".parse().unwrap(),
            port: 4400,
            discovered_at: now_secs(),
            last_seen: now_secs(),
        }
    }

    #[test]
    fn outgoing_accept_becomes_connected_initiator() {
        let mut mgr = ConnectionManager::new();
        let id = mgr.begin_request(device("b"));
        let conn = mgr.on_response(&id, true).unwrap().unwrap();
        assert!(conn.is_initiator);
        assert_eq!(conn.status, ConnectionStatus::Connected);
        assert_eq!(mgr.list_active().len(), 1);
    }

    #[test]
    fn outgoing_reject_leaves_no_connection() {
        let mut mgr = ConnectionManager::new();
        let id = mgr.begin_request(device("b"));
        assert!(mgr.on_response(&id, false).unwrap().is_none());
        assert!(mgr.list_active().is_empty());
        // Second response for the same id is unknown
        assert!(matches!(
            mgr.on_response(&id, true),
            Err(ServiceError::ConnectionNotFound(_))
        ));
    }

    #[test]
    fn incoming_accept_flow() {
        let mut mgr = ConnectionManager::new();
        mgr.on_incoming_request("conn-1", device("a"));
        assert_eq!(mgr.list_pending().len(), 1);

        let (request, conn) = mgr.respond("conn-1", true).unwrap();
        assert_eq!(request.connection_id, "conn-1");
        let conn = conn.unwrap();
        assert!(!conn.is_initiator);
        assert!(mgr.list_pending().is_empty());
        assert_eq!(mgr.list_active().len(), 1);
    }

    #[test]
    fn incoming_reject_discards_request() {
        let mut mgr = ConnectionManager::new();
        mgr.on_incoming_request("conn-1", device("a"));
        let (_, conn) = mgr.respond("conn-1", false).unwrap();
        assert!(conn.is_none());
        assert!(mgr.list_pending().is_empty());
        assert!(mgr.list_active().is_empty());
    }

    #[test]
    fn respond_to_unknown_id_errors() {
        let mut mgr = ConnectionManager::new();
        assert!(matches!(
            mgr.respond("nope", true),
            Err(ServiceError::ConnectionNotFound(_))
        ));
    }

    #[test]
    fn disconnect_removes_and_flips_status() {
        let mut mgr = ConnectionManager::new();
        let id = mgr.begin_request(device("b"));
        mgr.on_response(&id, true).unwrap();

        let closed = mgr.disconnect(&id).unwrap();
        assert_eq!(closed.status, ConnectionStatus::Disconnected);
        assert!(mgr.list_active().is_empty());
        assert!(matches!(
            mgr.disconnect(&id),
            Err(ServiceError::ConnectionNotFound(_))
        ));
    }
}
