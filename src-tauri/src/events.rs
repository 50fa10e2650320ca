//! Push events flowing out of the service towards the UI bridge.

use serde::Serialize;

use crate::connection::{PeerConnection, PeerConnectionRequest};
use crate::device::DiscoveredDevice;
use crate::progress::{BatchTransferCompleted, BatchTransferProgress};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceEvent {
    DeviceUpdated(DiscoveredDevice),
    DeviceRemoved { device_id: String },
    ConnectionRequested(PeerConnectionRequest),
    ConnectionEstablished(PeerConnection),
    ConnectionRejected { connection_id: String },
    ConnectionClosed { connection_id: String },
    TransferProgress(BatchTransferProgress),
    TransferCompleted(BatchTransferCompleted),
    TransferFailed { session_id: String, reason: String },
}
