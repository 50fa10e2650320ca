use serde::{Deserialize, Serialize};

use crate::device::DiscoveredDevice;

/// Describes one file inside a transfer batch. The checksum is a CRC32 of the
/// entire file content, hex encoded; it covers the whole file so it stays
/// stable across resumed sessions.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub integrity_hash: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Message {
    // Ask the peer to establish a logical connection
    ConnectRequest {
        connection_id: String,
        device: DiscoveredDevice,
    },
    ConnectResponse {
        connection_id: String,
        accepted: bool,
    },
    // Tear down a logical connection (either side may send it)
    Disconnect {
        connection_id: String,
    },
    // Liveness probe, answered with Pong
    Ping,
    Pong,
    // Opens a transfer session stream: the full batch manifest
    FileOffer {
        session_id: String,
        connection_id: String,
        files: Vec<FileMetadata>,
        total_bytes: u64,
    },
    // Receiver's answer to a FileOffer, carrying the byte offset it already
    // holds for each file (0 when starting fresh)
    OfferAccept {
        session_id: String,
        resume_offsets: Vec<(String, u64)>,
    },
    OfferReject {
        session_id: String,
        reason: String,
    },
    // Announces the next file on the stream and the offset its chunks start at
    FileStart {
        file_id: String,
        offset: u64,
    },
    // One chunk of file content. Offsets must arrive in order; the receiver
    // rejects chunks that do not align with what it expects.
    FileChunk {
        file_id: String,
        offset: u64,
        data: Vec<u8>,
    },
    // Sender finished one file
    FileComplete {
        file_id: String,
    },
    // Receiver verified one file against its integrity hash
    FileOk {
        file_id: String,
    },
    FileFailed {
        file_id: String,
        reason: String,
    },
    // Sender finished the whole batch
    BatchDone {
        session_id: String,
    },
    // Receiver's final word: everything written and verified, stored here
    BatchAck {
        session_id: String,
        destination_dir: String,
    },
}
