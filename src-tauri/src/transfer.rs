//! Batch file transfer sessions over an established connection.
//!
//! One `send_files` call is one session: a dedicated QUIC bi stream carrying
//! a FileOffer manifest, the receiver's resume offsets, then each file as
//! in-order chunks. The receiver appends to `<name>.part` files and renames
//! on verified completion, so an interrupted session leaves exactly the
//! state a later resume needs. Integrity is CRC32 over the whole file:
//! corruption detection, not tamper-proofing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter, SeekFrom};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::connection::PeerConnection;
use crate::error::{Result, ServiceError};
use crate::events::ServiceEvent;
use crate::progress::{self, BatchTransferCompleted, BatchTransferProgress, SpeedTracker};
use crate::protocol::{FileMetadata, Message};
use crate::transport::{self, FrameReader, FrameWriter, Transport};

pub const CHUNK_SIZE: usize = 64 * 1024;

struct SessionHandle {
    connection_id: String,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Owns every in-flight session, sending and receiving alike, so a
/// disconnect or service stop can cancel them promptly.
#[derive(Clone)]
pub struct TransferEngine {
    sessions: Arc<Mutex<HashMap<String, SessionHandle>>>,
    events: broadcast::Sender<ServiceEvent>,
    download_dir: PathBuf,
}

impl TransferEngine {
    pub fn new(events: broadcast::Sender<ServiceEvent>, download_dir: PathBuf) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            events,
            download_dir,
        }
    }

    /// Start a sending session towards the peer of `conn`. Returns the
    /// session id immediately; manifest hashing and the transfer itself run
    /// in the session task, so callers never block on large files.
    pub fn send_files(
        &self,
        transport: Transport,
        conn: PeerConnection,
        paths: Vec<PathBuf>,
    ) -> Result<String> {
        if paths.is_empty() {
            return Err(ServiceError::NoFilesSelected);
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();

        // Spawn and insert under one lock; the task's self-removal takes the
        // same lock, so a fast-failing session cannot remove before the insert
        let mut sessions = self.sessions.lock().unwrap();
        let task = tokio::spawn(run_send_session(
            transport,
            conn.clone(),
            session_id.clone(),
            paths,
            self.events.clone(),
            cancel.clone(),
            self.sessions.clone(),
        ));
        sessions.insert(
            session_id.clone(),
            SessionHandle {
                connection_id: conn.connection_id,
                cancel,
                task,
            },
        );

        Ok(session_id)
    }

    /// Attach an incoming session (receiver side) so it participates in
    /// cancel-on-disconnect and shutdown like sends do.
    pub fn spawn_receive(
        &self,
        session_id: String,
        connection_id: String,
        files: Vec<FileMetadata>,
        total_bytes: u64,
        reader: FrameReader,
        writer: FrameWriter,
    ) {
        let cancel = CancellationToken::new();
        let mut sessions = self.sessions.lock().unwrap();
        let task = tokio::spawn(run_receive_session(
            session_id.clone(),
            files,
            total_bytes,
            self.download_dir.clone(),
            reader,
            writer,
            self.events.clone(),
            cancel.clone(),
            self.sessions.clone(),
        ));
        sessions.insert(
            session_id,
            SessionHandle {
                connection_id,
                cancel,
                task,
            },
        );
    }

    /// Cancel every session riding on one connection.
    pub fn cancel_connection(&self, connection_id: &str) {
        let sessions = self.sessions.lock().unwrap();
        for handle in sessions.values() {
            if handle.connection_id == connection_id {
                handle.cancel.cancel();
            }
        }
    }

    /// Cancel everything and wait for the session tasks to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.cancel.cancel();
            let _ = handle.task.await;
        }
    }

}

type SessionMap = Arc<Mutex<HashMap<String, SessionHandle>>>;

/// Running byte/file counters for one session, shared by both directions.
struct BatchState {
    session_id: String,
    total_files: u64,
    completed_files: u64,
    total_bytes: u64,
    transferred_bytes: u64,
    current_file: Option<String>,
    tracker: SpeedTracker,
}

impl BatchState {
    fn new(session_id: String, total_files: u64, total_bytes: u64, resume_offset: u64) -> Self {
        Self {
            session_id,
            total_files,
            completed_files: 0,
            total_bytes,
            // Resumed bytes count towards the batch total from the start
            transferred_bytes: resume_offset,
            current_file: None,
            tracker: SpeedTracker::new(resume_offset),
        }
    }

    fn add_bytes(&mut self, n: u64) {
        self.transferred_bytes = (self.transferred_bytes + n).min(self.total_bytes);
        self.tracker.update(self.transferred_bytes);
    }

    fn snapshot(&self) -> BatchTransferProgress {
        let speed = self.tracker.speed();
        BatchTransferProgress {
            session_id: self.session_id.clone(),
            total_files: self.total_files,
            completed_files: self.completed_files,
            total_bytes: self.total_bytes,
            transferred_bytes: self.transferred_bytes,
            speed,
            current_file: self.current_file.clone(),
            eta_seconds: progress::eta_seconds(self.total_bytes, self.transferred_bytes, speed),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_send_session(
    transport: Transport,
    conn: PeerConnection,
    session_id: String,
    paths: Vec<PathBuf>,
    events: broadcast::Sender<ServiceEvent>,
    cancel: CancellationToken,
    sessions: SessionMap,
) {
    let result = tokio::select! {
        r = send_batch(&transport, &conn, &session_id, &paths, &events) => r,
        _ = cancel.cancelled() => Err(ServiceError::Transport("session cancelled".into())),
    };
    if let Err(e) = result {
        tracing::warn!("Send session {} failed: {}", session_id, e);
        let _ = events.send(ServiceEvent::TransferFailed {
            session_id: session_id.clone(),
            reason: e.to_string(),
        });
    }
    sessions.lock().unwrap().remove(&session_id);
}

async fn send_batch(
    transport: &Transport,
    conn: &PeerConnection,
    session_id: &str,
    paths: &[PathBuf],
    events: &broadcast::Sender<ServiceEvent>,
) -> Result<()> {
    // Manifest up front: sizes and whole-file checksums. Checksums are
    // computed once here and stay valid across resumes.
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        files.push(file_metadata(path).await?);
    }
    let total_bytes: u64 = files.iter().map(|f| f.file_size).sum();
    send_session(transport, conn, session_id, paths, &files, total_bytes, events).await
}

async fn send_session(
    transport: &Transport,
    conn: &PeerConnection,
    session_id: &str,
    paths: &[PathBuf],
    files: &[FileMetadata],
    total_bytes: u64,
    events: &broadcast::Sender<ServiceEvent>,
) -> Result<()> {
    let connection = transport.connect(conn.peer_device.addr()).await?;
    let (send, recv) = connection.open_bi().await.map_err(ServiceError::from)?;
    let mut writer = transport::frame_writer(send);
    let mut reader = transport::frame_reader(recv);

    transport::write_message(
        &mut writer,
        &Message::FileOffer {
            session_id: session_id.to_string(),
            connection_id: conn.connection_id.clone(),
            files: files.to_vec(),
            total_bytes,
        },
    )
    .await?;

    // Receiver tells us where to pick each file up
    let resume_offsets: HashMap<String, u64> = match transport::read_message(&mut reader).await? {
        Some(Message::OfferAccept { resume_offsets, .. }) => resume_offsets.into_iter().collect(),
        Some(Message::OfferReject { reason, .. }) => {
            return Err(ServiceError::Protocol(format!("offer rejected: {}", reason)));
        }
        other => {
            return Err(ServiceError::Protocol(format!(
                "unexpected offer reply: {:?}",
                other
            )));
        }
    };

    let resume_total: u64 = files
        .iter()
        .map(|f| resume_offsets.get(&f.file_id).copied().unwrap_or(0))
        .sum();
    let mut batch = BatchState::new(
        session_id.to_string(),
        files.len() as u64,
        total_bytes,
        resume_total,
    );
    let _ = events.send(ServiceEvent::TransferProgress(batch.snapshot()));

    for (path, meta) in paths.iter().zip(files) {
        let offset = resume_offsets
            .get(&meta.file_id)
            .copied()
            .unwrap_or(0)
            .min(meta.file_size);
        batch.current_file = Some(meta.file_name.clone());

        transport::write_message(
            &mut writer,
            &Message::FileStart {
                file_id: meta.file_id.clone(),
                offset,
            },
        )
        .await?;

        send_file_chunks(&mut writer, path, &meta.file_id, offset, &mut batch, events).await?;

        transport::write_message(
            &mut writer,
            &Message::FileComplete {
                file_id: meta.file_id.clone(),
            },
        )
        .await?;

        match transport::read_message(&mut reader).await? {
            Some(Message::FileOk { .. }) => {
                batch.completed_files += 1;
                let _ = events.send(ServiceEvent::TransferProgress(batch.snapshot()));
            }
            Some(Message::FileFailed { reason, .. }) => {
                return Err(ServiceError::Protocol(format!(
                    "receiver rejected {}: {}",
                    meta.file_name, reason
                )));
            }
            other => {
                return Err(ServiceError::Protocol(format!(
                    "unexpected file reply: {:?}",
                    other
                )));
            }
        }
    }

    transport::write_message(
        &mut writer,
        &Message::BatchDone {
            session_id: session_id.to_string(),
        },
    )
    .await?;

    // Receiver's ack names the directory the batch landed in
    let destination_dir = match transport::read_message(&mut reader).await? {
        Some(Message::BatchAck {
            destination_dir, ..
        }) => destination_dir,
        other => {
            return Err(ServiceError::Protocol(format!(
                "unexpected batch reply: {:?}",
                other
            )));
        }
    };

    let _ = events.send(ServiceEvent::TransferCompleted(BatchTransferCompleted {
        session_id: session_id.to_string(),
        total_files: batch.total_files,
        destination_dir,
    }));
    Ok(())
}

async fn send_file_chunks(
    writer: &mut FrameWriter,
    path: &Path,
    file_id: &str,
    start_offset: u64,
    batch: &mut BatchState,
    events: &broadcast::Sender<ServiceEvent>,
) -> Result<()> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(start_offset)).await?;

    let mut offset = start_offset;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut last_emit = std::time::Instant::now();
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        transport::write_message(
            writer,
            &Message::FileChunk {
                file_id: file_id.to_string(),
                offset,
                data: buf[..n].to_vec(),
            },
        )
        .await?;
        offset += n as u64;
        batch.add_bytes(n as u64);
        // Progress on the speed cadence, not per chunk
        if last_emit.elapsed() >= progress::SPEED_INTERVAL {
            let _ = events.send(ServiceEvent::TransferProgress(batch.snapshot()));
            last_emit = std::time::Instant::now();
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_receive_session(
    session_id: String,
    files: Vec<FileMetadata>,
    total_bytes: u64,
    download_dir: PathBuf,
    reader: FrameReader,
    writer: FrameWriter,
    events: broadcast::Sender<ServiceEvent>,
    cancel: CancellationToken,
    sessions: SessionMap,
) {
    let mut reader = reader;
    let mut writer = writer;
    let result = tokio::select! {
        r = receive_session(&session_id, &files, total_bytes, &download_dir, &mut reader, &mut writer, &events) => r,
        _ = cancel.cancelled() => Err(ServiceError::Transport("session cancelled".into())),
    };
    if let Err(e) = result {
        // Partial .part files stay on disk for a later resume
        tracing::warn!("Receive session {} interrupted: {}", session_id, e);
        let _ = events.send(ServiceEvent::TransferFailed {
            session_id: session_id.clone(),
            reason: e.to_string(),
        });
    }
    sessions.lock().unwrap().remove(&session_id);
}

async fn receive_session(
    session_id: &str,
    files: &[FileMetadata],
    total_bytes: u64,
    download_dir: &Path,
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
    events: &broadcast::Sender<ServiceEvent>,
) -> Result<()> {
    fs::create_dir_all(download_dir).await?;

    // Offer the sender the bytes we already hold from earlier attempts
    let mut offsets = Vec::with_capacity(files.len());
    for meta in files {
        let offset = existing_offset(download_dir, meta).await;
        offsets.push((meta.file_id.clone(), offset));
    }
    let resume_total: u64 = offsets.iter().map(|(_, o)| o).sum();

    transport::write_message(
        writer,
        &Message::OfferAccept {
            session_id: session_id.to_string(),
            resume_offsets: offsets.clone(),
        },
    )
    .await?;

    let by_id: HashMap<&str, &FileMetadata> =
        files.iter().map(|m| (m.file_id.as_str(), m)).collect();
    let offered: HashMap<String, u64> = offsets.into_iter().collect();

    let mut batch = BatchState::new(
        session_id.to_string(),
        files.len() as u64,
        total_bytes,
        resume_total,
    );

    let mut current: Option<IncomingFile> = None;
    let mut last_emit = std::time::Instant::now();

    loop {
        let msg = transport::read_message(reader)
            .await?
            .ok_or_else(|| ServiceError::Protocol("stream closed mid-session".into()))?;
        match msg {
            Message::FileStart { file_id, offset } => {
                let meta = *by_id
                    .get(file_id.as_str())
                    .ok_or_else(|| ServiceError::Protocol(format!("unknown file {}", file_id)))?;
                let expected = offered.get(&file_id).copied().unwrap_or(0);
                if offset != expected {
                    let reason = format!("offset {} does not match expected {}", offset, expected);
                    transport::write_message(
                        writer,
                        &Message::FileFailed {
                            file_id,
                            reason: reason.clone(),
                        },
                    )
                    .await?;
                    return Err(ServiceError::Protocol(reason));
                }
                batch.current_file = Some(meta.file_name.clone());
                current = Some(IncomingFile::open(download_dir, meta, offset).await?);
            }
            Message::FileChunk { file_id, offset, data } => {
                let incoming = current
                    .as_mut()
                    .filter(|f| f.meta.file_id == file_id)
                    .ok_or_else(|| ServiceError::Protocol("chunk outside FileStart".into()))?;
                // Bytes must align with what we have; anything else is a
                // desync and the safe move is to stop and keep the .part
                if offset != incoming.written {
                    let reason = format!(
                        "chunk offset {} does not align with {}",
                        offset, incoming.written
                    );
                    transport::write_message(
                        writer,
                        &Message::FileFailed {
                            file_id,
                            reason: reason.clone(),
                        },
                    )
                    .await?;
                    return Err(ServiceError::Protocol(reason));
                }
                incoming.write(&data).await?;
                batch.add_bytes(data.len() as u64);
                if last_emit.elapsed() >= progress::SPEED_INTERVAL {
                    let _ = events.send(ServiceEvent::TransferProgress(batch.snapshot()));
                    last_emit = std::time::Instant::now();
                }
            }
            Message::FileComplete { file_id } => {
                let incoming = current
                    .take()
                    .filter(|f| f.meta.file_id == file_id)
                    .ok_or_else(|| ServiceError::Protocol("complete outside FileStart".into()))?;
                match incoming.finalize(download_dir).await {
                    Ok(()) => {
                        batch.completed_files += 1;
                        let _ = events.send(ServiceEvent::TransferProgress(batch.snapshot()));
                        transport::write_message(writer, &Message::FileOk { file_id }).await?;
                    }
                    Err(e) => {
                        transport::write_message(
                            writer,
                            &Message::FileFailed {
                                file_id,
                                reason: e.to_string(),
                            },
                        )
                        .await?;
                        return Err(e);
                    }
                }
            }
            Message::BatchDone { .. } => {
                transport::write_message(
                    writer,
                    &Message::BatchAck {
                        session_id: session_id.to_string(),
                        destination_dir: download_dir.display().to_string(),
                    },
                )
                .await?;
                let _ = events.send(ServiceEvent::TransferCompleted(BatchTransferCompleted {
                    session_id: session_id.to_string(),
                    total_files: batch.total_files,
                    destination_dir: download_dir.display().to_string(),
                }));
                return Ok(());
            }
            other => {
                return Err(ServiceError::Protocol(format!(
                    "unexpected session message: {:?}",
                    other
                )));
            }
        }
    }
}

/// One file being written on the receiver side. Content goes to a `.part`
/// file; the CRC is carried over the already-present prefix plus every new
/// chunk, and checked before the rename.
struct IncomingFile {
    meta: FileMetadata,
    part_path: PathBuf,
    writer: BufWriter<fs::File>,
    written: u64,
    hasher: crc32fast::Hasher,
}

impl IncomingFile {
    async fn open(dir: &Path, meta: &FileMetadata, offset: u64) -> Result<Self> {
        let part_path = part_path(dir, &meta.file_name);
        let mut hasher = crc32fast::Hasher::new();

        if offset > 0 {
            // Hash the prefix we already hold so the final CRC covers the
            // whole file
            let mut existing = fs::File::open(&part_path).await?;
            let mut buf = vec![0u8; CHUNK_SIZE];
            let mut remaining = offset;
            while remaining > 0 {
                let want = remaining.min(CHUNK_SIZE as u64) as usize;
                let n = existing.read(&mut buf[..want]).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                remaining -= n as u64;
            }
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&part_path)
            .await?;
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        Ok(Self {
            meta: meta.clone(),
            part_path,
            writer: BufWriter::new(file),
            written: offset,
            hasher,
        })
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).await?;
        self.hasher.update(data);
        self.written += data.len() as u64;
        Ok(())
    }

    async fn finalize(mut self, dir: &Path) -> Result<()> {
        self.writer.flush().await?;
        drop(self.writer);

        if self.written != self.meta.file_size {
            return Err(ServiceError::Protocol(format!(
                "{}: received {} of {} bytes",
                self.meta.file_name, self.written, self.meta.file_size
            )));
        }
        let checksum = format!("{:08x}", self.hasher.finalize());
        if checksum != self.meta.integrity_hash {
            // Corrupt content is worthless for resume; discard it
            let _ = fs::remove_file(&self.part_path).await;
            return Err(ServiceError::Protocol(format!(
                "{}: checksum mismatch ({} != {})",
                self.meta.file_name, checksum, self.meta.integrity_hash
            )));
        }

        fs::rename(&self.part_path, dir.join(&self.meta.file_name)).await?;
        Ok(())
    }
}

fn part_path(dir: &Path, file_name: &str) -> PathBuf {
    dir.join(format!("{}.part", file_name))
}

/// Byte offset a previously interrupted transfer of this file stopped at.
async fn existing_offset(dir: &Path, meta: &FileMetadata) -> u64 {
    match fs::metadata(part_path(dir, &meta.file_name)).await {
        Ok(m) => m.len().min(meta.file_size),
        Err(_) => 0,
    }
}

/// Build the manifest entry for one local file, streaming it once for the
/// checksum.
pub async fn file_metadata(path: &Path) -> Result<FileMetadata> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| ServiceError::Protocol(format!("not a file path: {}", path.display())))?;
    let meta = fs::metadata(path).await?;

    let mut file = fs::File::open(path).await?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(FileMetadata {
        file_id: uuid::Uuid::new_v4().to_string(),
        file_name: file_name.clone(),
        file_size: meta.len(),
        mime_type: mime_type(&file_name),
        integrity_hash: format!("{:08x}", hasher.finalize()),
    })
}

/// Extension-based MIME guess; good enough for display purposes.
fn mime_type(file_name: &str) -> String {
    let ext = file_name.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn metadata_has_size_and_stable_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let meta = file_metadata(&path).await.unwrap();
        assert_eq!(meta.file_name, "hello.txt");
        assert_eq!(meta.file_size, 11);
        assert_eq!(meta.mime_type, "text/plain");

        let again = file_metadata(&path).await.unwrap();
        assert_eq!(meta.integrity_hash, again.integrity_hash);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(b"hello world");
        assert_eq!(meta.integrity_hash, format!("{:08x}", hasher.finalize()));
    }

    #[tokio::test]
    async fn existing_part_file_yields_resume_offset() {
        let dir = tempfile::tempdir().unwrap();
        let meta = FileMetadata {
            file_id: "f1".into(),
            file_name: "video.mp4".into(),
            file_size: 100,
            mime_type: "video/mp4".into(),
            integrity_hash: "0".repeat(8),
        };
        assert_eq!(existing_offset(dir.path(), &meta).await, 0);

        tokio::fs::write(dir.path().join("video.mp4.part"), vec![0u8; 40])
            .await
            .unwrap();
        assert_eq!(existing_offset(dir.path(), &meta).await, 40);

        // Never offer more than the file is long
        tokio::fs::write(dir.path().join("video.mp4.part"), vec![0u8; 200])
            .await
            .unwrap();
        assert_eq!(existing_offset(dir.path(), &meta).await, 100);
    }

    #[tokio::test]
    async fn incoming_file_resume_keeps_whole_file_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"abcdefghij";
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(content);
        let meta = FileMetadata {
            file_id: "f1".into(),
            file_name: "data.bin".into(),
            file_size: content.len() as u64,
            mime_type: "application/octet-stream".into(),
            integrity_hash: format!("{:08x}", hasher.finalize()),
        };

        // First half already on disk from an interrupted run
        tokio::fs::write(dir.path().join("data.bin.part"), &content[..5])
            .await
            .unwrap();

        let mut incoming = IncomingFile::open(dir.path(), &meta, 5).await.unwrap();
        incoming.write(&content[5..]).await.unwrap();
        incoming.finalize(dir.path()).await.unwrap();

        let done = tokio::fs::read(dir.path().join("data.bin")).await.unwrap();
        assert_eq!(done, content);
        assert!(!dir.path().join("data.bin.part").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_rejected_and_part_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let meta = FileMetadata {
            file_id: "f1".into(),
            file_name: "data.bin".into(),
            file_size: 4,
            mime_type: "application/octet-stream".into(),
            integrity_hash: "deadbeef".into(),
        };
        let mut incoming = IncomingFile::open(dir.path(), &meta, 0).await.unwrap();
        incoming.write(b"oops").await.unwrap();
        let err = incoming.finalize(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
        assert!(!dir.path().join("data.bin").exists());
        assert!(!dir.path().join("data.bin.part").exists());
    }

    #[test]
    fn mime_guess_by_extension() {
        assert_eq!(mime_type("photo.JPG"), "image/jpeg");
        assert_eq!(mime_type("notes.txt"), "text/plain");
        assert_eq!(mime_type("blob"), "application/octet-stream");
    }

    use std::net::SocketAddr;
    use std::time::Duration;

    use crate::connection::ConnectionStatus;
    use crate::device::DiscoveredDevice;

    fn loopback_conn(port: u16) -> PeerConnection {
        PeerConnection {
            connection_id: "c1".into(),
            peer_device: DiscoveredDevice {
                device_id: "d".repeat(32),
                device_name: "host".into(),
                user_id: "u".into(),
                user_nickname: "n".into(),
                ip_address: "127.0.0.1".parse().unwrap(),
                port,
                discovered_at: 0,
                last_seen: 0,
            },
            established_at: 0,
            status: ConnectionStatus::Connected,
            is_initiator: true,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_source_fails_the_session_and_forgets_it() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut rx) = broadcast::channel(16);
        let engine = TransferEngine::new(events, dir.path().to_path_buf());
        let transport = Transport::new(0).unwrap();

        // The call itself succeeds; the manifest is built in the session task
        let session_id = engine
            .send_files(transport, loopback_conn(1), vec![dir.path().join("gone.bin")])
            .unwrap();

        let failed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let ServiceEvent::TransferFailed { session_id: s, .. } = rx.recv().await.unwrap()
                {
                    return s;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(failed, session_id);

        // The entry lands before the task removes it, even on a fast failure
        tokio::time::timeout(Duration::from_secs(5), async {
            while !engine.sessions.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session entry was never removed");
    }

    async fn accept_frames(transport: &Transport) -> (FrameReader, FrameWriter) {
        let incoming = transport.endpoint.accept().await.unwrap();
        let conn = incoming.await.unwrap();
        let (send, recv) = conn.accept_bi().await.unwrap();
        (transport::frame_reader(recv), transport::frame_writer(send))
    }

    fn metadata_for(content: &[u8], name: &str) -> FileMetadata {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(content);
        FileMetadata {
            file_id: "f1".into(),
            file_name: name.into(),
            file_size: content.len() as u64,
            mime_type: "application/octet-stream".into(),
            integrity_hash: format!("{:08x}", hasher.finalize()),
        }
    }

    /// Drives `receive_session` over real loopback QUIC the way the accept
    /// loop does, with the test playing the sender.
    async fn scripted_receiver(
        meta: FileMetadata,
        download_dir: std::path::PathBuf,
    ) -> (
        tokio::task::JoinHandle<Result<()>>,
        FrameWriter,
        FrameReader,
        Transport,
    ) {
        let server = Transport::new(0).unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], server.local_addr().unwrap().port()));
        let client = Transport::new(0).unwrap();

        let total = meta.file_size;
        let files = vec![meta.clone()];
        let server_for_task = server.clone();
        let session = tokio::spawn(async move {
            let (mut reader, mut writer) = accept_frames(&server_for_task).await;
            // The offer frame opened the stream; the session starts after it
            transport::read_message(&mut reader).await.unwrap();
            let (events, _rx) = broadcast::channel(16);
            receive_session("s1", &files, total, &download_dir, &mut reader, &mut writer, &events)
                .await
        });

        let conn = client.connect(addr).await.unwrap();
        let (send, recv) = conn.open_bi().await.unwrap();
        let mut writer = transport::frame_writer(send);
        let reader = transport::frame_reader(recv);
        transport::write_message(
            &mut writer,
            &Message::FileOffer {
                session_id: "s1".into(),
                connection_id: "c1".into(),
                files: vec![meta],
                total_bytes: total,
            },
        )
        .await
        .unwrap();
        (session, writer, reader, client)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_start_at_unexpected_offset_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"0123456789";
        let meta = metadata_for(content, "data.bin");
        // Half the file already on disk from an earlier attempt
        tokio::fs::write(dir.path().join("data.bin.part"), &content[..5])
            .await
            .unwrap();

        let (session, mut writer, mut reader, _client) =
            scripted_receiver(meta, dir.path().to_path_buf()).await;

        match transport::read_message(&mut reader).await.unwrap() {
            Some(Message::OfferAccept { resume_offsets, .. }) => {
                assert_eq!(resume_offsets, vec![("f1".to_string(), 5)]);
            }
            other => panic!("expected OfferAccept, got {:?}", other),
        }

        // Restart from zero instead of the offered offset
        transport::write_message(
            &mut writer,
            &Message::FileStart {
                file_id: "f1".into(),
                offset: 0,
            },
        )
        .await
        .unwrap();

        match transport::read_message(&mut reader).await.unwrap() {
            Some(Message::FileFailed { reason, .. }) => {
                assert!(reason.contains("does not match expected"));
            }
            other => panic!("expected FileFailed, got {:?}", other),
        }
        let err = session.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("does not match expected"));

        // The partial stays for the next attempt
        let part = tokio::fs::read(dir.path().join("data.bin.part")).await.unwrap();
        assert_eq!(part, &content[..5]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn chunk_that_skips_bytes_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"0123456789";
        let meta = metadata_for(content, "data.bin");

        let (session, mut writer, mut reader, _client) =
            scripted_receiver(meta, dir.path().to_path_buf()).await;

        match transport::read_message(&mut reader).await.unwrap() {
            Some(Message::OfferAccept { resume_offsets, .. }) => {
                assert_eq!(resume_offsets, vec![("f1".to_string(), 0)]);
            }
            other => panic!("expected OfferAccept, got {:?}", other),
        }

        transport::write_message(
            &mut writer,
            &Message::FileStart {
                file_id: "f1".into(),
                offset: 0,
            },
        )
        .await
        .unwrap();
        // Skip ahead of what the receiver has written
        transport::write_message(
            &mut writer,
            &Message::FileChunk {
                file_id: "f1".into(),
                offset: 7,
                data: b"xyz".to_vec(),
            },
        )
        .await
        .unwrap();

        match transport::read_message(&mut reader).await.unwrap() {
            Some(Message::FileFailed { reason, .. }) => {
                assert!(reason.contains("does not align"));
            }
            other => panic!("expected FileFailed, got {:?}", other),
        }
        let err = session.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("does not align"));
        assert!(!dir.path().join("data.bin").exists());
    }
}
