pub mod connection;
pub mod device;
pub mod discovery;
pub mod error;
pub mod events;
pub mod identity;
pub mod liveness;
pub mod platform;
pub mod progress;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod state;
pub mod storage;
pub mod transfer;
pub mod transport;

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tauri::{AppHandle, Emitter, Manager};
use tokio::sync::broadcast;
use tracing_appender::non_blocking::WorkerGuard;

use connection::{PeerConnection, PeerConnectionRequest};
use device::DiscoveredDevice;
use events::ServiceEvent;
use platform::Capabilities;
use service::ServiceConfig;
use state::AppState;

// The appender guard must live as long as the process or buffered log lines
// are lost on exit
static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

fn init_tracing(log_dir: &Path) {
    use tracing_subscriber::EnvFilter;

    let appender = tracing_appender::rolling::daily(log_dir, "landrop.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    if LOG_GUARD.set(guard).is_err() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
}

#[tauri::command]
async fn start_service(
    user_id: String,
    user_nickname: String,
    state: tauri::State<'_, AppState>,
    app_handle: AppHandle,
) -> Result<(), String> {
    let data_dir = app_handle
        .path()
        .app_data_dir()
        .map_err(|e| e.to_string())?;
    let download_dir = app_handle
        .path()
        .download_dir()
        .unwrap_or_else(|_| data_dir.join("downloads"));

    // Stable advertised identity across restarts
    let mut device_id = storage::load_device_id(&data_dir);
    if device_id.is_empty() {
        device_id = identity::generate_device_id();
        storage::save_device_id(&data_dir, &device_id);
        tracing::info!("Generated new device id: {}", device_id);
    }

    let device_name = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "Unknown Device".to_string());

    let config = ServiceConfig {
        user_id,
        user_nickname,
        device_id,
        device_name,
        port: 0,
        download_dir,
        enable_mdns: true,
    };
    state.start_service(config).await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn stop_service(state: tauri::State<'_, AppState>) -> Result<(), String> {
    state.stop_service().await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn list_discovered_devices(
    state: tauri::State<'_, AppState>,
) -> Result<Vec<DiscoveredDevice>, String> {
    state.list_devices().await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn request_connection(
    device_id: String,
    state: tauri::State<'_, AppState>,
) -> Result<String, String> {
    state
        .request_connection(&device_id)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn respond_to_connection(
    connection_id: String,
    accept: bool,
    state: tauri::State<'_, AppState>,
) -> Result<(), String> {
    state
        .respond_to_connection(&connection_id, accept)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn disconnect(connection_id: String, state: tauri::State<'_, AppState>) -> Result<(), String> {
    state
        .disconnect(&connection_id)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn list_active_connections(
    state: tauri::State<'_, AppState>,
) -> Result<Vec<PeerConnection>, String> {
    state.list_active().await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn list_pending_requests(
    state: tauri::State<'_, AppState>,
) -> Result<Vec<PeerConnectionRequest>, String> {
    state.list_pending().await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn send_files(
    connection_id: String,
    file_paths: Vec<String>,
    state: tauri::State<'_, AppState>,
) -> Result<String, String> {
    let paths: Vec<PathBuf> = file_paths.into_iter().map(PathBuf::from).collect();
    state
        .send_files(&connection_id, paths)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
fn get_local_ip() -> String {
    local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

#[tauri::command]
fn get_capabilities(state: tauri::State<'_, AppState>) -> Capabilities {
    state.platform.capabilities()
}

#[tauri::command]
fn get_menu_entries(state: tauri::State<'_, AppState>) -> Vec<&'static str> {
    state.platform.capabilities().menu_entries()
}

#[tauri::command]
fn save_password(
    account: String,
    password: String,
    state: tauri::State<'_, AppState>,
) -> Result<(), String> {
    state
        .platform
        .store_password(&account, &password)
        .map_err(|e| e.to_string())
}

#[tauri::command]
fn get_saved_password(
    account: String,
    state: tauri::State<'_, AppState>,
) -> Result<Option<String>, String> {
    state
        .platform
        .load_password(&account)
        .map_err(|e| e.to_string())
}

fn emit_event(app: &AppHandle, event: ServiceEvent) {
    let result = match event {
        ServiceEvent::DeviceUpdated(device) => app.emit("device-update", &device),
        ServiceEvent::DeviceRemoved { device_id } => app.emit("device-remove", &device_id),
        ServiceEvent::ConnectionRequested(request) => app.emit("connection-request", &request),
        ServiceEvent::ConnectionEstablished(conn) => app.emit("connection-update", &conn),
        ServiceEvent::ConnectionRejected { connection_id } => {
            app.emit("connection-rejected", &connection_id)
        }
        ServiceEvent::ConnectionClosed { connection_id } => {
            app.emit("connection-close", &connection_id)
        }
        ServiceEvent::TransferProgress(progress) => app.emit("transfer-progress", &progress),
        ServiceEvent::TransferCompleted(done) => app.emit("transfer-complete", &done),
        ServiceEvent::TransferFailed { session_id, reason } => {
            app.emit("transfer-failed", &(session_id, reason))
        }
    };
    if let Err(e) = result {
        tracing::warn!("Failed to emit event: {}", e);
    }
}

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    #[allow(unused_mut)]
    let mut builder = tauri::Builder::default();
    #[cfg(desktop)]
    {
        builder = builder.plugin(tauri_plugin_single_instance::init(|_app, _args, _cwd| {}));
    }

    builder
        .plugin(tauri_plugin_opener::init())
        .setup(|app| {
            let data_dir = app.path().app_data_dir()?;
            init_tracing(&data_dir.join("logs"));

            let state = AppState::new(platform::platform_adapter(&data_dir));
            let mut events = state.subscribe();
            app.manage(state);

            // Bridge service events onto the webview event bus
            let handle = app.handle().clone();
            tauri::async_runtime::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => emit_event(&handle, event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("Event bridge lagged, skipped {}", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            start_service,
            stop_service,
            list_discovered_devices,
            request_connection,
            respond_to_connection,
            disconnect,
            list_active_connections,
            list_pending_requests,
            send_files,
            get_local_ip,
            get_capabilities,
            get_menu_entries,
            save_password,
            get_saved_password
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
