//! Flat-file persistence under the app data directory.
//!
//! Two things survive restarts: the generated device id (so the advertised
//! identity is stable) and, on desktop, the saved-credentials map. Paths are
//! passed in rather than resolved here so core code and tests stay free of
//! the Tauri runtime; lib.rs supplies the real app data dir.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

const DEVICE_ID_FILE: &str = "device_id";
const CREDENTIALS_FILE: &str = "credentials.json";

/// Persisted device id, or empty string when none exists yet.
pub fn load_device_id(data_dir: &Path) -> String {
    fs::read_to_string(data_dir.join(DEVICE_ID_FILE))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

pub fn save_device_id(data_dir: &Path, device_id: &str) {
    if let Err(e) = fs::create_dir_all(data_dir) {
        tracing::error!("Failed to create data dir: {}", e);
        return;
    }
    if let Err(e) = fs::write(data_dir.join(DEVICE_ID_FILE), device_id) {
        tracing::error!("Failed to write device id: {}", e);
    }
}

pub fn load_credentials(data_dir: &Path) -> HashMap<String, String> {
    let path = data_dir.join(CREDENTIALS_FILE);
    if !path.exists() {
        return HashMap::new();
    }

    match fs::read_to_string(&path) {
        Ok(content) => match serde_json::from_str::<HashMap<String, String>>(&content) {
            Ok(creds) => creds,
            Err(e) => {
                tracing::error!("Failed to parse credentials file: {}", e);
                HashMap::new()
            }
        },
        Err(e) => {
            tracing::error!("Failed to read credentials file: {}", e);
            HashMap::new()
        }
    }
}

pub fn save_credentials(data_dir: &Path, creds: &HashMap<String, String>) {
    if let Err(e) = fs::create_dir_all(data_dir) {
        tracing::error!("Failed to create data dir: {}", e);
        return;
    }
    let path = data_dir.join(CREDENTIALS_FILE);

    match serde_json::to_string_pretty(creds) {
        Ok(json) => {
            if let Err(e) = fs::write(path, json) {
                tracing::error!("Failed to write credentials file: {}", e);
            }
        }
        Err(e) => {
            tracing::error!("Failed to serialize credentials: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_device_id(dir.path()), "");
        save_device_id(dir.path(), "abc123");
        assert_eq!(load_device_id(dir.path()), "abc123");
    }

    #[test]
    fn credentials_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut creds = HashMap::new();
        creds.insert("alice".to_string(), "secret".to_string());
        save_credentials(dir.path(), &creds);
        assert_eq!(load_credentials(dir.path()), creds);
    }
}
