//! Host-class capabilities and the per-account session lock.
//!
//! Desktop gets the full feature set: credential storage, the subsystem's
//! own windows, and a real cross-process lock. The constrained host (mobile)
//! runs single-window with no credential store; its lock check is a stub
//! that honors the same contract and always reports no conflict, so callers
//! never need to know which adapter is active.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{Result, ServiceError};
use crate::storage;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub credential_storage: bool,
    pub multi_window: bool,
    pub meeting_entry: bool,
    pub file_dialogs: bool,
}

impl Capabilities {
    /// Menu entries the UI may show on this host. Unsupported entries are
    /// omitted, not disabled.
    pub fn menu_entries(&self) -> Vec<&'static str> {
        let mut entries = vec!["devices", "transfers"];
        if self.meeting_entry {
            entries.push("join-meeting");
        }
        if self.file_dialogs {
            entries.push("browse-files");
        }
        entries
    }
}

/// Held while the transfer service runs for an account; releasing it (drop)
/// frees the lock for other local instances.
pub struct SessionLockGuard {
    path: Option<PathBuf>,
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            let _ = fs::remove_file(path);
        }
    }
}

pub trait PlatformAdapter: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Errors with SessionLockHeld when another local instance already runs
    /// the service for this account.
    fn acquire_session_lock(&self, user_id: &str) -> Result<SessionLockGuard>;

    fn store_password(&self, account: &str, password: &str) -> Result<()>;
    fn load_password(&self, account: &str) -> Result<Option<String>>;
}

pub struct DesktopPlatform {
    data_dir: PathBuf,
}

impl DesktopPlatform {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn lock_path(&self, user_id: &str) -> PathBuf {
        self.data_dir.join(format!("session-{}.lock", user_id))
    }
}

impl PlatformAdapter for DesktopPlatform {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            credential_storage: true,
            multi_window: true,
            meeting_entry: true,
            file_dialogs: true,
        }
    }

    fn acquire_session_lock(&self, user_id: &str) -> Result<SessionLockGuard> {
        fs::create_dir_all(&self.data_dir)?;
        let path = self.lock_path(user_id);
        if path.exists() {
            let holder = fs::read_to_string(&path).unwrap_or_default();
            if holder.trim() == std::process::id().to_string() {
                // Our own lock from a restart within this process
                return Ok(SessionLockGuard { path: Some(path) });
            }
            return Err(ServiceError::SessionLockHeld(user_id.to_string()));
        }
        fs::write(&path, std::process::id().to_string())?;
        Ok(SessionLockGuard { path: Some(path) })
    }

    fn store_password(&self, account: &str, password: &str) -> Result<()> {
        let mut creds = storage::load_credentials(&self.data_dir);
        creds.insert(account.to_string(), password.to_string());
        storage::save_credentials(&self.data_dir, &creds);
        Ok(())
    }

    fn load_password(&self, account: &str) -> Result<Option<String>> {
        Ok(storage::load_credentials(&self.data_dir).remove(account))
    }
}

pub struct ConstrainedPlatform;

impl ConstrainedPlatform {
    fn unsupported() -> ServiceError {
        ServiceError::PlatformUnsupported(
            "Saved passwords are not available on this platform, please enter it manually"
                .to_string(),
        )
    }
}

impl PlatformAdapter for ConstrainedPlatform {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            credential_storage: false,
            multi_window: false,
            meeting_entry: false,
            file_dialogs: false,
        }
    }

    fn acquire_session_lock(&self, _user_id: &str) -> Result<SessionLockGuard> {
        // No cross-process detection is possible here; report no conflict
        Ok(SessionLockGuard { path: None })
    }

    fn store_password(&self, _account: &str, _password: &str) -> Result<()> {
        Err(Self::unsupported())
    }

    fn load_password(&self, _account: &str) -> Result<Option<String>> {
        Err(Self::unsupported())
    }
}

/// Adapter for the host this build targets, selected once at startup.
pub fn platform_adapter(data_dir: &Path) -> Arc<dyn PlatformAdapter> {
    #[cfg(desktop)]
    {
        Arc::new(DesktopPlatform::new(data_dir))
    }
    #[cfg(not(desktop))]
    {
        let _ = data_dir;
        Arc::new(ConstrainedPlatform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desktop_lock_conflicts_then_releases() {
        let dir = tempfile::tempdir().unwrap();
        let platform = DesktopPlatform::new(dir.path());

        let guard = platform.acquire_session_lock("user-1").unwrap();
        // Fake a second local instance by planting a foreign pid
        let path = dir.path().join("session-user-1.lock");
        std::fs::write(&path, "999999").unwrap();
        assert!(matches!(
            platform.acquire_session_lock("user-1"),
            Err(ServiceError::SessionLockHeld(_))
        ));

        drop(guard);
        assert!(!path.exists());
        let _guard = platform.acquire_session_lock("user-1").unwrap();
    }

    #[test]
    fn desktop_lock_is_per_account() {
        let dir = tempfile::tempdir().unwrap();
        let platform = DesktopPlatform::new(dir.path());
        let _a = platform.acquire_session_lock("user-1").unwrap();
        let _b = platform.acquire_session_lock("user-2").unwrap();
    }

    #[test]
    fn desktop_credentials_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let platform = DesktopPlatform::new(dir.path());
        platform.store_password("alice", "hunter2").unwrap();
        assert_eq!(
            platform.load_password("alice").unwrap(),
            Some("hunter2".to_string())
        );
        assert_eq!(platform.load_password("bob").unwrap(), None);
    }

    #[test]
    fn constrained_lock_always_reports_no_conflict() {
        let platform = ConstrainedPlatform;
        let _a = platform.acquire_session_lock("user-1").unwrap();
        let _b = platform.acquire_session_lock("user-1").unwrap();
    }

    #[test]
    fn constrained_credentials_surface_actionable_error() {
        let platform = ConstrainedPlatform;
        let err = platform.store_password("alice", "x").unwrap_err();
        assert!(err.to_string().contains("manually"));
        assert!(matches!(err, ServiceError::PlatformUnsupported(_)));
    }

    #[test]
    fn desktop_menu_lists_every_entry() {
        let entries = DesktopPlatform::new("/tmp").capabilities().menu_entries();
        assert_eq!(
            entries,
            vec!["devices", "transfers", "join-meeting", "browse-files"]
        );
    }

    #[test]
    fn constrained_menu_omits_multi_window_entries() {
        let entries = ConstrainedPlatform.capabilities().menu_entries();
        assert!(!entries.contains(&"join-meeting"));
        assert!(!entries.contains(&"browse-files"));
        assert!(entries.contains(&"devices"));
    }
}
