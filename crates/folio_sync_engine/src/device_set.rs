//! Cloud device-fingerprint set and the local fingerprint file.
//!
//! Each device generates one random fingerprint, persists it locally, and
//! mirrors it as a key in a cloud-hosted per-user map. A fingerprint that
//! disappears from the cloud while the local copy survives proves the cloud
//! was erased since this device last synced.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use folio_sync_protocol::{Fingerprint, Status};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// File name of the per-user fingerprint file.
pub const FINGERPRINT_FILE: &str = "fingerprint";

/// Number of random bytes in a generated fingerprint.
const FINGERPRINT_BYTES: usize = 16;

/// Events delivered through a fingerprint watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintWatchEvent {
    /// The watched fingerprint was erased from the cloud.
    Erased,
    /// The watch failed; it is no longer active.
    Error(Status),
}

/// The cloud-hosted per-user device fingerprint set.
#[async_trait]
pub trait DeviceSetCloud: Send + Sync {
    /// Confirms the fingerprint is still listed in the cloud set.
    ///
    /// `Err(Status::NotFound)` means the fingerprint was erased.
    async fn check_fingerprint(&self, fingerprint: &Fingerprint) -> Result<(), Status>;

    /// Installs the fingerprint in the cloud set.
    async fn set_fingerprint(&self, fingerprint: &Fingerprint) -> Result<(), Status>;

    /// Watches the fingerprint for erasure.
    ///
    /// Registering a watch for a fingerprint replaces any previous watch
    /// for it; at most one registration is active per device.
    async fn watch_fingerprint(
        &self,
        fingerprint: &Fingerprint,
        sender: mpsc::Sender<FingerprintWatchEvent>,
    ) -> Result<(), Status>;

    /// Removes every fingerprint from the cloud set.
    async fn erase_all_fingerprints(&self) -> Result<(), Status>;

    /// Refreshes the last-seen timestamp associated with the fingerprint.
    async fn update_timestamp(&self, fingerprint: &Fingerprint) -> Result<(), Status>;
}

/// Returns the fingerprint file path inside a user directory.
pub fn fingerprint_path(user_directory: &Path) -> PathBuf {
    user_directory.join(FINGERPRINT_FILE)
}

/// Generates a fresh random fingerprint.
pub fn generate_fingerprint() -> Fingerprint {
    let mut bytes = [0u8; FINGERPRINT_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    Fingerprint::new(hex::encode(bytes))
}

/// Loads the locally persisted fingerprint, if any.
pub fn load_fingerprint(path: &Path) -> SyncResult<Option<Fingerprint>> {
    match std::fs::read_to_string(path) {
        Ok(value) => {
            let value = value.trim();
            if value.is_empty() {
                return Ok(None);
            }
            Ok(Some(Fingerprint::new(value)))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(SyncError::Storage(format!(
            "failed to read fingerprint file: {err}"
        ))),
    }
}

/// Persists the fingerprint locally.
///
/// Callers must only do this after the cloud install succeeded, so a local
/// fingerprint never exists without its remote counterpart.
pub fn persist_fingerprint(path: &Path, fingerprint: &Fingerprint) -> SyncResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            SyncError::Storage(format!("failed to create user directory: {err}"))
        })?;
    }
    std::fs::write(path, fingerprint.as_str())
        .map_err(|err| SyncError::Storage(format!("failed to write fingerprint file: {err}")))
}

#[derive(Default)]
struct DeviceSetInner {
    fingerprints: HashMap<Fingerprint, u64>,
    watchers: HashMap<Fingerprint, mpsc::Sender<FingerprintWatchEvent>>,
    check_failures: VecDeque<Status>,
    set_failures: VecDeque<Status>,
    watch_failures: VecDeque<Status>,
    check_calls: u64,
    timestamp_updates: u64,
}

/// An in-memory device set for testing.
#[derive(Default)]
pub struct InMemoryDeviceSet {
    inner: Mutex<DeviceSetInner>,
}

impl InMemoryDeviceSet {
    /// Creates an empty device set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a fingerprint directly, as pre-existing cloud state.
    pub fn seed_fingerprint(&self, fingerprint: Fingerprint) {
        self.inner.lock().fingerprints.insert(fingerprint, 0);
    }

    /// Makes the next `check_fingerprint` call fail with the given status.
    pub fn fail_next_check(&self, status: Status) {
        self.inner.lock().check_failures.push_back(status);
    }

    /// Makes the next `set_fingerprint` call fail with the given status.
    pub fn fail_next_set(&self, status: Status) {
        self.inner.lock().set_failures.push_back(status);
    }

    /// Makes the next `watch_fingerprint` call fail with the given status.
    pub fn fail_next_watch(&self, status: Status) {
        self.inner.lock().watch_failures.push_back(status);
    }

    /// Sends a network error to the live watcher of a fingerprint and
    /// drops the registration.
    pub fn break_watch(&self, fingerprint: &Fingerprint, status: Status) {
        if let Some(sender) = self.inner.lock().watchers.remove(fingerprint) {
            tokio::spawn(async move {
                let _ = sender.send(FingerprintWatchEvent::Error(status)).await;
            });
        }
    }

    /// Returns true if the fingerprint is installed.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.inner.lock().fingerprints.contains_key(fingerprint)
    }

    /// Returns how many fingerprint checks were performed.
    pub fn check_calls(&self) -> u64 {
        self.inner.lock().check_calls
    }

    /// Returns how many timestamp refreshes were performed.
    pub fn timestamp_updates(&self) -> u64 {
        self.inner.lock().timestamp_updates
    }

    /// Returns true if a watch is registered for the fingerprint.
    pub fn has_watcher(&self, fingerprint: &Fingerprint) -> bool {
        self.inner.lock().watchers.contains_key(fingerprint)
    }
}

#[async_trait]
impl DeviceSetCloud for InMemoryDeviceSet {
    async fn check_fingerprint(&self, fingerprint: &Fingerprint) -> Result<(), Status> {
        let mut inner = self.inner.lock();
        inner.check_calls += 1;
        if let Some(status) = inner.check_failures.pop_front() {
            return Err(status);
        }
        if inner.fingerprints.contains_key(fingerprint) {
            Ok(())
        } else {
            Err(Status::NotFound)
        }
    }

    async fn set_fingerprint(&self, fingerprint: &Fingerprint) -> Result<(), Status> {
        let mut inner = self.inner.lock();
        if let Some(status) = inner.set_failures.pop_front() {
            return Err(status);
        }
        inner.fingerprints.insert(fingerprint.clone(), 0);
        Ok(())
    }

    async fn watch_fingerprint(
        &self,
        fingerprint: &Fingerprint,
        sender: mpsc::Sender<FingerprintWatchEvent>,
    ) -> Result<(), Status> {
        let mut inner = self.inner.lock();
        if let Some(status) = inner.watch_failures.pop_front() {
            return Err(status);
        }
        inner.watchers.insert(fingerprint.clone(), sender);
        Ok(())
    }

    async fn erase_all_fingerprints(&self) -> Result<(), Status> {
        let mut inner = self.inner.lock();
        inner.fingerprints.clear();
        let watchers = std::mem::take(&mut inner.watchers);
        drop(inner);
        for (_, sender) in watchers {
            tokio::spawn(async move {
                let _ = sender.send(FingerprintWatchEvent::Erased).await;
            });
        }
        Ok(())
    }

    async fn update_timestamp(&self, fingerprint: &Fingerprint) -> Result<(), Status> {
        let mut inner = self.inner.lock();
        inner.timestamp_updates += 1;
        match inner.fingerprints.get_mut(fingerprint) {
            Some(timestamp) => {
                *timestamp += 1;
                Ok(())
            }
            None => Err(Status::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_fingerprints_are_unique_hex() {
        let a = generate_fingerprint();
        let b = generate_fingerprint();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), FINGERPRINT_BYTES * 2);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = fingerprint_path(dir.path());

        assert_eq!(load_fingerprint(&path).unwrap(), None);

        let fp = generate_fingerprint();
        persist_fingerprint(&path, &fp).unwrap();
        assert_eq!(load_fingerprint(&path).unwrap(), Some(fp));
    }

    #[tokio::test]
    async fn check_reports_missing_fingerprint() {
        let set = InMemoryDeviceSet::new();
        let fp = Fingerprint::from("some-value");
        assert_eq!(set.check_fingerprint(&fp).await, Err(Status::NotFound));

        set.seed_fingerprint(fp.clone());
        assert_eq!(set.check_fingerprint(&fp).await, Ok(()));
    }

    #[tokio::test]
    async fn erase_notifies_watchers() {
        let set = InMemoryDeviceSet::new();
        let fp = Fingerprint::from("some-value");
        set.seed_fingerprint(fp.clone());

        let (tx, mut rx) = mpsc::channel(2);
        set.watch_fingerprint(&fp, tx).await.unwrap();
        set.erase_all_fingerprints().await.unwrap();

        assert_eq!(rx.recv().await, Some(FingerprintWatchEvent::Erased));
        assert!(!set.contains(&fp));
    }

    #[tokio::test]
    async fn timestamp_refresh_requires_presence() {
        let set = InMemoryDeviceSet::new();
        let fp = Fingerprint::from("some-value");
        assert_eq!(set.update_timestamp(&fp).await, Err(Status::NotFound));

        set.seed_fingerprint(fp.clone());
        assert_eq!(set.update_timestamp(&fp).await, Ok(()));
        assert_eq!(set.timestamp_updates(), 2);
    }
}
