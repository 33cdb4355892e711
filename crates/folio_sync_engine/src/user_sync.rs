//! Per-user bootstrap and cloud erasure detection.
//!
//! Before any upload is allowed, the user's device fingerprint must be
//! verified against (or installed into) the cloud-hosted device set. A
//! fingerprint that exists locally but not in the cloud means the cloud was
//! wiped since this device last synced; the owner is told to wipe local
//! state and start over via `on_version_mismatch`.

use crate::aggregator::Aggregator;
use crate::backoff::Backoff;
use crate::cloud::AuthProvider;
use crate::config::RetryConfig;
use crate::device_set::{
    fingerprint_path, generate_fingerprint, load_fingerprint, persist_fingerprint,
    DeviceSetCloud, FingerprintWatchEvent,
};
use crate::encryption::EncryptionService;
use crate::error::{SyncError, SyncResult};
use crate::ledger_sync::{LedgerSync, LedgerSyncImpl};
use crate::state::SyncStateWatcher;
use crate::tasks::TaskSet;
use folio_sync_protocol::{AppId, Fingerprint, Status};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Configuration for one user's sync.
#[derive(Debug, Clone)]
pub struct UserConfig {
    /// Directory holding this user's local sync state (fingerprint file).
    pub user_directory: PathBuf,
    /// Retry policy for the bootstrap check and the fingerprint watch.
    pub retry: RetryConfig,
    /// Retry policy handed down to every page.
    pub page_retry: RetryConfig,
}

impl UserConfig {
    /// Creates a configuration for a user directory.
    pub fn new(user_directory: impl Into<PathBuf>) -> Self {
        Self {
            user_directory: user_directory.into(),
            retry: RetryConfig::unbounded(),
            page_retry: RetryConfig::default(),
        }
    }

    /// Sets the bootstrap retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-page retry policy.
    pub fn with_page_retry(mut self, retry: RetryConfig) -> Self {
        self.page_retry = retry;
        self
    }
}

/// The per-user bootstrap and factory layer.
pub trait UserSync: Send + Sync {
    /// Starts the bootstrap: fingerprint verification, upload enablement,
    /// and the live erasure watch. Callable once.
    fn start(&self) -> SyncResult<()>;

    /// Creates the sync coordinator for one application.
    ///
    /// Upload is enabled on it immediately if the bootstrap already
    /// succeeded, and retroactively when it does.
    fn create_ledger_sync(
        &self,
        app_id: AppId,
        encryption: Arc<dyn EncryptionService>,
    ) -> SyncResult<Arc<LedgerSyncImpl>>;

    /// Sets the watcher receiving the user-level aggregated sync state.
    ///
    /// Settable at most once.
    fn set_sync_watcher(&self, watcher: Box<dyn SyncStateWatcher>) -> SyncResult<()>;

    /// Path of the locally persisted fingerprint file.
    fn fingerprint_path(&self) -> PathBuf;
}

struct UserShared {
    upload_enabled: bool,
    ledgers: Vec<Weak<LedgerSyncImpl>>,
    on_version_mismatch: Option<Box<dyn FnOnce() + Send>>,
}

/// Implementation of [`UserSync`].
pub struct UserSyncImpl {
    config: UserConfig,
    device_set: Arc<dyn DeviceSetCloud>,
    auth: Arc<dyn AuthProvider>,
    shared: Arc<Mutex<UserShared>>,
    aggregator: Aggregator,
    tasks: Mutex<TaskSet>,
    started: AtomicBool,
    watcher_set: AtomicBool,
}

impl UserSyncImpl {
    /// Creates a user sync layer.
    ///
    /// `on_version_mismatch` is invoked at most once, when cloud erasure is
    /// detected; the caller is expected to wipe all local page state and
    /// restart sync from scratch.
    pub fn new(
        config: UserConfig,
        device_set: Arc<dyn DeviceSetCloud>,
        auth: Arc<dyn AuthProvider>,
        on_version_mismatch: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            config,
            device_set,
            auth,
            shared: Arc::new(Mutex::new(UserShared {
                upload_enabled: false,
                ledgers: Vec::new(),
                on_version_mismatch: Some(on_version_mismatch),
            })),
            aggregator: Aggregator::new(),
            tasks: Mutex::new(TaskSet::new()),
            started: AtomicBool::new(false),
            watcher_set: AtomicBool::new(false),
        }
    }

    /// True once the bootstrap succeeded and upload is allowed.
    pub fn upload_enabled(&self) -> bool {
        self.shared.lock().upload_enabled
    }
}

impl UserSync for UserSyncImpl {
    fn start(&self) -> SyncResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Argument("user sync already started".into()));
        }

        let device_set = Arc::clone(&self.device_set);
        let shared = Arc::clone(&self.shared);
        let path = self.fingerprint_path();
        let retry = self.config.retry.clone();
        self.tasks
            .lock()
            .spawn(run_bootstrap(device_set, shared, path, retry));
        Ok(())
    }

    fn create_ledger_sync(
        &self,
        app_id: AppId,
        encryption: Arc<dyn EncryptionService>,
    ) -> SyncResult<Arc<LedgerSyncImpl>> {
        let listener = self.aggregator.get_new_state_watcher();
        let ledger = LedgerSyncImpl::new(
            app_id,
            encryption,
            Arc::clone(&self.auth),
            self.config.page_retry.clone(),
            Some(Box::new(listener)),
        );

        let mut shared = self.shared.lock();
        if shared.upload_enabled {
            ledger.enable_upload();
        }
        shared.ledgers.retain(|weak| weak.upgrade().is_some());
        shared.ledgers.push(Arc::downgrade(&ledger));
        Ok(ledger)
    }

    fn set_sync_watcher(&self, watcher: Box<dyn SyncStateWatcher>) -> SyncResult<()> {
        if self.watcher_set.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Argument("sync watcher already set".into()));
        }
        self.aggregator.set_base_watcher(watcher);
        Ok(())
    }

    fn fingerprint_path(&self) -> PathBuf {
        fingerprint_path(&self.config.user_directory)
    }
}

impl Drop for UserSyncImpl {
    fn drop(&mut self) {
        let live = self
            .shared
            .lock()
            .ledgers
            .iter()
            .filter(|weak| weak.upgrade().is_some())
            .count();
        if live != 0 {
            // Per-application instances must be dropped before their user.
            error!(live, "user sync dropped with live ledger syncs");
        }
    }
}

/// Detects cloud erasure: disables upload and fires the mismatch callback
/// exactly once.
fn fire_mismatch(shared: &Arc<Mutex<UserShared>>) {
    let callback = {
        let mut guard = shared.lock();
        guard.upload_enabled = false;
        guard.on_version_mismatch.take()
    };
    if let Some(callback) = callback {
        info!("cloud erasure detected, requesting local reset");
        callback();
    }
}

/// Marks the bootstrap successful and enables upload on every live ledger.
fn enable_all(shared: &Arc<Mutex<UserShared>>) {
    let ledgers: Vec<Arc<LedgerSyncImpl>> = {
        let mut guard = shared.lock();
        guard.upload_enabled = true;
        guard.ledgers.retain(|weak| weak.upgrade().is_some());
        guard
            .ledgers
            .iter()
            .filter_map(|weak| weak.upgrade())
            .collect()
    };
    for ledger in ledgers {
        ledger.enable_upload();
    }
}

/// The bootstrap sequence: verify or install the fingerprint, enable
/// upload, then watch for mid-session erasure.
async fn run_bootstrap(
    device_set: Arc<dyn DeviceSetCloud>,
    shared: Arc<Mutex<UserShared>>,
    path: PathBuf,
    retry: RetryConfig,
) {
    let mut backoff = Backoff::new(retry.clone());

    let fingerprint = loop {
        match load_fingerprint(&path) {
            Ok(Some(fingerprint)) => match device_set.check_fingerprint(&fingerprint).await {
                Ok(()) => break fingerprint,
                Err(Status::NotFound) => {
                    fire_mismatch(&shared);
                    return;
                }
                Err(status) if status.is_retryable() => {
                    match backoff.next_delay() {
                        Some(delay) => {
                            warn!(%status, ?delay, "fingerprint check failed, retrying");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            warn!(%status, "fingerprint check retries exhausted");
                            return;
                        }
                    }
                }
                Err(status) => {
                    // Sync degrades to local-only.
                    warn!(%status, "fingerprint check rejected, staying local-only");
                    return;
                }
            },
            Ok(None) => {
                let fingerprint = generate_fingerprint();
                match device_set.set_fingerprint(&fingerprint).await {
                    Ok(()) => {
                        // Persist only after the cloud accepted the value,
                        // so a local fingerprint always has a remote twin.
                        if let Err(err) = persist_fingerprint(&path, &fingerprint) {
                            error!(%err, "failed to persist fingerprint");
                            return;
                        }
                        break fingerprint;
                    }
                    Err(status) if status.is_retryable() => match backoff.next_delay() {
                        Some(delay) => {
                            warn!(%status, ?delay, "fingerprint install failed, retrying");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            warn!(%status, "fingerprint install retries exhausted");
                            return;
                        }
                    },
                    Err(status) => {
                        warn!(%status, "fingerprint install rejected, staying local-only");
                        return;
                    }
                }
            }
            Err(err) => {
                error!(%err, "failed to read fingerprint file");
                return;
            }
        }
    };

    backoff.reset();
    debug!(fingerprint = %fingerprint, "device fingerprint verified");

    if let Err(status) = device_set.update_timestamp(&fingerprint).await {
        debug!(%status, "fingerprint timestamp refresh failed");
    }

    enable_all(&shared);
    watch_fingerprint(device_set, shared, fingerprint, retry).await;
}

/// Maintains the live erasure watch. Network failures re-install the watch
/// after backoff without re-running the fingerprint check.
async fn watch_fingerprint(
    device_set: Arc<dyn DeviceSetCloud>,
    shared: Arc<Mutex<UserShared>>,
    fingerprint: Fingerprint,
    retry: RetryConfig,
) {
    let mut backoff = Backoff::new(retry);
    loop {
        let (tx, mut rx) = mpsc::channel(4);
        match device_set.watch_fingerprint(&fingerprint, tx).await {
            Ok(()) => backoff.reset(),
            Err(Status::NotFound) => {
                fire_mismatch(&shared);
                return;
            }
            Err(status) if status.is_retryable() => {
                match backoff.next_delay() {
                    Some(delay) => {
                        warn!(%status, ?delay, "fingerprint watch install failed, retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    None => {
                        warn!(%status, "fingerprint watch retries exhausted");
                        return;
                    }
                }
            }
            Err(status) => {
                warn!(%status, "fingerprint watch rejected");
                return;
            }
        }

        while let Some(event) = rx.recv().await {
            match event {
                FingerprintWatchEvent::Erased => {
                    fire_mismatch(&shared);
                    return;
                }
                FingerprintWatchEvent::Error(status) if status.is_retryable() => {
                    warn!(%status, "fingerprint watch interrupted");
                    break;
                }
                FingerprintWatchEvent::Error(status) => {
                    warn!(%status, "fingerprint watch failed");
                    return;
                }
            }
        }

        // The watch ended; re-install it after backoff.
        match backoff.next_delay() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => {
                warn!("fingerprint watch retries exhausted");
                return;
            }
        }
    }
}
