//! Per-page sync coordination.
//!
//! One [`PageSyncImpl`] owns the download and upload state machines for a
//! single page and runs them on one event loop: every pending remote call,
//! storage call, and backoff timer is a task that posts a typed event onto
//! the page's queue, and all state transitions happen in the loop. Nothing
//! here is re-entrant and no callback ever runs against a destroyed page.

use crate::cloud::{AuthProvider, CommitPack, PageCloud, RemoteNotification};
use crate::config::RetryConfig;
use crate::download::PageDownload;
use crate::encryption::EncryptionService;
use crate::error::{SyncError, SyncResult};
use crate::state::{SyncStateContainer, SyncStateWatcher};
use crate::storage::{CommitBatch, CommitSource, PageStorage};
use crate::tasks::TaskSet;
use crate::upload::{PageUpload, UploadOutcome};
use folio_sync_protocol::{PageId, PositionToken};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Events consumed by a page's run loop.
pub(crate) enum PageEvent {
    /// Upload was enabled by the owner.
    EnableUpload,
    /// The backlog fetch finished.
    BacklogResult(SyncResult<CommitPack>),
    /// An apply pass finished.
    BatchApplied {
        /// Outcome of the pass.
        result: SyncResult<()>,
        /// Cursor the pass persisted, if any.
        token: Option<PositionToken>,
        /// Whether this was the backlog pass.
        backlog: bool,
    },
    /// The live remote watch registration finished.
    WatcherInstalled(SyncResult<()>),
    /// A live watch notification arrived.
    Remote(RemoteNotification),
    /// The download retry timer fired.
    RetryDownload,
    /// Storage reported commits entering the log.
    LocalCommits(CommitBatch),
    /// An upload batch finished.
    UploadBatch(UploadOutcome),
    /// The upload retry timer fired.
    RetryUpload,
}

/// Shared handles the state machines use to spawn their I/O tasks.
pub(crate) struct PageContext {
    pub(crate) storage: Arc<dyn PageStorage>,
    pub(crate) cloud: Arc<dyn PageCloud>,
    pub(crate) auth: Arc<dyn AuthProvider>,
    pub(crate) encryption: Arc<dyn EncryptionService>,
    pub(crate) events: mpsc::UnboundedSender<PageEvent>,
    pub(crate) tasks: TaskSet,
    pub(crate) retry: RetryConfig,
    pub(crate) page_id: PageId,
}

/// The per-page upload/download coordinator.
pub trait PageSync: Send + Sync {
    /// Starts syncing. Callable once; download begins immediately, upload
    /// once [`PageSync::enable_upload`] has been called.
    fn start(&self) -> SyncResult<()>;

    /// Enables upload. Idempotent; callable before or after `start`.
    fn enable_upload(&self);

    /// Sets the callback fired every time the page becomes idle.
    ///
    /// Settable at most once, before `start`.
    fn set_on_idle(&self, callback: Box<dyn Fn() + Send + Sync>) -> SyncResult<()>;

    /// Sets the one-shot callback fired when the backlog download finishes.
    ///
    /// Settable at most once, before `start`.
    fn set_on_backlog_downloaded(&self, callback: Box<dyn Fn() + Send + Sync>) -> SyncResult<()>;

    /// Sets the page-level state watcher.
    ///
    /// Settable at most once, before `start`.
    fn set_sync_watcher(&self, watcher: Box<dyn SyncStateWatcher>) -> SyncResult<()>;

    /// True iff both the download and upload halves report an idle or
    /// stopped state.
    fn is_idle(&self) -> bool;
}

/// Everything a page needs to construct its sync coordinator.
pub struct PageSyncArgs {
    /// The page being synchronized.
    pub page_id: PageId,
    /// Local commit storage for this page.
    pub storage: Arc<dyn PageStorage>,
    /// Cloud transport handle for this page; not shared with other pages.
    pub cloud: Arc<dyn PageCloud>,
    /// Auth token source.
    pub auth: Arc<dyn AuthProvider>,
    /// Commit/object encryption.
    pub encryption: Arc<dyn EncryptionService>,
    /// Retry policy for every backoff in this page.
    pub retry: RetryConfig,
    /// Called at most once, when the page hits an unrecoverable error.
    /// The owner must tear the page down afterwards.
    pub on_unrecoverable: Option<Box<dyn FnOnce(SyncError) + Send>>,
    /// Watcher owned by the encompassing aggregation layer.
    pub ledger_watcher: Option<Box<dyn SyncStateWatcher>>,
}

struct PageSetup {
    storage: Arc<dyn PageStorage>,
    cloud: Arc<dyn PageCloud>,
    auth: Arc<dyn AuthProvider>,
    encryption: Arc<dyn EncryptionService>,
    retry: RetryConfig,
    receiver: mpsc::UnboundedReceiver<PageEvent>,
    on_idle: Option<Box<dyn Fn() + Send + Sync>>,
    on_backlog_downloaded: Option<Box<dyn Fn() + Send + Sync>>,
    watcher: Option<Box<dyn SyncStateWatcher>>,
    ledger_watcher: Option<Box<dyn SyncStateWatcher>>,
    on_unrecoverable: Option<Box<dyn FnOnce(SyncError) + Send>>,
}

/// Implementation of [`PageSync`].
pub struct PageSyncImpl {
    page_id: PageId,
    events: mpsc::UnboundedSender<PageEvent>,
    mirror: Arc<Mutex<SyncStateContainer>>,
    setup: Mutex<Option<PageSetup>>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PageSyncImpl {
    /// Creates a page sync coordinator; nothing runs until `start`.
    pub fn new(args: PageSyncArgs) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        Self {
            page_id: args.page_id,
            events,
            mirror: Arc::new(Mutex::new(SyncStateContainer::default())),
            setup: Mutex::new(Some(PageSetup {
                storage: args.storage,
                cloud: args.cloud,
                auth: args.auth,
                encryption: args.encryption,
                retry: args.retry,
                receiver,
                on_idle: None,
                on_backlog_downloaded: None,
                watcher: None,
                ledger_watcher: args.ledger_watcher,
                on_unrecoverable: args.on_unrecoverable,
            })),
            run_handle: Mutex::new(None),
        }
    }

    /// The page this coordinator syncs.
    pub fn page_id(&self) -> &PageId {
        &self.page_id
    }

    fn with_setup<T>(
        &self,
        configure: impl FnOnce(&mut PageSetup) -> SyncResult<T>,
    ) -> SyncResult<T> {
        let mut guard = self.setup.lock();
        match guard.as_mut() {
            Some(setup) => configure(setup),
            None => Err(SyncError::Argument(
                "page sync already started".into(),
            )),
        }
    }
}

impl PageSync for PageSyncImpl {
    fn start(&self) -> SyncResult<()> {
        let setup = self
            .setup
            .lock()
            .take()
            .ok_or_else(|| SyncError::Argument("page sync already started".into()))?;

        let mut watchers = Vec::new();
        if let Some(watcher) = setup.watcher {
            watchers.push(watcher);
        }
        if let Some(watcher) = setup.ledger_watcher {
            watchers.push(watcher);
        }

        let retry = setup.retry.clone();
        let driver = PageDriver {
            download: PageDownload::new(retry.clone()),
            upload: PageUpload::new(retry.clone()),
            cx: PageContext {
                storage: setup.storage,
                cloud: setup.cloud,
                auth: setup.auth,
                encryption: setup.encryption,
                events: self.events.clone(),
                tasks: TaskSet::new(),
                retry,
                page_id: self.page_id.clone(),
            },
            watchers,
            mirror: Arc::clone(&self.mirror),
            on_idle: setup.on_idle,
            on_backlog_downloaded: setup.on_backlog_downloaded,
            on_unrecoverable: setup.on_unrecoverable,
            upload_enabled: false,
            last: SyncStateContainer::default(),
            was_idle: false,
            broken: false,
        };

        let receiver = setup.receiver;
        *self.run_handle.lock() = Some(tokio::spawn(driver.run(receiver)));
        Ok(())
    }

    fn enable_upload(&self) {
        let _ = self.events.send(PageEvent::EnableUpload);
    }

    fn set_on_idle(&self, callback: Box<dyn Fn() + Send + Sync>) -> SyncResult<()> {
        self.with_setup(|setup| {
            if setup.on_idle.is_some() {
                return Err(SyncError::Argument("on_idle already set".into()));
            }
            setup.on_idle = Some(callback);
            Ok(())
        })
    }

    fn set_on_backlog_downloaded(&self, callback: Box<dyn Fn() + Send + Sync>) -> SyncResult<()> {
        self.with_setup(|setup| {
            if setup.on_backlog_downloaded.is_some() {
                return Err(SyncError::Argument(
                    "on_backlog_downloaded already set".into(),
                ));
            }
            setup.on_backlog_downloaded = Some(callback);
            Ok(())
        })
    }

    fn set_sync_watcher(&self, watcher: Box<dyn SyncStateWatcher>) -> SyncResult<()> {
        self.with_setup(|setup| {
            if setup.watcher.is_some() {
                return Err(SyncError::Argument("sync watcher already set".into()));
            }
            setup.watcher = Some(watcher);
            Ok(())
        })
    }

    fn is_idle(&self) -> bool {
        self.mirror.lock().is_idle()
    }
}

impl Drop for PageSyncImpl {
    fn drop(&mut self) {
        if let Some(handle) = self.run_handle.lock().take() {
            handle.abort();
        }
    }
}

/// The page run loop: owns both state machines, merges their states, and
/// holds the single unrecoverable-error escalation path.
struct PageDriver {
    download: PageDownload,
    upload: PageUpload,
    cx: PageContext,
    watchers: Vec<Box<dyn SyncStateWatcher>>,
    mirror: Arc<Mutex<SyncStateContainer>>,
    on_idle: Option<Box<dyn Fn() + Send + Sync>>,
    on_backlog_downloaded: Option<Box<dyn Fn() + Send + Sync>>,
    on_unrecoverable: Option<Box<dyn FnOnce(SyncError) + Send>>,
    upload_enabled: bool,
    last: SyncStateContainer,
    was_idle: bool,
    broken: bool,
}

impl PageDriver {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<PageEvent>) {
        debug!(page = ?self.cx.page_id, "page sync started");
        self.download.start(&mut self.cx);
        self.publish();

        while let Some(event) = receiver.recv().await {
            if self.broken {
                continue;
            }
            self.dispatch(event);
            self.publish();
        }
    }

    fn dispatch(&mut self, event: PageEvent) {
        let result = match event {
            PageEvent::EnableUpload => {
                if !self.upload_enabled {
                    self.upload_enabled = true;
                    self.upload.start(&mut self.cx);
                    let idle = self.download.is_quiescent();
                    self.upload.trigger(&mut self.cx, idle);
                }
                Ok(())
            }
            PageEvent::BacklogResult(result) => {
                self.download.on_backlog_result(result, &mut self.cx)
            }
            PageEvent::BatchApplied {
                result,
                token,
                backlog,
            } => {
                let applied = self
                    .download
                    .on_batch_applied(result, token, backlog, &mut self.cx);
                if applied.is_ok()
                    && self.download.is_quiescent()
                    && self.upload.started()
                    && self.upload.take_wait_for_download()
                {
                    self.upload.trigger(&mut self.cx, true);
                }
                applied
            }
            PageEvent::WatcherInstalled(result) => {
                self.download.on_watcher_installed(result, &mut self.cx)
            }
            PageEvent::Remote(notification) => self.download.on_remote(notification, &mut self.cx),
            PageEvent::RetryDownload => {
                self.download.on_retry(&mut self.cx);
                Ok(())
            }
            PageEvent::LocalCommits(batch) => {
                if batch.source == CommitSource::Local {
                    let idle = self.download.is_quiescent();
                    self.upload.trigger(&mut self.cx, idle);
                }
                Ok(())
            }
            PageEvent::UploadBatch(outcome) => {
                let idle = self.download.is_quiescent();
                self.upload.on_batch_result(outcome, &mut self.cx, idle)
            }
            PageEvent::RetryUpload => {
                let idle = self.download.is_quiescent();
                self.upload.trigger(&mut self.cx, idle);
                Ok(())
            }
        };

        if let Err(err) = result {
            self.escalate(err);
        }
    }

    fn publish(&mut self) {
        let merged = SyncStateContainer::new(self.download.state(), self.upload.state());
        if merged != self.last {
            self.last = merged;
            *self.mirror.lock() = merged;
            for watcher in &self.watchers {
                watcher.notify(merged);
            }
        }

        if self.download.take_backlog_signal() {
            if let Some(callback) = &self.on_backlog_downloaded {
                callback();
            }
        }

        let idle = merged.is_idle();
        if idle && !self.was_idle {
            if let Some(callback) = &self.on_idle {
                callback();
            }
        }
        self.was_idle = idle;
    }

    /// Delivers the unrecoverable error exactly once; afterwards the page
    /// is broken and ignores further events until the owner tears it down.
    fn escalate(&mut self, err: SyncError) {
        error!(page = ?self.cx.page_id, %err, "page sync hit an unrecoverable error");
        self.broken = true;
        if let Some(callback) = self.on_unrecoverable.take() {
            callback(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{FixedAuthProvider, InMemoryCloud};
    use crate::encryption::NoopEncryption;
    use crate::storage::InMemoryStorage;

    fn make_page() -> PageSyncImpl {
        PageSyncImpl::new(PageSyncArgs {
            page_id: PageId::from("page"),
            storage: Arc::new(InMemoryStorage::new()),
            cloud: Arc::new(InMemoryCloud::new()),
            auth: Arc::new(FixedAuthProvider::new("token")),
            encryption: Arc::new(NoopEncryption),
            retry: RetryConfig::default(),
            on_unrecoverable: None,
            ledger_watcher: None,
        })
    }

    #[tokio::test]
    async fn callbacks_only_settable_before_start() {
        let page = make_page();
        page.set_on_idle(Box::new(|| {})).unwrap();
        assert!(page.set_on_idle(Box::new(|| {})).is_err());

        page.start().unwrap();
        assert!(page.set_on_backlog_downloaded(Box::new(|| {})).is_err());
        assert!(page
            .set_sync_watcher(Box::new(|_state: SyncStateContainer| {}))
            .is_err());
    }

    #[tokio::test]
    async fn start_is_callable_once() {
        let page = make_page();
        page.start().unwrap();
        assert!(page.start().is_err());
    }

    #[tokio::test]
    async fn not_idle_before_start() {
        let page = make_page();
        assert!(!page.is_idle());
    }
}
