//! Per-application sync coordination.

use crate::aggregator::Aggregator;
use crate::cloud::{AuthProvider, PageCloud};
use crate::config::RetryConfig;
use crate::encryption::EncryptionService;
use crate::error::{SyncError, SyncResult};
use crate::page_sync::{PageSync, PageSyncArgs, PageSyncImpl};
use crate::state::SyncStateWatcher;
use crate::storage::PageStorage;
use folio_sync_protocol::{AppId, PageId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// Factory and owner of the per-page sync coordinators of one application.
pub trait LedgerSync: Send + Sync {
    /// Creates the sync coordinator for a page, wired to this
    /// application's encryption service and state aggregation.
    ///
    /// The returned handle is shared with the caller; the ledger keeps its
    /// own reference and discards it when the page reports an
    /// unrecoverable error.
    fn create_page_sync(
        &self,
        page_id: PageId,
        storage: Arc<dyn PageStorage>,
        cloud: Arc<dyn PageCloud>,
    ) -> SyncResult<Arc<PageSyncImpl>>;

    /// Enables upload on every current and future page of this
    /// application. Idempotent.
    fn enable_upload(&self);

    /// The application this ledger belongs to.
    fn app_id(&self) -> &AppId;
}

/// Implementation of [`LedgerSync`].
pub struct LedgerSyncImpl {
    app_id: AppId,
    encryption: Arc<dyn EncryptionService>,
    auth: Arc<dyn AuthProvider>,
    retry: RetryConfig,
    // Pages are declared before the aggregator so their listeners start
    // unwinding first on drop.
    pages: Mutex<HashMap<PageId, Arc<PageSyncImpl>>>,
    aggregator: Aggregator,
    upload_enabled: AtomicBool,
    self_weak: Weak<LedgerSyncImpl>,
}

impl LedgerSyncImpl {
    /// Creates a ledger sync for one application.
    ///
    /// `base_watcher` receives this application's aggregated sync state;
    /// the encompassing user layer passes one of its own aggregation
    /// handles here.
    pub fn new(
        app_id: AppId,
        encryption: Arc<dyn EncryptionService>,
        auth: Arc<dyn AuthProvider>,
        retry: RetryConfig,
        base_watcher: Option<Box<dyn SyncStateWatcher>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| {
            let aggregator = Aggregator::new();
            if let Some(watcher) = base_watcher {
                aggregator.set_base_watcher(watcher);
            }
            Self {
                app_id,
                encryption,
                auth,
                retry,
                pages: Mutex::new(HashMap::new()),
                aggregator,
                upload_enabled: AtomicBool::new(false),
                self_weak: self_weak.clone(),
            }
        })
    }

    /// Number of live page sync instances.
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// True once upload has been enabled for this application.
    pub fn upload_enabled(&self) -> bool {
        self.upload_enabled.load(Ordering::SeqCst)
    }

    fn remove_page(&self, page_id: &PageId, error: &SyncError) {
        warn!(app = self.app_id.as_str(), page = ?page_id, %error,
            "discarding page sync after unrecoverable error");
        self.pages.lock().remove(page_id);
    }
}

impl LedgerSync for LedgerSyncImpl {
    fn create_page_sync(
        &self,
        page_id: PageId,
        storage: Arc<dyn PageStorage>,
        cloud: Arc<dyn PageCloud>,
    ) -> SyncResult<Arc<PageSyncImpl>> {
        let mut pages = self.pages.lock();
        if pages.contains_key(&page_id) {
            return Err(SyncError::Argument(format!(
                "page sync already exists for {page_id:?}"
            )));
        }

        let ledger = self.self_weak.clone();
        let error_page = page_id.clone();
        let on_unrecoverable: Box<dyn FnOnce(SyncError) + Send> = Box::new(move |error| {
            if let Some(ledger) = ledger.upgrade() {
                ledger.remove_page(&error_page, &error);
            }
        });

        let page = Arc::new(PageSyncImpl::new(PageSyncArgs {
            page_id: page_id.clone(),
            storage,
            cloud,
            auth: Arc::clone(&self.auth),
            encryption: Arc::clone(&self.encryption),
            retry: self.retry.clone(),
            on_unrecoverable: Some(on_unrecoverable),
            ledger_watcher: Some(Box::new(self.aggregator.get_new_state_watcher())),
        }));

        if self.upload_enabled.load(Ordering::SeqCst) {
            page.enable_upload();
        }
        pages.insert(page_id, Arc::clone(&page));
        Ok(page)
    }

    fn enable_upload(&self) {
        self.upload_enabled.store(true, Ordering::SeqCst);
        for page in self.pages.lock().values() {
            page.enable_upload();
        }
    }

    fn app_id(&self) -> &AppId {
        &self.app_id
    }
}
