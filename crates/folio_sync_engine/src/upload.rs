//! Outbound commit flow: batch upload of everything storage reports
//! unsynced, in storage order.

use crate::backoff::Backoff;
use crate::cloud::{AuthProvider, PageCloud};
use crate::config::RetryConfig;
use crate::encryption::EncryptionService;
use crate::error::{SyncError, SyncResult};
use crate::page_sync::{PageContext, PageEvent};
use crate::state::{PageUploadState, UploadSyncState};
use crate::storage::PageStorage;
use folio_sync_protocol::{Commit, CommitId, Status};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Result of one upload batch attempt.
#[derive(Debug)]
pub(crate) enum UploadOutcome {
    /// Nothing was unsynced.
    Nothing,
    /// More than one unsynced head; blocked until merged upstream.
    TooManyHeads,
    /// The batch was uploaded and marked synced.
    Uploaded {
        /// Number of commits in the batch.
        count: usize,
    },
    /// The server already has one of the commits; resolved by observing it
    /// arrive through the download watch.
    Conflict,
    /// The batch failed.
    Error(SyncError),
}

/// The outbound half of a page's sync.
///
/// Every trigger uploads the full currently-unsynced set, not just the
/// triggering commit: commits may be marked synced or added out of band,
/// and a batch recovers correctly after a transient failure this way.
pub(crate) struct PageUpload {
    external: UploadSyncState,
    internal: PageUploadState,
    started: bool,
    /// A trigger arrived before upload was enabled and started.
    pending: bool,
    /// A trigger is parked until the download half finishes applying.
    wait_for_download: bool,
    backoff: Backoff,
}

impl PageUpload {
    pub(crate) fn new(retry: RetryConfig) -> Self {
        Self {
            external: UploadSyncState::NotStarted,
            internal: PageUploadState::NoCommit,
            started: false,
            pending: false,
            wait_for_download: false,
            backoff: Backoff::new(retry),
        }
    }

    pub(crate) fn state(&self) -> UploadSyncState {
        self.external
    }

    pub(crate) fn started(&self) -> bool {
        self.started
    }

    /// Consumes the parked-on-download flag.
    pub(crate) fn take_wait_for_download(&mut self) -> bool {
        std::mem::take(&mut self.wait_for_download)
    }

    /// Installs the local commit watch and uploads the current backlog.
    ///
    /// Called once, when upload is enabled on a started page; triggers
    /// after that come from the storage watch.
    pub(crate) fn start(&mut self, cx: &mut PageContext) {
        if self.started {
            return;
        }
        self.started = true;
        self.pending = false;
        self.external = UploadSyncState::Setup;

        let (tx, mut rx) = mpsc::unbounded_channel();
        cx.storage.watch_commits(tx);
        let events = cx.events.clone();
        cx.tasks.spawn(async move {
            while let Some(batch) = rx.recv().await {
                if events.send(PageEvent::LocalCommits(batch)).is_err() {
                    break;
                }
            }
        });
    }

    /// Requests an upload attempt for the full currently-unsynced set.
    pub(crate) fn trigger(&mut self, cx: &mut PageContext, download_idle: bool) {
        if !self.started {
            self.pending = true;
            self.external = UploadSyncState::Pending;
            return;
        }
        let (next, start_now) = self.internal.on_trigger();
        self.internal = next;
        if !start_now {
            // Remembered; another batch starts when the current one ends.
            return;
        }
        if !download_idle {
            self.internal = PageUploadState::NoCommit;
            self.wait_for_download = true;
            self.external = UploadSyncState::WaitRemoteDownload;
            return;
        }
        self.start_batch(cx);
    }

    pub(crate) fn on_batch_result(
        &mut self,
        outcome: UploadOutcome,
        cx: &mut PageContext,
        download_idle: bool,
    ) -> SyncResult<()> {
        let (next, follow_up) = self.internal.on_batch_complete();
        self.internal = next;

        match outcome {
            UploadOutcome::Nothing => {
                self.backoff.reset();
                self.finish_or_follow_up(follow_up, cx, download_idle);
                Ok(())
            }
            UploadOutcome::Uploaded { count } => {
                debug!(count, "uploaded commit batch");
                self.backoff.reset();
                self.finish_or_follow_up(follow_up, cx, download_idle);
                Ok(())
            }
            UploadOutcome::TooManyHeads => {
                self.external = UploadSyncState::WaitTooManyLocalHeads;
                if follow_up {
                    // The trigger that arrived mid-flight may be the merge
                    // that resolves the divergence; re-check right away.
                    if download_idle {
                        self.start_batch(cx);
                    } else {
                        self.internal = PageUploadState::NoCommit;
                        self.wait_for_download = true;
                    }
                }
                Ok(())
            }
            UploadOutcome::Conflict => {
                info!("upload conflict, waiting for the commit to arrive via download");
                self.internal = PageUploadState::NoCommit;
                self.wait_for_download = true;
                self.external = UploadSyncState::WaitRemoteDownload;
                Ok(())
            }
            UploadOutcome::Error(error) if error.is_retryable() => {
                self.internal = PageUploadState::NoCommit;
                match self.backoff.next_delay() {
                    Some(delay) => {
                        warn!(%error, ?delay, "upload failed, retrying");
                        self.external = UploadSyncState::TemporaryError;
                        let events = cx.events.clone();
                        cx.tasks.spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = events.send(PageEvent::RetryUpload);
                        });
                        Ok(())
                    }
                    None => {
                        self.external = UploadSyncState::PermanentError;
                        Err(error)
                    }
                }
            }
            UploadOutcome::Error(error) => {
                self.internal = PageUploadState::NoCommit;
                self.external = UploadSyncState::PermanentError;
                Err(error)
            }
        }
    }

    fn finish_or_follow_up(&mut self, follow_up: bool, cx: &mut PageContext, download_idle: bool) {
        if follow_up {
            if download_idle {
                self.start_batch(cx);
            } else {
                self.internal = PageUploadState::NoCommit;
                self.wait_for_download = true;
                self.external = UploadSyncState::WaitRemoteDownload;
            }
        } else {
            self.external = UploadSyncState::Idle;
        }
    }

    fn start_batch(&mut self, cx: &mut PageContext) {
        self.external = UploadSyncState::InProgress;
        let storage = Arc::clone(&cx.storage);
        let cloud = Arc::clone(&cx.cloud);
        let auth = Arc::clone(&cx.auth);
        let encryption = Arc::clone(&cx.encryption);
        let events = cx.events.clone();
        cx.tasks.spawn(async move {
            let outcome = run_batch(storage, cloud, auth, encryption).await;
            let _ = events.send(PageEvent::UploadBatch(outcome));
        });
    }
}

/// Uploads unsynced objects, then the full unsynced commit set as one
/// batch, marking everything synced on success.
async fn run_batch(
    storage: Arc<dyn PageStorage>,
    cloud: Arc<dyn PageCloud>,
    auth: Arc<dyn AuthProvider>,
    encryption: Arc<dyn EncryptionService>,
) -> UploadOutcome {
    match run_batch_inner(storage, cloud, auth, encryption).await {
        Ok(outcome) => outcome,
        Err(error) => UploadOutcome::Error(error),
    }
}

async fn run_batch_inner(
    storage: Arc<dyn PageStorage>,
    cloud: Arc<dyn PageCloud>,
    auth: Arc<dyn AuthProvider>,
    encryption: Arc<dyn EncryptionService>,
) -> SyncResult<UploadOutcome> {
    let heads = storage.unsynced_head_count().await?;
    if heads > 1 {
        return Ok(UploadOutcome::TooManyHeads);
    }

    let commits = storage.get_unsynced_commits().await?;
    if commits.is_empty() {
        return Ok(UploadOutcome::Nothing);
    }

    // Objects referenced by the commits go up first so the other side never
    // sees a commit whose objects are missing.
    for (id, data) in storage.get_unsynced_objects().await? {
        let token = auth.auth_token().await.map_err(SyncError::from)?;
        let data = encryption.encrypt_object(data).await?;
        cloud
            .add_object(&token, id.clone(), data)
            .await
            .map_err(SyncError::from)?;
        storage.mark_object_synced(&id).await?;
    }

    // One remote add per commit, in storage order; each commit is marked
    // synced as soon as its own upload succeeds, so a retry after a partial
    // failure resumes exactly where it stopped.
    let mut uploaded = 0usize;
    for commit in commits {
        let id: CommitId = commit.id.clone();
        let content = encryption.encrypt_commit(commit.content).await?;
        let wire = Commit {
            id: id.clone(),
            content,
        };
        let token = auth.auth_token().await.map_err(SyncError::from)?;
        match cloud.add_commits(&token, vec![wire]).await {
            Ok(()) => {
                storage.mark_commits_synced(&[id]).await?;
                uploaded += 1;
            }
            Err(Status::ServerError) => return Ok(UploadOutcome::Conflict),
            Err(status) => return Err(SyncError::from(status)),
        }
    }
    Ok(UploadOutcome::Uploaded { count: uploaded })
}
