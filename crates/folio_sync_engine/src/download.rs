//! Inbound commit flow: backlog catch-up, then live remote watch.

use crate::backoff::Backoff;
use crate::cloud::{AuthProvider, CommitPack, PageCloud, RemoteNotification};
use crate::config::RetryConfig;
use crate::encryption::EncryptionService;
use crate::error::{SyncError, SyncResult};
use crate::page_sync::{PageContext, PageEvent};
use crate::state::DownloadSyncState;
use crate::storage::{CommitSource, PageStorage, POSITION_TOKEN_KEY};
use folio_sync_protocol::{Commit, ObjectId, PositionToken};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// The inbound half of a page's sync.
///
/// Brings the local commit log up to date with the cloud, then tracks the
/// cloud live. All I/O runs as tasks owned by the page; the methods here
/// are synchronous transitions driven by the page event loop.
pub(crate) struct PageDownload {
    state: DownloadSyncState,
    /// Resume cursor covering everything applied so far.
    position: Option<PositionToken>,
    /// Live batches received while an apply pass is in flight.
    queue: VecDeque<(Vec<Commit>, PositionToken)>,
    /// An apply pass (backlog or live) is running.
    applying: bool,
    /// The one-shot backlog-downloaded signal already fired.
    backlog_done: bool,
    /// Signal for the driver to consume.
    backlog_signal: bool,
    /// Restart requested while an apply pass was still in flight.
    pending_restart: bool,
    backoff: Backoff,
}

impl PageDownload {
    pub(crate) fn new(retry: RetryConfig) -> Self {
        Self {
            state: DownloadSyncState::NotStarted,
            position: None,
            queue: VecDeque::new(),
            applying: false,
            backlog_done: false,
            backlog_signal: false,
            pending_restart: false,
            backoff: Backoff::new(retry),
        }
    }

    pub(crate) fn state(&self) -> DownloadSyncState {
        self.state
    }

    /// True when no batch is being applied and none is queued.
    ///
    /// Upload attempts are gated on this: applying remote commits can
    /// change what "unsynced" means.
    pub(crate) fn is_quiescent(&self) -> bool {
        !self.applying && self.queue.is_empty()
    }

    /// Consumes the one-shot backlog-downloaded signal.
    pub(crate) fn take_backlog_signal(&mut self) -> bool {
        std::mem::take(&mut self.backlog_signal)
    }

    /// Begins (or restarts) the download: one backlog fetch from the
    /// persisted resume cursor, then a live watch.
    pub(crate) fn start(&mut self, cx: &mut PageContext) {
        self.state = DownloadSyncState::Backlog;
        self.queue.clear();
        self.pending_restart = false;

        let storage = Arc::clone(&cx.storage);
        let cloud = Arc::clone(&cx.cloud);
        let auth = Arc::clone(&cx.auth);
        let events = cx.events.clone();
        cx.tasks.spawn(async move {
            let result = fetch_backlog(storage, cloud, auth).await;
            let _ = events.send(PageEvent::BacklogResult(result));
        });
    }

    pub(crate) fn on_backlog_result(
        &mut self,
        result: SyncResult<CommitPack>,
        cx: &mut PageContext,
    ) -> SyncResult<()> {
        match result {
            Ok(pack) => {
                debug!(commits = pack.commits.len(), "backlog fetched");
                self.spawn_apply(pack.commits, pack.position, true, cx);
                Ok(())
            }
            Err(error) if error.is_retryable() => self.schedule_restart(error, cx),
            Err(error) => self.fail(error),
        }
    }

    pub(crate) fn on_batch_applied(
        &mut self,
        result: SyncResult<()>,
        token: Option<PositionToken>,
        backlog: bool,
        cx: &mut PageContext,
    ) -> SyncResult<()> {
        self.applying = false;
        match result {
            Ok(()) => {
                if let Some(token) = token {
                    self.position = Some(token);
                }
                self.backoff.reset();
                if backlog {
                    if !self.backlog_done {
                        self.backlog_done = true;
                        self.backlog_signal = true;
                    }
                    self.install_watcher(cx);
                } else if self.pending_restart {
                    self.start(cx);
                } else if !self.queue.is_empty() {
                    self.start_apply_pass(cx);
                } else {
                    self.state = DownloadSyncState::Idle;
                }
                Ok(())
            }
            Err(error) if error.is_retryable() => self.schedule_restart(error, cx),
            Err(error) => self.fail(error),
        }
    }

    pub(crate) fn on_watcher_installed(
        &mut self,
        result: SyncResult<()>,
        cx: &mut PageContext,
    ) -> SyncResult<()> {
        match result {
            Ok(()) => {
                self.backoff.reset();
                if self.queue.is_empty() {
                    self.state = DownloadSyncState::Idle;
                } else {
                    self.start_apply_pass(cx);
                }
                Ok(())
            }
            Err(error) if error.is_retryable() => self.schedule_restart(error, cx),
            Err(error) => self.fail(error),
        }
    }

    pub(crate) fn on_remote(
        &mut self,
        notification: RemoteNotification,
        cx: &mut PageContext,
    ) -> SyncResult<()> {
        match notification {
            RemoteNotification::NewCommits {
                commits,
                position,
                ack,
            } => {
                // Acknowledge receipt; anything arriving while we are still
                // applying gets queued and merged into the next pass.
                let _ = ack.send(());
                self.queue.push_back((commits, position));
                if !self.applying {
                    self.start_apply_pass(cx);
                } else {
                    self.state = DownloadSyncState::InProgress;
                }
                Ok(())
            }
            RemoteNotification::Error(status) => {
                warn!(%status, "remote watch ended");
                let error = SyncError::from(status);
                if error.is_retryable() {
                    self.schedule_restart(error, cx)
                } else {
                    self.fail(error)
                }
            }
        }
    }

    pub(crate) fn on_retry(&mut self, cx: &mut PageContext) {
        if self.applying {
            self.pending_restart = true;
        } else {
            self.start(cx);
        }
    }

    /// Drains the queue into one ordered apply pass.
    fn start_apply_pass(&mut self, cx: &mut PageContext) {
        let mut commits = Vec::new();
        let mut position = None;
        while let Some((batch, token)) = self.queue.pop_front() {
            commits.extend(batch);
            position = Some(token);
        }
        self.state = DownloadSyncState::InProgress;
        self.spawn_apply(commits, position, false, cx);
    }

    fn spawn_apply(
        &mut self,
        commits: Vec<Commit>,
        token: Option<PositionToken>,
        backlog: bool,
        cx: &mut PageContext,
    ) {
        self.applying = true;
        let storage = Arc::clone(&cx.storage);
        let cloud = Arc::clone(&cx.cloud);
        let auth = Arc::clone(&cx.auth);
        let encryption = Arc::clone(&cx.encryption);
        let retry = cx.retry.clone();
        let events = cx.events.clone();
        cx.tasks.spawn(async move {
            let applied_token = token.clone();
            let result =
                apply_batch(storage, cloud, auth, encryption, retry, commits, token).await;
            let _ = events.send(PageEvent::BatchApplied {
                result,
                token: applied_token,
                backlog,
            });
        });
    }

    fn install_watcher(&mut self, cx: &mut PageContext) {
        self.state = DownloadSyncState::SettingRemoteWatcher;

        let (tx, mut rx) = mpsc::channel::<RemoteNotification>(1);
        let forward = cx.events.clone();
        cx.tasks.spawn(async move {
            while let Some(notification) = rx.recv().await {
                if forward.send(PageEvent::Remote(notification)).is_err() {
                    break;
                }
            }
        });

        let cloud = Arc::clone(&cx.cloud);
        let position = self.position.clone();
        let events = cx.events.clone();
        cx.tasks.spawn(async move {
            let result = cloud
                .set_watcher(position, tx)
                .await
                .map_err(SyncError::from);
            let _ = events.send(PageEvent::WatcherInstalled(result));
        });
    }

    fn schedule_restart(&mut self, error: SyncError, cx: &mut PageContext) -> SyncResult<()> {
        match self.backoff.next_delay() {
            Some(delay) => {
                warn!(%error, ?delay, "download failed, retrying");
                self.state = DownloadSyncState::TemporaryError;
                let events = cx.events.clone();
                cx.tasks.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(PageEvent::RetryDownload);
                });
                Ok(())
            }
            None => self.fail(error),
        }
    }

    fn fail(&mut self, error: SyncError) -> SyncResult<()> {
        self.state = DownloadSyncState::PermanentError;
        Err(error)
    }
}

async fn fetch_backlog(
    storage: Arc<dyn PageStorage>,
    cloud: Arc<dyn PageCloud>,
    auth: Arc<dyn AuthProvider>,
) -> SyncResult<CommitPack> {
    let stored = storage.get_sync_metadata(POSITION_TOKEN_KEY).await?;
    let position = stored.map(PositionToken::new);
    let token = auth.auth_token().await.map_err(SyncError::from)?;
    cloud
        .get_commits(&token, position)
        .await
        .map_err(SyncError::from)
}

/// Applies one ordered batch: decrypt commits, fetch and decrypt their
/// missing objects, hand everything to storage, persist the resume cursor.
async fn apply_batch(
    storage: Arc<dyn PageStorage>,
    cloud: Arc<dyn PageCloud>,
    auth: Arc<dyn AuthProvider>,
    encryption: Arc<dyn EncryptionService>,
    retry: RetryConfig,
    commits: Vec<Commit>,
    token: Option<PositionToken>,
) -> SyncResult<()> {
    let mut plain = Vec::with_capacity(commits.len());
    for commit in commits {
        let content = encryption.decrypt_commit(commit.content).await?;
        plain.push(Commit {
            id: commit.id,
            content,
        });
    }

    let missing = storage.missing_objects(&plain).await?;
    for id in missing {
        let data = fetch_object(&*cloud, &*auth, &id, &retry).await?;
        let data = encryption.decrypt_object(data).await?;
        storage.add_object(id, data).await?;
    }

    if !plain.is_empty() {
        storage
            .add_commits_from_sync(plain, CommitSource::Cloud)
            .await?;
    }
    if let Some(token) = token {
        storage
            .set_sync_metadata(POSITION_TOKEN_KEY, token.into_bytes())
            .await?;
    }
    Ok(())
}

/// Fetches one object, retrying transient failures until the backoff is
/// exhausted; exhaustion escalates as a non-retryable error.
async fn fetch_object(
    cloud: &dyn PageCloud,
    auth: &dyn AuthProvider,
    id: &ObjectId,
    retry: &RetryConfig,
) -> SyncResult<Vec<u8>> {
    let mut backoff = Backoff::new(retry.clone());
    loop {
        let token = auth.auth_token().await.map_err(SyncError::from)?;
        match cloud.get_object(&token, id).await {
            Ok(data) => return Ok(data),
            Err(status) if status.is_retryable() => match backoff.next_delay() {
                Some(delay) => {
                    warn!(%status, ?id, ?delay, "object fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(SyncError::network_fatal(format!(
                        "object fetch retries exhausted for {id:?}"
                    )))
                }
            },
            Err(status) => return Err(SyncError::from(status)),
        }
    }
}
