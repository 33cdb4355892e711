//! Sync state values, the merge rule, and the watcher interface.

/// State of the inbound (download) half of a page's sync.
///
/// Declaration order doubles as the merge comparison key, so it must not be
/// reordered: aggregation takes the maximum variant across sources, which
/// keeps `PermanentError` dominant over everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DownloadSyncState {
    /// Download has not been started.
    NotStarted,
    /// The remote backlog is being fetched and applied.
    Backlog,
    /// A recoverable failure occurred; a retry is scheduled.
    TemporaryError,
    /// The backlog is done and the live remote watch is being installed.
    SettingRemoteWatcher,
    /// Watching the cloud with nothing in flight.
    Idle,
    /// A live batch is being applied.
    InProgress,
    /// Unrecoverable failure; the page must be torn down.
    PermanentError,
}

impl DownloadSyncState {
    /// Returns true if the download half reports an idle or stopped state.
    pub fn is_idle(&self) -> bool {
        matches!(self, DownloadSyncState::Idle)
    }
}

/// State of the outbound (upload) half of a page's sync.
///
/// Same ordering rule as [`DownloadSyncState`]: do not reorder variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UploadSyncState {
    /// Upload has not been started.
    NotStarted,
    /// The local commit watch is being installed.
    Setup,
    /// Nothing left to upload.
    Idle,
    /// Work is queued but upload is not allowed to run yet.
    Pending,
    /// More than one unsynced head commit; blocked until merged upstream.
    WaitTooManyLocalHeads,
    /// Waiting for the download half to finish applying a remote batch.
    WaitRemoteDownload,
    /// A recoverable failure occurred; a retry is scheduled.
    TemporaryError,
    /// A batch is being uploaded.
    InProgress,
    /// Unrecoverable failure; the page must be torn down.
    PermanentError,
}

impl UploadSyncState {
    /// Returns true if the upload half reports an idle or stopped state.
    pub fn is_idle(&self) -> bool {
        matches!(self, UploadSyncState::NotStarted | UploadSyncState::Idle)
    }
}

/// The (download, upload) state pair observed for one or more pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStateContainer {
    /// Download half.
    pub download: DownloadSyncState,
    /// Upload half.
    pub upload: UploadSyncState,
}

impl SyncStateContainer {
    /// Creates a container from both halves.
    pub fn new(download: DownloadSyncState, upload: UploadSyncState) -> Self {
        Self { download, upload }
    }

    /// Merges another container into this one.
    ///
    /// Each half takes the maximum of the two values in declaration order.
    /// This is the documented behavior of the existing system, preserved
    /// for compatibility: the terminal error states always win, while the
    /// relative order among non-terminal states is incidental.
    pub fn merge(&mut self, other: &SyncStateContainer) {
        self.download = self.download.max(other.download);
        self.upload = self.upload.max(other.upload);
    }

    /// Returns true if both halves report an idle or stopped state.
    pub fn is_idle(&self) -> bool {
        self.download.is_idle() && self.upload.is_idle()
    }
}

impl Default for SyncStateContainer {
    fn default() -> Self {
        Self {
            download: DownloadSyncState::NotStarted,
            upload: UploadSyncState::NotStarted,
        }
    }
}

/// Observer of sync state changes.
///
/// Watchers receive the merged (download, upload) pair every time it
/// changes. Implementations must not call back into the notifying object.
pub trait SyncStateWatcher: Send + Sync {
    /// Delivers a changed state.
    fn notify(&self, state: SyncStateContainer);
}

impl<F> SyncStateWatcher for F
where
    F: Fn(SyncStateContainer) + Send + Sync,
{
    fn notify(&self, state: SyncStateContainer) {
        self(state)
    }
}

/// Serialization state of the upload batch pipeline.
///
/// Guarantees at most one upload batch in flight and at most one further
/// trigger remembered while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageUploadState {
    /// No batch in flight, no trigger pending.
    NoCommit,
    /// A batch is in flight.
    Processing,
    /// A batch is in flight and a new trigger arrived meanwhile; another
    /// batch starts immediately on completion.
    ProcessingNewCommit,
}

impl PageUploadState {
    /// Transition on a new upload trigger. Returns the next state and
    /// whether a batch should start now.
    pub(crate) fn on_trigger(self) -> (Self, bool) {
        match self {
            PageUploadState::NoCommit => (PageUploadState::Processing, true),
            PageUploadState::Processing => (PageUploadState::ProcessingNewCommit, false),
            PageUploadState::ProcessingNewCommit => (PageUploadState::ProcessingNewCommit, false),
        }
    }

    /// Transition on batch completion. Returns the next state and whether
    /// another batch should start immediately.
    pub(crate) fn on_batch_complete(self) -> (Self, bool) {
        match self {
            // Completion without a batch in flight cannot happen; stay put.
            PageUploadState::NoCommit => (PageUploadState::NoCommit, false),
            PageUploadState::Processing => (PageUploadState::NoCommit, false),
            PageUploadState::ProcessingNewCommit => (PageUploadState::Processing, true),
        }
    }
}
