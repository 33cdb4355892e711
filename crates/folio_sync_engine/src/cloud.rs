//! Cloud transport interface for page commits and objects.
//!
//! The engine only knows the request/response contracts of the remote side;
//! connection management lives behind [`PageCloud`]. [`InMemoryCloud`] is
//! the test double: a shared remote commit log with watcher fan-out that
//! honors the one-outstanding-acknowledgement flow control, conflict
//! rejection of duplicate commit ids, and scripted per-call failures.

use async_trait::async_trait;
use folio_sync_protocol::{Commit, CommitId, ObjectId, PositionToken, Status};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// An opaque bearer token attached to cloud requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Creates a token from its string form.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the token value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Source of per-request auth tokens.
///
/// Consulted before every cloud call; tokens may expire between calls, so
/// the engine never caches them.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Returns a token valid for the next request.
    async fn auth_token(&self) -> Result<AuthToken, Status>;
}

/// An auth provider returning a fixed token, for tests.
pub struct FixedAuthProvider {
    token: AuthToken,
    fail_next: Mutex<Option<Status>>,
}

impl FixedAuthProvider {
    /// Creates a provider with the given token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: AuthToken::new(token),
            fail_next: Mutex::new(None),
        }
    }

    /// Makes the next token request fail with the given status.
    pub fn fail_next(&self, status: Status) {
        *self.fail_next.lock() = Some(status);
    }
}

#[async_trait]
impl AuthProvider for FixedAuthProvider {
    async fn auth_token(&self) -> Result<AuthToken, Status> {
        if let Some(status) = self.fail_next.lock().take() {
            return Err(status);
        }
        Ok(self.token.clone())
    }
}

/// Result of a commit fetch.
#[derive(Debug, Clone)]
pub struct CommitPack {
    /// Commits in cloud order.
    pub commits: Vec<Commit>,
    /// Resume cursor covering everything delivered so far.
    pub position: Option<PositionToken>,
}

/// A push notification from the live remote commit watch.
#[derive(Debug)]
pub enum RemoteNotification {
    /// New commits are available.
    NewCommits {
        /// The commits, in cloud order.
        commits: Vec<Commit>,
        /// Resume cursor after these commits.
        position: PositionToken,
        /// Acknowledgement the receiver sends once the batch is accepted;
        /// the remote side delivers at most one unacknowledged batch.
        ack: oneshot::Sender<()>,
    },
    /// The watch failed and is no longer active.
    Error(Status),
}

/// The remote procedure interface for one page's cloud-hosted commit log.
#[async_trait]
pub trait PageCloud: Send + Sync {
    /// Uploads a batch of commits.
    async fn add_commits(&self, auth: &AuthToken, commits: Vec<Commit>) -> Result<(), Status>;

    /// Fetches commits after the given position, in one ordered batch.
    async fn get_commits(
        &self,
        auth: &AuthToken,
        min_position: Option<PositionToken>,
    ) -> Result<CommitPack, Status>;

    /// Registers a live commit watcher delivering through `sender`.
    ///
    /// Installing a watcher replaces nothing on the engine side: the
    /// registration lives until the receiving half of `sender` is dropped
    /// or the watch reports an error.
    async fn set_watcher(
        &self,
        min_position: Option<PositionToken>,
        sender: mpsc::Sender<RemoteNotification>,
    ) -> Result<(), Status>;

    /// Uploads an object blob.
    async fn add_object(&self, auth: &AuthToken, id: ObjectId, data: Vec<u8>) -> Result<(), Status>;

    /// Downloads an object blob.
    async fn get_object(&self, auth: &AuthToken, id: &ObjectId) -> Result<Vec<u8>, Status>;
}

struct CloudWatcher {
    id: u64,
    /// Handle the watcher was registered through; its own uploads are not
    /// echoed back to it.
    handle: u64,
    sender: mpsc::Sender<RemoteNotification>,
    delivered: usize,
    busy: bool,
}

/// Origin marker for commits seeded directly into the log.
const SEED_ORIGIN: u64 = u64::MAX;

#[derive(Default)]
struct CloudInner {
    commits: Vec<(Commit, u64)>,
    objects: HashMap<ObjectId, Vec<u8>>,
    watchers: Vec<CloudWatcher>,
    next_watcher_id: u64,
    next_handle: u64,
    add_commit_failures: VecDeque<Status>,
    get_commit_failures: VecDeque<Status>,
    get_object_failures: VecDeque<Status>,
    set_watcher_failures: VecDeque<Status>,
    add_commits_calls: Vec<Vec<CommitId>>,
    op_log: Option<Arc<Mutex<Vec<String>>>>,
}

fn token_for(count: usize) -> PositionToken {
    PositionToken::new(count.to_string().into_bytes())
}

fn parse_token(token: &PositionToken) -> Option<usize> {
    std::str::from_utf8(token.as_bytes())
        .ok()
        .and_then(|s| s.parse().ok())
}

/// Delivers undelivered commits to every non-busy watcher, one batch per
/// watcher, waiting for each acknowledgement before the next round. A
/// handle's own uploads are skipped for watchers it registered itself.
fn pump(inner: &Arc<Mutex<CloudInner>>) {
    let mut jobs = Vec::new();
    {
        let mut guard = inner.lock();
        let total = guard.commits.len();
        for index in 0..guard.watchers.len() {
            let (busy, delivered, handle) = {
                let w = &guard.watchers[index];
                (w.busy, w.delivered, w.handle)
            };
            if busy || delivered >= total {
                continue;
            }
            let commits: Vec<Commit> = guard.commits[delivered..]
                .iter()
                .filter(|(_, origin)| *origin != handle)
                .map(|(commit, _)| commit.clone())
                .collect();
            let watcher = &mut guard.watchers[index];
            if commits.is_empty() {
                watcher.delivered = total;
                continue;
            }
            watcher.busy = true;
            jobs.push((watcher.id, watcher.sender.clone(), commits, total));
        }
    }

    for (id, sender, commits, target) in jobs {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let (ack_tx, ack_rx) = oneshot::channel();
            let notification = RemoteNotification::NewCommits {
                commits,
                position: token_for(target),
                ack: ack_tx,
            };
            if sender.send(notification).await.is_err() {
                inner.lock().watchers.retain(|w| w.id != id);
                return;
            }
            // A dropped ack means the receiver went away mid-batch; either
            // way this delivery round is over.
            let _ = ack_rx.await;
            {
                let mut guard = inner.lock();
                if let Some(w) = guard.watchers.iter_mut().find(|w| w.id == id) {
                    w.delivered = target;
                    w.busy = false;
                }
            }
            pump(&inner);
        });
    }
}

/// An in-memory page cloud for testing.
///
/// [`InMemoryCloud::client`] yields another handle to the same remote log,
/// which is how tests simulate multiple devices syncing one page. Commits
/// uploaded through a handle are not echoed to watchers registered through
/// the same handle.
#[derive(Clone, Default)]
pub struct InMemoryCloud {
    inner: Arc<Mutex<CloudInner>>,
    handle: u64,
}

impl InMemoryCloud {
    /// Creates an empty cloud.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new handle to the same remote log, acting as a different
    /// device.
    pub fn client(&self) -> Self {
        let mut guard = self.inner.lock();
        guard.next_handle += 1;
        Self {
            inner: Arc::clone(&self.inner),
            handle: guard.next_handle,
        }
    }

    /// Seeds the remote log with a commit, without notifying watchers.
    pub fn seed_commit(&self, commit: Commit) {
        self.inner.lock().commits.push((commit, SEED_ORIGIN));
    }

    /// Makes the next `add_commits` call fail with the given status.
    pub fn fail_next_add_commits(&self, status: Status) {
        self.inner.lock().add_commit_failures.push_back(status);
    }

    /// Makes the next `get_commits` call fail with the given status.
    pub fn fail_next_get_commits(&self, status: Status) {
        self.inner.lock().get_commit_failures.push_back(status);
    }

    /// Makes the next `get_object` call fail with the given status.
    pub fn fail_next_get_object(&self, status: Status) {
        self.inner.lock().get_object_failures.push_back(status);
    }

    /// Makes the next `set_watcher` call fail with the given status.
    pub fn fail_next_set_watcher(&self, status: Status) {
        self.inner.lock().set_watcher_failures.push_back(status);
    }

    /// Fails all live watchers with the given status and removes them.
    pub fn break_watchers(&self, status: Status) {
        let watchers = std::mem::take(&mut self.inner.lock().watchers);
        for watcher in watchers {
            let sender = watcher.sender;
            tokio::spawn(async move {
                let _ = sender.send(RemoteNotification::Error(status)).await;
            });
        }
    }

    /// Records upload calls into a shared operation log.
    pub fn set_op_log(&self, log: Arc<Mutex<Vec<String>>>) {
        self.inner.lock().op_log = Some(log);
    }

    /// Returns the ids of all commits in the remote log, in order.
    pub fn commit_ids(&self) -> Vec<CommitId> {
        self.inner
            .lock()
            .commits
            .iter()
            .map(|(commit, _)| commit.id.clone())
            .collect()
    }

    /// Returns the stored wire content of a commit.
    pub fn commit_content(&self, id: &CommitId) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .commits
            .iter()
            .find(|(commit, _)| &commit.id == id)
            .map(|(commit, _)| commit.content.clone())
    }

    /// Returns one recorded `add_commits` call per entry, as commit ids.
    pub fn add_commits_calls(&self) -> Vec<Vec<CommitId>> {
        self.inner.lock().add_commits_calls.clone()
    }

    /// Returns a stored object blob.
    pub fn object(&self, id: &ObjectId) -> Option<Vec<u8>> {
        self.inner.lock().objects.get(id).cloned()
    }

    /// Returns the number of live watchers.
    pub fn watcher_count(&self) -> usize {
        self.inner.lock().watchers.len()
    }
}

#[async_trait]
impl PageCloud for InMemoryCloud {
    async fn add_commits(&self, _auth: &AuthToken, commits: Vec<Commit>) -> Result<(), Status> {
        {
            let mut guard = self.inner.lock();
            guard
                .add_commits_calls
                .push(commits.iter().map(|c| c.id.clone()).collect());
            if let Some(log) = guard.op_log.as_ref() {
                log.lock().push("add_commits".to_string());
            }
            if let Some(status) = guard.add_commit_failures.pop_front() {
                return Err(status);
            }
            if commits
                .iter()
                .any(|c| guard.commits.iter().any(|(existing, _)| existing.id == c.id))
            {
                return Err(Status::ServerError);
            }
            let handle = self.handle;
            guard
                .commits
                .extend(commits.into_iter().map(|commit| (commit, handle)));
        }
        pump(&self.inner);
        Ok(())
    }

    async fn get_commits(
        &self,
        _auth: &AuthToken,
        min_position: Option<PositionToken>,
    ) -> Result<CommitPack, Status> {
        let mut guard = self.inner.lock();
        if let Some(status) = guard.get_commit_failures.pop_front() {
            return Err(status);
        }
        let from = match min_position {
            Some(token) => parse_token(&token).ok_or(Status::ArgumentError)?,
            None => 0,
        };
        let from = from.min(guard.commits.len());
        Ok(CommitPack {
            commits: guard.commits[from..]
                .iter()
                .map(|(commit, _)| commit.clone())
                .collect(),
            position: Some(token_for(guard.commits.len())),
        })
    }

    async fn set_watcher(
        &self,
        min_position: Option<PositionToken>,
        sender: mpsc::Sender<RemoteNotification>,
    ) -> Result<(), Status> {
        {
            let mut guard = self.inner.lock();
            if let Some(status) = guard.set_watcher_failures.pop_front() {
                return Err(status);
            }
            let delivered = match min_position {
                Some(token) => parse_token(&token).ok_or(Status::ArgumentError)?,
                None => 0,
            };
            let id = guard.next_watcher_id;
            guard.next_watcher_id += 1;
            guard.watchers.push(CloudWatcher {
                id,
                handle: self.handle,
                sender,
                delivered,
                busy: false,
            });
        }
        pump(&self.inner);
        Ok(())
    }

    async fn add_object(
        &self,
        _auth: &AuthToken,
        id: ObjectId,
        data: Vec<u8>,
    ) -> Result<(), Status> {
        self.inner.lock().objects.insert(id, data);
        Ok(())
    }

    async fn get_object(&self, _auth: &AuthToken, id: &ObjectId) -> Result<Vec<u8>, Status> {
        let mut guard = self.inner.lock();
        if let Some(status) = guard.get_object_failures.pop_front() {
            return Err(status);
        }
        guard.objects.get(id).cloned().ok_or(Status::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> AuthToken {
        AuthToken::new("test-token")
    }

    #[tokio::test]
    async fn add_and_get_commits() {
        let cloud = InMemoryCloud::new();
        cloud
            .add_commits(&token(), vec![Commit::new("id1", b"c1".to_vec())])
            .await
            .unwrap();

        let pack = cloud.get_commits(&token(), None).await.unwrap();
        assert_eq!(pack.commits.len(), 1);
        assert_eq!(pack.commits[0].id, CommitId::from("id1"));

        // Resuming from the returned position yields nothing new
        let pack = cloud.get_commits(&token(), pack.position).await.unwrap();
        assert!(pack.commits.is_empty());
    }

    #[tokio::test]
    async fn duplicate_commit_is_a_conflict() {
        let cloud = InMemoryCloud::new();
        cloud
            .add_commits(&token(), vec![Commit::new("id1", b"c1".to_vec())])
            .await
            .unwrap();
        let result = cloud
            .add_commits(&token(), vec![Commit::new("id1", b"c1".to_vec())])
            .await;
        assert_eq!(result, Err(Status::ServerError));
    }

    #[tokio::test]
    async fn watcher_receives_new_commits_after_ack() {
        let cloud = InMemoryCloud::new();
        let uploader = cloud.client();
        let (tx, mut rx) = mpsc::channel(1);
        cloud.set_watcher(None, tx).await.unwrap();

        uploader
            .add_commits(&token(), vec![Commit::new("id1", b"c1".to_vec())])
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        let ack = match first {
            RemoteNotification::NewCommits { commits, ack, .. } => {
                assert_eq!(commits[0].id, CommitId::from("id1"));
                ack
            }
            RemoteNotification::Error(status) => panic!("unexpected error: {status}"),
        };

        // A second batch is buffered until the first is acknowledged
        uploader
            .add_commits(&token(), vec![Commit::new("id2", b"c2".to_vec())])
            .await
            .unwrap();
        ack.send(()).unwrap();

        match rx.recv().await.unwrap() {
            RemoteNotification::NewCommits { commits, ack, .. } => {
                assert_eq!(commits.len(), 1);
                assert_eq!(commits[0].id, CommitId::from("id2"));
                ack.send(()).unwrap();
            }
            RemoteNotification::Error(status) => panic!("unexpected error: {status}"),
        }
    }

    #[tokio::test]
    async fn broken_watchers_receive_error() {
        let cloud = InMemoryCloud::new();
        let (tx, mut rx) = mpsc::channel(1);
        cloud.set_watcher(None, tx).await.unwrap();

        cloud.break_watchers(Status::NetworkError);

        match rx.recv().await.unwrap() {
            RemoteNotification::Error(status) => assert_eq!(status, Status::NetworkError),
            RemoteNotification::NewCommits { .. } => panic!("expected error"),
        }
        assert_eq!(cloud.watcher_count(), 0);
    }

    #[tokio::test]
    async fn objects_roundtrip() {
        let cloud = InMemoryCloud::new();
        cloud
            .add_object(&token(), ObjectId::from("obj"), b"data".to_vec())
            .await
            .unwrap();
        let data = cloud.get_object(&token(), &ObjectId::from("obj")).await;
        assert_eq!(data, Ok(b"data".to_vec()));

        let missing = cloud.get_object(&token(), &ObjectId::from("nope")).await;
        assert_eq!(missing, Err(Status::NotFound));
    }
}
