//! Local commit storage interface.
//!
//! The engine never implements storage; it consumes an ordered, durable
//! commit log through this trait. [`InMemoryStorage`] is the test double,
//! with injectable apply delays and failures to drive the ordering and
//! error paths.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use folio_sync_protocol::{Commit, CommitId, ObjectId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Metadata key under which the download resume cursor is persisted.
pub const POSITION_TOKEN_KEY: &str = "sync-position-token";

/// Where a batch of commits entered storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitSource {
    /// Created locally by the application.
    Local,
    /// Applied by the sync engine on behalf of the cloud.
    Cloud,
}

/// A batch of commits delivered through the storage commit watch.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    /// The commits, in storage order.
    pub commits: Vec<Commit>,
    /// Where the batch came from.
    pub source: CommitSource,
}

/// The ordered, durable commit log the engine synchronizes.
///
/// All methods are asynchronous storage boundaries in the sense of the
/// engine's scheduling model; between them state transitions are atomic.
#[async_trait]
pub trait PageStorage: Send + Sync {
    /// Returns all commits not yet marked synced, in creation order.
    async fn get_unsynced_commits(&self) -> SyncResult<Vec<Commit>>;

    /// Returns the number of unsynced head commits.
    ///
    /// More than one head means the local history has diverged and must be
    /// merged upstream before upload can proceed.
    async fn unsynced_head_count(&self) -> SyncResult<usize>;

    /// Marks the given commits as synced.
    async fn mark_commits_synced(&self, ids: &[CommitId]) -> SyncResult<()>;

    /// Applies commits received from the cloud, in the given order.
    ///
    /// A commit that already exists locally is marked synced instead of
    /// duplicated; this is how an upload conflict on a commit both devices
    /// created independently resolves itself.
    async fn add_commits_from_sync(
        &self,
        commits: Vec<Commit>,
        source: CommitSource,
    ) -> SyncResult<()>;

    /// Returns the objects referenced by the given commits that storage
    /// does not hold yet.
    async fn missing_objects(&self, commits: &[Commit]) -> SyncResult<Vec<ObjectId>>;

    /// Stores an object fetched from the cloud.
    async fn add_object(&self, id: ObjectId, data: Vec<u8>) -> SyncResult<()>;

    /// Returns locally created objects not yet uploaded, with their data.
    async fn get_unsynced_objects(&self) -> SyncResult<Vec<(ObjectId, Vec<u8>)>>;

    /// Marks an object as uploaded.
    async fn mark_object_synced(&self, id: &ObjectId) -> SyncResult<()>;

    /// Reads a sync metadata entry.
    async fn get_sync_metadata(&self, key: &str) -> SyncResult<Option<Vec<u8>>>;

    /// Writes a sync metadata entry.
    async fn set_sync_metadata(&self, key: &str, value: Vec<u8>) -> SyncResult<()>;

    /// Registers a push watcher for commits added to storage.
    ///
    /// Every batch entering storage is forwarded with its source; the
    /// registration lives until the sender's receiving side is dropped.
    fn watch_commits(&self, sender: mpsc::UnboundedSender<CommitBatch>);
}

struct StoredCommit {
    commit: Commit,
    synced: bool,
}

struct StoredObject {
    id: ObjectId,
    data: Vec<u8>,
    synced: bool,
}

#[derive(Default)]
struct StorageInner {
    commits: Vec<StoredCommit>,
    objects: Vec<StoredObject>,
    commit_objects: HashMap<CommitId, Vec<ObjectId>>,
    metadata: HashMap<String, Vec<u8>>,
    watchers: Vec<mpsc::UnboundedSender<CommitBatch>>,
}

impl StorageInner {
    fn notify(&mut self, batch: CommitBatch) {
        self.watchers
            .retain(|sender| sender.send(batch.clone()).is_ok());
    }

    fn find_object(&self, id: &ObjectId) -> Option<&StoredObject> {
        self.objects.iter().find(|o| &o.id == id)
    }
}

/// An in-memory page storage for testing.
pub struct InMemoryStorage {
    inner: Mutex<StorageInner>,
    apply_delay: Mutex<Option<Duration>>,
    head_count_override: Mutex<Option<usize>>,
    fail_next_apply: Mutex<Option<SyncError>>,
    op_log: Mutex<Option<Arc<Mutex<Vec<String>>>>>,
}

impl InMemoryStorage {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StorageInner::default()),
            apply_delay: Mutex::new(None),
            head_count_override: Mutex::new(None),
            fail_next_apply: Mutex::new(None),
            op_log: Mutex::new(None),
        }
    }

    /// Adds a commit as if the local application created it, notifying
    /// watchers.
    pub fn create_local_commit(&self, commit: Commit) {
        let mut inner = self.inner.lock();
        inner.commits.push(StoredCommit {
            commit: commit.clone(),
            synced: false,
        });
        inner.notify(CommitBatch {
            commits: vec![commit],
            source: CommitSource::Local,
        });
    }

    /// Adds a commit without notifying watchers, as pre-existing backlog.
    pub fn seed_local_commit(&self, commit: Commit) {
        self.inner.lock().commits.push(StoredCommit {
            commit,
            synced: false,
        });
    }

    /// Adds a locally created, not yet uploaded object.
    pub fn create_local_object(&self, id: ObjectId, data: Vec<u8>) {
        self.inner.lock().objects.push(StoredObject {
            id,
            data,
            synced: false,
        });
    }

    /// Declares which objects a commit references.
    pub fn set_commit_objects(&self, commit_id: CommitId, objects: Vec<ObjectId>) {
        self.inner.lock().commit_objects.insert(commit_id, objects);
    }

    /// Delays every subsequent `add_commits_from_sync` by the given amount.
    pub fn set_apply_delay(&self, delay: Duration) {
        *self.apply_delay.lock() = Some(delay);
    }

    /// Overrides the reported unsynced head count.
    pub fn set_unsynced_head_count(&self, count: usize) {
        *self.head_count_override.lock() = Some(count);
    }

    /// Clears the head count override.
    pub fn clear_unsynced_head_count(&self) {
        *self.head_count_override.lock() = None;
    }

    /// Makes the next `add_commits_from_sync` fail with the given error.
    pub fn fail_next_apply(&self, error: SyncError) {
        *self.fail_next_apply.lock() = Some(error);
    }

    /// Records apply completions into a shared operation log.
    pub fn set_op_log(&self, log: Arc<Mutex<Vec<String>>>) {
        *self.op_log.lock() = Some(log);
    }

    /// Returns all commits in storage order.
    pub fn commits(&self) -> Vec<Commit> {
        self.inner
            .lock()
            .commits
            .iter()
            .map(|c| c.commit.clone())
            .collect()
    }

    /// Returns true if the commit exists and is marked synced.
    pub fn is_synced(&self, id: &CommitId) -> bool {
        self.inner
            .lock()
            .commits
            .iter()
            .any(|c| &c.commit.id == id && c.synced)
    }

    /// Returns a stored object's data.
    pub fn object(&self, id: &ObjectId) -> Option<Vec<u8>> {
        self.inner.lock().find_object(id).map(|o| o.data.clone())
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageStorage for InMemoryStorage {
    async fn get_unsynced_commits(&self) -> SyncResult<Vec<Commit>> {
        Ok(self
            .inner
            .lock()
            .commits
            .iter()
            .filter(|c| !c.synced)
            .map(|c| c.commit.clone())
            .collect())
    }

    async fn unsynced_head_count(&self) -> SyncResult<usize> {
        if let Some(count) = *self.head_count_override.lock() {
            return Ok(count);
        }
        let any_unsynced = self.inner.lock().commits.iter().any(|c| !c.synced);
        Ok(usize::from(any_unsynced))
    }

    async fn mark_commits_synced(&self, ids: &[CommitId]) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        for id in ids {
            let commit = inner
                .commits
                .iter_mut()
                .find(|c| &c.commit.id == id)
                .ok_or_else(|| SyncError::Storage(format!("unknown commit {id:?}")))?;
            commit.synced = true;
        }
        Ok(())
    }

    async fn add_commits_from_sync(
        &self,
        commits: Vec<Commit>,
        source: CommitSource,
    ) -> SyncResult<()> {
        let delay = *self.apply_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.fail_next_apply.lock().take() {
            return Err(error);
        }

        let mut inner = self.inner.lock();
        for commit in &commits {
            match inner.commits.iter_mut().find(|c| c.commit.id == commit.id) {
                Some(existing) => existing.synced = true,
                None => inner.commits.push(StoredCommit {
                    commit: commit.clone(),
                    synced: true,
                }),
            }
        }
        inner.notify(CommitBatch {
            commits,
            source,
        });
        drop(inner);

        if let Some(log) = self.op_log.lock().as_ref() {
            log.lock().push("apply_done".to_string());
        }
        Ok(())
    }

    async fn missing_objects(&self, commits: &[Commit]) -> SyncResult<Vec<ObjectId>> {
        let inner = self.inner.lock();
        let mut missing = Vec::new();
        for commit in commits {
            if let Some(refs) = inner.commit_objects.get(&commit.id) {
                for id in refs {
                    if inner.find_object(id).is_none() && !missing.contains(id) {
                        missing.push(id.clone());
                    }
                }
            }
        }
        Ok(missing)
    }

    async fn add_object(&self, id: ObjectId, data: Vec<u8>) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        if inner.find_object(&id).is_none() {
            inner.objects.push(StoredObject {
                id,
                data,
                synced: true,
            });
        }
        Ok(())
    }

    async fn get_unsynced_objects(&self) -> SyncResult<Vec<(ObjectId, Vec<u8>)>> {
        Ok(self
            .inner
            .lock()
            .objects
            .iter()
            .filter(|o| !o.synced)
            .map(|o| (o.id.clone(), o.data.clone()))
            .collect())
    }

    async fn mark_object_synced(&self, id: &ObjectId) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        let object = inner
            .objects
            .iter_mut()
            .find(|o| &o.id == id)
            .ok_or_else(|| SyncError::Storage(format!("unknown object {id:?}")))?;
        object.synced = true;
        Ok(())
    }

    async fn get_sync_metadata(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().metadata.get(key).cloned())
    }

    async fn set_sync_metadata(&self, key: &str, value: Vec<u8>) -> SyncResult<()> {
        self.inner.lock().metadata.insert(key.to_string(), value);
        Ok(())
    }

    fn watch_commits(&self, sender: mpsc::UnboundedSender<CommitBatch>) {
        self.inner.lock().watchers.push(sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unsynced_commits_in_creation_order() {
        let storage = InMemoryStorage::new();
        storage.seed_local_commit(Commit::new("id1", b"content1".to_vec()));
        storage.seed_local_commit(Commit::new("id2", b"content2".to_vec()));

        let unsynced = storage.get_unsynced_commits().await.unwrap();
        assert_eq!(unsynced.len(), 2);
        assert_eq!(unsynced[0].id, CommitId::from("id1"));
        assert_eq!(unsynced[1].id, CommitId::from("id2"));
    }

    #[tokio::test]
    async fn mark_synced_removes_from_unsynced() {
        let storage = InMemoryStorage::new();
        storage.seed_local_commit(Commit::new("id1", b"c".to_vec()));
        storage
            .mark_commits_synced(&[CommitId::from("id1")])
            .await
            .unwrap();
        assert!(storage.get_unsynced_commits().await.unwrap().is_empty());
        assert!(storage.is_synced(&CommitId::from("id1")));
    }

    #[tokio::test]
    async fn sync_apply_marks_existing_commit_synced() {
        let storage = InMemoryStorage::new();
        storage.seed_local_commit(Commit::new("id1", b"c".to_vec()));

        storage
            .add_commits_from_sync(vec![Commit::new("id1", b"c".to_vec())], CommitSource::Cloud)
            .await
            .unwrap();

        assert!(storage.is_synced(&CommitId::from("id1")));
        assert_eq!(storage.commits().len(), 1);
    }

    #[tokio::test]
    async fn local_commit_notifies_watchers() {
        let storage = InMemoryStorage::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        storage.watch_commits(tx);

        storage.create_local_commit(Commit::new("id1", b"c".to_vec()));

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.source, CommitSource::Local);
        assert_eq!(batch.commits[0].id, CommitId::from("id1"));
    }

    #[tokio::test]
    async fn missing_objects_reports_unstored_references() {
        let storage = InMemoryStorage::new();
        let commit = Commit::new("id1", b"c".to_vec());
        storage.seed_local_commit(commit.clone());
        storage.set_commit_objects(
            commit.id.clone(),
            vec![ObjectId::from("obj1"), ObjectId::from("obj2")],
        );
        storage
            .add_object(ObjectId::from("obj1"), b"data".to_vec())
            .await
            .unwrap();

        let missing = storage.missing_objects(&[commit]).await.unwrap();
        assert_eq!(missing, vec![ObjectId::from("obj2")]);
    }

    #[tokio::test]
    async fn metadata_roundtrip() {
        let storage = InMemoryStorage::new();
        assert!(storage
            .get_sync_metadata(POSITION_TOKEN_KEY)
            .await
            .unwrap()
            .is_none());
        storage
            .set_sync_metadata(POSITION_TOKEN_KEY, b"7".to_vec())
            .await
            .unwrap();
        assert_eq!(
            storage.get_sync_metadata(POSITION_TOKEN_KEY).await.unwrap(),
            Some(b"7".to_vec())
        );
    }
}
