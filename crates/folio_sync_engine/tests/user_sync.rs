//! Integration tests for user bootstrap, erasure detection, and the full
//! user → ledger → page wiring.

use folio_sync_engine::{
    load_fingerprint, DeviceSetCloud, FixedAuthProvider, InMemoryCloud, InMemoryDeviceSet,
    InMemoryStorage, LedgerSync, NoopEncryption, PageSync, RetryConfig, SyncStateContainer,
    UserConfig, UserSync, UserSyncImpl,
};
use folio_sync_protocol::{AppId, Commit, CommitId, Fingerprint, PageId, Status};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn fast_retry() -> RetryConfig {
    RetryConfig::new(5)
        .with_initial_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(20))
        .without_jitter()
}

fn fast_config(dir: &std::path::Path) -> UserConfig {
    UserConfig::new(dir)
        .with_retry(fast_retry())
        .with_page_retry(fast_retry())
}

struct UserFixture {
    user: UserSyncImpl,
    device_set: Arc<InMemoryDeviceSet>,
    mismatch_count: Arc<AtomicUsize>,
}

fn make_user(dir: &std::path::Path, device_set: Arc<InMemoryDeviceSet>) -> UserFixture {
    let mismatch_count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&mismatch_count);
    let user = UserSyncImpl::new(
        fast_config(dir),
        device_set.clone(),
        Arc::new(FixedAuthProvider::new("token")),
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    UserFixture {
        user,
        device_set,
        mismatch_count,
    }
}

async fn wait_for(label: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {label}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn bootstrap_generates_and_installs_fingerprint() {
    let dir = tempfile::tempdir().unwrap();
    let fx = make_user(dir.path(), Arc::new(InMemoryDeviceSet::new()));

    fx.user.start().unwrap();
    wait_for("upload enabled", || fx.user.upload_enabled()).await;

    let fingerprint = load_fingerprint(&fx.user.fingerprint_path())
        .unwrap()
        .expect("fingerprint persisted");
    assert!(fx.device_set.contains(&fingerprint));
    assert!(fx.device_set.timestamp_updates() >= 1);
    assert!(fx.device_set.has_watcher(&fingerprint));
    assert_eq!(fx.mismatch_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn repeated_bootstrap_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let device_set = Arc::new(InMemoryDeviceSet::new());

    let first = make_user(dir.path(), device_set.clone());
    first.user.start().unwrap();
    wait_for("first bootstrap", || first.user.upload_enabled()).await;
    let fingerprint = load_fingerprint(&first.user.fingerprint_path())
        .unwrap()
        .unwrap();
    drop(first);

    // A second session over the same directory verifies the same value and
    // changes nothing.
    let second = make_user(dir.path(), device_set.clone());
    second.user.start().unwrap();
    wait_for("second bootstrap", || second.user.upload_enabled()).await;

    let reloaded = load_fingerprint(&second.user.fingerprint_path())
        .unwrap()
        .unwrap();
    assert_eq!(reloaded, fingerprint);
    assert_eq!(second.mismatch_count.load(Ordering::SeqCst), 0);
    assert!(device_set.check_calls() >= 1);
}

#[tokio::test]
async fn erasure_invokes_version_mismatch_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let device_set = Arc::new(InMemoryDeviceSet::new());

    // A fingerprint exists locally but the cloud set does not know it.
    std::fs::create_dir_all(dir.path()).unwrap();
    std::fs::write(dir.path().join("fingerprint"), "some-value").unwrap();

    let fx = make_user(dir.path(), device_set);
    fx.user.start().unwrap();
    wait_for("mismatch callback", || {
        fx.mismatch_count.load(Ordering::SeqCst) > 0
    })
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.mismatch_count.load(Ordering::SeqCst), 1);
    assert!(!fx.user.upload_enabled());

    // Ledgers created after the mismatch stay upload-disabled.
    let ledger = fx
        .user
        .create_ledger_sync(AppId::from("app"), Arc::new(NoopEncryption))
        .unwrap();
    assert!(!ledger.upload_enabled());
}

#[tokio::test]
async fn bootstrap_retries_network_errors() {
    let dir = tempfile::tempdir().unwrap();
    let device_set = Arc::new(InMemoryDeviceSet::new());
    let fingerprint = Fingerprint::from("some-value");
    device_set.seed_fingerprint(fingerprint.clone());
    std::fs::write(dir.path().join("fingerprint"), fingerprint.as_str()).unwrap();

    device_set.fail_next_check(Status::NetworkError);
    device_set.fail_next_check(Status::NetworkError);

    let fx = make_user(dir.path(), device_set.clone());
    fx.user.start().unwrap();
    wait_for("upload enabled after retries", || fx.user.upload_enabled()).await;

    assert!(device_set.check_calls() >= 3);
    assert_eq!(fx.mismatch_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn mid_session_erasure_detected_through_watch() {
    let dir = tempfile::tempdir().unwrap();
    let fx = make_user(dir.path(), Arc::new(InMemoryDeviceSet::new()));

    fx.user.start().unwrap();
    wait_for("upload enabled", || fx.user.upload_enabled()).await;

    fx.device_set.erase_all_fingerprints().await.unwrap();
    wait_for("mismatch after erase", || {
        fx.mismatch_count.load(Ordering::SeqCst) > 0
    })
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.mismatch_count.load(Ordering::SeqCst), 1);
    assert!(!fx.user.upload_enabled());
}

#[tokio::test]
async fn watch_is_reinstalled_after_network_error() {
    let dir = tempfile::tempdir().unwrap();
    let fx = make_user(dir.path(), Arc::new(InMemoryDeviceSet::new()));

    fx.user.start().unwrap();
    wait_for("upload enabled", || fx.user.upload_enabled()).await;
    let fingerprint = load_fingerprint(&fx.user.fingerprint_path())
        .unwrap()
        .unwrap();

    fx.device_set
        .break_watch(&fingerprint, Status::NetworkError);
    wait_for("watch reinstalled", || {
        fx.device_set.has_watcher(&fingerprint)
    })
    .await;

    assert_eq!(fx.mismatch_count.load(Ordering::SeqCst), 0);
    assert!(fx.user.upload_enabled());
}

#[tokio::test]
async fn ledgers_created_before_bootstrap_are_enabled_retroactively() {
    let dir = tempfile::tempdir().unwrap();
    let fx = make_user(dir.path(), Arc::new(InMemoryDeviceSet::new()));

    let ledger = fx
        .user
        .create_ledger_sync(AppId::from("app"), Arc::new(NoopEncryption))
        .unwrap();
    assert!(!ledger.upload_enabled());

    fx.user.start().unwrap();
    wait_for("retroactive enable", || ledger.upload_enabled()).await;
}

#[tokio::test]
async fn full_stack_uploads_after_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    let fx = make_user(dir.path(), Arc::new(InMemoryDeviceSet::new()));

    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    fx.user
        .set_sync_watcher(Box::new(move |state: SyncStateContainer| {
            sink.lock().push(state);
        }))
        .unwrap();

    let ledger = fx
        .user
        .create_ledger_sync(AppId::from("notes"), Arc::new(NoopEncryption))
        .unwrap();

    let storage = Arc::new(InMemoryStorage::new());
    storage.seed_local_commit(Commit::new("id1", b"content1".to_vec()));
    let cloud = InMemoryCloud::new();
    let page = ledger
        .create_page_sync(PageId::from("page"), storage.clone(), Arc::new(cloud.clone()))
        .unwrap();
    page.start().unwrap();

    // Upload only proceeds once the user bootstrap enables it.
    fx.user.start().unwrap();
    wait_for("commit uploaded", || {
        cloud.commit_ids() == vec![CommitId::from("id1")]
    })
    .await;

    assert!(storage.is_synced(&CommitId::from("id1")));
    assert!(!states.lock().is_empty());

    drop(page);
    drop(ledger);
}
