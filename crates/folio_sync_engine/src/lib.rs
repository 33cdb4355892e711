//! # Folio Sync Engine
//!
//! Client-side synchronization engine for folio pages.
//!
//! This crate provides:
//! - Per-page upload/download coordination (`PageSync`)
//! - Inbound and outbound sync state machines with explicit transitions
//! - Per-user bootstrap and cloud erasure detection (`UserSync`)
//! - Sync state aggregation across pages and applications (`Aggregator`)
//! - Retry with exponential backoff
//! - Collaborator traits for storage, cloud transport, and encryption,
//!   with in-memory doubles for testing
//!
//! ## Architecture
//!
//! Every page runs one event loop that owns both of its state machines.
//! Pending remote calls, storage calls, and backoff timers run as tasks
//! that post typed events onto the page's queue; all state transitions
//! happen in the loop, so they are atomic with respect to each other.
//! Destroying a coordinator aborts its tasks, which is what makes teardown
//! deterministic: no callback ever runs against a destroyed instance.
//!
//! ## Key Invariants
//!
//! - Commits upload in the order storage reports them, backlog before live
//! - Inbound commits apply to storage in cloud-arrival order, exactly once
//! - No upload batch starts while a download batch is being applied
//! - At most one un-acknowledged download notification is outstanding
//! - At most one upload batch is in flight, plus at most one remembered
//!   trigger
//! - The unrecoverable-error escalation fires at most once per page

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod aggregator;
mod backoff;
mod cloud;
mod config;
mod device_set;
mod download;
mod encryption;
mod error;
mod ledger_sync;
mod page_sync;
mod state;
mod storage;
mod tasks;
mod upload;
mod user_sync;

pub use aggregator::{Aggregator, AggregatorListener};
pub use backoff::Backoff;
pub use cloud::{
    AuthProvider, AuthToken, CommitPack, FixedAuthProvider, InMemoryCloud, PageCloud,
    RemoteNotification,
};
pub use config::RetryConfig;
pub use device_set::{
    fingerprint_path, generate_fingerprint, load_fingerprint, persist_fingerprint, DeviceSetCloud,
    FingerprintWatchEvent, InMemoryDeviceSet, FINGERPRINT_FILE,
};
pub use encryption::{EncryptionService, NoopEncryption, XorEncryption};
pub use error::{SyncError, SyncResult};
pub use ledger_sync::{LedgerSync, LedgerSyncImpl};
pub use page_sync::{PageSync, PageSyncArgs, PageSyncImpl};
pub use state::{DownloadSyncState, SyncStateContainer, SyncStateWatcher, UploadSyncState};
pub use storage::{
    CommitBatch, CommitSource, InMemoryStorage, PageStorage, POSITION_TOKEN_KEY,
};
pub use user_sync::{UserConfig, UserSync, UserSyncImpl};
