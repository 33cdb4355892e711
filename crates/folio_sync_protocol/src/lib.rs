//! # Folio Sync Protocol
//!
//! Shared data types for the folio synchronization layer.
//!
//! This crate provides:
//! - Commit and identifier value types (`Commit`, `CommitId`, `PageId`, `AppId`)
//! - Content-addressed object identifiers (`ObjectId`)
//! - The opaque server resume cursor (`PositionToken`)
//! - Device fingerprint values (`Fingerprint`)
//! - The cloud status taxonomy (`Status`)
//!
//! Everything here is a plain value: no I/O, no state machines. The sync
//! engine and any transport implementation depend on this crate so that both
//! sides of the wire agree on the vocabulary.
//!
//! ## Key Invariants
//!
//! - Commit ids and position tokens are opaque byte strings; nothing in this
//!   workspace orders or interprets them
//! - Commit content is plaintext locally and encrypted on the wire; the
//!   types carry it either way without inspecting it
//! - Statuses classify themselves as retryable or fatal; callers never match
//!   on transport-specific error strings

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod commit;
mod fingerprint;
mod object;
mod position;
mod status;

pub use commit::{AppId, Commit, CommitId, PageId};
pub use fingerprint::Fingerprint;
pub use object::ObjectId;
pub use position::PositionToken;
pub use status::Status;
