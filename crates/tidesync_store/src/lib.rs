//! # tidesync Store
//!
//! Repository contract and reference in-memory store for tidesync.
//!
//! Sync clients only need a small contract from storage: ordered
//! "changed since" queries, lookups by sync id, atomic commits and a
//! tombstone store. This crate defines that contract and one
//! implementation of it.
//!
//! This crate provides:
//! - [`Repository`], the object-safe storage contract
//! - [`Transaction`], a unit of work with read-your-writes
//! - [`MemoryRepository`], with unique indexes, tombstone pruning and
//!   JSON snapshots
//! - [`Clock`], [`SystemClock`] and [`ManualClock`]
//!
//! ## Example
//!
//! ```rust
//! use tidesync_store::{MemoryRepository, Repository, Transaction};
//!
//! let repo = MemoryRepository::new();
//! let mut txn = Transaction::new(&repo);
//! assert_eq!(txn.save_changes().unwrap(), 0);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod error;
mod memory;
mod repository;
mod row;
mod transaction;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StoreError, StoreResult};
pub use memory::{MemoryRepository, UniqueIndex, SNAPSHOT_FORMAT};
pub use repository::{PendingWrite, Repository, RowCursor, TombstoneCursor};
pub use row::{ChangeWindow, Row};
pub use transaction::{Transaction, TransactionState};
