//! # tidesync Testkit
//!
//! Test utilities and a sample domain for tidesync.
//!
//! This crate provides:
//! - A sample domain: addresses, people, an append-only audit log and
//!   accounts that clients see through a DTO
//! - [`DemoSchema`], deciding what each caller may sync on the server, and
//!   [`local_registry`] for client repositories
//! - Peer and server fixtures wired over the in-process transport
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tidesync_testkit::prelude::*;
//!
//! #[test]
//! fn phone_reaches_server() {
//!     let clock = test_clock();
//!     let server = TestServer::new(&clock);
//!     let phone = TestPeer::new(&clock);
//!     let account = server.add_account("Ada", "ada@example.com", &["user"]);
//!     let caller = Caller::user(account.meta.sync_id);
//!
//!     phone.add(Person::new(caller.account_id, "Bob", "bob@example.com"));
//!     server.engine(&phone, &caller, test_config()).sync().unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod models;
pub mod schema;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::models::*;
    pub use crate::schema::*;
    pub use tidesync_server::Caller;
}

pub use fixtures::*;
pub use generators::*;
pub use models::*;
pub use schema::*;
