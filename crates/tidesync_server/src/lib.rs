//! # tidesync Server
//!
//! Reference sync server for tidesync.
//!
//! This crate provides:
//! - Request dispatch by path with JSON bodies (begin, change count, change
//!   pages, apply, corrections, end)
//! - Authentication (HMAC-SHA256 tokens naming an account and a role)
//! - Trust derivation: the options a caller sends are re-derived before a
//!   session opens
//! - Session ownership checks
//!
//! # Architecture
//!
//! The server is a [`tidesync_engine::DatabaseSyncClient`] over its own
//! repository, fronted by:
//! - A [`ServerSchema`] deciding which types and rows each caller may sync
//! - A [`ServerPolicy`] clamping page sizes, gating privileged options on
//!   the caller's role and dropping unknown side-channel values
//! - A [`RequestHandler`] checking that every call names a session the
//!   caller opened
//!
//! # Authentication
//!
//! Authentication is optional but recommended for production:
//!
//! ```rust,ignore
//! use tidesync_server::{AuthConfig, Caller, ServerConfig, TokenValidator};
//!
//! let secret = b"my-secure-secret-32-bytes-long!".to_vec();
//! let config = ServerConfig::default().with_auth(secret.clone());
//!
//! let validator = TokenValidator::new(AuthConfig::new(secret));
//! let token = validator.create_token(&Caller::user(account_id))?;
//! ```
//!
//! # Protocol
//!
//! Each round the client:
//! 1. Begins a session and receives the trusted options and `started_on`
//! 2. Pulls the server's changes in pages
//! 3. Pushes its own changes in pages
//! 4. Exchanges corrections for rejected objects
//! 5. Ends the session

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod policy;
mod schema;
mod server;

pub use auth::{AuthConfig, Caller, Role, TokenValidator, DEFAULT_TOKEN_EXPIRY};
pub use config::{ServerConfig, DEFAULT_MAX_ITEMS_PER_SYNC_REQUEST};
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use policy::ServerPolicy;
pub use schema::{ServerSchema, SharedSchema};
pub use server::SyncServer;
