//! Trove - self-hosted personal file storage
//!
//! Uploads stream through a size-bounded, hashing reader into a scratch
//! file, are deduplicated by content digest and land in a pluggable blob
//! backend (local disk, S3-compatible object storage or memory). File
//! metadata, folders, quotas and sessions live in SQLite or PostgreSQL.

pub mod account;
pub mod api;
pub mod auth;
pub mod blob_store;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod files;
pub mod jobs;
pub mod server;
pub mod stream;
pub mod upload;

pub use config::ServerConfig;
pub use context::AppContext;
pub use error::{TroveError, TroveResult};
