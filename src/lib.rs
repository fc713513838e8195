//! Self-hosted object storage speaking a subset of the S3 object API.
//!
//! Object bytes live on the local filesystem; a SQLite index holds object
//! metadata; multipart uploads are tracked in memory until they complete,
//! are aborted, or expire.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
