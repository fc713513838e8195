//! Core data models for the S3-compatible object storage service.
//!
//! `Object` maps to the `objects` table via `sqlx::FromRow`; multipart
//! sessions are memory-only and never persisted.

pub mod multipart;
pub mod object;
