//! Represents an object (file) stored in a bucket.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Index row for a single stored object.
///
/// The `Object` struct stores its metadata, not the actual content bytes;
/// those live on disk at `<storage_dir>/<bucket>/<key>`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Object {
    /// Primary key, `bucket + "/" + key`.
    pub id: String,

    /// Top-level namespace.
    pub bucket: String,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Content type (MIME type).
    pub mime: String,

    /// Display name sent back in `Content-Disposition`.
    pub filename: String,

    /// Size in bytes.
    pub size: i64,
}

impl Object {
    pub fn object_id(bucket: &str, key: &str) -> String {
        format!("{}/{}", bucket, key)
    }
}

/// Values supplied when registering an object in the index.
#[derive(Clone, Debug)]
pub struct NewObject<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
    pub mime: &'a str,
    pub filename: &'a str,
    pub size: i64,
}

/// Aggregate over every indexed object in one bucket.
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BucketStats {
    #[serde(rename = "objects")]
    pub object_count: i64,
    #[serde(rename = "totalSize")]
    pub total_size_bytes: i64,
}
