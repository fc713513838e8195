//! Storage-side building blocks: signature checks, the metadata index, the
//! multipart registry, part merging and the offline reconciliation scan.

use std::path::{Path, PathBuf};

pub mod metadata_index;
pub mod multipart_registry;
pub mod reconcile;
pub mod signature;
pub mod stream_merger;

/// On-disk location of an object: `<root>/<bucket>/<key>`.
///
/// Callers must have validated `bucket` and `key` first.
pub fn object_path(root: &Path, bucket: &str, key: &str) -> PathBuf {
    let mut path = root.join(bucket);
    for segment in key.split('/').filter(|s| !s.is_empty()) {
        path.push(segment);
    }
    path
}
