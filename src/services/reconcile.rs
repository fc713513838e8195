//! Offline index rebuild (`--create-index`).
//!
//! Walks the storage root and registers every object file that has no index
//! row yet. Rows whose files have disappeared are left alone. Items that hit
//! SQLite lock contention go back on the queue with a growing back-off.

use crate::{
    models::object::NewObject,
    services::metadata_index::{IndexError, MetadataIndex, PutOutcome},
};
use std::{
    collections::VecDeque,
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, warn};

const MAX_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Object files found under the storage root.
    pub scanned: usize,
    /// Rows created by this run.
    pub indexed: usize,
    /// Files that already had a row.
    pub skipped: usize,
    /// Files that could not be indexed.
    pub failed: usize,
}

struct Candidate {
    path: PathBuf,
    bucket: String,
    key: String,
    attempts: u32,
}

pub async fn create_index(
    index: &MetadataIndex,
    storage_root: &Path,
) -> io::Result<ReconcileSummary> {
    let files = list_files(storage_root).await?;
    info!("Found {} objects.", files.len());
    info!("Creating index...");

    let mut summary = ReconcileSummary {
        scanned: files.len(),
        ..Default::default()
    };

    let mut queue: VecDeque<Candidate> = files
        .into_iter()
        .filter_map(|path| {
            let (bucket, key) = split_object_path(storage_root, &path)?;
            Some(Candidate {
                path,
                bucket,
                key,
                attempts: 0,
            })
        })
        .collect();
    summary.failed += summary.scanned - queue.len();

    while let Some(mut item) = queue.pop_front() {
        item.attempts += 1;
        match index_one(index, &item).await {
            Ok(Some(PutOutcome::Inserted)) => summary.indexed += 1,
            Ok(Some(PutOutcome::AlreadyExists)) | Ok(None) => summary.skipped += 1,
            Err(IndexOneError::Index(err))
                if err.is_lock_contention() && item.attempts < MAX_ATTEMPTS =>
            {
                warn!(
                    bucket = %item.bucket,
                    key = %item.key,
                    attempt = item.attempts,
                    "index locked, re-queueing"
                );
                tokio::time::sleep(RETRY_BACKOFF * item.attempts).await;
                queue.push_back(item);
            }
            Err(err) => {
                error!(
                    bucket = %item.bucket,
                    key = %item.key,
                    "failed to index object: {}",
                    err
                );
                summary.failed += 1;
            }
        }
    }

    info!(
        indexed = summary.indexed,
        skipped = summary.skipped,
        failed = summary.failed,
        "Index created."
    );
    Ok(summary)
}

#[derive(Debug, Error)]
enum IndexOneError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// `Ok(None)` when the file vanished or already has a row.
async fn index_one(
    index: &MetadataIndex,
    item: &Candidate,
) -> Result<Option<PutOutcome>, IndexOneError> {
    if index.get(&item.bucket, &item.key).await?.is_some() {
        return Ok(None);
    }

    let size = match fs::metadata(&item.path).await {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let filename = item
        .key
        .rsplit('/')
        .next()
        .unwrap_or(item.key.as_str())
        .to_string();
    let mime = mime_guess::from_path(&item.path)
        .first_or_octet_stream()
        .to_string();

    let outcome = index
        .put(&NewObject {
            bucket: &item.bucket,
            key: &item.key,
            mime: &mime,
            filename: &filename,
            size: size as i64,
        })
        .await?;
    Ok(Some(outcome))
}

/// Every regular file under `root`, skipping hidden temporaries.
async fn list_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut dirs = vec![root.to_path_buf()];

    while let Some(dir) = dirs.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound && dir != root => continue,
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                debug!("skipping hidden entry {}", entry.path().display());
                continue;
            }
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                dirs.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }

    files.sort();
    Ok(files)
}

/// `<root>/<bucket>/<key...>` -> `(bucket, key)`; `None` for files at the root.
fn split_object_path(root: &Path, path: &Path) -> Option<(String, String)> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned());
    let bucket = parts.next()?;
    let key = parts.collect::<Vec<_>>().join("/");
    if key.is_empty() {
        return None;
    }
    Some((bucket, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn indexes_unknown_files_once() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("bucket");
        std::fs::create_dir_all(root.join("docs/2024")).unwrap();
        std::fs::create_dir_all(root.join("img")).unwrap();
        std::fs::write(root.join("docs/2024/report.pdf"), b"%PDF-1.7").unwrap();
        std::fs::write(root.join("docs/readme.txt"), b"hello").unwrap();
        std::fs::write(root.join("img/.tmp-123"), b"partial").unwrap();
        std::fs::write(root.join("stray.bin"), b"no bucket").unwrap();

        let index = MetadataIndex::open_file(&dir.path().join("index.sqlite3"))
            .await
            .unwrap();
        index.migrate().await.unwrap();
        index
            .put(&NewObject {
                bucket: "docs",
                key: "readme.txt",
                mime: "text/markdown",
                filename: "README",
                size: 5,
            })
            .await
            .unwrap();

        let summary = create_index(&index, &root).await.unwrap();
        assert_eq!(summary.scanned, 3);
        assert_eq!(summary.indexed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);

        let report = index.get("docs", "2024/report.pdf").await.unwrap().unwrap();
        assert_eq!(report.filename, "report.pdf");
        assert_eq!(report.mime, "application/pdf");
        assert_eq!(report.size, 8);

        // Existing rows are not rewritten.
        let readme = index.get("docs", "readme.txt").await.unwrap().unwrap();
        assert_eq!(readme.mime, "text/markdown");

        let again = create_index(&index, &root).await.unwrap();
        assert_eq!(again.indexed, 0);
        assert_eq!(again.skipped, 2);
    }

    #[test]
    fn splits_bucket_and_key() {
        let root = Path::new("/srv/data");
        assert_eq!(
            split_object_path(root, Path::new("/srv/data/b/x/y.txt")),
            Some(("b".to_string(), "x/y.txt".to_string()))
        );
        assert_eq!(split_object_path(root, Path::new("/srv/data/top.txt")), None);
    }
}
