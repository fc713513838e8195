//! Concatenates part files into one output file.
//!
//! Bytes are written to a hidden sibling of `output`, flushed and synced, then
//! renamed into place. A failed merge removes the temporary file and leaves
//! any previous `output` untouched.

use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Size and digest of a finished merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    pub size: u64,
    /// Lowercase hex MD5 of the merged bytes.
    pub md5: String,
}

/// Copy every file in `inputs`, in order, into `output`.
pub async fn merge<P: AsRef<Path>>(inputs: &[P], output: &Path) -> io::Result<MergeSummary> {
    let tmp_path = temp_sibling(output)?;
    match copy_all(inputs, &tmp_path).await {
        Ok(summary) => {
            if let Err(err) = fs::rename(&tmp_path, output).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
            debug!(
                output = %output.display(),
                parts = inputs.len(),
                size = summary.size,
                "merged part files"
            );
            Ok(summary)
        }
        Err(err) => {
            let _ = fs::remove_file(&tmp_path).await;
            Err(err)
        }
    }
}

/// Write `bytes` to `path` through a temporary sibling and an atomic rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp_path = temp_sibling(path)?;
    let result = async {
        let mut file = File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        fs::rename(&tmp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }
    result
}

async fn copy_all<P: AsRef<Path>>(inputs: &[P], tmp_path: &Path) -> io::Result<MergeSummary> {
    let mut out = File::create(tmp_path).await?;
    let mut digest = Context::new();
    let mut size: u64 = 0;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    for input in inputs {
        let mut part = File::open(input.as_ref()).await?;
        loop {
            let n = part.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digest.consume(&buf[..n]);
            out.write_all(&buf[..n]).await?;
            size += n as u64;
        }
    }

    out.flush().await?;
    out.sync_all().await?;

    Ok(MergeSummary {
        size,
        md5: format!("{:x}", digest.compute()),
    })
}

fn temp_sibling(path: &Path) -> io::Result<PathBuf> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(ErrorKind::InvalidInput, "output path missing parent directory")
    })?;
    Ok(parent.join(format!(".tmp-{}", Uuid::new_v4())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn concatenates_in_given_order() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        std::fs::write(&a, b"first-").unwrap();
        std::fs::write(&b, b"second-").unwrap();
        std::fs::write(&c, b"third").unwrap();

        let out = dir.path().join("out.bin");
        let summary = merge(&[&c, &a, &b], &out).await.unwrap();

        assert_eq!(std::fs::read(&out).unwrap(), b"thirdfirst-second-");
        assert_eq!(summary.size, 18);
        assert_eq!(
            summary.md5,
            format!("{:x}", md5::compute(b"thirdfirst-second-"))
        );
    }

    #[tokio::test]
    async fn missing_input_fails_without_output() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        std::fs::write(&a, b"data").unwrap();
        let missing = dir.path().join("missing");

        let out = dir.path().join("out.bin");
        let err = merge(&[&a, &missing], &out).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!out.exists());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn failed_merge_keeps_previous_output() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.bin");
        std::fs::write(&out, b"previous").unwrap();

        let missing = dir.path().join("missing");
        assert!(merge(&[&missing], &out).await.is_err());
        assert_eq!(std::fs::read(&out).unwrap(), b"previous");
    }

    #[tokio::test]
    async fn write_atomic_replaces_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("obj");
        write_atomic(&path, b"one").await.unwrap();
        write_atomic(&path, b"two").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
    }
}
