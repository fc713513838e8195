//! Represents multipart upload sessions and their terminal results.

/// Lifecycle of a multipart upload session.
///
/// Every state except `Initiated` is terminal; the session is deregistered and
/// its scratch directory removed when it leaves `Initiated`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadState {
    Initiated,
    Completed,
    Aborted,
    Expired,
}

impl UploadState {
    pub fn is_live(self) -> bool {
        self == UploadState::Initiated
    }
}

/// Declared properties of a new multipart upload.
#[derive(Clone, Debug)]
pub struct UploadRequest {
    pub bucket: String,
    pub key: String,
    /// Content type declared when the upload was initiated.
    pub mime: String,
    /// Raw `Content-Disposition` value sent with the initiate call, if any.
    pub disposition: Option<String>,
}

/// Outcome of a successful `CompleteMultipartUpload`.
#[derive(Clone, Debug)]
pub struct CompletedUpload {
    pub bucket: String,
    pub key: String,
    pub mime: String,
    pub disposition: Option<String>,
    pub size: u64,
    /// Hex MD5 of the merged bytes.
    pub etag: String,
    pub part_count: usize,
}
