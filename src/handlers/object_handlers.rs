//! HTTP handler for `/{bucket}/{*key}`.
//!
//! Reads are answered from the metadata index and streamed from disk without
//! authentication. Every other method must carry a valid SigV4 signature and
//! names its S3 operation through the `x-id` query parameter.

use crate::{
    errors::AppError,
    handlers::xml_escape,
    models::{multipart::UploadRequest, object::NewObject, object::Object},
    services::{object_path, signature, stream_merger},
    state::AppState,
};
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::Response,
};
use percent_encoding::{NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::Deserialize;
use std::{
    fmt,
    io::{self, ErrorKind},
    path::Path as FsPath,
    str::FromStr,
};
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, warn};

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MAX_PART_NUMBER: u32 = 10_000;
const DEFAULT_MIME: &str = "application/octet-stream";
const CACHE_CONTROL: &str = "public, max-age=31536000, immutable";
const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Query parameters that select and parameterize an S3 operation.
#[derive(Debug, Default, Deserialize)]
pub struct ObjectQuery {
    #[serde(rename = "x-id")]
    pub action: Option<String>,
    #[serde(rename = "uploadId")]
    pub upload_id: Option<String>,
    #[serde(rename = "partNumber")]
    pub part_number: Option<String>,
}

/// Write-side operations selected by `x-id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    PutObject,
    DeleteObject,
    CreateMultipartUpload,
    UploadPart,
    CompleteMultipartUpload,
    AbortMultipartUpload,
}

impl FromStr for Action {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PutObject" => Ok(Action::PutObject),
            "DeleteObject" => Ok(Action::DeleteObject),
            "CreateMultipartUpload" => Ok(Action::CreateMultipartUpload),
            "UploadPart" => Ok(Action::UploadPart),
            "CompleteMultipartUpload" => Ok(Action::CompleteMultipartUpload),
            "AbortMultipartUpload" => Ok(Action::AbortMultipartUpload),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Entry point for every method on `/{bucket}/{*key}`.
pub async fn handle_object(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<ObjectQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    if !matches!(
        method,
        Method::GET | Method::HEAD | Method::POST | Method::PUT | Method::DELETE
    ) {
        return Err(AppError::method_not_allowed(format!(
            "method {} is not supported",
            method
        )));
    }

    ensure_location_safe(&bucket, &key)?;

    if method == Method::GET || method == Method::HEAD {
        let result = serve_object(&state, &bucket, &key, method == Method::HEAD).await;
        if let Err(err) = &result {
            log_failure(err, &bucket, &key, &method);
        }
        return result;
    }

    let signed = signature::SignedRequest {
        method: &method,
        uri: &uri,
        headers: &headers,
    };
    if !signature::verify(&signed, &state.config.access_key, &state.config.secret_key) {
        debug!(%method, %bucket, %key, "rejected request with invalid signature");
        return Err(AppError::forbidden(
            "the request signature does not match the configured credentials",
        ));
    }

    let file_path = object_path(&state.config.storage_dir, &bucket, &key);
    if method == Method::POST || method == Method::PUT {
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await.map_err(|err| {
                error!(%bucket, %key, "failed to create object directory: {}", err);
                AppError::from(err)
            })?;
        }
    }

    let action = query
        .action
        .as_deref()
        .and_then(|a| a.parse::<Action>().ok())
        .ok_or_else(|| AppError::bad_request("missing or unsupported x-id action"))?;

    let request = ObjectRequest {
        state: &state,
        bucket: &bucket,
        key: &key,
        file_path: &file_path,
        uri: &uri,
        headers: &headers,
        query: &query,
    };

    let result = match action {
        Action::PutObject => put_object(&request, body).await,
        Action::DeleteObject => delete_object(&request).await,
        Action::CreateMultipartUpload => create_multipart_upload(&request).await,
        Action::UploadPart => upload_part(&request, body).await,
        Action::CompleteMultipartUpload => complete_multipart_upload(&request).await,
        Action::AbortMultipartUpload => abort_multipart_upload(&request).await,
    };

    if let Err(err) = &result {
        log_failure(err, &bucket, &key, &action);
    }
    result
}

fn log_failure(err: &AppError, bucket: &str, key: &str, operation: &dyn fmt::Display) {
    if err.status.is_server_error() {
        error!(bucket, key, %operation, "request failed: {}", err);
    } else {
        debug!(bucket, key, %operation, "request rejected: {}", err);
    }
}

struct ObjectRequest<'a> {
    state: &'a AppState,
    bucket: &'a str,
    key: &'a str,
    file_path: &'a FsPath,
    uri: &'a Uri,
    headers: &'a HeaderMap,
    query: &'a ObjectQuery,
}

impl ObjectRequest<'_> {
    fn upload_id(&self) -> Result<&str, AppError> {
        self.query
            .upload_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::bad_request("uploadId is required"))
    }

    fn part_number(&self) -> Result<u32, AppError> {
        let raw = self
            .query
            .part_number
            .as_deref()
            .ok_or_else(|| AppError::bad_request("partNumber is required"))?;
        match raw.parse::<u32>() {
            Ok(n) if (1..=MAX_PART_NUMBER).contains(&n) => Ok(n),
            _ => Err(AppError::bad_request(format!(
                "partNumber must be between 1 and {}",
                MAX_PART_NUMBER
            ))),
        }
    }

    /// Insert-only unless the server runs with `overwrite_metadata`.
    async fn record(&self, object: &NewObject<'_>) -> Result<(), AppError> {
        if self.state.config.overwrite_metadata {
            self.state.index.upsert(object).await?;
        } else {
            self.state.index.put(object).await?;
        }
        Ok(())
    }
}

async fn put_object(req: &ObjectRequest<'_>, body: Bytes) -> Result<Response, AppError> {
    let mime = content_type(req.headers);
    let disposition = header_str(req.headers, header::CONTENT_DISPOSITION);
    let filename = resolve_filename(disposition, req.key);

    stream_merger::write_atomic(req.file_path, &body).await?;
    req.record(&NewObject {
        bucket: req.bucket,
        key: req.key,
        mime: &mime,
        filename: &filename,
        size: body.len() as i64,
    })
    .await?;

    let etag = format!("\"{:x}\"", md5::compute(&body));
    let mut response = Response::new(Body::empty());
    insert_header(response.headers_mut(), header::ETAG, &etag);
    Ok(response)
}

async fn delete_object(req: &ObjectRequest<'_>) -> Result<Response, AppError> {
    match fs::remove_file(req.file_path).await {
        Ok(()) => debug!("removed physical file {}", req.file_path.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("file {} already missing", req.file_path.display());
        }
        Err(err) => return Err(err.into()),
    }

    req.state.index.delete(req.bucket, req.key).await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    Ok(response)
}

async fn create_multipart_upload(req: &ObjectRequest<'_>) -> Result<Response, AppError> {
    let upload_id = req
        .state
        .registry
        .create(UploadRequest {
            bucket: req.bucket.to_string(),
            key: req.key.to_string(),
            mime: content_type(req.headers),
            disposition: header_str(req.headers, header::CONTENT_DISPOSITION).map(str::to_string),
        })
        .await?;

    let xml = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<InitiateMultipartUploadResult xmlns="{}">"#,
            r#"<Bucket>{}</Bucket>"#,
            r#"<Key>{}</Key>"#,
            r#"<UploadId>{}</UploadId>"#,
            r#"</InitiateMultipartUploadResult>"#
        ),
        S3_XMLNS,
        xml_escape(req.bucket),
        xml_escape(req.key),
        xml_escape(&upload_id)
    );
    Ok(xml_response(xml))
}

async fn upload_part(req: &ObjectRequest<'_>, body: Bytes) -> Result<Response, AppError> {
    let upload_id = req.upload_id()?;
    let part_number = req.part_number()?;

    let etag = req
        .state
        .registry
        .upload_part(upload_id, part_number, &body)
        .await?;

    let mut response = Response::new(Body::empty());
    insert_header(response.headers_mut(), header::ETAG, &format!("\"{}\"", etag));
    Ok(response)
}

async fn complete_multipart_upload(req: &ObjectRequest<'_>) -> Result<Response, AppError> {
    let upload_id = req.upload_id()?;
    let completed = req.state.registry.complete(upload_id).await?;

    let filename = resolve_filename(completed.disposition.as_deref(), &completed.key);
    req.record(&NewObject {
        bucket: &completed.bucket,
        key: &completed.key,
        mime: &completed.mime,
        filename: &filename,
        size: completed.size as i64,
    })
    .await?;

    let xml = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<CompleteMultipartUploadResult xmlns="{}">"#,
            r#"<Location>{}</Location>"#,
            r#"<Bucket>{}</Bucket>"#,
            r#"<Key>{}</Key>"#,
            r#"<ETag>"{}"</ETag>"#,
            r#"</CompleteMultipartUploadResult>"#
        ),
        S3_XMLNS,
        xml_escape(req.uri.path()),
        xml_escape(&completed.bucket),
        xml_escape(&completed.key),
        xml_escape(&completed.etag)
    );
    Ok(xml_response(xml))
}

async fn abort_multipart_upload(req: &ObjectRequest<'_>) -> Result<Response, AppError> {
    let upload_id = req.upload_id()?;
    req.state.registry.abort(upload_id).await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    Ok(response)
}

/// GET/HEAD from the index; the file is only opened for GET.
async fn serve_object(
    state: &AppState,
    bucket: &str,
    key: &str,
    head_only: bool,
) -> Result<Response, AppError> {
    let object = state
        .index
        .get(bucket, key)
        .await?
        .ok_or_else(|| AppError::not_found(format!("object `{}/{}` not found", bucket, key)))?;

    if head_only {
        let mut response = Response::new(Body::empty());
        set_object_headers(response.headers_mut(), &object, object.size.max(0) as u64);
        return Ok(response);
    }

    let file_path = object_path(&state.config.storage_dir, bucket, key);
    let file = File::open(&file_path).await.map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            warn!(bucket, key, "index row present but object file is missing");
            AppError::not_found(format!("object `{}/{}` not found", bucket, key))
        } else {
            AppError::from(err)
        }
    })?;
    // The index is insert-only by default, so the file may have been
    // rewritten since the row was stored.
    let length = file.metadata().await?.len();

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    set_object_headers(response.headers_mut(), &object, length);
    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &Object, length: u64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.mime)
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_MIME)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    insert_header(
        headers,
        header::CONTENT_DISPOSITION,
        &content_disposition(&meta.filename),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(CACHE_CONTROL),
    );
}

/// Basic key validation to avoid path traversal vectors.
///
/// Runs before any filesystem path is built from `bucket` or `key`.
pub fn ensure_location_safe(bucket: &str, key: &str) -> Result<(), AppError> {
    if bucket.is_empty() || key.is_empty() {
        return Err(AppError::bad_request("bucket and key are required"));
    }
    if key.len() > MAX_OBJECT_KEY_LEN {
        return Err(AppError::bad_request("object key is too long"));
    }
    if bucket.contains('/') || key.split('/').any(str::is_empty) {
        return Err(AppError::bad_request("invalid object location"));
    }
    if bucket
        .split('/')
        .chain(key.split('/'))
        .any(|segment| segment.contains("..") || segment == ".")
    {
        return Err(AppError::bad_request(
            "path segments must not contain parent-directory references",
        ));
    }
    if bucket
        .bytes()
        .chain(key.bytes())
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(AppError::bad_request("invalid characters in object location"));
    }
    Ok(())
}

/// Display name from `Content-Disposition`, falling back to the key's basename.
pub fn resolve_filename(disposition: Option<&str>, key: &str) -> String {
    disposition
        .and_then(disposition_filename)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| key.rsplit('/').next().unwrap_or(key).to_string())
}

/// Extract `filename*=` (RFC 5987) or `filename=` from a disposition value.
fn disposition_filename(value: &str) -> Option<String> {
    let mut plain = None;
    for param in value.split(';').map(str::trim) {
        let Some((name, raw)) = param.split_once('=') else {
            continue;
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                let raw = raw.trim();
                // charset'language'percent-encoded
                let encoded = raw.splitn(3, '\'').nth(2).unwrap_or(raw);
                let decoded = percent_decode_str(encoded).decode_utf8_lossy().into_owned();
                return Some(decoded);
            }
            "filename" => {
                plain = Some(raw.trim().trim_matches('"').replace("\\\"", "\""));
            }
            _ => {}
        }
    }
    plain
}

fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "inline; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        utf8_percent_encode(filename, NON_ALPHANUMERIC)
    )
}

fn content_type(headers: &HeaderMap) -> String {
    header_str(headers, header::CONTENT_TYPE)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_MIME)
        .to_string()
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn insert_header(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn xml_response(xml: String) -> Response {
    let mut response = Response::new(Body::from(xml));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_and_empty_locations() {
        assert!(ensure_location_safe("b", "a/b/c.txt").is_ok());
        assert!(ensure_location_safe("b", "").is_err());
        assert!(ensure_location_safe("", "k").is_err());
        assert!(ensure_location_safe("..", "k").is_err());
        assert!(ensure_location_safe("b", "../etc/passwd").is_err());
        assert!(ensure_location_safe("b", "a/../../x").is_err());
        assert!(ensure_location_safe("b", "/abs").is_err());
        assert!(ensure_location_safe("b", "a//b").is_err());
        assert!(ensure_location_safe("b", "dir/").is_err());
        assert!(ensure_location_safe("b", "a\\..\\x").is_err());
        assert!(ensure_location_safe("b", "nul\0byte").is_err());
    }

    #[test]
    fn parses_action_indicator() {
        assert_eq!("PutObject".parse::<Action>(), Ok(Action::PutObject));
        assert_eq!(
            "CompleteMultipartUpload".parse::<Action>(),
            Ok(Action::CompleteMultipartUpload)
        );
        assert!("ListObjects".parse::<Action>().is_err());
        assert!("putobject".parse::<Action>().is_err());
    }

    #[test]
    fn resolves_filename_from_disposition_or_key() {
        assert_eq!(
            resolve_filename(Some("attachment; filename=\"report.pdf\""), "x/y"),
            "report.pdf"
        );
        assert_eq!(
            resolve_filename(
                Some("attachment; filename=\"fallback.txt\"; filename*=UTF-8''%E5%A0%B1%E5%91%8A.txt"),
                "x/y"
            ),
            "報告.txt"
        );
        assert_eq!(resolve_filename(Some("inline"), "docs/2024/a.txt"), "a.txt");
        assert_eq!(resolve_filename(None, "plain"), "plain");
    }

    #[test]
    fn content_disposition_has_ascii_fallback() {
        assert_eq!(
            content_disposition("a b.txt"),
            "inline; filename=\"a b.txt\"; filename*=UTF-8''a%20b%2Etxt"
        );
        assert!(content_disposition("報告.txt").starts_with("inline; filename=\"__.txt\""));
    }
}
