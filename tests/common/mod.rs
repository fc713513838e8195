#![allow(dead_code)]

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use http_body_util::BodyExt;
use ofuton_store::config::AppConfig;
use ofuton_store::routes::routes;
use ofuton_store::services::metadata_index::MetadataIndex;
use ofuton_store::services::signature::{
    canonical_request, compute_signature, derive_signing_key, string_to_sign,
};
use ofuton_store::state::AppState;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tower::ServiceExt;

pub const ACCESS_KEY: &str = "test-access";
pub const SECRET_KEY: &str = "test-secret";
const AMZ_DATE: &str = "20240101T000000Z";
const DATE: &str = "20240101";
const HOST: &str = "localhost:3000";

pub struct TestServer {
    pub dir: TempDir,
    pub state: AppState,
    pub app: Router,
}

impl TestServer {
    pub async fn new() -> Self {
        Self::with_ttl(Duration::from_secs(30 * 60)).await
    }

    pub async fn with_ttl(ttl: Duration) -> Self {
        Self::build(ttl, false).await
    }

    pub async fn overwriting() -> Self {
        Self::build(Duration::from_secs(30 * 60), true).await
    }

    async fn build(ttl: Duration, overwrite_metadata: bool) -> Self {
        let dir = tempdir().unwrap();
        let config = AppConfig {
            host: "127.0.0.1".into(),
            port: 0,
            storage_dir: dir.path().join("bucket"),
            temp_dir: dir.path().join("tmp"),
            database_url: format!("sqlite://{}", dir.path().join("index.sqlite3").display()),
            access_key: ACCESS_KEY.into(),
            secret_key: SECRET_KEY.into(),
            max_upload_size: 1024 * 1024,
            multipart_ttl: ttl,
            overwrite_metadata,
        };
        let index = MetadataIndex::connect(&config.database_url).await.unwrap();
        index.migrate().await.unwrap();
        let state = AppState::new(config, index);
        let app = routes::app(state.clone());
        Self { dir, state, app }
    }

    pub fn storage_path(&self, rel: &str) -> PathBuf {
        self.dir.path().join("bucket").join(rel)
    }

    pub async fn send(&self, req: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(req).await.unwrap()
    }

    pub async fn signed(&self, method: Method, uri: &str, body: &[u8]) -> Response<Body> {
        self.send(signed_request(method, uri, body, &[], SECRET_KEY))
            .await
    }

    pub async fn signed_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: &[u8],
        headers: &[(&str, &str)],
    ) -> Response<Body> {
        self.send(signed_request(method, uri, body, headers, SECRET_KEY))
            .await
    }

    pub async fn unsigned(&self, method: Method, uri: &str) -> Response<Body> {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send(req).await
    }
}

/// Build a SigV4-signed request the way S3 SDKs do.
pub fn signed_request(
    method: Method,
    uri: &str,
    body: &[u8],
    extra_headers: &[(&str, &str)],
    secret_key: &str,
) -> Request<Body> {
    let payload_hash = hex::encode(Sha256::digest(body));
    let (path, query) = uri.split_once('?').unwrap_or((uri, ""));

    let mut signed: Vec<(String, String)> = vec![
        ("host".into(), HOST.into()),
        ("x-amz-content-sha256".into(), payload_hash.clone()),
        ("x-amz-date".into(), AMZ_DATE.into()),
    ];
    for (name, value) in extra_headers {
        signed.push((name.to_ascii_lowercase(), value.to_string()));
    }
    signed.sort();

    let pairs: Vec<(&str, &str)> = signed
        .iter()
        .map(|(n, v)| (n.as_str(), v.as_str()))
        .collect();
    let canonical = canonical_request(method.as_str(), path, query, &pairs, &payload_hash);
    let scope = format!("{DATE}/us-east-1/s3/aws4_request");
    let to_sign = string_to_sign(AMZ_DATE, &scope, &canonical);
    let key = derive_signing_key(secret_key, DATE, "us-east-1", "s3");
    let signature = compute_signature(&key, &to_sign);
    let signed_names = pairs.iter().map(|(n, _)| *n).collect::<Vec<_>>().join(";");

    let mut builder = Request::builder().method(method).uri(uri).header(
        "authorization",
        format!(
            "AWS4-HMAC-SHA256 Credential={ACCESS_KEY}/{scope}, SignedHeaders={signed_names}, Signature={signature}"
        ),
    );
    for (name, value) in &signed {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(Body::from(body.to_vec())).unwrap()
}

pub async fn body_bytes(resp: Response<Body>) -> Vec<u8> {
    resp.into_body().collect().await.unwrap().to_bytes().to_vec()
}

pub async fn body_string(resp: Response<Body>) -> String {
    String::from_utf8(body_bytes(resp).await).unwrap()
}

/// Pull `<Tag>value</Tag>` out of a small XML document.
pub fn xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].to_string())
}
