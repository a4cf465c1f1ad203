//! In-process S3 emulator for integration tests.
//!
//! Serves path-style HEAD/GET/PUT/DELETE over an in-memory map. Every
//! request must carry a SigV4 signature that the emulator recomputes from the
//! method, raw path and signed headers it actually received, and PUT bodies
//! must match their payload hash.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use unistore_backend::{Credentials, S3Options, S3Storage};

pub const BUCKET: &str = "test-bucket";
pub const ACCESS_KEY_ID: &str = "test-key";
pub const SECRET_ACCESS_KEY: &str = "test-secret";

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: Option<String>,
    pub headers: HeaderMap,
}

#[derive(Clone, Default)]
pub struct MockS3 {
    objects: Arc<Mutex<HashMap<String, StoredObject>>>,
}

impl MockS3 {
    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&format!("{}/{}", BUCKET, key))
            .cloned()
    }
}

fn error_xml(status: StatusCode, code: &str, message: &str) -> Response {
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <Error><Code>{}</Code><Message>{}</Message></Error>",
        code, message
    );
    (status, [(header::CONTENT_TYPE, "application/xml")], body).into_response()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Recompute the signature a client holding `SECRET_ACCESS_KEY` would send
/// for this request. `None` when the Authorization header is malformed, is
/// for another key, or names a header that was not received.
fn expected_signature(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
) -> Option<(String, String)> {
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let fields = auth.strip_prefix("AWS4-HMAC-SHA256 ")?;
    let mut credential = None;
    let mut signed_headers = None;
    let mut signature = None;
    for field in fields.split(',') {
        match field.trim().split_once('=')? {
            ("Credential", v) => credential = Some(v),
            ("SignedHeaders", v) => signed_headers = Some(v),
            ("Signature", v) => signature = Some(v),
            _ => {}
        }
    }
    let (key_id, scope) = credential?.split_once('/')?;
    if key_id != ACCESS_KEY_ID {
        return None;
    }
    let mut scope_parts = scope.split('/');
    let date = scope_parts.next()?;
    let region = scope_parts.next()?;
    let signed_headers = signed_headers?;

    let mut canonical_headers = String::new();
    for name in signed_headers.split(';') {
        let value = headers.get(name)?.to_str().ok()?;
        canonical_headers.push_str(&format!("{}:{}\n", name, value.trim()));
    }
    let payload_hash = headers.get("x-amz-content-sha256")?.to_str().ok()?;
    let date_time = headers.get("x-amz-date")?.to_str().ok()?;

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        uri.path(),
        uri.query().unwrap_or(""),
        canonical_headers,
        signed_headers,
        payload_hash
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        date_time,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac_sha256(format!("AWS4{}", SECRET_ACCESS_KEY).as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    let expected = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));
    Some((expected, signature?.to_string()))
}

/// Reject requests whose signature does not verify, and keys under `forbidden/`.
fn check_access(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    key: &str,
) -> Option<Response> {
    match expected_signature(method, uri, headers) {
        Some((expected, claimed)) if expected == claimed => {}
        _ => {
            return Some(error_xml(
                StatusCode::FORBIDDEN,
                "SignatureDoesNotMatch",
                "The request signature we calculated does not match the signature you provided.",
            ))
        }
    }
    if key.starts_with("forbidden/") {
        return Some(error_xml(StatusCode::FORBIDDEN, "AccessDenied", "Access Denied"));
    }
    None
}

async fn get_object(
    State(state): State<MockS3>,
    Path((bucket, key)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let key = key.trim_start_matches('/').to_string();
    if let Some(denied) = check_access(&method, &uri, &headers, &key) {
        return denied;
    }
    let object = state
        .objects
        .lock()
        .unwrap()
        .get(&format!("{}/{}", bucket, key))
        .cloned();
    match object {
        Some(obj) => {
            let content_type = obj
                .content_type
                .unwrap_or_else(|| "application/octet-stream".to_string());
            ([(header::CONTENT_TYPE, content_type)], obj.data).into_response()
        }
        None => error_xml(
            StatusCode::NOT_FOUND,
            "NoSuchKey",
            "The specified key does not exist.",
        ),
    }
}

async fn put_object(
    State(state): State<MockS3>,
    Path((bucket, key)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let key = key.trim_start_matches('/').to_string();
    if let Some(denied) = check_access(&method, &uri, &headers, &key) {
        return denied;
    }
    let digest = hex::encode(Sha256::digest(&body));
    let claimed = headers
        .get("x-amz-content-sha256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if claimed != digest {
        return error_xml(
            StatusCode::BAD_REQUEST,
            "XAmzContentSHA256Mismatch",
            "The provided 'x-amz-content-sha256' header does not match what was computed.",
        );
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    state.objects.lock().unwrap().insert(
        format!("{}/{}", bucket, key),
        StoredObject {
            data: body,
            content_type,
            headers: headers.clone(),
        },
    );
    let etag = format!("\"{}\"", &digest[..32]);
    (StatusCode::OK, [(header::ETAG, etag)]).into_response()
}

async fn delete_object(
    State(state): State<MockS3>,
    Path((bucket, key)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let key = key.trim_start_matches('/').to_string();
    if let Some(denied) = check_access(&method, &uri, &headers, &key) {
        return denied;
    }
    let removed = state
        .objects
        .lock()
        .unwrap()
        .remove(&format!("{}/{}", bucket, key));
    match removed {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        // AWS answers 204 here; some compatible stores answer 404.
        None => error_xml(
            StatusCode::NOT_FOUND,
            "NoSuchKey",
            "The specified key does not exist.",
        ),
    }
}

/// Start the emulator on an ephemeral port. Returns its base URL.
pub async fn spawn_mock_s3() -> (String, MockS3) {
    let state = MockS3::default();
    let app = Router::new()
        .route(
            "/{bucket}/{*key}",
            get(get_object).put(put_object).delete(delete_object),
        )
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), state)
}

pub async fn mock_storage() -> (S3Storage, MockS3) {
    let (endpoint, state) = spawn_mock_s3().await;
    let storage = S3Storage::new(
        BUCKET,
        S3Options::default()
            .with_region("us-east-1")
            .with_endpoint(endpoint)
            .with_credentials(Credentials::new(ACCESS_KEY_ID, SECRET_ACCESS_KEY)),
    )
    .unwrap();
    (storage, state)
}
