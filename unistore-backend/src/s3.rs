//! S3-compatible object store backend.
//!
//! Handles AWS S3 and S3-compatible APIs (MinIO, Backblaze B2, ...). Uses
//! reqwest with manual AWS Signature V4 signing so no SDK dependency is
//! needed. Requests go path-style to the configured endpoint; the locations
//! handed back to callers are virtual-hosted AWS URLs.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderValue, AUTHORIZATION, ETAG};
use reqwest::{Client, Method, Response};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use unistore_common::{
    validate_key, Content, ObjectStream, PutOptions, PutReceipt, StorageBackend, StorageError,
    StorageResult,
};

type HmacSha256 = Hmac<Sha256>;

/// Region whose virtual-hosted hostname carries no region segment.
pub const DEFAULT_REGION: &str = "us-east-1";
const MAX_KEY_LEN: usize = 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 300;

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Read the standard `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` /
    /// `AWS_SESSION_TOKEN` variables.
    pub fn from_env() -> Option<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
        if access_key_id.is_empty() || secret_access_key.is_empty() {
            return None;
        }
        Some(Self {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok().filter(|t| !t.is_empty()),
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Client options for [`S3Storage`]. Anything left unset falls back to the
/// usual AWS environment variables.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3Options {
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible APIs, e.g. `http://localhost:9000`.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl S3Options {
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    /// `scheme://host[:port]`
    origin: String,
    /// `host[:port]`, as sent in the Host header.
    host: String,
    /// Path prefix below the origin, no trailing slash.
    base_path: String,
}

impl Endpoint {
    fn parse(url: &str) -> StorageResult<Self> {
        let url = url.trim_end_matches('/');
        let (scheme, rest) = url
            .split_once("://")
            .filter(|(scheme, _)| *scheme == "http" || *scheme == "https")
            .ok_or_else(|| {
                StorageError::Validation(format!("endpoint must be an http(s) URL: {}", url))
            })?;
        let (host, base_path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        if host.is_empty() {
            return Err(StorageError::Validation(format!("endpoint has no host: {}", url)));
        }
        Ok(Self {
            origin: format!("{}://{}", scheme, host),
            host: host.to_string(),
            base_path: base_path.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct S3Storage {
    bucket: String,
    region: String,
    endpoint: Endpoint,
    credentials: Option<Credentials>,
    client: Client,
}

impl S3Storage {
    /// Bind to `bucket`. Without credentials in `options` or the environment,
    /// requests are sent unsigned, which only works for public buckets.
    pub fn new(bucket: impl Into<String>, options: S3Options) -> StorageResult<Self> {
        let bucket = bucket.into();
        if bucket.is_empty() {
            return Err(StorageError::Validation("bucket must not be empty".to_string()));
        }

        let region = options
            .region
            .filter(|r| !r.is_empty())
            .or_else(|| std::env::var("AWS_REGION").ok().filter(|r| !r.is_empty()))
            .or_else(|| std::env::var("AWS_DEFAULT_REGION").ok().filter(|r| !r.is_empty()))
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let endpoint = match options.endpoint {
            Some(ep) => Endpoint::parse(&ep)?,
            None => Endpoint::parse(&format!("https://s3.{}.amazonaws.com", region))?,
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(
                options.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ))
            .build()
            .map_err(StorageError::transport)?;

        Ok(Self {
            bucket,
            region,
            endpoint,
            credentials: options.credentials.or_else(Credentials::from_env),
            client,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn object_path(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint.base_path,
            urlencoding::encode(&self.bucket),
            encode_key(key)
        )
    }

    /// Build, sign and send one request for `key`.
    async fn send(
        &self,
        method: Method,
        key: &str,
        mut headers: BTreeMap<String, String>,
        body: Bytes,
    ) -> StorageResult<Response> {
        let now = Utc::now();
        let date_time = now.format("%Y%m%dT%H%M%SZ").to_string();
        let path = self.object_path(key);
        let payload_hash = body_hash(&body);

        headers.insert("host".to_string(), self.endpoint.host.clone());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.clone());
        headers.insert("x-amz-date".to_string(), date_time.clone());
        if let Some(token) = self.credentials.as_ref().and_then(|c| c.session_token.as_ref()) {
            headers.insert("x-amz-security-token".to_string(), token.clone());
        }

        let url = format!("{}{}", self.endpoint.origin, path);
        let mut req = self.client.request(method.clone(), &url);
        if let Some(credentials) = &self.credentials {
            let auth = authorization(
                credentials,
                &self.region,
                method.as_str(),
                &path,
                "",
                &headers,
                &payload_hash,
                &date_time,
            );
            req = req.header(AUTHORIZATION, auth);
        }
        for (name, value) in &headers {
            // reqwest derives Host from the URL.
            if name != "host" {
                req = req.header(name.as_str(), value.as_str());
            }
        }
        if method == Method::PUT {
            req = req.body(body);
        }

        req.send().await.map_err(StorageError::transport)
    }

    fn check_key(key: &str) -> StorageResult<()> {
        validate_key(key)?;
        if key.len() > MAX_KEY_LEN {
            return Err(StorageError::Validation(format!(
                "key is {} bytes, the limit is {}",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        // URL parsing collapses dot segments, percent-encoded or not, so the
        // request would address a different key than the one signed.
        if key.split('/').any(|segment| segment == "." || segment == "..") {
            return Err(StorageError::Validation(format!(
                "key has a '.' or '..' segment: {:?}",
                key
            )));
        }
        Ok(())
    }

    fn upload_headers(
        &self,
        key: &str,
        options: &PutOptions,
    ) -> StorageResult<BTreeMap<String, String>> {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), content_type_for(key, options));
        if let Some(v) = &options.cache_control {
            headers.insert("cache-control".to_string(), v.clone());
        }
        if let Some(v) = &options.content_disposition {
            headers.insert("content-disposition".to_string(), v.clone());
        }
        if let Some(v) = &options.content_encoding {
            headers.insert("content-encoding".to_string(), v.clone());
        }
        if let Some(v) = &options.storage_class {
            headers.insert("x-amz-storage-class".to_string(), v.clone());
        }
        for (name, value) in &options.metadata {
            headers.insert(format!("x-amz-meta-{}", name.to_ascii_lowercase()), value.clone());
        }

        for (name, value) in &headers {
            if reqwest::header::HeaderName::from_bytes(name.as_bytes()).is_err()
                || HeaderValue::from_str(value).is_err()
            {
                return Err(StorageError::Validation(format!(
                    "invalid header for upload: {}: {:?}",
                    name, value
                )));
            }
        }
        Ok(headers)
    }
}

/// Content type for an upload: the caller's override, else a guess from the
/// key's extension, else `application/octet-stream`.
pub fn content_type_for(key: &str, options: &PutOptions) -> String {
    options
        .content_type
        .clone()
        .unwrap_or_else(|| mime_guess::from_path(key).first_or_octet_stream().to_string())
}

/// Virtual-hosted URL of `key`. `us-east-1` uses the region-free hostname.
pub fn virtual_hosted_url(bucket: &str, region: &str, key: &str) -> String {
    if region == DEFAULT_REGION {
        format!("https://{}.s3.amazonaws.com/{}", bucket, key)
    } else {
        format!("https://{}.s3-{}.amazonaws.com/{}", bucket, region, key)
    }
}

/// URI-encode each path segment of a key, keeping the separators.
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Compute the AWS Signature V4 `Authorization` header value.
///
/// `headers` must hold every header being signed, names lowercased;
/// `canonical_uri` is the already-encoded request path.
#[allow(clippy::too_many_arguments)]
fn authorization(
    credentials: &Credentials,
    region: &str,
    method: &str,
    canonical_uri: &str,
    query: &str,
    headers: &BTreeMap<String, String>,
    payload_hash: &str,
    date_time: &str,
) -> String {
    let date = &date_time[..8];

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();
    let signed_headers: String = headers.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, canonical_uri, query, canonical_headers, signed_headers, payload_hash
    );

    let cr_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    let credential_scope = format!("{}/{}/s3/aws4_request", date, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        date_time, credential_scope, cr_hash
    );

    let signing_key = derive_signing_key(&credentials.secret_access_key, date, region);
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
        credentials.access_key_id, credential_scope, signed_headers, signature
    )
}

fn derive_signing_key(secret: &str, date: &str, region: &str) -> Vec<u8> {
    let key = format!("AWS4{}", secret);
    let k_date = hmac_sha256(key.as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key length ok");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn body_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Extract `<tag>…</tag>` from an S3 XML error document.
fn xml_field(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].to_string())
}

/// Turn a non-success response into an error. 404 is `NotFound` on every
/// operation; callers that tolerate absence check for it first.
async fn response_error(key: &str, resp: Response) -> StorageError {
    let status = resp.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return StorageError::NotFound(key.to_string());
    }
    let body = resp.text().await.unwrap_or_default();
    let reason = status.canonical_reason().unwrap_or("Unknown");
    StorageError::Remote {
        status: status.as_u16(),
        code: xml_field(&body, "Code").unwrap_or_else(|| reason.to_string()),
        message: xml_field(&body, "Message").unwrap_or_else(|| body.trim().to_string()),
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        Self::check_key(key)?;
        let resp = self.send(Method::GET, key, BTreeMap::new(), Bytes::new()).await?;
        if !resp.status().is_success() {
            return Err(response_error(key, resp).await);
        }
        resp.bytes().await.map_err(StorageError::transport)
    }

    fn get_stream(&self, key: &str) -> ObjectStream {
        let this = self.clone();
        let key = key.to_string();
        stream::once(async move {
            Self::check_key(&key)?;
            let resp = this.send(Method::GET, &key, BTreeMap::new(), Bytes::new()).await?;
            if !resp.status().is_success() {
                return Err(response_error(&key, resp).await);
            }
            Ok::<_, StorageError>(resp.bytes_stream().map_err(StorageError::transport))
        })
        .try_flatten()
        .boxed()
    }

    async fn put(
        &self,
        key: &str,
        content: Content,
        options: &PutOptions,
    ) -> StorageResult<PutReceipt> {
        Self::check_key(key)?;
        let headers = self.upload_headers(key, options)?;

        // Single PUT: the payload must be hashed before signing, so streamed
        // shapes are drained in arrival order first.
        let kind = content.kind();
        let body = content.into_bytes().await.map_err(StorageError::Io)?;
        let size = body.len() as u64;

        let resp = self.send(Method::PUT, key, headers, body).await?;
        if !resp.status().is_success() {
            return Err(response_error(key, resp).await);
        }

        let etag = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());

        debug!(bucket = %self.bucket, key = %key, content = kind, size, "S3 upload complete");
        Ok(PutReceipt {
            key: key.to_string(),
            location: self.get_location(key),
            etag,
            size,
        })
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        Self::check_key(key)?;
        let resp = self.send(Method::DELETE, key, BTreeMap::new(), Bytes::new()).await?;
        // Some S3-compatible stores answer 404 for an absent key; deleting
        // nothing is still success.
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(response_error(key, resp).await);
        }
        debug!(bucket = %self.bucket, key = %key, "S3 delete complete");
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Self::check_key(key)?;
        let resp = self.send(Method::HEAD, key, BTreeMap::new(), Bytes::new()).await?;
        if resp.status().is_success() {
            return Ok(true);
        }
        match response_error(key, resp).await {
            StorageError::NotFound(_) => Ok(false),
            other => Err(other),
        }
    }

    fn get_location(&self, key: &str) -> String {
        virtual_hosted_url(&self.bucket, &self.region, key)
    }
}
