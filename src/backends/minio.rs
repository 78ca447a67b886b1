//! MinIO Object Store Adapter
//!
//! Talks to the S3 API of a MinIO server over plain HTTP requests signed
//! with AWS Signature Version 4. Only the calls the bootstrap needs are
//! implemented: liveness, bucket lookup and bucket creation.

use crate::crd::Credential;
use crate::domain::ports::{BucketOptions, Endpoint, ObjectStore, ObjectStoreConnector};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Region requests are signed for unless a bucket asks for another one
pub const DEFAULT_REGION: &str = "us-east-1";

const LIVENESS_PATH: &str = "/minio/health/live";
const OBJECT_LOCK_HEADER: &str = "x-amz-bucket-object-lock-enabled";

// =============================================================================
// Signature V4
// =============================================================================

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 (RFC 2104)
pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Internal(format!("HMAC key rejected: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Key derived from the secret for one day, region and service
pub(crate) fn signing_key(
    secret: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<[u8; 32]> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// One request to be signed
struct SignedRequest<'a> {
    method: &'a Method,
    path: &'a str,
    host: &'a str,
    /// Extra headers, already lowercase
    headers: Vec<(&'a str, String)>,
    payload: &'a [u8],
    region: &'a str,
}

impl SignedRequest<'_> {
    /// Headers to send, `authorization` included
    fn sign(&self, credential: &Credential, now: DateTime<Utc>) -> Result<Vec<(String, String)>> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let payload_hash = sha256_hex(self.payload);

        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), self.host.to_string()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        headers.extend(
            self.headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.trim().to_string())),
        );
        headers.sort();

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            self.method.as_str(),
            self.path,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = format!("{}/{}/s3/aws4_request", date, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let key = signing_key(&credential.secret_key, &date, self.region, "s3")?;
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

        headers.push((
            "authorization".to_string(),
            format!(
                "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
                credential.access_key, scope, signed_headers, signature
            ),
        ));
        Ok(headers)
    }
}

// =============================================================================
// Bucket Names
// =============================================================================

/// S3 bucket naming rules
pub fn is_valid_bucket_name(name: &str) -> bool {
    if name.len() < 3 || name.len() > 63 {
        return false;
    }

    let edge_ok = |c: Option<char>| c.map(|c| c.is_ascii_lowercase() || c.is_ascii_digit()).unwrap_or(false);
    if !edge_ok(name.chars().next()) || !edge_ok(name.chars().last()) {
        return false;
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return false;
    }

    if name.contains("..") {
        return false;
    }

    // Cannot look like an IP address
    !(name.split('.').count() == 4 && name.split('.').all(|p| p.parse::<u8>().is_ok()))
}

fn location_body(region: &str) -> Vec<u8> {
    if region.is_empty() || region == DEFAULT_REGION {
        return Vec::new();
    }
    format!(
        "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
         <LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
        region
    )
    .into_bytes()
}

// =============================================================================
// MinIO Client
// =============================================================================

/// S3 client for one MinIO server
pub struct MinioClient {
    http: reqwest::Client,
    endpoint: Endpoint,
    credential: Credential,
    region: String,
}

impl MinioClient {
    pub fn new(http: reqwest::Client, endpoint: Endpoint, credential: Credential, region: String) -> Self {
        Self {
            http,
            endpoint,
            credential,
            region,
        }
    }

    fn host_header(&self) -> String {
        match (self.endpoint.secure, self.endpoint.port) {
            (false, 80) | (true, 443) => self.endpoint.host.clone(),
            _ => self.endpoint.to_string(),
        }
    }

    fn store_error(&self, operation: &str, reason: impl ToString) -> Error {
        Error::ObjectStore {
            endpoint: self.endpoint.to_string(),
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        headers: Vec<(&str, String)>,
        payload: Vec<u8>,
        region: &str,
    ) -> Result<reqwest::Response> {
        let host = self.host_header();
        let signed = SignedRequest {
            method: &method,
            path,
            host: &host,
            headers,
            payload: &payload,
            region,
        }
        .sign(&self.credential, Utc::now())?;

        let mut request = self
            .http
            .request(method.clone(), format!("{}{}", self.endpoint.url(), path));
        for (name, value) in signed {
            request = request.header(name, value);
        }
        if !payload.is_empty() {
            request = request.body(payload);
        }
        Ok(request.send().await?)
    }
}

#[async_trait]
impl ObjectStore for MinioClient {
    async fn is_online(&self) -> bool {
        let url = format!("{}{}", self.endpoint.url(), LIVENESS_PATH);
        match self.http.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(endpoint = %self.endpoint, error = %e, "Liveness check failed");
                false
            }
        }
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let resp = self
            .send(Method::HEAD, &format!("/{}", bucket), Vec::new(), Vec::new(), &self.region)
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(self.store_error("bucket_exists", status)),
        }
    }

    async fn make_bucket(&self, bucket: &str, options: &BucketOptions) -> Result<()> {
        if !is_valid_bucket_name(bucket) {
            return Err(self.store_error("make_bucket", format!("invalid bucket name {:?}", bucket)));
        }

        let mut headers = Vec::new();
        if options.object_locking {
            headers.push((OBJECT_LOCK_HEADER, "true".to_string()));
        }
        let region = if options.region.is_empty() {
            self.region.as_str()
        } else {
            options.region.as_str()
        };

        let resp = self
            .send(Method::PUT, &format!("/{}", bucket), headers, location_body(region), region)
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::CONFLICT && body.contains("BucketAlreadyOwnedByYou") {
            return Ok(());
        }
        Err(self.store_error("make_bucket", format!("{}: {}", status, body.trim())))
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Builds [`MinioClient`]s sharing one HTTP connection pool
pub struct MinioConnector {
    http: reqwest::Client,
    region: String,
}

impl MinioConnector {
    pub fn new(region: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            region: region.into(),
        })
    }
}

impl ObjectStoreConnector for MinioConnector {
    fn connect(&self, endpoint: &Endpoint, credential: &Credential) -> Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(MinioClient::new(
            self.http.clone(),
            endpoint.clone(),
            credential.clone(),
            self.region.clone(),
        )))
    }
}
