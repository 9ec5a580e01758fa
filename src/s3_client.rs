//! S3 Client Module
//!
//! Provides the [`ObjectStore`] implementation backed by a real S3 (or
//! S3-compatible) endpoint: a pooled hyper client over [`S3Connector`],
//! SigV4-signed when credentials are configured, bound to one bucket.
//!
//! Every outcome is classified for the backend access controller:
//!
//! - transport failures and timeouts are `Unreachable`
//! - HTTP 404 is `NotFound`
//! - any other non-2xx status is `Rejected`, with the S3 error code and message

use crate::backend::{BackendError, BackendResult, ObjectStore};
use crate::config::BackendConfig;
use crate::https_connector::{native_tls_config, S3Connector};
use crate::sigv4::{self, CanonicalRequest, Signer, EMPTY_PAYLOAD_SHA256};
use crate::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{HeaderMap, Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How object URLs are formed
#[derive(Debug, Clone, PartialEq, Eq)]
struct Addressing {
    scheme: String,
    /// Host (and port) the bucket is reached through
    authority: String,
    /// Path prefix before the key, always starting and never ending with `/`
    /// unless it is exactly `/`
    prefix: String,
}

impl Addressing {
    fn resolve(config: &BackendConfig) -> Result<Self> {
        match &config.endpoint {
            Some(endpoint) => {
                let uri: Uri = endpoint.parse().map_err(|e| {
                    ProxyError::ConfigError(format!("Invalid endpoint '{}': {}", endpoint, e))
                })?;
                let scheme = uri.scheme_str().unwrap_or("https").to_string();
                let authority = uri
                    .authority()
                    .map(|a| a.to_string())
                    .ok_or_else(|| {
                        ProxyError::ConfigError(format!("Endpoint has no host: {}", endpoint))
                    })?;
                // Custom endpoints are always addressed path-style.
                let base = uri.path().trim_end_matches('/');
                Ok(Self {
                    scheme,
                    authority,
                    prefix: format!("{}/{}/", base, sigv4::uri_encode(&config.bucket, true)),
                })
            }
            None if config.force_path_style => Ok(Self {
                scheme: "https".to_string(),
                authority: format!("s3.{}.amazonaws.com", config.region),
                prefix: format!("/{}/", sigv4::uri_encode(&config.bucket, true)),
            }),
            None => Ok(Self {
                scheme: "https".to_string(),
                authority: format!("{}.s3.{}.amazonaws.com", config.bucket, config.region),
                prefix: "/".to_string(),
            }),
        }
    }

    /// Encoded request path for `key`
    fn path(&self, key: &str) -> String {
        format!("{}{}", self.prefix, sigv4::uri_encode(key, false))
    }

    fn uri(&self, path: &str) -> Result<Uri> {
        format!("{}://{}{}", self.scheme, self.authority, path)
            .parse()
            .map_err(|e| ProxyError::HttpError(format!("Invalid object URI: {}", e)))
    }

    fn needs_tls(&self) -> bool {
        self.scheme == "https"
    }
}

/// Buffered backend response
struct S3Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// S3 client bound to one bucket
pub struct S3Client {
    client: Client<S3Connector, Full<Bytes>>,
    bucket: String,
    addressing: Addressing,
    signer: Option<Signer>,
    request_timeout: Duration,
}

impl S3Client {
    /// Create a client for the configured bucket
    ///
    /// Native root certificates are only loaded when the endpoint uses TLS.
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let addressing = Addressing::resolve(config)?;
        let tls_config = if addressing.needs_tls() {
            Some(native_tls_config()?)
        } else {
            None
        };
        let connector = S3Connector::new(tls_config, config.request_timeout);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        let signer = config
            .credentials()
            .map(|credentials| Signer::new(credentials, &config.region));
        if signer.is_none() {
            warn!("No AWS credentials configured, sending unsigned requests");
        }

        debug!(
            "Created S3 client: bucket={}, endpoint={}://{}, signed={}",
            config.bucket,
            addressing.scheme,
            addressing.authority,
            signer.is_some()
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            addressing,
            signer,
            request_timeout: config.request_timeout,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// URI an object request for `key` is sent to
    pub fn object_uri(&self, key: &str) -> Result<Uri> {
        self.addressing.uri(&self.addressing.path(key))
    }

    async fn send(&self, method: Method, key: &str, body: Bytes) -> BackendResult<S3Response> {
        let start_time = Instant::now();
        let request = self
            .build_request(&method, key, body)
            .map_err(|e| BackendError::Rejected {
                status: StatusCode::BAD_REQUEST.as_u16(),
                code: "InvalidRequest".to_string(),
                message: e.to_string(),
            })?;

        let response = tokio::time::timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| {
                BackendError::Unreachable(format!(
                    "{} {} timed out after {:?}",
                    method, key, self.request_timeout
                ))
            })?
            .map_err(|e| BackendError::Unreachable(format!("{} {} failed: {}", method, key, e)))?;

        let (parts, body) = response.into_parts();
        let body = tokio::time::timeout(self.request_timeout, body.collect())
            .await
            .map_err(|_| {
                BackendError::Unreachable(format!("{} {} body timed out", method, key))
            })?
            .map_err(|e| {
                BackendError::Unreachable(format!("Failed to read response body: {}", e))
            })?
            .to_bytes();

        debug!(
            "S3 {} {} -> {} ({} bytes, {:?})",
            method,
            key,
            parts.status,
            body.len(),
            start_time.elapsed()
        );

        Ok(S3Response {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }

    fn build_request(&self, method: &Method, key: &str, body: Bytes) -> Result<Request<Full<Bytes>>> {
        let path = self.addressing.path(key);
        let uri = self.addressing.uri(&path)?;

        let payload_hash = if body.is_empty() {
            EMPTY_PAYLOAD_SHA256.to_string()
        } else {
            sigv4::sha256_hex(&body)
        };

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header("host", self.addressing.authority.as_str());

        if let Some(signer) = &self.signer {
            let now = Utc::now();
            let mut signed = vec![
                ("host".to_string(), self.addressing.authority.clone()),
                ("x-amz-content-sha256".to_string(), payload_hash.clone()),
                ("x-amz-date".to_string(), sigv4::format_amz_date(now)),
            ];
            if let Some(token) = &signer.credentials().session_token {
                signed.push(("x-amz-security-token".to_string(), token.clone()));
            }

            let authorization = signer.authorization(
                &CanonicalRequest {
                    method: method.as_str(),
                    path: &path,
                    query: "",
                    headers: &signed,
                    payload_hash: &payload_hash,
                },
                now,
            );

            for (name, value) in signed.iter().skip(1) {
                builder = builder.header(name.as_str(), value.as_str());
            }
            builder = builder.header("authorization", authorization);
        }

        if *method == Method::PUT {
            builder = builder.header(CONTENT_TYPE, "application/octet-stream");
        }

        Ok(builder.body(Full::new(body))?)
    }
}

/// Classify a non-2xx response
fn classify_failure(status: StatusCode, body: &[u8], key: &str) -> BackendError {
    if status == StatusCode::NOT_FOUND {
        return BackendError::NotFound(key.to_string());
    }

    let text = String::from_utf8_lossy(body);
    let code = xml_element(&text, "Code")
        .map(str::to_string)
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("UnknownError")
                .replace(' ', "")
        });
    let message = xml_element(&text, "Message")
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {} from backend", status.as_u16()));

    BackendError::Rejected {
        status: status.as_u16(),
        code,
        message,
    }
}

/// Text content of the first `<name>` element
fn xml_element<'a>(body: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    let start = body.find(&open)? + open.len();
    let end = start + body[start..].find(&close)?;
    Some(body[start..end].trim())
}

fn ensure_success(response: &S3Response, key: &str) -> BackendResult<()> {
    if response.status.is_success() {
        Ok(())
    } else {
        Err(classify_failure(response.status, &response.body, key))
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn get_object(&self, key: &str) -> BackendResult<Bytes> {
        let response = self.send(Method::GET, key, Bytes::new()).await?;
        ensure_success(&response, key)?;
        Ok(response.body)
    }

    async fn head_object(&self, key: &str) -> BackendResult<u64> {
        let response = self.send(Method::HEAD, key, Bytes::new()).await?;
        ensure_success(&response, key)?;
        Ok(response
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|value: &HeaderValue| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    async fn put_object(&self, key: &str, data: Bytes) -> BackendResult<()> {
        let response = self.send(Method::PUT, key, data).await?;
        ensure_success(&response, key)
    }

    async fn delete_object(&self, key: &str) -> BackendResult<()> {
        let response = self.send(Method::DELETE, key, Bytes::new()).await?;
        ensure_success(&response, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_config(endpoint: Option<&str>, path_style: bool) -> BackendConfig {
        BackendConfig {
            bucket: "build-cache".to_string(),
            region: "eu-west-1".to_string(),
            endpoint: endpoint.map(str::to_string),
            force_path_style: path_style,
            ..BackendConfig::default()
        }
    }

    #[test]
    fn test_virtual_hosted_addressing() {
        let addressing = Addressing::resolve(&backend_config(None, false)).unwrap();
        assert_eq!(addressing.authority, "build-cache.s3.eu-west-1.amazonaws.com");
        assert_eq!(addressing.path("ac/abc"), "/ac/abc");
        assert!(addressing.needs_tls());
    }

    #[test]
    fn test_path_style_addressing() {
        let addressing = Addressing::resolve(&backend_config(None, true)).unwrap();
        assert_eq!(addressing.authority, "s3.eu-west-1.amazonaws.com");
        assert_eq!(addressing.path("cas/1"), "/build-cache/cas/1");
    }

    #[test]
    fn test_custom_endpoint_is_path_style() {
        let addressing =
            Addressing::resolve(&backend_config(Some("http://localhost:9000/"), false)).unwrap();
        assert_eq!(addressing.scheme, "http");
        assert_eq!(addressing.authority, "localhost:9000");
        assert_eq!(addressing.path("ac/x y"), "/build-cache/ac/x%20y");
        assert!(!addressing.needs_tls());
        assert_eq!(
            addressing.uri(&addressing.path("ac/1")).unwrap().to_string(),
            "http://localhost:9000/build-cache/ac/1"
        );
    }

    #[test]
    fn test_custom_endpoint_with_base_path() {
        let addressing =
            Addressing::resolve(&backend_config(Some("http://proxy.local/s3"), false)).unwrap();
        assert_eq!(addressing.path("k"), "/s3/build-cache/k");
    }

    #[test]
    fn test_classify_not_found() {
        assert_eq!(
            classify_failure(StatusCode::NOT_FOUND, b"", "ac/1"),
            BackendError::NotFound("ac/1".to_string())
        );
    }

    #[test]
    fn test_classify_rejection_from_xml() {
        let body = br#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>AccessDenied</Code><Message>Access Denied</Message><RequestId>1</RequestId></Error>"#;
        assert_eq!(
            classify_failure(StatusCode::FORBIDDEN, body, "ac/1"),
            BackendError::Rejected {
                status: 403,
                code: "AccessDenied".to_string(),
                message: "Access Denied".to_string(),
            }
        );
    }

    #[test]
    fn test_classify_rejection_without_body() {
        match classify_failure(StatusCode::FORBIDDEN, b"", "ac/1") {
            BackendError::Rejected { status, code, .. } => {
                assert_eq!(status, 403);
                assert_eq!(code, "Forbidden");
            }
            other => panic!("Expected Rejected, got {:?}", other),
        }
    }

    #[test]
    fn test_client_for_plain_endpoint() {
        let client = S3Client::new(&backend_config(Some("http://127.0.0.1:9000"), false)).unwrap();
        assert_eq!(client.bucket(), "build-cache");
        assert_eq!(
            client.object_uri("cas/abc").unwrap().to_string(),
            "http://127.0.0.1:9000/build-cache/cas/abc"
        );
    }
}
