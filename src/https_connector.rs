//! Custom Connector for the S3 Client
//!
//! A `tower::Service<Uri>` that hyper's pooled client uses to open connections:
//! plain TCP for `http` endpoints (MinIO and other local S3-compatible stores)
//! and TLS via tokio-rustls for `https` endpoints.

use crate::{ProxyError, Result};
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tower::Service;
use tracing::{debug, warn};

/// Connection to the backend, with or without TLS
pub enum MaybeHttpsStream {
    Plain(TokioIo<TcpStream>),
    Tls(TokioIo<TlsStream<TcpStream>>),
}

impl Read for MaybeHttpsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeHttpsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeHttpsStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl Write for MaybeHttpsStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeHttpsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MaybeHttpsStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeHttpsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MaybeHttpsStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeHttpsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeHttpsStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl Connection for MaybeHttpsStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// TLS client configuration trusting the platform's root certificates
pub fn native_tls_config() -> Result<Arc<rustls::ClientConfig>> {
    let mut root_store = rustls::RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs()
        .map_err(|e| ProxyError::TlsError(format!("Failed to load native certs: {}", e)))?;
    let (added, ignored) = root_store.add_parsable_certificates(certs);
    if ignored > 0 {
        warn!("Ignored {} unparsable native root certificates", ignored);
    }
    debug!("Loaded {} native root certificates", added);

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::TlsError(format!("Failed to configure TLS: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(Arc::new(tls_config))
}

/// Connector used by the S3 client
///
/// Without a TLS configuration only `http` URIs can be connected.
#[derive(Clone)]
pub struct S3Connector {
    tls_connector: Option<TlsConnector>,
    connect_timeout: Duration,
}

impl S3Connector {
    pub fn new(tls_config: Option<Arc<rustls::ClientConfig>>, connect_timeout: Duration) -> Self {
        Self {
            tls_connector: tls_config.map(TlsConnector::from),
            connect_timeout,
        }
    }

    /// Plain TCP only
    pub fn plain(connect_timeout: Duration) -> Self {
        Self::new(None, connect_timeout)
    }

    pub fn supports_tls(&self) -> bool {
        self.tls_connector.is_some()
    }
}

impl Service<Uri> for S3Connector {
    type Response = MaybeHttpsStream;
    type Error = ProxyError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        // Always ready to create new connections
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls_connector = self.tls_connector.clone();
        let connect_timeout = self.connect_timeout;

        Box::pin(async move {
            let host = uri
                .host()
                .ok_or_else(|| ProxyError::ConfigError(format!("No host in URI: {}", uri)))?
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            let is_https = match uri.scheme_str() {
                Some("https") => true,
                Some("http") | None => false,
                Some(other) => {
                    return Err(ProxyError::ConfigError(format!(
                        "Unsupported scheme: {}",
                        other
                    )))
                }
            };
            let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });

            debug!("[S3_CONNECTOR] Connecting to {}:{}", host, port);

            let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect((host.as_str(), port)))
                .await
                .map_err(|_| {
                    ProxyError::TimeoutError(format!(
                        "Connection to {}:{} timed out after {:?}",
                        host, port, connect_timeout
                    ))
                })?
                .map_err(|e| {
                    warn!("[S3_CONNECTOR] TCP connection failed to {}:{}: {}", host, port, e);
                    ProxyError::ConnectionError(format!(
                        "Failed to connect to {}:{}: {}",
                        host, port, e
                    ))
                })?;

            // Set TCP_NODELAY to disable Nagle's algorithm for lower latency
            if let Err(e) = tcp.set_nodelay(true) {
                warn!(
                    "[S3_CONNECTOR] Failed to set TCP_NODELAY for {}:{}: {}",
                    host, port, e
                );
            }

            if !is_https {
                return Ok(MaybeHttpsStream::Plain(TokioIo::new(tcp)));
            }

            let tls_connector = tls_connector.ok_or_else(|| {
                ProxyError::TlsError(format!("TLS is not configured, cannot connect to {}", uri))
            })?;
            let server_name = ServerName::try_from(host.clone()).map_err(|e| {
                ProxyError::TlsError(format!("Invalid server name '{}': {}", host, e))
            })?;

            let tls = tls_connector.connect(server_name, tcp).await.map_err(|e| {
                warn!("[S3_CONNECTOR] TLS handshake failed to {}: {}", host, e);
                ProxyError::TlsError(format!("TLS handshake failed to {}: {}", host, e))
            })?;

            debug!("[S3_CONNECTOR] TLS connection established to {}:{}", host, port);
            Ok(MaybeHttpsStream::Tls(TokioIo::new(tls)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let mut connector = S3Connector::plain(Duration::from_secs(5));
        let uri: Uri = format!("http://{}/", addr).parse().unwrap();
        let stream = connector.call(uri).await.unwrap();

        assert!(matches!(stream, MaybeHttpsStream::Plain(_)));
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_https_without_tls_config_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut connector = S3Connector::plain(Duration::from_secs(5));
        assert!(!connector.supports_tls());
        let uri: Uri = format!("https://{}/", addr).parse().unwrap();

        match connector.call(uri).await {
            Err(ProxyError::TlsError(_)) => {}
            Err(other) => panic!("Expected TLS error, got {:?}", other),
            Ok(_) => panic!("Expected TLS error, got a connection"),
        }
    }

    #[tokio::test]
    async fn test_refused_connection_is_connection_error() {
        // Bind then drop to find a port with nothing listening.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let mut connector = S3Connector::plain(Duration::from_secs(5));
        let uri: Uri = format!("http://{}/", addr).parse().unwrap();

        assert!(matches!(
            connector.call(uri).await,
            Err(ProxyError::ConnectionError(_))
        ));
    }

    #[test]
    fn test_unsupported_scheme() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let mut connector = S3Connector::plain(Duration::from_secs(1));
        let uri: Uri = "ftp://example.com/".parse().unwrap();
        assert!(matches!(
            runtime.block_on(connector.call(uri)),
            Err(ProxyError::ConfigError(_))
        ));
    }
}
