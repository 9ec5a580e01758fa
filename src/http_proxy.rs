//! HTTP Proxy Module
//!
//! Accepts build-cache protocol requests (`GET`, `HEAD`, `PUT`, `DELETE`),
//! serves them from the RAM cache where possible, routes everything else
//! through the backend access controller, and hands uploads to the upload
//! pipeline. Also owns the accept loop and the shutdown sequence.
//!
//! # Routes
//!
//! | Request          | Behaviour                                                  |
//! |------------------|------------------------------------------------------------|
//! | `GET /ping`      | `200 pong`, no cache or backend access                     |
//! | `GET /shutdown`  | `200`, then starts shutdown                                |
//! | `GET/HEAD <key>` | cache hit, else 404 while paused, else read from backend   |
//! | `PUT <key>`      | upload pipeline; `PUT /` is forbidden                      |
//! | `DELETE <key>`   | drop from cache, then best-effort backend delete           |
//! | anything else    | `405`                                                      |

use crate::backend::{BackendError, ObjectStore};
use crate::backend_access::BackendAccessController;
use crate::config::Config;
use crate::logging::AccessLogEntry;
use crate::ram_cache::{RamCache, SharedRamCache};
use crate::shutdown::{ShutdownCoordinator, ShutdownReason, ShutdownSignal};
use crate::staging::StagingArea;
use crate::upload_pipeline::{UploadError, UploadOutcome, UploadPipeline};
use crate::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Body;
use hyper::header::{HeaderName, HeaderValue, ALLOW, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Body type of every response the proxy produces
pub type ProxyBody = Full<Bytes>;

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
const OCTET_STREAM: &str = "application/octet-stream";
const ALLOWED_METHODS: &str = "GET, HEAD, PUT, DELETE";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What produced a response, recorded in the access log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// `/ping` and `/shutdown`
    Control,
    /// Served from the RAM cache
    Cache,
    /// The backend answered (success or surfaced failure)
    Backend,
    /// Synthesized because the backend was paused or unreachable
    Degraded,
    /// Answered by the upload pipeline
    Upload,
    /// Refused locally without touching cache or backend
    Local,
    /// The request ran past the socket timeout
    Timeout,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseSource::Control => "control",
            ResponseSource::Cache => "cache",
            ResponseSource::Backend => "backend",
            ResponseSource::Degraded => "degraded",
            ResponseSource::Upload => "upload",
            ResponseSource::Local => "local",
            ResponseSource::Timeout => "timeout",
        }
    }
}

/// Per-request state machine shared by every connection
pub struct Dispatcher {
    cache: SharedRamCache,
    access: Arc<BackendAccessController>,
    store: Arc<dyn ObjectStore>,
    uploads: UploadPipeline,
    lifecycle: Arc<ShutdownCoordinator>,
    socket_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        store: Arc<dyn ObjectStore>,
        lifecycle: Arc<ShutdownCoordinator>,
    ) -> Self {
        let cache = SharedRamCache::new(RamCache::new(
            config.cache.enabled,
            config.cache.max_entry_size,
            config.cache.max_total_size,
        ));
        let access = Arc::new(BackendAccessController::new(config.offline_policy()));
        let uploads = UploadPipeline::new(
            config.upload_settings(),
            StagingArea::new(config.async_upload.staging_dir.clone()),
            Arc::clone(&access),
            Arc::clone(&store),
            cache.clone(),
        );

        Self {
            cache,
            access,
            store,
            uploads,
            lifecycle,
            socket_timeout: config.socket_timeout(),
        }
    }

    pub fn cache(&self) -> &SharedRamCache {
        &self.cache
    }

    pub fn access(&self) -> &BackendAccessController {
        &self.access
    }

    pub fn uploads(&self) -> &UploadPipeline {
        &self.uploads
    }

    /// Handle one request, including activity tracking, the socket timeout
    /// and access logging
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + Unpin,
        B::Error: std::fmt::Display,
    {
        self.lifecycle.record_activity();
        let started = Instant::now();
        let mut entry = AccessLogEntry::new(req.method().as_str(), req.uri().path());
        entry.backend_paused = self.access.is_paused();

        let (response, source) = match self.socket_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.dispatch(req)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        "{} {} did not complete within {:?}, answering 404",
                        entry.method, entry.path, limit
                    );
                    (empty_response(StatusCode::NOT_FOUND), ResponseSource::Timeout)
                }
            },
            None => self.dispatch(req).await,
        };

        entry.http_status = response.status().as_u16();
        entry.bytes_sent = response.body().size_hint().exact().unwrap_or(0);
        entry.elapsed_ms = started.elapsed().as_millis() as u64;
        entry.served_from_cache = source == ResponseSource::Cache;
        entry.source = source.as_str().to_string();
        entry.log();

        response
    }

    async fn dispatch<B>(&self, req: Request<B>) -> (Response<ProxyBody>, ResponseSource)
    where
        B: Body<Data = Bytes> + Send + Unpin,
        B::Error: std::fmt::Display,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        if method == Method::GET {
            match path.as_str() {
                "/ping" => {
                    return (
                        body_response(StatusCode::OK, "text/plain", Bytes::from_static(b"pong")),
                        ResponseSource::Control,
                    )
                }
                "/shutdown" => {
                    // The response still goes out: connections are drained
                    // gracefully once shutdown starts.
                    self.lifecycle.request_shutdown(ShutdownReason::Requested);
                    return (empty_response(StatusCode::OK), ResponseSource::Control);
                }
                _ => {}
            }
        }

        let key = object_key(&path);
        match method {
            Method::GET => self.read_object(key, false).await,
            Method::HEAD => self.read_object(key, true).await,
            Method::PUT => self.write_object(key, req.into_body()).await,
            Method::DELETE => self.delete_object(key).await,
            _ => {
                debug!("Rejecting unsupported method {} for {}", method, path);
                let mut response = empty_response(StatusCode::METHOD_NOT_ALLOWED);
                response
                    .headers_mut()
                    .insert(ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
                (response, ResponseSource::Local)
            }
        }
    }

    async fn read_object(&self, key: &str, head_only: bool) -> (Response<ProxyBody>, ResponseSource) {
        if key.is_empty() {
            return (empty_response(StatusCode::NOT_FOUND), ResponseSource::Local);
        }

        if let Some(payload) = self.cache.get(key) {
            debug!("RAM cache hit for {} ({} bytes)", key, payload.len());
            return (object_response(payload, head_only, true), ResponseSource::Cache);
        }

        if self.access.is_paused() {
            debug!("Backend paused, answering miss for {}", key);
            return (empty_response(StatusCode::NOT_FOUND), ResponseSource::Degraded);
        }

        if head_only {
            return match self.access.call("head", || self.store.head_object(key)).await {
                Ok(length) => {
                    let mut response = empty_response(StatusCode::OK);
                    let headers = response.headers_mut();
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
                    headers.insert(X_CACHE, HeaderValue::from_static("MISS"));
                    (response, ResponseSource::Backend)
                }
                Err(err) => self.read_failure(key, err),
            };
        }

        match self.access.call("get", || self.store.get_object(key)).await {
            Ok(payload) => {
                self.cache.put(key, payload.clone());
                (object_response(payload, false, false), ResponseSource::Backend)
            }
            Err(err) => self.read_failure(key, err),
        }
    }

    fn read_failure(&self, key: &str, err: BackendError) -> (Response<ProxyBody>, ResponseSource) {
        if err.is_not_found() {
            return (empty_response(StatusCode::NOT_FOUND), ResponseSource::Backend);
        }
        if self.access.is_ignorable(&err) {
            debug!("Answering miss for {}: {}", key, err);
            return (empty_response(StatusCode::NOT_FOUND), ResponseSource::Degraded);
        }
        warn!("Backend read of {} failed: {}", key, err);
        (backend_error_response(&err), ResponseSource::Backend)
    }

    async fn write_object<B>(&self, key: &str, body: B) -> (Response<ProxyBody>, ResponseSource)
    where
        B: Body<Data = Bytes> + Send + Unpin,
        B::Error: std::fmt::Display,
    {
        if key.is_empty() {
            return (empty_response(StatusCode::FORBIDDEN), ResponseSource::Local);
        }

        match self.uploads.store(key, body).await {
            Ok(outcome) => {
                debug!("PUT {} accepted: {:?}", key, outcome);
                let source = match outcome {
                    UploadOutcome::StoredLocally | UploadOutcome::Degraded => {
                        ResponseSource::Degraded
                    }
                    _ => ResponseSource::Upload,
                };
                (empty_response(StatusCode::OK), source)
            }
            Err(UploadError::Staging(err)) => {
                if err.is_local_resource() {
                    error!("Failed to stage upload of {}: {}", key, err);
                } else {
                    warn!("Upload of {} aborted: {}", key, err);
                }
                (staging_error_response(&err), ResponseSource::Upload)
            }
            Err(UploadError::Backend(err)) => {
                warn!("Backend upload of {} failed: {}", key, err);
                (backend_error_response(&err), ResponseSource::Backend)
            }
        }
    }

    async fn delete_object(&self, key: &str) -> (Response<ProxyBody>, ResponseSource) {
        if key.is_empty() {
            return (empty_response(StatusCode::FORBIDDEN), ResponseSource::Local);
        }

        self.cache.delete(key);

        match self.access.call("delete", || self.store.delete_object(key)).await {
            Ok(()) => (empty_response(StatusCode::OK), ResponseSource::Backend),
            Err(err) if self.access.is_ignorable(&err) => {
                debug!("Delete of {} not forwarded: {}", key, err);
                (empty_response(StatusCode::OK), ResponseSource::Degraded)
            }
            Err(err) if err.is_not_found() => {
                (empty_response(StatusCode::NOT_FOUND), ResponseSource::Backend)
            }
            Err(err) => {
                warn!("Backend delete of {} failed: {}", key, err);
                (backend_error_response(&err), ResponseSource::Backend)
            }
        }
    }
}

/// The caching proxy server
pub struct HttpProxy {
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    lifecycle: Arc<ShutdownCoordinator>,
    active_connections: Arc<AtomicUsize>,
}

impl HttpProxy {
    pub fn new(config: Config, store: Arc<dyn ObjectStore>) -> Self {
        let lifecycle = Arc::new(ShutdownCoordinator::new(config.idle_timeout()));
        let dispatcher = Arc::new(Dispatcher::new(&config, store, Arc::clone(&lifecycle)));
        Self {
            config: Arc::new(config),
            dispatcher,
            lifecycle,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn lifecycle(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.lifecycle)
    }

    /// Serve until shutdown is requested
    ///
    /// Purges leftover staging files, binds the listener, calls `on_ready`
    /// with the bound address, and returns why the proxy stopped.
    pub async fn run<F>(&self, on_ready: F) -> Result<ShutdownReason>
    where
        F: FnOnce(SocketAddr),
    {
        self.dispatcher.uploads().staging().initialize().await?;

        let bind = (self.config.server.bind_address.as_str(), self.config.server.port);
        let listener = TcpListener::bind(bind).await.map_err(|e| {
            ProxyError::ConnectionError(format!(
                "Failed to bind {}:{}: {}",
                self.config.server.bind_address, self.config.server.port, e
            ))
        })?;
        let local_addr = listener.local_addr()?;
        info!(
            "Build cache proxy listening on {} (bucket: {})",
            local_addr, self.config.backend.bucket
        );

        let mut shutdown_signal = self.lifecycle.subscribe();
        self.lifecycle.start_idle_timer();
        on_ready(local_addr);

        let reason = loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("HTTP connection from {}", addr);
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let active_connections = Arc::clone(&self.active_connections);
                            let connection_signal = self.lifecycle.subscribe();
                            tokio::spawn(async move {
                                Self::serve_connection(
                                    stream,
                                    addr,
                                    dispatcher,
                                    active_connections,
                                    connection_signal,
                                )
                                .await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept HTTP connection: {}", e);
                        }
                    }
                }
                reason = shutdown_signal.wait_for_shutdown() => {
                    info!("Stopping accept loop");
                    break reason;
                }
            }
        };
        drop(listener);

        self.drain_connections().await;
        self.finish_shutdown().await;

        reason.ok_or_else(|| {
            ProxyError::SystemError("shutdown signalled without a reason".to_string())
        })
    }

    async fn serve_connection(
        stream: TcpStream,
        addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        active_connections: Arc<AtomicUsize>,
        mut shutdown_signal: ShutdownSignal,
    ) {
        // Set TCP_NODELAY to disable Nagle's algorithm for lower latency
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        active_connections.fetch_add(1, Ordering::Relaxed);

        let service = service_fn(move |req| {
            let dispatcher = Arc::clone(&dispatcher);
            async move { Ok::<_, Infallible>(dispatcher.handle(req).await) }
        });

        let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
        tokio::pin!(connection);

        let mut closing = false;
        loop {
            tokio::select! {
                result = connection.as_mut() => {
                    if let Err(err) = result {
                        if err.is_incomplete_message() || err.is_canceled() {
                            debug!("Client disconnected from {}: {}", addr, err);
                        } else {
                            error!("Error serving HTTP connection from {}: {}", addr, err);
                        }
                    }
                    break;
                }
                _ = shutdown_signal.wait_for_shutdown(), if !closing => {
                    // Finish the current response, then close.
                    connection.as_mut().graceful_shutdown();
                    closing = true;
                }
            }
        }

        active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    async fn drain_connections(&self) {
        let drain_start = tokio::time::Instant::now();
        let active = self.active_connections.load(Ordering::Relaxed);
        if active == 0 {
            return;
        }

        info!(
            "Draining {} active connections (timeout: {:?})",
            active, DRAIN_TIMEOUT
        );
        while self.active_connections.load(Ordering::Relaxed) > 0
            && drain_start.elapsed() < DRAIN_TIMEOUT
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.active_connections.load(Ordering::Relaxed);
        if remaining > 0 {
            warn!("Shutting down with {} connections still active", remaining);
        } else {
            info!("All connections drained");
        }
    }

    async fn finish_shutdown(&self) {
        self.lifecycle.cancel_timers();

        let uploads = self.dispatcher.uploads();
        if uploads.in_flight_count() > 0 {
            warn!(
                "Abandoning {} pending uploads ({} bytes)",
                uploads.in_flight_count(),
                uploads.pending_bytes()
            );
        }
        match uploads.staging().purge().await {
            Ok(0) => {}
            Ok(removed) => debug!("Removed {} staging files", removed),
            Err(e) => warn!("Failed to purge staging directory: {}", e),
        }

        let stats = self.dispatcher.cache().get_stats();
        info!(
            "RAM cache at shutdown: {} entries, {} bytes, {} hits, {} misses ({:.1}% hit rate), {} evictions",
            stats.entries_count,
            stats.current_size,
            stats.hit_count,
            stats.miss_count,
            stats.hit_rate * 100.0,
            stats.eviction_count
        );
    }
}

/// Object key for a request path; the query string is never part of it
fn object_key(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn body_response(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<ProxyBody> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn object_response(payload: Bytes, head_only: bool, hit: bool) -> Response<ProxyBody> {
    let length = payload.len() as u64;
    let mut response = if head_only {
        empty_response(StatusCode::OK)
    } else {
        body_response(StatusCode::OK, OCTET_STREAM, payload)
    };

    let headers = response.headers_mut();
    if head_only {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }
    headers.insert(
        X_CACHE,
        HeaderValue::from_static(if hit { "HIT" } else { "MISS" }),
    );
    response
}

fn json_response(status: StatusCode, json: Result<String>) -> Response<ProxyBody> {
    match json {
        Ok(body) => body_response(status, "application/json", Bytes::from(body)),
        Err(e) => {
            error!("Failed to serialize error body: {}", e);
            empty_response(status)
        }
    }
}

fn backend_error_response(err: &BackendError) -> Response<ProxyBody> {
    let json = serde_json::to_string(&err.to_body()).map_err(ProxyError::from);
    json_response(err.status(), json)
}

fn staging_error_response(err: &ProxyError) -> Response<ProxyBody> {
    let json = serde_json::to_string(&serde_json::json!({
        "code": "StagingFailed",
        "message": err.to_string(),
        "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
    }))
    .map_err(ProxyError::from);
    json_response(StatusCode::INTERNAL_SERVER_ERROR, json)
}
