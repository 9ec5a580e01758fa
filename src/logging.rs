//! Logging Module
//!
//! Sets up application logging (console plus optional daily-rotated files with
//! host identification) and defines the structured access log record emitted
//! once per request on the `access` target.

use crate::{ProxyError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tracing target access log records are emitted on
pub const ACCESS_LOG_TARGET: &str = "access";

/// One access log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub request_id: String,
    pub time: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub http_status: u16,
    pub bytes_sent: u64,
    pub elapsed_ms: u64,
    pub served_from_cache: bool,
    pub backend_paused: bool,
    /// What produced the response (`cache`, `backend`, `degraded`, ...)
    pub source: String,
}

impl AccessLogEntry {
    /// Start a record for a request received now
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            time: Utc::now(),
            method: method.to_string(),
            path: path.to_string(),
            http_status: 0,
            bytes_sent: 0,
            elapsed_ms: 0,
            served_from_cache: false,
            backend_paused: false,
            source: "-".to_string(),
        }
    }

    /// Emit the record on the access target
    pub fn log(&self) {
        info!(
            target: ACCESS_LOG_TARGET,
            request_id = %self.request_id,
            method = %self.method,
            path = %self.path,
            status = self.http_status,
            bytes = self.bytes_sent,
            elapsed_ms = self.elapsed_ms,
            cached = self.served_from_cache,
            paused = self.backend_paused,
            source = %self.source,
            "{}",
            self
        );
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl std::fmt::Display for AccessLogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {}B {}ms{}{} [{}]",
            self.method,
            self.path,
            self.http_status,
            self.bytes_sent,
            self.elapsed_ms,
            if self.served_from_cache { " cached" } else { "" },
            if self.backend_paused { " paused" } else { "" },
            self.source
        )
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub app_log_dir: Option<PathBuf>,
    pub hostname: String,
    pub log_level: String,
}

/// Logger manager for handling all logging operations
pub struct LoggerManager {
    pub config: LoggingConfig,
    initialized: bool,
}

impl LoggerManager {
    /// Create a new logger manager
    pub fn new(config: LoggingConfig) -> Self {
        Self {
            config,
            initialized: false,
        }
    }

    /// Create a new logger manager from config module types
    pub fn from_config(config: crate::config::LoggingConfig, hostname: String) -> Self {
        Self::new(LoggingConfig {
            app_log_dir: config.app_log_dir,
            hostname,
            log_level: config.log_level,
        })
    }

    /// Local hostname, used to partition log directories
    pub fn local_hostname() -> String {
        gethostname::gethostname().to_string_lossy().to_string()
    }

    /// Directory application logs are written to, if file logging is enabled
    pub fn host_log_dir(&self) -> Option<PathBuf> {
        self.config
            .app_log_dir
            .as_ref()
            .map(|dir| dir.join(&self.config.hostname))
    }

    /// Whether this manager installed the global subscriber
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Initialize the logging system
    pub fn initialize(&mut self) -> Result<()> {
        let host_log_dir = self.host_log_dir();

        let file_layer = match &host_log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    ProxyError::IoError(format!("Failed to create app log directory: {}", e))
                })?;

                // Daily rotation, one directory per host
                let file_appender =
                    RollingFileAppender::new(Rotation::DAILY, dir.clone(), "s3-build-cache.log");

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_appender)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_level(true)
                        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                        .compact(),
                )
            }
            None => None,
        };

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        // Config log_level, overridable by RUST_LOG
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.log_level));

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(()) => {
                self.initialized = true;
                info!(
                    "Application logging initialized for host: {}",
                    self.config.hostname
                );
                if let Some(dir) = host_log_dir {
                    info!("Application logs will be written to: {:?}", dir);
                }
            }
            Err(_) => {
                // Already initialized, likely in tests - this is fine
                debug!("Tracing subscriber already initialized, skipping");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_entry() -> AccessLogEntry {
        let mut entry = AccessLogEntry::new("GET", "/ac/abc");
        entry.http_status = 200;
        entry.bytes_sent = 5;
        entry.elapsed_ms = 3;
        entry.served_from_cache = true;
        entry.source = "cache".to_string();
        entry
    }

    #[test]
    fn test_access_log_display() {
        let line = create_test_entry().to_string();
        assert_eq!(line, "GET /ac/abc 200 5B 3ms cached [cache]");
    }

    #[test]
    fn test_access_log_json_round_trip() {
        let entry = create_test_entry();
        let json = entry.to_json().unwrap();
        let parsed: AccessLogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = AccessLogEntry::new("GET", "/a");
        let b = AccessLogEntry::new("GET", "/a");
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn test_initialize_creates_host_directory() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = LoggerManager::new(LoggingConfig {
            app_log_dir: Some(temp_dir.path().to_path_buf()),
            hostname: "test-host".to_string(),
            log_level: "debug".to_string(),
        });

        manager.initialize().unwrap();
        // A second initialization is tolerated.
        manager.initialize().unwrap();

        assert!(temp_dir.path().join("test-host").is_dir());
        assert_eq!(
            manager.host_log_dir(),
            Some(temp_dir.path().join("test-host"))
        );
    }

    #[test]
    fn test_console_only_logging() {
        let manager = LoggerManager::from_config(
            crate::config::LoggingConfig::default(),
            LoggerManager::local_hostname(),
        );
        assert!(manager.host_log_dir().is_none());
        assert!(!manager.config.hostname.is_empty());
    }
}
