//! Configuration Module
//!
//! Handles configuration loading from files, environment variables, and command-line arguments.
//! Later sources override earlier ones: defaults, then the YAML file, then the environment,
//! then the command line. The result is validated before anything consumes it.

use crate::backend_access::OfflinePolicy;
use crate::sigv4::Credentials;
use crate::upload_pipeline::UploadSettings;
use crate::{ProxyError, Result};
use clap::{Arg, ArgMatches, Command};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Custom deserializer for PathBuf that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(expand_tilde(&s))
    }

    pub fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Custom deserializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let num_end = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let seconds = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" => value,
            "m" | "min" | "mins" | "minute" | "minutes" => value * 60.0,
            "h" | "hr" | "hrs" | "hour" | "hours" => value * 3600.0,
            "d" | "day" | "days" => value * 86400.0,
            "ms" | "millis" | "millisecond" | "milliseconds" => value / 1000.0,
            "" => value, // Default to seconds if no unit
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Duration::try_from_secs_f64(seconds)
            .map_err(|e| format!("Duration '{}' is out of range: {}", s, e))
    }
}

pub(crate) use duration_serde::parse_duration;

/// Listener and request lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// `0` binds an ephemeral port
    pub port: u16,
    /// Per-request processing limit, `0` disables it
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub socket_timeout: Duration,
    /// Shut down after this long without requests, `0` disables it
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 7777,
            socket_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(3 * 3600),
        }
    }
}

/// Object store settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint such as a MinIO URL; AWS when absent
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub request_timeout: Duration,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            endpoint: None,
            force_path_style: false,
            request_timeout: Duration::from_secs(30),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
        }
    }
}

// Keeps secrets out of debug logs.
impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("force_path_style", &self.force_path_style)
            .field("request_timeout", &self.request_timeout)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl BackendConfig {
    /// Static credentials, when both halves are configured
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => Some(Credentials {
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                session_token: self.session_token.clone(),
            }),
            _ => None,
        }
    }
}

/// Offline degradation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    pub allow_offline: bool,
    /// `0` disables pausing
    pub errors_before_pausing: u32,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub pause_duration: Duration,
    pub count_rejections: bool,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        let policy = OfflinePolicy::default();
        Self {
            allow_offline: policy.allow_offline,
            errors_before_pausing: policy.errors_before_pausing,
            pause_duration: policy.pause_duration,
            count_rejections: policy.count_rejections,
        }
    }
}

/// RAM cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Entries must be strictly smaller than this
    pub max_entry_size: u64,
    pub max_total_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entry_size: 1_000_000,
            max_total_size: 50_000_000,
        }
    }
}

/// Upload pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncUploadConfig {
    pub enabled: bool,
    pub max_pending_bytes: u64,
    /// Extra per-upload limit below `cache.max_entry_size`, `0` disables it
    pub max_upload_size: u64,
    #[serde(deserialize_with = "pathbuf_serde::deserialize")]
    pub staging_dir: PathBuf,
}

impl Default for AsyncUploadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_pending_bytes: 50_000_000,
            max_upload_size: 0,
            staging_dir: pathbuf_serde::expand_tilde("~/.cache/s3-build-cache/staging"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    /// Daily-rotated application logs are written here when set
    pub app_log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            app_log_dir: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub offline: OfflineConfig,
    pub cache: CacheConfig,
    pub async_upload: AsyncUploadConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file, environment, and command line
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        let config = Self::resolve(&matches, |name| std::env::var(name).ok())?;
        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Parse `args` (including the program name) and resolve a validated configuration
    ///
    /// Environment variables are looked up through `env`.
    pub fn load_from_args<I, T, F>(args: I, env: F) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
        F: Fn(&str) -> Option<String>,
    {
        let matches = Self::build_cli()
            .try_get_matches_from(args)
            .map_err(|e| ProxyError::ConfigError(format!("Invalid arguments: {}", e)))?;
        Self::resolve(&matches, env)
    }

    fn resolve<F>(matches: &ArgMatches, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match matches.get_one::<String>("config") {
            Some(config_path) => Self::load_from_file(config_path)?,
            None => Self::default(),
        };

        config.apply_env_overrides(env)?;
        config.apply_cli_overrides(matches)?;
        config.validate()?;

        debug!("Configuration: {:?}", config);
        Ok(config)
    }

    /// Build CLI argument parser
    fn build_cli() -> Command {
        Command::new("s3-build-cache")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Caching proxy between a build tool's HTTP remote cache and an S3 bucket")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("bucket")
                    .short('b')
                    .long("bucket")
                    .value_name("NAME")
                    .help("S3 bucket holding the cache"),
            )
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .value_name("PORT")
                    .help("Listening port (default: 7777, 0 picks a free port)"),
            )
            .arg(
                Arg::new("bind-address")
                    .long("bind-address")
                    .value_name("ADDR")
                    .help("Listening address (default: 127.0.0.1)"),
            )
            .arg(
                Arg::new("endpoint")
                    .long("endpoint")
                    .value_name("URL")
                    .help("Custom S3-compatible endpoint, e.g. http://localhost:9000"),
            )
            .arg(
                Arg::new("region")
                    .long("region")
                    .value_name("REGION")
                    .help("AWS region (default: us-east-1)"),
            )
            .arg(
                Arg::new("idle-timeout")
                    .long("idle-timeout")
                    .value_name("DURATION")
                    .help("Shut down after this long without requests, e.g. 30m (0 disables)"),
            )
            .arg(
                Arg::new("staging-dir")
                    .long("staging-dir")
                    .value_name("DIR")
                    .help("Directory for staged upload bodies"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level: trace, debug, info, warn, error"),
            )
            .arg(
                Arg::new("log-dir")
                    .long("log-dir")
                    .value_name("DIR")
                    .help("Write rotating application logs to this directory"),
            )
            .arg(
                Arg::new("no-offline")
                    .long("no-offline")
                    .action(clap::ArgAction::SetTrue)
                    .help("Surface backend connectivity failures instead of hiding them"),
            )
            .arg(
                Arg::new("sync-upload")
                    .long("sync-upload")
                    .action(clap::ArgAction::SetTrue)
                    .help("Wait for the backend upload before answering PUT requests"),
            )
            .arg(
                Arg::new("no-cache")
                    .long("no-cache")
                    .action(clap::ArgAction::SetTrue)
                    .help("Disable the in-memory cache"),
            )
    }

    /// Load configuration from YAML file
    fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;

        info!("Configuration loaded from file: {}", path);
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides<F>(&mut self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bucket) = env("S3_CACHE_BUCKET") {
            self.backend.bucket = bucket;
        }

        if let Some(port) = env("S3_CACHE_PORT") {
            self.server.port = parse_port(&port)?;
        }

        if let Some(endpoint) = env("S3_CACHE_ENDPOINT") {
            self.backend.endpoint = Some(endpoint);
        }

        if let Some(staging_dir) = env("S3_CACHE_STAGING_DIR") {
            self.async_upload.staging_dir = pathbuf_serde::expand_tilde(&staging_dir);
        }

        if let Some(region) = env("AWS_REGION") {
            self.backend.region = region;
        }

        if let Some(access_key_id) = env("AWS_ACCESS_KEY_ID") {
            self.backend.access_key_id = Some(access_key_id);
        }

        if let Some(secret_access_key) = env("AWS_SECRET_ACCESS_KEY") {
            self.backend.secret_access_key = Some(secret_access_key);
        }

        if let Some(session_token) = env("AWS_SESSION_TOKEN") {
            self.backend.session_token = Some(session_token);
        }

        if let Some(log_level) = env("LOG_LEVEL") {
            self.logging.log_level = log_level;
        }

        Ok(())
    }

    /// Apply command line argument overrides
    fn apply_cli_overrides(&mut self, matches: &ArgMatches) -> Result<()> {
        if let Some(bucket) = matches.get_one::<String>("bucket") {
            self.backend.bucket = bucket.clone();
        }

        if let Some(port) = matches.get_one::<String>("port") {
            self.server.port = parse_port(port)?;
        }

        if let Some(bind_address) = matches.get_one::<String>("bind-address") {
            self.server.bind_address = bind_address.clone();
        }

        if let Some(endpoint) = matches.get_one::<String>("endpoint") {
            self.backend.endpoint = Some(endpoint.clone());
        }

        if let Some(region) = matches.get_one::<String>("region") {
            self.backend.region = region.clone();
        }

        if let Some(idle_timeout) = matches.get_one::<String>("idle-timeout") {
            self.server.idle_timeout = parse_duration(idle_timeout).map_err(|e| {
                ProxyError::ConfigError(format!("Invalid --idle-timeout: {}", e))
            })?;
        }

        if let Some(staging_dir) = matches.get_one::<String>("staging-dir") {
            self.async_upload.staging_dir = pathbuf_serde::expand_tilde(staging_dir);
        }

        if let Some(log_level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = log_level.clone();
        }

        if let Some(log_dir) = matches.get_one::<String>("log-dir") {
            self.logging.app_log_dir = Some(pathbuf_serde::expand_tilde(log_dir));
        }

        if matches.get_flag("no-offline") {
            self.offline.allow_offline = false;
        }

        if matches.get_flag("sync-upload") {
            self.async_upload.enabled = false;
        }

        if matches.get_flag("no-cache") {
            self.cache.enabled = false;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.backend.bucket.trim().is_empty() {
            return Err(ProxyError::ConfigError(
                "A bucket is required (--bucket, S3_CACHE_BUCKET or backend.bucket)".to_string(),
            ));
        }

        if self.backend.region.trim().is_empty() {
            return Err(ProxyError::ConfigError("Region must not be empty".to_string()));
        }

        if let Some(endpoint) = &self.backend.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(ProxyError::ConfigError(format!(
                    "Endpoint must start with http:// or https://, got {}",
                    endpoint
                )));
            }
        }

        if self.cache.max_entry_size > self.cache.max_total_size {
            return Err(ProxyError::ConfigError(format!(
                "cache.max_entry_size ({}) must not exceed cache.max_total_size ({})",
                self.cache.max_entry_size, self.cache.max_total_size
            )));
        }

        if self.offline.allow_offline
            && self.offline.errors_before_pausing > 0
            && self.offline.pause_duration.is_zero()
        {
            return Err(ProxyError::ConfigError(
                "offline.pause_duration must be non-zero when errors_before_pausing is set"
                    .to_string(),
            ));
        }

        if self.async_upload.staging_dir.as_os_str().is_empty() {
            return Err(ProxyError::ConfigError(
                "async_upload.staging_dir must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn offline_policy(&self) -> OfflinePolicy {
        OfflinePolicy {
            allow_offline: self.offline.allow_offline,
            errors_before_pausing: self.offline.errors_before_pausing,
            pause_duration: self.offline.pause_duration,
            count_rejections: self.offline.count_rejections,
        }
    }

    pub fn upload_settings(&self) -> UploadSettings {
        UploadSettings {
            async_enabled: self.async_upload.enabled,
            max_pending_bytes: self.async_upload.max_pending_bytes,
            max_upload_size: self.upload_size_limit(),
        }
    }

    /// Largest upload sent to the backend, `0` for no limit
    ///
    /// Uploads above the cache entry limit are never sent; `max_upload_size`
    /// can only lower that limit further.
    pub fn upload_size_limit(&self) -> u64 {
        match (self.cache.max_entry_size, self.async_upload.max_upload_size) {
            (0, extra) => extra,
            (entry, 0) => entry,
            (entry, extra) => entry.min(extra),
        }
    }

    /// Per-request processing limit, `None` when disabled
    pub fn socket_timeout(&self) -> Option<Duration> {
        non_zero(self.server.socket_timeout)
    }

    /// Inactivity limit, `None` when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        non_zero(self.server.idle_timeout)
    }
}

fn non_zero(duration: Duration) -> Option<Duration> {
    if duration.is_zero() {
        None
    } else {
        Some(duration)
    }
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|e| ProxyError::ConfigError(format!("Invalid port '{}': {}", value, e)))
}
