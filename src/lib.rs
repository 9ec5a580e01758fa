//! S3 Build Cache - local caching proxy between a build tool's HTTP remote
//! cache and an S3 bucket
//!
//! This library provides the request dispatcher, the in-memory LRU cache, the
//! backend access controller with offline degradation, the disk-staged upload
//! pipeline and the idle lifecycle, plus the S3 client and configuration
//! layers the binary wires together.

pub mod backend;
pub mod backend_access;
pub mod capacity_manager;
pub mod config;
pub mod error;
pub mod http_proxy;
pub mod https_connector;
pub mod inflight_tracker;
pub mod logging;
pub mod memory_store;
pub mod ram_cache;
pub mod s3_client;
pub mod shutdown;
pub mod sigv4;
pub mod staging;
pub mod upload_pipeline;

pub use error::{ProxyError, Result};
