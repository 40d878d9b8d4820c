//! Default values and environment keys.
//!
//! # Design
//! - Keep every key name in one place so operators can grep for it.
//! - Defaults mirror the queue tuning the worker fleet was deployed with.

pub(crate) const MEMORY_URL: &str = "memory://";
pub(crate) const DATABASE_URL: &str = "postgres://localhost/covis";
pub(crate) const LOG_LEVEL: &str = "info";
pub(crate) const RESULT_EXPIRES_SECS: u64 = 3_600;
pub(crate) const WORKER_CONCURRENCY: usize = 1;
pub(crate) const PREFETCH_MULTIPLIER: usize = 1;
pub(crate) const BROKER_HEARTBEAT_SECS: u64 = 300;
pub(crate) const BROKER_CONNECTION_TIMEOUT_SECS: u64 = 60;
pub(crate) const MAX_DELIVERIES: u32 = 5;

/// Catalog database URL.
pub const KEY_DATABASE_URL: &str = "COVIS_DATABASE_URL";
/// Fallback database URL key shared with sqlx tooling.
pub const KEY_DATABASE_URL_ALIAS: &str = "DATABASE_URL";
/// Default log level.
pub const KEY_LOG_LEVEL: &str = "LOG_LEVEL";
/// Log output format.
pub const KEY_LOG_FORMAT: &str = "LOG_FORMAT";
/// Broker URL.
pub const KEY_BROKER_URL: &str = "COVIS_BROKER_URL";
/// Result backend URL.
pub const KEY_RESULT_BACKEND: &str = "COVIS_RESULT_BACKEND";
/// Result retention in seconds.
pub const KEY_RESULT_EXPIRES: &str = "COVIS_RESULT_EXPIRES_SECS";
/// Worker slot count.
pub const KEY_WORKER_CONCURRENCY: &str = "COVIS_WORKER_CONCURRENCY";
/// Reservations per slot.
pub const KEY_PREFETCH_MULTIPLIER: &str = "COVIS_PREFETCH_MULTIPLIER";
/// Lease length in seconds.
pub const KEY_BROKER_HEARTBEAT: &str = "COVIS_BROKER_HEARTBEAT_SECS";
/// Initial broker connection bound in seconds.
pub const KEY_BROKER_CONNECTION_TIMEOUT: &str = "COVIS_BROKER_CONNECTION_TIMEOUT_SECS";
/// Redelivery bound.
pub const KEY_MAX_DELIVERIES: &str = "COVIS_MAX_DELIVERIES";
/// Prefix for the raw-data object store keys.
pub const RAW_STORE_PREFIX: &str = "RAW_S3";
/// Prefix for the output object store keys.
pub const OUTPUT_STORE_PREFIX: &str = "OUTPUT_S3";
/// Comma-separated host set.
pub const KEY_KNOWN_HOSTS: &str = "COVIS_KNOWN_HOSTS";
/// Comma-separated replica preference order.
pub const KEY_HOST_PRIORITY: &str = "COVIS_HOST_PRIORITY";
/// Processing runtime command line.
pub const KEY_RUNTIME_COMMAND: &str = "COVIS_RUNTIME_COMMAND";
/// Scratch directory parent.
pub const KEY_WORK_DIR: &str = "COVIS_WORK_DIR";
