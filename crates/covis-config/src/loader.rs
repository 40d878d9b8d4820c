//! Settings loader over the process environment and an optional `.env` file.
//!
//! # Design
//! - `.env` entries are read into an overlay instead of being written into the
//!   process environment; real environment variables always win.
//! - A missing `.env` file is not an error; a malformed one is.
//! - Per-host keys are only ever derived from a validated host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;
use url::Url;

use crate::defaults::{
    KEY_BROKER_CONNECTION_TIMEOUT, KEY_BROKER_HEARTBEAT, KEY_BROKER_URL, KEY_DATABASE_URL,
    KEY_DATABASE_URL_ALIAS, KEY_HOST_PRIORITY, KEY_KNOWN_HOSTS, KEY_LOG_FORMAT, KEY_LOG_LEVEL,
    KEY_MAX_DELIVERIES, KEY_PREFETCH_MULTIPLIER, KEY_RESULT_BACKEND, KEY_RESULT_EXPIRES,
    KEY_RUNTIME_COMMAND, KEY_WORK_DIR, KEY_WORKER_CONCURRENCY, OUTPUT_STORE_PREFIX,
    RAW_STORE_PREFIX,
};
use crate::error::{ConfigError, ConfigResult};
use crate::model::{Endpoint, Settings};
use crate::source::{ConfigSource, EnvSource, Layered, MapSource};

/// Loads [`Settings`] from the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    env_file: Option<PathBuf>,
}

impl ConfigLoader {
    /// Loader that reads `.env` from the working directory when present.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read environment overrides from `path` instead of `./.env`.
    #[must_use]
    pub fn with_env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_file = Some(path.into());
        self
    }

    /// Load settings from the process environment layered over the `.env` file.
    ///
    /// # Errors
    ///
    /// Returns an error when the `.env` file is malformed or a value is invalid.
    pub fn load(&self) -> ConfigResult<Settings> {
        self.load_with(EnvSource)
    }

    /// Load settings from `primary` layered over the `.env` file.
    ///
    /// # Errors
    ///
    /// Returns an error when the `.env` file is malformed or a value is invalid.
    pub fn load_with(&self, primary: impl ConfigSource) -> ConfigResult<Settings> {
        let path = self
            .env_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(".env"));
        let overlay = read_env_file(&path)?;
        settings_from(&Layered::new(primary, overlay))
    }
}

fn read_env_file(path: &Path) -> ConfigResult<MapSource> {
    let entries = match dotenvy::from_path_iter(path) {
        Ok(entries) => entries,
        Err(dotenvy::Error::Io(_)) => {
            debug!(path = %path.display(), "no environment file found");
            return Ok(MapSource::new());
        }
        Err(source) => {
            return Err(ConfigError::EnvFile {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let mut overlay = MapSource::new();
    for entry in entries {
        let (key, value) = entry.map_err(|source| ConfigError::EnvFile {
            path: path.to_path_buf(),
            source,
        })?;
        overlay.insert(key, value);
    }
    debug!(path = %path.display(), "loaded environment file");
    Ok(overlay)
}

/// Assemble settings from a single source.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidField`] for values that do not parse.
pub fn settings_from(source: &impl ConfigSource) -> ConfigResult<Settings> {
    let mut settings = Settings::default();

    if let Some(url) = source
        .value(KEY_DATABASE_URL)
        .or_else(|| source.value(KEY_DATABASE_URL_ALIAS))
    {
        settings.database_url = url;
    }
    if let Some(level) = source.value(KEY_LOG_LEVEL) {
        settings.logging.level = level;
    }
    if let Some(format) = source.value(KEY_LOG_FORMAT) {
        let normalised = format.to_ascii_lowercase();
        if !matches!(normalised.as_str(), "json" | "pretty") {
            return Err(ConfigError::invalid(
                KEY_LOG_FORMAT,
                &format,
                "must be 'json' or 'pretty'",
            ));
        }
        settings.logging.format = Some(normalised);
    }

    let queue = &mut settings.queue;
    if let Some(url) = source.value(KEY_BROKER_URL) {
        queue.broker_url = url;
    }
    if let Some(url) = source.value(KEY_RESULT_BACKEND) {
        queue.result_backend = url;
    }
    if let Some(secs) = parse_number::<u64>(source, KEY_RESULT_EXPIRES)? {
        queue.result_expires = Duration::from_secs(secs);
    }
    if let Some(slots) = parse_positive(source, KEY_WORKER_CONCURRENCY)? {
        queue.worker_concurrency = slots;
    }
    if let Some(prefetch) = parse_positive(source, KEY_PREFETCH_MULTIPLIER)? {
        queue.prefetch_multiplier = prefetch;
    }
    if let Some(secs) = parse_number::<u64>(source, KEY_BROKER_HEARTBEAT)? {
        if secs < 2 {
            return Err(ConfigError::invalid(
                KEY_BROKER_HEARTBEAT,
                &secs.to_string(),
                "must be at least 2 seconds",
            ));
        }
        queue.broker_heartbeat = Duration::from_secs(secs);
    }
    if let Some(secs) = parse_number::<u64>(source, KEY_BROKER_CONNECTION_TIMEOUT)? {
        queue.broker_connection_timeout = Duration::from_secs(secs);
    }
    if let Some(bound) = parse_number::<u32>(source, KEY_MAX_DELIVERIES)? {
        if bound == 0 {
            return Err(ConfigError::invalid(
                KEY_MAX_DELIVERIES,
                "0",
                "must be at least 1",
            ));
        }
        queue.max_deliveries = bound;
    }

    settings.raw_store = endpoint(source, RAW_STORE_PREFIX, "HOST")?;
    settings.output_store = endpoint(source, OUTPUT_STORE_PREFIX, "HOST")?;

    if let Some(hosts) = source.value(KEY_KNOWN_HOSTS) {
        settings.known_hosts = split_list(&hosts);
        if settings.known_hosts.is_empty() {
            return Err(ConfigError::invalid(
                KEY_KNOWN_HOSTS,
                &hosts,
                "must name at least one host",
            ));
        }
    }
    let registry = settings.host_registry();
    if let Some(priority) = source.value(KEY_HOST_PRIORITY) {
        let priority = split_list(&priority);
        if let Some(unknown) = priority.iter().find(|host| !registry.validate(host)) {
            return Err(ConfigError::invalid(
                KEY_HOST_PRIORITY,
                unknown,
                "names a host outside the known host set",
            ));
        }
        settings.host_priority = priority;
    }

    let mut host_endpoints = HashMap::new();
    for host in registry.hosts() {
        if let Some(found) = endpoint(source, host.config_prefix(), "URL")? {
            host_endpoints.insert(host.name().to_string(), found);
        }
    }
    settings.host_endpoints = host_endpoints;

    settings.runtime_command = source.value(KEY_RUNTIME_COMMAND);
    settings.work_dir = source.value(KEY_WORK_DIR).map(PathBuf::from);
    Ok(settings)
}

fn parse_number<T: FromStr>(source: &impl ConfigSource, key: &str) -> ConfigResult<Option<T>> {
    source
        .value(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| ConfigError::invalid(key, &raw, "must be a non-negative integer"))
        })
        .transpose()
}

fn parse_positive(source: &impl ConfigSource, key: &str) -> ConfigResult<Option<usize>> {
    match parse_number::<usize>(source, key)? {
        Some(0) => Err(ConfigError::invalid(key, "0", "must be at least 1")),
        other => Ok(other),
    }
}

fn endpoint(
    source: &impl ConfigSource,
    prefix: &str,
    location_suffix: &str,
) -> ConfigResult<Option<Endpoint>> {
    let location_key = format!("{prefix}_{location_suffix}");
    let Some(raw) = source.value(&location_key) else {
        return Ok(None);
    };
    let url = if raw.contains("://") {
        raw
    } else {
        format!("http://{raw}")
    };
    if Url::parse(&url).is_err() {
        return Err(ConfigError::invalid(&location_key, &url, "must be a valid URL"));
    }
    let access_key = source.value(&format!("{prefix}_ACCESS_KEY"));
    let secret_key = source.value(&format!("{prefix}_SECRET_KEY"));
    if access_key.is_some() != secret_key.is_some() {
        return Err(ConfigError::Missing {
            key: if access_key.is_some() {
                format!("{prefix}_SECRET_KEY")
            } else {
                format!("{prefix}_ACCESS_KEY")
            },
        });
    }
    Ok(Some(Endpoint {
        url,
        access_key,
        secret_key,
    }))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::fs;

    type TestResult<T> = Result<T>;

    #[test]
    fn defaults_match_the_deployed_queue_tuning() -> TestResult<()> {
        let settings = settings_from(&MapSource::new())?;
        assert_eq!(settings.database_url, "postgres://localhost/covis");
        assert_eq!(settings.queue.broker_url, "memory://");
        assert_eq!(settings.queue.result_expires, Duration::from_secs(3_600));
        assert_eq!(settings.queue.worker_concurrency, 1);
        assert_eq!(settings.queue.prefetch_multiplier, 1);
        assert_eq!(settings.queue.broker_heartbeat, Duration::from_secs(300));
        assert_eq!(settings.queue.broker_connection_timeout, Duration::from_secs(60));
        assert_eq!(settings.queue.max_deliveries, 5);
        assert_eq!(settings.known_hosts, vec!["COVIS-NAS", "DMAS"]);
        assert!(settings.raw_store.is_none());
        Ok(())
    }

    #[test]
    fn invalid_numbers_are_reported_with_their_key() {
        let source = MapSource::new().with(KEY_WORKER_CONCURRENCY, "many");
        match settings_from(&source) {
            Err(ConfigError::InvalidField { field, value, .. }) => {
                assert_eq!(field, KEY_WORKER_CONCURRENCY);
                assert_eq!(value.as_deref(), Some("many"));
            }
            other => panic!("expected invalid field, got {other:?}"),
        }
        let zero = MapSource::new().with(KEY_PREFETCH_MULTIPLIER, "0");
        assert!(matches!(
            settings_from(&zero),
            Err(ConfigError::InvalidField { .. })
        ));
    }

    #[test]
    fn host_endpoints_are_keyed_by_validated_prefix() -> TestResult<()> {
        let source = MapSource::new()
            .with("COVIS_NAS_URL", "file:///srv/covis-nas")
            .with("DMAS_URL", "dmas.example.org:9000")
            .with("DMAS_ACCESS_KEY", "id")
            .with("DMAS_SECRET_KEY", "secret")
            .with(KEY_HOST_PRIORITY, "DMAS, COVIS-NAS");
        let settings = settings_from(&source)?;
        let registry = settings.host_registry();

        let nas = registry.resolve("COVIS-NAS")?;
        assert_eq!(
            settings.host_endpoint(&nas).map(|e| e.url.as_str()),
            Some("file:///srv/covis-nas")
        );
        let dmas = registry.resolve("DMAS")?;
        let endpoint = settings
            .host_endpoint(&dmas)
            .ok_or_else(|| anyhow::anyhow!("missing DMAS endpoint"))?;
        assert_eq!(endpoint.url, "http://dmas.example.org:9000");
        assert_eq!(endpoint.secret_key.as_deref(), Some("secret"));
        assert!(!format!("{endpoint:?}").contains("secret\""));
        assert_eq!(settings.host_priority, vec!["DMAS", "COVIS-NAS"]);
        Ok(())
    }

    #[test]
    fn hosts_without_endpoint_are_unreachable() -> TestResult<()> {
        let source = MapSource::new().with("DMAS_URL", "file:///srv/dmas");
        let resolver = settings_from(&source)?.location_resolver();
        assert!(resolver.is_reachable("DMAS"));
        assert!(!resolver.is_reachable("COVIS-NAS"));
        Ok(())
    }

    #[test]
    fn priority_outside_host_set_is_rejected() {
        let source = MapSource::new().with(KEY_HOST_PRIORITY, "ELSEWHERE");
        assert!(matches!(
            settings_from(&source),
            Err(ConfigError::InvalidField { .. })
        ));
    }

    #[test]
    fn half_configured_credentials_report_the_missing_key() {
        let source = MapSource::new()
            .with("RAW_S3_HOST", "minio:9000")
            .with("RAW_S3_ACCESS_KEY", "id");
        match settings_from(&source) {
            Err(ConfigError::Missing { key }) => assert_eq!(key, "RAW_S3_SECRET_KEY"),
            other => panic!("expected missing key, got {other:?}"),
        }
    }

    #[test]
    fn env_file_fills_gaps_and_missing_file_is_tolerated() -> TestResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(".env");
        fs::write(&path, "COVIS_BROKER_URL=postgres://broker/covis\nLOG_LEVEL=debug\n")?;

        let primary = MapSource::new().with(KEY_LOG_LEVEL, "warn");
        let settings = ConfigLoader::new().with_env_file(&path).load_with(primary)?;
        assert_eq!(settings.queue.broker_url, "postgres://broker/covis");
        assert_eq!(settings.logging.level, "warn");

        let missing = ConfigLoader::new()
            .with_env_file(dir.path().join("absent.env"))
            .load_with(MapSource::new())?;
        assert_eq!(missing.queue.broker_url, "memory://");
        Ok(())
    }
}
