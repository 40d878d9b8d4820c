//! Typed settings assembled from a [`crate::ConfigSource`].

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use covis_core::{DEFAULT_HOSTS, Host, HostRegistry, LocationResolver};

/// Connection details for an object store or replica host.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Base URL (`http(s)://` or `file://`).
    pub url: String,
    /// Access key, when the endpoint is authenticated.
    pub access_key: Option<String>,
    /// Secret key, when the endpoint is authenticated.
    pub secret_key: Option<String>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Endpoint")
            .field("url", &self.url)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Logging knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Default level directive.
    pub level: String,
    /// `json` or `pretty`; `None` lets the build profile decide.
    pub format: Option<String>,
}

/// Queue and worker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Broker location (`memory://` or a `PostgreSQL` URL).
    pub broker_url: String,
    /// Result backend location (`memory://` or a `PostgreSQL` URL).
    pub result_backend: String,
    /// Retention window for task results.
    pub result_expires: Duration,
    /// Concurrent task slots per worker.
    pub worker_concurrency: usize,
    /// Reservations each slot may hold.
    pub prefetch_multiplier: usize,
    /// Lease length for reserved messages.
    pub broker_heartbeat: Duration,
    /// Bound on the initial broker connection.
    pub broker_connection_timeout: Duration,
    /// Deliveries allowed before a transient failure becomes final.
    pub max_deliveries: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            broker_url: crate::defaults::MEMORY_URL.to_string(),
            result_backend: crate::defaults::MEMORY_URL.to_string(),
            result_expires: Duration::from_secs(crate::defaults::RESULT_EXPIRES_SECS),
            worker_concurrency: crate::defaults::WORKER_CONCURRENCY,
            prefetch_multiplier: crate::defaults::PREFETCH_MULTIPLIER,
            broker_heartbeat: Duration::from_secs(crate::defaults::BROKER_HEARTBEAT_SECS),
            broker_connection_timeout: Duration::from_secs(
                crate::defaults::BROKER_CONNECTION_TIMEOUT_SECS,
            ),
            max_deliveries: crate::defaults::MAX_DELIVERIES,
        }
    }
}

/// Fully resolved process settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Catalog database URL.
    pub database_url: String,
    /// Logging configuration.
    pub logging: LogSettings,
    /// Queue configuration.
    pub queue: QueueSettings,
    /// Raw-data object store used for `s3://` inputs.
    pub raw_store: Option<Endpoint>,
    /// Output object store used for `s3://` outputs.
    pub output_store: Option<Endpoint>,
    /// Closed host set.
    pub known_hosts: Vec<String>,
    /// Replica preference order; empty means recorded order.
    pub host_priority: Vec<String>,
    /// Processing runtime command line.
    pub runtime_command: Option<String>,
    /// Parent directory for task scratch space.
    pub work_dir: Option<PathBuf>,
    pub(crate) host_endpoints: HashMap<String, Endpoint>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: crate::defaults::DATABASE_URL.to_string(),
            logging: LogSettings {
                level: crate::defaults::LOG_LEVEL.to_string(),
                format: None,
            },
            queue: QueueSettings::default(),
            raw_store: None,
            output_store: None,
            known_hosts: DEFAULT_HOSTS.iter().map(ToString::to_string).collect(),
            host_priority: Vec::new(),
            runtime_command: None,
            work_dir: None,
            host_endpoints: HashMap::new(),
        }
    }
}

impl Settings {
    /// Registry over the configured host set.
    #[must_use]
    pub fn host_registry(&self) -> HostRegistry {
        HostRegistry::new(&self.known_hosts)
    }

    /// Endpoint configured for `host`, keyed by its validated prefix.
    #[must_use]
    pub fn host_endpoint(&self, host: &Host) -> Option<&Endpoint> {
        self.host_endpoints.get(host.name())
    }

    /// Resolver honouring the priority table, with endpoint-less hosts unreachable.
    #[must_use]
    pub fn location_resolver(&self) -> LocationResolver {
        let mut resolver = LocationResolver::new().with_priority(self.host_priority.clone());
        for host in self.host_registry().hosts() {
            if self.host_endpoint(&host).is_none() {
                resolver.mark_unreachable(host.name());
            }
        }
        resolver
    }
}
