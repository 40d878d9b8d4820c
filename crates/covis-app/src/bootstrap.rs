//! Service wiring for the worker and the operator CLI.
//!
//! # Design
//! - [`Services`] is assembled once from [`Settings`]; tests assemble it from
//!   in-memory collaborators through [`Services::from_parts`].
//! - Broker and result backend are chosen by URL scheme: `memory://` stays in
//!   process, `postgres://` shares the catalog database when the URLs match.
//! - A worker without a processing runtime only consumes queues whose tasks it
//!   can run.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use covis_config::{ConfigLoader, Endpoint, Settings};
use covis_core::{
    Catalog, HostRegistry, LocationResolver, ObjectStore, ProcessingRuntime, ReplicaStore,
};
use covis_data::Database;
use covis_events::EventBus;
use covis_fsops::InputResolver;
use covis_queue::{
    Broker, MemoryBroker, MemoryResultBackend, QueueConfig, QueueError, ResultBackend,
    TaskDispatcher, Worker,
};
use covis_storage::{HostStores, StorageBackend};
use covis_telemetry::{LogFormat, LoggingConfig, Metrics};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::dispatch::Dispatch;
use crate::error::{AppError, AppResult};
use crate::event_log::spawn_event_log;
use crate::runtime::CommandRuntime;
use crate::tasks::{ProcessHandler, RelocateHandler, task_registry};

/// Where queue messages or results are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process state, lost on exit.
    Memory,
    /// `PostgreSQL` tables.
    Postgres,
}

impl BackendKind {
    /// Classify a broker or result-backend URL by scheme.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnsupportedBackend`] for any other scheme.
    pub fn from_url(url: &str) -> Result<Self, QueueError> {
        let scheme = url.split_once("://").map_or(url, |(scheme, _)| scheme);
        match scheme {
            "memory" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            _ => Err(QueueError::UnsupportedBackend {
                url: url.to_string(),
            }),
        }
    }
}

/// Queue configuration derived from settings; worker and dispatcher share it.
#[must_use]
pub fn queue_config(settings: &Settings) -> QueueConfig {
    let queue = &settings.queue;
    QueueConfig {
        broker_url: queue.broker_url.clone(),
        result_backend: queue.result_backend.clone(),
        result_expires: queue.result_expires,
        worker_concurrency: queue.worker_concurrency,
        prefetch_multiplier: queue.prefetch_multiplier,
        broker_heartbeat: queue.broker_heartbeat,
        broker_connection_timeout: queue.broker_connection_timeout,
        max_deliveries: queue.max_deliveries,
        ..QueueConfig::default()
    }
}

/// Logging configuration for `service` derived from settings.
#[must_use]
pub fn logging_config<'a>(settings: &'a Settings, service: &'a str) -> LoggingConfig<'a> {
    LoggingConfig {
        level: &settings.logging.level,
        format: LogFormat::from_setting(settings.logging.format.as_deref()),
        service,
        ..LoggingConfig::default()
    }
}

/// Collaborators that are not derived from settings alone.
pub struct Collaborators {
    /// Run catalog.
    pub catalog: Arc<dyn Catalog>,
    /// Replica hosts.
    pub replicas: Arc<dyn ReplicaStore>,
    /// Raw-data object store, when configured.
    pub raw_store: Option<Arc<dyn ObjectStore>>,
    /// Output object store, when configured.
    pub output_store: Option<Arc<dyn ObjectStore>>,
    /// Processing runtime, when configured.
    pub runtime: Option<Arc<dyn ProcessingRuntime>>,
    /// Task broker.
    pub broker: Arc<dyn Broker>,
    /// Task result backend.
    pub results: Arc<dyn ResultBackend>,
}

/// Fully wired application services.
#[derive(Clone)]
pub struct Services {
    settings: Settings,
    catalog: Arc<dyn Catalog>,
    dispatcher: TaskDispatcher,
    hosts: HostRegistry,
    locations: LocationResolver,
    queues: Vec<String>,
    metrics: Metrics,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Services")
            .field("dispatcher", &self.dispatcher)
            .field("hosts", &self.hosts)
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Connect every collaborator described by `settings`.
    ///
    /// # Errors
    ///
    /// Returns an error when a backend URL is unsupported, an endpoint is
    /// invalid, or the database cannot be reached.
    pub async fn connect(settings: Settings) -> AppResult<Self> {
        let broker_kind = BackendKind::from_url(&settings.queue.broker_url)
            .map_err(|err| AppError::queue("broker.select", err))?;
        let results_kind = BackendKind::from_url(&settings.queue.result_backend)
            .map_err(|err| AppError::queue("results.select", err))?;
        let timeout = settings.queue.broker_connection_timeout;

        let database = connect_database(&settings.database_url, timeout, "database.connect").await?;
        info!("catalog database connected");

        let broker: Arc<dyn Broker> = match broker_kind {
            BackendKind::Memory => Arc::new(MemoryBroker::new()),
            BackendKind::Postgres => {
                let db = database_for(
                    &database,
                    &settings.database_url,
                    &settings.queue.broker_url,
                    timeout,
                )
                .await?;
                Arc::new(db.broker())
            }
        };
        let retention = settings.queue.result_expires;
        let results: Arc<dyn ResultBackend> = match results_kind {
            BackendKind::Memory => Arc::new(MemoryResultBackend::new(retention)),
            BackendKind::Postgres => {
                let db = database_for(
                    &database,
                    &settings.database_url,
                    &settings.queue.result_backend,
                    timeout,
                )
                .await?;
                Arc::new(db.results(retention))
            }
        };

        let replicas = HostStores::from_settings(&settings)
            .map_err(|err| AppError::storage("host_stores.new", err))?;
        let raw_store = object_store(settings.raw_store.as_ref(), "raw_store.new")?;
        let output_store = object_store(settings.output_store.as_ref(), "output_store.new")?;
        let runtime = settings
            .runtime_command
            .as_deref()
            .and_then(CommandRuntime::parse)
            .map(|runtime| Arc::new(runtime) as Arc<dyn ProcessingRuntime>);

        Self::from_parts(
            settings,
            Collaborators {
                catalog: Arc::new(database.catalog()),
                replicas: Arc::new(replicas),
                raw_store,
                output_store,
                runtime,
                broker,
                results,
            },
        )
    }

    /// Wire services over explicit collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error when the metrics registry cannot be created.
    pub fn from_parts(settings: Settings, parts: Collaborators) -> AppResult<Self> {
        let hosts = settings.host_registry();
        let locations = settings.location_resolver();
        let config = queue_config(&settings);

        let relocate = RelocateHandler::new(
            hosts.clone(),
            Arc::clone(&parts.catalog),
            Arc::clone(&parts.replicas),
            locations.clone(),
        )
        .with_work_dir(settings.work_dir.clone());
        let process = match parts.runtime {
            Some(runtime) => {
                let inputs = InputResolver::new(
                    Arc::clone(&parts.catalog),
                    Arc::clone(&parts.replicas),
                    parts.raw_store,
                    locations.clone(),
                );
                Some(
                    ProcessHandler::new(inputs, runtime, parts.output_store)
                        .with_work_dir(settings.work_dir.clone()),
                )
            }
            None => {
                warn!("COVIS_RUNTIME_COMMAND is not set; processing tasks are disabled");
                None
            }
        };
        let registry = task_registry(relocate, process);

        let mut queues: Vec<String> = Vec::new();
        for task in registry.names() {
            let queue = config.routes.queue_for(task).to_string();
            if !queues.contains(&queue) {
                queues.push(queue);
            }
        }

        let metrics =
            Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;
        let dispatcher = TaskDispatcher::new(config, parts.broker, parts.results, registry)
            .with_events(EventBus::new())
            .with_metrics(metrics.clone());

        Ok(Self {
            settings,
            catalog: parts.catalog,
            dispatcher,
            hosts,
            locations,
            queues,
            metrics,
        })
    }

    /// Loaded settings.
    #[must_use]
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run catalog.
    #[must_use]
    pub fn catalog(&self) -> Arc<dyn Catalog> {
        Arc::clone(&self.catalog)
    }

    /// Task dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    /// Validated host set.
    #[must_use]
    pub const fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }

    /// Shared counters.
    #[must_use]
    pub const fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Queues a worker built from these services consumes.
    #[must_use]
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Operator dispatch pass over these services.
    #[must_use]
    pub fn dispatch(&self) -> Dispatch {
        Dispatch::new(
            self.catalog(),
            self.dispatcher.clone(),
            self.hosts.clone(),
            self.locations.clone(),
        )
        .with_metrics(self.metrics.clone())
    }

    /// Worker named `name` consuming [`Services::queues`].
    #[must_use]
    pub fn worker(&self, name: impl Into<String>) -> Worker {
        Worker::new(self.dispatcher.clone(), name).with_queues(self.queues.clone())
    }
}

/// Entry point for the worker binary: load settings, install logging, and run
/// until interrupted.
///
/// # Errors
///
/// Returns an error if configuration, logging, wiring, or the worker fails.
pub async fn run_app() -> AppResult<()> {
    let settings = ConfigLoader::new()
        .load()
        .map_err(|err| AppError::config("settings.load", err))?;
    covis_telemetry::init_logging(&logging_config(&settings, "covis-worker"))
        .map_err(|err| AppError::telemetry("telemetry.init", err))?;
    let services = Services::connect(settings).await?;
    let event_log = spawn_event_log(services.dispatcher().events());
    let name = format!("covis-worker-{}", std::process::id());
    let result = run_worker_with(&services, name, shutdown_signal()).await;
    event_log.abort();
    result
}

/// Run a worker until `shutdown` resolves, then drain it.
///
/// # Errors
///
/// Returns the worker's first slot failure, or a result-backend failure.
pub async fn run_worker_with<F>(
    services: &Services,
    name: impl Into<String>,
    shutdown: F,
) -> AppResult<()>
where
    F: Future<Output = ()>,
{
    services
        .dispatcher()
        .purge_results()
        .await
        .map_err(|err| AppError::queue("results.purge", err))?;

    let (stop, stopped) = watch::channel(false);
    let mut worker = tokio::spawn(services.worker(name).run(stopped));

    let outcome = tokio::select! {
        joined = &mut worker => joined,
        () = shutdown => {
            info!("shutdown requested; draining worker");
            let _ = stop.send(true);
            worker.await
        }
    };
    let result = outcome
        .map_err(|source| AppError::queue("worker.join", QueueError::Join { source }))
        .and_then(|run| run.map_err(|err| AppError::queue("worker.run", err)));

    match services.metrics().render() {
        Ok(rendered) => info!(metrics = %rendered, "worker metrics at shutdown"),
        Err(err) => warn!(error = %err, "failed to render metrics"),
    }
    result
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
}

async fn database_for(
    primary: &Database,
    primary_url: &str,
    url: &str,
    timeout: Duration,
) -> AppResult<Database> {
    if url == primary_url {
        return Ok(primary.clone());
    }
    connect_database(url, timeout, "database.connect_queue").await
}

async fn connect_database(
    url: &str,
    timeout: Duration,
    operation: &'static str,
) -> AppResult<Database> {
    Database::connect(url, timeout)
        .await
        .map_err(|err| AppError::data(operation, err))
}

fn object_store(
    endpoint: Option<&Endpoint>,
    operation: &'static str,
) -> AppResult<Option<Arc<dyn ObjectStore>>> {
    endpoint
        .map(|endpoint| {
            StorageBackend::from_endpoint(endpoint)
                .map(|backend| Arc::new(backend) as Arc<dyn ObjectStore>)
                .map_err(|err| AppError::storage(operation, err))
        })
        .transpose()
}
