//! Operator dispatch pass: plan relocations over the catalog and hand them to
//! the dispatcher.
//!
//! # Design
//! - The router is built, and therefore every host validated, before the
//!   catalog is queried.
//! - Runs stream through the planner one at a time; only a sample reservoir is
//!   ever buffered.
//! - Per-run outcomes are isolated: a failed local task is reported in the
//!   summary and the pass moves on. Broker and catalog failures abort it.

use std::io::Write;
use std::sync::Arc;

use covis_core::{
    Catalog, DispatchMode, HostRegistry, JobRouter, LocationResolver, PlanStats, RouteDecision,
    RouterOptions,
};
use covis_queue::{TaskDispatcher, TaskHandle, TaskOutcome};
use covis_telemetry::Metrics;
use serde::Serialize;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};

/// Options for one dispatch pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Destination host name, validated before any catalog access.
    pub destination: String,
    /// Dispatch at most this many runs. Zero means all of them.
    pub count: usize,
    /// Queue, local execution, or dry run.
    pub mode: DispatchMode,
    /// Skip runs whose only replica is on this host.
    pub skip_sole_source: Option<String>,
    /// Let the catalog draw the sample instead of sampling after filtering.
    pub catalog_sample: bool,
    /// Seed for reproducible client-side sampling.
    pub seed: Option<u64>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            destination: "COVIS-NAS".to_string(),
            count: 0,
            mode: DispatchMode::Queue,
            skip_sole_source: None,
            catalog_sample: false,
            seed: None,
        }
    }
}

/// What a dispatch pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchSummary {
    /// Planner counters.
    pub stats: PlanStats,
    /// Tasks published to the broker.
    pub submitted: Vec<TaskHandle>,
    /// Runs relocated in-process.
    pub completed: Vec<String>,
    /// Runs whose in-process relocation failed, with the failure.
    pub failed: Vec<(String, String)>,
    /// Runs reported by a dry run.
    pub reported: Vec<String>,
}

/// Collaborators a dispatch pass needs.
#[derive(Clone)]
pub struct Dispatch {
    catalog: Arc<dyn Catalog>,
    dispatcher: TaskDispatcher,
    hosts: HostRegistry,
    locations: LocationResolver,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Dispatch")
            .field("dispatcher", &self.dispatcher)
            .field("hosts", &self.hosts)
            .finish_non_exhaustive()
    }
}

impl Dispatch {
    /// Dispatch pass over explicit collaborators.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn Catalog>,
        dispatcher: TaskDispatcher,
        hosts: HostRegistry,
        locations: LocationResolver,
    ) -> Self {
        Self {
            catalog,
            dispatcher,
            hosts,
            locations,
            metrics: None,
        }
    }

    /// Count route decisions in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Dispatcher used for queue and local modes.
    #[must_use]
    pub const fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    /// Plan and dispatch relocations, writing dry-run lines to `out`.
    ///
    /// # Errors
    ///
    /// - Unknown destination or skip host, before any catalog query.
    /// - Catalog, broker, or result-backend failures.
    /// - Failure to write dry-run output.
    pub async fn run<W: Write + Send>(
        &self,
        options: &DispatchOptions,
        out: &mut W,
    ) -> AppResult<DispatchSummary> {
        let catalog_sample = options.catalog_sample && options.count > 0;
        let router = JobRouter::new(
            &self.hosts,
            self.locations.clone(),
            &options.destination,
            RouterOptions {
                skip_sole_source_host: options.skip_sole_source.clone(),
                sample_size: if catalog_sample { 0 } else { options.count },
                seed: options.seed,
                mode: options.mode,
            },
        )
        .map_err(|err| AppError::core("router.new", err))?;
        let destination = router.destination().name().to_string();
        info!(
            destination = %destination,
            mode = ?options.mode,
            count = options.count,
            catalog_sample,
            "dispatch pass starting"
        );

        let mut planner = router.planner();
        let mut summary = DispatchSummary::default();

        if catalog_sample {
            let runs = self
                .catalog
                .sample_runs_needing_relocation(&destination, options.count)
                .await
                .map_err(|err| AppError::core("catalog.sample_runs", err))?;
            info!(sampled = runs.len(), "catalog drew relocation sample");
            for run in runs {
                if let Some(decision) = planner.offer(run) {
                    self.apply(decision, options.mode, &mut summary, out).await?;
                }
            }
        } else {
            let mut runs = self
                .catalog
                .runs_needing_relocation(&destination)
                .await
                .map_err(|err| AppError::core("catalog.runs_needing_relocation", err))?;
            while let Some(run) = runs.next().await {
                let run = run.map_err(|err| AppError::core("catalog.stream", err))?;
                if let Some(decision) = planner.offer(run) {
                    self.apply(decision, options.mode, &mut summary, out).await?;
                }
            }
        }
        for decision in planner.finish() {
            self.apply(decision, options.mode, &mut summary, out).await?;
        }

        summary.stats = planner.stats();
        info!(
            considered = summary.stats.considered,
            emitted = summary.stats.emitted,
            submitted = summary.submitted.len(),
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            reported = summary.reported.len(),
            "dispatch pass finished"
        );
        Ok(summary)
    }

    async fn apply<W: Write + Send>(
        &self,
        decision: RouteDecision,
        mode: DispatchMode,
        summary: &mut DispatchSummary,
        out: &mut W,
    ) -> AppResult<()> {
        if let Some(metrics) = &self.metrics {
            metrics.inc_route_decision(decision.label());
        }
        match decision {
            RouteDecision::DryRun {
                basename,
                locations,
                source,
            } => {
                let hosts: Vec<&str> = locations.iter().map(|loc| loc.host.as_str()).collect();
                writeln!(out, "would relocate {basename} from {}", hosts.join(", ")).map_err(
                    |err| AppError::Io {
                        operation: "dispatch.dry_run",
                        path: None,
                        source: err,
                    },
                )?;
                info!(
                    basename = %basename,
                    source = source.as_ref().map_or("none", |loc| loc.host.as_str()),
                    "dry run: would relocate"
                );
                summary.reported.push(basename);
            }
            RouteDecision::Dispatch(job) => {
                let basename = job.basename().unwrap_or_default().to_string();
                if mode == DispatchMode::Local {
                    let outcome = self
                        .dispatcher
                        .submit_local(&job)
                        .await
                        .map_err(|err| AppError::queue("dispatcher.submit_local", err))?;
                    match outcome {
                        TaskOutcome::Succeeded(_) => summary.completed.push(basename),
                        TaskOutcome::Failed(error) => {
                            warn!(basename = %basename, error = %error, "local relocation failed");
                            summary.failed.push((basename, error));
                        }
                    }
                } else {
                    let handle = self
                        .dispatcher
                        .submit(&job)
                        .await
                        .map_err(|err| AppError::queue("dispatcher.submit", err))?;
                    summary.submitted.push(handle);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{RelocateHandler, task_registry};
    use anyhow::Result;
    use covis_core::{ArchiveFormat, CoreError, RawLocation, Run};
    use covis_queue::{MemoryBroker, MemoryResultBackend, QueueConfig};
    use covis_test_support::fixtures::{day, sample_run, write_tar_gz};
    use covis_test_support::{MemoryCatalog, MemoryReplicaStore};
    use std::time::Duration;

    type TestResult<T> = Result<T>;

    struct Fixture {
        dispatch: Dispatch,
        catalog: MemoryCatalog,
        replicas: MemoryReplicaStore,
        broker: Arc<MemoryBroker>,
        metrics: Metrics,
    }

    fn fixture(runs: Vec<Run>, hosts: HostRegistry) -> TestResult<Fixture> {
        let catalog = MemoryCatalog::with_runs(runs);
        let replicas = MemoryReplicaStore::new();
        let broker = Arc::new(MemoryBroker::new());
        let relocate = RelocateHandler::new(
            hosts.clone(),
            Arc::new(catalog.clone()),
            Arc::new(replicas.clone()),
            LocationResolver::new(),
        );
        let dispatcher = TaskDispatcher::new(
            QueueConfig::default(),
            broker.clone(),
            Arc::new(MemoryResultBackend::new(Duration::from_secs(60))),
            task_registry(relocate, None),
        );
        let metrics = Metrics::new()?;
        let dispatch = Dispatch::new(
            Arc::new(catalog.clone()),
            dispatcher,
            hosts,
            LocationResolver::new(),
        )
        .with_metrics(metrics.clone());
        Ok(Fixture {
            dispatch,
            catalog,
            replicas,
            broker,
            metrics,
        })
    }

    fn scenario() -> Vec<Run> {
        vec![
            sample_run("A", &["COVIS-NAS"]),
            sample_run("B", &["DMAS"]),
            sample_run("C", &["DMAS", "COVIS-NAS"]),
        ]
    }

    #[tokio::test]
    async fn only_the_run_missing_from_destination_is_submitted() -> TestResult<()> {
        let fixture = fixture(scenario(), HostRegistry::default())?;
        let mut out = Vec::new();

        let summary = fixture
            .dispatch
            .run(&DispatchOptions::default(), &mut out)
            .await?;
        assert_eq!(summary.submitted.len(), 1);
        assert_eq!(summary.submitted[0].task, "relocation.relocate");
        assert_eq!(summary.stats.emitted, 1);
        assert_eq!(fixture.broker.pending("relocate"), 1);

        let message = fixture
            .broker
            .messages()
            .pop()
            .ok_or_else(|| anyhow::anyhow!("message published"))?;
        assert_eq!(message.args, vec![serde_json::json!("B"), serde_json::json!("COVIS-NAS")]);
        assert!(out.is_empty());
        assert_eq!(fixture.metrics.snapshot().route_decisions_total, 1);
        Ok(())
    }

    #[tokio::test]
    async fn dry_run_reports_without_submitting() -> TestResult<()> {
        let fixture = fixture(scenario(), HostRegistry::default())?;
        let mut out = Vec::new();
        let options = DispatchOptions {
            mode: DispatchMode::DryRun,
            ..DispatchOptions::default()
        };

        let summary = fixture.dispatch.run(&options, &mut out).await?;
        assert!(summary.submitted.is_empty());
        assert_eq!(summary.reported, vec!["B".to_string()]);
        assert_eq!(fixture.broker.outstanding(), 0);
        assert_eq!(String::from_utf8(out)?, "would relocate B from DMAS\n");
        Ok(())
    }

    #[tokio::test]
    async fn sole_source_runs_are_left_alone() -> TestResult<()> {
        let hosts = HostRegistry::new(["COVIS-NAS", "DMAS", "ONC-ARCHIVE"]);
        let runs = vec![
            sample_run("A", &["DMAS"]),
            sample_run("B", &["DMAS", "ONC-ARCHIVE"]),
            sample_run("C", &["COVIS-NAS"]),
        ];
        let fixture = fixture(runs, hosts)?;
        let options = DispatchOptions {
            skip_sole_source: Some("DMAS".to_string()),
            ..DispatchOptions::default()
        };

        let summary = fixture.dispatch.run(&options, &mut Vec::new()).await?;
        assert_eq!(summary.stats.skipped_sole_source, 1);
        assert_eq!(summary.submitted.len(), 1);
        let message = fixture
            .broker
            .messages()
            .pop()
            .ok_or_else(|| anyhow::anyhow!("message published"))?;
        assert_eq!(message.args[0], serde_json::json!("B"));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_hosts_fail_before_the_catalog_is_read() -> TestResult<()> {
        let fixture = fixture(scenario(), HostRegistry::default())?;
        let options = DispatchOptions {
            destination: "not-a-host".to_string(),
            ..DispatchOptions::default()
        };

        let err = fixture.dispatch.run(&options, &mut Vec::new()).await.err();
        assert!(matches!(
            err,
            Some(AppError::Core {
                source: CoreError::UnknownHost { .. },
                ..
            })
        ));
        assert!(err.is_some_and(|err| err.is_validation()));
        assert_eq!(fixture.catalog.query_count(), 0);
        assert_eq!(fixture.broker.outstanding(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn count_bounds_the_number_of_jobs() -> TestResult<()> {
        let runs = (0..10)
            .map(|index| sample_run(&format!("R{index}"), &["DMAS"]))
            .collect();
        let fixture = fixture(runs, HostRegistry::default())?;
        let options = DispatchOptions {
            count: 3,
            seed: Some(7),
            ..DispatchOptions::default()
        };

        let summary = fixture.dispatch.run(&options, &mut Vec::new()).await?;
        assert_eq!(summary.submitted.len(), 3);
        assert_eq!(summary.stats.eligible, 10);
        assert_eq!(summary.stats.sampled_out, 7);
        Ok(())
    }

    #[tokio::test]
    async fn catalog_sampling_asks_the_catalog_for_the_sample() -> TestResult<()> {
        let runs = (0..10)
            .map(|index| sample_run(&format!("R{index}"), &["DMAS"]))
            .collect();
        let fixture = fixture(runs, HostRegistry::default())?;
        let options = DispatchOptions {
            count: 4,
            catalog_sample: true,
            ..DispatchOptions::default()
        };

        let summary = fixture.dispatch.run(&options, &mut Vec::new()).await?;
        assert_eq!(summary.submitted.len(), 4);
        assert_eq!(summary.stats.considered, 4);
        assert_eq!(fixture.catalog.query_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn local_mode_relocates_in_process_and_reports_failures() -> TestResult<()> {
        let scratch = tempfile::tempdir()?;
        let archive = scratch.path().join("B.tar.gz");
        write_tar_gz(&archive, &[("B/", b""), ("B/ping.bin", b"ping")])?;

        let mut good = Run::new("B", day(2019, 1, 1));
        good.push_location(RawLocation::new("DMAS", "B.tar.gz", ArchiveFormat::TarGz));
        let missing = sample_run("M", &["DMAS"]);
        let fixture = fixture(vec![good, missing], HostRegistry::default())?;
        fixture.replicas.insert_file("DMAS", "B.tar.gz", &archive)?;

        let options = DispatchOptions {
            mode: DispatchMode::Local,
            ..DispatchOptions::default()
        };
        let summary = fixture.dispatch.run(&options, &mut Vec::new()).await?;

        assert_eq!(summary.completed, vec!["B".to_string()]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "M");
        assert!(summary.submitted.is_empty());
        assert_eq!(fixture.broker.outstanding(), 0);
        assert!(fixture.replicas.contains("COVIS-NAS", "2019/01/01/B.tar.gz"));
        Ok(())
    }
}
