//! Relocation planning over a stream of catalog runs.
//!
//! # Design
//! - Host arguments are validated in [`JobRouter::new`], before any catalog access.
//! - Filters run in a fixed order: relocation need, duplicate basename, sole-source
//!   skip, then sampling over the survivors.
//! - Sampling is a single-pass reservoir so the input never has to be buffered.
//! - The router only reads runs; it never edits replica lists.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::CoreResult;
use crate::hosts::{Host, HostRegistry};
use crate::location::{LocationResolver, is_sole_source, needs_relocation};
use crate::model::{Job, RawLocation, Run};

/// How planned relocations are carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Publish each job to the broker.
    #[default]
    Queue,
    /// Execute each job in the calling process.
    Local,
    /// Report what would happen without producing jobs.
    DryRun,
}

/// Caller-supplied planning knobs.
#[derive(Debug, Clone, Default)]
pub struct RouterOptions {
    /// Skip runs whose only replica is on this host.
    pub skip_sole_source_host: Option<String>,
    /// Dispatch at most this many runs, chosen uniformly. Zero disables sampling.
    pub sample_size: usize,
    /// Seed for reproducible sampling.
    pub seed: Option<u64>,
    /// Dispatch mode for produced decisions.
    pub mode: DispatchMode,
}

/// Outcome for one run that survived every filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Hand the job to the dispatcher.
    Dispatch(Job),
    /// Dry run: report the relocation without producing a job.
    DryRun {
        /// Run that would be relocated.
        basename: String,
        /// Replicas the run currently has.
        locations: Vec<RawLocation>,
        /// Replica a relocation would read from.
        source: Option<RawLocation>,
    },
}

impl RouteDecision {
    /// Short label used for metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Dispatch(_) => "dispatch",
            Self::DryRun { .. } => "dry_run",
        }
    }

    /// Run the decision concerns.
    #[must_use]
    pub fn basename(&self) -> Option<&str> {
        match self {
            Self::Dispatch(job) => job.basename(),
            Self::DryRun { basename, .. } => Some(basename),
        }
    }
}

/// Counters describing a completed or in-progress plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanStats {
    /// Runs offered to the planner.
    pub considered: usize,
    /// Runs already present on the destination.
    pub already_present: usize,
    /// Runs whose basename was offered more than once.
    pub duplicates: usize,
    /// Runs skipped because their only copy lives on the skip host.
    pub skipped_sole_source: usize,
    /// Runs that passed every filter before sampling.
    pub eligible: usize,
    /// Eligible runs dropped by sampling.
    pub sampled_out: usize,
    /// Decisions emitted.
    pub emitted: usize,
}

/// Validated planning configuration.
#[derive(Debug, Clone)]
pub struct JobRouter {
    resolver: LocationResolver,
    destination: Host,
    skip_sole_source: Option<Host>,
    options: RouterOptions,
}

impl JobRouter {
    /// Validate hosts and build a router.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::UnknownHost`] when the destination or the
    /// sole-source skip host is not registered.
    pub fn new(
        registry: &HostRegistry,
        resolver: LocationResolver,
        destination: &str,
        options: RouterOptions,
    ) -> CoreResult<Self> {
        let destination = registry.resolve(destination)?;
        let skip_sole_source = options
            .skip_sole_source_host
            .as_deref()
            .map(|host| registry.resolve(host))
            .transpose()?;
        Ok(Self {
            resolver,
            destination,
            skip_sole_source,
            options,
        })
    }

    /// Validated destination host.
    #[must_use]
    pub const fn destination(&self) -> &Host {
        &self.destination
    }

    /// Dispatch mode the router was configured with.
    #[must_use]
    pub const fn mode(&self) -> DispatchMode {
        self.options.mode
    }

    /// Incremental planner for callers that receive runs asynchronously.
    #[must_use]
    pub fn planner(&self) -> Planner {
        let rng = self
            .options
            .seed
            .map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);
        Planner {
            router: self.clone(),
            seen: HashSet::new(),
            reservoir: Vec::new(),
            rng,
            stats: PlanStats::default(),
        }
    }

    /// Lazily plan over `runs`.
    pub fn plan<I>(&self, runs: I) -> Plan<I::IntoIter>
    where
        I: IntoIterator<Item = Run>,
    {
        Plan {
            runs: runs.into_iter(),
            planner: self.planner(),
            sampled: None,
        }
    }

    fn decide(&self, run: Run) -> RouteDecision {
        match self.options.mode {
            DispatchMode::DryRun => {
                let source = self
                    .resolver
                    .best_replica_excluding(&run.raw, self.destination.name())
                    .cloned();
                RouteDecision::DryRun {
                    basename: run.basename,
                    locations: run.raw,
                    source,
                }
            }
            DispatchMode::Queue | DispatchMode::Local => {
                RouteDecision::Dispatch(Job::relocate(run.basename, self.destination.name()))
            }
        }
    }
}

/// Push-driven planning state.
#[derive(Debug)]
pub struct Planner {
    router: JobRouter,
    seen: HashSet<String>,
    reservoir: Vec<Run>,
    rng: StdRng,
    stats: PlanStats,
}

impl Planner {
    /// Offer one run.
    ///
    /// Without sampling the decision is returned immediately. With sampling the
    /// run may be held back until [`Planner::finish`].
    pub fn offer(&mut self, run: Run) -> Option<RouteDecision> {
        self.stats.considered += 1;
        let destination = self.router.destination.name();

        if !needs_relocation(&run.raw, destination) {
            self.stats.already_present += 1;
            debug!(basename = %run.basename, host = destination, "run already on destination");
            return None;
        }
        if !self.seen.insert(run.basename.clone()) {
            self.stats.duplicates += 1;
            debug!(basename = %run.basename, "duplicate run ignored");
            return None;
        }
        if let Some(skip) = &self.router.skip_sole_source
            && is_sole_source(&run.raw, skip.name())
        {
            self.stats.skipped_sole_source += 1;
            info!(
                basename = %run.basename,
                host = skip.name(),
                "skipping run whose only copy is on the skip host"
            );
            return None;
        }

        self.stats.eligible += 1;
        let capacity = self.router.options.sample_size;
        if capacity == 0 {
            return Some(self.emit(run));
        }
        if self.reservoir.len() < capacity {
            self.reservoir.push(run);
        } else {
            let slot = self.rng.random_range(0..self.stats.eligible);
            if let Some(evicted) = self.reservoir.get_mut(slot) {
                *evicted = run;
            }
        }
        None
    }

    /// Release decisions held back for sampling.
    pub fn finish(&mut self) -> Vec<RouteDecision> {
        let sampled = std::mem::take(&mut self.reservoir);
        if self.router.options.sample_size > 0 {
            self.stats.sampled_out = self.stats.eligible - sampled.len();
            info!(
                eligible = self.stats.eligible,
                sampled = sampled.len(),
                "sampled runs for relocation"
            );
        }
        sampled.into_iter().map(|run| self.emit(run)).collect()
    }

    /// Counters accumulated so far.
    #[must_use]
    pub const fn stats(&self) -> PlanStats {
        self.stats
    }

    fn emit(&mut self, run: Run) -> RouteDecision {
        self.stats.emitted += 1;
        self.router.decide(run)
    }
}

/// Lazy iterator of [`RouteDecision`]s over a run source.
#[derive(Debug)]
pub struct Plan<I> {
    runs: I,
    planner: Planner,
    sampled: Option<std::vec::IntoIter<RouteDecision>>,
}

impl<I> Plan<I> {
    /// Counters accumulated so far.
    #[must_use]
    pub const fn stats(&self) -> PlanStats {
        self.planner.stats()
    }
}

impl<I> Iterator for Plan<I>
where
    I: Iterator<Item = Run>,
{
    type Item = RouteDecision;

    fn next(&mut self) -> Option<Self::Item> {
        if self.sampled.is_none() {
            for run in self.runs.by_ref() {
                if let Some(decision) = self.planner.offer(run) {
                    return Some(decision);
                }
            }
            self.sampled = Some(self.planner.finish().into_iter());
        }
        self.sampled.as_mut().and_then(Iterator::next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::model::{ArchiveFormat, JobArgs};
    use anyhow::Result;
    use chrono::{TimeZone, Utc};

    type TestResult<T> = Result<T>;

    fn run(basename: &str, hosts: &[&str]) -> Run {
        let datetime = Utc
            .with_ymd_and_hms(2019, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default();
        let mut run = Run::new(basename, datetime);
        for host in hosts {
            run.push_location(RawLocation::new(
                *host,
                format!("{basename}.7z"),
                ArchiveFormat::SevenZip,
            ));
        }
        run
    }

    fn scenario() -> Vec<Run> {
        vec![
            run("A", &["COVIS-NAS"]),
            run("B", &["DMAS"]),
            run("C", &["DMAS", "COVIS-NAS"]),
        ]
    }

    fn router(options: RouterOptions) -> TestResult<JobRouter> {
        Ok(JobRouter::new(
            &HostRegistry::default(),
            LocationResolver::new(),
            "COVIS-NAS",
            options,
        )?)
    }

    #[test]
    fn only_the_run_missing_from_destination_is_dispatched() -> TestResult<()> {
        let router = router(RouterOptions::default())?;
        let decisions: Vec<_> = router.plan(scenario()).collect();
        assert_eq!(decisions, vec![RouteDecision::Dispatch(Job::relocate("B", "COVIS-NAS"))]);
        Ok(())
    }

    #[test]
    fn runs_present_on_destination_or_only_on_skipped_host_yield_no_jobs() -> TestResult<()> {
        let router = router(RouterOptions {
            skip_sole_source_host: Some("DMAS".into()),
            ..RouterOptions::default()
        })?;
        let runs = vec![
            run("A", &["DMAS"]),
            run("B", &["DMAS", "COVIS-NAS"]),
            run("C", &["COVIS-NAS"]),
        ];
        let mut plan = router.plan(runs);
        assert_eq!(plan.by_ref().count(), 0);
        assert_eq!(plan.stats().already_present, 2);
        assert_eq!(plan.stats().skipped_sole_source, 1);
        assert_eq!(plan.stats().emitted, 0);
        Ok(())
    }

    #[test]
    fn dry_run_reports_without_jobs() -> TestResult<()> {
        let router = router(RouterOptions {
            mode: DispatchMode::DryRun,
            ..RouterOptions::default()
        })?;
        let mut plan = router.plan(scenario());
        let decisions: Vec<_> = plan.by_ref().collect();
        assert_eq!(decisions.len(), 1);
        match &decisions[0] {
            RouteDecision::DryRun {
                basename,
                locations,
                source,
            } => {
                assert_eq!(basename, "B");
                assert_eq!(locations.len(), 1);
                assert_eq!(source.as_ref().map(|l| l.host.as_str()), Some("DMAS"));
            }
            other => panic!("unexpected decision {other:?}"),
        }
        assert_eq!(plan.stats().already_present, 2);
        assert_eq!(plan.stats().emitted, 1);
        Ok(())
    }

    #[test]
    fn unknown_destination_fails_before_any_run_is_read() {
        let result = JobRouter::new(
            &HostRegistry::default(),
            LocationResolver::new(),
            "not-a-host",
            RouterOptions::default(),
        );
        assert!(matches!(result, Err(CoreError::UnknownHost { host }) if host == "not-a-host"));

        let result = JobRouter::new(
            &HostRegistry::default(),
            LocationResolver::new(),
            "COVIS-NAS",
            RouterOptions {
                skip_sole_source_host: Some("nowhere".into()),
                ..RouterOptions::default()
            },
        );
        assert!(matches!(result, Err(CoreError::UnknownHost { .. })));
    }

    #[test]
    fn sole_source_runs_are_skipped_and_counted() -> TestResult<()> {
        let router = router(RouterOptions {
            skip_sole_source_host: Some("DMAS".into()),
            ..RouterOptions::default()
        })?;
        let runs = vec![run("B", &["DMAS"]), run("D", &["DMAS", "OLD"])];
        let mut plan = router.plan(runs);
        let decisions: Vec<_> = plan.by_ref().collect();
        assert_eq!(decisions, vec![RouteDecision::Dispatch(Job::relocate("D", "COVIS-NAS"))]);
        assert_eq!(plan.stats().skipped_sole_source, 1);
        Ok(())
    }

    #[test]
    fn sampling_returns_min_of_count_and_eligible_distinct_runs() -> TestResult<()> {
        let runs: Vec<Run> = (0..50).map(|i| run(&format!("R{i:02}"), &["DMAS"])).collect();
        for (sample_size, expected) in [(10, 10), (50, 50), (80, 50)] {
            let router = router(RouterOptions {
                sample_size,
                seed: Some(7),
                ..RouterOptions::default()
            })?;
            let mut plan = router.plan(runs.clone());
            let basenames: HashSet<String> = plan
                .by_ref()
                .filter_map(|decision| decision.basename().map(str::to_string))
                .collect();
            assert_eq!(basenames.len(), expected);
            assert_eq!(plan.stats().sampled_out, 50 - expected);
        }
        Ok(())
    }

    #[test]
    fn seeded_sampling_is_reproducible() -> TestResult<()> {
        let runs: Vec<Run> = (0..30).map(|i| run(&format!("R{i:02}"), &["DMAS"])).collect();
        let options = RouterOptions {
            sample_size: 5,
            seed: Some(42),
            ..RouterOptions::default()
        };
        let first: Vec<_> = router(options.clone())?.plan(runs.clone()).collect();
        let second: Vec<_> = router(options)?.plan(runs).collect();
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn duplicate_basenames_are_planned_once() -> TestResult<()> {
        let router = router(RouterOptions::default())?;
        let mut plan = router.plan(vec![run("B", &["DMAS"]), run("B", &["DMAS"])]);
        assert_eq!(plan.by_ref().count(), 1);
        assert_eq!(plan.stats().duplicates, 1);
        Ok(())
    }

    #[test]
    fn planner_supports_push_driven_use() -> TestResult<()> {
        let router = router(RouterOptions {
            sample_size: 1,
            seed: Some(1),
            ..RouterOptions::default()
        })?;
        let mut planner = router.planner();
        for candidate in scenario() {
            assert!(planner.offer(candidate).is_none());
        }
        let decisions = planner.finish();
        assert_eq!(decisions.len(), 1);
        match &decisions[0] {
            RouteDecision::Dispatch(Job {
                args: JobArgs::Relocate { basename, destination },
                ..
            }) => {
                assert_eq!(basename, "B");
                assert_eq!(destination, "COVIS-NAS");
            }
            other => panic!("unexpected decision {other:?}"),
        }
        Ok(())
    }
}
