use std::io::Write;

use covis_app::Services;
use covis_app::bootstrap::BackendKind;
use covis_app::dispatch::DispatchOptions;
use covis_core::{DispatchMode, HostRegistry};
use tracing::warn;

use crate::cli::{OutputFormat, QueueRezipArgs};
use crate::error::{CliError, CliResult, core_message};
use crate::output::render_summary;

const DMAS: &str = "DMAS";

impl QueueRezipArgs {
    fn skip_host(&self) -> Option<String> {
        if self.skip_dmas {
            return Some(DMAS.to_string());
        }
        self.skip_sole_source.clone()
    }

    fn mode(&self) -> DispatchMode {
        if self.dry_run {
            DispatchMode::DryRun
        } else if self.run_local {
            DispatchMode::Local
        } else {
            DispatchMode::Queue
        }
    }

    pub(crate) fn options(&self) -> DispatchOptions {
        DispatchOptions {
            destination: self.dest_host.clone(),
            count: self.count,
            mode: self.mode(),
            skip_sole_source: self.skip_host(),
            catalog_sample: self.catalog_sample,
            seed: self.seed,
        }
    }
}

/// Reject unknown destination or skip hosts before anything is contacted.
pub(crate) fn validate_hosts(args: &QueueRezipArgs, hosts: &HostRegistry) -> CliResult<()> {
    let options = args.options();
    let named = std::iter::once(options.destination.as_str())
        .chain(options.skip_sole_source.as_deref());
    for host in named {
        hosts.resolve(host).map_err(|err| {
            CliError::validation(format!(
                "{}; known hosts: {}",
                core_message(&err),
                hosts
                    .hosts()
                    .iter()
                    .map(|known| known.name().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;
    }
    Ok(())
}

pub(crate) async fn handle_queue_rezip<W: Write + Send>(
    services: &Services,
    args: &QueueRezipArgs,
    format: OutputFormat,
    out: &mut W,
) -> CliResult<()> {
    let options = args.options();
    if options.mode == DispatchMode::Queue
        && BackendKind::from_url(&services.settings().queue.broker_url)
            .is_ok_and(|kind| kind == BackendKind::Memory)
    {
        warn!("broker is in-memory; queued relocations are lost when this command exits");
    }
    let summary = services.dispatch().run(&options, out).await?;
    if options.mode != DispatchMode::DryRun {
        render_summary(&summary, format, out)?;
    }
    if summary.failed.is_empty() {
        Ok(())
    } else {
        Err(CliError::failure(anyhow::anyhow!(
            "{} of {} local relocations failed",
            summary.failed.len(),
            summary.failed.len() + summary.completed.len()
        )))
    }
}
