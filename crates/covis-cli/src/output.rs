//! Output renderers and formatting helpers for CLI commands.

use std::io::Write;

use anyhow::anyhow;
use covis_app::DispatchSummary;
use covis_queue::TaskHandle;
use serde::Serialize;

use crate::cli::OutputFormat;
use crate::error::{CliError, CliResult};

pub(crate) fn render_summary<W: Write>(
    summary: &DispatchSummary,
    format: OutputFormat,
    out: &mut W,
) -> CliResult<()> {
    match format {
        OutputFormat::Json => write_json(summary, out),
        OutputFormat::Table => {
            for handle in &summary.submitted {
                write_line(out, &format!("queued {} on {}", handle.id, handle.queue))?;
            }
            for basename in &summary.completed {
                write_line(out, &format!("relocated {basename}"))?;
            }
            for (basename, error) in &summary.failed {
                write_line(out, &format!("failed {basename}: {error}"))?;
            }
            let stats = &summary.stats;
            write_line(
                out,
                &format!(
                    "considered {} eligible {} skipped {} emitted {}",
                    stats.considered, stats.eligible, stats.skipped_sole_source, stats.emitted
                ),
            )
        }
    }
}

pub(crate) fn render_handle<W: Write>(
    handle: &TaskHandle,
    format: OutputFormat,
    out: &mut W,
) -> CliResult<()> {
    match format {
        OutputFormat::Json => write_json(handle, out),
        OutputFormat::Table => write_line(
            out,
            &format!("queued {} {} on {}", handle.task, handle.id, handle.queue),
        ),
    }
}

pub(crate) fn write_json<W: Write, T: Serialize + ?Sized>(value: &T, out: &mut W) -> CliResult<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| CliError::failure(anyhow!("failed to format JSON: {err}")))?;
    write_line(out, &text)
}

pub(crate) fn write_line<W: Write>(out: &mut W, line: &str) -> CliResult<()> {
    writeln!(out, "{line}")
        .map_err(|err| CliError::failure(anyhow!("failed to write output: {err}")))
}
