use std::io::Write;

use covis_app::Services;

use crate::error::{CliError, CliResult};
use crate::output::write_json;

/// Print every catalog run as a JSON array, ordered by acquisition time.
pub(crate) async fn handle_dump<W: Write + Send>(
    services: &Services,
    out: &mut W,
) -> CliResult<()> {
    let mut runs = services
        .catalog()
        .list_runs()
        .await
        .map_err(CliError::failure)?;
    runs.sort_by(|a, b| {
        a.datetime
            .cmp(&b.datetime)
            .then_with(|| a.basename.cmp(&b.basename))
    });
    write_json(&runs, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::services_over;
    use anyhow::Result;
    use covis_test_support::MemoryCatalog;
    use covis_test_support::fixtures::{day, sample_run};
    use serde_json::Value;

    #[tokio::test]
    async fn dump_orders_runs_by_datetime() -> Result<()> {
        let mut late = sample_run("LATE", &["DMAS"]);
        late.datetime = day(2020, 6, 1);
        let early = sample_run("EARLY", &["COVIS-NAS"]);
        let services = services_over(&MemoryCatalog::with_runs([late, early]))?;

        let mut out = Vec::new();
        handle_dump(&services, &mut out)
            .await
            .map_err(|err| anyhow::anyhow!(err.display_message()))?;
        let dumped: Value = serde_json::from_slice(&out)?;
        let names: Vec<&str> = dumped
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|run| run["basename"].as_str())
            .collect();
        assert_eq!(names, vec!["EARLY", "LATE"]);
        Ok(())
    }
}
