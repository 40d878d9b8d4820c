use std::io::Write;

use anyhow::anyhow;
use covis_app::Services;
use covis_core::{InputReference, Job, OutputTarget};
use covis_queue::{QueueError, TaskOutcome};

use crate::cli::{OutputFormat, ProcessArgs};
use crate::error::{CliError, CliResult, core_message};
use crate::output::{render_handle, write_json};

pub(crate) async fn handle_process<W: Write + Send>(
    services: &Services,
    args: &ProcessArgs,
    format: OutputFormat,
    out: &mut W,
) -> CliResult<()> {
    let input: InputReference = args
        .input
        .parse()
        .map_err(|err| CliError::validation(format!("invalid input: {}", core_message(&err))))?;
    let output: OutputTarget = args
        .output
        .parse()
        .map_err(|err| CliError::validation(format!("invalid output: {}", core_message(&err))))?;
    let job = Job::process(input, output);

    if !args.run_local {
        let handle = services
            .dispatcher()
            .submit(&job)
            .await
            .map_err(CliError::failure)?;
        return render_handle(&handle, format, out);
    }

    match services.dispatcher().submit_local(&job).await {
        Ok(TaskOutcome::Succeeded(result)) => write_json(&result, out),
        Ok(TaskOutcome::Failed(message)) => {
            Err(CliError::failure(anyhow!("processing failed: {message}")))
        }
        Err(QueueError::UnknownTask { .. }) => Err(CliError::validation(
            "processing is disabled: COVIS_RUNTIME_COMMAND is not set",
        )),
        Err(err) => Err(CliError::failure(err)),
    }
}
