//! Processing runtime that shells out to an external command.
//!
//! The command line comes from `COVIS_RUNTIME_COMMAND`; the input and output
//! directories are appended as the final two arguments.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use covis_core::{CoreError, CoreResult, ProcessingRuntime};
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Runtime invoking `program args.. <input_dir> <output_dir>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRuntime {
    program: String,
    args: Vec<String>,
}

impl CommandRuntime {
    /// Parse a whitespace-separated command line. Returns `None` when it is empty.
    #[must_use]
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut words = command_line.split_whitespace().map(str::to_string);
        let program = words.next()?;
        Some(Self {
            program,
            args: words.collect(),
        })
    }

    /// Executable name.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl ProcessingRuntime for CommandRuntime {
    fn metadata(&self) -> Value {
        json!({
            "runtime": "command",
            "command": self.program,
            "args": self.args,
            "worker_version": env!("CARGO_PKG_VERSION"),
            "build_sha": covis_telemetry::build_sha(),
        })
    }

    async fn process(&self, input_dir: &Path, output_dir: &Path) -> CoreResult<()> {
        info!(
            program = %self.program,
            input = %input_dir.display(),
            output = %output_dir.display(),
            "running processing command"
        );
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(input_dir)
            .arg(output_dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| CoreError::collaborator("runtime.spawn", err))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(program = %self.program, stdout = %stdout.trim(), "processing command output");
        }
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(
            program = %self.program,
            status = %output.status,
            stderr = %stderr.trim(),
            "processing command failed"
        );
        Err(CoreError::collaborator(
            "runtime.process",
            format!("'{}' exited with {}", self.program, output.status),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    type TestResult<T> = Result<T>;

    #[test]
    fn command_line_is_split_on_whitespace() -> TestResult<()> {
        let runtime = CommandRuntime::parse("  covis-postprocess --plot  ")
            .ok_or_else(|| anyhow::anyhow!("expected a runtime"))?;
        assert_eq!(runtime.program(), "covis-postprocess");
        assert_eq!(runtime.metadata()["args"], json!(["--plot"]));
        assert!(CommandRuntime::parse("   ").is_none());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_receives_input_and_output_directories() -> TestResult<()> {
        let input = tempfile::tempdir()?;
        let output = tempfile::tempdir()?;
        tokio::fs::write(input.path().join("ping.bin"), b"ping").await?;

        let runtime = CommandRuntime::parse("cp -R")
            .ok_or_else(|| anyhow::anyhow!("expected a runtime"))?;
        let target = output.path().join("copy");
        runtime.process(input.path(), &target).await?;
        assert_eq!(tokio::fs::read(target.join("ping.bin")).await?, b"ping");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_a_collaborator_failure() -> TestResult<()> {
        let dir = tempfile::tempdir()?;
        let runtime =
            CommandRuntime::parse("false").ok_or_else(|| anyhow::anyhow!("expected a runtime"))?;
        let err = runtime
            .process(dir.path(), dir.path())
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected failure"))?;
        assert!(matches!(err, CoreError::Collaborator { .. }));
        assert!(!err.is_transient());
        Ok(())
    }
}
