//! Host subprocess runner backed by `tokio::process`.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use super::{CommandRunner, ExecOptions, ExecResult, ExecutorError};

/// Runs programs directly on the host, killing them on timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Create a host process runner.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        opts: ExecOptions,
    ) -> Result<ExecResult, ExecutorError> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &opts.working_dir {
            cmd.current_dir(dir);
        }

        debug!(program = %program, args = ?args, "running external tool");
        let started = Instant::now();

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecutorError::NotFound {
                    program: program.to_owned(),
                    hint: "make sure it is installed and on PATH".to_owned(),
                }
            } else {
                ExecutorError::Spawn {
                    program: program.to_owned(),
                    detail: e.to_string(),
                }
            }
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(opts.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ExecutorError::Spawn {
                program: program.to_owned(),
                detail: e.to_string(),
            })?,
            Err(_) => {
                return Err(ExecutorError::Timeout {
                    program: program.to_owned(),
                    seconds: opts.timeout.as_secs(),
                });
            }
        };

        let result = ExecResult {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: started.elapsed(),
        };
        debug!(
            program = %program,
            exit_code = ?result.exit_code,
            duration_ms = %result.duration.as_millis(),
            "external tool finished"
        );
        Ok(result)
    }
}
