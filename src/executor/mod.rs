//! Subprocess boundary for the external signing and registry tools.
//!
//! Every tool invocation goes through [`CommandRunner`], so the trust and
//! distribution layers can be exercised against scripted fakes.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

pub mod process;

pub use process::ProcessRunner;

/// Command execution options.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Maximum command runtime; the child is killed once it elapses.
    pub timeout: Duration,
    /// Optional working directory for the child.
    pub working_dir: Option<PathBuf>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            working_dir: None,
        }
    }
}

impl ExecOptions {
    /// Options with the given timeout and no working directory.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            working_dir: None,
        }
    }
}

/// Command execution result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Process exit code (`None` when the process was killed by a signal).
    pub exit_code: Option<i32>,
    /// Captured stdout text.
    pub stdout: String,
    /// Captured stderr text.
    pub stderr: String,
    /// Wall-clock duration of the execution.
    pub duration: Duration,
}

impl ExecResult {
    /// Returns `true` when the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Combined stdout+stderr output, separated by a newline when both are non-empty.
    pub fn output(&self) -> String {
        if self.stdout.is_empty() {
            return self.stderr.clone();
        }
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Errors produced before a command result is available.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The program is not installed or not on `PATH`.
    #[error("{program} was not found: {hint}")]
    NotFound {
        /// Program that was requested.
        program: String,
        /// Installation hint for the user.
        hint: String,
    },
    /// The program exists but could not be started.
    #[error("failed to spawn {program}: {detail}")]
    Spawn {
        /// Program that was requested.
        program: String,
        /// Error detail.
        detail: String,
    },
    /// Command execution exceeded its timeout.
    #[error("{program} timed out after {seconds}s")]
    Timeout {
        /// Program that was killed.
        program: String,
        /// Timeout budget in seconds.
        seconds: u64,
    },
}

impl ExecutorError {
    /// Replace the hint of a [`ExecutorError::NotFound`]; other variants pass through.
    #[must_use]
    pub fn with_install_hint(self, install_hint: &str) -> Self {
        match self {
            Self::NotFound { program, .. } => Self::NotFound {
                program,
                hint: install_hint.to_owned(),
            },
            other => other,
        }
    }
}

/// Runs an external program and captures its output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Execute `program` with `args`, waiting at most `opts.timeout`.
    ///
    /// A non-zero exit is not an error at this level; callers inspect
    /// [`ExecResult::exit_code`].
    async fn run(
        &self,
        program: &str,
        args: &[String],
        opts: ExecOptions,
    ) -> Result<ExecResult, ExecutorError>;
}
