//! Error taxonomy shared by every pipeline stage.
//!
//! Nothing in the library downgrades or swallows these; the binary wraps
//! them with `anyhow` context and exits non-zero.

use std::path::PathBuf;

use thiserror::Error;

use crate::executor::ExecutorError;
use crate::trust::verifier_output::VerifierOutputError;

/// Convenience alias used across the crate.
pub type Result<T, E = ConfcomError> = std::result::Result<T, E>;

/// Top-level error for compile, sign and distribute operations.
#[derive(Debug, Error)]
pub enum ConfcomError {
    /// Invalid or missing input supplied by the caller.
    #[error("invalid input: {0}")]
    UserInput(String),

    /// Filesystem failure on a specific path.
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        /// Path being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// JSON that could not be parsed or produced.
    #[error("malformed JSON in {context}: {source}")]
    Json {
        /// What was being parsed.
        context: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// Trust failure: signature, SVN or registry authorization.
    #[error(transparent)]
    Trust(#[from] TrustError),

    /// An external tool exited with a non-zero status.
    #[error("{tool} failed (exit code {exit_code:?}): {stderr}")]
    ExternalTool {
        /// Tool name (`sign1util`, `oras`).
        tool: String,
        /// Exit code, `None` when killed by a signal.
        exit_code: Option<i32>,
        /// Captured stderr, verbatim.
        stderr: String,
    },

    /// An external tool produced output this crate cannot interpret.
    #[error("unexpected output from {tool}: {detail}")]
    UnexpectedOutput {
        /// Tool name.
        tool: String,
        /// What was missing or malformed.
        detail: String,
    },

    /// The tool could not be spawned or timed out.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// Verifier output did not carry the expected markers.
    #[error(transparent)]
    VerifierOutput(#[from] VerifierOutputError),
}

impl ConfcomError {
    /// Build an [`ConfcomError::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Build a [`ConfcomError::Json`] with a short context label.
    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }
}

/// Failures of the fragment trust chain.
#[derive(Debug, Error)]
pub enum TrustError {
    /// The resolved fragment's SVN is lower than the requested minimum.
    #[error("fragment {feed} has svn {found}, below the required minimum {minimum}")]
    SvnBelowMinimum {
        /// Feed of the rejected fragment.
        feed: String,
        /// SVN embedded in the fragment payload.
        found: u64,
        /// Minimum SVN requested by the importer.
        minimum: u64,
    },

    /// The fragment payload has no `svn := "N"` declaration.
    #[error("fragment {feed} does not declare an svn")]
    MissingSvn {
        /// Feed of the fragment.
        feed: String,
    },

    /// An SVN value that is not a non-negative integer.
    #[error("svn must be a string holding an integer, got {0:?}")]
    InvalidSvn(String),

    /// The registry refused access.
    #[error("unauthorized access to registry {registry}; please log in (e.g. `oras login {registry}`) and retry: {detail}")]
    Unauthorized {
        /// Registry host.
        registry: String,
        /// Tool output describing the refusal.
        detail: String,
    },

    /// The signature envelope failed verification.
    #[error("signature verification failed for {}: {stderr}", path.display())]
    VerificationFailed {
        /// Signed artifact that failed.
        path: PathBuf,
        /// Verifier stderr, verbatim.
        stderr: String,
    },

    /// The signer produced something that is not a `did:x509` issuer.
    #[error("certificate chain did not yield a did:x509 issuer: {0:?}")]
    InvalidIssuer(String),
}
