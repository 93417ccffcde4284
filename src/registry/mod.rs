//! OCI distribution of signed fragments.
//!
//! Fragments travel as referrer artifacts attached to the image they
//! describe, or as standalone artifacts pushed to their own reference.
//! [`FragmentRegistry`] is the seam; [`OrasClient`] drives the `oras` CLI.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{ConfcomError, Result, TrustError};
use crate::executor::{CommandRunner, ExecOptions, ExecResult};

pub mod reference;

pub use reference::ImageReference;

/// Artifact type of signed policy fragments.
pub const FRAGMENT_ARTIFACT_TYPE: &str = "application/x-ms-ccepolicy-frag";

/// Media type of the signed fragment layer.
pub const FRAGMENT_MEDIA_TYPE: &str = "application/cose-x509+rego";

/// Hint shown when `oras` is not installed.
pub const ORAS_INSTALL_HINT: &str =
    "install the ORAS CLI (https://oras.land/docs/installation) and put it on PATH, \
     or set [tools] oras in ~/.confcom/config.toml";

const TOOL: &str = "oras";

/// Discovers, fetches and publishes fragment artifacts.
#[async_trait]
pub trait FragmentRegistry: Send + Sync {
    /// Fail early if the registry client is unusable.
    async fn check_available(&self) -> Result<()>;

    /// Digests of every fragment artifact attached to `image`.
    async fn discover(&self, image: &str) -> Result<Vec<String>>;

    /// Download the artifact `digest` of `image` into `dest_dir`.
    async fn pull(&self, image: &str, digest: &str, dest_dir: &Path) -> Result<PathBuf>;

    /// Attach `signed` to `image` as a referrer.
    async fn attach(&self, image: &str, signed: &Path) -> Result<()>;

    /// Push `signed` as a standalone artifact to `destination`.
    async fn push(&self, signed: &Path, destination: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct DiscoverResponse {
    #[serde(default)]
    manifests: Option<Vec<DiscoveredManifest>>,
}

#[derive(Debug, Deserialize)]
struct DiscoveredManifest {
    digest: String,
}

/// [`FragmentRegistry`] backed by the `oras` binary.
#[derive(Debug, Clone)]
pub struct OrasClient<R> {
    runner: R,
    program: String,
    timeout: Duration,
    artifact_type: String,
}

impl<R: CommandRunner> OrasClient<R> {
    /// Drive `program` through `runner`, killing each call after `timeout`.
    pub fn new(runner: R, program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            program: program.into(),
            timeout,
            artifact_type: FRAGMENT_ARTIFACT_TYPE.to_owned(),
        }
    }

    /// Use a non-default artifact type for discover and attach.
    #[must_use]
    pub fn with_artifact_type(mut self, artifact_type: impl Into<String>) -> Self {
        self.artifact_type = artifact_type.into();
        self
    }

    async fn run(&self, args: Vec<String>, working_dir: Option<&Path>) -> Result<ExecResult> {
        let opts = ExecOptions {
            timeout: self.timeout,
            working_dir: working_dir.map(Path::to_path_buf),
        };
        self.runner
            .run(&self.program, &args, opts)
            .await
            .map_err(|e| e.with_install_hint(ORAS_INSTALL_HINT).into())
    }

    /// Run and fail closed on any non-zero exit.
    async fn run_checked(
        &self,
        args: Vec<String>,
        working_dir: Option<&Path>,
        reference: &ImageReference,
    ) -> Result<ExecResult> {
        let result = self.run(args, working_dir).await?;
        if result.success() {
            return Ok(result);
        }
        let output = result.output();
        if is_unauthorized(&output) {
            return Err(TrustError::Unauthorized {
                registry: reference.registry().to_owned(),
                detail: output.trim().to_owned(),
            }
            .into());
        }
        Err(ConfcomError::ExternalTool {
            tool: TOOL.to_owned(),
            exit_code: result.exit_code,
            stderr: result.stderr,
        })
    }
}

/// How `oras` reports a refused login: `response status code 401` and/or
/// the `unauthorized` error code.
static UNAUTHORIZED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bstatus code 401\b|\bunauthorized\b")
        .expect("unauthorized pattern is a valid regex")
});

fn is_unauthorized(output: &str) -> bool {
    UNAUTHORIZED.is_match(output)
}

/// Split `file` into the directory to run in and the name to pass to oras.
fn file_operand(file: &Path) -> Result<(Option<&Path>, String)> {
    if !file.is_file() {
        return Err(ConfcomError::UserInput(format!(
            "signed fragment {} does not exist",
            file.display()
        )));
    }
    let name = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            ConfcomError::UserInput(format!("{} is not a file path", file.display()))
        })?;
    let dir = file.parent().filter(|dir| !dir.as_os_str().is_empty());
    Ok((dir, format!("{name}:{FRAGMENT_MEDIA_TYPE}")))
}

#[async_trait]
impl<R: CommandRunner> FragmentRegistry for OrasClient<R> {
    async fn check_available(&self) -> Result<()> {
        let result = self.run(vec!["version".to_owned()], None).await?;
        if !result.success() {
            return Err(ConfcomError::ExternalTool {
                tool: TOOL.to_owned(),
                exit_code: result.exit_code,
                stderr: result.stderr,
            });
        }
        debug!(version = %result.stdout.lines().next().unwrap_or_default(), "oras is available");
        Ok(())
    }

    async fn discover(&self, image: &str) -> Result<Vec<String>> {
        let reference = ImageReference::parse(image)?;
        let args = vec![
            "discover".to_owned(),
            reference.to_string(),
            "-o".to_owned(),
            "json".to_owned(),
            "--artifact-type".to_owned(),
            self.artifact_type.clone(),
        ];
        let result = self.run_checked(args, None, &reference).await?;

        let response: DiscoverResponse = serde_json::from_str(&result.stdout)
            .map_err(|e| ConfcomError::json("oras discover output", e))?;
        let digests: Vec<String> = response
            .manifests
            .unwrap_or_default()
            .into_iter()
            .map(|manifest| manifest.digest)
            .collect();
        info!(image = %reference, count = digests.len(), "discovered fragments");
        Ok(digests)
    }

    async fn pull(&self, image: &str, digest: &str, dest_dir: &Path) -> Result<PathBuf> {
        let reference = ImageReference::parse(image)?;
        std::fs::create_dir_all(dest_dir).map_err(|e| ConfcomError::io(dest_dir, e))?;

        let args = vec!["pull".to_owned(), reference.at_digest(digest)];
        let result = self.run_checked(args, Some(dest_dir), &reference).await?;

        let file_name = result
            .stdout
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with("Downloaded"))
            .and_then(|line| line.split_whitespace().last())
            .filter(|name| *name != "Downloaded")
            .ok_or_else(|| ConfcomError::UnexpectedOutput {
                tool: TOOL.to_owned(),
                detail: format!("no \"Downloaded\" line in pull output for {digest}"),
            })?;
        let path = dest_dir.join(file_name);
        debug!(image = %reference, digest, path = %path.display(), "pulled fragment");
        Ok(path)
    }

    async fn attach(&self, image: &str, signed: &Path) -> Result<()> {
        let reference = ImageReference::parse(image)?;
        let (dir, operand) = file_operand(signed)?;
        let args = vec![
            "attach".to_owned(),
            "--artifact-type".to_owned(),
            self.artifact_type.clone(),
            reference.to_string(),
            operand,
        ];
        self.run_checked(args, dir, &reference).await?;
        info!(image = %reference, file = %signed.display(), "attached fragment");
        Ok(())
    }

    async fn push(&self, signed: &Path, destination: &str) -> Result<()> {
        let reference = ImageReference::parse(destination)?;
        let (dir, operand) = file_operand(signed)?;
        let args = vec!["push".to_owned(), operand, reference.to_string()];
        self.run_checked(args, dir, &reference).await?;
        info!(destination = %reference, file = %signed.display(), "pushed fragment");
        Ok(())
    }
}
