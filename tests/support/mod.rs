//! In-memory fakes for the tool, signer and registry seams.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use confcom::error::{ConfcomError, Result, TrustError};
use confcom::executor::{CommandRunner, ExecOptions, ExecResult, ExecutorError};
use confcom::registry::FragmentRegistry;
use confcom::trust::{FragmentSigner, SignRequest};

/// One recorded tool invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Default)]
struct RunnerState {
    calls: Mutex<Vec<RecordedCall>>,
    responses: Mutex<VecDeque<std::result::Result<ExecResult, ExecutorError>>>,
}

/// Replays scripted results in order and records every call.
///
/// Calls past the end of the script succeed with empty output.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    state: Arc<RunnerState>,
}

pub fn exec_result(exit_code: i32, stdout: &str, stderr: &str) -> ExecResult {
    ExecResult {
        exit_code: Some(exit_code),
        stdout: stdout.to_owned(),
        stderr: stderr.to_owned(),
        duration: Duration::from_millis(1),
    }
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: ExecResult) -> &Self {
        self.state
            .responses
            .lock()
            .expect("responses lock")
            .push_back(Ok(result));
        self
    }

    pub fn push_ok(&self, stdout: &str) -> &Self {
        self.push(exec_result(0, stdout, ""))
    }

    pub fn push_error(&self, error: ExecutorError) -> &Self {
        self.state
            .responses
            .lock()
            .expect("responses lock")
            .push_back(Err(error));
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        opts: ExecOptions,
    ) -> std::result::Result<ExecResult, ExecutorError> {
        self.state.calls.lock().expect("calls lock").push(RecordedCall {
            program: program.to_owned(),
            args: args.to_vec(),
            working_dir: opts.working_dir,
        });
        self.state
            .responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .unwrap_or_else(|| Ok(exec_result(0, "", "")))
    }
}

/// Verbose verifier output for a fragment.
pub fn verifier_output(issuer: &str, feed: &str, payload: &str) -> String {
    format!("iss: {issuer}\nfeed: {feed}\ncty: application/unknown+rego\npayload:\n{payload}")
}

/// Rego payload of a fragment at `svn`.
pub fn fragment_payload(namespace: &str, svn: u64) -> String {
    format!(
        "package {namespace}\n\nsvn := \"{svn}\"\nframework_version := \"0.2.3\"\n\nfragments := []\n\ncontainers := []\n"
    )
}

/// Signer whose "envelopes" are files holding verifier output verbatim.
///
/// A file whose content starts with `INVALID` fails verification.
#[derive(Default)]
pub struct FakeSigner {
    pub checked: Mutex<Vec<PathBuf>>,
    pub signed: Mutex<Vec<SignRequest>>,
    pub issuer: String,
}

impl FakeSigner {
    pub fn new() -> Self {
        Self {
            issuer: "did:x509:0:sha256:fake::subject:CN:Contoso".to_owned(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl FragmentSigner for FakeSigner {
    async fn check_available(&self) -> Result<()> {
        Ok(())
    }

    async fn create_issuer(&self, _chain: &Path) -> Result<String> {
        Ok(self.issuer.clone())
    }

    async fn sign(&self, request: &SignRequest) -> Result<PathBuf> {
        let payload = std::fs::read_to_string(&request.payload)
            .map_err(|e| ConfcomError::io(&request.payload, e))?;
        let envelope = verifier_output(
            request.issuer.as_deref().unwrap_or(&self.issuer),
            request.feed.as_deref().unwrap_or_default(),
            &payload,
        );
        std::fs::write(&request.out, envelope).map_err(|e| ConfcomError::io(&request.out, e))?;
        self.signed.lock().expect("signed lock").push(request.clone());
        Ok(request.out.clone())
    }

    async fn check(&self, signed: &Path) -> Result<String> {
        self.checked
            .lock()
            .expect("checked lock")
            .push(signed.to_path_buf());
        let text =
            std::fs::read_to_string(signed).map_err(|e| ConfcomError::io(signed, e))?;
        if text.starts_with("INVALID") {
            return Err(TrustError::VerificationFailed {
                path: signed.to_path_buf(),
                stderr: "signature mismatch".to_owned(),
            }
            .into());
        }
        Ok(text)
    }
}

/// Registry holding artifacts in memory, keyed by digest.
#[derive(Default)]
pub struct FakeRegistry {
    pub digests: Vec<String>,
    pub artifacts: HashMap<String, String>,
    pub pulled_to: Mutex<Vec<PathBuf>>,
    pub attached: Mutex<Vec<(String, PathBuf)>>,
    pub pushed: Mutex<Vec<(PathBuf, String)>>,
}

impl FakeRegistry {
    pub fn with_artifact(mut self, digest: &str, envelope: &str) -> Self {
        self.digests.push(digest.to_owned());
        self.artifacts.insert(digest.to_owned(), envelope.to_owned());
        self
    }
}

#[async_trait]
impl FragmentRegistry for FakeRegistry {
    async fn check_available(&self) -> Result<()> {
        Ok(())
    }

    async fn discover(&self, _image: &str) -> Result<Vec<String>> {
        Ok(self.digests.clone())
    }

    async fn pull(&self, _image: &str, digest: &str, dest_dir: &Path) -> Result<PathBuf> {
        let envelope = self.artifacts.get(digest).ok_or_else(|| ConfcomError::ExternalTool {
            tool: "oras".to_owned(),
            exit_code: Some(1),
            stderr: format!("{digest}: not found"),
        })?;
        let path = dest_dir.join("fragment.rego.cose");
        std::fs::write(&path, envelope).map_err(|e| ConfcomError::io(&path, e))?;
        self.pulled_to
            .lock()
            .expect("pulled lock")
            .push(dest_dir.to_path_buf());
        Ok(path)
    }

    async fn attach(&self, image: &str, signed: &Path) -> Result<()> {
        self.attached
            .lock()
            .expect("attached lock")
            .push((image.to_owned(), signed.to_path_buf()));
        Ok(())
    }

    async fn push(&self, signed: &Path, destination: &str) -> Result<()> {
        self.pushed
            .lock()
            .expect("pushed lock")
            .push((signed.to_path_buf(), destination.to_owned()));
        Ok(())
    }
}
