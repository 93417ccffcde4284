//! Fragment signing and verification.
//!
//! Fragments are wrapped in COSE Sign1 envelopes by the external
//! `sign1util` tool. [`FragmentSigner`] is the seam; [`Sign1Util`] drives
//! the real binary through a [`CommandRunner`]. The free functions on top
//! turn verified envelopes into [`FragmentRef`] import statements.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{ConfcomError, Result, TrustError};
use crate::executor::{CommandRunner, ExecOptions, ExecResult};
use crate::policy::rego::extract_svn_text;
use crate::policy::{FragmentInclude, FragmentRef};

pub mod verifier_output;

pub use verifier_output::VerifiedFragment;

/// Content type stamped on every signed fragment.
pub const CONTENT_TYPE: &str = "application/unknown+rego";

/// Fixed salt; makes signing deterministic for identical inputs.
pub const SALT: &str = "zero";

/// Hint shown when `sign1util` is not installed.
pub const SIGN1UTIL_INSTALL_HINT: &str =
    "install sign1util from https://github.com/microsoft/cosesign1go and put it on PATH, \
     or set [tools] sign1util in ~/.confcom/config.toml";

const TOOL: &str = "sign1util";

/// Payload marker proving a fragment contributes containers.
const CONTAINERS_SENTINEL: &str = "containers :=";
/// Payload marker proving a fragment contributes nested fragments.
const FRAGMENTS_SENTINEL: &str = "fragments :=";

/// COSE signing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// ECDSA P-256 / SHA-256.
    ES256,
    /// ECDSA P-384 / SHA-384.
    #[default]
    ES384,
    /// ECDSA P-521 / SHA-512.
    ES512,
    /// RSASSA-PSS / SHA-256.
    PS256,
    /// RSASSA-PSS / SHA-384.
    PS384,
    /// RSASSA-PSS / SHA-512.
    PS512,
}

impl Algorithm {
    /// Name as passed to `sign1util -algo`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ES256 => "ES256",
            Self::ES384 => "ES384",
            Self::ES512 => "ES512",
            Self::PS256 => "PS256",
            Self::PS384 => "PS384",
            Self::PS512 => "PS512",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = ConfcomError;

    fn from_str(s: &str) -> Result<Self> {
        [
            Self::ES256,
            Self::ES384,
            Self::ES512,
            Self::PS256,
            Self::PS384,
            Self::PS512,
        ]
        .into_iter()
        .find(|algorithm| algorithm.as_str().eq_ignore_ascii_case(s.trim()))
        .ok_or_else(|| {
            ConfcomError::UserInput(format!(
                "unsupported signing algorithm {s:?}; expected one of ES256, ES384, ES512, PS256, PS384, PS512"
            ))
        })
    }
}

/// Inputs for one signing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    /// Rego payload to sign.
    pub payload: PathBuf,
    /// PEM private key.
    pub key: PathBuf,
    /// PEM certificate chain.
    pub chain: PathBuf,
    /// Feed claim.
    pub feed: Option<String>,
    /// Issuer claim; the tool derives one from the chain when absent.
    pub issuer: Option<String>,
    /// Signing algorithm.
    pub algorithm: Algorithm,
    /// Output envelope path.
    pub out: PathBuf,
}

impl SignRequest {
    /// A request writing to `<payload>.cose` with the default algorithm.
    pub fn new(payload: impl Into<PathBuf>, key: impl Into<PathBuf>, chain: impl Into<PathBuf>) -> Self {
        let payload = payload.into();
        let mut out = payload.clone().into_os_string();
        out.push(".cose");
        Self {
            payload,
            key: key.into(),
            chain: chain.into(),
            feed: None,
            issuer: None,
            algorithm: Algorithm::default(),
            out: PathBuf::from(out),
        }
    }

    /// Set the feed claim.
    #[must_use]
    pub fn with_feed(mut self, feed: impl Into<String>) -> Self {
        self.feed = Some(feed.into());
        self
    }

    /// Set the issuer claim.
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Set the algorithm.
    #[must_use]
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Set the output path.
    #[must_use]
    pub fn with_out(mut self, out: impl Into<PathBuf>) -> Self {
        self.out = out.into();
        self
    }

    /// `sign1util create` arguments for this request.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "create".to_owned(),
            "-algo".to_owned(),
            self.algorithm.to_string(),
            "-chain".to_owned(),
            self.chain.display().to_string(),
            "-claims".to_owned(),
            self.payload.display().to_string(),
            "-key".to_owned(),
            self.key.display().to_string(),
            "-salt".to_owned(),
            SALT.to_owned(),
            "-content-type".to_owned(),
            CONTENT_TYPE.to_owned(),
            "-out".to_owned(),
            self.out.display().to_string(),
        ];
        if let Some(feed) = &self.feed {
            args.push("-feed".to_owned());
            args.push(feed.clone());
        }
        if let Some(issuer) = &self.issuer {
            args.push("-issuer".to_owned());
            args.push(issuer.clone());
        }
        args
    }
}

/// Signs and verifies fragment envelopes.
#[async_trait]
pub trait FragmentSigner: Send + Sync {
    /// Fail early if the signing tool is unusable.
    async fn check_available(&self) -> Result<()>;

    /// Derive the `did:x509` issuer for a certificate chain.
    async fn create_issuer(&self, chain: &Path) -> Result<String>;

    /// Sign a payload, returning the envelope path.
    async fn sign(&self, request: &SignRequest) -> Result<PathBuf>;

    /// Verify an envelope and return the verifier's verbose output.
    async fn check(&self, signed: &Path) -> Result<String>;
}

/// [`FragmentSigner`] backed by the `sign1util` binary.
#[derive(Debug, Clone)]
pub struct Sign1Util<R> {
    runner: R,
    program: String,
    timeout: Duration,
}

impl<R: CommandRunner> Sign1Util<R> {
    /// Drive `program` through `runner`, killing each call after `timeout`.
    pub fn new(runner: R, program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            program: program.into(),
            timeout,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<ExecResult> {
        self.runner
            .run(&self.program, &args, ExecOptions::with_timeout(self.timeout))
            .await
            .map_err(|e| e.with_install_hint(SIGN1UTIL_INSTALL_HINT).into())
    }
}

fn require_file(path: &Path, what: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ConfcomError::UserInput(format!(
            "{what} {} does not exist",
            path.display()
        )))
    }
}

fn tool_failure(result: &ExecResult) -> ConfcomError {
    ConfcomError::ExternalTool {
        tool: TOOL.to_owned(),
        exit_code: result.exit_code,
        stderr: result.stderr.clone(),
    }
}

#[async_trait]
impl<R: CommandRunner> FragmentSigner for Sign1Util<R> {
    async fn check_available(&self) -> Result<()> {
        let result = self.run(vec!["--help".to_owned()]).await?;
        debug!(exit_code = ?result.exit_code, "sign1util is available");
        Ok(())
    }

    async fn create_issuer(&self, chain: &Path) -> Result<String> {
        require_file(chain, "certificate chain")?;
        let result = self
            .run(vec![
                "did:x509".to_owned(),
                "-chain".to_owned(),
                chain.display().to_string(),
                "-policy".to_owned(),
                "CN".to_owned(),
            ])
            .await?;
        if !result.success() {
            return Err(tool_failure(&result));
        }
        let issuer = result.stdout.trim();
        if !issuer.starts_with("did:x509:") {
            return Err(TrustError::InvalidIssuer(issuer.to_owned()).into());
        }
        Ok(issuer.to_owned())
    }

    async fn sign(&self, request: &SignRequest) -> Result<PathBuf> {
        require_file(&request.payload, "payload")?;
        require_file(&request.key, "signing key")?;
        require_file(&request.chain, "certificate chain")?;

        let result = self.run(request.to_args()).await?;
        if !result.success() {
            return Err(tool_failure(&result));
        }
        info!(
            payload = %request.payload.display(),
            out = %request.out.display(),
            algorithm = %request.algorithm,
            "signed fragment"
        );
        Ok(request.out.clone())
    }

    async fn check(&self, signed: &Path) -> Result<String> {
        require_file(signed, "signed fragment")?;
        let result = self
            .run(vec![
                "check".to_owned(),
                "--in".to_owned(),
                signed.display().to_string(),
                "--verbose".to_owned(),
            ])
            .await?;
        if !result.success() {
            return Err(TrustError::VerificationFailed {
                path: signed.to_path_buf(),
                stderr: result.stderr,
            }
            .into());
        }
        Ok(result.stdout)
    }
}

/// Parse an SVN string (`"5"`) into its number.
///
/// # Errors
///
/// Returns [`TrustError::InvalidSvn`] unless `svn` is a non-empty string of
/// ASCII digits.
pub fn parse_svn(svn: &str) -> std::result::Result<u64, TrustError> {
    if svn.is_empty() || !svn.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TrustError::InvalidSvn(svn.to_owned()));
    }
    svn.parse().map_err(|_| TrustError::InvalidSvn(svn.to_owned()))
}

/// Verify `signed` and recover its issuer, feed and payload.
///
/// # Errors
///
/// Returns [`TrustError::VerificationFailed`] when the envelope does not
/// verify, or a [`verifier_output::VerifierOutputError`] when the output
/// cannot be parsed.
pub async fn verify_and_extract(signer: &dyn FragmentSigner, signed: &Path) -> Result<VerifiedFragment> {
    let output = signer.check(signed).await?;
    let fragment = verifier_output::parse(&output)?;
    debug!(
        path = %signed.display(),
        issuer = %fragment.issuer,
        feed = %fragment.feed,
        "verified fragment"
    );
    Ok(fragment)
}

/// Reject `fragment` unless its payload declares an SVN of at least `minimum_svn`.
///
/// Returns the declared SVN.
///
/// # Errors
///
/// Returns [`TrustError::SvnBelowMinimum`], [`TrustError::MissingSvn`] or
/// [`TrustError::InvalidSvn`].
pub fn ensure_minimum_svn(fragment: &VerifiedFragment, minimum_svn: &str) -> Result<u64> {
    let minimum = parse_svn(minimum_svn)?;
    let declared = extract_svn_text(&fragment.payload).ok_or_else(|| TrustError::MissingSvn {
        feed: fragment.feed.clone(),
    })?;
    let found = parse_svn(declared)?;
    if found < minimum {
        return Err(TrustError::SvnBelowMinimum {
            feed: fragment.feed.clone(),
            found,
            minimum,
        }
        .into());
    }
    Ok(found)
}

/// Import statement for an already verified fragment.
///
/// # Errors
///
/// Returns [`ConfcomError::UserInput`] when `minimum_svn` is not an
/// integer string.
pub fn import_statement(fragment: &VerifiedFragment, minimum_svn: &str) -> Result<FragmentRef> {
    parse_svn(minimum_svn).map_err(|_| {
        ConfcomError::UserInput(format!(
            "minimum svn must be a string holding an integer, got {minimum_svn:?}"
        ))
    })?;

    let mut includes = Vec::new();
    if fragment.payload.contains(CONTAINERS_SENTINEL) {
        includes.push(FragmentInclude::Containers);
    }
    if fragment.payload.contains(FRAGMENTS_SENTINEL) {
        includes.push(FragmentInclude::Fragments);
    }
    Ok(FragmentRef::new(
        fragment.issuer.clone(),
        fragment.feed.clone(),
        minimum_svn,
        includes,
    ))
}

/// Verify `signed` and build the import statement that trusts it.
///
/// # Errors
///
/// Propagates verification errors and rejects a non-integer `minimum_svn`.
pub async fn generate_import_statement(
    signer: &dyn FragmentSigner,
    signed: &Path,
    minimum_svn: &str,
) -> Result<FragmentRef> {
    let fragment = verify_and_extract(signer, signed).await?;
    import_statement(&fragment, minimum_svn)
}
