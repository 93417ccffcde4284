//! Turn published fragments into trusted import statements.
//!
//! For each fragment attached to an image the resolver pulls the envelope
//! into a scratch directory, verifies it, applies the SVN gate and emits a
//! [`FragmentRef`]. Resolution is all-or-nothing.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ConfcomError, Result};
use crate::policy::{dedup_fragments, FragmentRef};
use crate::registry::reference::is_valid_digest;
use crate::registry::FragmentRegistry;
use crate::trust::{self, parse_svn, FragmentSigner};

pub mod imports_file;

pub use imports_file::ImportsFile;

/// Scratch directory removed when dropped, on success or failure.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn create(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path).map_err(|e| ConfcomError::io(&path, e))?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed scratch directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove scratch directory"
            ),
        }
    }
}

/// Directory name for a pulled digest (`sha256:ab..` → `sha256-ab..`).
fn digest_dir_name(digest: &str) -> String {
    digest
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Resolves images and local envelopes into import statements.
pub struct ImportResolver<'a> {
    registry: &'a dyn FragmentRegistry,
    signer: &'a dyn FragmentSigner,
    scratch_dir: PathBuf,
}

impl<'a> ImportResolver<'a> {
    /// A resolver pulling into subdirectories of `scratch_dir`.
    pub fn new(
        registry: &'a dyn FragmentRegistry,
        signer: &'a dyn FragmentSigner,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            signer,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Import every fragment attached to `image`, requiring `minimum_svn`.
    ///
    /// # Errors
    ///
    /// Any discovery, pull, verification or SVN failure aborts the whole
    /// resolution; scratch files are removed regardless. A discovered digest
    /// outside the OCI `algorithm:encoded` grammar is
    /// [`ConfcomError::UnexpectedOutput`] and nothing is pulled.
    pub async fn resolve_all(&self, image: &str, minimum_svn: &str) -> Result<Vec<FragmentRef>> {
        parse_svn(minimum_svn)?;
        let digests = self.registry.discover(image).await?;
        if digests.is_empty() {
            info!(image, "no fragments attached to image");
            return Ok(Vec::new());
        }

        if let Some(bad) = digests.iter().find(|digest| !is_valid_digest(digest)) {
            return Err(ConfcomError::UnexpectedOutput {
                tool: "oras".to_owned(),
                detail: format!("discover returned malformed digest {bad:?} for {image}"),
            });
        }

        let mut imports = Vec::with_capacity(digests.len());
        for digest in &digests {
            let scratch = ScratchDir::create(self.scratch_dir.join(digest_dir_name(digest)))?;
            let pulled = self.registry.pull(image, digest, scratch.path()).await?;
            let import = self.import_from_file(&pulled, minimum_svn).await?;
            debug!(image, digest = %digest, feed = %import.feed, "resolved fragment");
            imports.push(import);
        }

        let imports = dedup_fragments(imports);
        info!(image, count = imports.len(), "resolved fragment imports");
        Ok(imports)
    }

    /// Import a signed fragment already on disk.
    ///
    /// # Errors
    ///
    /// Propagates verification and SVN failures.
    pub async fn resolve_path(&self, path: &Path, minimum_svn: &str) -> Result<FragmentRef> {
        parse_svn(minimum_svn)?;
        self.import_from_file(path, minimum_svn).await
    }

    async fn import_from_file(&self, path: &Path, minimum_svn: &str) -> Result<FragmentRef> {
        let fragment = trust::verify_and_extract(self.signer, path).await?;
        let svn = trust::ensure_minimum_svn(&fragment, minimum_svn)?;
        debug!(feed = %fragment.feed, svn, minimum_svn, "fragment passed svn gate");
        trust::import_statement(&fragment, minimum_svn)
    }
}
