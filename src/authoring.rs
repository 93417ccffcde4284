//! Fragment authoring: render, sign and publish a fragment in one pass.

use std::path::PathBuf;

use tracing::info;

use crate::error::{ConfcomError, Result};
use crate::policy::{rego, PolicySpec};
use crate::registry::reference::strip_tag_or_digest;
use crate::registry::FragmentRegistry;
use crate::trust::{Algorithm, FragmentSigner, SignRequest};

/// Key material used to sign a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningMaterial {
    /// PEM private key.
    pub key: PathBuf,
    /// PEM certificate chain.
    pub chain: PathBuf,
    /// Signing algorithm.
    pub algorithm: Algorithm,
}

/// Where a signed fragment goes after signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Publish {
    /// Attach as a referrer of an image.
    AttachTo(String),
    /// Push as a standalone artifact.
    PushTo(String),
}

/// One fragment to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentRequest {
    /// Rego package name; also the output file stem.
    pub namespace: String,
    /// SVN to stamp into the fragment.
    pub svn: String,
    /// Feed claim; defaults to the first container's image without its tag.
    pub feed: Option<String>,
    /// Directory receiving `<namespace>.rego` and its envelope.
    pub output_dir: PathBuf,
    /// Sign when present.
    pub signing: Option<SigningMaterial>,
    /// Publish the signed envelope when present.
    pub publish: Option<Publish>,
}

/// Files and claims produced for a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentOutcome {
    /// Rendered Rego file.
    pub rego_path: PathBuf,
    /// Signed envelope, when signing was requested.
    pub signed_path: Option<PathBuf>,
    /// Feed claim used.
    pub feed: String,
    /// Issuer derived from the chain, when signing was requested.
    pub issuer: Option<String>,
}

/// Render `spec` as a fragment, then optionally sign and publish it.
///
/// # Errors
///
/// Returns [`ConfcomError::UserInput`] when publishing is requested without
/// signing material or no feed can be determined, and propagates rendering,
/// signing and registry failures.
pub async fn generate_fragment(
    spec: &PolicySpec,
    request: &FragmentRequest,
    signer: &dyn FragmentSigner,
    registry: &dyn FragmentRegistry,
) -> Result<FragmentOutcome> {
    if request.publish.is_some() && request.signing.is_none() {
        return Err(ConfcomError::UserInput(
            "publishing a fragment requires a signing key and certificate chain".to_owned(),
        ));
    }

    let feed = match &request.feed {
        Some(feed) => feed.clone(),
        None => spec
            .containers
            .first()
            .map(|container| strip_tag_or_digest(&container.id).to_owned())
            .ok_or_else(|| {
                ConfcomError::UserInput(
                    "a feed is required when the fragment has no containers".to_owned(),
                )
            })?,
    };

    let text = rego::render_fragment(spec, &request.namespace, &request.svn)?;
    std::fs::create_dir_all(&request.output_dir)
        .map_err(|e| ConfcomError::io(&request.output_dir, e))?;
    let rego_path = request.output_dir.join(format!("{}.rego", request.namespace));
    std::fs::write(&rego_path, text).map_err(|e| ConfcomError::io(&rego_path, e))?;
    info!(path = %rego_path.display(), namespace = %request.namespace, svn = %request.svn, "wrote fragment");

    let Some(signing) = &request.signing else {
        return Ok(FragmentOutcome {
            rego_path,
            signed_path: None,
            feed,
            issuer: None,
        });
    };

    let issuer = signer.create_issuer(&signing.chain).await?;
    let sign_request = SignRequest::new(&rego_path, &signing.key, &signing.chain)
        .with_feed(feed.clone())
        .with_issuer(issuer.clone())
        .with_algorithm(signing.algorithm);
    let signed_path = signer.sign(&sign_request).await?;

    match &request.publish {
        Some(Publish::AttachTo(image)) => registry.attach(image, &signed_path).await?,
        Some(Publish::PushTo(destination)) => registry.push(&signed_path, destination).await?,
        None => {}
    }

    Ok(FragmentOutcome {
        rego_path,
        signed_path: Some(signed_path),
        feed,
        issuer: Some(issuer),
    })
}
