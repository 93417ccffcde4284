//! Image reference normalization.
//!
//! Parsing is delegated to [`oci_spec::distribution::Reference`]; this
//! module only applies the Docker Hub defaults the registry CLI expects.

use std::fmt;
use std::sync::LazyLock;

use oci_spec::distribution::Reference;
use regex::Regex;

use crate::error::{ConfcomError, Result};

/// Registry assumed when a reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";
/// Namespace prepended to single-component Docker Hub repositories.
pub const DEFAULT_NAMESPACE: &str = "library";
/// Tag assumed when a reference has neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

const DOCKER_HUB_INDEX: &str = "index.docker.io";

/// OCI image-spec digest grammar: `algorithm:encoded`.
static DIGEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-zA-Z0-9=_-]+$")
        .expect("digest pattern is a valid regex")
});

/// Whether `digest` follows the OCI `algorithm:encoded` grammar.
///
/// Digests come back from the registry and end up in scratch paths, so
/// nothing else may be trusted as one.
pub fn is_valid_digest(digest: &str) -> bool {
    DIGEST.is_match(digest)
}

/// A fully-qualified `registry/repository[:tag][@digest]` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parse and normalize a reference.
    ///
    /// `nginx` becomes `docker.io/library/nginx:latest`; a first path
    /// component containing `.` or `:`, or equal to `localhost`, is taken
    /// as the registry host.
    ///
    /// # Errors
    ///
    /// Returns [`ConfcomError::UserInput`] for anything that is not a valid
    /// OCI distribution reference.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        let parsed: Reference = reference.parse().map_err(|e| {
            ConfcomError::UserInput(format!("invalid image reference {reference:?}: {e}"))
        })?;

        let registry = match parsed.registry() {
            "" | DOCKER_HUB_INDEX => DEFAULT_REGISTRY.to_owned(),
            host => host.to_owned(),
        };
        let repository = if registry == DEFAULT_REGISTRY && !parsed.repository().contains('/') {
            format!("{DEFAULT_NAMESPACE}/{}", parsed.repository())
        } else {
            parsed.repository().to_owned()
        };
        let digest = parsed.digest().map(ToOwned::to_owned);
        let tag = match (parsed.tag(), &digest) {
            (Some(tag), _) => Some(tag.to_owned()),
            (None, None) => Some(DEFAULT_TAG.to_owned()),
            (None, Some(_)) => None,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Registry host, e.g. `docker.io` or `localhost:5000`.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path within the registry.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Tag, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Digest, if any.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// `registry/repository@digest`, addressing one artifact.
    pub fn at_digest(&self, digest: &str) -> String {
        format!("{}/{}@{digest}", self.registry, self.repository)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// `image` without its tag or digest, as written (no normalization).
pub fn strip_tag_or_digest(image: &str) -> &str {
    let name = image.split_once('@').map_or(image, |(name, _)| name);
    let last_slash = name.rfind('/').map_or(0, |i| i.saturating_add(1));
    match name[last_slash..].rfind(':') {
        Some(colon) => &name[..last_slash.saturating_add(colon)],
        None => name,
    }
}
