//! Compiled policy model: containers, fragments and their rules.
//!
//! A [`PolicySpec`] is the canonical compiled artifact. It is produced by
//! [`builder::build`] from an ARM template or by
//! [`spec_file::build_from_spec_file`] from a standalone spec, and rendered
//! to Rego text by [`rego`]. [`inject`] writes encoded policies back into
//! the ARM template they came from.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfcomError, Result};
use crate::template::get_ci;
use crate::trust::parse_svn;

pub mod builder;
mod container;
pub mod defaults;
pub mod inject;
pub mod rego;
pub mod spec_file;

pub use builder::{build, ResourceKind};
pub use spec_file::build_from_spec_file;

/// The compiled allow-list for one container group (or one fragment).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySpec {
    /// Fragments this policy trusts, in evaluation order.
    pub fragments: Vec<FragmentRef>,
    /// Containers this policy allows, in declaration order.
    pub containers: Vec<ContainerSpec>,
}

/// Allow-list entry for a single container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Image reference the container runs.
    pub id: String,
    /// Container name within its group.
    pub name: String,
    /// Command line, empty when the image default is used.
    pub command: Vec<String>,
    /// Environment variable rules.
    pub env_rules: Vec<EnvRule>,
    /// Mount rules.
    pub mounts: Vec<MountRule>,
    /// Processes that may be started with `exec`.
    pub exec_processes: Vec<ExecProcess>,
    /// Signals that may be sent to the container's init process.
    pub signals: Vec<i32>,
    /// Whether stdio may be attached.
    pub allow_stdio_access: bool,
    /// Security context; `None` when the template declares none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
}

/// How an environment rule pattern is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvStrategy {
    /// Exact `NAME=value` match.
    String,
    /// RE2 regular expression match.
    Re2,
}

/// One allowed environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvRule {
    /// `NAME=value` pattern.
    pub pattern: String,
    /// Match strategy.
    pub strategy: EnvStrategy,
    /// Whether the variable must be present.
    pub required: bool,
}

impl EnvRule {
    /// Exact-match rule for `name=value`.
    pub fn literal(name: &str, value: &str) -> Self {
        Self {
            pattern: format!("{name}={value}"),
            strategy: EnvStrategy::String,
            required: false,
        }
    }

    /// Regex rule for `name=<value regex>`.
    pub fn regex(name: &str, value: &str) -> Self {
        Self {
            pattern: format!("{name}={value}"),
            strategy: EnvStrategy::Re2,
            required: false,
        }
    }

    /// Wildcard rule accepting any value for `name`.
    pub fn wildcard(name: &str) -> Self {
        Self::regex(name, ".*")
    }
}

/// One allowed mount.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountRule {
    /// Path inside the container.
    pub destination: String,
    /// Sandbox source pattern.
    pub source: String,
    /// Mount type (always `bind` for sandbox sources).
    #[serde(rename = "type")]
    pub mount_type: String,
    /// Mount options.
    pub options: Vec<String>,
}

/// One process allowed to be started with `exec`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecProcess {
    /// Command line.
    pub command: Vec<String>,
    /// Signals that may be sent to the process.
    pub signals: Vec<i32>,
}

/// Container security settings carried into the policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    /// Whether the container runs privileged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
    /// Whether privilege escalation is allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_privilege_escalation: Option<bool>,
    /// User the container runs as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
    /// Group the container runs as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_group: Option<i64>,
    /// Capability changes; `None` when not declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
}

/// Linux capabilities added to and dropped from the default set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Capabilities to add.
    pub add: Vec<String>,
    /// Capabilities to drop.
    pub drop: Vec<String>,
}

/// What an imported fragment may contribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentInclude {
    /// Container allow-list entries.
    Containers,
    /// Nested fragment imports.
    Fragments,
}

impl FragmentInclude {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "containers" => Some(Self::Containers),
            "fragments" => Some(Self::Fragments),
            _ => None,
        }
    }
}

/// A trust-scoped pointer to an external fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentRef {
    /// `did:x509` issuer the fragment must be signed by.
    pub issuer: String,
    /// Feed the fragment is published under.
    pub feed: String,
    /// Lowest acceptable SVN, as a decimal string.
    #[serde(alias = "minimumSvn")]
    pub minimum_svn: String,
    /// What the fragment may contribute, sorted and unique.
    pub includes: Vec<FragmentInclude>,
}

impl FragmentRef {
    /// Build a reference, normalizing `includes` to sorted unique order.
    pub fn new(
        issuer: impl Into<String>,
        feed: impl Into<String>,
        minimum_svn: impl Into<String>,
        includes: impl IntoIterator<Item = FragmentInclude>,
    ) -> Self {
        let mut includes: Vec<FragmentInclude> = includes.into_iter().collect();
        includes.sort();
        includes.dedup();
        Self {
            issuer: issuer.into(),
            feed: feed.into(),
            minimum_svn: minimum_svn.into(),
            includes,
        }
    }

    /// Parse and validate a fragment import object from a template or spec file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfcomError::UserInput`] when `issuer` or `feed` is not a
    /// string, `minimum_svn` is not an integer string, or `includes` holds
    /// unknown entries.
    pub fn from_value(value: &Value) -> Result<Self> {
        let field = |name: &str| -> Result<String> {
            get_ci(value, name)
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
                .ok_or_else(|| {
                    ConfcomError::UserInput(format!(
                        "fragment field [\"{name}\"] can only be a string value"
                    ))
                })
        };
        let issuer = field("issuer")?;
        let feed = field("feed")?;

        let minimum_svn = match get_ci(value, "minimum_svn").or_else(|| get_ci(value, "minimumSvn"))
        {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(ConfcomError::UserInput(format!(
                    "fragment {feed}: [\"minimum_svn\"] can only be a string with an integer value"
                )))
            }
        };
        parse_svn(&minimum_svn).map_err(|_| {
            ConfcomError::UserInput(format!(
                "fragment {feed}: [\"minimum_svn\"] can only be a string with an integer value"
            ))
        })?;

        let raw_includes = get_ci(value, "includes")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ConfcomError::UserInput(format!(
                    "fragment {feed}: [\"includes\"] can only be a list value"
                ))
            })?;
        let includes = raw_includes
            .iter()
            .map(|item| {
                item.as_str()
                    .and_then(FragmentInclude::parse)
                    .ok_or_else(|| {
                        ConfcomError::UserInput(format!(
                            "fragment {feed}: unknown include {item}"
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(issuer, feed, minimum_svn, includes))
    }
}

/// Remove structurally equal duplicates, keeping the first occurrence.
pub fn dedup_fragments(fragments: Vec<FragmentRef>) -> Vec<FragmentRef> {
    let mut seen = HashSet::new();
    fragments
        .into_iter()
        .filter(|fragment| seen.insert(fragment.clone()))
        .collect()
}

/// Options controlling how containers are compiled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Add debug shells to every container's exec processes.
    pub debug_mode: bool,
    /// Allow stdio attachment on every container.
    pub allow_stdio_access: bool,
    /// Emit wildcard env rules without asking.
    pub approve_wildcards: bool,
    /// Minimum SVN to require of the default infrastructure fragment.
    pub infrastructure_svn: Option<String>,
    /// Leave the default infrastructure fragment out entirely.
    pub exclude_default_fragments: bool,
}

/// Decides whether an unresolvable env value may become a wildcard rule.
pub trait WildcardApprover {
    /// Return `true` to emit `variable=.*` for `container`.
    fn approve(&self, container: &str, variable: &str) -> bool;
}

/// Approver that declines every wildcard.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyWildcards;

impl WildcardApprover for DenyWildcards {
    fn approve(&self, _container: &str, _variable: &str) -> bool {
        false
    }
}
