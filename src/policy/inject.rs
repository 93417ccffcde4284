//! Write generated policies back into an ARM template.
//!
//! Each supported container group receives its base64 policy under
//! `properties.confidentialComputeProperties.ccePolicy`, in resource order.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::ResourceKind;
use crate::error::{ConfcomError, Result};
use crate::template::get_ci;

const CONFIDENTIAL_PROPERTIES: &str = "confidentialComputeProperties";
const CCE_POLICY: &str = "ccePolicy";

/// Decides whether a policy already present in a container group is replaced.
pub trait OverwriteApprover {
    /// Return `true` to replace the policy set on `group`.
    fn approve_overwrite(&self, group: &str) -> bool;
}

/// Approver that keeps every existing policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepExisting;

impl OverwriteApprover for KeepExisting {
    fn approve_overwrite(&self, _group: &str) -> bool {
        false
    }
}

/// Result of injecting into one container group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Injection {
    /// The policy was written.
    Written {
        /// Container group name.
        group: String,
    },
    /// A non-empty policy was already present and was left alone.
    Kept {
        /// Container group name.
        group: String,
    },
}

/// Set `ccePolicy` on every container group of `template`.
///
/// `encoded` holds one base64 policy per container group, in the order the
/// groups appear under `resources`. The `confidentialComputeProperties`
/// object is created when absent.
///
/// # Errors
///
/// Returns [`ConfcomError::UserInput`] when `resources` is missing, the
/// number of groups differs from `encoded.len()`, or a group has no
/// `properties` object.
pub fn inject_policies(
    template: &mut Value,
    encoded: &[String],
    approver: &dyn OverwriteApprover,
) -> Result<Vec<Injection>> {
    let resources = template
        .as_object_mut()
        .and_then(|root| {
            let key = ci_key(root, "resources");
            root.get_mut(&key)
        })
        .and_then(Value::as_array_mut)
        .ok_or_else(|| {
            ConfcomError::UserInput(
                "field [\"resources\"] cannot be found in ARM template".to_owned(),
            )
        })?;

    let groups: Vec<&mut Value> = resources
        .iter_mut()
        .filter(|resource| {
            matches!(
                ResourceKind::of(resource),
                ResourceKind::ContainerGroup | ResourceKind::ContainerGroupProfile
            )
        })
        .collect();
    if groups.len() != encoded.len() {
        return Err(ConfcomError::UserInput(format!(
            "ARM template has {} container groups but {} policies were generated",
            groups.len(),
            encoded.len()
        )));
    }

    let mut outcomes = Vec::with_capacity(groups.len());
    for (resource, policy) in groups.into_iter().zip(encoded) {
        let group = get_ci(resource, "name")
            .and_then(Value::as_str)
            .unwrap_or("<unnamed>")
            .to_owned();
        let properties = resource
            .as_object_mut()
            .and_then(|object| {
                let key = ci_key(object, "properties");
                object.get_mut(&key)
            })
            .and_then(Value::as_object_mut)
            .ok_or_else(|| {
                ConfcomError::UserInput(format!(
                    "container group {group} has no properties object"
                ))
            })?;

        let key = ci_key(properties, CONFIDENTIAL_PROPERTIES);
        let confidential = properties
            .entry(key)
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| {
                ConfcomError::UserInput(format!(
                    "{CONFIDENTIAL_PROPERTIES} of container group {group} is not an object"
                ))
            })?;

        let key = ci_key(confidential, CCE_POLICY);
        let existing = confidential
            .get(&key)
            .and_then(Value::as_str)
            .is_some_and(|current| !current.is_empty());
        if existing && !approver.approve_overwrite(&group) {
            warn!(%group, "keeping the policy already set in container group");
            outcomes.push(Injection::Kept { group });
            continue;
        }
        confidential.insert(key, Value::String(policy.clone()));
        info!(%group, "injected policy into container group");
        outcomes.push(Injection::Written { group });
    }
    Ok(outcomes)
}

/// Hex SHA-256 of a rendered (not encoded) policy.
pub fn policy_hash(rego: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rego.as_bytes());
    hex::encode(hasher.finalize())
}

/// The existing spelling of `key` in `object`, or `key` itself.
fn ci_key(object: &Map<String, Value>, key: &str) -> String {
    if object.contains_key(key) {
        return key.to_owned();
    }
    object
        .keys()
        .find(|name| name.eq_ignore_ascii_case(key))
        .cloned()
        .unwrap_or_else(|| key.to_owned())
}
