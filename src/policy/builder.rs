//! Compile an evaluated ARM template into one [`PolicySpec`] per container group.

use serde_json::Value;
use tracing::{debug, info, warn};

use super::container::{self, Source};
use super::defaults::{self, ZERO_SIDECAR_TAG};
use super::{dedup_fragments, BuildOptions, FragmentRef, PolicySpec, WildcardApprover};
use crate::error::{ConfcomError, Result};
use crate::template::{get_ci, EvaluatedTemplate};
use crate::trust::parse_svn;

const CONTAINER_GROUP_TYPE: &str = "Microsoft.ContainerInstance/containerGroups";
const CONTAINER_GROUP_PROFILE_TYPE: &str = "Microsoft.ContainerInstance/containerGroupProfiles";

/// What an ARM resource is, as far as policy generation is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    /// `Microsoft.ContainerInstance/containerGroups`.
    ContainerGroup,
    /// `Microsoft.ContainerInstance/containerGroupProfiles`.
    ContainerGroupProfile,
    /// Any other resource type; skipped.
    Unrecognized(String),
}

impl ResourceKind {
    /// Classify a resource by its `type` field.
    pub fn of(resource: &Value) -> Self {
        let kind = get_ci(resource, "type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if kind.eq_ignore_ascii_case(CONTAINER_GROUP_TYPE) {
            Self::ContainerGroup
        } else if kind.eq_ignore_ascii_case(CONTAINER_GROUP_PROFILE_TYPE) {
            Self::ContainerGroupProfile
        } else {
            Self::Unrecognized(kind.to_owned())
        }
    }
}

/// Build a policy for every container group in `evaluated`.
///
/// `pulled_fragments` are imports resolved from a registry; they are added
/// to every group that does not opt out with the zero-sidecar tag.
///
/// # Errors
///
/// Returns [`ConfcomError::UserInput`] when `resources` is missing or empty,
/// a group declares no containers, or a container declaration is malformed.
pub fn build(
    evaluated: &EvaluatedTemplate,
    pulled_fragments: &[FragmentRef],
    options: &BuildOptions,
    approver: &dyn WildcardApprover,
) -> Result<Vec<PolicySpec>> {
    let resources = evaluated
        .resources()
        .filter(|resources| !resources.is_empty())
        .ok_or_else(|| {
            ConfcomError::UserInput(
                "field [\"resources\"] is empty or cannot be found in ARM template".to_owned(),
            )
        })?;

    if let Some(svn) = &options.infrastructure_svn {
        parse_svn(svn)?;
    }

    let mut policies = Vec::new();
    for resource in resources {
        match ResourceKind::of(resource) {
            ResourceKind::ContainerGroup | ResourceKind::ContainerGroupProfile => {
                policies.push(build_group(resource, pulled_fragments, options, approver)?);
            }
            ResourceKind::Unrecognized(kind) => {
                debug!(resource_type = %kind, "skipping non container-group resource");
            }
        }
    }

    if policies.is_empty() {
        warn!("ARM template contains no container groups");
    } else {
        info!(groups = policies.len(), "built container group policies");
    }
    Ok(policies)
}

fn build_group(
    resource: &Value,
    pulled_fragments: &[FragmentRef],
    options: &BuildOptions,
    approver: &dyn WildcardApprover,
) -> Result<PolicySpec> {
    let group_name = get_ci(resource, "name")
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>");
    let properties = get_ci(resource, "properties").ok_or_else(|| {
        ConfcomError::UserInput(format!(
            "container group {group_name} is missing field [\"properties\"]"
        ))
    })?;

    let declared = get_ci(properties, "containers")
        .and_then(Value::as_array)
        .filter(|containers| !containers.is_empty())
        .ok_or_else(|| {
            ConfcomError::UserInput(format!(
                "field [\"containers\"] is empty or cannot be found in container group {group_name}"
            ))
        })?;
    let init = get_ci(properties, "initContainers")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let volumes = get_ci(properties, "volumes")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let source = Source::ArmTemplate { volumes };
    let containers = declared
        .iter()
        .chain(init)
        .map(|declaration| container::compile(declaration, &source, options, approver))
        .collect::<Result<Vec<_>>>()?;

    let mut fragments = Vec::new();
    if is_zero_sidecar(resource) {
        debug!(group = group_name, "zero-sidecar group, leaving out external fragments");
    } else {
        if !options.exclude_default_fragments {
            fragments.push(defaults::default_infra_fragment(
                options.infrastructure_svn.as_deref(),
            ));
        }
        fragments.extend(pulled_fragments.iter().cloned());
    }
    fragments.extend(standalone_fragments(properties)?);

    debug!(
        group = group_name,
        containers = containers.len(),
        fragments = fragments.len(),
        "compiled container group"
    );
    Ok(PolicySpec {
        fragments: dedup_fragments(fragments),
        containers,
    })
}

fn is_zero_sidecar(resource: &Value) -> bool {
    match get_ci(resource, "tags").and_then(|tags| get_ci(tags, ZERO_SIDECAR_TAG)) {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(flag)) => flag.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn standalone_fragments(properties: &Value) -> Result<Vec<FragmentRef>> {
    let Some(entries) = get_ci(properties, "confidentialComputeProperties")
        .and_then(|ccp| get_ci(ccp, "standaloneFragments"))
    else {
        return Ok(Vec::new());
    };
    let entries = entries.as_array().ok_or_else(|| {
        ConfcomError::UserInput("[\"standaloneFragments\"] can only be a list value".to_owned())
    })?;
    entries.iter().map(FragmentRef::from_value).collect()
}
