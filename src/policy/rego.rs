//! Rego text rendering for policies and fragments.

use std::sync::LazyLock;

use regex::Regex;

use super::PolicySpec;
use crate::error::{ConfcomError, Result};
use crate::trust::parse_svn;

/// Policy API version written into full policy documents.
pub const API_VERSION: &str = "0.10.0";

/// Framework version written into policies and fragments.
pub const FRAMEWORK_VERSION: &str = "0.2.3";

static SVN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"svn\s*:=\s*"(\d+)""#).expect("svn pattern is a valid regex"));

/// Enforcement points delegated to the framework, in document order.
const FRAMEWORK_RULES: &[&str] = &[
    "mount_device",
    "unmount_device",
    "mount_overlay",
    "unmount_overlay",
    "create_container",
    "exec_in_container",
    "exec_external",
    "shutdown_container",
    "signal_container_process",
    "plan9_mount",
    "plan9_unmount",
    "get_properties",
    "dump_stacks",
    "runtime_logging",
    "load_fragment",
    "scratch_mount",
    "scratch_unmount",
];

/// Render `spec` as a fragment in package `namespace` at `svn`.
///
/// # Errors
///
/// Returns [`ConfcomError::UserInput`] for an empty or whitespace-bearing
/// namespace, and a trust error when `svn` is not an integer string.
pub fn render_fragment(spec: &PolicySpec, namespace: &str, svn: &str) -> Result<String> {
    if namespace.is_empty() || namespace.chars().any(char::is_whitespace) {
        return Err(ConfcomError::UserInput(format!(
            "fragment namespace {namespace:?} must be a single non-empty word"
        )));
    }
    parse_svn(svn)?;

    Ok(format!(
        "package {namespace}\n\nsvn := \"{svn}\"\nframework_version := \"{FRAMEWORK_VERSION}\"\n\n\
         fragments := {}\n\ncontainers := {}\n",
        to_rego_json(&spec.fragments)?,
        to_rego_json(&spec.containers)?,
    ))
}

/// Render `spec` as a complete policy document.
///
/// Debug mode also allows stack dumps and runtime logging.
///
/// # Errors
///
/// Returns an error only if the policy cannot be serialized.
pub fn render_policy(spec: &PolicySpec, debug_mode: bool) -> Result<String> {
    let mut out = String::new();
    out.push_str("package policy\n\n");
    out.push_str("import future.keywords.every\nimport future.keywords.in\n\n");
    out.push_str(&format!(
        "api_version := \"{API_VERSION}\"\nframework_version := \"{FRAMEWORK_VERSION}\"\n\n"
    ));
    out.push_str(&format!(
        "fragments := {}\n\ncontainers := {}\n\n",
        to_rego_json(&spec.fragments)?,
        to_rego_json(&spec.containers)?,
    ));
    out.push_str("allow_properties_access := true\n");
    out.push_str(&format!("allow_dump_stacks := {debug_mode}\n"));
    out.push_str(&format!("allow_runtime_logging := {debug_mode}\n"));
    out.push_str("allow_environment_variable_dropping := true\n");
    out.push_str("allow_unencrypted_scratch := false\n");
    out.push_str("allow_capability_dropping := true\n\n");
    for rule in FRAMEWORK_RULES {
        out.push_str(&format!("{rule} := data.framework.{rule}\n"));
    }
    out.push_str("reason := {\"errors\": data.framework.errors}\n");
    Ok(out)
}

fn to_rego_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| ConfcomError::json("rego rendering", e))
}

/// The SVN declared by `svn := "N"` in a Rego document.
///
/// `None` when the declaration is absent or does not fit a `u64`; use
/// [`extract_svn_text`] to tell the two apart.
pub fn extract_svn(text: &str) -> Option<u64> {
    extract_svn_text(text)?.parse().ok()
}

/// The raw digits of the `svn := "N"` declaration, if any.
pub fn extract_svn_text(text: &str) -> Option<&str> {
    Some(SVN.captures(text)?.get(1)?.as_str())
}

/// The package name declared by the first `package <ns>` line.
pub fn extract_namespace(text: &str) -> Option<String> {
    text.lines()
        .filter_map(|line| line.trim().strip_prefix("package "))
        .map(str::trim)
        .find(|namespace| !namespace.is_empty())
        .map(ToOwned::to_owned)
}
