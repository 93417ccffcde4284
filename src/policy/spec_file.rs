//! Standalone policy spec files.
//!
//! A spec file lists containers directly instead of wrapping them in an ARM
//! template:
//!
//! ```json
//! {
//!   "version": "1.0",
//!   "fragments": [],
//!   "containers": [
//!     {"name": "app", "properties": {"image": "contoso.azurecr.io/app:1",
//!       "environmentVariables": [{"name": "PORT", "value": "80", "regex": false}],
//!       "volumeMounts": [{"mountType": "emptyDir", "mountPath": "/tmp", "readonly": false}]}}
//!   ]
//! }
//! ```
//!
//! No default infrastructure fragment is added: spec files are how fragment
//! authors describe exactly what their fragment contributes.

use std::path::Path;

use serde_json::Value;
use tracing::debug;

use super::container::{self, Source};
use super::{dedup_fragments, BuildOptions, FragmentRef, PolicySpec, WildcardApprover};
use crate::error::{ConfcomError, Result};
use crate::template::{get_ci, parse_json, read_text};

/// Read a spec file from disk.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a JSON object.
pub fn load_spec_file(path: &Path) -> Result<Value> {
    let document = parse_json(&read_text(path)?, &path.display().to_string())?;
    if !document.is_object() {
        return Err(ConfcomError::UserInput(format!(
            "policy spec file {} must be a JSON object",
            path.display()
        )));
    }
    Ok(document)
}

/// Compile a spec file document into a single [`PolicySpec`].
///
/// # Errors
///
/// Returns [`ConfcomError::UserInput`] when `containers` is missing or empty
/// or any container or fragment entry is malformed.
pub fn build_from_spec_file(
    document: &Value,
    options: &BuildOptions,
    approver: &dyn WildcardApprover,
) -> Result<PolicySpec> {
    let declared = get_ci(document, "containers")
        .and_then(Value::as_array)
        .filter(|containers| !containers.is_empty())
        .ok_or_else(|| {
            ConfcomError::UserInput(
                "field [\"containers\"] is empty or cannot be found in policy spec file".to_owned(),
            )
        })?;

    let containers = declared
        .iter()
        .map(|declaration| container::compile(declaration, &Source::SpecFile, options, approver))
        .collect::<Result<Vec<_>>>()?;

    let fragments = match get_ci(document, "fragments") {
        None => Vec::new(),
        Some(Value::Array(entries)) => entries
            .iter()
            .map(FragmentRef::from_value)
            .collect::<Result<Vec<_>>>()?,
        Some(_) => {
            return Err(ConfcomError::UserInput(
                "field [\"fragments\"] can only be a list value".to_owned(),
            ))
        }
    };

    let version = get_ci(document, "version")
        .and_then(Value::as_str)
        .unwrap_or("unspecified");
    debug!(
        version,
        containers = containers.len(),
        "compiled policy spec file"
    );
    Ok(PolicySpec {
        fragments: dedup_fragments(fragments),
        containers,
    })
}
