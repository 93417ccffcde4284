//! The `{"fragments": [...]}` imports file.
//!
//! Other top-level keys in an existing file are kept when it is rewritten.

use std::path::Path;

use serde_json::{Map, Value};

use crate::error::{ConfcomError, Result};
use crate::policy::{dedup_fragments, FragmentRef};
use crate::template::{get_ci_map, parse_json};

const FRAGMENTS_KEY: &str = "fragments";

/// An imports file in memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportsFile {
    extra: Map<String, Value>,
    fragments: Vec<FragmentRef>,
}

impl ImportsFile {
    /// Parse an imports document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfcomError::UserInput`] for a top-level array or any
    /// other non-object, or a malformed fragment entry.
    pub fn from_value(document: Value) -> Result<Self> {
        let mut extra = match document {
            Value::Object(object) => object,
            Value::Array(_) => {
                return Err(ConfcomError::UserInput(
                    "imports file must be an object with a [\"fragments\"] list, not a top-level array"
                        .to_owned(),
                ))
            }
            _ => {
                return Err(ConfcomError::UserInput(
                    "imports file must be a JSON object".to_owned(),
                ))
            }
        };

        let fragments = match get_ci_map(&extra, FRAGMENTS_KEY) {
            None => Vec::new(),
            Some(Value::Array(entries)) => entries
                .iter()
                .map(FragmentRef::from_value)
                .collect::<Result<Vec<_>>>()?,
            Some(single @ Value::Object(_)) => vec![FragmentRef::from_value(single)?],
            Some(_) => {
                return Err(ConfcomError::UserInput(
                    "field [\"fragments\"] in imports file can only be a list value".to_owned(),
                ))
            }
        };
        extra.retain(|key, _| !key.eq_ignore_ascii_case(FRAGMENTS_KEY));

        Ok(Self { extra, fragments })
    }

    /// Load `path`, or an empty file if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfcomError::io(path, e)),
        };
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Self::from_value(parse_json(&text, &path.display().to_string())?)
    }

    /// Fragments currently listed.
    pub fn fragments(&self) -> &[FragmentRef] {
        &self.fragments
    }

    /// Append `imports`, dropping ones already listed.
    pub fn append(&mut self, imports: impl IntoIterator<Item = FragmentRef>) {
        let mut fragments = std::mem::take(&mut self.fragments);
        fragments.extend(imports);
        self.fragments = dedup_fragments(fragments);
    }

    /// Serialize as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error only if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String> {
        let mut document = self.extra.clone();
        document.insert(
            FRAGMENTS_KEY.to_owned(),
            serde_json::to_value(&self.fragments)
                .map_err(|e| ConfcomError::json("imports file", e))?,
        );
        serde_json::to_string_pretty(&Value::Object(document))
            .map_err(|e| ConfcomError::json("imports file", e))
    }

    /// Write to `path`, replacing any existing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut text = self.to_json_pretty()?;
        text.push('\n');
        std::fs::write(path, text).map_err(|e| ConfcomError::io(path, e))
    }
}
