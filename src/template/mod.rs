//! ARM template loading and case-insensitive field access.
//!
//! ARM treats property names case-insensitively, so every lookup into a
//! template goes through [`get_ci`].

use std::path::Path;

use serde_json::{Map, Value};

use crate::error::{ConfcomError, Result};

mod evaluate;

pub(crate) use evaluate::contains_reference;
pub use evaluate::{evaluate, EvaluatedTemplate};

/// Look up `key` in a JSON object, preferring an exact match and falling
/// back to an ASCII case-insensitive one.
///
/// Returns `None` for non-objects and for explicit `null` values.
pub fn get_ci<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    let object = value.as_object()?;
    get_ci_map(object, key)
}

/// [`get_ci`] over an already-unwrapped object.
pub fn get_ci_map<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    let found = object.get(key).or_else(|| {
        object
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value)
    })?;
    if found.is_null() {
        None
    } else {
        Some(found)
    }
}

/// Read a whole file as UTF-8 text.
pub(crate) fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| ConfcomError::io(path, e))
}

/// Parse JSON text, labelling errors with `context`.
pub(crate) fn parse_json(text: &str, context: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|e| ConfcomError::json(context, e))
}

/// A raw ARM template: `parameters`, `variables` and `resources`.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    document: Value,
}

impl Template {
    /// Wrap a parsed template document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfcomError::UserInput`] if the document is not a JSON object.
    pub fn from_value(document: Value) -> Result<Self> {
        if !document.is_object() {
            return Err(ConfcomError::UserInput(
                "ARM template must be a JSON object".to_owned(),
            ));
        }
        Ok(Self { document })
    }

    /// Parse a template from JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a JSON object.
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_value(parse_json(text, "ARM template")?)
    }

    /// Load a template from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a JSON object.
    pub fn load(path: &Path) -> Result<Self> {
        let text = read_text(path)?;
        Self::from_value(parse_json(&text, &path.display().to_string())?)
    }

    /// The whole template document.
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Declared parameters (`name → {value | defaultValue | type}`).
    pub fn parameters(&self) -> Option<&Map<String, Value>> {
        get_ci(&self.document, "parameters").and_then(Value::as_object)
    }

    /// Declared variables (`name → value`).
    pub fn variables(&self) -> Option<&Map<String, Value>> {
        get_ci(&self.document, "variables").and_then(Value::as_object)
    }
}

/// Parameter values supplied from outside the template (a parameters file).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterValues {
    values: Map<String, Value>,
}

impl ParameterValues {
    /// An empty set of supplied values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Supply `value` for parameter `name`.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Supplied value for `name`, matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<&Value> {
        get_ci_map(&self.values, name)
    }

    /// Names of all supplied parameters.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Read values out of an ARM parameters document
    /// (`{"parameters": {"p": {"value": ...}}}`; `secureValue` is accepted
    /// when `value` is absent).
    ///
    /// # Errors
    ///
    /// Returns [`ConfcomError::UserInput`] when the `parameters` field is
    /// missing or an entry carries neither `value` nor `secureValue`.
    pub fn from_document(document: &Value) -> Result<Self> {
        let entries = get_ci(document, "parameters")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                ConfcomError::UserInput(
                    "field [\"parameters\"] is empty or cannot be found in parameters file"
                        .to_owned(),
                )
            })?;

        let mut values = Self::new();
        for (name, entry) in entries {
            let value = get_ci(entry, "value")
                .or_else(|| get_ci(entry, "secureValue"))
                .ok_or_else(|| {
                    ConfcomError::UserInput(format!(
                        "parameter [\"{name}\"] in parameters file has no value"
                    ))
                })?;
            values.insert(name.clone(), value.clone());
        }
        Ok(values)
    }

    /// Load values from an ARM parameters file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is malformed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = read_text(path)?;
        Self::from_document(&parse_json(&text, &path.display().to_string())?)
    }

    /// Check that every supplied parameter is declared by `template`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfcomError::UserInput`] naming the first undeclared parameter.
    pub fn ensure_declared(&self, template: &Template) -> Result<()> {
        for name in self.names() {
            let declared = template
                .parameters()
                .is_some_and(|params| get_ci_map(params, name).is_some());
            if !declared {
                return Err(ConfcomError::UserInput(format!(
                    "parameter [\"{name}\"] is empty or cannot be found in ARM template"
                )));
            }
        }
        Ok(())
    }
}
