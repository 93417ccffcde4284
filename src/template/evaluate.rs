//! `[parameters('x')]` / `[variables('x')]` substitution.
//!
//! Substitution is textual over the serialized template: one parameters
//! pass, then one variables pass. Text produced by a substitution is never
//! re-scanned by the same pass, so a variable whose value contains a
//! parameter reference keeps that reference verbatim.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::{get_ci, get_ci_map, parse_json, ParameterValues, Template};
use crate::error::{ConfcomError, Result};

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\s*(parameters|variables)\(\s*'([^'\./]+?)'\s*\)\]")
        .expect("reference pattern is a valid regex")
});

/// Matches any leftover parameter or variable reference.
pub(crate) fn contains_reference(text: &str) -> bool {
    REFERENCE.is_match(text)
}

/// A template whose references have been substituted.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatedTemplate {
    document: Value,
}

impl EvaluatedTemplate {
    /// Wrap a document that needs no substitution.
    pub fn from_value(document: Value) -> Self {
        Self { document }
    }

    /// The substituted document.
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// The `resources` array, if present.
    pub fn resources(&self) -> Option<&Vec<Value>> {
        get_ci(&self.document, "resources").and_then(Value::as_array)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReferenceKind {
    Parameters,
    Variables,
}

impl ReferenceKind {
    fn keyword(self) -> &'static str {
        match self {
            Self::Parameters => "parameters",
            Self::Variables => "variables",
        }
    }
}

/// Substitute parameter and variable references in `template`.
///
/// Parameter values are taken from `supplied`, then the declaration's
/// `value`, then its `defaultValue`. Unresolvable references are left as
/// written.
///
/// # Errors
///
/// Returns [`ConfcomError::UserInput`] when `supplied` names a parameter the
/// template does not declare.
pub fn evaluate(template: &Template, supplied: &ParameterValues) -> Result<EvaluatedTemplate> {
    supplied.ensure_declared(template)?;

    let text = serde_json::to_string(template.document())
        .map_err(|e| ConfcomError::json("ARM template", e))?;

    let text = substitute(&text, ReferenceKind::Parameters, |name| {
        resolve_parameter(template, supplied, name)
    })?;
    let text = substitute(&text, ReferenceKind::Variables, |name| {
        template
            .variables()
            .and_then(|vars| get_ci_map(vars, name))
            .cloned()
    })?;

    Ok(EvaluatedTemplate {
        document: parse_json(&text, "evaluated ARM template")?,
    })
}

fn resolve_parameter(template: &Template, supplied: &ParameterValues, name: &str) -> Option<Value> {
    if let Some(value) = supplied.get(name) {
        return Some(value.clone());
    }
    let declared = template.parameters().and_then(|params| get_ci_map(params, name))?;
    get_ci(declared, "value")
        .or_else(|| get_ci(declared, "defaultValue"))
        .cloned()
}

/// One global find/replace pass over serialized JSON.
///
/// A reference that is a whole string literal is replaced, quotes included,
/// by the JSON encoding of its value; an embedded reference is replaced by
/// the escaped string form of the value.
fn substitute(
    text: &str,
    kind: ReferenceKind,
    resolve: impl Fn(&str) -> Option<Value>,
) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;

    for caps in REFERENCE.captures_iter(text) {
        let (Some(whole), Some(keyword), Some(name)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };
        if keyword.as_str() != kind.keyword() {
            continue;
        }
        let Some(value) = resolve(name.as_str()) else {
            continue;
        };

        if is_whole_literal(text, whole.start(), whole.end()) {
            let open = whole.start().saturating_sub(1);
            out.push_str(&text[cursor..open]);
            out.push_str(
                &serde_json::to_string(&value).map_err(|e| ConfcomError::json("substitution", e))?,
            );
            cursor = whole.end().saturating_add(1);
        } else {
            out.push_str(&text[cursor..whole.start()]);
            out.push_str(&escape_for_string(&value)?);
            cursor = whole.end();
        }
    }
    out.push_str(&text[cursor..]);
    Ok(out)
}

/// Whether `text[start..end]` is the entire content of a JSON string literal.
fn is_whole_literal(text: &str, start: usize, end: usize) -> bool {
    let Some(before) = text[..start].strip_suffix('"') else {
        return false;
    };
    if !text[end..].starts_with('"') {
        return false;
    }
    // The opening quote is escaped if an odd number of backslashes precede it.
    let backslashes = before
        .chars()
        .rev()
        .take_while(|c| *c == '\\')
        .count();
    backslashes & 1 == 0
}

fn escape_for_string(value: &Value) -> Result<String> {
    let plain = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let quoted = serde_json::to_string(&Value::String(plain))
        .map_err(|e| ConfcomError::json("substitution", e))?;
    Ok(quoted
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(&quoted)
        .to_owned())
}
