//! Input guards applied before anything reaches a connection.
//!
//! Three independent checks live here:
//! - filter-value sanitization for the fluent `where` path,
//! - the read-only / parameter guards for raw SQL,
//! - identifier validation for table, column and relation names that are
//!   spliced into generated SQL.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{QuarryError, QuarryResult};

/// Characters removed from every string filter value.
const STRIPPED_CHARS: &[char] = &[';', '\'', '"', '\\'];

/// SQL line-comment marker.
const COMMENT_SEQUENCE: &str = "--";

/// PostgreSQL truncates identifiers beyond this length.
pub const MAX_IDENTIFIER_LEN: usize = 63;

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid identifier regex"));

/// Strip `; ' " \` and then every `--` from a filter string.
///
/// The comment sequence is removed in a single left-to-right pass, so
/// `"x---y"` becomes `"x-y"`. The output never contains `--`.
pub fn sanitize_str(input: &str) -> String {
    let stripped: String = input.chars().filter(|c| !STRIPPED_CHARS.contains(c)).collect();
    stripped.replace(COMMENT_SEQUENCE, "")
}

/// Sanitize every string nested inside a filter value.
///
/// Object keys are left alone (they are operator names or column names,
/// which go through [`validate_identifier`] at render time); only values
/// are rewritten.
pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_str(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, v)| (key, sanitize_value(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Reject raw statements that do not start with `SELECT` (case-insensitive,
/// after trimming).
pub fn validate_read_only(sql: &str) -> QuarryResult<()> {
    let head: String = sql.trim_start().chars().take(6).collect();
    if head.eq_ignore_ascii_case("select") {
        Ok(())
    } else {
        Err(QuarryError::validation(
            "Only SELECT statements may be executed through the raw query path",
        ))
    }
}

/// Reject raw-query parameters that are structured values or carry a
/// comment sequence.
///
/// Objects and arrays both count as structured. `null`, booleans, numbers
/// and strings are accepted.
pub fn validate_params(params: &[Value]) -> QuarryResult<()> {
    for (index, param) in params.iter().enumerate() {
        match param {
            Value::Object(_) | Value::Array(_) => {
                return Err(QuarryError::security(format!(
                    "Parameter ${} is a structured value; only scalars are allowed",
                    index + 1
                )));
            }
            Value::String(s) if s.contains(COMMENT_SEQUENCE) => {
                return Err(QuarryError::security(format!(
                    "Parameter ${} contains a SQL comment sequence",
                    index + 1
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Check that a name is safe to splice into SQL as a quoted identifier.
pub fn validate_identifier(name: &str) -> QuarryResult<()> {
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(QuarryError::security(format!(
            "Identifier too long ({} > {}): {}",
            name.len(),
            MAX_IDENTIFIER_LEN,
            name
        )));
    }
    if !IDENTIFIER.is_match(name) {
        return Err(QuarryError::security(format!(
            "Forbidden characters in identifier: {:?}",
            name
        )));
    }
    Ok(())
}

/// Validate and double-quote an identifier.
pub fn quote_identifier(name: &str) -> QuarryResult<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name))
}
