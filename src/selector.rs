//! Named-path access into decoded client output.
//!
//! Client JSON is addressed with dotted paths such as
//! `events[0].parsedJson.node_small_id.inner`. A lookup that falls off the
//! document reports the full path and the first segment that was missing.
use crate::error::{DeployError, Result};
use regex::Regex;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed output path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    raw: String,
    segments: Vec<Segment>,
}

impl Selector {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| DeployError::InvalidSelector {
            selector: raw.to_string(),
            reason: reason.to_string(),
        };
        if raw.trim().is_empty() {
            return Err(invalid("selector is empty"));
        }
        let mut segments = Vec::new();
        for part in raw.split('.') {
            let (key, mut rest) = match part.find('[') {
                Some(idx) => (&part[..idx], &part[idx..]),
                None => (part, ""),
            };
            if key.is_empty() && (segments.is_empty() || rest.is_empty()) {
                return Err(invalid("empty key segment"));
            }
            if !key.is_empty() {
                segments.push(Segment::Key(key.to_string()));
            }
            while !rest.is_empty() {
                let close = rest.find(']').ok_or_else(|| invalid("unclosed `[`"))?;
                let index = rest[1..close]
                    .parse::<usize>()
                    .map_err(|_| invalid("index must be a non-negative integer"))?;
                segments.push(Segment::Index(index));
                rest = &rest[close + 1..];
                if !rest.is_empty() && !rest.starts_with('[') {
                    return Err(invalid("unexpected text after `]`"));
                }
            }
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Walk `doc`, failing with the prefix that could not be resolved.
    pub fn select<'a>(&self, doc: &'a Value, context: &str) -> Result<&'a Value> {
        let mut current = doc;
        let mut walked = String::new();
        for segment in &self.segments {
            let next = match segment {
                Segment::Key(key) => {
                    if !walked.is_empty() {
                        walked.push('.');
                    }
                    walked.push_str(key);
                    current.get(key.as_str())
                }
                Segment::Index(index) => {
                    walked.push_str(&format!("[{index}]"));
                    current.get(*index)
                }
            };
            current = next.ok_or_else(|| DeployError::UnexpectedOutputShape {
                context: context.to_string(),
                path: self.raw.clone(),
                missing: walked.clone(),
            })?;
        }
        Ok(current)
    }

    /// Select a scalar and render it as an identifier string.
    pub fn select_id(&self, doc: &Value, context: &str) -> Result<String> {
        let value = self.select(doc, context)?;
        scalar_to_id(value).ok_or_else(|| DeployError::UnexpectedOutputShape {
            context: format!("{context} (expected a scalar, found {})", kind_name(value)),
            path: self.raw.clone(),
            missing: self.raw.clone(),
        })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Find the last entry of `list` whose `key` matches `pattern` and return its `field`.
///
/// The last match wins when several entries qualify.
pub fn match_in_list(
    doc: &Value,
    list: &Selector,
    key: &str,
    pattern: &Regex,
    field: &str,
    context: &str,
) -> Result<String> {
    let entries = list
        .select(doc, context)?
        .as_array()
        .ok_or_else(|| DeployError::UnexpectedOutputShape {
            context: format!("{context} (expected an array)"),
            path: list.as_str().to_string(),
            missing: list.as_str().to_string(),
        })?;
    let hit = entries.iter().rev().find(|entry| {
        entry
            .get(key)
            .and_then(Value::as_str)
            .is_some_and(|text| pattern.is_match(text))
    });
    let Some(hit) = hit else {
        return Err(DeployError::UnexpectedOutputShape {
            context: format!("{context}: no entry in {list} matched /{pattern}/ on `{key}`"),
            path: format!("{list}[*].{field}"),
            missing: format!("{list}[*]"),
        });
    };
    hit.get(field)
        .and_then(scalar_to_id)
        .ok_or_else(|| DeployError::UnexpectedOutputShape {
            context: context.to_string(),
            path: format!("{list}[*].{field}"),
            missing: field.to_string(),
        })
}

fn scalar_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
