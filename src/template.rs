//! `{name}` substitution inside single argument tokens.
use crate::error::{DeployError, Result};
use std::collections::BTreeMap;

/// Named values visible to argument templates.
///
/// Scopes nest: a child sees every parent binding and may shadow it, and
/// dropping the child discards whatever it captured.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    values: BTreeMap<String, String>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn scope(&self) -> Self {
        self.clone()
    }

    /// Expand every placeholder in `template`; `step` labels errors.
    pub fn render(&self, template: &str, step: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for next in chars.by_ref() {
                        if next == '}' {
                            closed = true;
                            break;
                        }
                        name.push(next);
                    }
                    if !closed {
                        return Err(invalid(template, "unclosed `{`"));
                    }
                    let name = name.trim();
                    if name.is_empty() {
                        return Err(invalid(template, "empty placeholder"));
                    }
                    let value = self.get(name).ok_or_else(|| DeployError::UnboundVariable {
                        step: step.to_string(),
                        name: name.to_string(),
                    })?;
                    out.push_str(value);
                }
                '}' => return Err(invalid(template, "unmatched `}`")),
                other => out.push(other),
            }
        }
        Ok(out)
    }

    pub fn render_all(&self, templates: &[String], step: &str) -> Result<Vec<String>> {
        templates
            .iter()
            .map(|template| self.render(template, step))
            .collect()
    }
}

fn invalid(template: &str, reason: &str) -> DeployError {
    DeployError::InvalidTemplate {
        template: template.to_string(),
        reason: reason.to_string(),
    }
}
