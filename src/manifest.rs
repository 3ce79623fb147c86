//! In-place rewriting of package manifest address fields.
//!
//! A package publishes with its named address set to the zero sentinel and
//! is then pinned to the address it was published at. Pre- and post-publish
//! patterns never overlap: the first matches any hex value, the second only
//! the sentinel.
use crate::atomic::write_atomic;
use crate::error::{DeployError, Result};
use regex::Regex;
use std::fs;
use std::path::Path;

/// Address value a field holds between blanking and publishing.
pub const SENTINEL_ADDRESS: &str = "0x0";

/// Apply `pattern` → `replacement` to the whole manifest.
///
/// `replacement` uses regex expansion syntax (`${1}`). Returns whether the
/// text changed; an unchanged manifest is left untouched on disk.
pub fn rewrite(manifest_path: &Path, pattern: &Regex, replacement: &str) -> Result<bool> {
    let text = fs::read_to_string(manifest_path)
        .map_err(|err| DeployError::io("read", manifest_path, err))?;
    let rewritten = pattern.replace_all(&text, replacement);
    if rewritten == text {
        tracing::debug!(path = %manifest_path.display(), %pattern, "manifest already up to date");
        return Ok(false);
    }
    write_atomic(manifest_path, rewritten.as_bytes())?;
    tracing::debug!(path = %manifest_path.display(), %pattern, "manifest rewritten");
    Ok(true)
}

/// The `key = "0x…"` fields of one manifest that track a published address.
#[derive(Debug, Clone)]
pub struct AddressFields {
    any_value: Regex,
    sentinel_value: Regex,
}

impl AddressFields {
    pub fn new(fields: &[String]) -> Result<Self> {
        if fields.is_empty() {
            return Err(DeployError::InvalidConfig(
                "address_fields must name at least one field".to_string(),
            ));
        }
        let keys = fields
            .iter()
            .map(|field| regex::escape(field))
            .collect::<Vec<_>>()
            .join("|");
        let compile = |value: &str| {
            Regex::new(&format!(r#"(?m)^(\s*(?:{keys})\s*=\s*)"{value}""#)).map_err(|err| {
                DeployError::InvalidConfig(format!("address field pattern: {err}"))
            })
        };
        Ok(Self {
            any_value: compile("0x[0-9a-fA-F]*")?,
            sentinel_value: compile(&regex::escape(SENTINEL_ADDRESS))?,
        })
    }

    /// Blank every tracked field to the sentinel.
    pub fn reset(&self, manifest_path: &Path) -> Result<bool> {
        rewrite(
            manifest_path,
            &self.any_value,
            &format!("${{1}}\"{SENTINEL_ADDRESS}\""),
        )
    }

    /// Fill sentinel fields with the published `address`.
    pub fn pin(&self, manifest_path: &Path, address: &str) -> Result<bool> {
        let address = address.replace('$', "$$");
        rewrite(
            manifest_path,
            &self.sentinel_value,
            &format!("${{1}}\"{address}\""),
        )
    }
}
