//! Publish-result cache.
//!
//! A publish is expensive and not repeatable against the same network, so its
//! JSON output is kept next to the package sources and reused on later runs.
use crate::atomic::write_atomic;
use crate::error::{DeployError, Result};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Result of [`ArtifactCache::load_or_build`].
#[derive(Debug, Clone)]
pub struct CacheOutcome {
    pub document: Value,
    /// True when `build` ran during this call.
    pub fresh: bool,
}

#[derive(Debug, Clone)]
pub struct ArtifactCache {
    path: PathBuf,
}

impl ArtifactCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the cached document, or run `build` and persist its result.
    ///
    /// Nothing is written when `build` fails. A cached document is trusted as-is;
    /// it is stale if the target network was reset since it was written.
    pub fn load_or_build<F>(&self, build: F) -> Result<CacheOutcome>
    where
        F: FnOnce() -> Result<Value>,
    {
        if self.path.is_file() {
            let bytes =
                fs::read(&self.path).map_err(|err| DeployError::io("read", &self.path, err))?;
            let document =
                serde_json::from_slice(&bytes).map_err(|source| DeployError::CacheCorrupt {
                    path: self.path.clone(),
                    source,
                })?;
            tracing::warn!(
                path = %self.path.display(),
                "reusing cached publish result; delete it if the network was reset"
            );
            return Ok(CacheOutcome {
                document,
                fresh: false,
            });
        }

        let document = build()?;
        let text = serde_json::to_string_pretty(&document).map_err(|source| {
            DeployError::CacheCorrupt {
                path: self.path.clone(),
                source,
            }
        })?;
        write_atomic(&self.path, text.as_bytes())?;
        tracing::info!(path = %self.path.display(), "cached publish result");
        Ok(CacheOutcome {
            document,
            fresh: true,
        })
    }
}
