//! Namespaced JSON key-value persistence
//!
//! One file per namespace under a base directory. This backs the mutation
//! queue, the market-data snapshot and the per-entity sync watermarks.
//! Losing or corrupting a file is never a correctness hazard (every
//! consumer degrades to an empty state and re-syncs), so reads swallow
//! parse failures with a warning instead of propagating them.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.json"))
    }

    /// Load the value stored under `namespace`, if any
    ///
    /// A missing file and an unreadable file both yield `None`.
    pub fn load<T: DeserializeOwned>(&self, namespace: &str) -> Option<T> {
        let path = self.path_for(namespace);
        if !path.exists() {
            return None;
        }
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read store file");
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "corrupt store file, starting empty");
                None
            }
        }
    }

    /// Persist `value` under `namespace`
    ///
    /// Writes to a temp file first and renames, so a crash mid-write leaves
    /// the previous snapshot intact.
    pub fn save<T: Serialize>(&self, namespace: &str, value: &T) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create store dir {}", self.dir.display()))?;

        let path = self.path_for(namespace);
        let tmp_path = self.dir.join(format!("{namespace}.json.tmp"));
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(&tmp_path, json)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Remove the file backing `namespace`, if present
    pub fn remove(&self, namespace: &str) -> Result<()> {
        let path = self.path_for(namespace);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}
