// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Configuration rendering and durable writes.

use crate::SupervisorError;
use posbridge::BridgeConfig;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// A validated configuration, rendered to TOML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub toml: String,
    /// Hash of `toml`. Equal identities mean equal files.
    pub identity: u64,
}

/// Validate an `app` document and render it.
pub fn render(doc: &Value) -> Result<RenderedConfig, SupervisorError> {
    let config = BridgeConfig::from_document(doc)?;
    let toml = format!(
        "# Rendered by posbridge-supervisor. Local edits are overwritten.\n\n{}",
        config.to_toml()?
    );
    let identity = identity_of(&toml);
    Ok(RenderedConfig { toml, identity })
}

pub fn identity_of(contents: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    contents.hash(&mut hasher);
    hasher.finish()
}

/// Replace `path` with `contents` via temp file, fsync and rename.
pub fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    write_atomic_with(path, contents, |_| Ok(()))
}

/// [`write_atomic`] with a hook run between the temp write and the rename.
///
/// A hook error aborts the write: the temp file is removed and `path` keeps
/// its previous contents.
pub fn write_atomic_with<F>(path: &Path, contents: &str, before_rename: F) -> io::Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;

    before_rename(tmp.path())?;

    tmp.persist(path).map_err(|e| e.error)?;

    #[cfg(unix)]
    if let Ok(handle) = std::fs::File::open(dir) {
        let _ = handle.sync_all();
    }

    Ok(())
}
