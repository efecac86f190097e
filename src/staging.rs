//! Per-session staging workspace
//!
//! Creates a temporary directory per session, writes the client-supplied
//! file set into it, and guarantees recursive removal when the session ends.
//! The staging directory is also the child process's working directory.
//!
//! Path safety: every `files` key is validated before anything is written.
//! Absolute paths, `..` components, and `~`-prefixed paths are rejected --
//! the original Python implementation did not enforce this, but this crate
//! requires it (see `SPEC_FULL.md` §9).

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

use crate::error::{CwcError, Result};

/// A session's scoped staging directory.
#[derive(Debug)]
pub struct StagingDir {
    dir: TempDir,
}

impl StagingDir {
    /// Create a fresh staging directory and materialize `files` into it.
    ///
    /// Returns an error (and leaves no partially-written files reachable by
    /// the caller, since the whole `TempDir` is dropped) if any key fails
    /// path validation or a write fails.
    pub async fn create(files: &HashMap<String, String>) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("aiy-")
            .tempdir()
            .map_err(|e| anyhow::anyhow!(CwcError::Staging(format!("create temp dir: {e}"))))?;

        let staging = Self { dir };

        for (name, contents) in files {
            staging.write_file(name, contents).await?;
        }

        Ok(staging)
    }

    /// The absolute path to the staging root. Also the child's working
    /// directory.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    async fn write_file(&self, name: &str, contents: &str) -> Result<()> {
        let target = validate_relative_path(self.dir.path(), name)?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| anyhow::anyhow!(CwcError::Staging(format!("create parent dirs for {name}: {e}"))))?;
        }

        let mut file = tokio::fs::File::create(&target)
            .await
            .map_err(|e| anyhow::anyhow!(CwcError::Staging(format!("create {name}: {e}"))))?;
        file.write_all(contents.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!(CwcError::Staging(format!("write {name}: {e}"))))?;
        file.flush()
            .await
            .map_err(|e| anyhow::anyhow!(CwcError::Staging(format!("flush {name}: {e}"))))?;
        Ok(())
    }

    /// Recursively remove the staging directory. Failure is logged by the
    /// caller and does not change the session's reported outcome.
    pub async fn close(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&path))
            .await
            .map_err(|e| anyhow::anyhow!(CwcError::Staging(format!("join error during cleanup: {e}"))))?
            .map_err(|e| anyhow::anyhow!(CwcError::Staging(format!("remove staging dir: {e}"))))?;
        // `self.dir` drops here; TempDir's own removal attempt on an
        // already-gone directory is a silently ignored no-op.
        Ok(())
    }
}

/// Validate that `name` is a safe relative path and resolve it against
/// `root`. Rejects absolute paths, `..` traversal, and `~` expansion.
fn validate_relative_path(root: &Path, name: &str) -> Result<PathBuf> {
    let candidate = Path::new(name);

    if candidate.is_absolute() {
        anyhow::bail!(CwcError::PathTraversal(format!("absolute path: {name}")));
    }
    if name.starts_with('~') {
        anyhow::bail!(CwcError::PathTraversal(format!("home-relative path: {name}")));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        anyhow::bail!(CwcError::PathTraversal(format!("parent traversal: {name}")));
    }
    if name.is_empty() {
        anyhow::bail!(CwcError::PathTraversal("empty path".to_string()));
    }

    Ok(root.join(candidate))
}
