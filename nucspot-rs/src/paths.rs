use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

/// Resolve a required source root; it must be an existing directory.
pub fn source_root(path: &Path) -> Result<PathBuf> {
    if !path.is_dir() {
        return Err(PipelineError::MissingDirectory(path.to_path_buf()));
    }
    Ok(path.to_path_buf())
}

/// Create `path` (and parents) unless it already exists as a directory.
pub fn ensure_dir(path: &Path) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            return Err(PipelineError::DestinationConflict(path.to_path_buf()));
        }
        return Ok(());
    }
    fs::create_dir_all(path)?;
    Ok(())
}

/// Directory of `source` relative to `source_root`, or empty when outside it.
pub fn relative_parent(source_root: &Path, source: &Path) -> PathBuf {
    source
        .strip_prefix(source_root)
        .ok()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

/// Destination directory mirroring `source`'s position under `source_root`.
pub fn mirrored_dir(destination_root: &Path, source_root: &Path, source: &Path) -> Result<PathBuf> {
    let dir = destination_root.join(relative_parent(source_root, source));
    ensure_dir(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_dir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a").join("b");
        ensure_dir(&target).unwrap();
        ensure_dir(&target).unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn ensure_dir_rejects_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("taken");
        fs::write(&target, b"x").unwrap();
        let err = ensure_dir(&target).unwrap_err();
        assert!(matches!(err, PipelineError::DestinationConflict(_)));
        assert!(err.is_run_fatal());
    }

    #[test]
    fn mirrors_relative_directories() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let source = src.path().join("plate").join("well").join("x.tif");
        let dir = mirrored_dir(dst.path(), src.path(), &source).unwrap();
        assert_eq!(dir, dst.path().join("plate").join("well"));
        assert!(dir.is_dir());
    }

    #[test]
    fn source_root_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(source_root(dir.path()).is_ok());
        assert!(matches!(
            source_root(&dir.path().join("nope")),
            Err(PipelineError::MissingDirectory(_))
        ));
    }
}
