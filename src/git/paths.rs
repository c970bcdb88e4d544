use std::path::{Component, Path, PathBuf};

use crate::error::GitError;

/// Lexical check: relative, no `..`, no root or drive prefix.
///
/// Runs before any filesystem access so a hostile path never reaches `stat`.
pub fn validate_relative(path: &str) -> Result<(), GitError> {
    if path.starts_with('/') || path.starts_with('\\') || path.contains('\0') {
        return Err(GitError::PathEscapes(path.to_string()));
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(GitError::PathEscapes(path.to_string()));
            }
        }
    }
    Ok(())
}

/// Resolve `relative` under `root`, rejecting anything that escapes it,
/// including through symlinks inside the working copy.
pub fn confine(root: &Path, relative: &str) -> Result<PathBuf, GitError> {
    validate_relative(relative)?;

    let joined = root.join(relative);
    if !joined.exists() {
        return Ok(joined);
    }

    let canonical_root = root.canonicalize()?;
    let canonical = joined.canonicalize()?;
    if !canonical.starts_with(&canonical_root) {
        return Err(GitError::PathEscapes(relative.to_string()));
    }
    Ok(canonical)
}
