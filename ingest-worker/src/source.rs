use std::path::{Component, Path, PathBuf};

use crate::error::SourceError;

/// Maps submitted source paths to files under a root directory.
///
/// Relative paths are joined to the root. Absolute paths are accepted only if
/// they are inside it. `..` components are rejected outright so a path can't
/// climb out of the root.
#[derive(Debug, Clone)]
pub struct SourceResolver {
    root: PathBuf,
}

impl SourceResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve(&self, source_path: &str) -> Result<PathBuf, SourceError> {
        let invalid = |reason: &'static str| SourceError::InvalidPath {
            path: source_path.to_owned(),
            reason,
        };

        let trimmed = source_path.trim();
        if trimmed.is_empty() {
            return Err(invalid("path is empty"));
        }

        let path = Path::new(trimmed);
        if path
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            return Err(invalid("parent directory components are not allowed"));
        }

        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        if !resolved.starts_with(&self.root) {
            return Err(invalid("path is outside of the source root"));
        }
        if resolved == self.root {
            return Err(invalid("path is the source root itself"));
        }

        Ok(resolved)
    }
}
