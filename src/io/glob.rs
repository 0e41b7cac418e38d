//! File globbing for multi-file sources.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Expand a glob pattern into a sorted vector of matching file paths.
///
/// Supports the usual syntax (`*`, `?`, `**`, `[abc]`). Directories are
/// excluded and results are sorted for deterministic partition order. A
/// pattern with no matches returns an empty vector, not an error.
pub fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>> {
    let paths =
        glob::glob(pattern).with_context(|| format!("invalid glob pattern: {pattern}"))?;

    let mut result = Vec::new();
    for entry in paths {
        let path =
            entry.with_context(|| format!("error reading glob entry for pattern: {pattern}"))?;
        if path.is_file() {
            result.push(path);
        }
    }
    result.sort();
    Ok(result)
}

/// List a directory (non-recursively) in sorted order, files only.
pub fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut result = Vec::new();
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("list directory {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() {
            result.push(path);
        }
    }
    result.sort();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn glob_matches_are_sorted_files_only() -> Result<()> {
        let dir = TempDir::new()?;
        let base = dir.path();
        File::create(base.join("c.txt"))?;
        File::create(base.join("a.txt"))?;
        File::create(base.join("b.csv"))?;
        std::fs::create_dir(base.join("sub.txt"))?;

        let files = expand_glob(&format!("{}/*.txt", base.display()))?;
        assert_eq!(files.len(), 2);
        assert!(files[0] < files[1]);
        Ok(())
    }

    #[test]
    fn missing_matches_are_not_an_error() -> Result<()> {
        let dir = TempDir::new()?;
        let files = expand_glob(&format!("{}/*.none", dir.path().display()))?;
        assert!(files.is_empty());
        Ok(())
    }
}
