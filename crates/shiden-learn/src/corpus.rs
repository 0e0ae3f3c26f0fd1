//! 棋譜ファイルの列挙

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// ディレクトリ直下の `.csa` ファイルをソート順で列挙する
pub fn enumerate_kifu(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read kifu directory: {}", dir.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_csa = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("csa"));
        if path.is_file() && is_csa {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerate_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.csa"), "PI\n").unwrap();
        std::fs::write(dir.path().join("a.csa"), "PI\n").unwrap();
        std::fs::write(dir.path().join("note.txt"), "x").unwrap();

        let files = enumerate_kifu(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.csa"));
        assert!(files[1].ends_with("b.csa"));
    }

    #[test]
    fn test_enumerate_missing_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(enumerate_kifu(&missing).is_err());
    }
}
