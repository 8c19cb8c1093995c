//! Atomic state file writes

use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};

/// Write `contents` to `path` atomically.
///
/// Writes a temporary file in the same directory, then renames it over the
/// target, so a crash mid-write never leaves a truncated state file behind.
/// On unix the file is created with 0600 permissions.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    if !dir.exists() {
        tokio::fs::create_dir_all(dir).await?;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Config(format!("invalid state file path: {}", path.display())))?;
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, contents).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms).await?;
    }

    tokio::fs::rename(&tmp_path, path).await?;

    debug!(path = %path.display(), bytes = contents.len(), "persisted state file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_and_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");

        write_atomic(&path, b"{\"a\":1}").await.unwrap();
        write_atomic(&path, b"{\"b\":2}").await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "{\"b\":2}");
    }

    #[tokio::test]
    async fn creates_missing_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_atomic(&path, b"[]").await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        write_atomic(&path, b"{}").await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["state.json"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"{}").await.unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "state file must be 0600, got {mode:o}");
    }
}
