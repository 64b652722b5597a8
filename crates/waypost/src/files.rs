//! Session file storage under `{root}/{session_id}/{file_id}/{name}`.
//!
//! Every component of a stored path is sanitized before it touches the
//! filesystem, the resolved location must stay inside the configured root,
//! and symlinks are refused on the way back out.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilePathError {
    #[error("invalid path component")]
    InvalidComponent,
    #[error("file name is empty after sanitization")]
    EmptyName,
    #[error("resolved path escapes the storage root")]
    OutsideRoot,
    #[error("refusing to serve a symlink")]
    Symlink,
}

/// Reject anything that is not a plain single-segment name: no `.`, no
/// `..`, no separators, no NUL.
pub fn validate_component(component: &str) -> Result<(), FilePathError> {
    if component.is_empty() || component == "." || component == ".." {
        return Err(FilePathError::InvalidComponent);
    }
    if component
        .chars()
        .any(|c| c == '/' || c == '\\' || c == '\0')
    {
        return Err(FilePathError::InvalidComponent);
    }
    Ok(())
}

/// Reduce an arbitrary client-supplied file name to a safe base name:
/// backslashes become underscores, path separators are stripped to the last
/// segment, `.`/`..` map to `download`.
pub fn sanitize_filename(name: &str) -> Result<String, FilePathError> {
    let base = name.rsplit('/').next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| if c == '\\' || c == '\0' { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() {
        return Err(FilePathError::EmptyName);
    }
    if cleaned == "." || cleaned == ".." {
        return Ok("download".to_string());
    }
    Ok(cleaned.to_string())
}

/// Build `{root}/{session_id}/{file_id}/{name}` and prove the result stays
/// under `root`. All three dynamic components must already be validated;
/// this re-checks with path arithmetic as the final arbiter.
pub fn storage_path(
    root: &Path,
    session_id: &str,
    file_id: &str,
    name: &str,
) -> Result<PathBuf, FilePathError> {
    validate_component(session_id)?;
    validate_component(file_id)?;
    validate_component(name)?;

    let path = root.join(session_id).join(file_id).join(name);

    // Structural containment: every component below root must be normal.
    let relative = path.strip_prefix(root).map_err(|_| FilePathError::OutsideRoot)?;
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(FilePathError::OutsideRoot);
    }
    Ok(path)
}

/// Write file bytes at the storage path, creating parents.
pub async fn store_file(
    root: &Path,
    session_id: &str,
    file_id: &str,
    name: &str,
    bytes: &[u8],
) -> Result<PathBuf> {
    let path = storage_path(root, session_id, file_id, name)
        .map_err(|e| anyhow::anyhow!("invalid file path: {e}"))?;
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("storage path has no parent"))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating file directory: {}", parent.display()))?;
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing file: {}", path.display()))?;
    Ok(path)
}

/// Locate the single file stored for `{session_id}/{file_id}`, refusing
/// symlinks. Returns the path and the file name.
pub async fn locate_file(
    root: &Path,
    session_id: &str,
    file_id: &str,
) -> Result<Option<(PathBuf, String)>> {
    validate_component(session_id).map_err(|e| anyhow::anyhow!("invalid session id: {e}"))?;
    validate_component(file_id).map_err(|e| anyhow::anyhow!("invalid file id: {e}"))?;

    let dir = root.join(session_id).join(file_id);
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", dir.display())),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("iterating {}", dir.display()))?
    {
        let meta = tokio::fs::symlink_metadata(entry.path())
            .await
            .context("reading file metadata")?;
        if meta.file_type().is_symlink() {
            anyhow::bail!("{}", FilePathError::Symlink);
        }
        if meta.is_file() {
            let name = entry.file_name().to_string_lossy().into_owned();
            return Ok(Some((entry.path(), name)));
        }
    }
    Ok(None)
}

/// `Content-Disposition: attachment` with both the plain and the RFC 5987
/// encoded name.
pub fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || ".-_ ".contains(c) { c } else { '_' })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(name)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_reject_traversal() {
        assert!(validate_component("ok-name_1").is_ok());
        assert_eq!(validate_component(".."), Err(FilePathError::InvalidComponent));
        assert_eq!(validate_component("."), Err(FilePathError::InvalidComponent));
        assert_eq!(validate_component("a/b"), Err(FilePathError::InvalidComponent));
        assert_eq!(validate_component("a\\b"), Err(FilePathError::InvalidComponent));
        assert_eq!(validate_component(""), Err(FilePathError::InvalidComponent));
    }

    #[test]
    fn filenames_reduce_to_base_names() {
        assert_eq!(sanitize_filename("report.pdf").unwrap(), "report.pdf");
        assert_eq!(sanitize_filename("a/b/c.txt").unwrap(), "c.txt");
        assert_eq!(sanitize_filename("evil\\name").unwrap(), "evil_name");
        assert_eq!(sanitize_filename("..").unwrap(), "download");
        assert!(sanitize_filename("   ").is_err());
    }

    #[test]
    fn storage_path_stays_under_root() {
        let root = Path::new("/srv/files");
        let path = storage_path(root, "sess_1", "f1", "out.txt").unwrap();
        assert!(path.starts_with(root));
        assert!(storage_path(root, "..", "f1", "x").is_err());
        assert!(storage_path(root, "sess_1", "f1", "../x").is_err());
    }

    #[tokio::test]
    async fn store_and_locate_round_trip() {
        let temp = tempfile::TempDir::new().unwrap();
        let root = temp.path();

        store_file(root, "sess_1", "f1", "hello.txt", b"hi")
            .await
            .unwrap();
        let (path, name) = locate_file(root, "sess_1", "f1").await.unwrap().unwrap();
        assert_eq!(name, "hello.txt");
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hi");

        assert!(locate_file(root, "sess_1", "missing").await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_refused() {
        let temp = tempfile::TempDir::new().unwrap();
        let root = temp.path();
        let secret = temp.path().join("secret.txt");
        tokio::fs::write(&secret, b"secret").await.unwrap();

        let dir = root.join("sess_1").join("f1");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        std::os::unix::fs::symlink(&secret, dir.join("link.txt")).unwrap();

        assert!(locate_file(root, "sess_1", "f1").await.is_err());
    }

    #[test]
    fn disposition_encodes_unicode_names() {
        let header = content_disposition("résumé.pdf");
        assert!(header.contains("filename*=UTF-8''r%C3%A9sum%C3%A9.pdf"));
        assert!(header.starts_with("attachment; filename=\"r_sum_.pdf\""));
    }
}
