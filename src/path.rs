//! Path Validator (component A): normalizes and rejects unsafe relative
//! paths before they ever touch the filesystem.

use crate::error::WikiError;
use std::path::{Component, Path, PathBuf};

/// A path that has passed [`validate`]: relative, forward-slash, `.md`/
/// `.markdown`-suffixed, and lexically contained under the configured root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPath {
    /// Slash-normalized path relative to the wiki root, extension included.
    pub relative: String,
    /// The absolute filesystem path the relative path resolves to.
    pub absolute: PathBuf,
}

impl ValidatedPath {
    pub fn display_relative(&self) -> &str {
        &self.relative
    }
}

/// Validates a user-supplied path against `root`, appending a markdown
/// extension when one is missing. See spec §4.1 for the rule ordering.
pub fn validate(root: &Path, input: &str) -> Result<ValidatedPath, WikiError> {
    let trimmed = input.trim();

    if trimmed.is_empty() || trimmed == "." {
        return Err(WikiError::invalid_path("path is required"));
    }

    if Path::new(trimmed).is_absolute() || trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err(WikiError::invalid_path("path must be relative"));
    }

    // Reject Windows volume prefixes (`C:\...`) even on non-Windows hosts.
    if trimmed
        .chars()
        .nth(1)
        .is_some_and(|c| c == ':' && trimmed.chars().next().is_some_and(|d| d.is_ascii_alphabetic()))
    {
        return Err(WikiError::invalid_path("path must be relative"));
    }

    let cleaned = clean_path(trimmed);
    let slashed = cleaned.replace('\\', "/");

    if slashed.starts_with("../") || slashed == ".." || slashed.contains("/../") {
        return Err(WikiError::invalid_path("path escapes the wiki root"));
    }

    let with_ext = append_markdown_extension(&slashed);

    let joined = root.join(&with_ext);
    let absolute = absolutize(&joined);
    let root_absolute = absolutize(root);

    if !absolute.starts_with(&root_absolute) {
        return Err(WikiError::invalid_path("path escapes the wiki root"));
    }

    Ok(ValidatedPath {
        relative: with_ext,
        absolute,
    })
}

/// Collapses `.` segments and redundant separators without touching the
/// filesystem (unlike `Path::canonicalize`, this works on paths that may
/// not exist yet, e.g. a document being created).
fn clean_path(input: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for component in input.split(['/', '\\']) {
        match component {
            "" | "." => continue,
            ".." => out.push(".."),
            other => out.push(other),
        }
    }
    out.join("/")
}

/// Lexical absolutization: joins onto the current directory if relative,
/// then collapses `.`/`..` components without resolving symlinks. Symlink
/// escape is permitted for reads per spec §4.1.
fn absolutize(path: &Path) -> PathBuf {
    let base = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut out = PathBuf::new();
    for component in base.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Like [`validate`] but for non-Markdown paths (media passthrough):
/// applies the same dot-dot, absolute-path, and containment checks
/// without appending a `.md`/`.markdown` extension.
pub fn validate_non_markdown(root: &Path, input: &str) -> Result<PathBuf, WikiError> {
    let trimmed = input.trim();

    if trimmed.is_empty() || trimmed == "." {
        return Err(WikiError::invalid_path("path is required"));
    }
    if Path::new(trimmed).is_absolute() || trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err(WikiError::invalid_path("path must be relative"));
    }

    let cleaned = clean_path(trimmed);
    let slashed = cleaned.replace('\\', "/");
    if slashed.starts_with("../") || slashed == ".." || slashed.contains("/../") {
        return Err(WikiError::invalid_path("path escapes the wiki root"));
    }

    let joined = root.join(&slashed);
    let absolute = absolutize(&joined);
    let root_absolute = absolutize(root);

    if !absolute.starts_with(&root_absolute) {
        return Err(WikiError::invalid_path("path escapes the wiki root"));
    }

    Ok(absolute)
}

fn append_markdown_extension(slashed: &str) -> String {
    if slashed.ends_with(".md") || slashed.ends_with(".markdown") {
        slashed.to_string()
    } else {
        format!("{slashed}.md")
    }
}

/// Used only by the custom-theme CSS discovery path (spec §4.1, last
/// sentence): resolves symlinks and rejects any target outside `allowed_dir`.
pub fn validate_symlink_contained(
    candidate: &Path,
    allowed_dir: &Path,
) -> Result<PathBuf, WikiError> {
    let resolved = candidate
        .canonicalize()
        .map_err(|e| WikiError::io("resolve symlink", candidate, e))?;
    let allowed_resolved = allowed_dir
        .canonicalize()
        .map_err(|e| WikiError::io("resolve symlink", allowed_dir, e))?;

    if !resolved.starts_with(&allowed_resolved) {
        return Err(WikiError::invalid_path(
            "resolved path escapes the allowed directory",
        ));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn root() -> TempDir {
        TempDir::new().unwrap()
    }

    #[test]
    fn accepts_plain_relative_path() {
        let dir = root();
        let v = validate(dir.path(), "guides/getting_started").unwrap();
        assert_eq!(v.relative, "guides/getting_started.md");
    }

    #[test]
    fn preserves_existing_extension() {
        let dir = root();
        let v = validate(dir.path(), "notes/x.markdown").unwrap();
        assert_eq!(v.relative, "notes/x.markdown");
    }

    #[test]
    fn rejects_dotdot_inputs() {
        let dir = root();
        for bad in ["..", "../x", "/abs", "a/../../b", ""] {
            assert!(
                validate(dir.path(), bad).is_err(),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn rejects_encoded_traversal_after_decode() {
        let dir = root();
        // The handler percent-decodes before calling validate(); here we
        // exercise the post-decode string directly.
        assert!(validate(dir.path(), "../etc/passwd").is_err());
    }

    #[test]
    fn joined_absolute_path_stays_under_root() {
        let dir = root();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        let v = validate(dir.path(), "a/b/c").unwrap();
        assert!(v.absolute.starts_with(dir.path()));
    }

    #[test]
    fn rejects_windows_volume_prefix() {
        let dir = root();
        assert!(validate(dir.path(), "C:\\Windows\\system32").is_err());
    }

    #[test]
    fn trims_whitespace() {
        let dir = root();
        let v = validate(dir.path(), "  notes/x  ").unwrap();
        assert_eq!(v.relative, "notes/x.md");
    }

    #[test]
    fn non_markdown_validation_does_not_append_extension() {
        let dir = root();
        let absolute = validate_non_markdown(dir.path(), "images/logo.png").unwrap();
        assert!(absolute.ends_with("images/logo.png"));
    }

    #[test]
    fn non_markdown_validation_rejects_traversal() {
        let dir = root();
        assert!(validate_non_markdown(dir.path(), "../etc/passwd").is_err());
    }
}
