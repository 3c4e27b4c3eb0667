//! Tree Builder (component C): walks the filesystem and produces the
//! navigation tree snapshot published by the Content Service.

use crate::error::WikiError;
use crate::renderer::{DocumentMetadata, Renderer};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Directory names skipped regardless of `include_hidden`, matched
/// case-insensitively. Shared with the watcher, which must not add
/// inotify watches under these subtrees either.
pub(crate) const DEFAULT_EXCLUDES: &[&str] = &[
    "node_modules",
    "vendor",
    ".git",
    "__pycache__",
    "target",
    "dist",
    "build",
    ".svn",
    ".hg",
];

pub(crate) fn is_default_excluded(name: &str) -> bool {
    let lower = name.to_lowercase();
    DEFAULT_EXCLUDES.iter().any(|excluded| *excluded == lower)
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub include_hidden: bool,
}

/// A single entry in the navigation tree: a directory or a markdown file.
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub display_name: String,
    pub raw_name: String,
    pub path: String,
    pub slug: String,
    pub title: String,
    pub modified: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    Directory { children: Vec<TreeNode> },
    File {
        size: u64,
        metadata: Option<DocumentMetadata>,
    },
}

impl TreeNode {
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }
}

/// Walks `root`, building the full navigation tree. Stat/read errors
/// abort the build with the offending path attached; the tree never
/// publishes a partial result (spec §4.3).
pub fn build(root: &Path, options: &BuildOptions, renderer: &Renderer) -> Result<TreeNode, WikiError> {
    build_directory(root, root, options, renderer, true)
        .map(|node| node.expect("root directory always yields a node"))
}

fn build_directory(
    dir: &Path,
    root: &Path,
    options: &BuildOptions,
    renderer: &Renderer,
    is_root: bool,
) -> Result<Option<TreeNode>, WikiError> {
    let entries = fs::read_dir(dir).map_err(|e| WikiError::io("read_dir", dir, e))?;

    let mut children = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| WikiError::io("read_dir", dir, e))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();

        if !options.include_hidden && name.starts_with('.') {
            continue;
        }
        if is_excluded(&name) {
            continue;
        }

        let file_type = entry
            .file_type()
            .map_err(|e| WikiError::io("stat", &path, e))?;

        if file_type.is_dir() {
            if let Some(node) = build_directory(&path, root, options, renderer, false)? {
                children.push(node);
            }
        } else if file_type.is_file() && is_markdown(&path) {
            children.push(build_file_node(&path, root, renderer)?);
        }
    }

    if children.is_empty() && !is_root {
        return Ok(None);
    }

    sort_children(&mut children);

    let raw_name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "root".to_string());
    let modified = dir_modified(dir)?;
    let display = humanize(&raw_name);

    Ok(Some(TreeNode {
        display_name: display.clone(),
        raw_name: raw_name.clone(),
        path: relative_slash_path(root, dir),
        slug: slug::slugify(&raw_name),
        title: display,
        modified,
        kind: NodeKind::Directory { children },
    }))
}

fn build_file_node(path: &Path, root: &Path, renderer: &Renderer) -> Result<TreeNode, WikiError> {
    let meta = fs::metadata(path).map_err(|e| WikiError::io("stat", path, e))?;
    let modified_system = meta
        .modified()
        .map_err(|e| WikiError::io("stat", path, e))?;
    let content = fs::read_to_string(path).map_err(|e| WikiError::io("read", path, e))?;

    let relative = relative_slash_path(root, path);
    // HTML is discarded here; only frontmatter-derived metadata survives
    // into the tree node (spec §4.3). The cache entry this produces is
    // still useful: a subsequent document() read of the same mtime hits it.
    let rendered = renderer.render(&relative, modified_system, &content);

    let raw_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = strip_markdown_ext(&raw_name);
    let display_name = humanize(&stem);
    let title = rendered
        .metadata
        .title
        .clone()
        .unwrap_or_else(|| display_name.clone());

    Ok(TreeNode {
        display_name,
        raw_name: raw_name.clone(),
        path: relative,
        slug: slug::slugify(&stem),
        title,
        modified: DateTime::<Utc>::from(modified_system),
        kind: NodeKind::File {
            size: meta.len(),
            metadata: Some(rendered.metadata.clone()),
        },
    })
}

fn sort_children(children: &mut [TreeNode]) {
    children.sort_by(|a, b| match (a.is_directory(), b.is_directory()) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.title.as_bytes().cmp(b.title.as_bytes()),
    });
}

fn is_excluded(name: &str) -> bool {
    is_default_excluded(name)
}

fn is_markdown(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("md") | Some("markdown")
    )
}

fn humanize(raw: &str) -> String {
    raw.replace('_', " ")
}

fn strip_markdown_ext(name: &str) -> String {
    name.trim_end_matches(".markdown")
        .trim_end_matches(".md")
        .to_string()
}

fn relative_slash_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn dir_modified(dir: &Path) -> Result<DateTime<Utc>, WikiError> {
    let meta = fs::metadata(dir).map_err(|e| WikiError::io("stat", dir, e))?;
    let modified = meta.modified().map_err(|e| WikiError::io("stat", dir, e))?;
    Ok(DateTime::<Utc>::from(modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn directories_sort_before_files_and_titles_ascend() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "b.md", "# B");
        write(dir.path(), "a.md", "# A");
        write(dir.path(), "zzz/inner.md", "# Inner");

        let renderer = Renderer::new();
        let tree = build(dir.path(), &BuildOptions::default(), &renderer).unwrap();

        let NodeKind::Directory { children } = &tree.kind else {
            panic!("root must be a directory");
        };
        assert_eq!(children.len(), 3);
        assert!(children[0].is_directory());
        assert!(!children[1].is_directory());
        assert!(!children[2].is_directory());
        assert_eq!(children[1].title, "A");
        assert_eq!(children[2].title, "B");
    }

    #[test]
    fn empty_non_root_directory_is_pruned() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();
        write(dir.path(), "a.md", "# A");

        let renderer = Renderer::new();
        let tree = build(dir.path(), &BuildOptions::default(), &renderer).unwrap();
        let NodeKind::Directory { children } = &tree.kind else {
            panic!()
        };
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].raw_name, "a.md");
    }

    #[test]
    fn excluded_and_hidden_directories_are_skipped() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "node_modules/pkg.md", "# pkg");
        write(dir.path(), ".hidden/secret.md", "# secret");
        write(dir.path(), "visible.md", "# Visible");

        let renderer = Renderer::new();
        let tree = build(dir.path(), &BuildOptions::default(), &renderer).unwrap();
        let NodeKind::Directory { children } = &tree.kind else {
            panic!()
        };
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].raw_name, "visible.md");
    }

    #[test]
    fn hidden_included_when_requested() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), ".hidden/secret.md", "# secret");

        let renderer = Renderer::new();
        let tree = build(
            dir.path(),
            &BuildOptions {
                include_hidden: true,
            },
            &renderer,
        )
        .unwrap();
        let NodeKind::Directory { children } = &tree.kind else {
            panic!()
        };
        assert_eq!(children.len(), 1);
        assert!(children[0].is_directory());
    }

    #[test]
    fn file_title_prefers_frontmatter() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.md", "---\ntitle: Custom Title\n---\n# A");

        let renderer = Renderer::new();
        let tree = build(dir.path(), &BuildOptions::default(), &renderer).unwrap();
        let NodeKind::Directory { children } = &tree.kind else {
            panic!()
        };
        assert_eq!(children[0].title, "Custom Title");
    }
}
