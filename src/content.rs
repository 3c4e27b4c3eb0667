//! Content Service (component E): orchestrates the Path Validator,
//! Renderer, Tree Builder, and Filesystem Watcher; owns the write
//! mutex, the tree snapshot, and the subscriber registry.

use crate::error::WikiError;
use crate::events::{Broadcaster, ChangeEvent, ChangeKind};
use crate::path::{self, ValidatedPath};
use crate::renderer::{RenderedDocument, Renderer};
use crate::tree::{self, BuildOptions, TreeNode};
use crate::watcher::{self, Op, RawEvent};
use arc_swap::ArcSwap;
use notify::RecommendedWatcher;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const REBUILD_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ContentService {
    root: PathBuf,
    build_options: BuildOptions,
    renderer: Arc<Renderer>,
    tree: ArcSwap<TreeNode>,
    write_lock: Mutex<()>,
    rebuild_lock: Mutex<()>,
    broadcaster: Broadcaster,
    watcher: Mutex<RecommendedWatcher>,
    shutdown: CancellationToken,
}

impl ContentService {
    pub async fn new(root: PathBuf, build_options: BuildOptions) -> Result<Arc<Self>, WikiError> {
        let renderer = Arc::new(Renderer::new());
        let initial_tree =
            tree::build(&root, &build_options, &renderer).map_err(|e| {
                tracing::error!(error = %e, "initial tree build failed");
                e
            })?;

        let (watcher, mut events) =
            watcher::spawn(root.clone()).map_err(|e| WikiError::Internal(e.to_string()))?;

        let service = Arc::new(Self {
            root,
            build_options,
            renderer,
            tree: ArcSwap::from_pointee(initial_tree),
            write_lock: Mutex::new(()),
            rebuild_lock: Mutex::new(()),
            broadcaster: Broadcaster::new(),
            watcher: Mutex::new(watcher),
            shutdown: CancellationToken::new(),
        });

        let task_service = service.clone();
        tokio::spawn(async move {
            while let Some(raw) = events.recv().await {
                if task_service.shutdown.is_cancelled() {
                    break;
                }
                task_service.handle_raw_event(raw).await;
            }
        });

        Ok(service)
    }

    pub fn current_tree(&self) -> Arc<TreeNode> {
        self.tree.load_full()
    }

    pub fn document(&self, input: &str) -> Result<Arc<RenderedDocument>, WikiError> {
        let validated = path::validate(&self.root, input)?;
        if validated.absolute.is_dir() {
            return Err(WikiError::InvalidPath {
                message: "path is a directory".to_string(),
                path: Some(validated.absolute),
            });
        }
        let meta = std::fs::metadata(&validated.absolute)
            .map_err(|e| self.io_or_not_found(e, &validated))?;
        let modified = meta
            .modified()
            .map_err(|e| WikiError::io("stat", &validated.absolute, e))?;
        let content = std::fs::read_to_string(&validated.absolute)
            .map_err(|e| WikiError::io("read", &validated.absolute, e))?;

        Ok(self
            .renderer
            .render(&validated.relative, modified, &content))
    }

    pub async fn save(&self, input: &str, content: &[u8]) -> Result<(), WikiError> {
        let validated = path::validate(&self.root, input)?;
        let _guard = self.write_lock.lock().await;

        if !validated.absolute.exists() {
            return Err(WikiError::NotFound(validated.absolute.clone()));
        }
        atomic_write(&validated.absolute, content)?;
        self.renderer.invalidate(&validated.relative);
        self.after_mutation(&validated.relative).await;
        Ok(())
    }

    pub async fn create(&self, input: &str, content: &[u8]) -> Result<(), WikiError> {
        let validated = path::validate(&self.root, input)?;
        let _guard = self.write_lock.lock().await;

        if validated.absolute.exists() {
            return Err(WikiError::AlreadyExists(validated.absolute.clone()));
        }
        if let Some(parent) = validated.absolute.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| WikiError::io("create parent directory", parent, e))?;
        }
        atomic_write(&validated.absolute, content)?;
        self.after_mutation(&validated.relative).await;
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), WikiError> {
        let from_validated = path::validate(&self.root, from)?;
        let to_validated = path::validate(&self.root, to)?;
        let _guard = self.write_lock.lock().await;

        if !from_validated.absolute.exists() {
            return Err(WikiError::NotFound(from_validated.absolute.clone()));
        }
        if to_validated.absolute.exists() {
            return Err(WikiError::AlreadyExists(to_validated.absolute.clone()));
        }
        if let Some(parent) = to_validated.absolute.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| WikiError::io("create parent directory", parent, e))?;
        }
        std::fs::rename(&from_validated.absolute, &to_validated.absolute).map_err(|e| {
            WikiError::io("rename", &from_validated.absolute, e)
        })?;

        self.renderer.invalidate(&from_validated.relative);
        self.renderer.invalidate(&to_validated.relative);
        self.after_mutation(&to_validated.relative).await;
        Ok(())
    }

    pub async fn delete(&self, input: &str) -> Result<(), WikiError> {
        let validated = path::validate(&self.root, input)?;
        let _guard = self.write_lock.lock().await;

        if !validated.absolute.exists() {
            return Err(WikiError::NotFound(validated.absolute.clone()));
        }
        std::fs::remove_file(&validated.absolute)
            .map_err(|e| WikiError::io("delete", &validated.absolute, e))?;

        self.renderer.invalidate(&validated.relative);
        self.after_mutation(&validated.relative).await;
        Ok(())
    }

    pub fn subscribe(&self, cancel: CancellationToken) -> mpsc::Receiver<ChangeEvent> {
        self.broadcaster.subscribe(cancel)
    }

    pub fn subscriber_count(&self) -> usize {
        self.broadcaster.subscriber_count()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn close(&self) {
        self.shutdown.cancel();
        self.broadcaster.shutdown();
    }

    /// Handler-initiated mutations already know what changed and skip
    /// straight to a rebuild; the watcher path below reaches the same
    /// code through raw OS events, which may lag a handler-driven write
    /// by a few milliseconds — both paths converge on the same snapshot.
    async fn after_mutation(&self, relative_path: &str) {
        let kind = if is_markdown_path(relative_path) {
            ChangeKind::PageUpdated
        } else {
            ChangeKind::TreeUpdated
        };
        self.rebuild_and_publish(kind, relative_path).await;
    }

    async fn handle_raw_event(&self, raw: RawEvent) {
        let relative = match raw.path.strip_prefix(&self.root) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => return,
        };
        if relative.is_empty() {
            return;
        }

        let is_md = is_markdown_path(&relative);
        if is_md {
            self.renderer.invalidate(&relative);
        }

        if raw.op.contains(Op::CREATE) && raw.path.is_dir() {
            if let Ok(mut watcher) = self.watcher.try_lock() {
                if let Err(e) = watcher::add_watches_recursive(&mut watcher, &raw.path) {
                    tracing::warn!(path = %raw.path.display(), error = %e, "failed to add watch on new directory");
                }
            }
        }

        let exists = raw.path.exists();
        let kind = classify(raw.op, is_md, exists);
        if matches!(kind, ChangeKind::Unknown) {
            return;
        }

        self.rebuild_and_publish(kind, &relative).await;
    }

    async fn rebuild_and_publish(&self, kind: ChangeKind, relative_path: &str) {
        let guard = self.rebuild_lock.lock().await;
        let root = self.root.clone();
        let options = self.build_options.clone();
        let renderer = self.renderer.clone();
        // Rendering happens on a blocking pool: the walk does
        // synchronous filesystem I/O for every markdown file.
        let result = tokio::task::spawn_blocking(move || tree::build(&root, &options, &renderer));

        match tokio::time::timeout(REBUILD_TIMEOUT, result).await {
            Ok(Ok(Ok(new_tree))) => {
                self.tree.store(Arc::new(new_tree));
                self.broadcaster
                    .publish(ChangeEvent::new(kind, relative_path.to_string()));
            }
            Ok(Ok(Err(e))) => {
                tracing::warn!(error = %e, "tree rebuild failed, keeping prior snapshot");
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "tree rebuild task panicked");
            }
            Err(_) => {
                tracing::warn!("tree rebuild timed out, keeping prior snapshot");
            }
        }
        drop(guard);
    }

    fn io_or_not_found(&self, source: std::io::Error, validated: &ValidatedPath) -> WikiError {
        if source.kind() == std::io::ErrorKind::NotFound {
            WikiError::NotFound(validated.absolute.clone())
        } else {
            WikiError::io("stat", &validated.absolute, source)
        }
    }
}

/// Classifies a raw watcher event into a broadcastable kind, per
/// spec §4.5. Rebuilding the tree separately from the new-tree-replaces-old
/// decision above the rename-vs-remove branch keeps the renderer fresh
/// tree builds for a rename that races an editor's atomic-write-through-temp-file
fn classify(op: Op, is_markdown: bool, exists_on_disk: bool) -> ChangeKind {
    let remove_only = op.contains(Op::REMOVE) && !op.contains(Op::RENAME);
    if remove_only {
        return if is_markdown && exists_on_disk {
            ChangeKind::PageUpdated
        } else if is_markdown {
            ChangeKind::Deleted
        } else {
            ChangeKind::TreeUpdated
        };
    }
    if op.contains(Op::RENAME) {
        return ChangeKind::TreeUpdated;
    }
    if op.contains(Op::WRITE) || op.contains(Op::CREATE) {
        return if is_markdown {
            ChangeKind::PageUpdated
        } else {
            ChangeKind::TreeUpdated
        };
    }
    ChangeKind::Unknown
}

fn is_markdown_path(relative: &str) -> bool {
    relative.ends_with(".md") || relative.ends_with(".markdown")
}

/// Temp-sibling-then-rename write (spec §4.5): never leaves a torn file
/// visible under the target name.
fn atomic_write(target: &Path, content: &[u8]) -> Result<(), WikiError> {
    use std::io::Write;

    let unique = format!(
        "{}.tmp-{}-{}",
        target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default(),
    );
    let temp_path = target.with_file_name(unique);

    let mut file = std::fs::File::create(&temp_path)
        .map_err(|e| WikiError::io("create temp file", &temp_path, e))?;
    file.write_all(content)
        .map_err(|e| WikiError::io("write", &temp_path, e))?;
    file.sync_all()
        .map_err(|e| WikiError::io("sync", &temp_path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = std::fs::metadata(target) {
            let _ = std::fs::set_permissions(&temp_path, meta.permissions());
        } else {
            let _ = std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o644));
        }
    }

    drop(file);
    std::fs::rename(&temp_path, target).map_err(|e| {
        let _ = std::fs::remove_file(&temp_path);
        WikiError::io("rename", target, e)
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn create_document_then_read_back() {
        let dir = TempDir::new().unwrap();
        let service = ContentService::new(dir.path().to_path_buf(), BuildOptions::default())
            .await
            .unwrap();

        service.create("a.md", b"# Hello").await.unwrap();
        let doc = service.document("a.md").unwrap();
        assert!(doc.html.contains("Hello"));

        let err = service.create("a.md", b"# Again").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn rename_moves_document() {
        let dir = TempDir::new().unwrap();
        let service = ContentService::new(dir.path().to_path_buf(), BuildOptions::default())
            .await
            .unwrap();

        service.create("x.md", b"# X").await.unwrap();
        service.rename("x.md", "y.md").await.unwrap();

        assert!(service.document("x.md").is_err());
        assert!(service.document("y.md").is_ok());
    }

    #[tokio::test]
    async fn delete_removes_document() {
        let dir = TempDir::new().unwrap();
        let service = ContentService::new(dir.path().to_path_buf(), BuildOptions::default())
            .await
            .unwrap();

        service.create("x.md", b"# X").await.unwrap();
        service.delete("x.md").await.unwrap();
        assert!(service.document("x.md").is_err());
    }

    #[test]
    fn classify_matches_spec_table() {
        assert!(matches!(
            classify(Op::CREATE, true, true),
            ChangeKind::PageUpdated
        ));
        assert!(matches!(
            classify(Op::CREATE, false, true),
            ChangeKind::TreeUpdated
        ));
        assert!(matches!(
            classify(Op::REMOVE, true, false),
            ChangeKind::Deleted
        ));
        assert!(matches!(
            classify(Op::REMOVE, true, true),
            ChangeKind::PageUpdated
        ));
        assert!(matches!(
            classify(Op::REMOVE | Op::RENAME, true, true),
            ChangeKind::TreeUpdated
        ));
    }
}
