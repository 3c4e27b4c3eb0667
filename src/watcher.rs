//! Filesystem Watcher (component D): recursively watches the wiki root
//! and forwards raw OS events to the Content Service. Unlike the
//! teacher's debounced, content-comparing setup, this reports every
//! create/write/remove/rename with no coalescing (spec §9: coalescing
//! is deliberately absent).

use notify::{
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
    Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use tokio::sync::mpsc;

use crate::tree::is_default_excluded;
use std::ops::BitOr;

/// Raw operation bitmask delivered alongside each path (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Op(u8);

impl Op {
    pub const CREATE: Op = Op(0b0001);
    pub const WRITE: Op = Op(0b0010);
    pub const REMOVE: Op = Op(0b0100);
    pub const RENAME: Op = Op(0b1000);

    pub fn contains(self, other: Op) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Op {
    type Output = Op;
    fn bitor(self, rhs: Op) -> Op {
        Op(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone)]
pub struct RawEvent {
    pub path: PathBuf,
    pub op: Op,
}

/// Spawns the watcher task, returning a channel of raw events. The
/// returned `RecommendedWatcher` must be kept alive by the caller (the
/// Content Service holds it for the process lifetime).
pub fn spawn(root: PathBuf) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<RawEvent>)> {
    let (std_tx, std_rx) = std_mpsc::channel::<notify::Result<NotifyEvent>>();

    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = std_tx.send(res);
        },
        notify::Config::default(),
    )?;

    add_watches_recursive(&mut watcher, &root)?;

    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for res in std_rx {
            match res {
                Ok(event) => {
                    for raw in classify(&event) {
                        if tx.send(raw).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "watcher error"),
            }
        }
    });

    Ok((watcher, rx))
}

/// Adds a watch for `dir` and every non-excluded, non-hidden
/// subdirectory beneath it. Called once at startup and again (on the
/// single new directory only) whenever the Content Service observes a
/// directory creation.
pub fn add_watches_recursive(watcher: &mut RecommendedWatcher, dir: &Path) -> notify::Result<()> {
    watcher.watch(dir, RecursiveMode::NonRecursive)?;

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %dir.display(), error = %e, "failed to list directory for watching");
            return Ok(());
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || is_excluded(&name) {
            continue;
        }
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            add_watches_recursive(watcher, &path)?;
        }
    }
    Ok(())
}

fn is_excluded(name: &str) -> bool {
    is_default_excluded(name)
}

fn classify(event: &NotifyEvent) -> Vec<RawEvent> {
    let op = match event.kind {
        EventKind::Create(CreateKind::File) | EventKind::Create(CreateKind::Any) => Op::CREATE,
        EventKind::Create(CreateKind::Folder) => Op::CREATE,
        EventKind::Modify(ModifyKind::Data(_)) => Op::WRITE,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Op::REMOVE | Op::RENAME,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Op::CREATE | Op::RENAME,
        EventKind::Modify(ModifyKind::Name(_)) => Op::RENAME,
        EventKind::Modify(ModifyKind::Any) => Op::WRITE,
        EventKind::Remove(RemoveKind::File) | EventKind::Remove(RemoveKind::Any) => Op::REMOVE,
        EventKind::Remove(RemoveKind::Folder) => Op::REMOVE,
        _ => return Vec::new(),
    };

    event
        .paths
        .iter()
        .cloned()
        .map(|path| RawEvent { path, op })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_file_classifies_as_create() {
        let event = NotifyEvent::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/root/a.md"));
        let classified = classify(&event);
        assert_eq!(classified.len(), 1);
        assert!(classified[0].op.contains(Op::CREATE));
    }

    #[test]
    fn data_modify_classifies_as_write() {
        let event = NotifyEvent::new(EventKind::Modify(ModifyKind::Data(
            notify::event::DataChange::Content,
        )))
        .add_path(PathBuf::from("/root/a.md"));
        let classified = classify(&event);
        assert!(classified[0].op.contains(Op::WRITE));
    }

    #[test]
    fn remove_file_classifies_as_remove() {
        let event = NotifyEvent::new(EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("/root/a.md"));
        let classified = classify(&event);
        assert!(classified[0].op.contains(Op::REMOVE));
    }

    #[test]
    fn access_events_produce_nothing() {
        let event = NotifyEvent::new(EventKind::Access(notify::event::AccessKind::Read))
            .add_path(PathBuf::from("/root/a.md"));
        assert!(classify(&event).is_empty());
    }
}
