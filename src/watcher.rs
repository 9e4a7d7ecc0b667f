//! Filesystem watcher that turns raw notify events into change events and
//! fresh snapshots for the broadcast hub.

use crate::file_system::{build_tree, is_visible, relative_path};
use crate::hub::BroadcastHub;
use crate::models::{ChangeEvent, ChangeKind, TreeNode};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use log::{debug, error, info, warn};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::fs as tokio_fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Version-control metadata, OS artifacts and editor swap files.
const IGNORED_PATTERNS: &[&str] = &[
    ".git", ".svn", ".hg", ".DS_Store", "Thumbs.db", "desktop.ini", "*.swp", "*.swx", "*~",
];

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Failed to create watcher: {0}")]
    Create(#[from] notify::Error),

    #[error("Failed to watch path {path}: {source}")]
    WatchPath {
        path: PathBuf,
        source: notify::Error,
    },

    #[error("Watch root is not a directory: {0}")]
    MissingRoot(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchState {
    Idle,
    Debouncing,
    Processing,
}

impl WatchState {
    fn enter(&mut self, next: WatchState) {
        debug!("Watcher {:?} -> {:?}", self, next);
        *self = next;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

/// Maps one notify event onto zero or more raw events. Access and
/// metadata-only notifications are noise.
pub fn classify(event: &Event) -> Vec<RawEvent> {
    let raw = |kind: ChangeKind, path: &PathBuf| RawEvent {
        kind,
        path: path.clone(),
    };
    match &event.kind {
        EventKind::Create(_) => event.paths.iter().map(|p| raw(ChangeKind::Added, p)).collect(),
        EventKind::Remove(_) => event.paths.iter().map(|p| raw(ChangeKind::Removed, p)).collect(),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => event.paths.iter().map(|p| raw(ChangeKind::Removed, p)).collect(),
            RenameMode::To => event.paths.iter().map(|p| raw(ChangeKind::Added, p)).collect(),
            RenameMode::Both => {
                let mut out = Vec::new();
                if let Some(from) = event.paths.first() {
                    out.push(raw(ChangeKind::Removed, from));
                }
                if let Some(to) = event.paths.get(1) {
                    out.push(raw(ChangeKind::Added, to));
                }
                out
            }
            _ => event
                .paths
                .iter()
                .map(|p| {
                    let kind = if p.exists() { ChangeKind::Added } else { ChangeKind::Removed };
                    raw(kind, p)
                })
                .collect(),
        },
        EventKind::Modify(_) => event.paths.iter().map(|p| raw(ChangeKind::Modified, p)).collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// Drops exact repeats from a drained burst, keeping first-arrival order.
pub fn coalesce(events: Vec<RawEvent>) -> Vec<RawEvent> {
    let mut seen = HashSet::new();
    events.into_iter().filter(|e| seen.insert(e.clone())).collect()
}

fn build_ignore(root: &Path) -> Gitignore {
    let mut builder = GitignoreBuilder::new(root);
    for pattern in IGNORED_PATTERNS {
        if let Err(e) = builder.add_line(None, pattern) {
            warn!("Invalid ignore pattern '{}': {}", pattern, e);
        }
    }
    builder.build().unwrap_or_else(|e| {
        warn!("Failed to build ignore matcher: {}", e);
        Gitignore::empty()
    })
}

async fn read_content(path: &Path) -> Option<String> {
    match tokio_fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return None,
        Err(e) => {
            debug!("Changed path {} vanished before read: {}", path.display(), e);
            return None;
        }
    }
    match tokio_fs::read_to_string(path).await {
        Ok(content) => Some(content),
        Err(e) => {
            debug!("Could not read changed file {}: {}", path.display(), e);
            None
        }
    }
}

pub struct ChangeWatcher {
    root: PathBuf,
    ignore: Gitignore,
    hub: Arc<BroadcastHub>,
}

impl ChangeWatcher {
    pub fn new(root: PathBuf, hub: Arc<BroadcastHub>) -> Self {
        let ignore = build_ignore(&root);
        ChangeWatcher { root, ignore, hub }
    }

    /// Whether a raw path is worth processing at all.
    pub fn accepts(&self, path: &Path) -> bool {
        if !path.starts_with(&self.root) || path == self.root {
            return false;
        }
        if self
            .ignore
            .matched_path_or_any_parents(path, path.is_dir())
            .is_ignore()
        {
            return false;
        }
        relative_path(&self.root, path)
            .map(|rel| is_visible(&rel))
            .unwrap_or(false)
    }

    /// Rebuilds the snapshot off the async runtime and publishes it.
    pub async fn refresh_snapshot(&self) {
        if let Some(tree) = self.scan().await {
            self.hub.broadcast_snapshot(tree);
        }
    }

    async fn scan(&self) -> Option<TreeNode> {
        let root = self.root.clone();
        let started = Instant::now();
        match tokio::task::spawn_blocking(move || build_tree(&root)).await {
            Ok(tree) => {
                debug!("Rebuilt snapshot in {:.2?}", started.elapsed());
                Some(tree)
            }
            Err(e) => {
                error!("Snapshot scan task failed: {}", e);
                None
            }
        }
    }

    /// Handles one raw event end to end. The content read is best-effort: a
    /// file gone by now still yields an event, just without content.
    pub async fn process(&self, raw: RawEvent) -> Option<ChangeEvent> {
        let relative = relative_path(&self.root, &raw.path)?;
        if !is_visible(&relative) {
            return None;
        }
        let content = match raw.kind {
            ChangeKind::Removed => None,
            ChangeKind::Added | ChangeKind::Modified => read_content(&raw.path).await,
        };
        let event = ChangeEvent {
            kind: raw.kind,
            relative_path: relative,
            content,
        };
        debug!("Publishing {:?} for {}", event.kind, event.relative_path);
        match self.scan().await {
            Some(tree) => self.hub.publish(event.clone(), tree),
            // Observers still learn about the change; the next scan catches up.
            None => self.hub.broadcast(event.clone()),
        }
        Some(event)
    }

    /// Publishes the initial snapshot, starts the notify watcher and spawns
    /// the processing loop. The returned task owns the watcher.
    pub async fn start(self) -> Result<JoinHandle<()>, WatcherError> {
        if !self.root.is_dir() {
            return Err(WatcherError::MissingRoot(self.root.clone()));
        }
        self.refresh_snapshot().await;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => warn!("Watch error: {}", e),
            }
        })?;
        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| WatcherError::WatchPath {
                path: self.root.clone(),
                source: e,
            })?;
        info!("Watching {} for changes", self.root.display());

        Ok(tokio::spawn(self.run(watcher, rx)))
    }

    async fn run(self, watcher: RecommendedWatcher, mut rx: mpsc::UnboundedReceiver<Event>) {
        // Dropping the watcher stops notifications.
        let _watcher = watcher;
        let mut state = WatchState::Idle;
        while let Some(first) = rx.recv().await {
            state.enter(WatchState::Debouncing);
            let mut burst = classify(&first);
            while let Ok(next) = rx.try_recv() {
                burst.extend(classify(&next));
            }
            let batch: Vec<RawEvent> = coalesce(burst)
                .into_iter()
                .filter(|raw| self.accepts(&raw.path))
                .collect();

            if !batch.is_empty() {
                state.enter(WatchState::Processing);
                for raw in batch {
                    self.process(raw).await;
                }
            }
            state.enter(WatchState::Idle);
        }
        info!("Watcher for {} stopped in state {:?}", self.root.display(), state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PushMessage;
    use notify::event::{CreateKind, DataChange, MetadataKind};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf, Arc<BroadcastHub>) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        (dir, root, Arc::new(BroadcastHub::new(64)))
    }

    #[test]
    fn classify_maps_notify_kinds() {
        let p = PathBuf::from("/r/a.py");
        let created = Event::new(EventKind::Create(CreateKind::File)).add_path(p.clone());
        assert_eq!(classify(&created)[0].kind, ChangeKind::Added);

        let written = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content))).add_path(p.clone());
        assert_eq!(classify(&written)[0].kind, ChangeKind::Modified);

        let chmod = Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions))).add_path(p.clone());
        assert!(classify(&chmod).is_empty());

        let renamed = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/r/a.tmp"))
            .add_path(p.clone());
        let kinds: Vec<ChangeKind> = classify(&renamed).iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Removed, ChangeKind::Added]);
    }

    #[test]
    fn coalesce_drops_exact_repeats_only() {
        let a = RawEvent { kind: ChangeKind::Modified, path: PathBuf::from("/r/a") };
        let b = RawEvent { kind: ChangeKind::Removed, path: PathBuf::from("/r/a") };
        let out = coalesce(vec![a.clone(), a.clone(), b.clone(), a.clone()]);
        assert_eq!(out, vec![a, b]);
    }

    #[test]
    fn ignored_and_hidden_paths_are_rejected_at_the_source() {
        let (_dir, root, hub) = setup();
        let watcher = ChangeWatcher::new(root.clone(), hub);
        assert!(watcher.accepts(&root.join("src/main.py")));
        assert!(!watcher.accepts(&root.join(".git/index")));
        assert!(!watcher.accepts(&root.join("sub/.DS_Store")));
        assert!(!watcher.accepts(&root.join("main.py.swp")));
        assert!(!watcher.accepts(&root.join(".env")));
        assert!(!watcher.accepts(&root.join("node_modules/x.js")));
        assert!(!watcher.accepts(Path::new("/elsewhere/file.py")));
    }

    #[tokio::test]
    async fn added_file_publishes_change_then_snapshot() {
        let (_dir, root, hub) = setup();
        let watcher = ChangeWatcher::new(root.clone(), hub.clone());
        let mut observer = hub.connect();

        fs::write(root.join("hello.py"), "print('hi')").unwrap();
        let event = watcher
            .process(RawEvent { kind: ChangeKind::Added, path: root.join("hello.py") })
            .await
            .expect("event produced");
        assert_eq!(event.relative_path, "hello.py");
        assert_eq!(event.content.as_deref(), Some("print('hi')"));

        match observer.receiver.try_recv().unwrap() {
            PushMessage::Change(e) => assert_eq!(e, event),
            other => panic!("expected change, got {:?}", other),
        }
        match observer.receiver.try_recv().unwrap() {
            PushMessage::Snapshot(tree) => assert!(tree.find("hello.py").is_some()),
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn file_deleted_before_read_yields_event_without_content() {
        let (_dir, root, hub) = setup();
        let watcher = ChangeWatcher::new(root.clone(), hub.clone());

        let event = watcher
            .process(RawEvent { kind: ChangeKind::Modified, path: root.join("gone.py") })
            .await
            .expect("event produced");
        assert_eq!(event.kind, ChangeKind::Modified);
        assert_eq!(event.content, None);
        let snapshot = hub.latest_snapshot().unwrap();
        assert!(snapshot.find("gone.py").is_none());
    }

    #[tokio::test]
    async fn removed_and_directory_events_carry_no_content() {
        let (_dir, root, hub) = setup();
        let watcher = ChangeWatcher::new(root.clone(), hub);
        fs::create_dir(root.join("pkg")).unwrap();

        let dir_event = watcher
            .process(RawEvent { kind: ChangeKind::Added, path: root.join("pkg") })
            .await
            .unwrap();
        assert_eq!(dir_event.content, None);

        let removed = watcher
            .process(RawEvent { kind: ChangeKind::Removed, path: root.join("old.py") })
            .await
            .unwrap();
        assert_eq!(removed.kind, ChangeKind::Removed);
        assert_eq!(removed.content, None);
    }

    #[tokio::test]
    async fn live_watcher_reports_a_new_file() {
        let (_dir, root, hub) = setup();
        let watcher = ChangeWatcher::new(root.clone(), hub.clone());
        let handle = watcher.start().await.expect("watcher starts");
        let mut observer = hub.connect();

        match observer.receiver.recv().await {
            Some(PushMessage::Snapshot(_)) => {}
            other => panic!("expected initial snapshot, got {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        fs::write(root.join("live.py"), "x = 1").unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(msg) = observer.receiver.recv().await {
                if let PushMessage::Change(e) = msg {
                    if e.relative_path == "live.py" {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        handle.abort();
        assert!(seen, "no change event for live.py");
    }

    #[tokio::test]
    async fn start_fails_for_missing_root() {
        let (_dir, root, hub) = setup();
        let watcher = ChangeWatcher::new(root.join("missing"), hub);
        assert!(matches!(watcher.start().await, Err(WatcherError::MissingRoot(_))));
    }
}
