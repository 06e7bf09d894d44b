//! File watching for automatic task re-execution
//!
//! A [`Watcher`] owns a list of bindings (pattern set → task names) and a
//! single loop that drains a channel of [`ChangeEvent`]s. Events are grouped
//! with a trailing debounce window; once the stream goes quiet, every task
//! bound to a changed path is dispatched exactly once.
//!
//! The event source and the dispatcher are both injected, so the loop runs
//! the same against `notify` in production and a plain channel in tests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use console::style;
use futures::future::BoxFuture;
use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{AssetflowError, Result};
use crate::pattern::PatternSet;

/// Capacity of the change event channel
pub const EVENT_BUFFER: usize = 256;

/// Upper bound on a batch, in debounce windows, under a steady stream of
/// changes
pub const MAX_BATCH_WINDOWS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Modify,
    Remove,
}

impl ChangeKind {
    /// Map a notify event kind; access and metadata-only events are ignored
    fn from_notify(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Create(_) => Some(Self::Create),
            EventKind::Modify(ModifyKind::Metadata(_)) => None,
            EventKind::Modify(_) => Some(Self::Modify),
            EventKind::Remove(_) => Some(Self::Remove),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Tasks to re-run when a file in `patterns` changes
#[derive(Debug)]
pub struct WatchBinding {
    patterns: PatternSet,
    tasks: Vec<String>,
}

impl WatchBinding {
    pub fn new(patterns: PatternSet, tasks: Vec<String>) -> Self {
        Self { patterns, tasks }
    }

    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }

    pub fn tasks(&self) -> &[String] {
        &self.tasks
    }
}

/// Runs tasks by name on behalf of the watcher
pub trait Dispatch: Send + Sync {
    fn dispatch<'a>(&'a self, task: &'a str) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug)]
pub struct Watcher {
    root: PathBuf,
    bindings: Vec<WatchBinding>,
    debounce: Duration,
}

impl Watcher {
    pub fn new(root: impl Into<PathBuf>, bindings: Vec<WatchBinding>, debounce: Duration) -> Self {
        let root = root.into();
        let root = root.canonicalize().unwrap_or(root);
        Self {
            root,
            bindings,
            debounce,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bindings(&self) -> &[WatchBinding] {
        &self.bindings
    }

    /// Tasks bound to any of `paths`, in binding order, each named once
    pub fn affected_tasks<'a, I>(&self, paths: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        let paths: Vec<&PathBuf> = paths.into_iter().collect();
        let mut seen = HashSet::new();
        let mut tasks = Vec::new();

        for binding in &self.bindings {
            if !paths.iter().any(|p| binding.patterns.matches_path(&self.root, p)) {
                continue;
            }
            for task in &binding.tasks {
                if seen.insert(task.as_str()) {
                    tasks.push(task.clone());
                }
            }
        }

        tasks
    }

    /// Whether any binding covers `path`
    pub fn is_bound(&self, path: &Path) -> bool {
        self.bindings.iter().any(|b| b.patterns.matches_path(&self.root, path))
    }

    /// Consume change events until the channel closes.
    ///
    /// Only events for bound paths start or extend a batch. A batch ends once
    /// no bound event has arrived for a full debounce window, or
    /// [`MAX_BATCH_WINDOWS`] windows after it started, whichever is first.
    /// Errors from the dispatcher end the loop.
    pub async fn run<D: Dispatch>(&self, mut events: mpsc::Receiver<ChangeEvent>, dispatcher: &D) -> Result<()> {
        tracing::info!(root = %self.root.display(), bindings = self.bindings.len(), "watching for changes");

        loop {
            let first = loop {
                match events.recv().await {
                    Some(event) if self.is_bound(&event.path) => break event,
                    Some(event) => tracing::trace!(path = %event.path.display(), "unbound change"),
                    None => return Ok(()),
                }
            };

            let deadline = Instant::now() + self.debounce.saturating_mul(MAX_BATCH_WINDOWS);
            let mut quiet = Instant::now() + self.debounce;
            let mut batch = vec![first.path];
            let mut closed = false;

            loop {
                match tokio::time::timeout_at(quiet.min(deadline), events.recv()).await {
                    Ok(Some(event)) => {
                        if !self.is_bound(&event.path) {
                            continue;
                        }
                        tracing::trace!(path = %event.path.display(), kind = ?event.kind, "change");
                        quiet = Instant::now() + self.debounce;
                        if !batch.contains(&event.path) {
                            batch.push(event.path);
                        }
                    }
                    Ok(None) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            self.flush(&batch, dispatcher).await?;
            if closed {
                return Ok(());
            }
        }
    }

    async fn flush<D: Dispatch>(&self, batch: &[PathBuf], dispatcher: &D) -> Result<()> {
        let tasks = self.affected_tasks(batch);
        if tasks.is_empty() {
            tracing::trace!(paths = batch.len(), "no binding matched");
            return Ok(());
        }

        let changed: Vec<String> = batch
            .iter()
            .map(|p| {
                crate::pattern::relative_str(&self.root, p).unwrap_or_else(|| p.display().to_string())
            })
            .collect();
        eprintln!(
            "{} {} {} {}",
            style(format!("[{}]", chrono::Local::now().format("%H:%M:%S"))).dim(),
            style("changed").yellow(),
            changed.join(", "),
            style(format!("-> {}", tasks.join(", "))).dim()
        );

        for task in &tasks {
            dispatcher.dispatch(task).await?;
        }
        Ok(())
    }
}

/// Forwards `notify` events for a directory tree into a change channel.
/// Watching stops when this is dropped.
pub struct FsEventSource {
    _watcher: RecommendedWatcher,
}

impl FsEventSource {
    pub fn spawn(root: &Path, tx: mpsc::Sender<ChangeEvent>) -> Result<Self> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                let Some(kind) = ChangeKind::from_notify(&event.kind) else {
                    return;
                };
                for path in event.paths {
                    if tx.blocking_send(ChangeEvent { path, kind }).is_err() {
                        return;
                    }
                }
            }
            Err(e) => tracing::warn!("watch error: {e}"),
        })
        .map_err(|source| AssetflowError::Watch { source })?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|source| AssetflowError::Watch { source })?;

        Ok(Self { _watcher: watcher })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Dispatch for Recorder {
        fn dispatch<'a>(&'a self, task: &'a str) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(task.to_string());
                Ok(())
            })
        }
    }

    fn watcher(root: &Path) -> Watcher {
        Watcher::new(
            root,
            vec![
                WatchBinding::new(
                    PatternSet::new(["private/sass/**/*.scss"], Vec::<String>::new()).unwrap(),
                    vec!["sass".to_string()],
                ),
                WatchBinding::new(
                    PatternSet::new(["private/js/**/*.js"], ["**/*.min.js"]).unwrap(),
                    vec!["lint".to_string(), "sass".to_string()],
                ),
            ],
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_burst_dispatches_once() {
        let temp = tempfile::tempdir().unwrap();
        let watcher = watcher(temp.path());
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let file = watcher.root().join("private/sass/main.scss");

        for kind in [ChangeKind::Create, ChangeKind::Modify, ChangeKind::Modify] {
            tx.send(ChangeEvent::new(&file, kind)).await.unwrap();
        }
        drop(tx);

        let recorder = Recorder::default();
        watcher.run(rx, &recorder).await.unwrap();
        assert_eq!(recorder.calls(), vec!["sass"]);
    }

    #[tokio::test]
    async fn test_separate_bursts_dispatch_separately() {
        let temp = tempfile::tempdir().unwrap();
        let watcher = watcher(temp.path());
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let file = watcher.root().join("private/sass/main.scss");

        let producer = tokio::spawn(async move {
            tx.send(ChangeEvent::new(&file, ChangeKind::Modify)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            tx.send(ChangeEvent::new(&file, ChangeKind::Modify)).await.unwrap();
        });

        let recorder = Recorder::default();
        watcher.run(rx, &recorder).await.unwrap();
        producer.await.unwrap();
        assert_eq!(recorder.calls(), vec!["sass", "sass"]);
    }

    #[tokio::test]
    async fn test_tasks_deduplicated_across_bindings() {
        let temp = tempfile::tempdir().unwrap();
        let watcher = watcher(temp.path());
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        tx.send(ChangeEvent::new(watcher.root().join("private/sass/a.scss"), ChangeKind::Modify))
            .await
            .unwrap();
        tx.send(ChangeEvent::new(watcher.root().join("private/js/app.js"), ChangeKind::Create))
            .await
            .unwrap();
        drop(tx);

        let recorder = Recorder::default();
        watcher.run(rx, &recorder).await.unwrap();
        assert_eq!(recorder.calls(), vec!["sass", "lint"]);
    }

    #[tokio::test]
    async fn test_unmatched_paths_ignored() {
        let temp = tempfile::tempdir().unwrap();
        let watcher = watcher(temp.path());
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        tx.send(ChangeEvent::new(watcher.root().join("private/js/vendor.min.js"), ChangeKind::Modify))
            .await
            .unwrap();
        tx.send(ChangeEvent::new(watcher.root().join("README.md"), ChangeKind::Modify))
            .await
            .unwrap();
        drop(tx);

        let recorder = Recorder::default();
        watcher.run(rx, &recorder).await.unwrap();
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unbound_changes_do_not_hold_back_dispatch() {
        let temp = tempfile::tempdir().unwrap();
        let watcher = watcher(temp.path());
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let sass = watcher.root().join("private/sass/a.scss");
        let log = watcher.root().join("server.log");

        let recorder = Arc::new(Recorder::default());
        let seen = Arc::clone(&recorder);
        let producer = tokio::spawn(async move {
            tx.send(ChangeEvent::new(&sass, ChangeKind::Modify)).await.unwrap();
            let mut sent = 0;
            while seen.calls().is_empty() && sent < 100 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                tx.send(ChangeEvent::new(&log, ChangeKind::Modify)).await.unwrap();
                sent += 1;
            }
            sent
        });

        watcher.run(rx, &*recorder).await.unwrap();
        let sent = producer.await.unwrap();
        assert_eq!(recorder.calls(), vec!["sass"]);
        assert!(sent < 100, "dispatch waited for the log writes to stop");
    }

    #[tokio::test]
    async fn test_steady_changes_flush_at_deadline() {
        let temp = tempfile::tempdir().unwrap();
        let watcher = watcher(temp.path());
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let sass = watcher.root().join("private/sass/a.scss");

        let recorder = Arc::new(Recorder::default());
        let seen = Arc::clone(&recorder);
        let producer = tokio::spawn(async move {
            let mut sent = 0;
            while seen.calls().is_empty() && sent < 100 {
                tx.send(ChangeEvent::new(&sass, ChangeKind::Modify)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
                sent += 1;
            }
            sent
        });

        watcher.run(rx, &*recorder).await.unwrap();
        let sent = producer.await.unwrap();
        assert_eq!(recorder.calls()[0], "sass");
        assert!(sent < 100, "batch never closed under steady changes");
    }

    #[tokio::test]
    async fn test_fs_events_reach_dispatcher() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("private/sass")).unwrap();
        let watcher = watcher(temp.path());
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let source = FsEventSource::spawn(watcher.root(), tx).unwrap();

        let root = watcher.root().to_path_buf();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tokio::fs::write(root.join("notes.txt"), "unbound").await.unwrap();
            tokio::fs::write(root.join("private/sass/main.scss"), "a { color: red; }")
                .await
                .unwrap();
        });

        let recorder = Recorder::default();
        let dispatched = async {
            while recorder.calls().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::select! {
            result = watcher.run(rx, &recorder) => panic!("watcher stopped early: {result:?}"),
            _ = tokio::time::timeout(Duration::from_secs(5), dispatched) => {}
        }

        writer.await.unwrap();
        drop(source);
        assert_eq!(recorder.calls(), vec!["sass"]);
    }

    #[test]
    fn test_notify_kind_mapping() {
        use notify::event::{AccessKind, CreateKind, MetadataKind};

        assert_eq!(
            ChangeKind::from_notify(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Create)
        );
        assert_eq!(
            ChangeKind::from_notify(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime))),
            None
        );
        assert_eq!(ChangeKind::from_notify(&EventKind::Access(AccessKind::Any)), None);
    }
}
