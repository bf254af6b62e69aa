//! File watching with debounced reloads.
//!
//! The parent directory is watched rather than the file itself so that
//! editors which replace the file (write-then-rename) keep being observed.

use std::ffi::OsString;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::store::ConfigStore;

/// Handle for a running configuration watcher. Dropping it stops watching.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConfigWatcher {
    pub(crate) fn spawn(store: Arc<ConfigStore>) -> Result<Self, ConfigError> {
        let path = store.path().to_path_buf();
        let file_name: OsString = path
            .file_name()
            .ok_or_else(|| ConfigError::Watch(format!("not a file path: {}", path.display())))?
            .to_os_string();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };

        let (tx, rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) if is_relevant(&event, &file_name) => {
                    let _ = tx.send(());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Configuration watcher error"),
            }
        })
        .map_err(|e| ConfigError::Watch(e.to_string()))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Watch(e.to_string()))?;

        let cancel = CancellationToken::new();
        let window = store.options().debounce;
        let task = tokio::spawn(debounce(rx, window, cancel.clone(), move || {
            let store = Arc::clone(&store);
            async move {
                // Reading and validating is blocking file I/O.
                if let Err(e) = tokio::task::spawn_blocking(move || store.reload_and_notify()).await
                {
                    warn!(error = %e, "Configuration reload task failed");
                }
            }
        }));

        info!(path = %path.display(), debounce_ms = window.as_millis(), "Watching configuration file");

        Ok(Self {
            _watcher: watcher,
            cancel,
            task: Some(task),
        })
    }

    /// Stop watching and wait for an in-flight reload to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn is_relevant(event: &Event, file_name: &OsString) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|p| p.file_name() == Some(file_name.as_os_str()))
}

/// Collapse bursts of change signals into single `fire` calls.
///
/// The first signal starts the timer; every further signal restarts it. When
/// the channel has been quiet for `window`, `fire` runs once.
pub(crate) async fn debounce<F, Fut>(
    mut rx: mpsc::UnboundedReceiver<()>,
    window: Duration,
    cancel: CancellationToken,
    mut fire: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            msg = rx.recv() => {
                if msg.is_none() {
                    break;
                }
            }
        }

        let mut pending = 1_u32;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                msg = rx.recv() => {
                    if msg.is_none() {
                        return;
                    }
                    pending += 1;
                }
                () = tokio::time::sleep(window) => break,
            }
        }

        debug!(events = pending, "Configuration change settled, reloading");
        fire().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ConfigStoreOptions;
    use mcpvisor_core::{EventBus, McpEvent};
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    async fn next_event(rx: &mut broadcast::Receiver<McpEvent>) -> McpEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event within 5s")
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_single_fire() {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        let task = tokio::spawn(debounce(
            rx,
            Duration::from_millis(1000),
            cancel.clone(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {}
            },
        ));

        for _ in 0..5 {
            tx.send(()).unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // A later, separate change fires again
        tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_pending_change() {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        let task = tokio::spawn(debounce(
            rx,
            Duration::from_millis(500),
            cancel.clone(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async {}
            },
        ));

        tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_relevance_filters_by_file_name() {
        let name = OsString::from("mcp.json");
        let modify = Event::new(EventKind::Modify(notify::event::ModifyKind::Any))
            .add_path(PathBuf::from("/etc/mcpvisor/mcp.json"));
        let other = Event::new(EventKind::Modify(notify::event::ModifyKind::Any))
            .add_path(PathBuf::from("/etc/mcpvisor/other.json"));
        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/etc/mcpvisor/mcp.json"));

        assert!(is_relevant(&modify, &name));
        assert!(!is_relevant(&other, &name));
        assert!(!is_relevant(&access, &name));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watch_reloads_edits_and_reports_broken_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        fs::write(&path, r#"{"mcpServers": {"a": {"command": "sleep"}}}"#).unwrap();

        let bus = EventBus::new();
        let store = Arc::new(ConfigStore::new(
            ConfigStoreOptions::new(&path).with_debounce(Duration::from_millis(200)),
            Arc::new(bus.clone()),
        ));
        store.initialize().unwrap();
        let mut rx = bus.subscribe();
        let watcher = store.watch().unwrap();

        // A burst of edits settles into one reload of the final content.
        let edits = [
            r#"{"mcpServers": {"a": {"command": "sleep"}, "b": {"command": "cat"}}}"#,
            r#"{"mcpServers": {"a": {"command": "sleep"}, "b": {"command": "cat", "args": ["-u"]}}}"#,
            r#"{"mcpServers": {"a": {"command": "sleep", "args": ["30"]}, "b": {"command": "cat"}}}"#,
        ];
        for edit in edits {
            fs::write(&path, edit).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        match next_event(&mut rx).await {
            McpEvent::ConfigChanged { old, new } => {
                assert!(old.get("b").is_none());
                assert_eq!(new.get("a").unwrap().args, vec!["30".to_string()]);
                assert!(new.get("b").unwrap().args.is_empty());
            }
            other => panic!("expected config_changed, got {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(rx.try_recv().is_err());

        let before = store.snapshot();
        fs::write(&path, "{ not json").unwrap();
        match next_event(&mut rx).await {
            McpEvent::ReloadError { message } => assert!(!message.is_empty()),
            other => panic!("expected reload_error, got {other:?}"),
        }
        assert_eq!(*store.snapshot(), *before);
        assert_eq!(store.snapshot().len(), 2);

        watcher.stop().await;
    }
}
