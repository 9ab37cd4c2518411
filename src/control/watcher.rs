//! Filesystem watcher for the control directory.
//!
//! Reacts to creation and deletion of per-session subdirectories made by
//! external writers (other processes placing a session under the control
//! root, or deleting one out from under us). Events are debounced so the
//! temp-file-then-rename metadata writes don't cause thrashing.
//!
//! The watcher publishes [`WatchEvent`]s on a channel; the session manager
//! consumes them in its reconcile task. Neither side holds a reference to
//! the other.

use std::path::Path;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEventKind, Debouncer};
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

/// A change observed under the control root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A session directory appeared (or reappeared).
    Added(String),
    /// A session directory was removed.
    Removed(String),
}

/// Owns the running debouncer; dropping it stops the watch.
pub struct ControlDirWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
}

impl ControlDirWatcher {
    /// Start watching `root` (non-recursively — only direct session
    /// directories matter) and publish events on `tx`.
    pub fn spawn(root: &Path, tx: UnboundedSender<WatchEvent>) -> Result<Self, notify::Error> {
        let root_buf = root.to_path_buf();
        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            move |res: Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>| {
                match res {
                    Ok(events) => {
                        for event in events {
                            if event.kind != DebouncedEventKind::Any {
                                continue;
                            }
                            let Some(id) = session_id_for(&root_buf, &event.path) else {
                                continue;
                            };
                            // The debounced kind doesn't distinguish create
                            // from delete; existence at delivery time does.
                            let ev = if root_buf.join(&id).is_dir() {
                                WatchEvent::Added(id)
                            } else {
                                WatchEvent::Removed(id)
                            };
                            let _ = tx.send(ev);
                        }
                    }
                    Err(e) => warn!("control dir watch error: {e}"),
                }
            },
        )?;
        debouncer
            .watcher()
            .watch(root, RecursiveMode::NonRecursive)?;
        Ok(Self {
            _debouncer: debouncer,
        })
    }
}

/// Map an event path to a session id: the first path component under the
/// control root. Events for the root itself return `None`.
fn session_id_for(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let first = relative.components().next()?;
    let name = first.as_os_str().to_str()?;
    if name.is_empty() {
        return None;
    }
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_for() {
        let root = PathBuf::from("/ctl");
        assert_eq!(
            session_id_for(&root, Path::new("/ctl/abc")),
            Some("abc".to_string())
        );
        assert_eq!(
            session_id_for(&root, Path::new("/ctl/abc/info.json")),
            Some("abc".to_string())
        );
        assert_eq!(session_id_for(&root, Path::new("/ctl")), None);
        assert_eq!(session_id_for(&root, Path::new("/elsewhere/abc")), None);
    }

    #[tokio::test]
    async fn test_watch_detects_add_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _watcher = ControlDirWatcher::spawn(dir.path(), tx).unwrap();

        let session_dir = dir.path().join("sess-1");
        std::fs::create_dir(&session_dir).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event within timeout")
            .expect("channel closed");
        assert_eq!(event, WatchEvent::Added("sess-1".to_string()));

        std::fs::remove_dir_all(&session_dir).unwrap();
        // Drain until the removal shows up; creation may emit extra events.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let event = tokio::time::timeout(remaining, rx.recv())
                .await
                .expect("no removal event within timeout")
                .expect("channel closed");
            if event == WatchEvent::Removed("sess-1".to_string()) {
                break;
            }
        }
    }
}
