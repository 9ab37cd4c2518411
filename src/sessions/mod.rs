//! Session lifecycle management.
//!
//! [`SessionManager`] is the single authority for creating, accessing, and
//! destroying sessions. The in-memory index tracks live handles; the control
//! directory on disk remains the source of truth for metadata, so reads join
//! the index with `info.json`.
//!
//! Besides sessions it spawns itself, the manager *adopts* sessions created
//! by external writers under the control directory (discovered at startup or
//! by the watcher). Adopted sessions have no local bridge; input and resize
//! reach them through their stdin/control FIFOs, and their terminal engine is
//! seeded by replaying the recording.
//!
//! ## Concurrency
//!
//! The index is behind an `RwLock`. Lookups take a read lock; insert/remove
//! take the write lock. Long I/O (spawn, graceful kill) happens outside the
//! lock — the control directory's `mkdir` is the atomic gate against
//! concurrent creates of the same id.

pub mod recording;

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::control::{ControlDir, SessionInfo, SessionStatus, WatchEvent};
use crate::error::SessionError;
use crate::pty::bridge::signal_group;
use crate::pty::PtySession;
use crate::term::TerminalEngine;
use crate::util::now_ms;
use recording::RecordingEvent;

/// Caller-facing spec for a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionSpec {
    /// Caller-supplied id; generated when absent.
    pub id: Option<String>,
    pub name: Option<String>,
    pub command: Vec<String>,
    pub working_dir: String,
    pub env: HashMap<String, String>,
    pub term: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// Session settings shared by every create call.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub term: String,
    pub cols: u16,
    pub rows: u16,
    pub allow_column_resize: bool,
    pub kill_grace_secs: u64,
}

enum Backend {
    /// Spawned by this process; owns the bridge.
    Local(PtySession),
    /// Created by an external writer; reachable only through the filesystem.
    Adopted { pid: Option<u32> },
}

struct SessionEntry {
    backend: Backend,
    term: Arc<TerminalEngine>,
    /// Cached write handle to the stdin FIFO.
    stdin_writer: Mutex<Option<File>>,
}

/// Activity summary for a session.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionActivity {
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_output_at: Option<u64>,
}

/// Output within this window counts as "active".
const ACTIVITY_WINDOW_MS: u64 = 5_000;

/// Manages the pool of sessions. Cloneable — clones share the same index.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    control: ControlDir,
    defaults: SessionDefaults,
    events: broadcast::Sender<Value>,
}

impl SessionManager {
    pub fn new(
        control: ControlDir,
        defaults: SessionDefaults,
        events: broadcast::Sender<Value>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                control,
                defaults,
                events,
            }),
        }
    }

    pub fn control_dir(&self) -> &ControlDir {
        &self.inner.control
    }

    pub fn events(&self) -> broadcast::Sender<Value> {
        self.inner.events.clone()
    }

    /// Create a session: validate the spec, establish the control directory,
    /// spawn the PTY, index it. Returns the session id.
    pub async fn create_session(&self, spec: SessionSpec) -> Result<String, SessionError> {
        if spec.command.is_empty() {
            return Err(SessionError::InvalidArgument(
                "command must not be empty".to_string(),
            ));
        }
        let cols = spec.cols.unwrap_or(self.inner.defaults.cols);
        let rows = spec.rows.unwrap_or(self.inner.defaults.rows);
        if cols == 0 || rows == 0 {
            return Err(SessionError::InvalidArgument(
                "cols and rows must be at least 1".to_string(),
            ));
        }
        let working_dir = crate::util::expand_tilde(&spec.working_dir).into_owned();
        if !std::path::Path::new(&working_dir).is_dir() {
            return Err(SessionError::InvalidArgument(
                "working directory does not exist".to_string(),
            ));
        }

        let id = match spec.id {
            Some(id) => {
                validate_session_id(&id)?;
                id
            }
            None => Uuid::new_v4().to_string(),
        };

        {
            let sessions = self.inner.sessions.read().await;
            if sessions.contains_key(&id) {
                return Err(SessionError::AlreadyExists(id));
            }
        }

        let info = SessionInfo::new(
            id.clone(),
            spec.name,
            spec.command,
            working_dir,
            spec.env,
            spec.term.unwrap_or_else(|| self.inner.defaults.term.clone()),
            cols,
            rows,
        );

        // mkdir inside create() is the atomic collision gate.
        self.inner.control.create(&info)?;

        let term = Arc::new(TerminalEngine::new(cols, rows));
        let session = match PtySession::spawn(
            &self.inner.control,
            &info,
            Arc::clone(&term),
            self.inner.defaults.allow_column_resize,
            self.inner.events.clone(),
        ) {
            Ok(s) => s,
            Err(e) => {
                // No fd leak on failed spawn: the control dir (and its FIFOs)
                // goes away with the failure.
                let _ = self.inner.control.destroy(&id);
                return Err(e);
            }
        };
        let pid = session.pid;

        let entry = SessionEntry {
            backend: Backend::Local(session),
            term,
            stdin_writer: Mutex::new(None),
        };
        self.inner.sessions.write().await.insert(id.clone(), entry);

        let _ = self.inner.events.send(json!({
            "type": "session.created",
            "sessionId": id,
        }));
        info!("Session {id} created (pid {pid}, {cols}x{rows})");
        Ok(id)
    }

    /// Load a session's metadata (disk is authoritative).
    pub async fn get_session(&self, id: &str) -> Result<SessionInfo, SessionError> {
        let sessions = self.inner.sessions.read().await;
        if !sessions.contains_key(id) {
            return Err(SessionError::NotFound(id.to_string()));
        }
        drop(sessions);
        self.inner.control.load(id)
    }

    /// Metadata for every indexed session. Entries whose `info.json` cannot
    /// be read right now are skipped.
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let ids: Vec<String> = {
            let sessions = self.inner.sessions.read().await;
            sessions.keys().cloned().collect()
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.inner.control.load(&id) {
                Ok(info) => out.push(info),
                Err(e) => debug!("list: skipping {id}: {e}"),
            }
        }
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// The terminal engine backing a session's buffer endpoints.
    pub async fn term_engine(&self, id: &str) -> Option<Arc<TerminalEngine>> {
        let sessions = self.inner.sessions.read().await;
        sessions.get(id).map(|e| Arc::clone(&e.term))
    }

    /// Kill a session: SIGTERM, wait out the grace period, SIGKILL if still
    /// alive, then drop it from the index once exited. Killing an
    /// already-exited session succeeds immediately.
    pub async fn kill_session(&self, id: &str) -> Result<(), SessionError> {
        enum Target {
            Local,
            Adopted(Option<u32>),
        }
        let target = {
            let sessions = self.inner.sessions.read().await;
            match sessions.get(id) {
                Some(entry) => match &entry.backend {
                    Backend::Local(_) => Target::Local,
                    Backend::Adopted { pid } => Target::Adopted(*pid),
                },
                None => return Err(SessionError::NotFound(id.to_string())),
            }
        };

        let grace = Duration::from_secs(self.inner.defaults.kill_grace_secs);
        match target {
            Target::Local => {
                let session_exited = {
                    let sessions = self.inner.sessions.read().await;
                    let Some(entry) = sessions.get(id) else {
                        return Ok(());
                    };
                    let Backend::Local(ref pty) = entry.backend else {
                        return Ok(());
                    };
                    if pty.is_exited() {
                        true
                    } else {
                        pty.signal(libc::SIGTERM);
                        false
                    }
                };
                if !session_exited {
                    let exited = self.wait_local_exit(id, grace).await;
                    if !exited {
                        let sessions = self.inner.sessions.read().await;
                        if let Some(entry) = sessions.get(id) {
                            if let Backend::Local(ref pty) = entry.backend {
                                pty.signal(libc::SIGKILL);
                            }
                        }
                        drop(sessions);
                        self.wait_local_exit(id, Duration::from_secs(2)).await;
                    }
                }
            }
            Target::Adopted(pid) => {
                if let Some(pid) = pid {
                    if is_pid_alive(pid) {
                        signal_group(pid, libc::SIGTERM);
                        let deadline = tokio::time::Instant::now() + grace;
                        while is_pid_alive(pid) && tokio::time::Instant::now() < deadline {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                        if is_pid_alive(pid) {
                            signal_group(pid, libc::SIGKILL);
                        }
                    }
                    let _ = self.inner.control.update(id, |i| {
                        if i.status != SessionStatus::Exited {
                            i.status = SessionStatus::Exited;
                            i.exit_code.get_or_insert(-1);
                        }
                    });
                }
            }
        }

        let removed = self.inner.sessions.write().await.remove(id);
        if removed.is_some() {
            if let Some(SessionEntry {
                backend: Backend::Local(pty),
                ..
            }) = removed
            {
                pty.stop_bridge();
            }
            let _ = self.inner.events.send(json!({
                "type": "session.destroyed",
                "sessionId": id,
                "reason": "killed",
            }));
            info!("Session {id} killed");
        }
        Ok(())
    }

    async fn wait_local_exit(&self, id: &str, timeout: Duration) -> bool {
        let pty = {
            let sessions = self.inner.sessions.read().await;
            match sessions.get(id) {
                Some(SessionEntry {
                    backend: Backend::Local(pty),
                    ..
                }) => Some((pty.pid, pty_wait_handle(pty))),
                _ => None,
            }
        };
        match pty {
            Some((_, handle)) => handle.wait(timeout).await,
            None => true,
        }
    }

    /// Write bytes to the session's stdin FIFO.
    pub async fn send_input(&self, id: &str, bytes: &[u8]) -> Result<(), SessionError> {
        let sessions = self.inner.sessions.read().await;
        let entry = sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if let Backend::Local(ref pty) = entry.backend {
            if pty.is_exited() {
                return Err(SessionError::InvalidArgument(
                    "session is not running".to_string(),
                ));
            }
        }

        let paths = self.inner.control.paths(id);
        let mut writer = entry.stdin_writer.lock().expect("stdin writer poisoned");
        if writer.is_none() {
            // Opening write-only + nonblocking fails with ENXIO if the
            // bridge (reader) is gone; that surfaces as an error here.
            let file = File::options()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&paths.stdin)
                .map_err(|e| {
                    SessionError::InvalidArgument(format!("stdin unavailable: {e}"))
                })?;
            *writer = Some(file);
        }
        let file = writer.as_ref().expect("writer just cached");
        write_fifo(file, bytes)?;
        Ok(())
    }

    /// Resize the session's terminal. `Disabled` when the server policy
    /// forbids column changes and the request changes the column count.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::InvalidArgument(
                "cols and rows must be at least 1".to_string(),
            ));
        }
        let sessions = self.inner.sessions.read().await;
        let entry = sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        if !self.inner.defaults.allow_column_resize {
            let current = self.inner.control.load(id)?;
            if current.width != cols {
                debug!("session {id}: column resize disabled, rejecting {cols}x{rows}");
                return Err(SessionError::Disabled(
                    "column resize is disabled on this server".to_string(),
                ));
            }
        }

        match &entry.backend {
            Backend::Local(pty) => pty.resize(cols, rows),
            Backend::Adopted { .. } => {
                // Route through the owner's control FIFO.
                let paths = self.inner.control.paths(id);
                let file = File::options()
                    .write(true)
                    .custom_flags(libc::O_NONBLOCK)
                    .open(&paths.control)
                    .map_err(|e| {
                        SessionError::InvalidArgument(format!("control unavailable: {e}"))
                    })?;
                let line = format!("{}\n", json!({"cmd": "resize", "cols": cols, "rows": rows}));
                write_fifo(&file, line.as_bytes())?;
                Ok(())
            }
        }
    }

    /// Activity summary for one session.
    pub async fn activity(&self, id: &str) -> Result<SessionActivity, SessionError> {
        let sessions = self.inner.sessions.read().await;
        let entry = sessions
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let last = entry.term.last_update_ms();
        Ok(SessionActivity {
            is_active: last != 0 && now_ms().saturating_sub(last) < ACTIVITY_WINDOW_MS,
            last_output_at: (last != 0).then_some(last),
        })
    }

    /// Activity summaries for all sessions.
    pub async fn activity_all(&self) -> HashMap<String, SessionActivity> {
        let sessions = self.inner.sessions.read().await;
        sessions
            .iter()
            .map(|(id, entry)| {
                let last = entry.term.last_update_ms();
                (
                    id.clone(),
                    SessionActivity {
                        is_active: last != 0 && now_ms().saturating_sub(last) < ACTIVITY_WINDOW_MS,
                        last_output_at: (last != 0).then_some(last),
                    },
                )
            })
            .collect()
    }

    /// Remove every exited session: drop from the index and delete its
    /// control directory. Idempotent. Returns the removed ids.
    pub async fn cleanup_exited(&self) -> Vec<String> {
        let ids: Vec<String> = {
            let sessions = self.inner.sessions.read().await;
            sessions.keys().cloned().collect()
        };

        let mut removed = Vec::new();
        for id in ids {
            let exited = {
                let sessions = self.inner.sessions.read().await;
                match sessions.get(&id) {
                    Some(entry) => match &entry.backend {
                        Backend::Local(pty) => pty.is_exited(),
                        Backend::Adopted { .. } => self
                            .inner
                            .control
                            .load(&id)
                            .map(|i| i.status == SessionStatus::Exited)
                            .unwrap_or(true),
                    },
                    None => false,
                }
            };
            if !exited {
                continue;
            }
            if let Some(entry) = self.inner.sessions.write().await.remove(&id) {
                if let Backend::Local(pty) = entry.backend {
                    pty.stop_bridge();
                }
                if let Err(e) = self.inner.control.destroy(&id) {
                    warn!("cleanup: failed to remove control dir for {id}: {e}");
                }
                let _ = self.inner.events.send(json!({
                    "type": "session.destroyed",
                    "sessionId": id,
                    "reason": "cleanup",
                }));
                removed.push(id);
            }
        }
        if !removed.is_empty() {
            info!("Cleaned up {} exited session(s)", removed.len());
        }
        removed
    }

    /// Shutdown path: SIGTERM everything, wait out the grace period, SIGKILL
    /// what remains, stop all bridges.
    pub async fn kill_all(&self) {
        let entries: Vec<(String, Option<u32>, bool)> = {
            let sessions = self.inner.sessions.read().await;
            sessions
                .iter()
                .map(|(id, e)| match &e.backend {
                    Backend::Local(pty) => (id.clone(), Some(pty.pid), pty.is_exited()),
                    Backend::Adopted { pid } => (id.clone(), *pid, false),
                })
                .collect()
        };
        if entries.is_empty() {
            return;
        }

        for (id, pid, exited) in &entries {
            if let (Some(pid), false) = (pid, exited) {
                signal_group(*pid, libc::SIGTERM);
                debug!("Session {id}: SIGTERM sent (shutdown)");
            }
        }

        tokio::time::sleep(Duration::from_secs(self.inner.defaults.kill_grace_secs)).await;

        let mut sessions = self.inner.sessions.write().await;
        let count = sessions.len();
        for (id, entry) in sessions.drain() {
            match entry.backend {
                Backend::Local(pty) => {
                    if !pty.is_exited() {
                        pty.signal(libc::SIGKILL);
                    }
                    pty.stop_bridge();
                }
                Backend::Adopted { pid: Some(pid) } => {
                    if is_pid_alive(pid) {
                        signal_group(pid, libc::SIGKILL);
                    }
                }
                Backend::Adopted { pid: None } => {}
            }
            debug!("Session {id} stopped (shutdown)");
        }
        info!("Shut down {count} session(s)");
    }

    /// Startup pass: adopt every session directory already on disk.
    pub async fn adopt_existing(&self) {
        for id in self.inner.control.list_ids() {
            self.handle_watch_event(WatchEvent::Added(id)).await;
        }
    }

    /// React to a control-directory change published by the watcher.
    pub async fn handle_watch_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::Added(id) => self.adopt(&id).await,
            WatchEvent::Removed(id) => self.forget_removed(&id).await,
        }
    }

    /// Register an externally created session. A live pid is adopted as-is;
    /// a dead one is marked exited first.
    async fn adopt(&self, id: &str) {
        {
            let sessions = self.inner.sessions.read().await;
            if sessions.contains_key(id) {
                return; // our own create, or already adopted
            }
        }

        let info = match self.inner.control.load(id) {
            Ok(info) => info,
            Err(SessionError::InvalidArgument(_)) => {
                // Metadata mid-write; the debounced watcher will fire again
                // after the rename lands.
                debug!("adopt: metadata for {id} not ready yet");
                return;
            }
            Err(e) => {
                debug!("adopt: cannot load {id}: {e}");
                return;
            }
        };

        let alive = info.pid.is_some_and(is_pid_alive);
        if !alive && info.status != SessionStatus::Exited {
            let _ = self.inner.control.update(id, |i| {
                i.status = SessionStatus::Exited;
                i.exit_code.get_or_insert(-1);
            });
        }

        let term = Arc::new(TerminalEngine::new(info.width, info.height));
        replay_recording(&self.inner.control, id, &term);

        let entry = SessionEntry {
            backend: Backend::Adopted {
                pid: alive.then(|| info.pid.unwrap_or_default()),
            },
            term,
            stdin_writer: Mutex::new(None),
        };
        self.inner.sessions.write().await.insert(id.to_string(), entry);
        let _ = self.inner.events.send(json!({
            "type": "session.created",
            "sessionId": id,
            "adopted": true,
        }));
        info!("Adopted external session {id} (alive: {alive})");
    }

    /// A session directory disappeared out from under us: kill and forget.
    async fn forget_removed(&self, id: &str) {
        let Some(entry) = self.inner.sessions.write().await.remove(id) else {
            return;
        };
        match entry.backend {
            Backend::Local(pty) => {
                if !pty.is_exited() {
                    pty.signal(libc::SIGTERM);
                }
                pty.stop_bridge();
            }
            Backend::Adopted { pid: Some(pid) } => {
                if is_pid_alive(pid) {
                    signal_group(pid, libc::SIGTERM);
                }
            }
            Backend::Adopted { pid: None } => {}
        }
        let _ = self.inner.events.send(json!({
            "type": "session.destroyed",
            "sessionId": id,
            "reason": "removed",
        }));
        info!("Session {id} removed externally, forgotten");
    }

    /// Periodic sweep: notice adopted sessions whose process died while the
    /// external owner failed to update the metadata.
    pub async fn sweep(&self) {
        let adopted: Vec<(String, u32)> = {
            let sessions = self.inner.sessions.read().await;
            sessions
                .iter()
                .filter_map(|(id, e)| match e.backend {
                    Backend::Adopted { pid: Some(pid) } => Some((id.clone(), pid)),
                    _ => None,
                })
                .collect()
        };
        for (id, pid) in adopted {
            if is_pid_alive(pid) {
                continue;
            }
            let updated = self.inner.control.update(&id, |i| {
                if i.status != SessionStatus::Exited {
                    i.status = SessionStatus::Exited;
                    i.exit_code.get_or_insert(-1);
                }
            });
            if updated.is_ok() {
                let mut sessions = self.inner.sessions.write().await;
                if let Some(entry) = sessions.get_mut(&id) {
                    entry.backend = Backend::Adopted { pid: None };
                }
                debug!("sweep: adopted session {id} (pid {pid}) is gone, marked exited");
            }
        }
    }
}

/// Handle used to await a local session's exit without holding the index lock.
struct ExitWait {
    notify: Arc<tokio::sync::Notify>,
    check: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl ExitWait {
    async fn wait(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !(self.check)() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
        true
    }
}

fn pty_wait_handle(pty: &PtySession) -> ExitWait {
    let status = pty.shared_status();
    ExitWait {
        notify: pty.exited_notifier(),
        check: Arc::new(move || status.is_exited()),
    }
}

/// Session ids become path components; reject anything that could escape the
/// control root.
fn validate_session_id(id: &str) -> Result<(), SessionError> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(SessionError::InvalidArgument(
            "session id must be alphanumeric with dashes".to_string(),
        ))
    }
}

fn is_pid_alive(pid: u32) -> bool {
    #[allow(clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(pid as i32, 0) };
    ret == 0
}

/// Seed an adopted session's terminal engine from its recording.
fn replay_recording(control: &ControlDir, id: &str, term: &TerminalEngine) {
    let paths = control.paths(id);
    let Ok(events) = recording::read_events(&paths.stream_out) else {
        return;
    };
    for event in events {
        match event {
            RecordingEvent::Output { data, .. } => term.feed(data.as_bytes()),
            RecordingEvent::Resize { size, .. } => {
                if let Some((c, r)) = size.split_once('x') {
                    if let (Ok(c), Ok(r)) = (c.parse(), r.parse()) {
                        term.resize(c, r);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Write to a non-blocking FIFO, retrying briefly on a full pipe.
fn write_fifo(file: &File, mut bytes: &[u8]) -> Result<(), SessionError> {
    let fd = file.as_raw_fd();
    let mut retries = 0;
    while !bytes.is_empty() {
        // SAFETY: bounded write from a caller-provided buffer.
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock if retries < 50 => {
                    retries += 1;
                    std::thread::sleep(Duration::from_millis(2));
                    continue;
                }
                _ => return Err(SessionError::Io(err)),
            }
        }
        #[allow(clippy::cast_sign_loss)]
        let n = n as usize;
        bytes = &bytes[n..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (SessionManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let control = ControlDir::open(dir.path()).unwrap();
        let (events, _) = broadcast::channel(64);
        let manager = SessionManager::new(
            control,
            SessionDefaults {
                term: "xterm-256color".to_string(),
                cols: 80,
                rows: 24,
                allow_column_resize: true,
                kill_grace_secs: 1,
            },
            events,
        );
        (manager, dir)
    }

    fn spec(command: &[&str]) -> SessionSpec {
        SessionSpec {
            command: command.iter().map(ToString::to_string).collect(),
            working_dir: "/tmp".to_string(),
            ..SessionSpec::default()
        }
    }

    #[test]
    fn test_validate_session_id() {
        assert!(validate_session_id("abc-123_DEF").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("../escape").is_err());
        assert!(validate_session_id("a/b").is_err());
    }

    #[tokio::test]
    async fn test_create_rejects_empty_command() {
        let (manager, _dir) = manager();
        let err = manager
            .create_session(SessionSpec {
                working_dir: "/tmp".to_string(),
                ..SessionSpec::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_zero_dimensions() {
        let (manager, _dir) = manager();
        let mut s = spec(&["true"]);
        s.cols = Some(0);
        let err = manager.create_session(s).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_missing_working_dir() {
        let (manager, _dir) = manager();
        let mut s = spec(&["true"]);
        s.working_dir = "/definitely/not/a/dir".to_string();
        let err = manager.create_session(s).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_echo_session_lifecycle() {
        let (manager, _dir) = manager();
        let id = manager
            .create_session(spec(&["echo", "hello"]))
            .await
            .unwrap();

        // The child exits quickly; the exit watcher records it.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let info = manager.get_session(&id).await.unwrap();
            if info.status == SessionStatus::Exited {
                assert_eq!(info.exit_code, Some(0));
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "session did not exit in time"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Recording ends with the exit record and contains the output.
        let paths = manager.control_dir().paths(&id);
        let events = recording::read_events(&paths.stream_out).unwrap();
        assert!(matches!(
            events.last(),
            Some(RecordingEvent::Exit { code: 0, session_id }) if session_id == &id
        ));
        let output: String = events
            .iter()
            .filter_map(|e| match e {
                RecordingEvent::Output { data, .. } => Some(data.as_str()),
                _ => None,
            })
            .collect();
        assert!(output.contains("hello"));
    }

    #[tokio::test]
    async fn test_interactive_input_and_kill() {
        let (manager, _dir) = manager();
        let id = manager.create_session(spec(&["cat"])).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        manager.send_input(&id, b"abc\n").await.unwrap();

        // cat echoes the line back through the PTY
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let engine = manager.term_engine(&id).await.unwrap();
            if engine.text().contains("abc") {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "input was not echoed"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        manager.kill_session(&id).await.unwrap();
        // Removed from the index after kill.
        assert!(matches!(
            manager.get_session(&id).await,
            Err(SessionError::NotFound(_))
        ));
        // Killing again is a NotFound now (it is gone), but killing an
        // exited-but-indexed session is a success; covered below.
    }

    #[tokio::test]
    async fn test_kill_exited_session_is_noop() {
        let (manager, _dir) = manager();
        let id = manager.create_session(spec(&["true"])).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let info = manager.get_session(&id).await.unwrap();
            if info.status == SessionStatus::Exited {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        manager.kill_session(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_round_trip() {
        let (manager, _dir) = manager();
        let id = manager
            .create_session(spec(&["sleep", "5"]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        manager.resize(&id, 120, 40).await.unwrap();
        let info = manager.get_session(&id).await.unwrap();
        assert_eq!(info.width, 120);
        assert_eq!(info.height, 40);

        let paths = manager.control_dir().paths(&id);
        let events = recording::read_events(&paths.stream_out).unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, RecordingEvent::Resize { size, .. } if size == "120x40")));

        manager.kill_session(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_validation() {
        let (manager, _dir) = manager();
        let err = manager.resize("nope", 80, 24).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
        let err = manager.resize("nope", 0, 24).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_cleanup_exited_idempotent() {
        let (manager, _dir) = manager();
        let id = manager.create_session(spec(&["true"])).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let info = manager.get_session(&id).await.unwrap();
            if info.status == SessionStatus::Exited {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let removed = manager.cleanup_exited().await;
        assert_eq!(removed, vec![id.clone()]);
        assert!(manager.control_dir().list_ids().is_empty());

        let removed = manager.cleanup_exited().await;
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_creates_distinct() {
        let (manager, _dir) = manager();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let m = manager.clone();
            handles.push(tokio::spawn(async move {
                m.create_session(spec(&["sleep", "3"])).await
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);

        let infos = manager.list_sessions().await;
        let mut pids: Vec<u32> = infos.iter().filter_map(|i| i.pid).collect();
        pids.sort_unstable();
        pids.dedup();
        assert_eq!(pids.len(), 4);

        for id in &ids {
            manager.kill_session(id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_caller_supplied_id_collision() {
        let (manager, _dir) = manager();
        let mut s = spec(&["sleep", "3"]);
        s.id = Some("fixed-id".to_string());
        manager.create_session(s.clone()).await.unwrap();
        let err = manager.create_session(s).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyExists(_)));
        manager.kill_session("fixed-id").await.unwrap();
    }

    #[tokio::test]
    async fn test_adopt_dead_external_session() {
        let (manager, _dir) = manager();
        // An external writer drops a session dir with a dead pid.
        let mut info = SessionInfo::new(
            "ext-1".to_string(),
            None,
            vec!["sleep".to_string(), "999".to_string()],
            "/tmp".to_string(),
            HashMap::new(),
            "xterm-256color".to_string(),
            80,
            24,
        );
        info.status = SessionStatus::Running;
        info.pid = Some(999_999_999); // not a live pid
        manager.control_dir().create(&info).unwrap();

        manager
            .handle_watch_event(WatchEvent::Added("ext-1".to_string()))
            .await;

        let loaded = manager.get_session("ext-1").await.unwrap();
        assert_eq!(loaded.status, SessionStatus::Exited);
        assert!(loaded.exit_code.is_some());
    }
}
