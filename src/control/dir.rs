//! Per-session control directory layout and metadata persistence.
//!
//! Each session owns `<root>/<id>/` containing:
//!
//! - `info.json` — serialized [`SessionInfo`], authoritative on disk
//! - `stream-out` — the append-only recording
//! - `stdin` — FIFO read by the PTY bridge, written by input handlers
//! - `control` — FIFO read by the PTY bridge, written by resize/kill/rename
//!
//! Metadata writes go through a temp file in the same directory followed by a
//! rename, so readers (including the watcher) never observe a partial
//! `info.json`. The directory is created with mode 0700 and the FIFOs with
//! 0600 before the initial metadata write, so externally visible state is
//! consistent before the PTY spawns.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::util::now_iso8601;

/// Session lifecycle status as persisted in `info.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Exited => "exited",
        }
    }
}

/// On-disk session metadata; the spec's `Session` data model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub command: Vec<String>,
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    pub term: String,
    pub width: u16,
    pub height: u16,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub started_at: String,
    pub last_modified: String,
    /// Transient UI hint set by external writers; the server never sets it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub waiting: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
}

impl SessionInfo {
    /// Fresh metadata for a session about to spawn.
    pub fn new(
        id: String,
        name: Option<String>,
        command: Vec<String>,
        working_dir: String,
        env: HashMap<String, String>,
        term: String,
        width: u16,
        height: u16,
    ) -> Self {
        let now = now_iso8601();
        Self {
            id,
            name,
            command,
            working_dir,
            env,
            term,
            width,
            height,
            status: SessionStatus::Starting,
            pid: None,
            exit_code: None,
            started_at: now.clone(),
            last_modified: now,
            waiting: false,
            source: None,
            remote_id: None,
            remote_name: None,
            remote_url: None,
        }
    }
}

/// Filesystem paths of one session's control directory.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub info: PathBuf,
    pub stream_out: PathBuf,
    pub stdin: PathBuf,
    pub control: PathBuf,
}

/// Handle on the control-directory root; the source of truth for session
/// existence and status.
#[derive(Debug, Clone)]
pub struct ControlDir {
    root: PathBuf,
}

impl ControlDir {
    /// Open (creating if needed) the control-directory root.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self, id: &str) -> SessionPaths {
        let dir = self.root.join(id);
        SessionPaths {
            info: dir.join("info.json"),
            stream_out: dir.join("stream-out"),
            stdin: dir.join("stdin"),
            control: dir.join("control"),
            dir,
        }
    }

    /// Create the directory, both FIFOs, and the initial `info.json`.
    ///
    /// Fails with `AlreadyExists` on id collision. Partially created state is
    /// torn down on error so a failed create leaves nothing behind.
    pub fn create(&self, info: &SessionInfo) -> Result<SessionPaths, SessionError> {
        let paths = self.paths(&info.id);

        let mut builder = std::fs::DirBuilder::new();
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        // mkdir is the atomic collision gate for concurrent creates.
        match builder.create(&paths.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(SessionError::AlreadyExists(info.id.clone()))
            }
            Err(e) => return Err(SessionError::Io(e)),
        }

        let result = (|| {
            mkfifo_atomic(&paths.stdin)?;
            mkfifo_atomic(&paths.control)?;
            self.save(info)?;
            Ok(())
        })();

        match result {
            Ok(()) => Ok(paths),
            Err(e) => {
                let _ = std::fs::remove_dir_all(&paths.dir);
                Err(e)
            }
        }
    }

    /// Atomically write `info.json` (temp file + fsync + rename).
    pub fn save(&self, info: &SessionInfo) -> Result<(), SessionError> {
        let paths = self.paths(&info.id);
        let json = serde_json::to_string_pretty(info)
            .map_err(|e| SessionError::Io(std::io::Error::other(e)))?;
        let tmp = tempfile::NamedTempFile::new_in(&paths.dir)?;
        std::fs::write(tmp.path(), json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&paths.info)
            .map_err(|e| SessionError::Io(e.error))?;
        Ok(())
    }

    /// Load `info.json`. A missing directory maps to `NotFound`; a partial or
    /// corrupt file maps to `InvalidArgument` so callers can retry after the
    /// writer finishes its rename.
    pub fn load(&self, id: &str) -> Result<SessionInfo, SessionError> {
        let paths = self.paths(id);
        let contents = match std::fs::read_to_string(&paths.info) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::NotFound(id.to_string()))
            }
            Err(e) => return Err(SessionError::Io(e)),
        };
        serde_json::from_str(&contents)
            .map_err(|e| SessionError::InvalidArgument(format!("corrupt session metadata: {e}")))
    }

    /// Load, mutate, bump `lastModified`, and save.
    pub fn update(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut SessionInfo),
    ) -> Result<SessionInfo, SessionError> {
        let mut info = self.load(id)?;
        mutate(&mut info);
        info.last_modified = now_iso8601();
        self.save(&info)?;
        Ok(info)
    }

    /// Ids of every session directory currently on disk.
    pub fn list_ids(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|e| e.file_name().into_string().ok())
            .collect()
    }

    /// Remove a session's directory and contents. Safe if already gone.
    pub fn destroy(&self, id: &str) -> Result<(), SessionError> {
        let paths = self.paths(id);
        match std::fs::remove_dir_all(&paths.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::Io(e)),
        }
    }
}

/// Create a FIFO with mode 0600 if the path does not exist yet.
fn mkfifo_atomic(path: &Path) -> Result<(), SessionError> {
    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(err) => Err(SessionError::Io(err.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info(id: &str) -> SessionInfo {
        SessionInfo::new(
            id.to_string(),
            Some("test".to_string()),
            vec!["echo".to_string(), "hi".to_string()],
            "/tmp".to_string(),
            HashMap::new(),
            "xterm-256color".to_string(),
            80,
            24,
        )
    }

    #[test]
    fn test_create_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let control = ControlDir::open(dir.path()).unwrap();
        let paths = control.create(&sample_info("abc")).unwrap();

        assert!(paths.dir.is_dir());
        assert!(paths.stdin.exists());
        assert!(paths.control.exists());

        let loaded = control.load("abc").unwrap();
        assert_eq!(loaded.id, "abc");
        assert_eq!(loaded.status, SessionStatus::Starting);
        assert_eq!(loaded.command, vec!["echo", "hi"]);
        assert_eq!(loaded.width, 80);
    }

    #[test]
    fn test_create_collision() {
        let dir = tempfile::tempdir().unwrap();
        let control = ControlDir::open(dir.path()).unwrap();
        control.create(&sample_info("abc")).unwrap();
        assert!(matches!(
            control.create(&sample_info("abc")),
            Err(SessionError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_update_bumps_last_modified() {
        let dir = tempfile::tempdir().unwrap();
        let control = ControlDir::open(dir.path()).unwrap();
        control.create(&sample_info("abc")).unwrap();

        let updated = control
            .update("abc", |info| {
                info.status = SessionStatus::Running;
                info.pid = Some(1234);
            })
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Running);
        assert_eq!(updated.pid, Some(1234));

        let loaded = control.load("abc").unwrap();
        assert_eq!(loaded.pid, Some(1234));
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let control = ControlDir::open(dir.path()).unwrap();
        assert!(matches!(
            control.load("nope"),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn test_load_corrupt_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let control = ControlDir::open(dir.path()).unwrap();
        control.create(&sample_info("abc")).unwrap();
        std::fs::write(control.paths("abc").info, "{\"id\": \"abc\"").unwrap();
        assert!(matches!(
            control.load("abc"),
            Err(SessionError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_destroy_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let control = ControlDir::open(dir.path()).unwrap();
        control.create(&sample_info("abc")).unwrap();
        control.destroy("abc").unwrap();
        control.destroy("abc").unwrap();
        assert!(control.list_ids().is_empty());
    }

    #[test]
    fn test_list_ids() {
        let dir = tempfile::tempdir().unwrap();
        let control = ControlDir::open(dir.path()).unwrap();
        control.create(&sample_info("a")).unwrap();
        control.create(&sample_info("b")).unwrap();
        let mut ids = control.list_ids();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let info = sample_info("abc");
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"status\":\"starting\""));
        assert!(json.contains("\"workingDir\""));
        // absent optionals are omitted entirely
        assert!(!json.contains("exitCode"));
    }
}
