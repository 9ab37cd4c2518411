//! Control-directory protocol: the filesystem layout that is the source of
//! truth for session existence, status, and streams, plus the watcher that
//! reacts to external mutations.

pub mod dir;
pub mod watcher;

pub use dir::{ControlDir, SessionInfo, SessionPaths, SessionStatus};
pub use watcher::{ControlDirWatcher, WatchEvent};
