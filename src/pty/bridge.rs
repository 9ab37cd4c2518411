//! Per-session PTY bridging.
//!
//! Each session owns exactly one bridging thread. The thread is the sole
//! reader of the PTY master, the stdin FIFO, and the control FIFO, and the
//! sole producer of output/input/resize records. It drives all three fds
//! through the readiness loop, draining non-blocking reads until `EAGAIN`.
//! A hangup on the master (child side closed) ends the loop.
//!
//! A separate exit-watcher task waits on the child, then appends the
//! terminal exit record, closes the recording, persists the exited status,
//! and reaps any orphaned zombies.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::ExitStatusExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::process::Child;
use tokio::sync::{broadcast, oneshot, Notify};
use tracing::{debug, error, info, warn};

use crate::control::{ControlDir, SessionInfo, SessionStatus};
use crate::error::SessionError;
use crate::io_loop::{self, Event, EventLoop, Stopper, HUP, READ};
use crate::sessions::recording::{Header, StreamWriter};
use crate::term::TerminalEngine;

use super::spawn::{
    allocate_pty, disable_echo, reap_orphans, resize_pty, resolve_command, resolve_user_shell,
    spawn_child,
};

const TOKEN_MASTER: u64 = 1;
const TOKEN_STDIN: u64 = 2;
const TOKEN_CONTROL: u64 = 3;

/// Control-FIFO command language: newline-delimited JSON objects.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
enum ControlCommand {
    Resize { cols: u16, rows: u16 },
    Kill { signal: Option<i32> },
    Rename { name: String },
}

/// Live exit state shared between the exit watcher and the manager.
pub struct SharedStatus {
    exited: AtomicBool,
    exit_code: Mutex<Option<i32>>,
}

impl SharedStatus {
    fn new() -> Self {
        Self {
            exited: AtomicBool::new(false),
            exit_code: Mutex::new(None),
        }
    }

    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().expect("status poisoned")
    }
}

/// Handle on a live PTY session, owned by the session manager.
pub struct PtySession {
    pub id: String,
    pub pid: u32,
    master: Arc<OwnedFd>,
    writer: Arc<StreamWriter>,
    term: Arc<TerminalEngine>,
    control: ControlDir,
    status: Arc<SharedStatus>,
    stopper: Stopper,
    exited_notify: Arc<Notify>,
}

impl PtySession {
    /// Spawn the child under a PTY and start the bridging thread plus the
    /// exit watcher. `info` must already be persisted with `Starting` status
    /// and its control directory created.
    pub fn spawn(
        control: &ControlDir,
        info: &SessionInfo,
        term_engine: Arc<TerminalEngine>,
        allow_column_resize: bool,
        events: broadcast::Sender<serde_json::Value>,
    ) -> Result<Self, SessionError> {
        let paths = control.paths(&info.id);

        let shell = resolve_user_shell();
        let argv = resolve_command(&info.command, &shell, &info.working_dir);

        let pty = allocate_pty(info.width, info.height)
            .map_err(|e| SessionError::PtyCreationFailed(format!("openpty: {e}")))?;
        if let Err(e) = disable_echo(&pty.master) {
            debug!("session {}: disable echo failed: {e}", info.id);
        }

        let child = spawn_child(&pty, &argv, &info.working_dir, &info.env, &info.term)
            .map_err(|e| SessionError::PtyCreationFailed(format!("spawn: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| SessionError::PtyCreationFailed("child had no pid".to_string()))?;

        // Parent keeps only the master; the child owns the slave now.
        let master = Arc::new(pty.master);
        drop(pty.slave);

        control.update(&info.id, |i| {
            i.status = SessionStatus::Running;
            i.pid = Some(pid);
        })?;

        let mut header = Header::new(u32::from(info.width), u32::from(info.height));
        header.command = Some(info.command.join(" "));
        header.title = info.name.clone();
        let mut header_env = HashMap::new();
        header_env.insert("TERM".to_string(), info.term.clone());
        header_env.insert("SHELL".to_string(), shell);
        header.env = Some(header_env);
        let writer = Arc::new(StreamWriter::create(&paths.stream_out, &header)?);

        // FIFOs are opened read+write so the readiness loop doesn't see a
        // permanent EOF while no external writer is connected.
        let stdin_fifo = File::options()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&paths.stdin)?;
        let control_fifo = File::options()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&paths.control)?;

        let bridge_master = dup_nonblocking(master.as_raw_fd())?;

        let mut event_loop = io_loop::new_event_loop()
            .map_err(|e| SessionError::PtyCreationFailed(format!("event loop: {e}")))?;
        event_loop.add(bridge_master.as_raw_fd(), READ | HUP, TOKEN_MASTER)?;
        event_loop.add(stdin_fifo.as_raw_fd(), READ, TOKEN_STDIN)?;
        event_loop.add(control_fifo.as_raw_fd(), READ, TOKEN_CONTROL)?;
        let stopper = event_loop.stopper();

        let status = Arc::new(SharedStatus::new());
        let exited_notify = Arc::new(Notify::new());
        let (done_tx, done_rx) = oneshot::channel();

        let ctx = BridgeCtx {
            id: info.id.clone(),
            master: bridge_master,
            resize_master: Arc::clone(&master),
            stdin_fifo,
            control_fifo,
            event_loop,
            writer: Arc::clone(&writer),
            term: Arc::clone(&term_engine),
            control: control.clone(),
            child_pid: pid,
            allow_column_resize,
            events: events.clone(),
            done_tx,
        };
        let thread_id = info.id.clone();
        std::thread::Builder::new()
            .name(format!("pty-{}", &info.id[..8.min(info.id.len())]))
            .spawn(move || bridge_loop(ctx))
            .map_err(|e| {
                SessionError::PtyCreationFailed(format!("bridge thread for {thread_id}: {e}"))
            })?;

        tokio::spawn(exit_watcher(
            child,
            info.id.clone(),
            Arc::clone(&writer),
            control.clone(),
            Arc::clone(&status),
            stopper.clone(),
            events,
            done_rx,
            Arc::clone(&exited_notify),
        ));

        Ok(Self {
            id: info.id.clone(),
            pid,
            master,
            writer,
            term: term_engine,
            control: control.clone(),
            status,
            stopper,
            exited_notify,
        })
    }

    pub fn is_exited(&self) -> bool {
        self.status.is_exited()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.exit_code()
    }

    /// Shared exit state, for waiting without holding the manager's locks.
    pub fn shared_status(&self) -> Arc<SharedStatus> {
        Arc::clone(&self.status)
    }

    /// Notifier fired once the exit watcher has recorded the exit.
    pub fn exited_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.exited_notify)
    }

    /// The session's terminal engine, shared with the buffer endpoints.
    pub fn term(&self) -> Arc<TerminalEngine> {
        Arc::clone(&self.term)
    }

    /// Apply a resize: winsize ioctl, metadata, recording record, engine.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        apply_resize(
            &self.master,
            &self.control,
            &self.id,
            &self.writer,
            &self.term,
            cols,
            rows,
        )
    }

    /// Signal the child's process group.
    pub fn signal(&self, signal: i32) {
        signal_group(self.pid, signal);
    }

    /// Wait until the exit watcher has recorded the exit, up to `timeout`.
    pub async fn wait_exited(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.status.is_exited() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, self.exited_notify.notified()).await;
        }
        true
    }

    /// Stop the bridging loop without signaling the child (shutdown path).
    pub fn stop_bridge(&self) {
        self.stopper.stop();
    }
}

struct BridgeCtx {
    id: String,
    /// Dup of the master, non-blocking, owned by the bridge thread.
    master: OwnedFd,
    /// Original master fd, used for resize ioctls.
    resize_master: Arc<OwnedFd>,
    stdin_fifo: File,
    control_fifo: File,
    event_loop: Box<dyn EventLoop>,
    writer: Arc<StreamWriter>,
    term: Arc<TerminalEngine>,
    control: ControlDir,
    child_pid: u32,
    allow_column_resize: bool,
    events: broadcast::Sender<serde_json::Value>,
    done_tx: oneshot::Sender<()>,
}

/// The bridging loop body. Runs on a dedicated thread until the PTY hangs
/// up or the loop is stopped.
fn bridge_loop(mut ctx: BridgeCtx) {
    let mut buf = [0u8; 4096];
    let mut control_pending: Vec<u8> = Vec::new();
    let mut hup = false;

    while !hup {
        let mut events: Vec<Event> = Vec::new();
        let running = match ctx
            .event_loop
            .run_once(Some(Duration::from_millis(100)), &mut |e| events.push(e))
        {
            Ok(running) => running,
            Err(e) => {
                warn!("session {}: event loop error: {e}", ctx.id);
                break;
            }
        };
        if !running {
            break;
        }

        for event in events {
            match event.user {
                TOKEN_MASTER => {
                    if drain_master(&ctx, &mut buf) || event.mask & HUP != 0 {
                        hup = true;
                    }
                }
                TOKEN_STDIN => drain_stdin(&ctx, &mut buf),
                TOKEN_CONTROL => drain_control(&ctx, &mut buf, &mut control_pending),
                other => debug!("session {}: event for unknown token {other}", ctx.id),
            }
        }
    }

    // Pick up anything the child wrote between the last drain and the hangup.
    drain_master(&ctx, &mut buf);

    let _ = ctx.event_loop.remove(ctx.master.as_raw_fd());
    let _ = ctx.event_loop.remove(ctx.stdin_fifo.as_raw_fd());
    let _ = ctx.event_loop.remove(ctx.control_fifo.as_raw_fd());

    debug!("session {}: bridge loop finished", ctx.id);
    let _ = ctx.done_tx.send(());
}

/// Drain the master until `EAGAIN`. Returns true on hangup.
fn drain_master(ctx: &BridgeCtx, buf: &mut [u8]) -> bool {
    let fd = ctx.master.as_raw_fd();
    loop {
        match read_fd(fd, buf) {
            // A closed tty raises EIO on Linux; either way the child side is gone.
            Ok(0) => return true,
            Ok(n) => {
                if let Err(e) = ctx.writer.write_output(&buf[..n]) {
                    warn!("session {}: recording write failed: {e}", ctx.id);
                }
                ctx.term.feed(&buf[..n]);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return true,
        }
    }
}

/// Forward stdin-FIFO bytes to the PTY, recording them as input.
fn drain_stdin(ctx: &BridgeCtx, buf: &mut [u8]) {
    let fd = ctx.stdin_fifo.as_raw_fd();
    loop {
        match read_fd(fd, buf) {
            Ok(0) => return,
            Ok(n) => {
                if let Err(e) = write_all_fd(ctx.master.as_raw_fd(), &buf[..n]) {
                    warn!("session {}: pty write failed: {e}", ctx.id);
                    return;
                }
                if let Err(e) = ctx.writer.write_input(&buf[..n]) {
                    warn!("session {}: recording input failed: {e}", ctx.id);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("session {}: stdin fifo read failed: {e}", ctx.id);
                return;
            }
        }
    }
}

/// Read control-FIFO bytes and dispatch complete newline-delimited commands.
fn drain_control(ctx: &BridgeCtx, buf: &mut [u8], pending: &mut Vec<u8>) {
    let fd = ctx.control_fifo.as_raw_fd();
    loop {
        match read_fd(fd, buf) {
            Ok(0) => break,
            Ok(n) => pending.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("session {}: control fifo read failed: {e}", ctx.id);
                break;
            }
        }
    }

    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = pending.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
        if line.trim().is_empty() {
            continue;
        }
        dispatch_control(ctx, &line);
    }
}

fn dispatch_control(ctx: &BridgeCtx, line: &str) {
    match serde_json::from_str::<ControlCommand>(line) {
        Ok(ControlCommand::Resize { cols, rows }) => {
            if cols == 0 || rows == 0 {
                warn!("session {}: ignoring resize to {cols}x{rows}", ctx.id);
                return;
            }
            if !ctx.allow_column_resize {
                let current_cols = ctx.control.load(&ctx.id).map(|i| i.width).unwrap_or(cols);
                if cols != current_cols {
                    debug!(
                        "session {}: column resize disabled, ignoring {cols}x{rows}",
                        ctx.id
                    );
                    return;
                }
            }
            if let Err(e) = apply_resize(
                &ctx.resize_master,
                &ctx.control,
                &ctx.id,
                &ctx.writer,
                &ctx.term,
                cols,
                rows,
            ) {
                warn!("session {}: control resize failed: {e}", ctx.id);
            }
        }
        Ok(ControlCommand::Kill { signal }) => {
            let signal = signal.unwrap_or(libc::SIGTERM);
            info!("session {}: control kill with signal {signal}", ctx.id);
            signal_group(ctx.child_pid, signal);
        }
        Ok(ControlCommand::Rename { name }) => {
            match ctx.control.update(&ctx.id, |i| i.name = Some(name.clone())) {
                Ok(_) => {
                    let _ = ctx.events.send(json!({
                        "type": "session.renamed",
                        "sessionId": ctx.id,
                        "name": name,
                    }));
                }
                Err(e) => warn!("session {}: rename failed: {e}", ctx.id),
            }
        }
        Err(_) => {
            debug!("session {}: ignoring unknown control command", ctx.id);
        }
    }
}

/// Resize applied atomically with respect to this session: winsize ioctl,
/// metadata update, resize record, engine notification. Resize records
/// precede any output the new size produces because the child reacts to
/// SIGWINCH only after the ioctl returns.
pub(crate) fn apply_resize(
    master: &OwnedFd,
    control: &ControlDir,
    id: &str,
    writer: &StreamWriter,
    term: &TerminalEngine,
    cols: u16,
    rows: u16,
) -> Result<(), SessionError> {
    resize_pty(master, cols, rows)
        .map_err(|e| SessionError::Io(io::Error::other(format!("winsize ioctl: {e}"))))?;
    control.update(id, |i| {
        i.width = cols;
        i.height = rows;
    })?;
    writer.write_resize(cols, rows)?;
    term.resize(cols, rows);
    Ok(())
}

/// Send a signal to the child's process group. The child is a session leader
/// via `setsid`, so its pgid equals its pid.
pub(crate) fn signal_group(pid: u32, signal: i32) {
    #[allow(clippy::cast_possible_wrap)]
    let pgid = pid as i32;
    if pgid <= 0 {
        return;
    }
    // SAFETY: kill(-pgid) delivers to every process in the group.
    unsafe {
        libc::kill(-pgid, signal);
    }
}

/// Wait on the child, then finalize the recording and metadata.
#[allow(clippy::too_many_arguments)]
async fn exit_watcher(
    mut child: Child,
    id: String,
    writer: Arc<StreamWriter>,
    control: ControlDir,
    status: Arc<SharedStatus>,
    stopper: Stopper,
    events: broadcast::Sender<serde_json::Value>,
    done_rx: oneshot::Receiver<()>,
    exited_notify: Arc<Notify>,
) {
    let code = match child.wait().await {
        Ok(exit) => exit
            .code()
            .unwrap_or_else(|| 128 + exit.signal().unwrap_or(1)),
        Err(e) => {
            error!("session {id}: wait failed: {e}");
            -1
        }
    };

    // Give the bridge a moment to observe the hangup and drain final output,
    // then stop it regardless (a grandchild may be keeping the PTY open).
    let _ = tokio::time::timeout(Duration::from_secs(2), done_rx).await;
    stopper.stop();

    if let Err(e) = writer.write_exit(code, &id) {
        warn!("session {id}: exit record failed: {e}");
    }
    writer.close();

    if let Err(e) = control.update(&id, |i| {
        i.status = SessionStatus::Exited;
        i.exit_code = Some(code);
    }) {
        warn!("session {id}: exited metadata update failed: {e}");
    }

    *status.exit_code.lock().expect("status poisoned") = Some(code);
    status.exited.store(true, Ordering::Release);
    exited_notify.notify_waiters();

    reap_orphans();

    let _ = events.send(json!({
        "type": "session.exited",
        "sessionId": id,
        "exitCode": code,
    }));
    info!("Session {id} exited with code {code}");
}

/// Dup an fd and set the copy non-blocking.
fn dup_nonblocking(fd: RawFd) -> Result<OwnedFd, SessionError> {
    // SAFETY: dup of a valid fd; ownership of the new fd is taken immediately.
    let new_fd = unsafe { libc::dup(fd) };
    if new_fd < 0 {
        return Err(SessionError::Io(io::Error::last_os_error()));
    }
    let owned = unsafe { OwnedFd::from_raw_fd(new_fd) };
    let res = unsafe { libc::fcntl(new_fd, libc::F_SETFL, libc::O_NONBLOCK) };
    if res < 0 {
        return Err(SessionError::Io(io::Error::last_os_error()));
    }
    Ok(owned)
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: reads into a caller-provided buffer, bounded by its length.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        #[allow(clippy::cast_sign_loss)]
        Ok(n as usize)
    }
}

fn write_all_fd(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        // SAFETY: writes from a caller-provided buffer, bounded by its length.
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        #[allow(clippy::cast_sign_loss)]
        let n = n as usize;
        buf = &buf[n..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_command_parsing() {
        let cmd: ControlCommand =
            serde_json::from_str(r#"{"cmd":"resize","cols":120,"rows":40}"#).unwrap();
        assert!(matches!(cmd, ControlCommand::Resize { cols: 120, rows: 40 }));

        let cmd: ControlCommand = serde_json::from_str(r#"{"cmd":"kill"}"#).unwrap();
        assert!(matches!(cmd, ControlCommand::Kill { signal: None }));

        let cmd: ControlCommand = serde_json::from_str(r#"{"cmd":"kill","signal":9}"#).unwrap();
        assert!(matches!(cmd, ControlCommand::Kill { signal: Some(9) }));

        let cmd: ControlCommand =
            serde_json::from_str(r#"{"cmd":"rename","name":"build"}"#).unwrap();
        assert!(matches!(cmd, ControlCommand::Rename { name } if name == "build"));

        // Unknown commands fail to parse and are ignored by the dispatcher.
        assert!(serde_json::from_str::<ControlCommand>(r#"{"cmd":"warp"}"#).is_err());
    }

    #[test]
    fn test_write_all_fd_round_trip() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        write_all_fd(write_end.as_raw_fd(), b"hello world").unwrap();
        let mut buf = [0u8; 32];
        let n = read_fd(read_end.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
    }
}
