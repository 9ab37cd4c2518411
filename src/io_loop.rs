//! Readiness event loop for PTY bridging.
//!
//! A uniform `add`/`remove`/`run` interface over the platform readiness
//! primitive: epoll on Linux and kqueue on the BSDs (both via `mio`), with a
//! `select(2)`-based fallback for everything else. The event-driven path is
//! primary; [`SelectLoop`] exists for platforms without `mio` support and for
//! builds with the `polling-io` feature, which forces it.
//!
//! Each loop instance is single-threaded: callbacks are invoked one at a
//! time from whichever thread calls [`EventLoop::run`]. The only cross-thread
//! surface is [`Stopper`], which wakes a blocked loop and makes `run` return.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::Token;
use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::time::TimeVal;
use tracing::{debug, warn};

/// Readiness: data available to read.
pub const READ: u8 = 0b001;
/// Readiness: writable without blocking.
pub const WRITE: u8 = 0b010;
/// Readiness: peer hung up (always delivered when detected, even if not
/// requested in the registration mask).
pub const HUP: u8 = 0b100;

/// A single readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: RawFd,
    /// Triggered subset of `READ | WRITE | HUP`.
    pub mask: u8,
    /// Opaque user data supplied at registration.
    pub user: u64,
}

/// Uniform readiness-loop contract implemented by both backends.
pub trait EventLoop: Send {
    /// Register `fd` for the interests in `mask`. Re-registering an fd
    /// replaces its mask and user data.
    fn add(&mut self, fd: RawFd, mask: u8, user: u64) -> io::Result<()>;

    /// Deregister `fd`. Removing an fd that was never registered succeeds
    /// (logged at debug level).
    fn remove(&mut self, fd: RawFd) -> io::Result<()>;

    /// Wait for readiness once and invoke `callback` at most once per ready
    /// fd (multiple notifications for one fd are coalesced into a single
    /// event). Returns `Ok(false)` once the loop has been stopped.
    ///
    /// `EINTR`/`EAGAIN` are treated as spurious wakeups: the call returns
    /// `Ok(true)` without invoking the callback.
    fn run_once(
        &mut self,
        timeout: Option<Duration>,
        callback: &mut dyn FnMut(Event),
    ) -> io::Result<bool>;

    /// Block dispatching events until stopped.
    fn run(&mut self, callback: &mut dyn FnMut(Event)) -> io::Result<()> {
        while self.run_once(None, callback)? {}
        Ok(())
    }

    /// A handle that stops the loop from any thread.
    fn stopper(&self) -> Stopper;
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    mask: u8,
    user: u64,
}

/// Cross-thread stop handle. Setting the flag alone is not enough to unblock
/// a waiting loop, so each backend pairs it with a wakeup mechanism: a
/// `mio::Waker` or the write end of a self-pipe.
#[derive(Clone)]
pub struct Stopper {
    flag: Arc<AtomicBool>,
    wake: WakeHandle,
}

#[derive(Clone)]
enum WakeHandle {
    Mio(Arc<mio::Waker>),
    Pipe(Arc<OwnedFd>),
}

impl Stopper {
    /// Stop the loop. Idempotent; a blocked `run` returns promptly.
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        match &self.wake {
            WakeHandle::Mio(waker) => {
                if let Err(e) = waker.wake() {
                    warn!("event loop waker failed: {e}");
                }
            }
            WakeHandle::Pipe(fd) => {
                // A single byte is enough; the loop drains the pipe.
                let res = unsafe { libc::write(fd.as_raw_fd(), [1u8].as_ptr().cast(), 1) };
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::WouldBlock {
                        warn!("event loop wake pipe write failed: {err}");
                    }
                }
            }
        }
    }
}

// ─── mio backend (epoll / kqueue) ────────────────────────────────────────────

/// Token reserved for the internal waker; never collides with an fd token.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Event loop backed by `mio::Poll` — epoll on Linux, kqueue on BSD/macOS.
pub struct MioLoop {
    poll: mio::Poll,
    events: mio::Events,
    registrations: HashMap<RawFd, Registration>,
    stop_flag: Arc<AtomicBool>,
    waker: Arc<mio::Waker>,
}

impl MioLoop {
    pub fn new() -> io::Result<Self> {
        let poll = mio::Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            events: mio::Events::with_capacity(64),
            registrations: HashMap::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    fn interest(mask: u8) -> mio::Interest {
        // mio requires a non-empty interest; a HUP-only registration is
        // expressed as READABLE since hangup arrives as read-closed.
        let mut interest = None;
        if mask & READ != 0 || mask & HUP != 0 {
            interest = Some(mio::Interest::READABLE);
        }
        if mask & WRITE != 0 {
            interest = Some(match interest {
                Some(i) => i | mio::Interest::WRITABLE,
                None => mio::Interest::WRITABLE,
            });
        }
        interest.unwrap_or(mio::Interest::READABLE)
    }
}

impl EventLoop for MioLoop {
    fn add(&mut self, fd: RawFd, mask: u8, user: u64) -> io::Result<()> {
        #[allow(clippy::cast_sign_loss)]
        let token = Token(fd as usize);
        let interest = Self::interest(mask);
        if self.registrations.contains_key(&fd) {
            self.poll
                .registry()
                .reregister(&mut SourceFd(&fd), token, interest)?;
        } else {
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), token, interest)?;
        }
        self.registrations.insert(fd, Registration { mask, user });
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        if self.registrations.remove(&fd).is_none() {
            debug!("event loop: remove of unregistered fd {fd}");
            return Ok(());
        }
        self.poll.registry().deregister(&mut SourceFd(&fd))?;
        Ok(())
    }

    fn run_once(
        &mut self,
        timeout: Option<Duration>,
        callback: &mut dyn FnMut(Event),
    ) -> io::Result<bool> {
        if self.stop_flag.load(Ordering::SeqCst) {
            return Ok(false);
        }

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(true),
            Err(e) => return Err(e),
        }

        // Coalesce: one callback per fd per turn, even if the OS reported it
        // more than once.
        let mut ready: Vec<(RawFd, u8)> = Vec::with_capacity(self.events.iter().count());
        for event in &self.events {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let fd = event.token().0 as RawFd;
            let mut mask = 0u8;
            if event.is_readable() {
                mask |= READ;
            }
            if event.is_writable() {
                mask |= WRITE;
            }
            if event.is_read_closed() || event.is_error() {
                mask |= HUP;
            }
            match ready.iter_mut().find(|(f, _)| *f == fd) {
                Some((_, m)) => *m |= mask,
                None => ready.push((fd, mask)),
            }
        }

        if self.stop_flag.load(Ordering::SeqCst) {
            return Ok(false);
        }

        for (fd, mask) in ready {
            if let Some(reg) = self.registrations.get(&fd) {
                let triggered = mask & (reg.mask | HUP);
                if triggered != 0 {
                    callback(Event {
                        fd,
                        mask: triggered,
                        user: reg.user,
                    });
                }
            }
        }
        Ok(true)
    }

    fn stopper(&self) -> Stopper {
        Stopper {
            flag: Arc::clone(&self.stop_flag),
            wake: WakeHandle::Mio(Arc::clone(&self.waker)),
        }
    }
}

// ─── select(2) fallback ──────────────────────────────────────────────────────

/// Polling fallback over `select(2)` with a self-pipe for wakeup. Functionally
/// identical to [`MioLoop`]; only latency and throughput differ. `select`
/// cannot report hangup directly — callers observe it as a zero-length read.
pub struct SelectLoop {
    registrations: HashMap<RawFd, Registration>,
    stop_flag: Arc<AtomicBool>,
    wake_read: OwnedFd,
    wake_write: Arc<OwnedFd>,
}

impl SelectLoop {
    pub fn new() -> io::Result<Self> {
        let (read_end, write_end) = nix::unistd::pipe().map_err(io::Error::from)?;
        for fd in [read_end.as_raw_fd(), write_end.as_raw_fd()] {
            // SAFETY: plain fcntl on fds we just created.
            let res = unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };
            if res < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(Self {
            registrations: HashMap::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            wake_read: read_end,
            wake_write: Arc::new(write_end),
        })
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 16];
        loop {
            // SAFETY: read into a stack buffer from our own nonblocking pipe.
            let n = unsafe {
                libc::read(
                    self.wake_read.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl EventLoop for SelectLoop {
    fn add(&mut self, fd: RawFd, mask: u8, user: u64) -> io::Result<()> {
        self.registrations.insert(fd, Registration { mask, user });
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        if self.registrations.remove(&fd).is_none() {
            debug!("event loop: remove of unregistered fd {fd}");
        }
        Ok(())
    }

    fn run_once(
        &mut self,
        timeout: Option<Duration>,
        callback: &mut dyn FnMut(Event),
    ) -> io::Result<bool> {
        if self.stop_flag.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let mut read_fds = FdSet::new();
        let mut write_fds = FdSet::new();
        read_fds.insert(self.wake_read.as_fd());
        for (fd, reg) in &self.registrations {
            // SAFETY: registered fds are owned by the session that drives
            // this loop and outlive their registration.
            let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
            if reg.mask & (READ | HUP) != 0 {
                read_fds.insert(borrowed);
            }
            if reg.mask & WRITE != 0 {
                write_fds.insert(borrowed);
            }
        }

        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        let mut tv = timeout.map(|t| {
            TimeVal::new(
                t.as_secs() as libc::time_t,
                t.subsec_micros() as libc::suseconds_t,
            )
        });

        match select(None, Some(&mut read_fds), Some(&mut write_fds), None, tv.as_mut()) {
            Ok(0) => return Ok(true),
            Ok(_) => {}
            Err(Errno::EINTR | Errno::EAGAIN) => return Ok(true),
            Err(err) => return Err(err.into()),
        }

        // SAFETY: same borrow as above, scoped to this check.
        let woke = read_fds.contains(unsafe { BorrowedFd::borrow_raw(self.wake_read.as_raw_fd()) });
        if woke {
            self.drain_wake_pipe();
        }
        if self.stop_flag.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let ready: Vec<(RawFd, u8, u64)> = self
            .registrations
            .iter()
            .filter_map(|(fd, reg)| {
                // SAFETY: as above.
                let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
                let mut mask = 0u8;
                if reg.mask & (READ | HUP) != 0 && read_fds.contains(borrowed) {
                    // select cannot distinguish hangup from data; a HUP-only
                    // registration sees readability, and the caller's
                    // zero-length read confirms the hangup.
                    mask |= if reg.mask & READ != 0 { READ } else { HUP };
                }
                if reg.mask & WRITE != 0 && write_fds.contains(borrowed) {
                    mask |= WRITE;
                }
                (mask != 0).then_some((*fd, mask, reg.user))
            })
            .collect();

        for (fd, mask, user) in ready {
            callback(Event { fd, mask, user });
        }
        Ok(true)
    }

    fn stopper(&self) -> Stopper {
        Stopper {
            flag: Arc::clone(&self.stop_flag),
            wake: WakeHandle::Pipe(Arc::clone(&self.wake_write)),
        }
    }
}

/// Construct the preferred event loop for this build.
///
/// The `polling-io` feature forces the select fallback; otherwise the
/// epoll/kqueue backend is used, falling back to select if creation fails.
pub fn new_event_loop() -> io::Result<Box<dyn EventLoop>> {
    #[cfg(feature = "polling-io")]
    {
        return Ok(Box::new(SelectLoop::new()?));
    }

    #[cfg(not(feature = "polling-io"))]
    {
        match MioLoop::new() {
            Ok(l) => Ok(Box::new(l)),
            Err(e) => {
                warn!("event-driven loop unavailable ({e}), falling back to select");
                Ok(Box::new(SelectLoop::new()?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        nix::unistd::pipe().unwrap()
    }

    fn collect_events(
        event_loop: &mut dyn EventLoop,
        timeout: Duration,
    ) -> Vec<Event> {
        let mut events = Vec::new();
        event_loop
            .run_once(Some(timeout), &mut |e| events.push(e))
            .unwrap();
        events
    }

    #[test]
    fn test_mio_read_event() {
        let (read_end, write_end) = pipe_pair();
        let mut el = MioLoop::new().unwrap();
        el.add(read_end.as_raw_fd(), READ, 7).unwrap();

        let mut f = std::fs::File::from(write_end);
        f.write_all(b"x").unwrap();

        let events = collect_events(&mut el, Duration::from_secs(1));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, read_end.as_raw_fd());
        assert_eq!(events[0].user, 7);
        assert!(events[0].mask & READ != 0);
    }

    #[test]
    fn test_mio_hup_on_writer_close() {
        let (read_end, write_end) = pipe_pair();
        let mut el = MioLoop::new().unwrap();
        el.add(read_end.as_raw_fd(), READ | HUP, 1).unwrap();

        drop(write_end);

        let events = collect_events(&mut el, Duration::from_secs(1));
        assert_eq!(events.len(), 1);
        assert!(events[0].mask & HUP != 0);
    }

    #[test]
    fn test_remove_unregistered_is_ok() {
        let mut el = MioLoop::new().unwrap();
        assert!(el.remove(9999).is_ok());
        let mut el = SelectLoop::new().unwrap();
        assert!(el.remove(9999).is_ok());
    }

    #[test]
    fn test_stop_wakes_blocked_run() {
        let mut el = MioLoop::new().unwrap();
        let stopper = el.stopper();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            stopper.stop();
        });
        // Blocks until the stopper fires, then returns cleanly.
        el.run(&mut |_| {}).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_select_read_event() {
        let (read_end, write_end) = pipe_pair();
        let mut el = SelectLoop::new().unwrap();
        el.add(read_end.as_raw_fd(), READ, 42).unwrap();

        let mut f = std::fs::File::from(write_end);
        f.write_all(b"y").unwrap();

        let events = collect_events(&mut el, Duration::from_millis(200));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user, 42);
        assert!(events[0].mask & READ != 0);
    }

    #[test]
    fn test_select_timeout_no_events() {
        let (read_end, _write_end) = pipe_pair();
        let mut el = SelectLoop::new().unwrap();
        el.add(read_end.as_raw_fd(), READ, 0).unwrap();
        let events = collect_events(&mut el, Duration::from_millis(50));
        assert!(events.is_empty());
    }

    #[test]
    fn test_select_stop_wakes_blocked_run() {
        let mut el = SelectLoop::new().unwrap();
        let stopper = el.stopper();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            stopper.stop();
        });
        el.run(&mut |_| {}).unwrap();
        handle.join().unwrap();
    }
}
