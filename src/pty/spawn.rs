//! PTY allocation and child spawning.
//!
//! The spawn rules decide how a requested argv actually runs:
//!
//! 1. A single argv that *is* a shell (by file name or shebang) execs
//!    directly.
//! 2. A leading shell builtin (`cd`, `export`, …) runs as `shell -c "…"`.
//! 3. Everything else runs as `shell -i -l -c "…"` (zsh: `shell -l -c`) so
//!    rc files and aliases load.
//!
//! The child becomes a session leader with the PTY slave as its controlling
//! terminal. Local echo is disabled on the master for spawned sessions so
//! recorded input is not doubled into the output stream.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::debug;

pub const DEFAULT_TERM: &str = "xterm-256color";

const KNOWN_SHELLS: &[&str] = &["bash", "sh", "zsh", "dash", "ksh", "fish", "tcsh", "csh"];

const SHELL_BUILTINS: &[&str] = &[
    "cd", "echo", "export", "alias", "source", ".", "exit", "[", "[[", "test", "type", "jobs",
    "kill", "set", "unset", "read", "wait", "umask", "ulimit", "fg", "bg", "pushd", "popd",
    "dirs", "history",
];

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Allocate a PTY pair sized to the given terminal dimensions.
pub fn allocate_pty(cols: u16, rows: u16) -> Result<PtyPair, nix::Error> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let OpenptyResult { master, slave } = openpty(&winsize, None)?;
    Ok(PtyPair { master, slave })
}

/// Remove local echo on the master side of the pair. Spawned sessions record
/// input separately, so the line discipline echoing it back would double it.
pub fn disable_echo(master: &OwnedFd) -> Result<(), nix::Error> {
    let mut attrs = tcgetattr(master)?;
    attrs.local_flags.remove(LocalFlags::ECHO);
    tcsetattr(master, SetArg::TCSANOW, &attrs)
}

/// The user's shell: `$SHELL`, falling back to `/bin/bash`.
pub fn resolve_user_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_known_shell(arg: &str) -> bool {
    KNOWN_SHELLS.contains(&file_name(arg))
}

/// Whether the file's shebang names a known shell.
fn shebang_names_shell(path: &Path) -> bool {
    let Ok(contents) = std::fs::read(path) else {
        return false;
    };
    if !contents.starts_with(b"#!") {
        return false;
    }
    let first_line = contents
        .split(|&b| b == b'\n')
        .next()
        .unwrap_or(&[]);
    let Ok(line) = std::str::from_utf8(&first_line[2..]) else {
        return false;
    };
    // "#!/usr/bin/env bash" names the shell in the second word.
    let mut words = line.split_whitespace();
    let Some(interpreter) = words.next() else {
        return false;
    };
    if file_name(interpreter) == "env" {
        return words.next().is_some_and(is_known_shell);
    }
    is_known_shell(interpreter)
}

/// Apply the spawn rules, producing the argv to exec.
pub fn resolve_command(command: &[String], shell: &str, working_dir: &str) -> Vec<String> {
    if command.len() == 1 {
        let arg = &command[0];
        let path = if arg.starts_with('/') {
            PathBuf::from(arg)
        } else {
            Path::new(working_dir).join(arg)
        };
        if is_known_shell(arg) || shebang_names_shell(&path) {
            return command.to_vec();
        }
    }

    let joined = command.join(" ");
    if command
        .first()
        .is_some_and(|c| SHELL_BUILTINS.contains(&c.as_str()))
    {
        return vec![shell.to_string(), "-c".to_string(), joined];
    }

    // Interactive + login so rc files and aliases load; zsh warns on -i with
    // a command, so it gets -l only.
    if file_name(shell) == "zsh" {
        vec![shell.to_string(), "-l".to_string(), "-c".to_string(), joined]
    } else {
        vec![
            shell.to_string(),
            "-i".to_string(),
            "-l".to_string(),
            "-c".to_string(),
            joined,
        ]
    }
}

/// Spawn `argv` on the slave side of the PTY.
///
/// The child calls `setsid`, takes the slave as its controlling terminal, and
/// has all three stdio streams bound to it. The full parent environment is
/// inherited; `env` is merged on top and `TERM` is overridden last.
pub fn spawn_child(
    pty: &PtyPair,
    argv: &[String],
    working_dir: &str,
    env: &HashMap<String, String>,
    term: &str,
) -> std::io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(working_dir)
        .envs(env)
        .env("TERM", term)
        .kill_on_drop(true);

    // The child's stdio is handled by pre_exec (dup2 to PTY slave), so tell
    // tokio not to set up pipes.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: All syscalls used here are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Resize a PTY's terminal window.
pub fn resize_pty(master: &OwnedFd, cols: u16, rows: u16) -> Result<(), nix::Error> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCSWINSZ is a well-defined ioctl that reads a Winsize struct.
    let ret = unsafe {
        libc::ioctl(
            master.as_raw_fd(),
            libc::TIOCSWINSZ,
            std::ptr::addr_of!(winsize),
        )
    };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

/// Reap any zombie children with non-blocking waits until none remain.
pub fn reap_orphans() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(status) => debug!("reaped orphan: {status:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_single_shell_execs_directly() {
        let argv = resolve_command(&cmd(&["/bin/bash"]), "/bin/bash", "/tmp");
        assert_eq!(argv, cmd(&["/bin/bash"]));
        let argv = resolve_command(&cmd(&["zsh"]), "/bin/bash", "/tmp");
        assert_eq!(argv, cmd(&["zsh"]));
    }

    #[test]
    fn test_builtin_wraps_with_dash_c() {
        let argv = resolve_command(&cmd(&["cd", "/tmp"]), "/bin/bash", "/tmp");
        assert_eq!(argv, cmd(&["/bin/bash", "-c", "cd /tmp"]));
        let argv = resolve_command(&cmd(&["export", "A=1"]), "/bin/sh", "/tmp");
        assert_eq!(argv, cmd(&["/bin/sh", "-c", "export A=1"]));
    }

    #[test]
    fn test_command_wraps_interactive_login() {
        let argv = resolve_command(&cmd(&["ls", "-la"]), "/bin/bash", "/tmp");
        assert_eq!(argv, cmd(&["/bin/bash", "-i", "-l", "-c", "ls -la"]));
    }

    #[test]
    fn test_zsh_skips_interactive_flag() {
        let argv = resolve_command(&cmd(&["ls"]), "/usr/bin/zsh", "/tmp");
        assert_eq!(argv, cmd(&["/usr/bin/zsh", "-l", "-c", "ls"]));
    }

    #[test]
    fn test_shebang_script_execs_directly() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("run.sh");
        std::fs::write(&script, "#!/usr/bin/env bash\necho hi\n").unwrap();
        let argv = resolve_command(
            &cmd(&[script.to_str().unwrap()]),
            "/bin/bash",
            dir.path().to_str().unwrap(),
        );
        assert_eq!(argv.len(), 1);
        assert_eq!(argv[0], script.to_str().unwrap());
    }

    #[test]
    fn test_non_shell_shebang_wraps() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("run.py");
        std::fs::write(&script, "#!/usr/bin/env python3\nprint('hi')\n").unwrap();
        let argv = resolve_command(
            &cmd(&[script.to_str().unwrap()]),
            "/bin/bash",
            dir.path().to_str().unwrap(),
        );
        assert_eq!(argv[0], "/bin/bash");
        assert_eq!(argv[1], "-i");
    }

    #[test]
    fn test_resolve_user_shell_fallback() {
        // With SHELL unset the fallback applies.
        let prev = std::env::var("SHELL").ok();
        std::env::remove_var("SHELL");
        assert_eq!(resolve_user_shell(), "/bin/bash");
        if let Some(v) = prev {
            std::env::set_var("SHELL", v);
        }
    }

    #[test]
    fn test_allocate_and_resize_pty() {
        let pty = allocate_pty(80, 24).unwrap();
        resize_pty(&pty.master, 120, 40).unwrap();
        disable_echo(&pty.master).unwrap();
    }
}
