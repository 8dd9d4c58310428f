//! The container `process` object: validation, tty handoff, exec.
//!
//! A [`Process`] is built from the `process` fragment of config.json (or
//! an exec `process.json`) plus the command line options that travel with
//! it. `validate` runs inside the jail after attach, so the executable
//! lookup sees the container's own filesystem view; `exec` is the point of
//! no return.

use std::ffi::CString;
use std::fs;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::unistd::AccessFlags;
use tracing::debug;

use jailbox_sys::{last_errno, pty, scm_rights};

use crate::error::{nix_errno, Error, Result};
use crate::oci::ProcessSpec;

/// Mark every descriptor at or above `min` close-on-exec.
pub(crate) fn set_cloexec_from(min: RawFd) {
    if let Ok(entries) = fs::read_dir("/dev/fd") {
        for entry in entries.flatten() {
            if let Ok(fd) = entry.file_name().to_string_lossy().parse::<RawFd>() {
                if fd >= min {
                    // SAFETY: fcntl on a descriptor we may not own only
                    // flips its close-on-exec flag.
                    unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
                }
            }
        }
    }
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::malformed(format!("NUL byte in {s:?}")))
}

fn is_executable_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
        && nix::unistd::access(path, AccessFlags::X_OK).is_ok()
}

/// A validated container process, ready to launch.
#[derive(Debug)]
pub struct Process {
    cwd: String,
    args: Vec<String>,
    env: Vec<String>,
    uid: u32,
    gid: u32,
    gids: Vec<u32>,
    umask: u32,
    terminal: bool,
    console_socket: Option<PathBuf>,
    preserve_fds: i32,
    resolved: Option<PathBuf>,
}

impl Process {
    /// Build from a parsed `process` fragment and the accompanying
    /// options. Checks everything that can be checked outside the jail.
    pub fn new(
        spec: ProcessSpec,
        console_socket: Option<PathBuf>,
        preserve_fds: i32,
    ) -> Result<Self> {
        let (uid, gid, umask, mut gids) = match &spec.user {
            Some(user) => (
                user.uid,
                user.gid,
                user.umask.unwrap_or(0o077),
                vec![user.gid],
            ),
            None => (0, 0, 0o077, vec![0]),
        };
        if let Some(user) = &spec.user {
            if let Some(additional) = &user.additional_gids {
                gids.extend(additional.iter().copied());
            }
        }

        let terminal = spec.terminal.unwrap_or(false);
        if terminal {
            match &console_socket {
                None => {
                    return Err(Error::malformed(
                        "--console-socket is required when process.terminal is true",
                    ))
                }
                Some(path) => {
                    use std::os::unix::fs::FileTypeExt;
                    let is_socket = fs::metadata(path)
                        .map(|m| m.file_type().is_socket())
                        .unwrap_or(false);
                    if !is_socket {
                        return Err(Error::malformed(
                            "--console-socket must be a path to a local domain socket",
                        ));
                    }
                }
            }
        } else if console_socket.is_some() {
            return Err(Error::malformed(
                "--console-socket provided but process.terminal is false",
            ));
        }

        Ok(Self {
            cwd: spec.cwd,
            args: spec.args,
            env: spec.env.unwrap_or_default(),
            uid,
            gid,
            gids,
            umask,
            terminal,
            console_socket,
            preserve_fds,
            resolved: None,
        })
    }

    /// Look up `key` in this process's environment list.
    pub fn getenv(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
            (k == key).then_some(v)
        })
    }

    /// Resolve `args[0]` on the filesystem view of the calling process.
    ///
    /// Runs inside the jail: absolute commands must name an executable
    /// regular file, anything else is searched on the process's own PATH.
    pub fn validate(&mut self) -> Result<()> {
        let arg0 = self.args[0].clone();
        if arg0.starts_with('/') {
            let path = Path::new(&arg0);
            if !is_executable_file(path) {
                return Err(Error::ExecutableNotFound(arg0));
            }
            self.resolved = Some(path.to_path_buf());
            return Ok(());
        }

        if let Some(path_var) = self.getenv("PATH") {
            for dir in path_var.split(':') {
                if dir.is_empty() {
                    continue;
                }
                let candidate = Path::new(dir).join(&arg0);
                if is_executable_file(&candidate) {
                    debug!(command = %arg0, resolved = %candidate.display(), "resolved container command");
                    self.resolved = Some(candidate);
                    return Ok(());
                }
            }
        }
        Err(Error::ExecutableNotFound(arg0))
    }

    /// Prepare the stdio triple for `exec`.
    ///
    /// Without a terminal that is the descriptors this process already
    /// has. With one, a fresh pty becomes the controlling terminal, its
    /// control end is handed to the console socket, and the subordinate
    /// end serves all three streams.
    pub fn pre_start(&self) -> Result<(RawFd, RawFd, RawFd)> {
        if !self.terminal {
            return Ok((0, 1, 2));
        }
        let Some(socket_path) = &self.console_socket else {
            return Err(Error::malformed(
                "--console-socket is required when process.terminal is true",
            ));
        };

        let (control, tty) =
            pty::open_pty().map_err(|errno| Error::syscall("opening pty", errno))?;
        pty::set_controlling_tty(tty.as_raw_fd())
            .map_err(|errno| Error::syscall("setting controlling tty", errno))?;

        let sock = scm_rights::connect_unix(socket_path).map_err(|errno| {
            Error::syscall(
                format!("connecting to console socket {}", socket_path.display()),
                errno,
            )
        })?;
        scm_rights::send_fd(sock.as_raw_fd(), control.as_raw_fd())
            .map_err(|errno| Error::syscall("sending pty descriptor", errno))?;

        let fd = tty.into_raw_fd();
        Ok((fd, fd, fd))
    }

    /// Install the environment and credentials, wire up stdio, and exec
    /// the command resolved by [`validate`](Self::validate).
    ///
    /// Only returns on failure.
    pub fn exec(&self, stdin: RawFd, stdout: RawFd, stderr: RawFd) -> Result<()> {
        let resolved = self
            .resolved
            .as_ref()
            .ok_or_else(|| Error::ExecutableNotFound(self.args[0].clone()))?;
        let path = cstring(&resolved.to_string_lossy())?;
        let argv: Vec<CString> = self
            .args
            .iter()
            .map(|a| cstring(a))
            .collect::<Result<_>>()?;
        // The environment is an owned vector handed straight to execve;
        // the process-wide environment is never touched.
        let envp: Vec<CString> = self
            .env
            .iter()
            .map(|e| cstring(e))
            .collect::<Result<_>>()?;

        nix::unistd::chdir(Path::new(&self.cwd)).map_err(|errno| {
            Error::syscall(
                format!("changing directory to {}", self.cwd),
                nix_errno(errno),
            )
        })?;

        self.reset_signals()?;
        self.set_ids()?;

        // SAFETY: dup2 duplicates onto the standard descriptors.
        unsafe {
            if stdin != 0 {
                libc::dup2(stdin, 0);
            }
            if stdout != 1 {
                libc::dup2(stdout, 1);
            }
            if stderr != 2 {
                libc::dup2(stderr, 2);
            }
        }
        set_cloexec_from(3 + self.preserve_fds);

        let argv_ptrs: Vec<*const libc::c_char> = argv
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let envp_ptrs: Vec<*const libc::c_char> = envp
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        // SAFETY: argv/envp are NUL-terminated arrays of valid pointers.
        unsafe { libc::execve(path.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr()) };

        Err(Error::syscall(
            format!("executing container command {}", self.args[0]),
            last_errno(),
        ))
    }

    /// Unblock every signal and restore default dispositions.
    fn reset_signals(&self) -> Result<()> {
        // SAFETY: sigset/sigaction structures are initialized before use;
        // invalid signal numbers only produce EINVAL, which is fine.
        unsafe {
            let mut mask: libc::sigset_t = std::mem::zeroed();
            libc::sigfillset(&mut mask);
            if libc::sigprocmask(libc::SIG_UNBLOCK, &mask, std::ptr::null_mut()) < 0 {
                return Err(Error::syscall("setting signal mask", last_errno()));
            }
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = libc::SIG_DFL;
            libc::sigemptyset(&mut action.sa_mask);
            for signal in 1..64 {
                libc::sigaction(signal, &action, std::ptr::null_mut());
            }
        }
        Ok(())
    }

    /// Apply setgroups/setgid/setuid/umask, in that order.
    fn set_ids(&self) -> Result<()> {
        let gids: Vec<libc::gid_t> = self.gids.iter().map(|&g| g as libc::gid_t).collect();
        // SAFETY: plain credential syscalls over owned buffers.
        unsafe {
            if libc::setgroups(gids.len() as _, gids.as_ptr()) < 0 {
                return Err(Error::syscall("setgroups", last_errno()));
            }
            if libc::setgid(self.gid as libc::gid_t) < 0 {
                return Err(Error::syscall("setgid", last_errno()));
            }
            if libc::setuid(self.uid as libc::uid_t) < 0 {
                return Err(Error::syscall("setuid", last_errno()));
            }
            libc::umask(self.umask as libc::mode_t);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;

    fn spec(value: serde_json::Value) -> ProcessSpec {
        ProcessSpec::from_value(&value).unwrap()
    }

    #[test]
    fn defaults_without_user() {
        let proc = Process::new(
            spec(json!({ "cwd": "/", "args": ["/bin/sh"] })),
            None,
            0,
        )
        .unwrap();
        assert_eq!(proc.uid, 0);
        assert_eq!(proc.gid, 0);
        assert_eq!(proc.gids, vec![0]);
        assert_eq!(proc.umask, 0o077);
        assert!(!proc.terminal);
    }

    #[test]
    fn user_with_additional_gids() {
        let proc = Process::new(
            spec(json!({
                "cwd": "/",
                "args": ["/bin/sh"],
                "user": { "uid": 1001, "gid": 1001, "umask": 18, "additionalGids": [5, 20] },
            })),
            None,
            0,
        )
        .unwrap();
        assert_eq!(proc.uid, 1001);
        assert_eq!(proc.gids, vec![1001, 5, 20]);
        assert_eq!(proc.umask, 18);
    }

    #[test]
    fn terminal_requires_console_socket() {
        let err = Process::new(
            spec(json!({ "cwd": "/", "args": ["/bin/sh"], "terminal": true })),
            None,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, Error::MalformedConfig(_)));
    }

    #[test]
    fn console_socket_requires_terminal() {
        let err = Process::new(
            spec(json!({ "cwd": "/", "args": ["/bin/sh"] })),
            Some(PathBuf::from("/tmp/console.sock")),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, Error::MalformedConfig(_)));
    }

    #[test]
    fn console_socket_must_be_a_socket() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = Process::new(
            spec(json!({ "cwd": "/", "args": ["/bin/sh"], "terminal": true })),
            Some(file.path().to_path_buf()),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, Error::MalformedConfig(_)));
    }

    #[test]
    fn terminal_with_real_socket_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let proc = Process::new(
            spec(json!({ "cwd": "/", "args": ["/bin/sh"], "terminal": true })),
            Some(path),
            0,
        )
        .unwrap();
        assert!(proc.terminal);
    }

    #[test]
    fn getenv_finds_entries() {
        let proc = Process::new(
            spec(json!({
                "cwd": "/",
                "args": ["sh"],
                "env": ["PATH=/bin:/usr/bin", "EMPTY=", "TERM=xterm"],
            })),
            None,
            0,
        )
        .unwrap();
        assert_eq!(proc.getenv("PATH"), Some("/bin:/usr/bin"));
        assert_eq!(proc.getenv("EMPTY"), Some(""));
        assert_eq!(proc.getenv("HOME"), None);
    }

    #[test]
    fn validate_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("tool");
        fs::write(&tool, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

        let mut proc = Process::new(
            spec(json!({ "cwd": "/", "args": [tool.to_str().unwrap()] })),
            None,
            0,
        )
        .unwrap();
        proc.validate().unwrap();
        assert_eq!(proc.resolved.as_deref(), Some(tool.as_path()));
    }

    #[test]
    fn validate_absolute_path_missing() {
        let mut proc = Process::new(
            spec(json!({ "cwd": "/", "args": ["/nonexistent/tool"] })),
            None,
            0,
        )
        .unwrap();
        assert!(matches!(
            proc.validate(),
            Err(Error::ExecutableNotFound(a)) if a == "/nonexistent/tool"
        ));
    }

    #[test]
    fn validate_searches_own_path() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("tool");
        fs::write(&tool, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

        let mut proc = Process::new(
            spec(json!({
                "cwd": "/",
                "args": ["tool"],
                "env": [format!("PATH=/nonexistent:{}", dir.path().display())],
            })),
            None,
            0,
        )
        .unwrap();
        proc.validate().unwrap();
        assert_eq!(proc.resolved.as_deref(), Some(tool.as_path()));
    }

    #[test]
    fn validate_without_path_fails() {
        let mut proc = Process::new(
            spec(json!({ "cwd": "/", "args": ["tool"] })),
            None,
            0,
        )
        .unwrap();
        assert!(matches!(proc.validate(), Err(Error::ExecutableNotFound(_))));
    }

    #[test]
    fn non_executable_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("tool");
        fs::write(&tool, b"data").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o644)).unwrap();

        let mut proc = Process::new(
            spec(json!({ "cwd": "/", "args": [tool.to_str().unwrap()] })),
            None,
            0,
        )
        .unwrap();
        assert!(matches!(proc.validate(), Err(Error::ExecutableNotFound(_))));
    }

    #[test]
    fn pre_start_without_terminal_is_inherited_stdio() {
        let proc = Process::new(
            spec(json!({ "cwd": "/", "args": ["/bin/sh"] })),
            None,
            0,
        )
        .unwrap();
        assert_eq!(proc.pre_start().unwrap(), (0, 1, 2));
    }
}
