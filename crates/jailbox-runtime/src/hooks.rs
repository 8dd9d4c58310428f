//! OCI lifecycle hook execution.
//!
//! Each hook is forked and exec'd with the OCI state document on its
//! standard input. A nonzero exit aborts the phase; later hooks in the
//! same phase do not run. The `timeout` field is parsed but not enforced.

use std::ffi::CString;
use std::fs::File;
use std::io::Write;
use std::os::fd::AsRawFd;

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use serde_json::Value;
use tracing::debug;

use crate::error::{nix_errno, Error, Result};
use crate::oci::{HookSpec, Hooks};
use crate::process::set_cloexec_from;

/// The hook phases, in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prestart,
    CreateRuntime,
    CreateContainer,
    StartContainer,
    Poststart,
    Poststop,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Prestart,
        Phase::CreateRuntime,
        Phase::CreateContainer,
        Phase::StartContainer,
        Phase::Poststart,
        Phase::Poststop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Prestart => "prestart",
            Phase::CreateRuntime => "createRuntime",
            Phase::CreateContainer => "createContainer",
            Phase::StartContainer => "startContainer",
            Phase::Poststart => "poststart",
            Phase::Poststop => "poststop",
        }
    }
}

impl Hooks {
    /// The hook list for one phase.
    pub fn phase(&self, phase: Phase) -> &[HookSpec] {
        match phase {
            Phase::Prestart => &self.prestart,
            Phase::CreateRuntime => &self.create_runtime,
            Phase::CreateContainer => &self.create_container,
            Phase::StartContainer => &self.start_container,
            Phase::Poststart => &self.poststart,
            Phase::Poststop => &self.poststop,
        }
    }
}

/// Run every hook of `phase` in array order, feeding each the state
/// document. Stops at the first nonzero exit.
pub fn run_phase(hooks: &Hooks, phase: Phase, report: &Value) -> Result<()> {
    let list = hooks.phase(phase);
    if list.is_empty() {
        return Ok(());
    }
    debug!(phase = phase.as_str(), hooks = list.len(), "running hooks");
    for hook in list {
        let status = run_hook(hook, report)?;
        if status != 0 {
            return Err(Error::HookFailed {
                path: hook.path.clone(),
                status,
            });
        }
    }
    Ok(())
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::malformed(format!("NUL byte in {s:?}")))
}

/// Fork and exec one hook; returns its exit status (`127 + signal` when
/// killed).
fn run_hook(hook: &HookSpec, report: &Value) -> Result<i32> {
    let path = cstring(&hook.path)?;

    // argv is the hook path followed by its declared arguments.
    let mut argv = vec![path.clone()];
    for arg in hook.args.iter().flatten() {
        argv.push(cstring(arg)?);
    }

    // The hook environment replaces ours only when the record carries one.
    let envp: Vec<CString> = match &hook.env {
        Some(env) => env.iter().map(|e| cstring(e)).collect::<Result<_>>()?,
        None => std::env::vars()
            .map(|(k, v)| cstring(&format!("{k}={v}")))
            .collect::<Result<_>>()?,
    };

    let report_bytes = serde_json::to_vec(report)?;
    let (pipe_read, pipe_write) = nix::unistd::pipe()
        .map_err(|errno| Error::syscall("creating pipe for hook", nix_errno(errno)))?;

    // SAFETY: the child only calls async-signal-safe functions before exec.
    match unsafe { fork() }.map_err(|errno| Error::syscall("fork", nix_errno(errno)))? {
        ForkResult::Child => {
            // SAFETY: dup2 onto stdin; the read end stays valid until exec.
            unsafe { libc::dup2(pipe_read.as_raw_fd(), 0) };
            set_cloexec_from(3);
            // SAFETY: argv/envp are NUL-terminated arrays of valid pointers.
            unsafe {
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
                // The path must be absolute: no PATH search for hooks.
                libc::execve(path.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
                let msg = format!("error executing hook {}\n", hook.path);
                libc::write(2, msg.as_ptr().cast(), msg.len());
                libc::_exit(127)
            }
        }
        ForkResult::Parent { child } => {
            drop(pipe_read);
            let mut writer = File::from(pipe_write);
            // A hook may exit without reading its stdin; its exit status
            // still decides the phase.
            if let Err(e) = writer.write_all(&report_bytes) {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
            drop(writer);

            let status = match waitpid(child, None)
                .map_err(|errno| Error::syscall("waiting for hook", nix_errno(errno)))?
            {
                WaitStatus::Exited(_, code) => code,
                WaitStatus::Signaled(_, signal, _) => 127 + signal as i32,
                _ => 127,
            };
            Ok(status)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hook(value: serde_json::Value) -> HookSpec {
        serde_json::from_value(value).unwrap()
    }

    fn sample_report() -> Value {
        json!({
            "ociVersion": "1.0.2",
            "id": "t1",
            "status": "created",
            "pid": 1234,
            "bundle": "/bundles/t1",
        })
    }

    #[test]
    fn hook_receives_state_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("state.out");
        let spec = hook(json!({
            "path": "/bin/sh",
            "args": ["-c", "cat > \"$OUT\""],
            "env": [format!("OUT={}", out.display())],
        }));
        assert_eq!(run_hook(&spec, &sample_report()).unwrap(), 0);

        let written: Value = serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
        assert_eq!(written["id"], "t1");
        assert_eq!(written["status"], "created");
    }

    #[test]
    fn hook_exit_status_is_reported() {
        let spec = hook(json!({ "path": "/bin/sh", "args": ["-c", "exit 3"] }));
        assert_eq!(run_hook(&spec, &sample_report()).unwrap(), 3);
    }

    #[test]
    fn exec_failure_yields_127() {
        let spec = hook(json!({ "path": "/nonexistent/hook" }));
        assert_eq!(run_hook(&spec, &sample_report()).unwrap(), 127);
    }

    #[test]
    fn failing_hook_aborts_phase() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let hooks: Hooks = serde_json::from_value(json!({
            "poststop": [
                { "path": "/bin/sh", "args": ["-c", "exit 1"] },
                { "path": "/bin/sh", "args": ["-c", format!("touch {}", marker.display())] },
            ]
        }))
        .unwrap();

        let err = run_phase(&hooks, Phase::Poststop, &sample_report()).unwrap_err();
        assert!(matches!(err, Error::HookFailed { status: 1, .. }));
        assert!(!marker.exists());
    }

    #[test]
    fn empty_phase_is_a_no_op() {
        run_phase(&Hooks::default(), Phase::Prestart, &sample_report()).unwrap();
    }

    #[test]
    fn phase_names() {
        let names: Vec<&str> = Phase::ALL.iter().map(Phase::as_str).collect();
        assert_eq!(
            names,
            [
                "prestart",
                "createRuntime",
                "createContainer",
                "startContainer",
                "poststart",
                "poststop"
            ]
        );
    }
}
