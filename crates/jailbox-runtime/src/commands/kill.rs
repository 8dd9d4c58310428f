//! `kill` - deliver a signal to the container leader.

use rustix::io::Errno;

use jailbox_sys::last_errno;

use crate::error::{Error, Result};
use crate::signals::parse_signal;
use crate::state::Status;
use crate::Runtime;

pub struct KillArgs {
    pub id: String,
    /// Decimal number or signal name; `None` means SIGTERM.
    pub signal: Option<String>,
    /// Accepted for CLI compatibility; jail-scoped delivery is not wired
    /// up, the leader pid gets the signal either way.
    pub all: bool,
    pub pid: Option<i32>,
}

pub fn run(runtime: &Runtime, args: &KillArgs) -> Result<()> {
    let signal = parse_signal(args.signal.as_deref())?;

    let handle = runtime.state_db().handle(&args.id);
    let _lock = handle.lock()?;
    let state = handle.load()?;

    if matches!(state.status, Status::Created | Status::Running) {
        let target = args.pid.unwrap_or(state.pid);
        // SAFETY: plain kill syscall.
        if unsafe { libc::kill(target, signal) } < 0 {
            let errno = last_errno();
            // The process may already be gone.
            if errno != Errno::SRCH {
                return Err(Error::syscall(
                    format!("sending signal to pid {target}"),
                    errno,
                ));
            }
        }
    }
    Ok(())
}
