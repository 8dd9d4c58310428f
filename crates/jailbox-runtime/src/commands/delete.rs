//! `delete` - tear down a container and its on-host residue.

use rustix::io::Errno;
use tracing::debug;

use jailbox_sys::mount::{self as sys_mount, MNT_FORCE};

use crate::error::{Error, Result};
use crate::hooks::{self, Phase};
use crate::jail::Jail;
use crate::mounts;
use crate::oci;
use crate::state::Status;
use crate::Runtime;

pub fn run(runtime: &Runtime, id: &str, force: bool) -> Result<()> {
    let handle = runtime.state_db().handle(id);

    // Someone else already deleted it: nothing to do.
    if !handle.exists() {
        return Ok(());
    }

    let _lock = handle.lock()?;
    let mut state = handle.load()?;
    state.refresh_status();

    // The specification limits delete to stopped containers; like runc
    // and crun we also take created (kill it) and, with --force, running.
    match state.status {
        Status::Stopped => {}
        Status::Created => {
            // SAFETY: plain kill syscall; failure means it is already gone.
            unsafe { libc::kill(state.pid, libc::SIGKILL) };
        }
        Status::Running if force => {
            // SAFETY: as above.
            unsafe { libc::kill(state.pid, libc::SIGKILL) };
        }
        status => {
            return Err(Error::InvalidState {
                id: id.to_string(),
                status: status.to_string(),
                expected: "\"stopped\" or \"created\"",
            })
        }
    }

    Jail::from_jid(state.jid).remove()?;

    let root = state.effective_root().to_path_buf();
    let mount_list = oci::mounts(&state.config)?;
    mounts::unmount_volumes(&mut state, &root, &mount_list)?;

    if state.root_readonly {
        if let Some(alias) = state.readonly_root_path.clone() {
            match sys_mount::unmount(&alias, MNT_FORCE) {
                Ok(()) | Err(Errno::INVAL) | Err(Errno::NOENT) => {}
                Err(errno) => {
                    return Err(Error::syscall(
                        format!("unmounting {}", alias.display()),
                        errno,
                    ))
                }
            }
        }
    }

    let hook_set = oci::hooks(&state.config)?;
    hooks::run_phase(&hook_set, Phase::Poststop, &state.report())?;

    debug!(id, "removing state directory");
    handle.remove_all()
}
