//! `create` - build the jail and leave a paused container process behind.
//!
//! The runtime forks after the jail and the start fifo exist. The two
//! halves coordinate over a socketpair: the parent persists state and runs
//! the `createRuntime` hooks, then writes one byte; the child performs the
//! pty handoff, runs `createContainer` inside the rootfs, enters the jail,
//! validates the command, and answers with its status byte. The child then
//! blocks on the fifo until `start`, and only execs from inside the jail.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd::{fork, ForkResult};
use serde_json::Value;
use tracing::debug;

use jailbox_sys::mount::MNT_RDONLY;
use jailbox_sys::scm_rights::create_socketpair;

use crate::error::{io_errno, nix_errno, Error, Result};
use crate::hooks::{self, Phase};
use crate::jail::{Jail, JailConfig, Ns};
use crate::mounts;
use crate::oci::{self, Hooks, ProcessSpec};
use crate::process::Process;
use crate::state::{ContainerState, StateHandle, Status};
use crate::{Runtime, TestMode};

pub struct CreateArgs {
    pub id: String,
    pub bundle: PathBuf,
    pub console_socket: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub preserve_fds: i32,
}

pub fn run(runtime: &Runtime, args: &CreateArgs) -> Result<i32> {
    let handle = runtime.state_db().handle(&args.id);
    if runtime.test_mode == TestMode::None && handle.exists() {
        return Err(Error::ContainerExists(args.id.clone()));
    }

    // Everything downstream (state record, hooks, the jail path) wants an
    // absolute bundle, whatever the caller passed.
    let bundle = fs::canonicalize(&args.bundle)
        .map_err(|e| Error::syscall(format!("resolving {}", args.bundle.display()), io_errno(&e)))?;
    std::env::set_current_dir(&bundle).map_err(|e| {
        Error::syscall(
            format!("changing directory to {}", bundle.display()),
            io_errno(&e),
        )
    })?;

    let config_path = bundle.join("config.json");
    if !config_path.is_file() {
        return Err(Error::malformed("bundle directory must contain config.json"));
    }
    let config: Value = serde_json::from_slice(&fs::read(&config_path)?)?;
    oci::check_version(&config)?;

    let process_value = config
        .get("process")
        .ok_or_else(|| Error::malformed("no process"))?;
    let spec = ProcessSpec::from_value(process_value)?;
    let mut proc = Process::new(spec, args.console_socket.clone(), args.preserve_fds)?;

    let (root_path, root_readonly) = oci::root_path(&config, &bundle)?;
    if !root_path.is_dir() {
        return Err(Error::malformed(format!(
            "root directory {} must be a directory",
            root_path.display()
        )));
    }

    let mount_list = oci::mounts(&config)?;
    let hook_set = oci::hooks(&config)?;

    let parent_jail = oci::annotation(&config, oci::ANNOTATION_PARENT_JAIL).map(str::to_string);
    let vnet = match oci::annotation(&config, oci::ANNOTATION_VNET) {
        None | Some("inherit") => Ns::Inherit,
        Some("new") => Ns::New,
        Some(other) => {
            return Err(Error::malformed(format!(
                "bad value for {}: {other}",
                oci::ANNOTATION_VNET
            )))
        }
    };

    // allow.chflags is on by default but never wider than the parent's.
    let mut allow_chflags = true;
    if let Some(parent) = &parent_jail {
        allow_chflags = Jail::find(parent)?.get_bool("allow.chflags")?;
    }

    let readonly_root_alias = handle.state_dir().join("readonly_root");

    let mut jconf = JailConfig::new();
    match &parent_jail {
        Some(parent) => jconf.set_str("name", format!("{parent}.{}", args.id)),
        None => jconf.set_str("name", args.id.as_str()),
    };
    jconf.set_flag("persist");
    jconf.set_u32("enforce_statfs", 1);
    jconf.set_flag("allow.raw_sockets");
    if allow_chflags {
        jconf.set_flag("allow.chflags");
    }
    if root_readonly {
        jconf.set_str("path", readonly_root_alias.to_string_lossy());
    } else {
        jconf.set_str("path", root_path.to_string_lossy());
    }
    if vnet == Ns::New {
        jconf.set_ns("vnet", Ns::New);
    } else {
        jconf.set_ns("ip4", Ns::Inherit);
        jconf.set_ns("ip6", Ns::Inherit);
    }
    match config.get("hostname").and_then(Value::as_str) {
        Some(hostname) => {
            jconf.set_str("host.hostname", hostname);
            jconf.set_ns("host", Ns::New);
        }
        None => {
            jconf.set_ns("host", Ns::Inherit);
        }
    }

    // Config validation tests stop here.
    if runtime.test_mode == TestMode::Validation {
        return Ok(0);
    }

    let lock = handle.create()?;
    let mut state = ContainerState::new(
        &args.id,
        root_path.clone(),
        bundle.clone(),
        config.clone(),
    );
    state.status = Status::Created;
    state.parent_jail = parent_jail.clone();

    // Mount filesystems, recording unmount actions in the state. A
    // read-only root takes two passes: the first prepares mount points in
    // the writable rootfs, the second completes the mounts through the
    // read-only alias.
    let mut effective_root = root_path.clone();
    if root_readonly {
        mounts::mount_volumes(&mut state, &root_path, &mount_list, true)?;
        fs::create_dir_all(&readonly_root_alias)?;
        mounts::mount_nullfs(&readonly_root_alias, &root_path, MNT_RDONLY)?;
        state.root_readonly = true;
        state.readonly_root_path = Some(readonly_root_alias.clone());
        effective_root = readonly_root_alias;
    }
    mounts::mount_volumes(&mut state, &effective_root, &mount_list, false)?;

    // A full parent gets one more child slot before we create ours.
    if let Some(parent) = &parent_jail {
        let pj = Jail::find(parent)?;
        let current = pj.get_u32("children.cur")?;
        let max = pj.get_u32("children.max")?;
        if current >= max {
            pj.set_u32("children.max", current + 1)?;
        }
    }

    let (parent_sock, child_sock) = create_socketpair()
        .map_err(|errno| Error::syscall("creating socket pair", errno))?;

    let jail = Jail::create(&jconf)?;
    debug!(id = %args.id, jid = jail.jid(), "jail created");

    // The start fifo must exist before forking; the container process
    // blocks reading it until `start`.
    // SAFETY: umask only masks mode bits for this process.
    unsafe { libc::umask(0o077) };
    nix::unistd::mkfifo(&handle.start_fifo(), Mode::from_bits_truncate(0o600))
        .map_err(|errno| Error::syscall("creating start fifo", nix_errno(errno)))?;

    // SAFETY: the CLI is single-threaded; the child runs only fork-safe
    // code before exec.
    match unsafe { fork() }.map_err(|errno| Error::syscall("fork", nix_errno(errno)))? {
        ForkResult::Parent { child } => {
            drop(child_sock);
            if let Some(pid_file) = &args.pid_file {
                fs::write(pid_file, child.as_raw().to_string())?;
            }
            state.jid = jail.jid();
            state.pid = child.as_raw();
            handle.save(&state)?;

            hooks::run_phase(&hook_set, Phase::CreateRuntime, &state.report())?;

            // Release the lock before signaling so a concurrent `start`
            // can take it.
            lock.unlock();

            let mut sock = File::from(parent_sock);
            sock.write_all(&[1])?;

            // The child's status byte is our exit status; it has already
            // written any detail to stderr.
            let mut status = [0u8; 1];
            sock.read_exact(&mut status)?;
            if status[0] != 0 {
                state.status = Status::Stopped;
                handle.save(&state)?;
            }
            Ok(i32::from(status[0]))
        }
        ForkResult::Child => {
            drop(parent_sock);
            // The parent records jid/pid after fork; mirror them so the
            // container-side hooks see a complete state document.
            state.jid = jail.jid();
            state.pid = nix::unistd::getpid().as_raw();

            let code = container_child(
                &handle,
                &state,
                &mut proc,
                &hook_set,
                &effective_root,
                &jail,
                child_sock,
            );
            std::process::exit(code)
        }
    }
}

/// The container-side half of create. Never returns on a successful exec.
fn container_child(
    handle: &StateHandle,
    state: &ContainerState,
    proc: &mut Process,
    hook_set: &Hooks,
    root: &Path,
    jail: &Jail,
    sock: OwnedFd,
) -> i32 {
    // Console handoff happens first, while stdio is still the caller's.
    let (stdin_fd, stdout_fd, stderr_fd) = match proc.pre_start() {
        Ok(fds) => fds,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    // Hold the fifo open read-write before waiting so `start` need not
    // race on opening it.
    let fifo = match OpenOptions::new().read(true).write(true).open(handle.start_fifo()) {
        Ok(fifo) => fifo,
        Err(e) => {
            eprintln!("open start fifo: {e}");
            return 1;
        }
    };

    let mut sock = File::from(sock);
    let mut byte = [0u8; 1];
    if let Err(e) = sock.read_exact(&mut byte) {
        eprintln!("reading from create socket: {e}");
        return 1;
    }

    // Hooks, jail entry and command validation; any failure is reported
    // to the parent as a nonzero status byte.
    let mut status: u8 = 0;
    let setup = (|| -> Result<()> {
        // createContainer hooks resolve paths in the container namespace;
        // like runc we interpret that as running from the rootfs without
        // chrooting.
        std::env::set_current_dir(root).map_err(|e| {
            Error::syscall(format!("changing directory to {}", root.display()), io_errno(&e))
        })?;
        hooks::run_phase(hook_set, Phase::CreateContainer, &state.report())?;
        jail.attach()?;
        proc.validate()?;
        Ok(())
    })();
    if let Err(e) = setup {
        eprintln!("{e}");
        status = 1;
    }
    if sock.write_all(&[status]).is_err() {
        return 1;
    }
    drop(sock);

    // Wait for `start`.
    let mut release = [0u8; 1];
    if let Err(e) = (&fifo).read_exact(&mut release) {
        eprintln!("reading from start fifo: {e}");
        return 1;
    }
    drop(fifo);

    // Validation failed earlier: stop here, the parent already exited
    // with our status.
    if status != 0 {
        return i32::from(status);
    }

    if let Err(e) = hooks::run_phase(hook_set, Phase::StartContainer, &state.report()) {
        eprintln!("{e}");
        return 1;
    }
    if let Err(e) = proc.exec(stdin_fd, stdout_fd, stderr_fd) {
        eprintln!("{e}");
    }
    1
}
