//! `exec` - run an additional process inside a live container.
//!
//! Foreground exec turns the calling runtime into the new process.
//! `--detach` reuses the create rendezvous (socketpair, status byte) minus
//! hooks and fifo, so the caller learns whether validation succeeded
//! before the runtime exits.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::path::PathBuf;

use nix::unistd::{fork, ForkResult};
use serde_json::Value;

use jailbox_sys::scm_rights::create_socketpair;

use crate::error::{nix_errno, Error, Result};
use crate::jail::Jail;
use crate::oci::ProcessSpec;
use crate::process::Process;
use crate::{Runtime, TestMode};

pub struct ExecArgs {
    pub id: String,
    pub process_file: PathBuf,
    pub tty: bool,
    pub detach: bool,
    pub console_socket: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub preserve_fds: i32,
}

pub fn run(runtime: &Runtime, args: &ExecArgs) -> Result<i32> {
    let value: Value = serde_json::from_slice(&fs::read(&args.process_file)?)?;
    let mut spec = ProcessSpec::from_value(&value)?;
    if args.tty {
        spec.terminal = Some(true);
    }
    let mut proc = Process::new(spec, args.console_socket.clone(), args.preserve_fds)?;

    if runtime.test_mode == TestMode::Validation {
        return Ok(0);
    }

    let handle = runtime.state_db().handle(&args.id);
    let lock = handle.lock()?;
    let state = handle.load()?;
    let jail = Jail::from_jid(state.jid);
    // Nothing below mutates state; don't carry the lock into the fork.
    lock.unlock();

    if !args.detach {
        let (stdin_fd, stdout_fd, stderr_fd) = proc.pre_start()?;
        jail.attach()?;
        proc.validate()?;
        proc.exec(stdin_fd, stdout_fd, stderr_fd)?;
        // exec only returns on failure, which the ? above surfaced.
        return Ok(0);
    }

    let (parent_sock, child_sock) = create_socketpair()
        .map_err(|errno| Error::syscall("creating socket pair", errno))?;

    // SAFETY: single-threaded CLI; the child only runs fork-safe code
    // before exec.
    match unsafe { fork() }.map_err(|errno| Error::syscall("fork", nix_errno(errno)))? {
        ForkResult::Parent { child } => {
            drop(child_sock);
            if let Some(pid_file) = &args.pid_file {
                fs::write(pid_file, child.as_raw().to_string())?;
            }
            let mut sock = File::from(parent_sock);
            sock.write_all(&[1])?;
            let mut status = [0u8; 1];
            sock.read_exact(&mut status)?;
            Ok(i32::from(status[0]))
        }
        ForkResult::Child => {
            drop(parent_sock);
            let code = exec_child(&mut proc, &jail, child_sock);
            std::process::exit(code)
        }
    }
}

/// Detached-exec child: same byte protocol as create, no hooks, no fifo.
fn exec_child(proc: &mut Process, jail: &Jail, sock: OwnedFd) -> i32 {
    let (stdin_fd, stdout_fd, stderr_fd) = match proc.pre_start() {
        Ok(fds) => fds,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    let mut sock = File::from(sock);
    let mut byte = [0u8; 1];
    if sock.read_exact(&mut byte).is_err() {
        return 1;
    }

    let mut status: u8 = 0;
    let setup = (|| -> Result<()> {
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

    if status != 0 {
        return i32::from(status);
    }
    if let Err(e) = proc.exec(stdin_fd, stdout_fd, stderr_fd) {
        eprintln!("{e}");
    }
    1
}
