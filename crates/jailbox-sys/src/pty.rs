//! Pseudo-terminal acquisition.
//!
//! The runtime hands the control end of a pty to whoever is listening on
//! the console socket and keeps the subordinate end as the container's
//! stdio. Splitting `open_pty` from `set_controlling_tty` lets the caller
//! decide when the session switch happens (it must run in the container
//! process, after fork).

use std::ffi::CStr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use rustix::io::Errno;

use crate::last_errno;

/// Open a pty pair. Returns `(control, subordinate)`.
pub fn open_pty() -> Result<(OwnedFd, OwnedFd), Errno> {
    // SAFETY: posix_openpt takes only flags and returns a descriptor.
    let control = unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY) };
    if control < 0 {
        return Err(last_errno());
    }
    // SAFETY: control is a valid pty descriptor from posix_openpt.
    let control = unsafe { OwnedFd::from_raw_fd(control) };

    // SAFETY: fcntl on an owned descriptor.
    if unsafe { libc::fcntl(control.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(last_errno());
    }
    // SAFETY: grantpt/unlockpt on a valid pty control descriptor.
    unsafe {
        if libc::grantpt(control.as_raw_fd()) < 0 {
            return Err(last_errno());
        }
        if libc::unlockpt(control.as_raw_fd()) < 0 {
            return Err(last_errno());
        }
    }

    // SAFETY: ptsname returns a static buffer valid until the next call;
    // we copy out of it immediately.
    let name = unsafe {
        let p = libc::ptsname(control.as_raw_fd());
        if p.is_null() {
            return Err(last_errno());
        }
        CStr::from_ptr(p).to_owned()
    };

    // SAFETY: name is a valid NUL-terminated path.
    let tty = unsafe { libc::open(name.as_ptr(), libc::O_RDWR) };
    if tty < 0 {
        return Err(last_errno());
    }
    // SAFETY: tty is a freshly opened descriptor.
    Ok((control, unsafe { OwnedFd::from_raw_fd(tty) }))
}

/// Start a new session and make `tty` its controlling terminal.
pub fn set_controlling_tty(tty: RawFd) -> Result<(), Errno> {
    // SAFETY: setsid takes no arguments.
    if unsafe { libc::setsid() } < 0 {
        return Err(last_errno());
    }
    // SAFETY: TIOCSCTTY on a valid tty descriptor.
    if unsafe { libc::ioctl(tty, libc::TIOCSCTTY, 0) } < 0 {
        return Err(last_errno());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_pty_pair() {
        let (control, tty) = open_pty().unwrap();
        assert!(control.as_raw_fd() >= 0);
        assert!(tty.as_raw_fd() >= 0);
        assert_ne!(control.as_raw_fd(), tty.as_raw_fd());
    }

    #[test]
    fn subordinate_is_a_tty() {
        let (_control, tty) = open_pty().unwrap();
        // SAFETY: isatty on a valid descriptor.
        assert_eq!(unsafe { libc::isatty(tty.as_raw_fd()) }, 1);
    }
}
