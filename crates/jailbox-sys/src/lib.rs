//! Low-level FreeBSD syscall wrappers for the jailbox runtime.
//!
//! This crate provides thin wrappers around the FreeBSD-specific syscalls
//! that are not covered by rustix or libc. Everything else in the runtime
//! goes through rustix/nix.
//!
//! ## Modules
//!
//! - **jail** - The jail(2) parameter syscalls: `jail_set`, `jail_get`,
//!   `jail_attach`, `jail_remove`
//! - **mount** - `nmount(2)` name/value mounting and `unmount(2)`
//! - **pty** - Pseudo-terminal acquisition and controlling-tty handoff
//! - **scm_rights** - Descriptor passing over `AF_UNIX` sockets
//!
//! ## Portability
//!
//! On targets other than FreeBSD the jail and nmount entry points return
//! `ENOSYS`. This keeps the crate compiling everywhere so the logic layered
//! on top of it stays unit-testable on any Unix host.
//!
//! # Safety
//!
//! This crate contains raw syscall wrappers. Casts between integer types
//! are unavoidable when interfacing with the kernel ABI.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod jail;
pub mod mount;
pub mod pty;
pub mod scm_rights;

#[inline]
pub fn last_errno() -> rustix::io::Errno {
    rustix::io::Errno::from_raw_os_error(
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
    )
}
