//! nmount(2) and unmount(2).
//!
//! `nmount` takes its configuration as NUL-terminated name/value string
//! pairs (`fstype`, `fspath`, filesystem-specific options) plus a flags
//! word. The flag constants below mirror `<sys/mount.h>`.

use std::ffi::CString;
use std::path::Path;

use rustix::io::Errno;

#[cfg(target_os = "freebsd")]
use crate::last_errno;

pub const MNT_RDONLY: u64 = 0x0000000000000001;
pub const MNT_SYNCHRONOUS: u64 = 0x0000000000000002;
pub const MNT_NOEXEC: u64 = 0x0000000000000004;
pub const MNT_NOSUID: u64 = 0x0000000000000008;
pub const MNT_NFS4ACLS: u64 = 0x0000000000000010;
pub const MNT_UNION: u64 = 0x0000000000000020;
pub const MNT_ASYNC: u64 = 0x0000000000000040;
pub const MNT_FORCE: u64 = 0x0000000000080000;
pub const MNT_SUIDDIR: u64 = 0x0000000000100000;
pub const MNT_NOSYMFOLLOW: u64 = 0x0000000000400000;
pub const MNT_SNAPSHOT: u64 = 0x0000000001000000;
pub const MNT_MULTILABEL: u64 = 0x0000000004000000;
pub const MNT_ACLS: u64 = 0x0000000008000000;
pub const MNT_NOATIME: u64 = 0x0000000010000000;
pub const MNT_NOCLUSTERR: u64 = 0x0000000040000000;
pub const MNT_NOCLUSTERW: u64 = 0x0000000080000000;
pub const MNT_AUTOMOUNTED: u64 = 0x0000000200000000;
pub const MNT_UNTRUSTED: u64 = 0x0000000800000000;
pub const MNT_NOCOVER: u64 = 0x0000001000000000;
pub const MNT_EMPTYDIR: u64 = 0x0000002000000000;
pub const MNT_UPDATE: u64 = 0x0000000000010000;

/// Mount a filesystem described by `(name, value)` option pairs.
pub fn nmount(options: &[(String, String)], flags: u64) -> Result<(), Errno> {
    let mut strings: Vec<CString> = Vec::with_capacity(2 * options.len());
    for (name, value) in options {
        strings.push(CString::new(name.as_str()).map_err(|_| Errno::INVAL)?);
        strings.push(CString::new(value.as_str()).map_err(|_| Errno::INVAL)?);
    }
    #[cfg(target_os = "freebsd")]
    {
        let mut iov: Vec<libc::iovec> = strings
            .iter()
            .map(|s| libc::iovec {
                iov_base: s.as_ptr() as *mut libc::c_void,
                iov_len: s.as_bytes_with_nul().len(),
            })
            .collect();

        // SAFETY: iovecs point into `strings`, which lives across the call.
        let ret = unsafe {
            ffi::nmount(iov.as_mut_ptr(), iov.len() as libc::c_uint, flags as libc::c_int)
        };
        if ret < 0 {
            return Err(last_errno());
        }
        Ok(())
    }
    #[cfg(not(target_os = "freebsd"))]
    {
        let _ = (strings, flags);
        Err(Errno::NOSYS)
    }
}

/// Unmount the filesystem mounted at `path`.
pub fn unmount(path: &Path, flags: u64) -> Result<(), Errno> {
    use std::os::unix::ffi::OsStrExt;

    let path_c = CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::INVAL)?;
    #[cfg(target_os = "freebsd")]
    {
        // SAFETY: path_c is a valid NUL-terminated string.
        if unsafe { ffi::unmount(path_c.as_ptr(), flags as libc::c_int) } < 0 {
            return Err(last_errno());
        }
        Ok(())
    }
    #[cfg(not(target_os = "freebsd"))]
    {
        let _ = (path_c, flags);
        Err(Errno::NOSYS)
    }
}

#[cfg(target_os = "freebsd")]
mod ffi {
    extern "C" {
        pub fn nmount(iov: *mut libc::iovec, niov: libc::c_uint, flags: libc::c_int)
            -> libc::c_int;
        pub fn unmount(path: *const libc::c_char, flags: libc::c_int) -> libc::c_int;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_values_are_distinct() {
        let flags = [
            MNT_RDONLY,
            MNT_SYNCHRONOUS,
            MNT_NOEXEC,
            MNT_NOSUID,
            MNT_NFS4ACLS,
            MNT_UNION,
            MNT_ASYNC,
            MNT_FORCE,
            MNT_SUIDDIR,
            MNT_NOSYMFOLLOW,
            MNT_SNAPSHOT,
            MNT_MULTILABEL,
            MNT_ACLS,
            MNT_NOATIME,
            MNT_NOCLUSTERR,
            MNT_NOCLUSTERW,
            MNT_AUTOMOUNTED,
            MNT_UNTRUSTED,
            MNT_NOCOVER,
            MNT_EMPTYDIR,
            MNT_UPDATE,
        ];
        for (i, a) in flags.iter().enumerate() {
            for b in &flags[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[cfg(not(target_os = "freebsd"))]
    #[test]
    fn stubs_report_nosys() {
        assert_eq!(nmount(&[], 0), Err(Errno::NOSYS));
        assert_eq!(unmount(Path::new("/nonexistent"), 0), Err(Errno::NOSYS));
    }
}
