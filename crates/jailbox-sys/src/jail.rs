//! The jail(2) parameter syscalls.
//!
//! `jail_set` and `jail_get` exchange parameters with the kernel as a flat
//! iovec vector of alternating name/value pairs. [`ParamList`] owns the
//! backing buffers for one call; the kernel writes into value buffers on
//! `jail_get` and reports failures through a trailing `errmsg` parameter,
//! which these wrappers always append and surface in [`JailError`].

use std::ffi::CString;

use rustix::io::Errno;

#[cfg(target_os = "freebsd")]
use crate::last_errno;

pub const JAIL_CREATE: i32 = 0x01;
pub const JAIL_UPDATE: i32 = 0x02;
pub const JAIL_ATTACH: i32 = 0x04;

const ERRMSG_LEN: usize = 1024;

/// Error from a jail parameter syscall.
///
/// `errmsg` is the kernel's own description, captured via the `errmsg`
/// output parameter. It is empty when the kernel did not fill it in.
#[derive(Debug)]
pub struct JailError {
    pub errno: Errno,
    pub errmsg: String,
}

impl std::fmt::Display for JailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.errmsg.is_empty() {
            write!(f, "{}", self.errno)
        } else {
            write!(f, "{}: {}", self.errno, self.errmsg)
        }
    }
}

impl std::error::Error for JailError {}

impl From<Errno> for JailError {
    fn from(errno: Errno) -> Self {
        Self {
            errno,
            errmsg: String::new(),
        }
    }
}

/// An ordered name/value parameter vector for one jail_set/jail_get call.
///
/// Values are raw byte buffers: strings are NUL-terminated, integers are
/// native-endian, flags are empty. `jail_get` writes results back into the
/// same buffers.
#[derive(Default)]
pub struct ParamList {
    entries: Vec<(CString, Vec<u8>)>,
}

impl ParamList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter. Fails with `EINVAL` if the name embeds a NUL.
    pub fn push(&mut self, name: &str, value: Vec<u8>) -> Result<(), Errno> {
        let name = CString::new(name).map_err(|_| Errno::INVAL)?;
        self.entries.push((name, value));
        Ok(())
    }

    /// The value buffer for `name`, as last written by the kernel.
    pub fn value(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| n.to_bytes() == name.as_bytes())
            .map(|(_, v)| v.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Create or update a jail. Returns the jail id.
pub fn jail_set(params: &mut ParamList, flags: i32) -> Result<i32, JailError> {
    param_call(params, flags, true)
}

/// Look up jail parameters. Returns the jail id of the match.
pub fn jail_get(params: &mut ParamList, flags: i32) -> Result<i32, JailError> {
    param_call(params, flags, false)
}

#[cfg(target_os = "freebsd")]
fn param_call(params: &mut ParamList, flags: i32, set: bool) -> Result<i32, JailError> {
    let mut errbuf = [0u8; ERRMSG_LEN];
    let errmsg_name: &[u8] = b"errmsg\0";

    let mut iov: Vec<libc::iovec> = Vec::with_capacity(2 * params.entries.len() + 2);
    for (name, value) in &mut params.entries {
        iov.push(libc::iovec {
            iov_base: name.as_ptr() as *mut libc::c_void,
            iov_len: name.as_bytes_with_nul().len(),
        });
        if value.is_empty() {
            // Flag parameter: present name, no value.
            iov.push(libc::iovec {
                iov_base: std::ptr::null_mut(),
                iov_len: 0,
            });
        } else {
            iov.push(libc::iovec {
                iov_base: value.as_mut_ptr().cast::<libc::c_void>(),
                iov_len: value.len(),
            });
        }
    }
    iov.push(libc::iovec {
        iov_base: errmsg_name.as_ptr() as *mut libc::c_void,
        iov_len: errmsg_name.len(),
    });
    iov.push(libc::iovec {
        iov_base: errbuf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: errbuf.len(),
    });

    // SAFETY: every iovec points into a buffer that outlives the call.
    let jid = unsafe {
        if set {
            ffi::jail_set(iov.as_mut_ptr(), iov.len() as libc::c_uint, flags)
        } else {
            ffi::jail_get(iov.as_mut_ptr(), iov.len() as libc::c_uint, flags)
        }
    };
    if jid < 0 {
        let len = errbuf.iter().position(|&b| b == 0).unwrap_or(0);
        Err(JailError {
            errno: last_errno(),
            errmsg: String::from_utf8_lossy(&errbuf[..len]).into_owned(),
        })
    } else {
        Ok(jid)
    }
}

#[cfg(not(target_os = "freebsd"))]
fn param_call(_params: &mut ParamList, _flags: i32, _set: bool) -> Result<i32, JailError> {
    Err(Errno::NOSYS.into())
}

/// Enter the jail in the current process. There is no way back out.
pub fn jail_attach(jid: i32) -> Result<(), Errno> {
    #[cfg(target_os = "freebsd")]
    {
        // SAFETY: plain integer-argument syscall.
        if unsafe { ffi::jail_attach(jid) } < 0 {
            return Err(last_errno());
        }
        Ok(())
    }
    #[cfg(not(target_os = "freebsd"))]
    {
        let _ = jid;
        Err(Errno::NOSYS)
    }
}

/// Destroy a jail and kill everything inside it.
pub fn jail_remove(jid: i32) -> Result<(), Errno> {
    #[cfg(target_os = "freebsd")]
    {
        // SAFETY: plain integer-argument syscall.
        if unsafe { ffi::jail_remove(jid) } < 0 {
            return Err(last_errno());
        }
        Ok(())
    }
    #[cfg(not(target_os = "freebsd"))]
    {
        let _ = jid;
        Err(Errno::NOSYS)
    }
}

#[cfg(target_os = "freebsd")]
mod ffi {
    extern "C" {
        pub fn jail_set(iov: *mut libc::iovec, niov: libc::c_uint, flags: libc::c_int)
            -> libc::c_int;
        pub fn jail_get(iov: *mut libc::iovec, niov: libc::c_uint, flags: libc::c_int)
            -> libc::c_int;
        pub fn jail_attach(jid: libc::c_int) -> libc::c_int;
        pub fn jail_remove(jid: libc::c_int) -> libc::c_int;
    }
}
