//! Descriptor passing over `AF_UNIX` sockets.
//!
//! Two users in the runtime: the create socketpair that coordinates the
//! parent with the prospective container process, and the console socket
//! handoff, where the pty control descriptor travels to an external
//! listener as one byte of payload plus an `SCM_RIGHTS` ancillary message.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use rustix::io::Errno;

use crate::last_errno;

/// Ancillary payload: exactly one descriptor per message.
const FD_LEN: u32 = size_of::<RawFd>() as u32;

fn ancillary_space() -> usize {
    // SAFETY: CMSG_SPACE is a pure size computation.
    unsafe { libc::CMSG_SPACE(FD_LEN) as usize }
}

/// A zeroed buffer big enough for one fd's worth of control data.
///
/// Built from `cmsghdr` elements so the kernel sees properly aligned
/// headers no matter how CMSG_SPACE rounds.
fn ancillary_buf() -> Vec<libc::cmsghdr> {
    let elems = ancillary_space().div_ceil(size_of::<libc::cmsghdr>());
    // SAFETY: cmsghdr is plain old data; all-zeroes is a valid value.
    vec![unsafe { std::mem::zeroed() }; elems]
}

fn message_for(payload: &mut [u8; 1], control: &mut [libc::cmsghdr]) -> (libc::iovec, libc::msghdr) {
    let iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };
    // SAFETY: all-zeroes is the documented "no options" msghdr; the
    // caller wires up iov and control before use.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = ancillary_space() as _;
    (iov, msg)
}

/// Create an `AF_UNIX SOCK_STREAM` socketpair.
///
/// Returns `(parent_sock, child_sock)`. After fork, each side closes the
/// end it does not use.
pub fn create_socketpair() -> Result<(OwnedFd, OwnedFd), Errno> {
    let mut pair = [-1 as libc::c_int; 2];
    // SAFETY: socketpair fills the two-element array on success.
    let ret = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            pair.as_mut_ptr(),
        )
    };
    if ret < 0 {
        return Err(last_errno());
    }
    // SAFETY: both descriptors are valid and owned by nobody else yet.
    Ok(unsafe { (OwnedFd::from_raw_fd(pair[0]), OwnedFd::from_raw_fd(pair[1])) })
}

/// Send one byte of payload and `fd` as an `SCM_RIGHTS` message.
pub fn send_fd(socket: RawFd, fd: RawFd) -> Result<(), Errno> {
    let mut payload = [0u8; 1];
    let mut control = ancillary_buf();
    let (mut iov, mut msg) = message_for(&mut payload, &mut control);
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    // SAFETY: the first header lies within `control`, which is sized for
    // one descriptor; CMSG_DATA may be unaligned, hence write_unaligned.
    unsafe {
        let hdr = libc::CMSG_FIRSTHDR(&msg);
        if hdr.is_null() {
            return Err(Errno::INVAL);
        }
        (*hdr).cmsg_len = libc::CMSG_LEN(FD_LEN) as _;
        (*hdr).cmsg_level = libc::SOL_SOCKET;
        (*hdr).cmsg_type = libc::SCM_RIGHTS;
        libc::CMSG_DATA(hdr).cast::<RawFd>().write_unaligned(fd);
    }

    // SAFETY: msg points at live buffers for the duration of the call.
    match unsafe { libc::sendmsg(socket, &msg, 0) } {
        1 => Ok(()),
        n if n < 0 => Err(last_errno()),
        // Anything but the single payload byte means the handoff failed.
        _ => Err(Errno::IO),
    }
}

/// Receive a descriptor sent with [`send_fd`].
pub fn recv_fd(socket: RawFd) -> Result<OwnedFd, Errno> {
    let mut payload = [0u8; 1];
    let mut control = ancillary_buf();
    let (mut iov, mut msg) = message_for(&mut payload, &mut control);
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    // SAFETY: msg points at live buffers for the duration of the call.
    if unsafe { libc::recvmsg(socket, &mut msg, 0) } < 0 {
        return Err(last_errno());
    }

    // SAFETY: on success the kernel filled `control`; the header and its
    // data pointer stay inside that buffer.
    unsafe {
        let hdr = libc::CMSG_FIRSTHDR(&msg);
        if hdr.is_null()
            || (*hdr).cmsg_level != libc::SOL_SOCKET
            || (*hdr).cmsg_type != libc::SCM_RIGHTS
        {
            return Err(Errno::BADMSG);
        }
        let fd = libc::CMSG_DATA(hdr).cast::<RawFd>().read_unaligned();
        Ok(OwnedFd::from_raw_fd(fd))
    }
}

/// Connect to a local stream socket.
///
/// On FreeBSD this opens the socket's parent directory and uses
/// `connectat(2)` so paths longer than `sun_path` still work.
pub fn connect_unix(path: &Path) -> Result<OwnedFd, Errno> {
    #[cfg(target_os = "freebsd")]
    {
        use std::ffi::CString;
        use std::os::fd::AsRawFd;
        use std::os::unix::ffi::OsStrExt;

        let dir = path.parent().unwrap_or(Path::new("."));
        let name = path.file_name().ok_or(Errno::INVAL)?.as_bytes();

        // SAFETY: plain socket creation.
        let sock = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if sock < 0 {
            return Err(last_errno());
        }
        // SAFETY: sock is a valid descriptor from socket().
        let sock = unsafe { OwnedFd::from_raw_fd(sock) };

        let dir_c = CString::new(dir.as_os_str().as_bytes()).map_err(|_| Errno::INVAL)?;
        // SAFETY: dir_c is a valid NUL-terminated path.
        let dir_fd = unsafe { libc::open(dir_c.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        if dir_fd < 0 {
            return Err(last_errno());
        }
        // SAFETY: dir_fd is a freshly opened descriptor.
        let dir_fd = unsafe { OwnedFd::from_raw_fd(dir_fd) };

        // SAFETY: zeroed sockaddr_un is a valid all-defaults value.
        let mut sun: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        if name.len() >= sun.sun_path.len() {
            return Err(Errno::NAMETOOLONG);
        }
        sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
        sun.sun_len = (name.len() + 1) as u8;
        for (dst, src) in sun.sun_path.iter_mut().zip(name) {
            *dst = *src as libc::c_char;
        }

        // SAFETY: sun is initialized; dir_fd and sock are live descriptors.
        let ret = unsafe {
            ffi::connectat(
                dir_fd.as_raw_fd(),
                sock.as_raw_fd(),
                (&sun as *const libc::sockaddr_un).cast::<libc::sockaddr>(),
                size_of::<libc::sockaddr_un>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(last_errno());
        }
        Ok(sock)
    }
    #[cfg(not(target_os = "freebsd"))]
    {
        std::os::unix::net::UnixStream::connect(path)
            .map(OwnedFd::from)
            .map_err(|e| Errno::from_raw_os_error(e.raw_os_error().unwrap_or(0)))
    }
}

#[cfg(target_os = "freebsd")]
mod ffi {
    extern "C" {
        pub fn connectat(
            fd: libc::c_int,
            s: libc::c_int,
            name: *const libc::sockaddr,
            namelen: libc::socklen_t,
        ) -> libc::c_int;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn socketpair_creation() {
        let (a, b) = create_socketpair().unwrap();
        assert!(a.as_raw_fd() >= 0);
        assert_ne!(a.as_raw_fd(), b.as_raw_fd());
    }

    #[test]
    fn ancillary_buf_is_large_enough() {
        let buf = ancillary_buf();
        assert!(buf.len() * size_of::<libc::cmsghdr>() >= ancillary_space());
    }

    #[test]
    fn send_recv_fd_roundtrip() {
        let (parent, child) = create_socketpair().unwrap();

        let mut pipe_fds = [0i32; 2];
        // SAFETY: pipe writes two descriptors into the array.
        assert_eq!(unsafe { libc::pipe(pipe_fds.as_mut_ptr()) }, 0);
        // SAFETY: both ends are valid and owned from here on.
        let (pipe_read, _pipe_write) = unsafe {
            (
                OwnedFd::from_raw_fd(pipe_fds[0]),
                OwnedFd::from_raw_fd(pipe_fds[1]),
            )
        };

        send_fd(child.as_raw_fd(), pipe_read.as_raw_fd()).unwrap();
        let received = recv_fd(parent.as_raw_fd()).unwrap();
        assert!(received.as_raw_fd() >= 0);
        assert_ne!(received.as_raw_fd(), pipe_read.as_raw_fd());
    }

    #[test]
    fn recv_without_ancillary_data_is_rejected() {
        let (parent, child) = create_socketpair().unwrap();
        // A plain byte with no control message attached.
        // SAFETY: writing one byte from a live buffer to a live socket.
        let n = unsafe { libc::write(child.as_raw_fd(), [7u8].as_ptr().cast(), 1) };
        assert_eq!(n, 1);
        assert_eq!(recv_fd(parent.as_raw_fd()).unwrap_err(), Errno::BADMSG);
    }

    #[test]
    fn connect_unix_to_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let fd = connect_unix(&path).unwrap();
        assert!(fd.as_raw_fd() >= 0);
    }

    #[test]
    fn connect_unix_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = connect_unix(&dir.path().join("absent.sock")).unwrap_err();
        assert_ne!(err, Errno::INVAL);
    }
}
