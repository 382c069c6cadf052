//! Raw syscall shims for the worker channel.
//!
//! All `unsafe` in the protocol crate is confined here, behind safe
//! wrappers with the retry/termination policies the protocol needs:
//! `EINTR` is retried transparently, `ECONNRESET` is reported as a clean
//! end-of-stream, and anything else surfaces as an `io::Error`.

use std::io;
use std::mem;
use std::os::fd::RawFd;

use tracing::warn;

/// Write all of `buf` to `fd`, retrying on `EINTR`.
///
/// A connection reset is treated as the peer having gone away: the write
/// is abandoned without error, matching the read side reporting EOF.
pub fn write_all(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        // SAFETY: buf points at initialized memory of the given length.
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ECONNRESET) => {
                    warn!(fd, "connection reset while writing to worker");
                    return Ok(());
                }
                _ => return Err(err),
            }
        }
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "worker stream accepted no bytes",
            ));
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

/// Wait until `fd` becomes readable or `timeout_ms` elapses.
pub fn poll_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    loop {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd for the duration of the call.
        let n = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        return Ok(n > 0);
    }
}

/// Receive bytes from `fd`, collecting any file descriptors attached as
/// `SCM_RIGHTS` ancillary data.
///
/// Returns `(0, [])` on end-of-stream (including `ECONNRESET`).
pub fn recv_with_fds(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<RawFd>)> {
    // Aligned control buffer with room for a handful of descriptors.
    let mut control = [0u64; 16];

    // SAFETY: iov/msghdr reference live buffers for the recvmsg call; the
    // control-message walk only dereferences headers inside the kernel-
    // filled region as delimited by CMSG_FIRSTHDR/CMSG_NXTHDR.
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = mem::size_of_val(&control) as _;

        let received = loop {
            let r = libc::recvmsg(fd, &mut msg, 0);
            if r >= 0 {
                break r as usize;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ECONNRESET) => {
                    warn!(fd, "connection reset while reading from worker");
                    return Ok((0, Vec::new()));
                }
                _ => return Err(err),
            }
        };

        let mut fds = Vec::new();
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let payload = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let count = payload / mem::size_of::<libc::c_int>();
                let data = libc::CMSG_DATA(cmsg).cast::<libc::c_int>();
                for i in 0..count {
                    fds.push(std::ptr::read_unaligned(data.add(i)));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
        Ok((received, fds))
    }
}

/// Send bytes over `fd`, optionally attaching one file descriptor as
/// `SCM_RIGHTS` ancillary data. Used by workers (and tests standing in
/// for them) to deliver the `CHLD` descriptor.
pub fn send_with_fd(fd: RawFd, buf: &[u8], pass: Option<RawFd>) -> io::Result<usize> {
    let mut control = [0u64; 8];

    // SAFETY: same discipline as recv_with_fds; the control region is
    // sized by CMSG_SPACE for exactly one descriptor.
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        if let Some(pass) = pass {
            msg.msg_control = control.as_mut_ptr().cast();
            msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<libc::c_int>() as u32) as _;
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::c_int>() as u32) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::c_int>(), pass);
        }

        loop {
            let r = libc::sendmsg(fd, &msg, 0);
            if r >= 0 {
                return Ok(r as usize);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }
}

/// Send `SIGTERM` to a worker process. Best-effort: a pid that is already
/// gone is not an error.
pub fn terminate(pid: i32) {
    // SAFETY: kill with a valid signal number.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

/// Close a raw descriptor, ignoring errors.
pub fn close_fd(fd: RawFd) {
    // SAFETY: fd is owned by the caller and not used after this call.
    unsafe {
        libc::close(fd);
    }
}

/// Install a wait-free `SIGCHLD` policy: terminated workers are reaped by
/// the OS and their exit status discarded. Call once at engine startup.
pub fn ignore_child_exits() {
    // SAFETY: setting a signal disposition to SIG_IGN is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGCHLD, libc::SIG_IGN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn write_all_then_recv() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        write_all(a.as_raw_fd(), b"hello").expect("write");
        let mut buf = [0u8; 16];
        let (n, fds) = recv_with_fds(b.as_raw_fd(), &mut buf).expect("recv");
        assert_eq!(&buf[..n], b"hello");
        assert!(fds.is_empty());
    }

    #[test]
    fn poll_reports_readability() {
        let (mut a, b) = UnixStream::pair().expect("socketpair");
        assert!(!poll_readable(b.as_raw_fd(), 0).expect("poll"));
        a.write_all(b"x").expect("write");
        assert!(poll_readable(b.as_raw_fd(), 1000).expect("poll"));
    }

    #[test]
    fn fd_passes_through_ancillary_data() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        let (payload_tx, mut payload_rx) = UnixStream::pair().expect("socketpair");

        send_with_fd(a.as_raw_fd(), b"CH", Some(payload_tx.as_raw_fd())).expect("send");
        let mut buf = [0u8; 8];
        let (n, fds) = recv_with_fds(b.as_raw_fd(), &mut buf).expect("recv");
        assert_eq!(&buf[..n], b"CH");
        assert_eq!(fds.len(), 1);

        // Prove the received descriptor is live: write through it.
        write_all(fds[0], b"ok").expect("write through passed fd");
        let mut check = [0u8; 2];
        payload_rx.read_exact(&mut check).expect("read");
        assert_eq!(&check, b"ok");
        close_fd(fds[0]);
    }

    #[test]
    fn recv_reports_eof_as_zero() {
        let (a, b) = UnixStream::pair().expect("socketpair");
        drop(a);
        let mut buf = [0u8; 4];
        let (n, fds) = recv_with_fds(b.as_raw_fd(), &mut buf).expect("recv");
        assert_eq!(n, 0);
        assert!(fds.is_empty());
    }
}
