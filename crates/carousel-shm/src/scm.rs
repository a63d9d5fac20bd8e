//! `SCM_RIGHTS` descriptor passing over Unix sockets.
//!
//! The wheel's memfd and eventfds only mean something inside the file table
//! of the process that opened them. To hand them to the peer they travel as
//! ancillary data on a Unix socket; the kernel installs fresh descriptor
//! numbers on the receiving side.
//!
//! Each message carries at least one byte of ordinary data so that a
//! zero-length read cannot be mistaken for end-of-stream; callers usually
//! use that byte (or more) as a handshake payload.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

/// Most descriptors accepted in a single message. The kernel limit is far
/// higher (`SCM_MAX_FD`, 253); this keeps the ancillary buffer small and is
/// plenty for a memfd plus two eventfds.
pub const MAX_FDS: usize = 16;

/// Ancillary buffer sized and aligned for [`MAX_FDS`] descriptors.
#[repr(C)]
union CmsgBuf {
    buf: [u8; 128],
    _align: libc::cmsghdr,
}

const _: () = assert!(mem::size_of::<CmsgBuf>() >= mem::size_of::<libc::cmsghdr>() + MAX_FDS * 4);

/// Send `data` with `fds` attached as `SCM_RIGHTS` ancillary payload.
///
/// Returns the number of data bytes sent. `data` must be non-empty and at
/// most [`MAX_FDS`] descriptors may be attached.
pub fn send_fds_with_data(
    sock: BorrowedFd<'_>,
    fds: &[BorrowedFd<'_>],
    data: &[u8],
) -> io::Result<usize> {
    if fds.len() > MAX_FDS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "too many descriptors for one message",
        ));
    }
    if data.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "descriptor messages need at least one data byte",
        ));
    }

    let raw_fds: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let fd_bytes = mem::size_of_val(raw_fds.as_slice());

    // SAFETY: zeroed cmsghdr/iovec/msghdr are valid initial states.
    let mut scm: CmsgBuf = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    if !raw_fds.is_empty() {
        // SAFETY: the union buffer outlives msg and is cmsghdr-aligned.
        msg.msg_control = unsafe { scm.buf.as_mut_ptr() } as *mut libc::c_void;
        // SAFETY: CMSG_SPACE is a pure size computation.
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;

        // SAFETY: msg_control points at a buffer large enough for one header
        // plus fd_bytes of data (asserted above).
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as usize;
            ptr::copy_nonoverlapping(
                raw_fds.as_ptr() as *const u8,
                libc::CMSG_DATA(cmsg),
                fd_bytes,
            );
        }
    }

    loop {
        // SAFETY: msg and everything it points at stay alive for the call.
        let n = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, 0) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Receive a message into `buf`, collecting any attached descriptors.
///
/// Returns the received descriptors (in sending order) and the number of
/// data bytes read. Descriptors beyond [`MAX_FDS`] are truncated by the
/// kernel; any the caller does not keep close when the `Vec` drops.
pub fn recv_fds_with_data(
    sock: BorrowedFd<'_>,
    buf: &mut [u8],
) -> io::Result<(Vec<OwnedFd>, usize)> {
    // SAFETY: zeroed cmsghdr/iovec/msghdr are valid initial states.
    let mut scm: CmsgBuf = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    // SAFETY: the union buffer outlives msg and is cmsghdr-aligned.
    msg.msg_control = unsafe { scm.buf.as_mut_ptr() } as *mut libc::c_void;
    msg.msg_controllen = mem::size_of::<CmsgBuf>();

    let n = loop {
        // SAFETY: msg and everything it points at stay alive for the call.
        let n = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, 0) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    let mut fds = Vec::new();
    // SAFETY: msg was filled in by a successful recvmsg; CMSG_* walk the
    // control buffer it points at.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let payload = (*cmsg).cmsg_len - libc::CMSG_LEN(0) as usize;
                let count = payload / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..count {
                    // The kernel installed these descriptors into our file
                    // table; we own them from here on.
                    fds.push(OwnedFd::from_raw_fd(data.add(i).read_unaligned()));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((fds, n))
}

/// Send a single descriptor with a one-byte placeholder payload.
pub fn send_fd(sock: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> io::Result<()> {
    send_fds_with_data(sock, &[fd], b"?").map(|_| ())
}

/// Receive a single descriptor, discarding the placeholder payload.
pub fn recv_fd(sock: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    let mut byte = [0u8; 1];
    let (mut fds, _) = recv_fds_with_data(sock, &mut byte)?;
    if fds.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message carried no descriptor",
        ));
    }
    Ok(fds.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SharedRegion;
    use std::io::{Read, Write};
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn passes_a_pipe_end() {
        let (left, right) = UnixStream::pair().unwrap();

        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds is valid for two ints.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        // SAFETY: pipe succeeded; we own both ends.
        let (read_end, write_end) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        send_fd(left.as_fd(), read_end.as_fd()).unwrap();
        drop(read_end);

        let received = recv_fd(right.as_fd()).unwrap();

        // Write through the original end, read through the received one.
        let mut wfile = std::fs::File::from(write_end);
        wfile.write_all(b"ding").unwrap();
        drop(wfile);

        let mut rfile = std::fs::File::from(received);
        let mut got = Vec::new();
        rfile.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"ding");
    }

    #[test]
    fn passes_memfd_with_handshake() {
        let (left, right) = UnixStream::pair().unwrap();

        let region = SharedRegion::create("scm-test", 8192).unwrap();
        // SAFETY: exclusive mapping.
        unsafe { region.as_mut_ptr().write(0x77) };

        let handshake = 8192u64.to_le_bytes();
        send_fds_with_data(left.as_fd(), &[region.memfd()], &handshake).unwrap();

        let mut buf = [0u8; 8];
        let (mut fds, n) = recv_fds_with_data(right.as_fd(), &mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(fds.len(), 1);
        let len = u64::from_le_bytes(buf) as usize;

        let peer = SharedRegion::from_fd(fds.remove(0), len).unwrap();
        // SAFETY: mapping of the same file the sender wrote to.
        assert_eq!(unsafe { peer.as_mut_ptr().read() }, 0x77);
    }

    #[test]
    fn rejects_empty_payload() {
        let (left, _right) = UnixStream::pair().unwrap();
        assert!(send_fds_with_data(left.as_fd(), &[], b"").is_err());
    }
}
