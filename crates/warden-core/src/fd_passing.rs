//! The descriptor-passing envelope (spec §4.4 strategy 2, §6 "Descriptor-
//! passing envelope"). Uses the kernel's local-socket ancillary-data
//! mechanism (`SCM_RIGHTS`) to ship an array of open descriptors across a
//! `UnixDatagram`/`socketpair`, followed by a textual sentinel.

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

pub const SENTINEL: &[u8] = b"HANDOFF_COMPLETE\n";

/// Reserved descriptor number the new instance finds its end of the
/// handoff socket pair at, advertised to it via `WARDEN_HANDOFF_FD` (spec
/// §6 example value "4").
pub const RESERVED_FD_ENV_VAR: &str = "WARDEN_HANDOFF_FD";

/// Sends `fds` over `sock` as one `SCM_RIGHTS` ancillary message per
/// descriptor, then writes the sentinel as a final plain message.
pub fn send_descriptors(sock: RawFd, fds: &[RawFd]) -> nix::Result<()> {
    let sock = unsafe { BorrowedFd::borrow_raw(sock) };
    for fd in fds {
        let borrowed = unsafe { BorrowedFd::borrow_raw(*fd) };
        let cmsg = [ControlMessage::ScmRights(std::slice::from_ref(&borrowed))];
        let iov = [IoSlice::new(b"fd")];
        sendmsg::<()>(sock.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)?;
    }
    let iov = [IoSlice::new(SENTINEL)];
    sendmsg::<()>(sock.as_raw_fd(), &iov, &[], MsgFlags::empty(), None)?;
    Ok(())
}

/// Receives descriptors from `sock` until the sentinel is observed. Matches
/// spec §6: "the receiver ... must read until sentinel before declaring
/// readiness."
pub fn receive_until_sentinel(sock: RawFd) -> nix::Result<Vec<OwnedFd>> {
    let sock = unsafe { BorrowedFd::borrow_raw(sock) };
    let mut received = Vec::new();
    loop {
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 4]);
        let mut data_buf = [0u8; 64];
        let mut iov = [IoSliceMut::new(&mut data_buf)];
        let msg = recvmsg::<()>(sock.as_raw_fd(), &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())?;

        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                for fd in fds {
                    received.push(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
        }

        let data_len: usize = msg.iovs().map(|s| s.len()).sum();
        if data_buf[..data_len.min(data_buf.len())].windows(SENTINEL.len()).any(|w| w == SENTINEL) {
            return Ok(received);
        }
        if data_len == 0 && received.is_empty() {
            // Peer closed without sending anything: treat as a handoff
            // failure, handled by the caller's timeout/fallback logic.
            return Err(nix::Error::ENOTCONN);
        }
    }
}
