//! Framed transport: one [`wire::Message`] plus at most one file descriptor
//! per `send`/`recv` call, carried over a connected stream-oriented local
//! socket using ancillary data (`SCM_RIGHTS`).
//!
//! Grounded on the `nix::sys::socket::{sendmsg, recvmsg}` + `ScmRights`
//! pattern used for descriptor passing over a Unix domain socket elsewhere
//! in the retrieved pack (an async datagram variant); here it is adapted to
//! a synchronous, stream-oriented, single-descriptor transfer, matching
//! this system's single-threaded, blocking concurrency model.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, recvmsg, sendmsg,
};

use crate::error::EscrowError;
use crate::wire::{MAX_MESSAGE_SIZE, Message};

/// Sends one frame, attaching `fd` as a single `SCM_RIGHTS` control message
/// when present. Emitted as a single `sendmsg` call, so the frame reaches
/// the peer atomically with respect to other frames on the same socket.
pub fn send_frame(
    stream: &UnixStream,
    msg: &Message,
    fd: Option<BorrowedFd<'_>>,
) -> Result<(), EscrowError> {
    let bytes = msg.encode();
    let iov = [IoSlice::new(&bytes)];
    let raw: [RawFd; 1];
    let cmsgs: Vec<ControlMessage> = match fd {
        Some(fd) => {
            raw = [fd.as_raw_fd()];
            vec![ControlMessage::ScmRights(&raw)]
        }
        None => Vec::new(),
    };
    sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None)
        .map_err(EscrowError::from)?;
    Ok(())
}

/// Receives one frame. Returns `Ok((message, None))` when no ancillary data
/// was attached, `Ok((message, Some(fd)))` when exactly one descriptor was,
/// `Err(EscrowError::PeerShutdown)` on a zero-length receive, and
/// `Err(EscrowError::Protocol(_))` if the ancillary data is anything other
/// than exactly one `SCM_RIGHTS` descriptor.
pub fn recv_frame(stream: &UnixStream) -> Result<(Message, Option<OwnedFd>), EscrowError> {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);

    let recv = recvmsg::<UnixAddr>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )
    .map_err(EscrowError::from)?;

    if recv.bytes == 0 {
        return Err(EscrowError::PeerShutdown);
    }

    let mut fd_out: Option<OwnedFd> = None;
    for cmsg in recv.cmsgs().map_err(EscrowError::from)? {
        match cmsg {
            ControlMessageOwned::ScmRights(fds) if fds.len() == 1 => {
                // SAFETY: the kernel just handed us ownership of this
                // descriptor via SCM_RIGHTS; nothing else in the process
                // holds it yet.
                fd_out = Some(unsafe { OwnedFd::from_raw_fd(fds[0]) });
            }
            _ => {
                return Err(EscrowError::Protocol(
                    "expected exactly one SCM_RIGHTS descriptor".into(),
                ));
            }
        }
    }

    let message = Message::decode(&buf[..recv.bytes])
        .map_err(|e| EscrowError::Protocol(e.to_string()))?;
    Ok((message, fd_out))
}

/// Duplicates an owned descriptor without consuming the original, so a
/// daemon-held descriptor can be handed out on `GET` while the daemon keeps
/// its own copy open. `OwnedFd` has no public `dup` of its own, so this
/// borrows the `File` wrapper's `try_clone` for the underlying `dup(2)`
/// call and unwraps it back to a bare `OwnedFd`.
pub fn dup(fd: &OwnedFd) -> io::Result<OwnedFd> {
    use std::fs::File;
    let borrowed = std::mem::ManuallyDrop::new(unsafe { File::from_raw_fd(fd.as_raw_fd()) });
    let cloned = borrowed.try_clone()?;
    Ok(OwnedFd::from(cloned))
}
