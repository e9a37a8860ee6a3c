//! Non-blocking socket helpers shared by the acceptor and the bridge.

use std::net::Shutdown;
use std::os::fd::{FromRawFd, RawFd};

use log::debug;
use nix::errno::Errno;
use nix::sys::socket::{accept4, SockFlag};
use socket2::{SockAddr, Socket, Type};

use crate::error::{Error, PeerOp, Result};

/// Starts a non-blocking connect to `addr`. Returns the socket and whether
/// the connect completed synchronously; if it did not, completion is
/// reported later through write readiness and read with
/// [`take_connect_error`].
pub fn dial(addr: &SockAddr) -> Result<(Socket, bool)> {
    let connect = |source| Error::Connect { source };
    let socket = Socket::new(addr.domain(), Type::STREAM, None).map_err(connect)?;
    socket.set_nonblocking(true).map_err(connect)?;
    match socket.connect(addr) {
        Ok(()) => Ok((socket, true)),
        // An interrupted connect keeps completing in the background, the
        // same as an in-progress one.
        Err(err) if matches!(err.raw_os_error(), Some(libc::EINPROGRESS) | Some(libc::EINTR)) => {
            Ok((socket, false))
        }
        Err(source) => Err(Error::Connect { source }),
    }
}

/// Reads the completion status of a pending connect on `socket`.
pub fn take_connect_error(socket: &Socket) -> Result<()> {
    match socket.take_error() {
        Ok(None) => Ok(()),
        Ok(Some(source)) | Err(source) => Err(Error::Connect { source }),
    }
}

/// Accepts one pending connection from `listener`, non-blocking and
/// close-on-exec, together with the peer's address. Returns `None` when
/// the accept queue is empty.
pub fn accept_pending(listener: RawFd) -> Result<Option<(Socket, SockAddr)>> {
    let fd = loop {
        match accept4(listener, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
            Ok(fd) => break fd,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return Ok(None),
            Err(errno) => {
                return Err(Error::PeerIo {
                    op: PeerOp::Accept,
                    source: errno.into(),
                })
            }
        }
    };
    let socket = unsafe { Socket::from_raw_fd(fd) };
    let peer = socket.peer_addr().map_err(|source| Error::PeerIo {
        op: PeerOp::Accept,
        source,
    })?;
    Ok(Some((socket, peer)))
}

/// Half-closes `socket`. Failures are expected once the peer is fully gone
/// and are only logged.
pub fn shutdown_or_log(socket: &Socket, how: Shutdown, what: &str) {
    if let Err(err) = socket.shutdown(how) {
        debug!("unable to shut down {what}: {err}");
    }
}
