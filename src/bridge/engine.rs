//! The per-connection bridge state machine.
//!
//! A [`Bridge`] owns the accepted source socket, the dialed destination
//! socket, and one journal per direction. Each dispatch drains whatever the
//! sockets have to offer into the journals, replays the journals to the
//! opposite peers from the tracked cursors, applies half-close bookkeeping,
//! and recomputes both readiness masks. The two directions are independent
//! state machines joined only by the rule that the bridge is destroyed when
//! both are read-closed and drained.

use std::cell::RefCell;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use log::{debug, error};
use nix::errno::Errno;
use nix::sys::socket::{recv, MsgFlags};
use socket2::{SockAddr, Socket};

use crate::cfg::CHUNK_SIZE;
use crate::error::{Error, PeerOp, Result};
use crate::fs::{Journal, JournalStore, Replay};
use crate::io::{EventHandler, Interest, Reactor, Readiness, Token};
use crate::net::addr::endpoint_key;
use crate::net::socket::{dial, shutdown_or_log, take_connect_error};

enum Fate {
    Alive,
    Finished,
}

pub struct Bridge {
    src: Socket,
    dst: Socket,
    src_token: Option<Token>,
    dst_token: Option<Token>,
    src_interest: Interest,
    dst_interest: Interest,
    src_journal: Journal,
    dst_journal: Journal,
    /// Offset of the next source-journal byte not yet delivered downstream.
    src_cursor: u64,
    /// Offset of the next destination-journal byte not yet delivered back.
    dst_cursor: u64,
    connected: bool,
    src_read_closed: bool,
    src_drained: bool,
    dst_read_closed: bool,
    dst_drained: bool,
}

impl Bridge {
    /// Takes ownership of an accepted connection and starts bridging it to
    /// `upstream`: dials the destination without blocking, opens both
    /// journals, and registers with the reactor. On failure everything
    /// acquired so far, the accepted socket included, is released, and the
    /// caller does not retry.
    pub fn start(
        reactor: &mut Reactor,
        src: Socket,
        peer: &SockAddr,
        upstream: &SockAddr,
        store: &JournalStore,
    ) -> Result<()> {
        let (dst, connected) = dial(upstream)?;

        let src_journal = store.open(&endpoint_key(peer)?)?;
        // The destination journal is named after the dialed socket's local
        // endpoint, which stays unique per connection even though every
        // bridge dials the same upstream address.
        let local = dst
            .local_addr()
            .map_err(|source| Error::Connect { source })?;
        let dst_journal = store.open(&endpoint_key(&local)?)?;

        let src_cursor = src_journal.write_offset();
        let dst_cursor = dst_journal.write_offset();
        let src_fd = src.as_raw_fd();
        let dst_fd = dst.as_raw_fd();

        let bridge = Rc::new(RefCell::new(Bridge {
            src,
            dst,
            src_token: None,
            dst_token: None,
            src_interest: Interest::NONE,
            dst_interest: Interest::NONE,
            src_journal,
            dst_journal,
            src_cursor,
            dst_cursor,
            connected,
            src_read_closed: false,
            src_drained: true,
            dst_read_closed: false,
            dst_drained: true,
        }));

        let handler: Rc<RefCell<dyn EventHandler>> = bridge.clone();
        let mut this = bridge.borrow_mut();
        if connected {
            let src_token = reactor.register(src_fd, Interest::READ, Rc::clone(&handler))?;
            this.src_token = Some(src_token);
            this.src_interest = Interest::READ;
            match reactor.register(dst_fd, Interest::READ, handler) {
                Ok(dst_token) => {
                    this.dst_token = Some(dst_token);
                    this.dst_interest = Interest::READ;
                }
                Err(err) => {
                    let _ = reactor.deregister(src_token);
                    return Err(err);
                }
            }
        } else {
            // The source is not watched until the connect completes.
            let dst_token = reactor.register(dst_fd, Interest::WRITE, handler)?;
            this.dst_token = Some(dst_token);
            this.dst_interest = Interest::WRITE;
        }
        Ok(())
    }

    /// Write readiness on a still-connecting destination means the connect
    /// finished, one way or the other.
    fn complete_connect(&mut self, reactor: &mut Reactor) -> Result<Fate> {
        take_connect_error(&self.dst)?;
        self.connected = true;

        let dst_token = self.dst_token.ok_or(Error::Reactor(Errno::ENOENT))?;
        let handler = reactor
            .handler(dst_token)
            .ok_or(Error::Reactor(Errno::ENOENT))?;
        let src_token = reactor.register(self.src.as_raw_fd(), Interest::READ, handler)?;
        self.src_token = Some(src_token);
        self.src_interest = Interest::READ;
        reactor.set_interest(dst_token, Interest::READ)?;
        self.dst_interest = Interest::READ;
        Ok(Fate::Alive)
    }

    /// One full forwarding pass. Runs both directions in a fixed order no
    /// matter which socket woke us: progress on one side routinely unblocks
    /// the other.
    fn dispatch(&mut self, reactor: &mut Reactor) -> Result<Fate> {
        if !self.connected {
            return self.complete_connect(reactor);
        }

        // Source in, source out.
        let mut progressed = 0;
        if !self.src_read_closed {
            let (count, eof) = drain_socket(self.src.as_raw_fd(), &mut self.src_journal)?;
            progressed = count;
            if eof {
                self.src_read_closed = true;
                shutdown_or_log(&self.src, Shutdown::Read, "source for reading");
            }
        }
        if !self.src_drained || progressed > 0 {
            match self
                .src_journal
                .replay(&mut self.src_cursor, self.dst.as_raw_fd())?
            {
                Replay::Drained => {
                    self.src_drained = true;
                    if self.src_read_closed {
                        shutdown_or_log(&self.dst, Shutdown::Write, "destination for writing");
                    }
                }
                Replay::WouldBlock => self.src_drained = false,
            }
        } else if self.src_read_closed {
            // Already drained with nothing new: keep the half-close gate
            // pressed so it happens on the first dispatch where both
            // conditions hold. Repeats are harmless.
            shutdown_or_log(&self.dst, Shutdown::Write, "destination for writing");
        }

        // Destination in, destination out.
        let mut progressed = 0;
        if !self.dst_read_closed {
            let (count, eof) = drain_socket(self.dst.as_raw_fd(), &mut self.dst_journal)?;
            progressed = count;
            if eof {
                self.dst_read_closed = true;
                shutdown_or_log(&self.dst, Shutdown::Read, "destination for reading");
            }
        }
        if !self.dst_drained || progressed > 0 {
            match self
                .dst_journal
                .replay(&mut self.dst_cursor, self.src.as_raw_fd())?
            {
                Replay::Drained => {
                    self.dst_drained = true;
                    if self.dst_read_closed {
                        shutdown_or_log(&self.src, Shutdown::Write, "source for writing");
                    }
                }
                Replay::WouldBlock => self.dst_drained = false,
            }
        } else if self.dst_read_closed {
            shutdown_or_log(&self.src, Shutdown::Write, "source for writing");
        }

        debug_assert!(self.src_cursor <= self.src_journal.write_offset());
        debug_assert!(self.dst_cursor <= self.dst_journal.write_offset());

        self.rearm(reactor)
    }

    /// Recomputes both interest masks from the per-direction flags and
    /// re-arms whichever changed. Both masks empty means there is nothing
    /// left this bridge could ever do.
    fn rearm(&mut self, reactor: &mut Reactor) -> Result<Fate> {
        let (src_interest, dst_interest) = interests_for(
            self.src_read_closed,
            self.src_drained,
            self.dst_read_closed,
            self.dst_drained,
        );
        if src_interest != self.src_interest {
            if let Some(token) = self.src_token {
                reactor.set_interest(token, src_interest)?;
            }
            self.src_interest = src_interest;
        }
        if dst_interest != self.dst_interest {
            if let Some(token) = self.dst_token {
                reactor.set_interest(token, dst_interest)?;
            }
            self.dst_interest = dst_interest;
        }
        if self.src_interest.is_empty() && self.dst_interest.is_empty() {
            return Ok(Fate::Finished);
        }
        Ok(Fate::Alive)
    }

    fn destroy(&mut self, reactor: &mut Reactor) {
        // Sockets and journal handles close when the last reference drops at
        // the end of this dispatch. Journal files stay on disk.
        if let Some(token) = self.src_token.take() {
            if let Err(err) = reactor.deregister(token) {
                debug!("source deregistration failed: {err}");
            }
        }
        if let Some(token) = self.dst_token.take() {
            if let Err(err) = reactor.deregister(token) {
                debug!("destination deregistration failed: {err}");
            }
        }
    }
}

impl EventHandler for Bridge {
    fn ready(&mut self, reactor: &mut Reactor, _token: Token, _readiness: Readiness) {
        match self.dispatch(reactor) {
            Ok(Fate::Alive) => {}
            Ok(Fate::Finished) => self.destroy(reactor),
            Err(err) => {
                error!("bridge failed: {err}");
                self.destroy(reactor);
            }
        }
    }
}

/// Desired readiness masks, per the forwarding state: a socket is read from
/// while its peer keeps sending, and written to while the opposite journal
/// still holds undelivered bytes.
fn interests_for(
    src_read_closed: bool,
    src_drained: bool,
    dst_read_closed: bool,
    dst_drained: bool,
) -> (Interest, Interest) {
    let mut src = Interest::NONE;
    if !src_read_closed {
        src |= Interest::READ;
    }
    if !dst_drained {
        src |= Interest::WRITE;
    }
    let mut dst = Interest::NONE;
    if !dst_read_closed {
        dst |= Interest::READ;
    }
    if !src_drained {
        dst |= Interest::WRITE;
    }
    (src, dst)
}

/// Reads everything currently available from `fd` into `journal`. Returns
/// the byte count and whether the peer signalled end of stream.
fn drain_socket(fd: RawFd, journal: &mut Journal) -> Result<(usize, bool)> {
    let mut buf = [0u8; CHUNK_SIZE];
    let mut count = 0;
    loop {
        match recv(fd, &mut buf, MsgFlags::empty()) {
            Ok(0) => return Ok((count, true)),
            Ok(read) => {
                journal.append(&buf[..read])?;
                count += read;
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return Ok((count, false)),
            Err(errno) => {
                return Err(Error::PeerIo {
                    op: PeerOp::Read,
                    source: errno.into(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_bridge_watches_both_reads() {
        let (src, dst) = interests_for(false, true, false, true);
        assert_eq!(src, Interest::READ);
        assert_eq!(dst, Interest::READ);
    }

    #[test]
    fn undelivered_bytes_keep_the_sink_watched_for_write() {
        // Source hit EOF with bytes still in its journal: the source socket
        // goes quiet while the destination is polled for write room.
        let (src, dst) = interests_for(true, false, false, true);
        assert_eq!(src, Interest::NONE);
        assert_eq!(dst, Interest::READ | Interest::WRITE);
    }

    #[test]
    fn terminal_state_is_two_empty_masks() {
        let (src, dst) = interests_for(true, true, true, true);
        assert!(src.is_empty());
        assert!(dst.is_empty());
    }

    #[test]
    fn half_closed_direction_leaves_the_other_flowing() {
        // Destination finished sending and its journal is delivered; the
        // source keeps talking.
        let (src, dst) = interests_for(false, false, true, true);
        assert_eq!(src, Interest::READ);
        assert_eq!(dst, Interest::WRITE);
    }
}
