//! A single-threaded, level-triggered readiness loop over file descriptors.
//!
//! Listeners and bridges register themselves as [`EventHandler`] objects.
//! The reactor keeps one registration per fd in a slab; the slab key plus a
//! generation counter is packed into the epoll user data as a [`Token`], so
//! an event harvested in the same batch as a deregistration can never be
//! delivered to a recycled slot.
//!
//! Setting an empty interest parks the fd: it is removed from epoll (a
//! parked peer must not spin the loop with `EPOLLHUP`) but the registration
//! is kept, and a later non-empty interest re-arms it. The reactor runs
//! until no registrations remain.

use std::cell::RefCell;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollTimeout};

use crate::cfg::MAX_EVENTS_PER_POLL;
use crate::error::{Error, Result};
use crate::io::interest::{Interest, Readiness};

/// Opaque handle to one registration.
///
/// Packs the slab key in the low half and a generation tag in the high half.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Token(u64);

impl Token {
    fn new(key: usize, generation: u32) -> Self {
        Token(((generation as u64) << 32) | key as u64)
    }

    fn key(self) -> usize {
        (self.0 & u32::MAX as u64) as usize
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

/// Receives readiness events for the fds it registered.
///
/// Dispatch is reentrant across handlers but never concurrent for one
/// handler: the reactor is single-threaded and a handler is only entered
/// from the poll loop.
pub trait EventHandler {
    fn ready(&mut self, reactor: &mut Reactor, token: Token, readiness: Readiness);
}

struct Entry {
    fd: RawFd,
    generation: u32,
    interest: Interest,
    armed: bool,
    handler: Rc<RefCell<dyn EventHandler>>,
}

pub struct Reactor {
    epoll: Epoll,
    entries: slab::Slab<Entry>,
    generation: u32,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(Error::Reactor)?;
        Ok(Reactor {
            epoll,
            entries: slab::Slab::new(),
            generation: 0,
        })
    }

    /// Registers `fd` with the given interest. The handler may be shared by
    /// several registrations (a bridge registers both of its sockets with
    /// the same object).
    ///
    /// The caller keeps ownership of the fd and must keep it open until
    /// [`deregister`](Self::deregister).
    pub fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        handler: Rc<RefCell<dyn EventHandler>>,
    ) -> Result<Token> {
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let key = self.entries.insert(Entry {
            fd,
            generation,
            interest,
            armed: false,
            handler,
        });
        let token = Token::new(key, generation);
        if !interest.is_empty() {
            let event = EpollEvent::new(interest.epoll_flags(), token.0);
            if let Err(errno) = self.epoll.add(unsafe { BorrowedFd::borrow_raw(fd) }, event) {
                self.entries.remove(key);
                return Err(Error::Reactor(errno));
            }
            self.entries[key].armed = true;
        }
        Ok(token)
    }

    /// Replaces the interest of a registration. An empty interest parks the
    /// fd; a later non-empty interest re-arms it.
    pub fn set_interest(&mut self, token: Token, interest: Interest) -> Result<()> {
        let entry = match self.entries.get_mut(token.key()) {
            Some(entry) if entry.generation == token.generation() => entry,
            _ => return Err(Error::Reactor(Errno::ENOENT)),
        };
        if entry.interest == interest {
            return Ok(());
        }
        let fd = unsafe { BorrowedFd::borrow_raw(entry.fd) };
        if interest.is_empty() {
            if entry.armed {
                self.epoll.delete(fd).map_err(Error::Reactor)?;
                entry.armed = false;
            }
        } else {
            let mut event = EpollEvent::new(interest.epoll_flags(), token.0);
            if entry.armed {
                self.epoll.modify(fd, &mut event).map_err(Error::Reactor)?;
            } else {
                self.epoll.add(fd, event).map_err(Error::Reactor)?;
                entry.armed = true;
            }
        }
        entry.interest = interest;
        Ok(())
    }

    /// Drops a registration. Stale tokens are ignored, so teardown paths may
    /// deregister unconditionally.
    pub fn deregister(&mut self, token: Token) -> Result<()> {
        match self.entries.get(token.key()) {
            Some(entry) if entry.generation == token.generation() => {}
            _ => return Ok(()),
        }
        let entry = self.entries.remove(token.key());
        if entry.armed {
            self.epoll
                .delete(unsafe { BorrowedFd::borrow_raw(entry.fd) })
                .map_err(Error::Reactor)?;
        }
        Ok(())
    }

    /// The handler behind a live registration.
    pub(crate) fn handler(&self, token: Token) -> Option<Rc<RefCell<dyn EventHandler>>> {
        self.entries
            .get(token.key())
            .filter(|entry| entry.generation == token.generation())
            .map(|entry| Rc::clone(&entry.handler))
    }

    pub fn is_idle(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dispatches readiness events until no registrations remain.
    pub fn run(&mut self) -> Result<()> {
        let mut events = [EpollEvent::empty(); MAX_EVENTS_PER_POLL];
        while !self.entries.is_empty() {
            let fired = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(fired) => fired,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(Error::Reactor(errno)),
            };
            for event in &events[..fired] {
                let token = Token(event.data());
                // A handler dispatched earlier in this batch may have
                // deregistered this token; the generation check drops the
                // stale event.
                let handler = match self.entries.get(token.key()) {
                    Some(entry) if entry.generation == token.generation() => {
                        Rc::clone(&entry.handler)
                    }
                    _ => continue,
                };
                let readiness = Readiness::from_flags(event.events());
                handler.borrow_mut().ready(self, token, readiness);
            }
        }
        Ok(())
    }
}
