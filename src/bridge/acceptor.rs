//! The accept loop, one handler per listener.

use std::cell::RefCell;
use std::os::fd::AsRawFd;
use std::rc::Rc;

use log::{error, warn};
use socket2::{SockAddr, Socket};

use crate::bridge::engine::Bridge;
use crate::error::{Error, Result};
use crate::fs::JournalStore;
use crate::io::{EventHandler, Interest, Reactor, Readiness, Token};
use crate::net::addr::endpoint_key;
use crate::net::listener::bind_listener;
use crate::net::socket::accept_pending;

/// Owns one listening socket and starts a bridge per accepted connection.
pub struct Acceptor {
    listener: Socket,
    key: String,
    upstream: SockAddr,
    store: JournalStore,
}

impl Acceptor {
    /// Binds `addr`, announces it on stdout, and registers the accept loop
    /// with the reactor. Returns the bound address, which differs from
    /// `addr` when the requested port was zero.
    pub fn start(
        reactor: &mut Reactor,
        addr: &SockAddr,
        upstream: SockAddr,
        store: JournalStore,
    ) -> Result<SockAddr> {
        let key = endpoint_key(addr)?;
        let listener = bind_listener(addr, &key)?;
        let local = listener
            .local_addr()
            .map_err(|source| Error::ListenerSetup {
                key: key.clone(),
                source,
            })?;
        let fd = listener.as_raw_fd();
        let acceptor = Rc::new(RefCell::new(Acceptor {
            listener,
            key: key.clone(),
            upstream,
            store,
        }));
        reactor.register(fd, Interest::READ, acceptor)?;
        println!("Listener {fd} listening on {key}");
        Ok(local)
    }
}

impl EventHandler for Acceptor {
    fn ready(&mut self, reactor: &mut Reactor, _token: Token, _readiness: Readiness) {
        // Take everything already pending; the queue refills under level
        // triggering. Accept failures end the dispatch but never the
        // listener, and a bridge that fails to start only costs its own
        // connection.
        loop {
            let (socket, peer) = match accept_pending(self.listener.as_raw_fd()) {
                Ok(Some(pair)) => pair,
                Ok(None) => return,
                Err(err) => {
                    warn!("accept on {} failed: {err}", self.key);
                    return;
                }
            };
            if let Err(err) = Bridge::start(reactor, socket, &peer, &self.upstream, &self.store) {
                error!("unable to start bridge on {}: {err}", self.key);
            }
        }
    }
}
