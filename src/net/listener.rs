//! Listener socket setup.

use log::warn;
use socket2::{SockAddr, Socket, Type};

use crate::cfg::BACKLOG;
use crate::error::{Error, Result};

/// Creates a bound, listening, non-blocking stream socket for `addr`.
/// Close-on-exec is set at creation. A failure to make the address
/// reusable is logged and tolerated, matching the rest of the setup only
/// loosely caring about fast rebinds.
pub fn bind_listener(addr: &SockAddr, key: &str) -> Result<Socket> {
    let setup = |source| Error::ListenerSetup {
        key: key.to_owned(),
        source,
    };
    let socket = Socket::new(addr.domain(), Type::STREAM, None).map_err(setup)?;
    socket.set_nonblocking(true).map_err(setup)?;
    if let Err(err) = socket.set_reuse_address(true) {
        warn!("unable to make listener socket for {key} reusable: {err}");
    }
    socket.bind(addr).map_err(setup)?;
    socket.listen(BACKLOG).map_err(setup)?;
    Ok(socket)
}
