//! connbridge is a journaling TCP connection bridge.
//!
//! Every accepted client connection is spliced to a freshly dialed upstream
//! endpoint. Bytes are forwarded in both directions until both
//! half-connections are closed, and each direction's stream is appended to a
//! per-endpoint journal file on the way through. The journal doubles as the
//! transfer buffer: forwarding re-reads the file from a tracked replay
//! offset, so no per-connection memory scales with bytes transferred, and a
//! complete forensic record of the stream is left on disk.
//!
//! All I/O is non-blocking and driven by a single-threaded level-triggered
//! [`Reactor`](io::Reactor).

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("connbridge drives epoll directly and only builds on Linux");
    }
}

pub mod bridge;
pub mod cfg;
pub mod error;
pub mod fs;
pub mod io;
pub mod net;

pub use error::{Error, Result};
