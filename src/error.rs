//! Error taxonomy for the bridge.
//!
//! Every failure surfaces as one [`Error`] variant. Only resolution and
//! reactor creation are fatal for the process; everything else terminates a
//! single listener or a single bridge.

use std::fmt;
use std::io;

use nix::errno::Errno;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Which journal operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalOp {
    Open,
    Write,
    Seek,
    Read,
}

impl fmt::Display for JournalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JournalOp::Open => "open",
            JournalOp::Write => "write",
            JournalOp::Seek => "seek",
            JournalOp::Read => "read",
        };
        f.write_str(name)
    }
}

/// Which peer socket operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOp {
    Read,
    Write,
    Accept,
}

impl fmt::Display for PeerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerOp::Read => "read",
            PeerOp::Write => "write",
            PeerOp::Accept => "accept",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Name resolution failed. Fatal at startup.
    #[error("unable to resolve node '{node}' service '{service}': {reason}")]
    Resolve {
        node: String,
        service: String,
        reason: String,
    },

    /// Listener socket setup failed. The affected address is skipped.
    #[error("unable to set up listener on {key}: {source}")]
    ListenerSetup { key: String, source: io::Error },

    /// Upstream connect failed, synchronously or at completion time.
    #[error("unable to establish connection to destination: {source}")]
    Connect { source: io::Error },

    /// A journal file operation failed.
    #[error("unable to {op} journal '{key}': {source}")]
    Journal {
        op: JournalOp,
        key: String,
        source: io::Error,
    },

    /// An unrecoverable read or write on a peer socket.
    #[error("{op} on peer socket failed: {source}")]
    PeerIo { op: PeerOp, source: io::Error },

    /// Address formatter input is neither IPv4 nor IPv6.
    #[error("unsupported address family {0}")]
    UnsupportedFamily(i32),

    /// Address formatter input is shorter than its family requires.
    #[error("socket address is truncated")]
    TruncatedAddress,

    /// An epoll create or control operation failed.
    #[error("reactor failure: {0}")]
    Reactor(Errno),
}

impl Error {
    pub(crate) fn journal(op: JournalOp, key: &str, source: io::Error) -> Self {
        Error::Journal {
            op,
            key: key.to_owned(),
            source,
        }
    }
}
