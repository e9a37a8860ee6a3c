//! Readiness masks exchanged with the reactor.

use std::ops::{BitOr, BitOrAssign};

use nix::sys::epoll::EpollFlags;

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

/// Which readiness events a registered fd wants delivered.
///
/// Compose with `|`: `Interest::READ | Interest::WRITE`. An empty interest
/// is valid and means the fd is parked: registered but delivering nothing.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(READABLE);
    pub const WRITE: Interest = Interest(WRITABLE);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub(crate) fn epoll_flags(self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.is_readable() {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.is_writable() {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

/// Readiness reported by one poll for one fd.
///
/// Error and hang-up conditions are folded into both directions so that
/// handlers discover them through their own syscalls.
#[derive(Clone, Copy, Debug)]
pub struct Readiness(u8);

impl Readiness {
    pub(crate) fn from_flags(flags: EpollFlags) -> Self {
        let error = EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP;
        let mut bits = 0;
        if flags.intersects(EpollFlags::EPOLLIN | error) {
            bits |= READABLE;
        }
        if flags.intersects(EpollFlags::EPOLLOUT | error) {
            bits |= WRITABLE;
        }
        Readiness(bits)
    }

    pub fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose() {
        let both = Interest::READ | Interest::WRITE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!Interest::NONE.is_readable());
        assert!(Interest::NONE.is_empty());
        assert!(!both.is_empty());
    }

    #[test]
    fn epoll_flags_mapping() {
        assert_eq!(Interest::READ.epoll_flags(), EpollFlags::EPOLLIN);
        assert_eq!(Interest::WRITE.epoll_flags(), EpollFlags::EPOLLOUT);
        assert_eq!(
            (Interest::READ | Interest::WRITE).epoll_flags(),
            EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT
        );
        assert!(Interest::NONE.epoll_flags().is_empty());
    }

    #[test]
    fn errors_wake_both_directions() {
        let readiness = Readiness::from_flags(EpollFlags::EPOLLERR);
        assert!(readiness.is_readable());
        assert!(readiness.is_writable());

        let readiness = Readiness::from_flags(EpollFlags::EPOLLIN);
        assert!(readiness.is_readable());
        assert!(!readiness.is_writable());
    }
}
