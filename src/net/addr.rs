//! Endpoint keys and name resolution.

use std::ffi::{CStr, CString};
use std::mem;
use std::net::SocketAddr;
use std::ptr;

use socket2::SockAddr;

use crate::error::{Error, Result};

/// Renders `addr` as the canonical key for that endpoint: `A.B.C.D:PORT`
/// for IPv4, `[host]:PORT` for IPv6. The key names the endpoint's journal
/// file, so it must be deterministic: a reconnecting peer with the same
/// ip and port maps to the same file.
pub fn endpoint_key(addr: &SockAddr) -> Result<String> {
    let family = addr.family() as i32;
    let required = match family {
        libc::AF_INET => mem::size_of::<libc::sockaddr_in>(),
        libc::AF_INET6 => mem::size_of::<libc::sockaddr_in6>(),
        other => return Err(Error::UnsupportedFamily(other)),
    };
    if (addr.len() as usize) < required {
        return Err(Error::TruncatedAddress);
    }
    match addr.as_socket() {
        Some(SocketAddr::V4(v4)) => Ok(format!("{}:{}", v4.ip(), v4.port())),
        Some(SocketAddr::V6(v6)) => Ok(format!("[{}]:{}", v6.ip(), v6.port())),
        None => Err(Error::UnsupportedFamily(family)),
    }
}

/// Resolves `node` and `service` to stream socket addresses, with
/// IPv4-mapped results permitted and all matching families returned.
///
/// Returns every resolved address, in resolver order, and fails when the
/// list comes back empty.
pub fn resolve(node: &str, service: &str) -> Result<Vec<SockAddr>> {
    let failure = |reason: String| Error::Resolve {
        node: node.to_owned(),
        service: service.to_owned(),
        reason,
    };
    let c_node =
        CString::new(node).map_err(|_| failure("node contains an interior NUL".to_owned()))?;
    let c_service = CString::new(service)
        .map_err(|_| failure("service contains an interior NUL".to_owned()))?;

    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_flags = libc::AI_V4MAPPED | libc::AI_ALL;
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_STREAM;

    let mut list: *mut libc::addrinfo = ptr::null_mut();
    let rc = unsafe { libc::getaddrinfo(c_node.as_ptr(), c_service.as_ptr(), &hints, &mut list) };
    if rc != 0 {
        return Err(failure(gai_reason(rc)));
    }

    let mut addrs = Vec::new();
    let mut cursor = list;
    while !cursor.is_null() {
        let info = unsafe { &*cursor };
        let len = info.ai_addrlen as usize;
        if !info.ai_addr.is_null() && len <= mem::size_of::<libc::sockaddr_storage>() {
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            unsafe {
                ptr::copy_nonoverlapping(
                    info.ai_addr as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    len,
                );
            }
            addrs.push(unsafe { SockAddr::new(storage, info.ai_addrlen) });
        }
        cursor = info.ai_next;
    }
    unsafe { libc::freeaddrinfo(list) };

    if addrs.is_empty() {
        return Err(failure("no usable addresses".to_owned()));
    }
    Ok(addrs)
}

fn gai_reason(rc: i32) -> String {
    if rc == libc::EAI_SYSTEM {
        return std::io::Error::last_os_error().to_string();
    }
    unsafe { CStr::from_ptr(libc::gai_strerror(rc)) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_key() {
        let addr: SockAddr = "127.0.0.1:54321".parse::<SocketAddr>().unwrap().into();
        assert_eq!(endpoint_key(&addr).unwrap(), "127.0.0.1:54321");
    }

    #[test]
    fn v6_key() {
        let addr: SockAddr = "[::1]:8080".parse::<SocketAddr>().unwrap().into();
        assert_eq!(endpoint_key(&addr).unwrap(), "[::1]:8080");
    }

    #[test]
    fn key_is_deterministic() {
        let addr: SockAddr = "10.1.2.3:7".parse::<SocketAddr>().unwrap().into();
        assert_eq!(endpoint_key(&addr).unwrap(), endpoint_key(&addr).unwrap());
    }

    #[test]
    fn unix_family_is_unsupported() {
        let addr = SockAddr::unix("/tmp/unused.sock").unwrap();
        assert!(matches!(
            endpoint_key(&addr),
            Err(Error::UnsupportedFamily(_))
        ));
    }

    #[test]
    fn short_length_is_truncated() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        storage.ss_family = libc::AF_INET as libc::sa_family_t;
        let addr = unsafe { SockAddr::new(storage, 4) };
        assert!(matches!(endpoint_key(&addr), Err(Error::TruncatedAddress)));
    }

    #[test]
    fn resolve_v4_literal() {
        let addrs = resolve("127.0.0.1", "6001").unwrap();
        let keys: Vec<String> = addrs.iter().map(|a| endpoint_key(a).unwrap()).collect();
        assert!(keys.contains(&"127.0.0.1:6001".to_owned()), "got {keys:?}");
    }

    #[test]
    fn resolve_v6_literal() {
        let addrs = resolve("::1", "6001").unwrap();
        let keys: Vec<String> = addrs.iter().map(|a| endpoint_key(a).unwrap()).collect();
        assert!(keys.contains(&"[::1]:6001".to_owned()), "got {keys:?}");
    }

    #[test]
    fn resolve_failure_is_reported() {
        assert!(matches!(
            resolve("host.invalid.", "6001"),
            Err(Error::Resolve { .. })
        ));
    }
}
