//! Immutable address values.
//!
//! An [`Endpoint`] names one side of a kernel transfer: an IPv4 or IPv6
//! interface and port, a local (UNIX domain) socket path, or the peer
//! credentials of an anonymous local socket. Endpoints render as
//! `[interface]:port` for the numeric families and as the plain path for
//! local sockets, and the numeric forms re-parse to the identical value.

use std::fmt;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::str::FromStr;

/// Address family of an allocation request or endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ip4,
    Ip6,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    V4 { interface: Ipv4Addr, port: u16 },
    V6 { interface: Ipv6Addr, port: u16 },
    Local(PathBuf),
    /// Anonymous local-domain peer identified by credentials.
    Credentials { uid: u32, gid: u32 },
}

impl Endpoint {
    pub fn v4(interface: Ipv4Addr, port: u16) -> Self {
        Endpoint::V4 { interface, port }
    }

    pub fn v6(interface: Ipv6Addr, port: u16) -> Self {
        Endpoint::V6 { interface, port }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Endpoint::Local(path.into())
    }

    pub fn family(&self) -> Family {
        match self {
            Endpoint::V4 { .. } => Family::Ip4,
            Endpoint::V6 { .. } => Family::Ip6,
            Endpoint::Local(_) | Endpoint::Credentials { .. } => Family::Local,
        }
    }

    /// The interface projection: the address without the port.
    pub fn interface(&self) -> String {
        match self {
            Endpoint::V4 { interface, .. } => interface.to_string(),
            Endpoint::V6 { interface, .. } => interface.to_string(),
            Endpoint::Local(path) => path.display().to_string(),
            Endpoint::Credentials { uid, .. } => uid.to_string(),
        }
    }

    /// The port projection; `None` for the local family.
    pub fn port(&self) -> Option<u16> {
        match self {
            Endpoint::V4 { port, .. } | Endpoint::V6 { port, .. } => Some(*port),
            _ => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::V4 { interface, port } => write!(f, "[{interface}]:{port}"),
            Endpoint::V6 { interface, port } => write!(f, "[{interface}]:{port}"),
            Endpoint::Local(path) => write!(f, "{}", path.display()),
            Endpoint::Credentials { uid, gid } => write!(f, "{uid}:{gid}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = std::io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid endpoint");

        if let Some(rest) = s.strip_prefix('[') {
            let (interface, port) = rest.split_once("]:").ok_or_else(invalid)?;
            let port: u16 = port.parse().map_err(|_| invalid())?;
            if let Ok(v4) = interface.parse::<Ipv4Addr>() {
                return Ok(Endpoint::V4 { interface: v4, port });
            }
            let v6 = interface.parse::<Ipv6Addr>().map_err(|_| invalid())?;
            return Ok(Endpoint::V6 { interface: v6, port });
        }

        // Bare `interface:port` for the IPv4 family; anything else is a path.
        if let Some((interface, port)) = s.rsplit_once(':') {
            if let (Ok(v4), Ok(port)) = (interface.parse::<Ipv4Addr>(), port.parse::<u16>()) {
                return Ok(Endpoint::V4 { interface: v4, port });
            }
        }

        if s.is_empty() {
            return Err(invalid());
        }

        Ok(Endpoint::Local(PathBuf::from(s)))
    }
}

/// A ready-to-use socket address for the syscall layer.
pub(crate) struct SockAddr {
    pub(crate) storage: libc::sockaddr_storage,
    pub(crate) len: libc::socklen_t,
}

impl SockAddr {
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const libc::sockaddr_storage as *const libc::sockaddr
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn set_length_field(storage: &mut libc::sockaddr_storage, len: usize) {
    storage.ss_len = len as u8;
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn set_length_field(_storage: &mut libc::sockaddr_storage, _len: usize) {}

impl Endpoint {
    /// Lower the endpoint into kernel form. Credentials have no address.
    pub(crate) fn to_sockaddr(&self) -> Option<SockAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

        let len = match self {
            Endpoint::V4 { interface, port } => {
                let sin = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
                let sin = unsafe { &mut *sin };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = port.to_be();
                sin.sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(interface.octets()),
                };
                mem::size_of::<libc::sockaddr_in>()
            }
            Endpoint::V6 { interface, port } => {
                let sin6 = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
                let sin6 = unsafe { &mut *sin6 };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = port.to_be();
                sin6.sin6_addr.s6_addr = interface.octets();
                mem::size_of::<libc::sockaddr_in6>()
            }
            Endpoint::Local(path) => {
                let sun = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_un;
                let sun = unsafe { &mut *sun };
                sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
                let bytes = path.as_os_str().as_encoded_bytes();
                if bytes.len() >= sun.sun_path.len() {
                    return None;
                }
                for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
                    *dst = *src as libc::c_char;
                }
                mem::size_of::<libc::sockaddr_un>()
            }
            Endpoint::Credentials { .. } => return None,
        };

        set_length_field(&mut storage, len);
        Some(SockAddr {
            storage,
            len: len as libc::socklen_t,
        })
    }

    /// Raise a kernel address into an endpoint.
    pub(crate) fn from_sockaddr(storage: &libc::sockaddr_storage) -> Option<Endpoint> {
        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin = storage as *const libc::sockaddr_storage as *const libc::sockaddr_in;
                let sin = unsafe { &*sin };
                Some(Endpoint::V4 {
                    interface: Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                    port: u16::from_be(sin.sin_port),
                })
            }
            libc::AF_INET6 => {
                let sin6 = storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6;
                let sin6 = unsafe { &*sin6 };
                Some(Endpoint::V6 {
                    interface: Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    port: u16::from_be(sin6.sin6_port),
                })
            }
            libc::AF_UNIX => {
                let sun = storage as *const libc::sockaddr_storage as *const libc::sockaddr_un;
                let sun = unsafe { &*sun };
                if sun.sun_path[0] == 0 {
                    return None;
                }
                let bytes: Vec<u8> = sun
                    .sun_path
                    .iter()
                    .take_while(|c| **c != 0)
                    .map(|c| *c as u8)
                    .collect();
                Some(Endpoint::Local(PathBuf::from(
                    String::from_utf8_lossy(&bytes).into_owned(),
                )))
            }
            _ => None,
        }
    }
}

/// Read an endpoint out of raw, possibly unaligned sockaddr bytes.
pub(crate) fn read_sockaddr(bytes: &[u8]) -> Option<Endpoint> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let take = bytes.len().min(mem::size_of::<libc::sockaddr_storage>());
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            &mut storage as *mut libc::sockaddr_storage as *mut u8,
            take,
        );
    }
    Endpoint::from_sockaddr(&storage)
}

/// Write an endpoint as raw sockaddr bytes; returns the address length.
pub(crate) fn write_sockaddr(endpoint: &Endpoint, out: &mut [u8]) -> Option<usize> {
    let addr = endpoint.to_sockaddr()?;
    let len = addr.len as usize;
    if out.len() < len {
        return None;
    }
    unsafe {
        std::ptr::copy_nonoverlapping(
            &addr.storage as *const libc::sockaddr_storage as *const u8,
            out.as_mut_ptr(),
            len,
        );
    }
    Some(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trips_through_string_form() {
        let endpoint = Endpoint::v4(Ipv4Addr::new(127, 0, 0, 1), 8080);
        let text = endpoint.to_string();
        assert_eq!(text, "[127.0.0.1]:8080");
        assert_eq!(text.parse::<Endpoint>().expect("re-parse"), endpoint);
    }

    #[test]
    fn v6_round_trips_through_string_form() {
        let endpoint = Endpoint::v6(Ipv6Addr::LOCALHOST, 443);
        let text = endpoint.to_string();
        assert_eq!(text, "[::1]:443");
        assert_eq!(text.parse::<Endpoint>().expect("re-parse"), endpoint);
    }

    #[test]
    fn bare_v4_form_is_accepted() {
        let endpoint: Endpoint = "10.0.0.2:53".parse().expect("parse");
        assert_eq!(endpoint, Endpoint::v4(Ipv4Addr::new(10, 0, 0, 2), 53));
    }

    #[test]
    fn local_form_is_a_path() {
        let endpoint: Endpoint = "/tmp/control.sock".parse().expect("parse");
        assert_eq!(endpoint, Endpoint::local("/tmp/control.sock"));
        assert_eq!(endpoint.to_string(), "/tmp/control.sock");
        assert_eq!(endpoint.port(), None);
    }

    #[test]
    fn sockaddr_conversion_round_trips() {
        let endpoint = Endpoint::v4(Ipv4Addr::new(192, 0, 2, 7), 9999);
        let addr = endpoint.to_sockaddr().expect("lower");
        assert_eq!(Endpoint::from_sockaddr(&addr.storage), Some(endpoint));

        let endpoint = Endpoint::v6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1), 7);
        let addr = endpoint.to_sockaddr().expect("lower");
        assert_eq!(Endpoint::from_sockaddr(&addr.storage), Some(endpoint));
    }

    #[test]
    fn raw_sockaddr_bytes_round_trip() {
        let endpoint = Endpoint::v4(Ipv4Addr::new(203, 0, 113, 1), 4096);
        let mut bytes = [0u8; 128];
        let len = write_sockaddr(&endpoint, &mut bytes).expect("write");
        assert!(len >= mem::size_of::<libc::sockaddr_in>());
        assert_eq!(read_sockaddr(&bytes[..len]), Some(endpoint));
    }
}
