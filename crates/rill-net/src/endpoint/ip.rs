// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! IPv4/IPv6 endpoints.
//!
//! Thin wrapper over `std::net::SocketAddr` with exact native sockaddr
//! round-trips (including v6 flowinfo and scope id).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use rill_rt::error::{ErrorKind, Result};

use super::{Endpoint, SockAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpEndpoint(pub SocketAddr);

impl IpEndpoint {
    pub fn new(addr: SocketAddr) -> Self {
        IpEndpoint(addr)
    }

    /// Parse `"ip:port"` (v4) or `"[ip]:port"` (v6).
    pub fn from_string(s: &str) -> Result<Self> {
        s.parse::<SocketAddr>()
            .map(IpEndpoint)
            .map_err(|_| ErrorKind::InvalidEndpoint)
    }

    pub fn ip(&self) -> std::net::IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn is_v4(&self) -> bool {
        self.0.is_ipv4()
    }
}

impl std::fmt::Display for IpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<SocketAddr> for IpEndpoint {
    fn from(addr: SocketAddr) -> Self {
        IpEndpoint(addr)
    }
}

impl Endpoint for IpEndpoint {
    fn family(&self) -> libc::c_int {
        match self.0 {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        }
    }

    fn to_native(&self) -> SockAddr {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = match self.0 {
            SocketAddr::V4(v4) => {
                let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
                std::mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_scope_id = v6.scope_id();
                std::mem::size_of::<libc::sockaddr_in6>()
            }
        };
        unsafe { SockAddr::from_raw(storage, len as libc::socklen_t) }
    }

    fn from_native(addr: &SockAddr) -> Result<Self> {
        match addr.family() {
            libc::AF_INET => {
                if (addr.len() as usize) < std::mem::size_of::<libc::sockaddr_in>() {
                    return Err(ErrorKind::InvalidEndpoint);
                }
                let sin =
                    unsafe { &*(addr.storage() as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                let port = u16::from_be(sin.sin_port);
                Ok(IpEndpoint(SocketAddr::V4(SocketAddrV4::new(ip, port))))
            }
            libc::AF_INET6 => {
                if (addr.len() as usize) < std::mem::size_of::<libc::sockaddr_in6>() {
                    return Err(ErrorKind::InvalidEndpoint);
                }
                let sin6 =
                    unsafe { &*(addr.storage() as *const _ as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                let port = u16::from_be(sin6.sin6_port);
                Ok(IpEndpoint(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    port,
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                ))))
            }
            _ => Err(ErrorKind::UnsupportedAddressFamily),
        }
    }
}
