// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Protocol markers tying socket type to endpoint type.

use crate::endpoint::ip::IpEndpoint;
use crate::endpoint::local::LocalEndpoint;
use crate::endpoint::Endpoint;

/// A transport protocol usable with the typed socket facades.
pub trait Protocol: Clone + Copy + Send + Sync + 'static {
    type Endpoint: Endpoint;
    const SOCK_TYPE: libc::c_int;
    const PROTOCOL: libc::c_int;
}

/// TCP over IPv4/IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tcp;

impl Protocol for Tcp {
    type Endpoint = IpEndpoint;
    const SOCK_TYPE: libc::c_int = libc::SOCK_STREAM;
    const PROTOCOL: libc::c_int = 0;
}

/// UDP over IPv4/IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Udp;

impl Protocol for Udp {
    type Endpoint = IpEndpoint;
    const SOCK_TYPE: libc::c_int = libc::SOCK_DGRAM;
    const PROTOCOL: libc::c_int = 0;
}

/// Unix-domain stream sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnixStream;

impl Protocol for UnixStream {
    type Endpoint = LocalEndpoint;
    const SOCK_TYPE: libc::c_int = libc::SOCK_STREAM;
    const PROTOCOL: libc::c_int = 0;
}

/// Unix-domain datagram sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnixDgram;

impl Protocol for UnixDgram {
    type Endpoint = LocalEndpoint;
    const SOCK_TYPE: libc::c_int = libc::SOCK_DGRAM;
    const PROTOCOL: libc::c_int = 0;
}
