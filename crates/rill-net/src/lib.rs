// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! rill networking layer.
//!
//! Protocol-typed sockets over the rill reactor: stream sockets with
//! epoch-based cancellation, datagram sockets, FIFO-serialized acceptors,
//! endpoint types with native sockaddr round-trips, and stream io helpers.
//!
//! Supported protocols: TCP, UDP, Unix stream, Unix datagram.

pub mod acceptor;
pub mod datagram;
pub mod endpoint;
pub mod io;
pub mod option;
pub mod proto;
pub(crate) mod socket;
pub mod stream;

pub use acceptor::Acceptor;
pub use datagram::DatagramSocket;
pub use endpoint::ip::IpEndpoint;
pub use endpoint::local::LocalEndpoint;
pub use endpoint::{Endpoint, SockAddr};
pub use io::{read_until, with_timeout_read, with_timeout_write, write_all, CancelRead, CancelWrite};
pub use proto::{Protocol, Tcp, UnixDgram, UnixStream, Udp};
pub use stream::{ShutdownHow, StreamSocket};

/// TCP stream socket.
pub type TcpSocket = StreamSocket<Tcp>;
/// TCP acceptor.
pub type TcpAcceptor = Acceptor<Tcp>;
/// UDP socket.
pub type UdpSocket = DatagramSocket<Udp>;
/// Unix-domain stream socket.
pub type UnixStreamSocket = StreamSocket<UnixStream>;
/// Unix-domain stream acceptor.
pub type UnixAcceptor = Acceptor<UnixStream>;
/// Unix-domain datagram socket.
pub type UnixDgramSocket = DatagramSocket<UnixDgram>;
