// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Datagram-socket state machine.
//!
//! States: idle (open, no local address), bound (explicit local address),
//! connected (fixed peer). Send and receive are independent; each allows
//! one in-flight operation.

use std::sync::Mutex;

use rill_rt::error::{ErrorKind, Result};
use rill_rt::executor::IoExecutor;

use crate::endpoint::SockAddr;
use crate::option::SocketOption;
use crate::socket::base::SocketBase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DgramState {
    Idle,
    Bound,
    Connected,
}

struct DgramInner {
    state: DgramState,
    send_in_flight: bool,
    recv_in_flight: bool,
    peer: Option<SockAddr>,
}

enum Flight {
    Send,
    Recv,
}

struct InFlightGuard<'a> {
    st: &'a Mutex<DgramInner>,
    which: Flight,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.st.lock().unwrap();
        match self.which {
            Flight::Send => st.send_in_flight = false,
            Flight::Recv => st.recv_in_flight = false,
        }
    }
}

pub(crate) struct DatagramSocketImpl {
    base: SocketBase,
    st: Mutex<DgramInner>,
}

impl DatagramSocketImpl {
    pub(crate) fn new(ex: IoExecutor) -> Self {
        DatagramSocketImpl {
            base: SocketBase::new(ex),
            st: Mutex::new(DgramInner {
                state: DgramState::Idle,
                send_in_flight: false,
                recv_in_flight: false,
                peer: None,
            }),
        }
    }

    pub(crate) fn executor(&self) -> &IoExecutor {
        self.base.executor()
    }

    pub(crate) fn native_handle(&self) -> i32 {
        self.base.native_handle()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.base.is_open()
    }

    pub(crate) fn is_bound(&self) -> bool {
        let st = self.st.lock().unwrap();
        matches!(st.state, DgramState::Bound | DgramState::Connected)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.st.lock().unwrap().state == DgramState::Connected
    }

    pub(crate) fn open(&self, family: i32, ty: i32, protocol: i32) -> Result<()> {
        self.base.open(family, ty, protocol)
    }

    fn ensure_open(&self, family: i32) -> Result<()> {
        if self.base.is_open() {
            return Ok(());
        }
        self.base.open(family, libc::SOCK_DGRAM, 0)
    }

    pub(crate) fn bind(&self, addr: &SockAddr) -> Result<()> {
        self.ensure_open(addr.family())?;
        let ret = unsafe { libc::bind(self.base.native_handle(), addr.as_ptr(), addr.len()) };
        if ret != 0 {
            return Err(ErrorKind::last_os_error());
        }
        let mut st = self.st.lock().unwrap();
        if st.state == DgramState::Idle {
            st.state = DgramState::Bound;
        }
        Ok(())
    }

    /// Fix the peer. Synchronous for datagram sockets.
    pub(crate) fn connect(&self, addr: &SockAddr) -> Result<()> {
        self.ensure_open(addr.family())?;
        let ret =
            unsafe { libc::connect(self.base.native_handle(), addr.as_ptr(), addr.len()) };
        if ret != 0 {
            return Err(ErrorKind::last_os_error());
        }
        let mut st = self.st.lock().unwrap();
        st.state = DgramState::Connected;
        st.peer = Some(*addr);
        Ok(())
    }

    /// Send one datagram.
    ///
    /// Connected sockets require `dest` to match the fixed peer bitwise, or
    /// to be `None`. An empty buffer sends nothing and returns 0.
    pub(crate) async fn send_to(&self, buf: &[u8], dest: Option<&SockAddr>) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.base.is_open() {
            return Err(ErrorKind::NotOpen);
        }

        // `None` target = connected-mode send(); `Some` = sendto().
        let target: Option<SockAddr> = {
            let mut st = self.st.lock().unwrap();
            if st.send_in_flight {
                return Err(ErrorKind::Busy);
            }
            let target = if st.state == DgramState::Connected {
                if let Some(d) = dest {
                    match &st.peer {
                        Some(peer) if peer == d => {}
                        _ => return Err(ErrorKind::InvalidArgument),
                    }
                }
                None
            } else {
                match dest {
                    Some(d) => Some(*d),
                    None => return Err(ErrorKind::InvalidArgument),
                }
            };
            st.send_in_flight = true;
            target
        };
        let _guard = InFlightGuard {
            st: &self.st,
            which: Flight::Send,
        };

        loop {
            let fd = self.base.native_handle();
            if fd < 0 {
                return Err(ErrorKind::NotOpen);
            }
            let n = match &target {
                None => unsafe {
                    libc::send(
                        fd,
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                        libc::MSG_NOSIGNAL,
                    )
                },
                Some(d) => unsafe {
                    libc::sendto(
                        fd,
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                        libc::MSG_NOSIGNAL,
                        d.as_ptr(),
                        d.len(),
                    )
                },
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            match errno {
                libc::EINTR => continue,
                libc::EAGAIN => self.base.wait_writable().await?,
                libc::EMSGSIZE => return Err(ErrorKind::MessageSize),
                other => return Err(ErrorKind::from_errno(other)),
            }
        }
    }

    /// Receive one datagram plus its source address.
    ///
    /// The socket must be bound or connected. A datagram larger than `buf`
    /// is detected via `MSG_TRUNC` and reported as `MessageSize` (the
    /// truncated payload is dropped). An empty buffer is rejected.
    pub(crate) async fn receive_from(&self, buf: &mut [u8]) -> Result<(usize, SockAddr)> {
        if !self.base.is_open() {
            return Err(ErrorKind::NotOpen);
        }
        if buf.is_empty() {
            return Err(ErrorKind::InvalidArgument);
        }
        {
            let mut st = self.st.lock().unwrap();
            if st.state == DgramState::Idle {
                return Err(ErrorKind::NotBound);
            }
            if st.recv_in_flight {
                return Err(ErrorKind::Busy);
            }
            st.recv_in_flight = true;
        }
        let _guard = InFlightGuard {
            st: &self.st,
            which: Flight::Recv,
        };

        loop {
            let fd = self.base.native_handle();
            if fd < 0 {
                return Err(ErrorKind::NotOpen);
            }
            let mut src = SockAddr::zeroed();
            let mut len = src.len();
            // MSG_TRUNC makes recvfrom return the real datagram size even
            // when it exceeds the buffer (Linux).
            let n = unsafe {
                libc::recvfrom(
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    libc::MSG_TRUNC,
                    src.as_mut_ptr(),
                    &mut len,
                )
            };
            if n >= 0 {
                let n = n as usize;
                if n > buf.len() {
                    return Err(ErrorKind::MessageSize);
                }
                src.set_len(len);
                return Ok((n, src));
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            match errno {
                libc::EINTR => continue,
                libc::EAGAIN => self.base.wait_readable().await?,
                other => return Err(ErrorKind::from_errno(other)),
            }
        }
    }

    pub(crate) fn cancel(&self) {
        self.base.cancel();
    }

    pub(crate) fn cancel_read(&self) {
        self.base.cancel_read();
    }

    pub(crate) fn cancel_write(&self) {
        self.base.cancel_write();
    }

    pub(crate) fn close(&self) {
        {
            let mut st = self.st.lock().unwrap();
            st.state = DgramState::Idle;
            st.peer = None;
        }
        self.base.close();
    }

    pub(crate) fn local_native(&self) -> Result<SockAddr> {
        let fd = self.base.native_handle();
        if fd < 0 {
            return Err(ErrorKind::NotOpen);
        }
        let mut addr = SockAddr::zeroed();
        let mut len = addr.len();
        let ret = unsafe { libc::getsockname(fd, addr.as_mut_ptr(), &mut len) };
        if ret != 0 {
            return Err(ErrorKind::last_os_error());
        }
        addr.set_len(len);
        Ok(addr)
    }

    pub(crate) fn set_option<O: SocketOption>(&self, opt: &O) -> Result<()> {
        self.base.set_option(opt)
    }

    pub(crate) fn get_option<O: SocketOption>(&self, opt: &mut O) -> Result<()> {
        self.base.get_option(opt)
    }
}
