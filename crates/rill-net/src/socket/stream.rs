// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stream-socket state machine.
//!
//! Protocol-agnostic: speaks native `SockAddr` views only. At most one
//! read, one write, and one connect may be in flight; conflicting starts
//! return `Busy`. Each direction carries a cancellation epoch — `cancel*`
//! bumps it, and an in-flight operation re-checks its snapshot after every
//! readiness wait.

use std::sync::Mutex;

use rill_rt::error::{ErrorKind, Result};
use rill_rt::executor::IoExecutor;

use crate::endpoint::SockAddr;
use crate::option::SocketOption;
use crate::socket::base::SocketBase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// Which halves `shutdown` affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

impl ShutdownHow {
    fn native(self) -> libc::c_int {
        match self {
            ShutdownHow::Read => libc::SHUT_RD,
            ShutdownHow::Write => libc::SHUT_WR,
            ShutdownHow::Both => libc::SHUT_RDWR,
        }
    }
}

struct StreamState {
    conn: ConnState,
    read_epoch: u64,
    write_epoch: u64,
    connect_epoch: u64,
    shutdown_read: bool,
    shutdown_write: bool,
    read_in_flight: bool,
    write_in_flight: bool,
    connect_in_flight: bool,
}

impl StreamState {
    fn new() -> Self {
        StreamState {
            conn: ConnState::Disconnected,
            read_epoch: 0,
            write_epoch: 0,
            connect_epoch: 0,
            shutdown_read: false,
            shutdown_write: false,
            read_in_flight: false,
            write_in_flight: false,
            connect_in_flight: false,
        }
    }
}

#[derive(Clone, Copy)]
enum Flight {
    Read,
    Write,
    Connect,
}

/// Clears the in-flight flag on every exit path of an operation.
struct InFlightGuard<'a> {
    st: &'a Mutex<StreamState>,
    which: Flight,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.st.lock().unwrap();
        match self.which {
            Flight::Read => st.read_in_flight = false,
            Flight::Write => st.write_in_flight = false,
            Flight::Connect => st.connect_in_flight = false,
        }
    }
}

pub(crate) struct StreamSocketImpl {
    base: SocketBase,
    st: Mutex<StreamState>,
}

impl StreamSocketImpl {
    pub(crate) fn new(ex: IoExecutor) -> Self {
        StreamSocketImpl {
            base: SocketBase::new(ex),
            st: Mutex::new(StreamState::new()),
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

    pub(crate) fn is_connected(&self) -> bool {
        self.st.lock().unwrap().conn == ConnState::Connected
    }

    /// Adopt an fd from accept(): the connection is already established.
    pub(crate) fn assign(&self, fd: i32) -> Result<()> {
        {
            let st = self.st.lock().unwrap();
            debug_assert_eq!(st.conn, ConnState::Disconnected);
            debug_assert!(
                !st.read_in_flight && !st.write_in_flight && !st.connect_in_flight
            );
        }
        self.base.assign(fd)?;
        let mut st = self.st.lock().unwrap();
        st.conn = ConnState::Connected;
        st.shutdown_read = false;
        st.shutdown_write = false;
        Ok(())
    }

    pub(crate) fn open(&self, domain: i32) -> Result<()> {
        self.base.open(domain, libc::SOCK_STREAM, 0)
    }

    pub(crate) fn bind(&self, addr: &SockAddr) -> Result<()> {
        if !self.base.is_open() {
            self.open(addr.family())?;
        }
        let ret = unsafe { libc::bind(self.base.native_handle(), addr.as_ptr(), addr.len()) };
        if ret != 0 {
            return Err(ErrorKind::last_os_error());
        }
        Ok(())
    }

    pub(crate) async fn connect(&self, addr: &SockAddr) -> Result<()> {
        let epoch = {
            let mut st = self.st.lock().unwrap();
            if st.connect_in_flight {
                return Err(ErrorKind::Busy);
            }
            match st.conn {
                ConnState::Connected => return Err(ErrorKind::AlreadyConnected),
                ConnState::Connecting => return Err(ErrorKind::Busy),
                ConnState::Disconnected => {}
            }
            st.connect_in_flight = true;
            st.conn = ConnState::Connecting;
            st.connect_epoch
        };
        let _guard = InFlightGuard {
            st: &self.st,
            which: Flight::Connect,
        };

        match self.connect_inner(addr, epoch).await {
            Ok(()) => {
                let mut st = self.st.lock().unwrap();
                st.conn = ConnState::Connected;
                st.shutdown_read = false;
                st.shutdown_write = false;
                Ok(())
            }
            Err(e) => {
                let mut st = self.st.lock().unwrap();
                if st.conn == ConnState::Connecting {
                    st.conn = ConnState::Disconnected;
                }
                Err(e)
            }
        }
    }

    async fn connect_inner(&self, addr: &SockAddr, epoch: u64) -> Result<()> {
        if !self.base.is_open() {
            self.open(addr.family())?;
        }

        let fd = self.base.native_handle();
        let ret = unsafe { libc::connect(fd, addr.as_ptr(), addr.len()) };
        if ret == 0 {
            return Ok(());
        }

        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        match errno {
            // Connect readiness is reported as writability.
            libc::EINPROGRESS | libc::EINTR | libc::EALREADY => {}
            other => return Err(ErrorKind::from_errno(other)),
        }

        self.base.wait_writable().await?;

        {
            let st = self.st.lock().unwrap();
            if st.connect_epoch != epoch {
                return Err(ErrorKind::OperationAborted);
            }
        }
        let fd = self.base.native_handle();
        if fd < 0 {
            return Err(ErrorKind::OperationAborted);
        }

        let mut so_error: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut so_error as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(ErrorKind::last_os_error());
        }
        if so_error != 0 {
            return Err(ErrorKind::from_errno(so_error));
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` is EOF (or a shut-down read
    /// side).
    pub(crate) async fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
        let epoch = {
            let mut st = self.st.lock().unwrap();
            if st.conn != ConnState::Connected {
                return Err(ErrorKind::NotConnected);
            }
            if st.shutdown_read {
                return Ok(0);
            }
            if st.read_in_flight {
                return Err(ErrorKind::Busy);
            }
            st.read_in_flight = true;
            st.read_epoch
        };
        let _guard = InFlightGuard {
            st: &self.st,
            which: Flight::Read,
        };

        loop {
            let fd = self.base.native_handle();
            if fd < 0 {
                return Err(ErrorKind::NotOpen);
            }
            let n = unsafe {
                libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            match errno {
                libc::EINTR => continue,
                libc::EAGAIN => {
                    self.base.wait_readable().await?;
                    let st = self.st.lock().unwrap();
                    if st.read_epoch != epoch {
                        return Err(ErrorKind::OperationAborted);
                    }
                }
                other => return Err(ErrorKind::from_errno(other)),
            }
        }
    }

    /// Write up to `buf.len()` bytes.
    pub(crate) async fn write_some(&self, buf: &[u8]) -> Result<usize> {
        let epoch = {
            let mut st = self.st.lock().unwrap();
            if st.conn != ConnState::Connected {
                return Err(ErrorKind::NotConnected);
            }
            if st.shutdown_write {
                return Err(ErrorKind::BrokenPipe);
            }
            if st.write_in_flight {
                return Err(ErrorKind::Busy);
            }
            st.write_in_flight = true;
            st.write_epoch
        };
        let _guard = InFlightGuard {
            st: &self.st,
            which: Flight::Write,
        };

        loop {
            let fd = self.base.native_handle();
            if fd < 0 {
                return Err(ErrorKind::NotOpen);
            }
            let n = unsafe {
                libc::send(
                    fd,
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            match errno {
                libc::EINTR => continue,
                libc::EAGAIN => {
                    self.base.wait_writable().await?;
                    let st = self.st.lock().unwrap();
                    if st.write_epoch != epoch {
                        return Err(ErrorKind::OperationAborted);
                    }
                }
                other => return Err(ErrorKind::from_errno(other)),
            }
        }
    }

    pub(crate) fn shutdown(&self, how: ShutdownHow) -> Result<()> {
        {
            let st = self.st.lock().unwrap();
            if st.conn != ConnState::Connected {
                return Err(ErrorKind::NotConnected);
            }
        }
        let fd = self.base.native_handle();
        if fd < 0 {
            return Err(ErrorKind::NotOpen);
        }
        let ret = unsafe { libc::shutdown(fd, how.native()) };
        if ret != 0 {
            return Err(ErrorKind::last_os_error());
        }
        let mut st = self.st.lock().unwrap();
        match how {
            ShutdownHow::Read => st.shutdown_read = true,
            ShutdownHow::Write => st.shutdown_write = true,
            ShutdownHow::Both => {
                st.shutdown_read = true;
                st.shutdown_write = true;
            }
        }
        Ok(())
    }

    /// Abort the in-flight read, if any.
    pub(crate) fn cancel_read(&self) {
        self.st.lock().unwrap().read_epoch += 1;
        self.base.cancel_read();
    }

    /// Abort the in-flight write (and a connect waiting on writability).
    pub(crate) fn cancel_write(&self) {
        {
            let mut st = self.st.lock().unwrap();
            st.write_epoch += 1;
            st.connect_epoch += 1;
        }
        self.base.cancel_write();
    }

    pub(crate) fn cancel_connect(&self) {
        self.st.lock().unwrap().connect_epoch += 1;
        self.base.cancel_write();
    }

    pub(crate) fn cancel(&self) {
        {
            let mut st = self.st.lock().unwrap();
            st.read_epoch += 1;
            st.write_epoch += 1;
            st.connect_epoch += 1;
        }
        self.base.cancel();
    }

    /// Close and reset so the object can be reused via open/assign.
    pub(crate) fn close(&self) {
        {
            let mut st = self.st.lock().unwrap();
            st.read_epoch += 1;
            st.write_epoch += 1;
            st.connect_epoch += 1;
            st.conn = ConnState::Disconnected;
            st.shutdown_read = false;
            st.shutdown_write = false;
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

    pub(crate) fn remote_native(&self) -> Result<SockAddr> {
        let fd = self.base.native_handle();
        if fd < 0 {
            return Err(ErrorKind::NotOpen);
        }
        let mut addr = SockAddr::zeroed();
        let mut len = addr.len();
        let ret = unsafe { libc::getpeername(fd, addr.as_mut_ptr(), &mut len) };
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
