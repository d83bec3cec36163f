// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Shared fd ownership for socket-like objects.
//!
//! Owns the native handle lifecycle (open/assign/close/release), the
//! executor binding, and the reactor registration handles used for
//! cancellation. `cancel*` and `close` are callable from any thread.

use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Mutex;

use rill_rt::error::{ErrorKind, Result};
use rill_rt::executor::IoExecutor;
use rill_rt::reactor::op::WaitCell;
use rill_rt::reactor::wait::OpWait;
use rill_rt::reactor::FdEventHandle;

use crate::option::SocketOption;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SockState {
    Closed = 0,
    Open = 1,
    Closing = 2,
}

impl SockState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

#[derive(Default)]
struct Handles {
    read: Option<FdEventHandle>,
    write: Option<FdEventHandle>,
}

pub(crate) struct SocketBase {
    ex: IoExecutor,
    fd: AtomicI32,
    state: AtomicU8,
    handles: Mutex<Handles>,
}

pub(crate) fn set_nonblocking(fd: i32) -> bool {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return false;
    }
    if flags & libc::O_NONBLOCK != 0 {
        return true;
    }
    unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == 0 }
}

pub(crate) fn set_cloexec(fd: i32) -> bool {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD, 0) };
    if flags < 0 {
        return false;
    }
    if flags & libc::FD_CLOEXEC != 0 {
        return true;
    }
    unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) == 0 }
}

impl SocketBase {
    pub(crate) fn new(ex: IoExecutor) -> Self {
        SocketBase {
            ex,
            fd: AtomicI32::new(-1),
            state: AtomicU8::new(SockState::Closed as u8),
            handles: Mutex::new(Handles::default()),
        }
    }

    pub(crate) fn executor(&self) -> &IoExecutor {
        &self.ex
    }

    /// Native handle; -1 when not open.
    pub(crate) fn native_handle(&self) -> i32 {
        self.fd.load(Ordering::Acquire)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.native_handle() >= 0
    }

    pub(crate) fn state(&self) -> SockState {
        SockState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Allocate a new socket, non-blocking and close-on-exec (best-effort).
    pub(crate) fn open(&self, domain: i32, ty: i32, protocol: i32) -> Result<()> {
        let _lk = self.handles.lock().unwrap();
        if self.state() != SockState::Closed || self.native_handle() >= 0 {
            return Err(ErrorKind::Busy);
        }

        let fd = unsafe { libc::socket(domain, ty, protocol) };
        if fd < 0 {
            return Err(ErrorKind::last_os_error());
        }
        set_cloexec(fd);
        set_nonblocking(fd);

        self.fd.store(fd, Ordering::Release);
        self.state.store(SockState::Open as u8, Ordering::Release);
        Ok(())
    }

    /// Adopt an externally-produced fd (e.g. from accept). Closes any
    /// previous one first.
    pub(crate) fn assign(&self, fd: i32) -> Result<()> {
        if fd < 0 {
            return Err(ErrorKind::InvalidArgument);
        }
        self.close();

        set_cloexec(fd);
        set_nonblocking(fd);
        {
            let _lk = self.handles.lock().unwrap();
            self.fd.store(fd, Ordering::Release);
            self.state.store(SockState::Open as u8, Ordering::Release);
        }
        Ok(())
    }

    /// Cancel both pending reactor registrations and drop interest.
    pub(crate) fn cancel(&self) {
        let fd = self.native_handle();
        let (rh, wh) = {
            let mut h = self.handles.lock().unwrap();
            (h.read.take(), h.write.take())
        };
        if let Some(h) = rh {
            h.cancel();
        }
        if let Some(h) = wh {
            h.cancel();
        }
        if fd >= 0 {
            self.ex.deregister_fd(fd);
        }
    }

    pub(crate) fn cancel_read(&self) {
        let h = self.handles.lock().unwrap().read.take();
        if let Some(h) = h {
            h.cancel();
        }
    }

    pub(crate) fn cancel_write(&self) {
        let h = self.handles.lock().unwrap().write.take();
        if let Some(h) = h {
            h.cancel();
        }
    }

    /// Close the fd (idempotent). Interest is removed before the fd can be
    /// reused by the OS; EINTR from close leaves the fd unusable and is
    /// treated as success.
    pub(crate) fn close(&self) {
        let (fd, rh, wh) = {
            let mut h = self.handles.lock().unwrap();
            if self.state() == SockState::Closed {
                self.fd.store(-1, Ordering::Release);
                return;
            }
            self.state
                .store(SockState::Closing as u8, Ordering::Release);
            (
                self.fd.swap(-1, Ordering::AcqRel),
                h.read.take(),
                h.write.take(),
            )
        };

        if fd >= 0 {
            self.ex.deregister_fd(fd);
        }
        if let Some(h) = rh {
            h.cancel();
        }
        if let Some(h) = wh {
            h.cancel();
        }
        if fd >= 0 {
            tracing::trace!(fd, "closing socket fd");
            unsafe { libc::close(fd) };
        }

        self.state.store(SockState::Closed as u8, Ordering::Release);
    }

    /// Give up ownership of the fd without closing it.
    pub(crate) fn release(&self) -> i32 {
        let fd = {
            let mut h = self.handles.lock().unwrap();
            h.read = None;
            h.write = None;
            self.state.store(SockState::Closed as u8, Ordering::Release);
            self.fd.swap(-1, Ordering::AcqRel)
        };
        if fd >= 0 {
            self.ex.deregister_fd(fd);
        }
        fd
    }

    pub(crate) fn set_option<O: SocketOption>(&self, opt: &O) -> Result<()> {
        let fd = self.native_handle();
        if fd < 0 {
            return Err(ErrorKind::NotOpen);
        }
        let ret =
            unsafe { libc::setsockopt(fd, opt.level(), opt.name(), opt.data(), opt.size()) };
        if ret != 0 {
            return Err(ErrorKind::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn get_option<O: SocketOption>(&self, opt: &mut O) -> Result<()> {
        let fd = self.native_handle();
        if fd < 0 {
            return Err(ErrorKind::NotOpen);
        }
        let mut len = opt.size();
        let ret =
            unsafe { libc::getsockopt(fd, opt.level(), opt.name(), opt.data_mut(), &mut len) };
        if ret != 0 {
            return Err(ErrorKind::last_os_error());
        }
        Ok(())
    }

    /// Arm a read-readiness wait and park until it fires or is cancelled.
    pub(crate) async fn wait_readable(&self) -> Result<()> {
        let fd = self.native_handle();
        if fd < 0 {
            return Err(ErrorKind::NotOpen);
        }
        let (cell, op) = WaitCell::new_op();
        let handle = self.ex.register_fd_read(fd, op)?;
        self.handles.lock().unwrap().read = Some(handle.clone());
        OpWait::new(cell, handle).await
    }

    /// Arm a write-readiness wait and park until it fires or is cancelled.
    pub(crate) async fn wait_writable(&self) -> Result<()> {
        let fd = self.native_handle();
        if fd < 0 {
            return Err(ErrorKind::NotOpen);
        }
        let (cell, op) = WaitCell::new_op();
        let handle = self.ex.register_fd_write(fd, op)?;
        self.handles.lock().unwrap().write = Some(handle.clone());
        OpWait::new(cell, handle).await
    }
}

impl Drop for SocketBase {
    fn drop(&mut self) {
        self.close();
    }
}
