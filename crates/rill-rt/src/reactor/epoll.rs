// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Epoll + eventfd backend (Linux default).
//!
//! Level-triggered. One epoll handle, one eventfd for cross-thread wakeups.
//! The eventfd is registered at construction, drained inside `wait`, and
//! never surfaces to the reactor.

use std::collections::HashSet;
use std::io;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::ErrorKind;
use crate::reactor::backend::{Backend, Event};

const MAX_EVENTS: usize = 64;

pub struct EpollBackend {
    epoll_fd: i32,
    wake_fd: i32,
    /// Fds currently added to the epoll set; decides CTL_ADD vs CTL_MOD.
    registered: Mutex<HashSet<i32>>,
}

impl EpollBackend {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake_fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(err);
        }

        Ok(EpollBackend {
            epoll_fd,
            wake_fd,
            registered: Mutex::new(HashSet::new()),
        })
    }

    fn mask_for(want_read: bool, want_write: bool) -> u32 {
        let mut events = libc::EPOLLRDHUP as u32;
        if want_read {
            events |= libc::EPOLLIN as u32;
        }
        if want_write {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }
}

impl Backend for EpollBackend {
    fn update_interest(&self, fd: i32, want_read: bool, want_write: bool) -> io::Result<()> {
        let mut registered = self.registered.lock().unwrap();

        if !want_read && !want_write {
            if registered.remove(&fd) {
                let ret = unsafe {
                    libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
                };
                if ret < 0 {
                    let err = io::Error::last_os_error();
                    // ENOENT / EBADF are expected if the fd was already closed.
                    if err.raw_os_error() != Some(libc::ENOENT)
                        && err.raw_os_error() != Some(libc::EBADF)
                    {
                        return Err(err);
                    }
                }
            }
            return Ok(());
        }

        let mut ev = libc::epoll_event {
            events: Self::mask_for(want_read, want_write),
            u64: fd as u64,
        };
        let op = if registered.contains(&fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Recover from a stale registered-set entry in either direction.
            let retry_op = match err.raw_os_error() {
                Some(libc::ENOENT) if op == libc::EPOLL_CTL_MOD => libc::EPOLL_CTL_ADD,
                Some(libc::EEXIST) if op == libc::EPOLL_CTL_ADD => libc::EPOLL_CTL_MOD,
                _ => return Err(err),
            };
            let ret = unsafe { libc::epoll_ctl(self.epoll_fd, retry_op, fd, &mut ev) };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        registered.insert(fd);
        Ok(())
    }

    fn remove_interest(&self, fd: i32) {
        let mut registered = self.registered.lock().unwrap();
        if registered.remove(&fd) {
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
    }

    fn wait(&self, max_wait: Option<Duration>, out: &mut Vec<Event>) -> io::Result<usize> {
        let timeout_ms: i32 = match max_wait {
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };

        let mut events: [libc::epoll_event; MAX_EVENTS] =
            unsafe { std::mem::zeroed() };

        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let mut appended = 0;
        for ev in events.iter().take(n as usize) {
            let fd = ev.u64 as i32;

            if fd == self.wake_fd {
                // Drain the counter; the value itself is meaningless.
                let mut buf = [0u8; 8];
                unsafe {
                    libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
                }
                continue;
            }

            let bits = ev.events;
            let hup = bits & (libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32) != 0;
            let err = bits & libc::EPOLLERR as u32 != 0;
            let hint = if hup {
                Some(ErrorKind::Eof)
            } else if err {
                Some(ErrorKind::ConnectionReset)
            } else {
                None
            };
            out.push(Event {
                fd,
                readable: bits & (libc::EPOLLIN as u32 | libc::EPOLLPRI as u32) != 0,
                writable: bits & libc::EPOLLOUT as u32 != 0,
                error: hup || err,
                hint,
            });
            appended += 1;
        }
        Ok(appended)
    }

    fn wakeup(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (i32, i32) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn pipe_readiness() {
        let backend = EpollBackend::new().unwrap();
        let (read_fd, write_fd) = pipe_pair();

        backend.update_interest(read_fd, true, false).unwrap();
        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }

        let mut events = Vec::new();
        let n = backend
            .wait(Some(Duration::from_millis(200)), &mut events)
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].fd, read_fd);
        assert!(events[0].readable);

        backend.remove_interest(read_fd);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn wakeup_interrupts_wait_without_events() {
        let backend = EpollBackend::new().unwrap();
        backend.wakeup();
        let mut events = Vec::new();
        let n = backend
            .wait(Some(Duration::from_millis(200)), &mut events)
            .unwrap();
        // The eventfd is drained internally; no event surfaces.
        assert_eq!(n, 0);
    }

    #[test]
    fn timeout_with_no_events() {
        let backend = EpollBackend::new().unwrap();
        let mut events = Vec::new();
        let n = backend
            .wait(Some(Duration::from_millis(1)), &mut events)
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn peer_close_reports_error_hint() {
        let backend = EpollBackend::new().unwrap();
        let (read_fd, write_fd) = pipe_pair();
        backend.update_interest(read_fd, true, false).unwrap();
        unsafe { libc::close(write_fd) };

        let mut events = Vec::new();
        backend
            .wait(Some(Duration::from_millis(200)), &mut events)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].error);
        assert_eq!(events[0].hint, Some(ErrorKind::Eof));

        backend.remove_interest(read_fd);
        unsafe { libc::close(read_fd) };
    }
}
