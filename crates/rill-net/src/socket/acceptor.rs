// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Listening-socket accept serialization.
//!
//! Concurrent `accept` calls are queued FIFO; exactly one turn is active
//! per listening socket at any instant. When the active turn exits it
//! resumes the next queued waiter. `cancel_read`/`close` bump the accept
//! epoch so every queued turn reports `OperationAborted` once scheduled.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use rill_rt::error::{ErrorKind, Result};
use rill_rt::executor::IoExecutor;

use crate::endpoint::SockAddr;
use crate::option::SocketOption;
use crate::socket::base::SocketBase;

struct TurnState {
    st: Mutex<(bool, Option<Waker>)>,
}

impl TurnState {
    fn new(ready: bool) -> Arc<Self> {
        Arc::new(TurnState {
            st: Mutex::new((ready, None)),
        })
    }

    fn make_ready(&self) {
        let waker = {
            let mut st = self.st.lock().unwrap();
            st.0 = true;
            st.1.take()
        };
        if let Some(w) = waker {
            w.wake();
        }
    }
}

struct TurnWait {
    turn: Arc<TurnState>,
}

impl Future for TurnWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut st = self.turn.st.lock().unwrap();
        if st.0 {
            Poll::Ready(())
        } else {
            st.1 = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

struct AccState {
    listening: bool,
    epoch: u64,
    queue: VecDeque<Arc<TurnState>>,
    active: bool,
}

pub(crate) struct AcceptorImpl {
    base: SocketBase,
    st: Mutex<AccState>,
}

/// Pops the guarded turn and hands the front to the next waiter.
struct TurnGuard<'a> {
    acc: &'a AcceptorImpl,
    turn: Arc<TurnState>,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        let next = {
            let mut st = self.acc.st.lock().unwrap();
            let was_front = st
                .queue
                .front()
                .is_some_and(|t| Arc::ptr_eq(t, &self.turn));
            st.queue.retain(|t| !Arc::ptr_eq(t, &self.turn));
            // Only the front turn owns the hand-off; a waiter that bailed
            // out mid-queue must not resume anyone.
            if !was_front {
                None
            } else {
                st.active = false;
                match st.queue.front().cloned() {
                    Some(next) => {
                        st.active = true;
                        Some(next)
                    }
                    None => None,
                }
            }
        };
        if let Some(next) = next {
            next.make_ready();
        }
    }
}

impl AcceptorImpl {
    pub(crate) fn new(ex: IoExecutor) -> Self {
        AcceptorImpl {
            base: SocketBase::new(ex),
            st: Mutex::new(AccState {
                listening: false,
                epoch: 0,
                queue: VecDeque::new(),
                active: false,
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

    pub(crate) fn is_listening(&self) -> bool {
        self.st.lock().unwrap().listening
    }

    pub(crate) fn open(&self, family: i32) -> Result<()> {
        self.base.open(family, libc::SOCK_STREAM, 0)
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

    pub(crate) fn listen(&self, backlog: i32) -> Result<()> {
        let fd = self.base.native_handle();
        if fd < 0 {
            return Err(ErrorKind::NotOpen);
        }
        let ret = unsafe { libc::listen(fd, backlog) };
        if ret != 0 {
            return Err(ErrorKind::last_os_error());
        }
        self.st.lock().unwrap().listening = true;
        Ok(())
    }

    /// Accept one connection; returns the connected fd.
    ///
    /// Callers are served strictly in arrival order.
    pub(crate) async fn accept(&self) -> Result<i32> {
        let (turn, epoch) = {
            let mut st = self.st.lock().unwrap();
            if !st.listening {
                return Err(ErrorKind::NotListening);
            }
            // Front of an idle queue proceeds immediately.
            let first = st.queue.is_empty() && !st.active;
            let turn = TurnState::new(first);
            st.queue.push_back(turn.clone());
            if first {
                st.active = true;
            }
            (turn, st.epoch)
        };

        let _guard = TurnGuard {
            acc: self,
            turn: turn.clone(),
        };
        // A stop request releases the queue wait; the check below turns it
        // into an abort without taking the accept turn.
        let stop = rill_rt::current_stop_token();
        let _stop_reg = {
            let t = turn.clone();
            stop.register(move || t.make_ready())
        };

        TurnWait { turn }.await;
        if stop.stop_requested() {
            return Err(ErrorKind::OperationAborted);
        }

        loop {
            {
                let st = self.st.lock().unwrap();
                if st.epoch != epoch {
                    return Err(ErrorKind::OperationAborted);
                }
                if !st.listening {
                    return Err(ErrorKind::NotListening);
                }
            }
            let fd = self.base.native_handle();
            if fd < 0 {
                return Err(ErrorKind::NotOpen);
            }

            let client = unsafe {
                libc::accept4(
                    fd,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if client >= 0 {
                return Ok(client);
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            match errno {
                libc::EINTR => continue,
                // The connection died between arrival and accept.
                libc::ECONNABORTED => continue,
                libc::EAGAIN => {
                    self.base.wait_readable().await?;
                }
                other => return Err(ErrorKind::from_errno(other)),
            }
        }
    }

    /// Abort the active accept and poison all queued turns.
    pub(crate) fn cancel_read(&self) {
        self.st.lock().unwrap().epoch += 1;
        self.base.cancel_read();
    }

    pub(crate) fn cancel(&self) {
        self.cancel_read();
    }

    pub(crate) fn close(&self) {
        {
            let mut st = self.st.lock().unwrap();
            st.listening = false;
            st.epoch += 1;
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
