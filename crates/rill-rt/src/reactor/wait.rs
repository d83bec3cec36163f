// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Awaitable wrapper over an armed reactor operation.
//!
//! `OpWait` bridges a registered op to the awaiting task and hooks the
//! task's stop token: requesting stop cancels the registration, which
//! aborts the op, which resumes the wait with `OperationAborted`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::error::Result;
use crate::reactor::op::WaitCell;
use crate::reactor::{FdEventHandle, TimerHandle};
use crate::stop::StopRegistration;
use crate::task;

/// A registration that can be cancelled from any thread.
pub trait CancelHandle: Clone + Send + Unpin + 'static {
    fn cancel(&self);
}

impl CancelHandle for FdEventHandle {
    fn cancel(&self) {
        FdEventHandle::cancel(self);
    }
}

impl CancelHandle for TimerHandle {
    fn cancel(&self) {
        TimerHandle::cancel(self);
    }
}

/// Future over an already-armed reactor op.
pub struct OpWait<H: CancelHandle> {
    cell: Arc<WaitCell>,
    handle: H,
    stop_reg: Option<StopRegistration>,
    armed_stop: bool,
}

impl<H: CancelHandle> OpWait<H> {
    pub fn new(cell: Arc<WaitCell>, handle: H) -> Self {
        OpWait {
            cell,
            handle,
            stop_reg: None,
            armed_stop: false,
        }
    }
}

impl<H: CancelHandle> Future for OpWait<H> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.armed_stop {
            this.armed_stop = true;
            let token = task::current_stop_token();
            if token.stop_requested() {
                // On-thread cancellation aborts the op before this poll
                // returns; off-thread it arrives as a posted abort.
                this.handle.cancel();
            } else {
                let handle = this.handle.clone();
                this.stop_reg = Some(token.register(move || handle.cancel()));
            }
        }
        this.cell.poll_outcome(cx.waker())
    }
}

impl<H: CancelHandle> Drop for OpWait<H> {
    fn drop(&mut self) {
        // A wait dropped mid-flight releases its registration so the slot
        // does not hold a dangling op until the next readiness.
        if !self.cell.is_settled() {
            self.handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::AsAnyExecutor;
    use crate::reactor::op::WaitCell;
    use crate::reactor::Reactor;
    use crate::spawn::spawn_detached;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn pipe_pair() -> (i32, i32) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn wait_completes_on_readiness() {
        let reactor = Reactor::new().unwrap();
        let ex = reactor.executor();
        let (read_fd, write_fd) = pipe_pair();

        let done = Arc::new(AtomicUsize::new(0));
        let done2 = done.clone();
        let ex2 = ex.clone();
        spawn_detached(&ex.as_any(), async move {
            let (cell, op) = WaitCell::new_op();
            let handle = ex2.register_fd_read(read_fd, op).unwrap();
            OpWait::new(cell, handle).await.unwrap();
            done2.fetch_add(1, Ordering::SeqCst);
        });

        let writer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            unsafe {
                libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
            }
        });

        reactor.run();
        writer.join().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn cancelled_wait_returns_aborted() {
        let reactor = Reactor::new().unwrap();
        let ex = reactor.executor();
        let (read_fd, write_fd) = pipe_pair();

        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let ex2 = ex.clone();
        spawn_detached(&ex.as_any(), async move {
            let (cell, op) = WaitCell::new_op();
            let handle = ex2.register_fd_read(read_fd, op).unwrap();
            handle.cancel();
            *seen2.lock().unwrap() = Some(OpWait::new(cell, handle).await);
        });

        reactor.run();
        assert_eq!(
            seen.lock().unwrap().take().unwrap(),
            Err(crate::error::ErrorKind::OperationAborted)
        );
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

}
