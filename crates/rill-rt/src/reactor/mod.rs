// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reactor core: event loop over one OS backend.
//!
//! Single-threaded cooperative model. The thread inside `run*` executes all
//! completions, aborts, and posted thunks; other threads interact through
//! `post`, handle cancellation, and `stop` — all of which funnel through
//! mutex-guarded registries plus the backend's wakeup primitive.
//!
//! Tick order is fixed: posted thunks, then expired timers, then I/O
//! events.

pub mod backend;
pub mod epoll;
pub mod fd_registry;
pub mod op;
pub mod posted;
pub mod timer_registry;
#[cfg(feature = "uring")]
pub mod uring;
pub mod wait;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::error::{ErrorKind, Result};
use crate::executor::IoExecutor;

use backend::{Backend, Event};
use epoll::EpollBackend;
pub use fd_registry::FdEventKind;
use fd_registry::FdRegistry;
use op::OpBox;
use posted::{PostedQueue, Thunk};
use timer_registry::{TimerRegistry, TimerToken};

/// Opaque stable per-thread identity token.
fn this_thread_token() -> usize {
    thread_local! {
        static TOKEN: u8 = const { 0u8 };
    }
    TOKEN.with(|t| t as *const u8 as usize)
}

pub(crate) struct Inner {
    backend: Box<dyn Backend>,
    stopped: AtomicBool,
    fd_reg: Mutex<FdRegistry>,
    timers: Mutex<TimerRegistry>,
    posted: PostedQueue,
    work_guards: AtomicUsize,
    thread_token: AtomicUsize,
}

impl Inner {
    pub(crate) fn running_in_this_thread(&self) -> bool {
        self.thread_token.load(Ordering::Acquire) == this_thread_token()
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn post(&self, f: Thunk) {
        self.posted.push(f);
        self.backend.wakeup();
    }

    pub(crate) fn dispatch(&self, f: Thunk) {
        if self.running_in_this_thread() && !self.stopped() {
            f();
        } else {
            self.post(f);
        }
    }

    pub(crate) fn add_work_guard(&self) {
        self.work_guards.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove_work_guard(&self) {
        let prev = self.work_guards.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        // The run loop may now be out of work; let it re-evaluate.
        self.backend.wakeup();
    }

    fn has_work(&self) -> bool {
        self.work_guards.load(Ordering::Acquire) > 0
            || !self.fd_reg.lock().unwrap().is_empty()
            || !self.timers.lock().unwrap().is_empty()
            || !self.posted.is_empty()
    }

    // ---- fd registrations -------------------------------------------------

    pub(crate) fn register_fd(
        self: &Arc<Self>,
        fd: i32,
        kind: FdEventKind,
        op: OpBox,
    ) -> Result<FdEventHandle> {
        if fd < 0 {
            op.abort(ErrorKind::InvalidArgument);
            return Err(ErrorKind::InvalidArgument);
        }
        if self.stopped() {
            op.abort(ErrorKind::OperationAborted);
            return Err(ErrorKind::OperationAborted);
        }

        let (token, replaced, interest) = {
            let mut reg = self.fd_reg.lock().unwrap();
            let r = match kind {
                FdEventKind::Read => reg.register_read(fd, op),
                FdEventKind::Write => reg.register_write(fd, op),
            };
            (r.token, r.replaced, r.interest)
        };

        // A replaced op belongs to a registration that was overwritten;
        // its waiter observes the abort.
        if let Some(old) = replaced {
            old.abort(ErrorKind::OperationAborted);
        }

        if let Err(err) = self
            .backend
            .update_interest(fd, interest.want_read, interest.want_write)
        {
            tracing::debug!(fd, ?err, "backend interest update failed");
            let cancel = self.fd_reg.lock().unwrap().cancel(fd, kind, token);
            if let Some(op) = cancel.removed {
                op.abort(ErrorKind::from_errno(err.raw_os_error().unwrap_or(0)));
            }
            return Err(ErrorKind::from_errno(err.raw_os_error().unwrap_or(0)));
        }

        Ok(FdEventHandle {
            inner: Arc::downgrade(self),
            fd,
            kind,
            token,
        })
    }

    fn cancel_fd_event(self: &Arc<Self>, fd: i32, kind: FdEventKind, token: u64) {
        if self.running_in_this_thread() {
            self.cancel_fd_event_here(fd, kind, token);
        } else {
            // Abort callbacks must run on the reactor thread.
            let this = self.clone();
            self.post(Box::new(move || {
                this.cancel_fd_event_here(fd, kind, token);
            }));
        }
    }

    fn cancel_fd_event_here(&self, fd: i32, kind: FdEventKind, token: u64) {
        let cancel = self.fd_reg.lock().unwrap().cancel(fd, kind, token);
        if !cancel.matched {
            return;
        }
        let _ = self.backend.update_interest(
            fd,
            cancel.interest.want_read,
            cancel.interest.want_write,
        );
        if let Some(op) = cancel.removed {
            op.abort(ErrorKind::OperationAborted);
        }
    }

    pub(crate) fn deregister_fd(self: &Arc<Self>, fd: i32) {
        if self.running_in_this_thread() {
            self.deregister_fd_here(fd);
        } else {
            let this = self.clone();
            self.post(Box::new(move || {
                this.deregister_fd_here(fd);
            }));
        }
    }

    fn deregister_fd_here(&self, fd: i32) {
        let d = self.fd_reg.lock().unwrap().deregister(fd);
        self.backend.remove_interest(fd);
        if let Some(op) = d.read {
            op.abort(ErrorKind::OperationAborted);
        }
        if let Some(op) = d.write {
            op.abort(ErrorKind::OperationAborted);
        }
    }

    // ---- timers -----------------------------------------------------------

    pub(crate) fn add_timer(self: &Arc<Self>, expiry: Instant, op: OpBox) -> Result<TimerHandle> {
        if self.stopped() {
            op.abort(ErrorKind::OperationAborted);
            return Err(ErrorKind::OperationAborted);
        }
        let token = self.timers.lock().unwrap().add(expiry, op);
        // The new expiry may be earlier than the current wait deadline.
        self.backend.wakeup();
        Ok(TimerHandle {
            inner: Arc::downgrade(self),
            token,
        })
    }

    fn cancel_timer(self: &Arc<Self>, token: TimerToken) {
        let op = self.timers.lock().unwrap().cancel(token);
        let Some(op) = op else { return };
        if self.running_in_this_thread() {
            op.abort(ErrorKind::OperationAborted);
        } else {
            self.post(Box::new(move || {
                op.abort(ErrorKind::OperationAborted);
            }));
        }
        // Force a drain pass so the cancelled node is recycled.
        self.backend.wakeup();
    }

    // ---- run loop ---------------------------------------------------------

    fn drain_posted(&self) -> usize {
        let mut queue = self.posted.take_all();
        let mut count = 0;
        while let Some(f) = queue.pop_front() {
            if self.stopped() {
                // Keep the remainder for a later restart + run.
                queue.push_front(f);
                self.posted.push_back_front(queue);
                return count;
            }
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
                tracing::debug!("posted thunk panicked");
            }
            count += 1;
        }
        count
    }

    fn process_timers(&self) -> usize {
        let ready = {
            let mut timers = self.timers.lock().unwrap();
            timers.process_expired(self.stopped(), Instant::now())
        };
        // Invoke outside the registry lock; callbacks may re-enter.
        let mut count = 0;
        for entry in ready {
            if entry.fired {
                entry.op.complete();
                count += 1;
            } else {
                entry.op.abort(ErrorKind::OperationAborted);
            }
        }
        count
    }

    fn process_events(&self, events: &mut Vec<Event>) -> usize {
        let mut count = 0;
        for ev in events.drain(..) {
            let ready = {
                let mut reg = self.fd_reg.lock().unwrap();
                reg.take_ready(
                    ev.fd,
                    ev.readable || ev.error,
                    ev.writable || ev.error,
                )
            };
            // Reconcile interest with whatever ops remain in the slots.
            let _ = self.backend.update_interest(
                ev.fd,
                ready.interest.want_read,
                ready.interest.want_write,
            );
            if let Some(op) = ready.read {
                op.complete();
                count += 1;
            }
            if let Some(op) = ready.write {
                op.complete();
                count += 1;
            }
        }
        count
    }

    fn next_timeout(&self) -> Option<Duration> {
        self.timers.lock().unwrap().next_timeout(Instant::now())
    }

    fn run(&self) -> usize {
        self.thread_token
            .store(this_thread_token(), Ordering::Release);
        tracing::trace!("reactor run loop entered");

        let mut count = 0;
        let mut events = Vec::with_capacity(64);
        loop {
            if self.stopped() {
                break;
            }
            count += self.drain_posted();
            count += self.process_timers();
            if self.stopped() || !self.has_work() {
                break;
            }

            let timeout = if self.posted.is_empty() {
                self.next_timeout()
            } else {
                Some(Duration::ZERO)
            };
            events.clear();
            match self.backend.wait(timeout, &mut events) {
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(?err, "backend wait failed");
                    break;
                }
            }
            count += self.process_events(&mut events);
        }
        tracing::trace!(count, "reactor run loop exited");
        count
    }

    fn run_one(&self) -> usize {
        self.thread_token
            .store(this_thread_token(), Ordering::Release);
        if self.stopped() {
            return 0;
        }

        if let Some(f) = self.posted.take_one() {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
                tracing::debug!("posted thunk panicked");
            }
            return 1;
        }
        let n = self.process_timers();
        if n > 0 {
            return n;
        }
        if !self.has_work() {
            return 0;
        }

        let mut events = Vec::with_capacity(64);
        if self
            .backend
            .wait(self.next_timeout(), &mut events)
            .is_err()
        {
            return 0;
        }
        let mut count = self.process_events(&mut events);
        count += self.process_timers();
        if count == 0 {
            // The wakeup was for cross-thread posted work.
            if let Some(f) = self.posted.take_one() {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
                    tracing::debug!("posted thunk panicked");
                }
                count = 1;
            }
        }
        count
    }

    fn run_for(&self, limit: Duration) -> usize {
        self.thread_token
            .store(this_thread_token(), Ordering::Release);
        let deadline = Instant::now() + limit;

        let mut count = 0;
        let mut events = Vec::with_capacity(64);
        loop {
            if self.stopped() {
                break;
            }
            count += self.drain_posted();
            count += self.process_timers();
            if self.stopped() || !self.has_work() {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = deadline - now;
            let timeout = match self.next_timeout() {
                Some(t) => t.min(remaining),
                None => remaining,
            };
            events.clear();
            if self.backend.wait(Some(timeout), &mut events).is_err() {
                break;
            }
            count += self.process_events(&mut events);
        }
        count
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.backend.wakeup();
    }

    fn restart(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    /// Abort everything still registered. Runs on the dropping thread.
    fn teardown(&self) {
        self.stop();

        let (fds, ops) = self.fd_reg.lock().unwrap().drain_all();
        for fd in &fds {
            self.backend.remove_interest(*fd);
        }
        tracing::debug!(fds = fds.len(), ops = ops.len(), "reactor teardown drain");
        for op in ops {
            op.abort(ErrorKind::OperationAborted);
        }

        let timer_ops = self.timers.lock().unwrap().drain_all();
        for op in timer_ops {
            op.abort(ErrorKind::OperationAborted);
        }
        // Posted thunks (including those enqueued by the aborts above) are
        // dropped unexecuted with the queue.
    }
}

/// Cancellation handle for one fd registration.
///
/// Token-checked: cancelling after the registration completed or was
/// replaced is a no-op. Safe to call from any thread; off-thread
/// cancellation is posted to the reactor.
#[derive(Clone)]
pub struct FdEventHandle {
    inner: Weak<Inner>,
    fd: i32,
    kind: FdEventKind,
    token: u64,
}

impl FdEventHandle {
    pub fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.cancel_fd_event(self.fd, self.kind, self.token);
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }
}

/// Cancellation handle for one timer registration.
#[derive(Clone)]
pub struct TimerHandle {
    inner: Weak<Inner>,
    token: TimerToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.cancel_timer(self.token);
        }
    }

    /// True when both handles refer to the same registration.
    pub fn same_registration(&self, other: &TimerHandle) -> bool {
        self.token == other.token && Weak::ptr_eq(&self.inner, &other.inner)
    }
}

/// Keeps the run loop alive while no operations are pending.
pub struct WorkGuard {
    inner: Weak<Inner>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove_work_guard();
        }
    }
}

/// A single-threaded I/O event loop.
///
/// All coroutine resumptions and operation callbacks run on the thread
/// currently inside `run`/`run_one`/`run_for`. Multiple reactors may exist
/// in one process; they share nothing.
pub struct Reactor {
    inner: Arc<Inner>,
}

impl Reactor {
    /// New reactor over the default epoll backend.
    pub fn new() -> io::Result<Self> {
        Ok(Self::with_backend(Box::new(EpollBackend::new()?)))
    }

    /// New reactor over the io_uring backend.
    #[cfg(feature = "uring")]
    pub fn new_uring() -> io::Result<Self> {
        Ok(Self::with_backend(Box::new(uring::UringBackend::new()?)))
    }

    pub fn with_backend(backend: Box<dyn Backend>) -> Self {
        Reactor {
            inner: Arc::new(Inner {
                backend,
                stopped: AtomicBool::new(false),
                fd_reg: Mutex::new(FdRegistry::new()),
                timers: Mutex::new(TimerRegistry::new()),
                posted: PostedQueue::new(),
                work_guards: AtomicUsize::new(0),
                thread_token: AtomicUsize::new(0),
            }),
        }
    }

    /// Executor bound to this reactor.
    pub fn executor(&self) -> IoExecutor {
        IoExecutor::new(Arc::downgrade(&self.inner))
    }

    /// Run until stopped or out of work. Returns the number of handlers
    /// executed.
    pub fn run(&self) -> usize {
        self.inner.run()
    }

    /// One unit of progress from the first non-empty source.
    pub fn run_one(&self) -> usize {
        self.inner.run_one()
    }

    /// `run` bounded by a deadline.
    pub fn run_for(&self, limit: Duration) -> usize {
        self.inner.run_for(limit)
    }

    /// Stop the loop. Idempotent; pending work is kept.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Clear the stopped flag. Does not resume work by itself.
    pub fn restart(&self) {
        self.inner.restart();
    }

    pub fn stopped(&self) -> bool {
        self.inner.stopped()
    }

    /// Hold the run loop open while no operations are pending.
    pub fn work_guard(&self) -> WorkGuard {
        self.inner.add_work_guard();
        WorkGuard {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}
