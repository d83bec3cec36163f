// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Executors: schedulable contexts for task resumption.
//!
//! `IoExecutor` posts onto one reactor. `AnyExecutor` type-erases any
//! executor. `Strand` serializes posted work over a base executor: tasks
//! submitted through a strand never run concurrently and run in FIFO order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::error::{ErrorKind, Result};
use crate::reactor::op::OpBox;
use crate::reactor::posted::Thunk;
use crate::reactor::{FdEventHandle, FdEventKind, Inner, TimerHandle};

/// Object-safe executor surface.
pub trait ExecutorImpl: Send + Sync {
    fn post(&self, f: Thunk);
    fn dispatch(&self, f: Thunk);
    /// The reactor-bound executor underneath, if any.
    fn io(&self) -> Option<IoExecutor>;
}

/// Executor bound to a single reactor.
///
/// Holds a weak reference: operations on a torn-down reactor fail with
/// `NotOpen` instead of keeping it alive.
#[derive(Clone)]
pub struct IoExecutor {
    inner: Weak<Inner>,
}

impl IoExecutor {
    pub(crate) fn new(inner: Weak<Inner>) -> Self {
        IoExecutor { inner }
    }

    pub fn valid(&self) -> bool {
        self.inner.strong_count() > 0
    }

    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(inner) = self.inner.upgrade() {
            inner.post(Box::new(f));
        }
    }

    /// Run inline when called on the reactor thread, otherwise post.
    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(inner) = self.inner.upgrade() {
            inner.dispatch(Box::new(f));
        }
    }

    pub fn register_fd_read(&self, fd: i32, op: OpBox) -> Result<FdEventHandle> {
        match self.inner.upgrade() {
            Some(inner) => inner.register_fd(fd, FdEventKind::Read, op),
            None => {
                op.abort(ErrorKind::NotOpen);
                Err(ErrorKind::NotOpen)
            }
        }
    }

    pub fn register_fd_write(&self, fd: i32, op: OpBox) -> Result<FdEventHandle> {
        match self.inner.upgrade() {
            Some(inner) => inner.register_fd(fd, FdEventKind::Write, op),
            None => {
                op.abort(ErrorKind::NotOpen);
                Err(ErrorKind::NotOpen)
            }
        }
    }

    /// Remove interest and abort both pending ops of `fd`.
    pub fn deregister_fd(&self, fd: i32) {
        if let Some(inner) = self.inner.upgrade() {
            inner.deregister_fd(fd);
        }
    }

    pub fn add_timer(&self, expiry: Instant, op: OpBox) -> Result<TimerHandle> {
        match self.inner.upgrade() {
            Some(inner) => inner.add_timer(expiry, op),
            None => {
                op.abort(ErrorKind::NotOpen);
                Err(ErrorKind::NotOpen)
            }
        }
    }

    pub fn running_in_this_thread(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.running_in_this_thread())
    }
}

impl ExecutorImpl for IoExecutor {
    fn post(&self, f: Thunk) {
        if let Some(inner) = self.inner.upgrade() {
            inner.post(f);
        }
    }

    fn dispatch(&self, f: Thunk) {
        if let Some(inner) = self.inner.upgrade() {
            inner.dispatch(f);
        }
    }

    fn io(&self) -> Option<IoExecutor> {
        Some(self.clone())
    }
}

/// Type-erased executor handle.
#[derive(Clone)]
pub struct AnyExecutor {
    imp: Arc<dyn ExecutorImpl>,
}

impl AnyExecutor {
    pub fn new<E: ExecutorImpl + 'static>(ex: E) -> Self {
        AnyExecutor { imp: Arc::new(ex) }
    }

    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.imp.post(Box::new(f));
    }

    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.imp.dispatch(Box::new(f));
    }

    pub(crate) fn post_boxed(&self, f: Thunk) {
        self.imp.post(f);
    }

    pub fn io(&self) -> Option<IoExecutor> {
        self.imp.io()
    }

    pub fn same_executor(&self, other: &AnyExecutor) -> bool {
        Arc::ptr_eq(&self.imp, &other.imp)
    }
}

impl From<IoExecutor> for AnyExecutor {
    fn from(ex: IoExecutor) -> Self {
        AnyExecutor::new(ex)
    }
}

impl From<Strand> for AnyExecutor {
    fn from(ex: Strand) -> Self {
        AnyExecutor::new(ex)
    }
}

/// Borrow-or-convert bound used by spawn and the combinators.
pub trait AsAnyExecutor {
    fn as_any(&self) -> AnyExecutor;
}

impl AsAnyExecutor for AnyExecutor {
    fn as_any(&self) -> AnyExecutor {
        self.clone()
    }
}

impl AsAnyExecutor for IoExecutor {
    fn as_any(&self) -> AnyExecutor {
        AnyExecutor::new(self.clone())
    }
}

impl AsAnyExecutor for Strand {
    fn as_any(&self) -> AnyExecutor {
        AnyExecutor::new(self.clone())
    }
}

struct StrandQueue {
    tasks: VecDeque<Thunk>,
    /// True while a drain is scheduled or running on the base executor.
    active: bool,
}

struct StrandState {
    base: AnyExecutor,
    q: Mutex<StrandQueue>,
}

impl StrandState {
    /// Returns true when the caller must schedule a drain.
    fn enqueue(&self, f: Thunk) -> bool {
        let mut q = self.q.lock().unwrap();
        q.tasks.push_back(f);
        if q.active {
            return false;
        }
        q.active = true;
        true
    }

    fn try_pop(&self) -> Option<Thunk> {
        let mut q = self.q.lock().unwrap();
        match q.tasks.pop_front() {
            Some(f) => Some(f),
            None => {
                q.active = false;
                None
            }
        }
    }
}

thread_local! {
    static ACTIVE_STRAND: std::cell::RefCell<Vec<usize>> = const { std::cell::RefCell::new(Vec::new()) };
}

/// FIFO, non-concurrent execution over any base executor.
#[derive(Clone)]
pub struct Strand {
    state: Arc<StrandState>,
}

impl Strand {
    pub fn new<E: AsAnyExecutor>(base: &E) -> Self {
        Strand {
            state: Arc::new(StrandState {
                base: base.as_any(),
                q: Mutex::new(StrandQueue {
                    tasks: VecDeque::new(),
                    active: false,
                }),
            }),
        }
    }

    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_boxed(Box::new(f));
    }

    fn post_boxed(&self, f: Thunk) {
        if self.state.enqueue(f) {
            let st = self.state.clone();
            self.state.base.post(move || Strand::drain(st));
        }
    }

    /// Runs inline when already executing on this strand, else posts.
    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let key = Arc::as_ptr(&self.state) as usize;
        let on_strand = ACTIVE_STRAND.with(|s| s.borrow().last() == Some(&key));
        if on_strand {
            f();
        } else {
            self.post_boxed(Box::new(f));
        }
    }

    fn drain(state: Arc<StrandState>) {
        let key = Arc::as_ptr(&state) as usize;
        ACTIVE_STRAND.with(|s| s.borrow_mut().push(key));
        while let Some(f) = state.try_pop() {
            // Scheduling is infallible from the caller's view; a panicking
            // thunk must not poison the strand.
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
                tracing::debug!("strand thunk panicked");
            }
        }
        ACTIVE_STRAND.with(|s| {
            s.borrow_mut().pop();
        });
    }
}

impl ExecutorImpl for Strand {
    fn post(&self, f: Thunk) {
        self.post_boxed(f);
    }

    fn dispatch(&self, f: Thunk) {
        let key = Arc::as_ptr(&self.state) as usize;
        let on_strand = ACTIVE_STRAND.with(|s| s.borrow().last() == Some(&key));
        if on_strand {
            f();
        } else {
            self.post_boxed(f);
        }
    }

    fn io(&self) -> Option<IoExecutor> {
        self.state.base.io()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn strand_preserves_fifo() {
        let reactor = Reactor::new().unwrap();
        let strand = Strand::new(&reactor.executor());
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let log = log.clone();
            strand.post(move || log.lock().unwrap().push(i));
        }
        reactor.run();
        assert_eq!(*log.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn strand_schedules_single_drain() {
        let reactor = Reactor::new().unwrap();
        let strand = Strand::new(&reactor.executor());
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let ran = ran.clone();
            strand.post(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        // All 16 strand thunks run inside the drains scheduled on the base.
        reactor.run();
        assert_eq!(ran.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn strand_dispatch_inline_when_on_strand() {
        let reactor = Reactor::new().unwrap();
        let strand = Strand::new(&reactor.executor());
        let observed = Arc::new(AtomicUsize::new(0));

        let s2 = strand.clone();
        let obs = observed.clone();
        strand.post(move || {
            let obs2 = obs.clone();
            s2.dispatch(move || {
                obs2.fetch_add(1, Ordering::SeqCst);
            });
            // Ran inline, not queued behind this thunk.
            assert_eq!(obs.load(Ordering::SeqCst), 1);
        });
        reactor.run();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dead_reactor_executor_is_inert() {
        let ex = {
            let reactor = Reactor::new().unwrap();
            reactor.executor()
        };
        assert!(!ex.valid());
        // Posting to a dead reactor is a no-op, not a panic.
        ex.post(|| panic!("must never run"));
    }
}
