// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task objects: owned futures driven by an executor.
//!
//! State machine driven by poll(). A task's waker re-posts it onto its
//! bound executor — resumptions are never run inline from a reactor
//! callback, which keeps completion paths from re-entering the frame that
//! triggered them.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use crate::executor::AnyExecutor;
use crate::stop::StopToken;

/// Task lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    /// Queued, waiting to be polled.
    Ready = 0,
    /// Currently being polled.
    Running = 1,
    /// Parked on an awaitable — waiting for its waker.
    Waiting = 2,
    /// Finished.
    Complete = 3,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Waiting,
            _ => Self::Complete,
        }
    }
}

/// Type-erased future. The typed result is written to a shared slot by the
/// spawn wrapper; the scheduler only sees `()`.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) struct Task {
    state: AtomicU8,
    future: Mutex<Option<BoxFuture>>,
    executor: AnyExecutor,
    /// Current stop token; swapped by scoped-timeout guards, inherited by
    /// children spawned from this task.
    stop_token: Mutex<StopToken>,
    /// Invoked if the future panics out of poll; used by join/callback
    /// completion modes to report the failure.
    panic_notify: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Task {
    pub(crate) fn new(future: BoxFuture, executor: AnyExecutor, token: StopToken) -> Arc<Self> {
        Arc::new(Task {
            state: AtomicU8::new(TaskState::Ready as u8),
            future: Mutex::new(Some(future)),
            executor,
            stop_token: Mutex::new(token),
            panic_notify: Mutex::new(None),
        })
    }

    pub(crate) fn set_panic_notify(&self, f: Box<dyn FnOnce() + Send>) {
        *self.panic_notify.lock().unwrap() = Some(f);
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn stop_token(&self) -> StopToken {
        self.stop_token.lock().unwrap().clone()
    }

    pub(crate) fn swap_stop_token(&self, token: StopToken) -> StopToken {
        std::mem::replace(&mut *self.stop_token.lock().unwrap(), token)
    }

    pub(crate) fn executor(&self) -> &AnyExecutor {
        &self.executor
    }

    /// Enqueue the first poll onto the bound executor.
    pub(crate) fn schedule(self: &Arc<Self>) {
        let task = self.clone();
        self.executor.post_boxed(Box::new(move || run_task(task)));
    }

    /// Poll the future once. Returns true when the task completed.
    fn poll(self: &Arc<Self>) -> bool {
        let waker = Waker::from(Arc::new(TaskWaker { task: self.clone() }));
        let mut cx = Context::from_waker(&waker);

        let mut fut_slot = self.future.lock().unwrap();
        let Some(fut) = fut_slot.as_mut() else {
            return true;
        };

        let polled = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            fut.as_mut().poll(&mut cx)
        }));

        match polled {
            Ok(Poll::Ready(())) => {
                *fut_slot = None;
                true
            }
            Ok(Poll::Pending) => false,
            Err(_) => {
                // The frame is poisoned; drop it and report through the
                // completion mode, if one is attached.
                *fut_slot = None;
                drop(fut_slot);
                if let Some(notify) = self.panic_notify.lock().unwrap().take() {
                    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(notify));
                }
                true
            }
        }
    }
}

struct TaskWaker {
    task: Arc<Task>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        loop {
            let state = TaskState::from_u8(self.task.state.load(Ordering::Acquire));
            match state {
                TaskState::Waiting => {
                    if self
                        .task
                        .state
                        .compare_exchange(
                            TaskState::Waiting as u8,
                            TaskState::Ready as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        continue;
                    }
                    let task = self.task.clone();
                    self.task
                        .executor
                        .post_boxed(Box::new(move || run_task(task)));
                    return;
                }
                TaskState::Running => {
                    // Fired during poll(). Transition Running→Ready so the
                    // scheduler's CAS(Running→Waiting) fails and re-posts.
                    if self
                        .task
                        .state
                        .compare_exchange(
                            TaskState::Running as u8,
                            TaskState::Ready as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        continue;
                    }
                    return;
                }
                TaskState::Ready | TaskState::Complete => return,
            }
        }
    }
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
}

struct TaskContextGuard {
    prev: Option<Arc<Task>>,
}

impl Drop for TaskContextGuard {
    fn drop(&mut self) {
        CURRENT_TASK.with(|c| *c.borrow_mut() = self.prev.take());
    }
}

/// Poll a task once, handling completion and the waker-during-poll race.
pub(crate) fn run_task(task: Arc<Task>) {
    if task.state() == TaskState::Complete {
        return;
    }
    task.state
        .store(TaskState::Running as u8, Ordering::Release);

    let _guard = TaskContextGuard {
        prev: CURRENT_TASK.with(|c| c.borrow_mut().replace(task.clone())),
    };

    let completed = task.poll();

    if completed {
        task.state
            .store(TaskState::Complete as u8, Ordering::Release);
        return;
    }

    // Pending: CAS Running→Waiting. Failure means the waker already fired
    // and moved us to Ready — re-post so the wakeup is not lost.
    if task
        .state
        .compare_exchange(
            TaskState::Running as u8,
            TaskState::Waiting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        let t = task.clone();
        task.executor.post_boxed(Box::new(move || run_task(t)));
    }
}

/// The task being polled on this thread, if any.
pub(crate) fn current_task() -> Option<Arc<Task>> {
    CURRENT_TASK.with(|c| c.borrow().clone())
}

/// Executor of the running task (`co_await this_executor` analogue).
pub fn current_executor() -> Option<AnyExecutor> {
    current_task().map(|t| t.executor().clone())
}

/// Stop token of the running task; an empty token outside a task.
pub(crate) fn current_stop_token() -> StopToken {
    current_task()
        .map(|t| t.stop_token())
        .unwrap_or_else(StopToken::none)
}

/// Cooperative reschedule: yields to the executor queue once.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::AsAnyExecutor;
    use crate::reactor::Reactor;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn task_runs_to_completion() {
        let reactor = Reactor::new().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let task = Task::new(
            Box::pin(async move {
                ran2.fetch_add(1, Ordering::SeqCst);
            }),
            reactor.executor().as_any(),
            StopToken::none(),
        );
        task.schedule();
        reactor.run();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(task.state(), TaskState::Complete);
    }

    #[test]
    fn yield_now_resumes_via_executor() {
        let reactor = Reactor::new().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let task = Task::new(
            Box::pin(async move {
                yield_now().await;
                yield_now().await;
                ran2.fetch_add(1, Ordering::SeqCst);
            }),
            reactor.executor().as_any(),
            StopToken::none(),
        );
        task.schedule();
        reactor.run();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn current_executor_visible_inside_task() {
        let reactor = Reactor::new().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let task = Task::new(
            Box::pin(async move {
                if current_executor().is_some() {
                    seen2.fetch_add(1, Ordering::SeqCst);
                }
            }),
            reactor.executor().as_any(),
            StopToken::none(),
        );
        task.schedule();
        reactor.run();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(current_executor().is_none());
    }

    #[test]
    fn panicking_task_invokes_notify() {
        let reactor = Reactor::new().unwrap();
        let notified = Arc::new(AtomicUsize::new(0));
        let task = Task::new(
            Box::pin(async {
                panic!("boom");
            }),
            reactor.executor().as_any(),
            StopToken::none(),
        );
        let n2 = notified.clone();
        task.set_panic_notify(Box::new(move || {
            n2.fetch_add(1, Ordering::SeqCst);
        }));
        task.schedule();
        reactor.run();
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(task.state(), TaskState::Complete);
    }
}
