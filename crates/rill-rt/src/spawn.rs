// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Spawning tasks with three completion modes.
//!
//! - `spawn_detached`: fire-and-forget; the outcome (including panics) is
//!   swallowed.
//! - `spawn`: returns a `JoinHandle` whose await yields the result.
//!   Dropping the handle does not cancel the task.
//! - `spawn_with_callback`: delivers `Result<T, ErrorKind>` to a callback
//!   on the task's executor; callback panics are swallowed.
//!
//! Spawned tasks inherit the spawning task's stop token unless one is given
//! explicitly.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::{ErrorKind, Result};
use crate::executor::AsAnyExecutor;
use crate::stop::StopToken;
use crate::task::{self, Task};

struct JoinInner<T> {
    value: Option<Result<T>>,
    done: bool,
    waiter: Option<Waker>,
    taken: bool,
}

pub(crate) struct JoinState<T> {
    st: Mutex<JoinInner<T>>,
}

impl<T> JoinState<T> {
    fn new() -> Arc<Self> {
        Arc::new(JoinState {
            st: Mutex::new(JoinInner {
                value: None,
                done: false,
                waiter: None,
                taken: false,
            }),
        })
    }

    fn finish(&self, value: Result<T>) {
        let waiter = {
            let mut st = self.st.lock().unwrap();
            if st.done {
                return;
            }
            st.value = Some(value);
            st.done = true;
            st.waiter.take()
        };
        if let Some(w) = waiter {
            w.wake();
        }
    }
}

/// Awaitable join over a spawned task.
///
/// At most one await yields the value; a second await after the value was
/// taken resolves to `Err(Busy)`. A task that panicked resolves to
/// `Err(OperationAborted)`.
pub struct JoinHandle<T> {
    state: Arc<JoinState<T>>,
}

impl<T> JoinHandle<T> {
    pub fn is_finished(&self) -> bool {
        self.state.st.lock().unwrap().done
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut st = self.state.st.lock().unwrap();
        if let Some(v) = st.value.take() {
            st.taken = true;
            return Poll::Ready(v);
        }
        if st.taken {
            return Poll::Ready(Err(ErrorKind::Busy));
        }
        st.waiter = Some(cx.waker().clone());
        Poll::Pending
    }
}

fn inherited_token() -> StopToken {
    task::current_task()
        .map(|t| t.stop_token())
        .unwrap_or_else(StopToken::none)
}

pub(crate) fn spawn_raw<E, F>(
    ex: &E,
    fut: F,
    token: StopToken,
    panic_notify: Option<Box<dyn FnOnce() + Send>>,
) -> Arc<Task>
where
    E: AsAnyExecutor,
    F: Future<Output = ()> + Send + 'static,
{
    let task = Task::new(Box::pin(fut), ex.as_any(), token);
    if let Some(notify) = panic_notify {
        task.set_panic_notify(notify);
    }
    task.schedule();
    task
}

/// Fire-and-forget spawn. Panics inside the task are swallowed.
pub fn spawn_detached<E, F>(ex: &E, fut: F)
where
    E: AsAnyExecutor,
    F: Future<Output = ()> + Send + 'static,
{
    let _ = spawn_raw(ex, fut, inherited_token(), None);
}

/// Spawn with an awaitable join handle.
pub fn spawn<E, F, T>(ex: &E, fut: F) -> JoinHandle<T>
where
    E: AsAnyExecutor,
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    spawn_with_token(ex, fut, inherited_token())
}

/// `spawn` with an explicit stop token instead of the inherited one.
pub fn spawn_with_token<E, F, T>(ex: &E, fut: F, token: StopToken) -> JoinHandle<T>
where
    E: AsAnyExecutor,
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let state = JoinState::new();
    let st = state.clone();
    let wrapper = async move {
        let v = fut.await;
        st.finish(Ok(v));
    };
    let st = state.clone();
    let _ = spawn_raw(
        ex,
        wrapper,
        token,
        Some(Box::new(move || st.finish(Err(ErrorKind::OperationAborted)))),
    );
    JoinHandle { state }
}

/// Spawn and deliver the outcome to `callback` when the task finishes.
pub fn spawn_with_callback<E, F, T, C>(ex: &E, fut: F, callback: C)
where
    E: AsAnyExecutor,
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
    C: FnOnce(Result<T>) + Send + 'static,
{
    let slot: Arc<Mutex<Option<C>>> = Arc::new(Mutex::new(Some(callback)));
    let slot2 = slot.clone();
    let wrapper = async move {
        let v = fut.await;
        if let Some(cb) = slot2.lock().unwrap().take() {
            // Callback exceptions are swallowed.
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(Ok(v))));
        }
    };
    let _ = spawn_raw(
        ex,
        wrapper,
        inherited_token(),
        Some(Box::new(move || {
            if let Some(cb) = slot.lock().unwrap().take() {
                let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    cb(Err(ErrorKind::OperationAborted))
                }));
            }
        })),
    );
}
