// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Async events for cross-task signalling.
//!
//! `NotifyEvent` is a one-shot latch: once notified it stays set and every
//! past or future waiter resumes. `ConditionEvent` is auto-reset: each
//! notify releases at most one waiter, and a notify with no waiter is
//! remembered for the next wait.
//!
//! Resumptions go through task wakers, so they are posted onto each
//! waiter's executor — never run inline in the notifier.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

#[derive(Default)]
struct NotifyInner {
    set: bool,
    waiters: Vec<Waker>,
}

/// One-shot latch.
#[derive(Clone, Default)]
pub struct NotifyEvent {
    st: Arc<Mutex<NotifyInner>>,
}

impl NotifyEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event and wake all waiters. Idempotent.
    pub fn notify(&self) {
        let waiters = {
            let mut st = self.st.lock().unwrap();
            st.set = true;
            std::mem::take(&mut st.waiters)
        };
        for w in waiters {
            w.wake();
        }
    }

    pub fn is_set(&self) -> bool {
        self.st.lock().unwrap().set
    }

    /// Wait until the event is set. Completes immediately if already set.
    pub fn wait(&self) -> NotifyWait {
        NotifyWait {
            ev: self.clone(),
        }
    }
}

pub struct NotifyWait {
    ev: NotifyEvent,
}

impl Future for NotifyWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut st = self.ev.st.lock().unwrap();
        if st.set {
            Poll::Ready(())
        } else {
            st.waiters.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

struct CondWaiter {
    st: Mutex<(bool, Option<Waker>)>,
}

#[derive(Default)]
struct CondInner {
    set: bool,
    waiters: VecDeque<Arc<CondWaiter>>,
}

/// Auto-reset event: one waiter per notify, FIFO.
#[derive(Clone, Default)]
pub struct ConditionEvent {
    st: Arc<Mutex<CondInner>>,
}

impl ConditionEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release the oldest waiter, or remember the signal when none waits.
    pub fn notify_one(&self) {
        let woken = {
            let mut st = self.st.lock().unwrap();
            match st.waiters.pop_front() {
                Some(w) => Some(w),
                None => {
                    st.set = true;
                    None
                }
            }
        };
        if let Some(w) = woken {
            let waker = {
                let mut ws = w.st.lock().unwrap();
                ws.0 = true;
                ws.1.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }

    /// Release every current waiter; the stored signal is untouched.
    pub fn notify_all(&self) {
        let woken: Vec<Arc<CondWaiter>> = {
            let mut st = self.st.lock().unwrap();
            st.waiters.drain(..).collect()
        };
        for w in woken {
            let waker = {
                let mut ws = w.st.lock().unwrap();
                ws.0 = true;
                ws.1.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }

    /// Wait for a signal. Consumes a stored signal immediately.
    pub fn wait(&self) -> CondWait {
        CondWait {
            ev: self.clone(),
            waiter: None,
        }
    }
}

pub struct CondWait {
    ev: ConditionEvent,
    waiter: Option<Arc<CondWaiter>>,
}

impl Future for CondWait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(w) = &self.waiter {
            let mut ws = w.st.lock().unwrap();
            if ws.0 {
                return Poll::Ready(());
            }
            ws.1 = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let mut st = self.ev.st.lock().unwrap();
        if st.set {
            st.set = false;
            return Poll::Ready(());
        }
        let w = Arc::new(CondWaiter {
            st: Mutex::new((false, Some(cx.waker().clone()))),
        });
        st.waiters.push_back(w.clone());
        drop(st);
        self.waiter = Some(w);
        Poll::Pending
    }
}

impl Drop for CondWait {
    fn drop(&mut self) {
        // Unqueue so a pending notify is not consumed by a dead waiter.
        if let Some(w) = self.waiter.take() {
            let consumed = w.st.lock().unwrap().0;
            let mut st = self.ev.st.lock().unwrap();
            if consumed {
                return;
            }
            st.waiters.retain(|q| !Arc::ptr_eq(q, &w));
        }
    }
}
