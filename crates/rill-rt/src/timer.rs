// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Steady-clock timer.
//!
//! Each `wait()` arms a fresh timer operation. `cancel()` aborts the
//! pending wait; setting a new expiry cancels the previous one.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::executor::IoExecutor;
use crate::reactor::op::WaitCell;
use crate::reactor::wait::OpWait;
use crate::reactor::TimerHandle;
use crate::task;

struct TimerSt {
    expiry: Instant,
    handle: Option<TimerHandle>,
}

/// A single-pending-wait timer bound to one reactor.
pub struct SteadyTimer {
    ex: IoExecutor,
    st: Mutex<TimerSt>,
}

impl SteadyTimer {
    pub fn new(ex: IoExecutor) -> Self {
        SteadyTimer {
            ex,
            st: Mutex::new(TimerSt {
                expiry: Instant::now(),
                handle: None,
            }),
        }
    }

    pub fn expiry(&self) -> Instant {
        self.st.lock().unwrap().expiry
    }

    /// Set an absolute expiry; cancels a pending wait.
    pub fn expires_at(&self, at: Instant) {
        self.st.lock().unwrap().expiry = at;
        self.cancel();
    }

    /// Set an expiry relative to now; cancels a pending wait.
    pub fn expires_after(&self, after: Duration) {
        self.expires_at(Instant::now() + after);
    }

    /// Wait until expiry.
    ///
    /// Resolves `Ok(())` on expiry, `Err(OperationAborted)` when cancelled
    /// (directly or through the task's stop token).
    pub async fn wait(&self) -> Result<()> {
        let expiry = self.st.lock().unwrap().expiry;
        let (cell, op) = WaitCell::new_op();
        let handle = self.ex.add_timer(expiry, op)?;
        self.st.lock().unwrap().handle = Some(handle.clone());

        let res = OpWait::new(cell, handle.clone()).await;
        {
            // Another wait may have re-armed in the meantime; only clear
            // our own registration.
            let mut st = self.st.lock().unwrap();
            if st
                .handle
                .as_ref()
                .is_some_and(|h| h.same_registration(&handle))
            {
                st.handle = None;
            }
        }
        res
    }

    /// Cancel the pending wait, if any.
    pub fn cancel(&self) {
        let handle = self.st.lock().unwrap().handle.take();
        if let Some(h) = handle {
            h.cancel();
        }
    }
}

impl Drop for SteadyTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Suspend the current task for `d`.
///
/// Requires a task context with a reactor-bound executor.
pub async fn sleep(d: Duration) -> Result<()> {
    let Some(io) = task::current_executor().and_then(|ex| ex.io()) else {
        return Err(crate::error::ErrorKind::NotOpen);
    };
    let timer = SteadyTimer::new(io);
    timer.expires_after(d);
    timer.wait().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::reactor::Reactor;
    use crate::spawn::spawn_detached;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn timer_expires() {
        let reactor = Reactor::new().unwrap();
        let ex = reactor.executor();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let ex2 = ex.clone();
        spawn_detached(&ex, async move {
            let timer = SteadyTimer::new(ex2);
            timer.expires_after(Duration::from_millis(5));
            timer.wait().await.unwrap();
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        let start = Instant::now();
        reactor.run();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() >= Duration::from_millis(4));
    }

    #[test]
    fn cancel_aborts_wait() {
        let reactor = Reactor::new().unwrap();
        let ex = reactor.executor();
        let seen = Arc::new(Mutex::new(None));

        let timer = Arc::new(SteadyTimer::new(ex.clone()));
        timer.expires_after(Duration::from_secs(60));

        {
            let timer = timer.clone();
            let seen = seen.clone();
            spawn_detached(&ex, async move {
                *seen.lock().unwrap() = Some(timer.wait().await);
            });
        }
        {
            let timer = timer.clone();
            spawn_detached(&ex, async move {
                timer.cancel();
            });
        }

        reactor.run();
        assert_eq!(
            seen.lock().unwrap().take().unwrap(),
            Err(ErrorKind::OperationAborted)
        );
    }

    #[test]
    fn sleep_helper() {
        let reactor = Reactor::new().unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = done.clone();
        spawn_detached(&reactor.executor(), async move {
            sleep(Duration::from_millis(2)).await.unwrap();
            done2.fetch_add(1, Ordering::SeqCst);
        });
        reactor.run();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rearm_cancels_previous_wait() {
        let reactor = Reactor::new().unwrap();
        let ex = reactor.executor();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let timer = Arc::new(SteadyTimer::new(ex.clone()));
        timer.expires_after(Duration::from_secs(60));

        {
            let timer = timer.clone();
            let seen = seen.clone();
            spawn_detached(&ex, async move {
                let r = timer.wait().await;
                seen.lock().unwrap().push(r);
            });
        }
        {
            let timer = timer.clone();
            let seen = seen.clone();
            spawn_detached(&ex, async move {
                // Re-arm with a short expiry: the first wait aborts, this
                // one fires.
                timer.expires_after(Duration::from_millis(5));
                let r = timer.wait().await;
                seen.lock().unwrap().push(r);
            });
        }

        reactor.run();
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&Err(ErrorKind::OperationAborted)));
        assert!(seen.contains(&Ok(())));
    }
}
