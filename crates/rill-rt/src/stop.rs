// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative stop tokens.
//!
//! A `StopSource` owns the shared state; `StopToken`s are cheap read-only
//! views; callbacks registered on a token fire exactly once when stop is
//! requested. Registrations are RAII — dropping one deactivates the
//! callback so it cannot race a concurrent `request_stop`.
//!
//! `ScopedStopTimeout` installs a combined source on the current task that
//! fires on upstream stop OR after a delay, restoring the previous token on
//! drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::reactor::op::WaitCell;
use crate::reactor::wait::OpWait;
use crate::reactor::TimerHandle;
use crate::task;

struct CallbackNode {
    active: AtomicBool,
    f: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CallbackNode {
    fn fire(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(f) = self.f.lock().unwrap().take() {
                f();
            }
        }
    }
}

#[derive(Default)]
struct Callbacks {
    next_id: u64,
    map: HashMap<u64, Arc<CallbackNode>>,
}

struct StopState {
    stopped: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

impl StopState {
    fn new() -> Arc<Self> {
        Arc::new(StopState {
            stopped: AtomicBool::new(false),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }
}

/// Owner side; requests stop.
#[derive(Clone)]
pub struct StopSource {
    st: Arc<StopState>,
}

impl StopSource {
    pub fn new() -> Self {
        StopSource {
            st: StopState::new(),
        }
    }

    pub fn token(&self) -> StopToken {
        StopToken {
            st: Some(self.st.clone()),
        }
    }

    /// Fire all registered callbacks. Idempotent.
    pub fn request_stop(&self) {
        if self.st.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let nodes: Vec<Arc<CallbackNode>> = {
            let mut cbs = self.st.callbacks.lock().unwrap();
            cbs.map.drain().map(|(_, n)| n).collect()
        };
        // Invoke outside the lock; callbacks may call back into the
        // runtime (cancelling timers, posting work).
        for node in nodes {
            node.fire();
        }
    }
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of a stop source. An empty token never stops.
#[derive(Clone, Default)]
pub struct StopToken {
    st: Option<Arc<StopState>>,
}

impl StopToken {
    /// Token that can never be stopped.
    pub fn none() -> Self {
        StopToken { st: None }
    }

    pub fn stop_requested(&self) -> bool {
        match &self.st {
            Some(st) => st.stopped.load(Ordering::Acquire),
            None => false,
        }
    }

    /// Register `f` to run when stop is requested.
    ///
    /// If stop was already requested, `f` runs immediately and the returned
    /// registration is inert.
    pub fn register<F>(&self, f: F) -> StopRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(st) = &self.st else {
            return StopRegistration::inert();
        };
        if st.stopped.load(Ordering::Acquire) {
            f();
            return StopRegistration::inert();
        }

        let node = Arc::new(CallbackNode {
            active: AtomicBool::new(true),
            f: Mutex::new(Some(Box::new(f))),
        });

        {
            let mut cbs = st.callbacks.lock().unwrap();
            if !st.stopped.load(Ordering::Acquire) {
                let id = cbs.next_id;
                cbs.next_id += 1;
                cbs.map.insert(id, node.clone());
                return StopRegistration {
                    st: Some(st.clone()),
                    id,
                    node: Some(node),
                };
            }
        }

        // Stop raced in between the check and the insert.
        node.fire();
        StopRegistration::inert()
    }
}

/// RAII callback registration; dropping deactivates the callback.
pub struct StopRegistration {
    st: Option<Arc<StopState>>,
    id: u64,
    node: Option<Arc<CallbackNode>>,
}

impl StopRegistration {
    fn inert() -> Self {
        StopRegistration {
            st: None,
            id: 0,
            node: None,
        }
    }
}

impl Drop for StopRegistration {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            node.active.store(false, Ordering::Release);
        }
        if let Some(st) = self.st.take() {
            st.callbacks.lock().unwrap().map.remove(&self.id);
        }
    }
}

/// The stop token of the running task; `StopToken::none()` outside a task.
pub fn current_stop_token() -> StopToken {
    task::current_stop_token()
}

/// RAII scope that makes the current task stop after `delay`, or when the
/// task's previous token stops — whichever comes first. Dropping the scope
/// restores the previous token and disarms the timer.
pub struct ScopedStopTimeout {
    prev: Option<StopToken>,
    src: StopSource,
    timer: Option<TimerHandle>,
    _upstream: Option<StopRegistration>,
}

impl ScopedStopTimeout {
    /// Install on the current task. A zero delay fires immediately.
    ///
    /// Outside a task context the scope is inert.
    pub fn new(delay: Duration) -> Self {
        let src = StopSource::new();

        let Some(cur) = task::current_task() else {
            debug_assert!(false, "scoped stop timeout outside a task");
            return ScopedStopTimeout {
                prev: None,
                src,
                timer: None,
                _upstream: None,
            };
        };

        let prev = cur.swap_stop_token(src.token());

        let upstream = {
            let src = src.clone();
            prev.register(move || src.request_stop())
        };

        if delay.is_zero() {
            src.request_stop();
            return ScopedStopTimeout {
                prev: Some(prev),
                src,
                timer: None,
                _upstream: Some(upstream),
            };
        }

        // Arm the timer here, not in the watcher: the scope may be dropped
        // before the watcher's first poll, and cancelling an unarmed timer
        // would miss.
        let mut timer = None;
        if let (Some(io), Some(any)) = (
            task::current_executor().and_then(|ex| ex.io()),
            task::current_executor(),
        ) {
            let (cell, op) = WaitCell::new_op();
            if let Ok(handle) = io.add_timer(Instant::now() + delay, op) {
                timer = Some(handle.clone());
                let src2 = src.clone();
                crate::spawn::spawn_detached(&any, async move {
                    if OpWait::new(cell, handle).await.is_ok() {
                        src2.request_stop();
                    }
                });
            }
        }

        ScopedStopTimeout {
            prev: Some(prev),
            src,
            timer,
            _upstream: Some(upstream),
        }
    }

    /// Token installed by this scope.
    pub fn token(&self) -> StopToken {
        self.src.token()
    }
}

impl Drop for ScopedStopTimeout {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        if let Some(prev) = self.prev.take() {
            if let Some(cur) = task::current_task() {
                let _ = cur.swap_stop_token(prev);
            }
        }
    }
}
