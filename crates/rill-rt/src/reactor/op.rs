// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Type-erased reactor completion objects.
//!
//! An operation is handed to a registry when armed and handed back exactly
//! once: either `complete` (readiness/expiry arrived) or `abort` (cancelled,
//! deregistered, or reactor teardown). Consuming `self: Box<Self>` makes the
//! exactly-once contract structural — the op is dropped right after.

use std::sync::{Arc, Mutex};
use std::task::{Poll, Waker};

use crate::error::{ErrorKind, Result};

/// A one-shot reactor completion.
pub trait ReactorOp: Send {
    /// The awaited readiness (or timer expiry) arrived.
    fn complete(self: Box<Self>);

    /// The registration was cancelled, replaced, or torn down.
    fn abort(self: Box<Self>, err: ErrorKind);
}

/// Boxed reactor operation as stored in the registries.
pub type OpBox = Box<dyn ReactorOp>;

enum CellOutcome {
    Pending,
    Done,
    Aborted(ErrorKind),
}

struct CellState {
    outcome: CellOutcome,
    waker: Option<Waker>,
}

/// Shared completion cell bridging a reactor op and an awaiting future.
///
/// The op side writes the outcome and wakes; the future side polls the
/// outcome and parks its waker. Either side may run first — an outcome
/// written before the first poll is observed on that poll.
pub struct WaitCell {
    st: Mutex<CellState>,
}

impl WaitCell {
    /// New cell plus the reactor op that resolves it.
    pub fn new_op() -> (Arc<WaitCell>, OpBox) {
        let cell = Arc::new(WaitCell {
            st: Mutex::new(CellState {
                outcome: CellOutcome::Pending,
                waker: None,
            }),
        });
        let op = Box::new(CellOp {
            cell: cell.clone(),
        });
        (cell, op)
    }

    fn finish(&self, outcome: CellOutcome) {
        let waker = {
            let mut st = self.st.lock().unwrap();
            debug_assert!(matches!(st.outcome, CellOutcome::Pending));
            st.outcome = outcome;
            st.waker.take()
        };
        // Wake outside the lock; the waker re-posts a task and may take
        // other locks.
        if let Some(w) = waker {
            w.wake();
        }
    }

    /// Poll the outcome, parking `waker` while still pending.
    pub fn poll_outcome(&self, waker: &Waker) -> Poll<Result<()>> {
        let mut st = self.st.lock().unwrap();
        match st.outcome {
            CellOutcome::Pending => {
                st.waker = Some(waker.clone());
                Poll::Pending
            }
            CellOutcome::Done => Poll::Ready(Ok(())),
            CellOutcome::Aborted(err) => Poll::Ready(Err(err)),
        }
    }

    /// Non-blocking check without parking a waker.
    pub fn is_settled(&self) -> bool {
        !matches!(self.st.lock().unwrap().outcome, CellOutcome::Pending)
    }
}

struct CellOp {
    cell: Arc<WaitCell>,
}

impl ReactorOp for CellOp {
    fn complete(self: Box<Self>) {
        self.cell.finish(CellOutcome::Done);
    }

    fn abort(self: Box<Self>, err: ErrorKind) {
        self.cell.finish(CellOutcome::Aborted(err));
    }
}
