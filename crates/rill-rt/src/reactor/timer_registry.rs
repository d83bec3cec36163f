// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer slots over a binary min-heap.
//!
//! Tokens are `(slot index, generation)` pairs; the generation increments on
//! every recycle so a stale token cannot cancel a timer that reused the slot.
//! Generation 0 is reserved for "invalid" — wraparound skips it.
//!
//! Cancellation is lazy: `cancel` takes the op out and marks the node, the
//! heap entry stays until `process_expired` drains it. `next_timeout`
//! therefore reports 0 for a cancelled root to force a prompt drain pass.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::reactor::op::OpBox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Pending,
    Fired,
    Cancelled,
}

/// Identifies one timer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    pub index: u32,
    pub generation: u64,
}

impl TimerToken {
    pub fn invalid() -> Self {
        TimerToken {
            index: 0,
            generation: 0,
        }
    }

    pub fn valid(self) -> bool {
        self.generation != 0
    }
}

struct TimerNode {
    expiry: Instant,
    op: Option<OpBox>,
    generation: u64,
    state: TimerState,
}

/// One drained entry: the op plus whether it fired (vs. was cancelled).
pub struct ReadyTimer {
    pub op: OpBox,
    pub fired: bool,
}

pub struct TimerRegistry {
    nodes: Vec<TimerNode>,
    heap: BinaryHeap<Reverse<(Instant, u32)>>,
    free: Vec<u32>,
    active_count: usize,
}

impl TimerRegistry {
    pub fn new() -> Self {
        TimerRegistry {
            nodes: Vec::new(),
            heap: BinaryHeap::new(),
            free: Vec::new(),
            active_count: 0,
        }
    }

    pub fn add(&mut self, expiry: Instant, op: OpBox) -> TimerToken {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.nodes.push(TimerNode {
                    expiry,
                    op: None,
                    generation: 1,
                    state: TimerState::Fired,
                });
                (self.nodes.len() - 1) as u32
            }
        };

        let node = &mut self.nodes[index as usize];
        node.expiry = expiry;
        node.op = Some(op);
        node.state = TimerState::Pending;
        if node.generation == 0 {
            node.generation = 1;
        }
        self.active_count += 1;

        self.heap.push(Reverse((expiry, index)));

        TimerToken {
            index,
            generation: node.generation,
        }
    }

    /// Take the op out iff the token matches a pending node.
    ///
    /// The heap entry is left behind; the node is recycled when the drain
    /// pass reaches it. Stale or already-settled tokens return `None`.
    pub fn cancel(&mut self, tok: TimerToken) -> Option<OpBox> {
        if !tok.valid() || tok.index as usize >= self.nodes.len() {
            return None;
        }
        let node = &mut self.nodes[tok.index as usize];
        if node.generation != tok.generation || node.state != TimerState::Pending {
            return None;
        }
        node.state = TimerState::Cancelled;
        node.op.take()
    }

    /// Time until the earliest pending expiry.
    ///
    /// `Some(0)` when the root is expired or cancelled (drain needed);
    /// `None` when no timers exist.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        let &Reverse((_, index)) = self.heap.peek()?;
        let node = &self.nodes[index as usize];
        if node.state == TimerState::Cancelled {
            return Some(Duration::ZERO);
        }
        if node.expiry <= now {
            return Some(Duration::ZERO);
        }
        Some(node.expiry - now)
    }

    /// Pop every cancelled or expired root.
    ///
    /// Returns the ops for the caller to invoke AFTER releasing the registry
    /// lock — callbacks may re-enter (posting or cancelling timers).
    pub fn process_expired(&mut self, stopped: bool, now: Instant) -> Vec<ReadyTimer> {
        let mut ready = Vec::new();
        loop {
            if stopped {
                break;
            }
            let Some(&Reverse((_, index))) = self.heap.peek() else {
                break;
            };
            let state = self.nodes[index as usize].state;

            if state == TimerState::Cancelled {
                self.heap.pop();
                let op = self.nodes[index as usize].op.take();
                self.recycle(index);
                if let Some(op) = op {
                    ready.push(ReadyTimer { op, fired: false });
                }
                continue;
            }

            if self.nodes[index as usize].expiry > now {
                break;
            }

            self.heap.pop();
            if state != TimerState::Pending {
                // Already settled under an older heap entry.
                self.recycle(index);
                continue;
            }

            self.nodes[index as usize].state = TimerState::Fired;
            let op = self.nodes[index as usize].op.take();
            self.recycle(index);
            if let Some(op) = op {
                ready.push(ReadyTimer { op, fired: true });
            }
        }
        ready
    }

    /// Take every op out, pending or cancelled; used on teardown.
    pub fn drain_all(&mut self) -> Vec<OpBox> {
        let mut out = Vec::new();
        for node in &mut self.nodes {
            if let Some(op) = node.op.take() {
                out.push(op);
            }
            node.state = TimerState::Fired;
            node.generation = node.generation.wrapping_add(1);
            if node.generation == 0 {
                node.generation = 1;
            }
        }
        self.heap.clear();
        self.free.clear();
        self.nodes.clear();
        self.active_count = 0;
        out
    }

    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    fn recycle(&mut self, index: u32) {
        let node = &mut self.nodes[index as usize];
        node.op = None;
        node.state = TimerState::Fired;
        node.generation = node.generation.wrapping_add(1);
        if node.generation == 0 {
            node.generation = 1;
        }
        self.free.push(index);
        if self.active_count > 0 {
            self.active_count -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::reactor::op::ReactorOp;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountOp {
        completes: Arc<AtomicUsize>,
        aborts: Arc<AtomicUsize>,
    }

    impl ReactorOp for CountOp {
        fn complete(self: Box<Self>) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }
        fn abort(self: Box<Self>, _err: ErrorKind) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counted() -> (OpBox, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let c = Arc::new(AtomicUsize::new(0));
        let a = Arc::new(AtomicUsize::new(0));
        (
            Box::new(CountOp {
                completes: c.clone(),
                aborts: a.clone(),
            }),
            c,
            a,
        )
    }

    #[test]
    fn expired_timer_fires_once() {
        let mut reg = TimerRegistry::new();
        let now = Instant::now();
        let (op, c, a) = counted();
        reg.add(now, op);

        let ready = reg.process_expired(false, now + Duration::from_millis(1));
        assert_eq!(ready.len(), 1);
        for r in ready {
            assert!(r.fired);
            r.op.complete();
        }
        assert_eq!(c.load(Ordering::SeqCst), 1);
        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn cancel_then_stale_token_does_not_touch_recycled_slot() {
        let mut reg = TimerRegistry::new();
        let now = Instant::now();

        let (op1, _, a1) = counted();
        let t1 = reg.add(now + Duration::from_millis(1), op1);
        reg.cancel(t1).unwrap().abort(ErrorKind::OperationAborted);
        assert_eq!(a1.load(Ordering::SeqCst), 1);

        // Drain the cancelled node so the slot is recycled.
        let ready = reg.process_expired(false, now);
        assert!(ready.is_empty());

        // T2 reuses the slot with a bumped generation.
        let (op2, c2, a2) = counted();
        let t2 = reg.add(now + Duration::from_millis(1), op2);
        assert_eq!(t2.index, t1.index);
        assert_ne!(t2.generation, t1.generation);

        // Cancelling with T1's token must not affect T2.
        assert!(reg.cancel(t1).is_none());

        let ready = reg.process_expired(false, now + Duration::from_millis(5));
        assert_eq!(ready.len(), 1);
        for r in ready {
            assert!(r.fired);
            r.op.complete();
        }
        assert_eq!(c2.load(Ordering::SeqCst), 1);
        assert_eq!(a2.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn next_timeout_reports_cancelled_root_as_zero() {
        let mut reg = TimerRegistry::new();
        let now = Instant::now();
        let (op, _, _) = counted();
        let tok = reg.add(now + Duration::from_secs(60), op);
        assert!(reg.next_timeout(now).unwrap() > Duration::from_secs(1));

        drop(reg.cancel(tok));
        assert_eq!(reg.next_timeout(now), Some(Duration::ZERO));
    }

    #[test]
    fn heap_orders_by_expiry() {
        let mut reg = TimerRegistry::new();
        let now = Instant::now();
        let (late, _, _) = counted();
        let (early, c_early, _) = counted();
        reg.add(now + Duration::from_millis(50), late);
        reg.add(now + Duration::from_millis(5), early);

        assert_eq!(reg.next_timeout(now), Some(Duration::from_millis(5)));

        let ready = reg.process_expired(false, now + Duration::from_millis(10));
        assert_eq!(ready.len(), 1);
        for r in ready {
            r.op.complete();
        }
        assert_eq!(c_early.load(Ordering::SeqCst), 1);
        assert!(!reg.is_empty());
    }

    #[test]
    fn stopped_drain_returns_nothing() {
        let mut reg = TimerRegistry::new();
        let now = Instant::now();
        let (op, _, _) = counted();
        reg.add(now, op);
        assert!(reg.process_expired(true, now).is_empty());
        assert!(!reg.is_empty());
    }

    #[test]
    fn interleaved_add_cancel_reuses_slots() {
        let mut reg = TimerRegistry::new();
        let now = Instant::now();
        let mut tokens = Vec::new();
        for i in 0..32 {
            let (op, _, _) = counted();
            tokens.push(reg.add(now + Duration::from_millis(i), op));
        }
        for tok in tokens.iter().step_by(2) {
            if let Some(op) = reg.cancel(*tok) {
                op.abort(ErrorKind::OperationAborted);
            }
        }
        let ready = reg.process_expired(false, now + Duration::from_millis(100));
        assert_eq!(ready.len(), 16);
        assert!(ready.iter().all(|r| r.fired));
        for r in ready {
            r.op.complete();
        }
        // All stale tokens are now dead.
        for tok in tokens {
            assert!(reg.cancel(tok).is_none());
        }
        assert!(reg.is_empty());
    }
}
