// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cross-thread posted-work queue.
//!
//! A mutex-protected queue of one-shot thunks, drained on the reactor
//! thread. Thunks left unexecuted when the reactor stops mid-drain are
//! pushed back in order so a later `restart` + `run` picks them up.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Move-only one-shot work item.
pub type Thunk = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct PostedQueue {
    queue: Mutex<VecDeque<Thunk>>,
}

impl PostedQueue {
    pub fn new() -> Self {
        PostedQueue {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, f: Thunk) {
        self.queue.lock().unwrap().push_back(f);
    }

    /// Swap the queue out under the lock; the caller executes outside it.
    pub fn take_all(&self) -> VecDeque<Thunk> {
        std::mem::take(&mut *self.queue.lock().unwrap())
    }

    /// Take just the oldest thunk.
    pub fn take_one(&self) -> Option<Thunk> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Return unexecuted thunks to the front, preserving order.
    pub fn push_back_front(&self, mut rest: VecDeque<Thunk>) {
        let mut q = self.queue.lock().unwrap();
        while let Some(f) = rest.pop_back() {
            q.push_front(f);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn drains_in_fifo_order() {
        let q = PostedQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let log = log.clone();
            q.push(Box::new(move || log.lock().unwrap().push(i)));
        }
        for f in q.take_all() {
            f();
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn push_back_front_preserves_order() {
        let q = PostedQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ran = ran.clone();
            q.push(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let mut taken = q.take_all();
        // Run one, pretend we were stopped, push the rest back.
        taken.pop_front().unwrap()();
        q.push_back_front(taken);
        assert_eq!(q.len(), 2);

        for f in q.take_all() {
            f();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cross_thread_push() {
        let q = Arc::new(PostedQueue::new());
        let ran = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let q = q.clone();
            let ran = ran.clone();
            handles.push(std::thread::spawn(move || {
                q.push(Box::new(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for f in q.take_all() {
            f();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 8);
    }
}
