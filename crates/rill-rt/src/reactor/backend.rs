// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! OS readiness-multiplexer abstraction.
//!
//! A backend owns the kernel-side wait primitive and a cross-thread wakeup
//! channel. The reactor reconciles interest from its fd slots; the backend
//! only knows masks. `wait` is called from the reactor thread; `wakeup` and
//! interest updates may arrive from any thread.

use std::io;
use std::time::Duration;

use crate::error::ErrorKind;

/// One readiness event as reported by the kernel.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: i32,
    pub readable: bool,
    pub writable: bool,
    /// HUP / RDHUP / ERR class condition was reported.
    pub error: bool,
    /// Closest error kind for the condition, when one can be derived
    /// (HUP/RDHUP → `Eof`, ERR alone → `ConnectionReset`).
    pub hint: Option<ErrorKind>,
}

/// Readiness multiplexer contract.
///
/// Extra wakeups are harmless: the wakeup channel is drained inside `wait`
/// and never surfaces as an `Event`.
pub trait Backend: Send + Sync {
    /// Reconcile kernel-side interest for `fd` to exactly the given mask.
    /// An all-false mask removes the fd.
    fn update_interest(&self, fd: i32, want_read: bool, want_write: bool) -> io::Result<()>;

    /// Drop all interest for `fd`. Must tolerate an fd that was already
    /// closed (the kernel auto-removes closed fds).
    fn remove_interest(&self, fd: i32);

    /// Block up to `max_wait` (`None` = indefinitely) and append readiness
    /// events to `out`. Returns the number of events appended.
    fn wait(&self, max_wait: Option<Duration>, out: &mut Vec<Event>) -> io::Result<usize>;

    /// Interrupt a concurrent `wait` from any thread.
    fn wakeup(&self);
}
