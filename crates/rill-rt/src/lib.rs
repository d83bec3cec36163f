// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! rill runtime core.
//!
//! A single-threaded async I/O runtime: readiness reactor (epoll, or
//! io_uring behind the `uring` feature), owned-future tasks, spawn with
//! three completion modes, stop tokens, steady timers, and awaitable
//! combinators.
//!
//! Components:
//! - reactor — run loop, fd/timer registries, posted work, backends
//! - executor — io executor, type-erased executor, strand
//! - task/spawn — task state machine, detach/join/callback completion
//! - stop — stop sources/tokens, scoped stop timeout
//! - timer — steady timer, sleep
//! - combinators — when_all, when_any, cancel-join, race, with_timeout
//! - event — notify/condition events

pub mod combinators;
pub mod error;
pub mod event;
pub mod executor;
pub mod reactor;
pub mod spawn;
pub mod stop;
pub mod task;
pub mod timer;

pub use combinators::{
    race, when_all, when_all2, when_any, when_any2, when_any_cancel_join, with_timeout, Either,
};
pub use error::{ErrorKind, Result};
pub use event::{ConditionEvent, NotifyEvent};
pub use executor::{AnyExecutor, AsAnyExecutor, IoExecutor, Strand};
pub use reactor::{FdEventHandle, FdEventKind, Reactor, TimerHandle, WorkGuard};
pub use spawn::{spawn, spawn_detached, spawn_with_callback, spawn_with_token, JoinHandle};
pub use stop::{current_stop_token, ScopedStopTimeout, StopRegistration, StopSource, StopToken};
pub use task::{current_executor, yield_now};
pub use timer::{sleep, SteadyTimer};
