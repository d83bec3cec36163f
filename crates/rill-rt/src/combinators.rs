// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Awaitable combinators.
//!
//! Children run concurrently as tasks on the caller's executor. `when_any`
//! leaves losers running; the cancel-join variants request stop on every
//! loser and await their completion before returning, so no loser is still
//! running when they return. `race` is the two-way cancel-join form.
//!
//! A panicking child surfaces as `Err(OperationAborted)` for that child.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::{ErrorKind, Result};
use crate::event::NotifyEvent;
use crate::executor::AnyExecutor;
use crate::spawn::{spawn_raw, spawn_with_token};
use crate::stop::{StopRegistration, StopSource};
use crate::task;
use crate::timer::SteadyTimer;

/// Result of a two-way `when_any`/`race`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Either<A, B> {
    Left(A),
    Right(B),
}

struct AnyInner<T> {
    result: Option<(usize, Result<T>)>,
    waker: Option<Waker>,
}

struct AnyState<T> {
    st: Mutex<AnyInner<T>>,
}

impl<T> AnyState<T> {
    fn new() -> Arc<Self> {
        Arc::new(AnyState {
            st: Mutex::new(AnyInner {
                result: None,
                waker: None,
            }),
        })
    }

    /// First completion wins; later ones are dropped.
    fn try_complete(&self, index: usize, value: Result<T>) {
        let waker = {
            let mut st = self.st.lock().unwrap();
            if st.result.is_some() {
                return;
            }
            st.result = Some((index, value));
            st.waker.take()
        };
        if let Some(w) = waker {
            w.wake();
        }
    }
}

struct AwaitAny<T> {
    state: Arc<AnyState<T>>,
}

impl<T> Future for AwaitAny<T> {
    type Output = (usize, Result<T>);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut st = self.state.st.lock().unwrap();
        if let Some(r) = st.result.take() {
            return Poll::Ready(r);
        }
        st.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

fn ambient_executor() -> Result<AnyExecutor> {
    task::current_executor().ok_or(ErrorKind::NotOpen)
}

/// Run all futures concurrently; wait for every one.
///
/// Returns the values in input order. If any child panicked, the first
/// such failure is returned — after all children completed.
pub async fn when_all<F, T>(futs: Vec<F>) -> Result<Vec<T>>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let ex = ambient_executor()?;
    let handles: Vec<_> = futs
        .into_iter()
        .map(|f| spawn_with_token(&ex, f, task::current_stop_token()))
        .collect();

    let mut values = Vec::with_capacity(handles.len());
    let mut first_err = None;
    for h in handles {
        match h.await {
            Ok(v) => values.push(v),
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(values),
    }
}

/// Two-way `when_all` over differently-typed futures.
pub async fn when_all2<FA, FB, A, B>(a: FA, b: FB) -> Result<(A, B)>
where
    FA: Future<Output = A> + Send + 'static,
    FB: Future<Output = B> + Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
{
    let ex = ambient_executor()?;
    let tok = task::current_stop_token();
    let ha = spawn_with_token(&ex, a, tok.clone());
    let hb = spawn_with_token(&ex, b, tok);
    let ra = ha.await;
    let rb = hb.await;
    Ok((ra?, rb?))
}

struct ChildSet<T> {
    state: Arc<AnyState<T>>,
    done: Vec<NotifyEvent>,
    sources: Vec<StopSource>,
    _upstream: Vec<StopRegistration>,
}

fn start_children<F, T>(ex: &AnyExecutor, futs: Vec<F>, own_sources: bool) -> ChildSet<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let parent = task::current_stop_token();
    let state = AnyState::new();
    let mut done = Vec::with_capacity(futs.len());
    let mut sources = Vec::new();
    let mut upstream = Vec::new();

    for (i, fut) in futs.into_iter().enumerate() {
        let token = if own_sources {
            let src = StopSource::new();
            // Parent stop propagates to each child source.
            let reg = {
                let src = src.clone();
                parent.register(move || src.request_stop())
            };
            let tok = src.token();
            sources.push(src);
            upstream.push(reg);
            tok
        } else {
            parent.clone()
        };

        let ev = NotifyEvent::new();
        done.push(ev.clone());

        let st = state.clone();
        let ev2 = ev.clone();
        let runner = async move {
            let v = fut.await;
            st.try_complete(i, Ok(v));
            ev2.notify();
        };
        let st = state.clone();
        let _ = spawn_raw(
            ex,
            runner,
            token,
            Some(Box::new(move || {
                st.try_complete(i, Err(ErrorKind::OperationAborted));
                ev.notify();
            })),
        );
    }

    ChildSet {
        state,
        done,
        sources,
        _upstream: upstream,
    }
}

/// Complete when the first future completes (or panics).
///
/// Losers keep running; use [`when_any_cancel_join`] to stop and await
/// them.
pub async fn when_any<F, T>(futs: Vec<F>) -> Result<(usize, T)>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    debug_assert!(!futs.is_empty(), "when_any requires at least one task");
    let ex = ambient_executor()?;
    let set = start_children(&ex, futs, false);
    let (index, result) = AwaitAny { state: set.state }.await;
    result.map(|v| (index, v))
}

/// `when_any` that requests stop on every loser and awaits their exit.
///
/// When this returns, no loser is still running.
pub async fn when_any_cancel_join<F, T>(futs: Vec<F>) -> Result<(usize, T)>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    debug_assert!(!futs.is_empty(), "when_any requires at least one task");
    let ex = ambient_executor()?;
    let set = start_children(&ex, futs, true);
    let (index, result) = AwaitAny {
        state: set.state.clone(),
    }
    .await;

    for (i, src) in set.sources.iter().enumerate() {
        if i != index {
            src.request_stop();
        }
    }
    for ev in &set.done {
        ev.wait().await;
    }

    result.map(|v| (index, v))
}

/// Two-way `when_any` over differently-typed futures. Losers keep running.
pub async fn when_any2<FA, FB, A, B>(a: FA, b: FB) -> Result<(usize, Either<A, B>)>
where
    FA: Future<Output = A> + Send + 'static,
    FB: Future<Output = B> + Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
{
    let wrapped: Vec<Pin<Box<dyn Future<Output = Either<A, B>> + Send>>> = vec![
        Box::pin(async move { Either::Left(a.await) }),
        Box::pin(async move { Either::Right(b.await) }),
    ];
    when_any(wrapped).await
}

/// Two-way cancel-join race — the `a || b` of the awaitable-operator
/// notation. Returns the winner index and value; the loser is stopped and
/// joined before returning.
pub async fn race<FA, FB, A, B>(a: FA, b: FB) -> Result<(usize, Either<A, B>)>
where
    FA: Future<Output = A> + Send + 'static,
    FB: Future<Output = B> + Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
{
    let wrapped: Vec<Pin<Box<dyn Future<Output = Either<A, B>> + Send>>> = vec![
        Box::pin(async move { Either::Left(a.await) }),
        Box::pin(async move { Either::Right(b.await) }),
    ];
    when_any_cancel_join(wrapped).await
}

/// Await `op` with a deadline.
///
/// On timer fire, `on_timeout` runs (typically a `cancel_read`-style hook)
/// and the operation is expected to resume with `OperationAborted`, which
/// is then mapped to `TimedOut`. The underlying operation is always awaited
/// to completion before returning — a `TimedOut` result guarantees the op
/// has exited. An abort that was not caused by this timer is passed through
/// unchanged. A zero deadline invokes the hook immediately and still awaits
/// the op.
pub async fn with_timeout<F, T, C>(
    op: F,
    timeout: std::time::Duration,
    on_timeout: C,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
    C: FnOnce() + Send + 'static,
{
    if timeout.is_zero() {
        // Still run the hook and await the op; skipping either could leak
        // a half-cancelled operation.
        on_timeout();
        let r = op.await;
        return match r {
            Err(ErrorKind::OperationAborted) => Err(ErrorKind::TimedOut),
            other => other,
        };
    }

    let ex = ambient_executor()?;
    let Some(io) = ex.io() else {
        return Err(ErrorKind::NotOpen);
    };

    let timer = Arc::new(SteadyTimer::new(io));
    timer.expires_after(timeout);

    let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
    // The watcher gets its own stop source: if the op finishes before the
    // watcher's wait has even armed, `timer.cancel()` alone would miss and
    // the watcher would sleep out the whole deadline.
    let watcher_src = StopSource::new();
    let watcher = {
        let timer = timer.clone();
        let fired = fired.clone();
        spawn_with_token(
            &ex,
            async move {
                if timer.wait().await.is_ok() {
                    fired.store(true, std::sync::atomic::Ordering::Release);
                    on_timeout();
                }
            },
            watcher_src.token(),
        )
    };

    let r = op.await;

    watcher_src.request_stop();
    timer.cancel();
    let _ = watcher.await;

    if fired.load(std::sync::atomic::Ordering::Acquire) {
        if let Err(ErrorKind::OperationAborted) = r {
            return Err(ErrorKind::TimedOut);
        }
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use crate::spawn::spawn_detached;
    use crate::timer::sleep;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn when_all_collects_in_order() {
        let reactor = Reactor::new().unwrap();
        let out = Arc::new(Mutex::new(None));
        let out2 = out.clone();
        spawn_detached(&reactor.executor(), async move {
            let futs: Vec<_> = (0..4)
                .map(|i| {
                    Box::pin(async move {
                        sleep(Duration::from_millis(8 - 2 * i)).await.unwrap();
                        i
                    }) as Pin<Box<dyn Future<Output = u64> + Send>>
                })
                .collect();
            *out2.lock().unwrap() = Some(when_all(futs).await);
        });
        reactor.run();
        assert_eq!(out.lock().unwrap().take().unwrap().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn when_all2_pairs_results() {
        let reactor = Reactor::new().unwrap();
        let out = Arc::new(Mutex::new(None));
        let out2 = out.clone();
        spawn_detached(&reactor.executor(), async move {
            let r = when_all2(async { 1u32 }, async { "two" }).await;
            *out2.lock().unwrap() = Some(r);
        });
        reactor.run();
        assert_eq!(out.lock().unwrap().take().unwrap().unwrap(), (1, "two"));
    }

    #[test]
    fn when_any_returns_first_and_leaves_losers() {
        let reactor = Reactor::new().unwrap();
        let loser_done = Arc::new(AtomicBool::new(false));
        let out = Arc::new(Mutex::new(None));
        let out2 = out.clone();
        let loser2 = loser_done.clone();
        spawn_detached(&reactor.executor(), async move {
            let futs: Vec<Pin<Box<dyn Future<Output = u32> + Send>>> = vec![
                Box::pin(async move {
                    sleep(Duration::from_millis(30)).await.ok();
                    loser2.store(true, Ordering::SeqCst);
                    1
                }),
                Box::pin(async {
                    sleep(Duration::from_millis(2)).await.ok();
                    2
                }),
            ];
            *out2.lock().unwrap() = Some(when_any(futs).await);
        });
        reactor.run();
        let (idx, v) = out.lock().unwrap().take().unwrap().unwrap();
        assert_eq!((idx, v), (1, 2));
        // The loser was not cancelled; the run loop drove it to completion.
        assert!(loser_done.load(Ordering::SeqCst));
    }

    #[test]
    fn timer_race_cancel_join() {
        let reactor = Reactor::new().unwrap();
        let out = Arc::new(Mutex::new(None));
        let out2 = out.clone();
        let loser_result = Arc::new(Mutex::new(None));
        let loser2 = loser_result.clone();
        spawn_detached(&reactor.executor(), async move {
            let start = Instant::now();
            let r = race(
                async {
                    sleep(Duration::from_millis(5)).await.ok();
                    "fast"
                },
                async move {
                    *loser2.lock().unwrap() = Some(sleep(Duration::from_millis(50)).await);
                    "slow"
                },
            )
            .await;
            *out2.lock().unwrap() = Some((r, start.elapsed()));
        });
        reactor.run();
        let (r, elapsed) = out.lock().unwrap().take().unwrap();
        let (idx, v) = r.unwrap();
        assert_eq!(idx, 0);
        assert_eq!(v, Either::Left("fast"));
        // The losing wait observed its abort before race returned.
        assert_eq!(
            loser_result.lock().unwrap().take().unwrap(),
            Err(ErrorKind::OperationAborted)
        );
        assert!(elapsed < Duration::from_millis(40));
    }

    #[test]
    fn cancel_join_waits_for_losers() {
        let reactor = Reactor::new().unwrap();
        let loser_exited = Arc::new(AtomicBool::new(false));
        let seen_at_return = Arc::new(AtomicBool::new(false));
        let out_loser = loser_exited.clone();
        let out_seen = seen_at_return.clone();
        spawn_detached(&reactor.executor(), async move {
            let loser = out_loser.clone();
            let futs: Vec<Pin<Box<dyn Future<Output = u32> + Send>>> = vec![
                Box::pin(async {
                    sleep(Duration::from_millis(2)).await.ok();
                    1
                }),
                Box::pin(async move {
                    let _ = sleep(Duration::from_millis(60)).await;
                    loser.store(true, Ordering::SeqCst);
                    2
                }),
            ];
            let (idx, _) = when_any_cancel_join(futs).await.unwrap();
            assert_eq!(idx, 0);
            out_seen.store(out_loser.load(Ordering::SeqCst), Ordering::SeqCst);
        });
        reactor.run();
        // Loser had fully completed by the time cancel-join returned.
        assert!(seen_at_return.load(Ordering::SeqCst));
    }

    #[test]
    fn with_timeout_maps_aborted_to_timed_out() {
        let reactor = Reactor::new().unwrap();
        let ex = reactor.executor();
        let out = Arc::new(Mutex::new(None));
        let out2 = out.clone();
        let ex2 = ex.clone();
        spawn_detached(&ex, async move {
            // An op that never completes on its own; the timeout hook
            // cancels its timer.
            let victim = Arc::new(SteadyTimer::new(ex2));
            victim.expires_after(Duration::from_secs(60));
            let v2 = victim.clone();
            let r = with_timeout(
                async move { victim.wait().await },
                Duration::from_millis(5),
                move || v2.cancel(),
            )
            .await;
            *out2.lock().unwrap() = Some(r);
        });
        reactor.run();
        assert_eq!(
            out.lock().unwrap().take().unwrap(),
            Err::<(), _>(ErrorKind::TimedOut)
        );
    }

    #[test]
    fn with_timeout_passes_through_fast_result() {
        let reactor = Reactor::new().unwrap();
        let out = Arc::new(Mutex::new(None));
        let out2 = out.clone();
        let hook_ran = Arc::new(AtomicUsize::new(0));
        let hook2 = hook_ran.clone();
        spawn_detached(&reactor.executor(), async move {
            let r = with_timeout(
                async {
                    sleep(Duration::from_millis(1)).await.ok();
                    Ok(7u32)
                },
                Duration::from_millis(200),
                move || {
                    hook2.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;
            *out2.lock().unwrap() = Some(r);
        });
        reactor.run();
        assert_eq!(out.lock().unwrap().take().unwrap(), Ok(7));
        assert_eq!(hook_ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn with_timeout_zero_invokes_hook_then_awaits() {
        let reactor = Reactor::new().unwrap();
        let ex = reactor.executor();
        let out = Arc::new(Mutex::new(None));
        let out2 = out.clone();
        let ex2 = ex.clone();
        spawn_detached(&ex, async move {
            let victim = Arc::new(SteadyTimer::new(ex2));
            victim.expires_after(Duration::from_secs(60));
            let v2 = victim.clone();
            let r = with_timeout(
                async move { victim.wait().await },
                Duration::ZERO,
                move || v2.cancel(),
            )
            .await;
            *out2.lock().unwrap() = Some(r);
        });
        reactor.run();
        assert_eq!(
            out.lock().unwrap().take().unwrap(),
            Err::<(), _>(ErrorKind::TimedOut)
        );
    }

    #[test]
    fn external_abort_is_not_remapped() {
        let reactor = Reactor::new().unwrap();
        let ex = reactor.executor();
        let out = Arc::new(Mutex::new(None));
        let out2 = out.clone();
        let ex2 = ex.clone();
        spawn_detached(&ex, async move {
            let victim = Arc::new(SteadyTimer::new(ex2.clone()));
            victim.expires_after(Duration::from_secs(60));
            // Cancelled by a third party, not by the timeout timer.
            {
                let victim = victim.clone();
                spawn_detached(&task::current_executor().unwrap(), async move {
                    sleep(Duration::from_millis(3)).await.ok();
                    victim.cancel();
                });
            }
            let r = with_timeout(
                async move { victim.wait().await },
                Duration::from_secs(30),
                || {},
            )
            .await;
            *out2.lock().unwrap() = Some(r);
        });
        reactor.run();
        // Timer did not fire → the original abort surfaces unchanged.
        assert_eq!(
            out.lock().unwrap().take().unwrap(),
            Err::<(), _>(ErrorKind::OperationAborted)
        );
    }
}
