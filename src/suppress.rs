//! Reentrancy suppression.
//!
//! Writes made by the replicator itself must not be queued again by the
//! lifecycle listener. Instead of a process-wide flag, suppression is scoped:
//!
//! - [`suppressed`] marks one future (and everything it awaits) as replicator
//!   work, via a task-local.
//! - [`SuppressionGuard`] marks the current thread until the guard drops, for
//!   synchronous call paths.
//!
//! [`is_suppressed`] is true inside either kind of scope.

use std::cell::Cell;
use std::future::Future;
use std::marker::PhantomData;

tokio::task_local! {
    static TASK_SUPPRESSED: bool;
}

thread_local! {
    static THREAD_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Run `fut` with suppression active for its whole execution.
pub async fn suppressed<F>(fut: F) -> F::Output
where
    F: Future,
{
    TASK_SUPPRESSED.scope(true, fut).await
}

/// True if the caller runs inside a suppression scope.
pub fn is_suppressed() -> bool {
    let in_task = TASK_SUPPRESSED.try_with(|s| *s).unwrap_or(false);
    in_task || THREAD_DEPTH.with(|d| d.get() > 0)
}

/// Thread-scoped suppression. Nested guards are allowed.
///
/// Not `Send`: the guard must drop on the thread that created it.
#[derive(Debug)]
pub struct SuppressionGuard {
    _not_send: PhantomData<*const ()>,
}

impl SuppressionGuard {
    pub fn enter() -> Self {
        THREAD_DEPTH.with(|d| d.set(d.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for SuppressionGuard {
    fn drop(&mut self) {
        THREAD_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}
