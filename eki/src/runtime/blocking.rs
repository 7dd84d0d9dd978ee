use crate::context;
use crate::runtime::pool;
use crate::utils::ScopeGuard;

/// Runs `f`, which blocks the calling thread until some queued work has run.
///
/// On a pool worker this is bookkept: when every live worker is blocked, a
/// new worker is started (up to `max_threads`) so the work we wait for can
/// still be picked up. Off the pool it simply calls `f`.
pub(crate) fn block_in_place<R>(f: impl FnOnce() -> R) -> R {
    let Some(shared) = context::current_worker() else {
        return f();
    };

    if shared.enter_blocking() {
        pool::spawn_overflow_worker(&shared);
    }

    let _exit = ScopeGuard::new(|| shared.exit_blocking());
    f()
}
