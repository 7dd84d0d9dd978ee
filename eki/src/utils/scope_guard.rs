/// A guard that runs a closure when it goes out of scope.
///
/// Every piece of begin/end bookkeeping in the crate goes through this type:
/// leaving a group, returning a semaphore permit, popping the current queue
/// tag, marking a task finished. The closure runs on normal return, on early
/// return and while unwinding from a panic raised by caller-supplied work.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    // Taken in `drop`.
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    /// Runs `closure` when the guard is dropped.
    ///
    /// ```ignore
    /// group.enter();
    /// let _leave = ScopeGuard::new(|| group.leave());
    /// work(); // may panic, `leave` still runs
    /// ```
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}
