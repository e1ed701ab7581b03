use std::time::Duration;

use super::RequestExecutor;

/// While set on an executor, cached responses younger than `duration` are returned without
/// contacting the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggressiveCacheOptions {
    pub duration: Duration,
}

impl AggressiveCacheOptions {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

/// Restores the aggressive caching setting that was in place before it was created.
///
/// Restoring happens on [`restore`](Self::restore) or on drop, whichever comes first. Guards
/// nest: dropping an inner guard brings back the outer guard's setting, including "disabled".
///
/// The setting belongs to the executor, not to a task, so guards must be dropped in the reverse
/// order of their creation. If an outer guard is restored first, the inner guard later puts back
/// the outer guard's setting and it stays in effect.
#[must_use = "aggressive caching is restored as soon as the guard is dropped"]
#[derive(Debug)]
pub struct AggressiveCachingGuard {
    executor: RequestExecutor,
    previous: Option<AggressiveCacheOptions>,
    restored: bool,
}

impl AggressiveCachingGuard {
    pub(crate) fn new(executor: RequestExecutor, previous: Option<AggressiveCacheOptions>) -> Self {
        Self {
            executor,
            previous,
            restored: false,
        }
    }

    /// The setting that will be put back.
    pub fn previous(&self) -> Option<AggressiveCacheOptions> {
        self.previous
    }

    pub fn restore(mut self) {
        self.restore_previous();
    }

    fn restore_previous(&mut self) {
        if !self.restored {
            self.restored = true;
            self.executor.set_aggressive_caching(self.previous);
        }
    }
}

impl Drop for AggressiveCachingGuard {
    fn drop(&mut self) {
        self.restore_previous();
    }
}
