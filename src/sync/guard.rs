//! Loop guard
//!
//! Applying remote content writes the local clipboard, which fires a local
//! change notification of its own. The guard marks that window so the engine
//! drops those notifications instead of publishing them back to the peer.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct GuardState {
    /// Applies currently in progress
    active: u32,
    /// End of the quiet period after the last completed apply
    release_at: Option<Instant>,
}

/// Suppression flag with a delayed release, owned by one engine
#[derive(Debug, Default)]
pub struct LoopGuard {
    state: Mutex<GuardState>,
}

impl LoopGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, GuardState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Raise suppression before a clipboard write
    ///
    /// Returns `true` if suppression was not already in effect. Every call
    /// must be paired with one [`LoopGuard::release_after`].
    pub fn try_set_suppressed(&self) -> bool {
        let mut state = self.state();
        let was_suppressed = Self::suppressed(&state, Instant::now());
        state.active += 1;
        !was_suppressed
    }

    /// End one apply and keep suppressing for `quiet_period` from now
    ///
    /// Overlapping applies extend the window; it never shrinks.
    pub fn release_after(&self, quiet_period: Duration) {
        let mut state = self.state();
        state.active = state.active.saturating_sub(1);
        let deadline = Instant::now() + quiet_period;
        state.release_at = Some(match state.release_at {
            Some(existing) if existing > deadline => existing,
            _ => deadline,
        });
    }

    /// Raise suppression until the returned value is dropped, then keep it
    /// for `quiet_period`
    pub fn suppress(&self, quiet_period: Duration) -> Suppression<'_> {
        self.try_set_suppressed();
        Suppression {
            guard: self,
            quiet_period,
        }
    }

    /// Whether local change notifications must be dropped right now
    pub fn is_suppressed(&self) -> bool {
        Self::suppressed(&self.state(), Instant::now())
    }

    fn suppressed(state: &GuardState, now: Instant) -> bool {
        state.active > 0 || state.release_at.is_some_and(|deadline| now < deadline)
    }
}

/// Suppression held for the duration of one apply
#[must_use = "suppression ends when this is dropped"]
pub struct Suppression<'a> {
    guard: &'a LoopGuard,
    quiet_period: Duration,
}

impl Drop for Suppression<'_> {
    fn drop(&mut self) {
        self.guard.release_after(self.quiet_period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUIET: Duration = Duration::from_millis(500);

    #[tokio::test(start_paused = true)]
    async fn test_suppressed_while_applying() {
        let guard = LoopGuard::new();
        assert!(!guard.is_suppressed());

        assert!(guard.try_set_suppressed());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(guard.is_suppressed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_waits_for_quiet_period() {
        let guard = LoopGuard::new();
        guard.try_set_suppressed();
        guard.release_after(QUIET);

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(guard.is_suppressed());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!guard.is_suppressed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_applies_extend_window() {
        let guard = LoopGuard::new();
        assert!(guard.try_set_suppressed());
        assert!(!guard.try_set_suppressed());

        guard.release_after(QUIET);
        tokio::time::advance(Duration::from_secs(1)).await;
        // Second apply still running
        assert!(guard.is_suppressed());

        guard.release_after(QUIET);
        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(guard.is_suppressed());
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!guard.is_suppressed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_release_does_not_shrink_window() {
        let guard = LoopGuard::new();
        guard.try_set_suppressed();
        guard.release_after(Duration::from_secs(2));
        guard.try_set_suppressed();
        guard.release_after(Duration::from_millis(10));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(guard.is_suppressed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppression_released_on_drop() {
        let guard = LoopGuard::new();
        {
            let _suppression = guard.suppress(QUIET);
            assert!(guard.is_suppressed());
        }
        assert!(guard.is_suppressed());
        tokio::time::advance(QUIET).await;
        assert!(!guard.is_suppressed());
    }

    #[test]
    fn test_independent_instances() {
        let a = LoopGuard::new();
        let b = LoopGuard::new();
        a.try_set_suppressed();
        assert!(a.is_suppressed());
        assert!(!b.is_suppressed());
    }
}
