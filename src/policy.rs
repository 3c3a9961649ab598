use std::time::Duration;

/// Timing policy used by a [`RateScheduler`](crate::scheduler::RateScheduler).
///
/// A policy is a plain value. Schedulers copy it on construction and only
/// replace it wholesale through
/// [`set_policy`](crate::scheduler::RateScheduler::set_policy).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub struct TimingPolicy {
    /// Quiet period (debounce) or window length (throttle).
    pub wait: Duration,
    /// Execute on the leading edge of a burst or window.
    pub leading: bool,
    /// Execute on the trailing edge of a burst or window.
    pub trailing: bool,
    /// Upper bound on the delay since the start of a debounce burst.
    /// Ignored by throttling.
    pub max_wait: Option<Duration>,
}

impl TimingPolicy {
    /// Default wait for both variants (1s).
    pub const DEFAULT_WAIT: Duration = Duration::from_millis(1000);

    /// Debounce defaults: trailing edge only, no max wait.
    pub const fn debounce() -> Self {
        Self {
            wait: Self::DEFAULT_WAIT,
            leading: false,
            trailing: true,
            max_wait: None,
        }
    }

    /// Throttle defaults: both edges.
    pub const fn throttle() -> Self {
        Self {
            wait: Self::DEFAULT_WAIT,
            leading: true,
            trailing: true,
            max_wait: None,
        }
    }

    pub const fn wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub const fn leading(mut self, leading: bool) -> Self {
        self.leading = leading;
        self
    }

    pub const fn trailing(mut self, trailing: bool) -> Self {
        self.trailing = trailing;
        self
    }

    pub const fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }
}

impl Default for TimingPolicy {
    fn default() -> Self {
        Self::debounce()
    }
}
