//! Rate-limited invocation of a function: debounce and throttle.
//!
//! A [`RateScheduler`] wraps a function and turns a burst of [`run`] calls into
//! a bounded stream of executions. Both variants share one algorithm and only
//! differ in their [`EdgeMode`]:
//!
//! - **Debounce** delays execution until calls have been quiet for `wait`,
//!   optionally bounded by `max_wait` since the first call of the burst.
//! - **Throttle** executes at most once per `wait`-long window.
//!
//! Arguments are never queued. Only the latest ones are kept and every
//! execution, immediate or deferred, uses them. Deferred executions happen on
//! whatever thread the [`Clock`] fires its callbacks on, so their results are
//! handed to the sink registered with [`on_deferred`] instead of to a caller.
//!
//! [`run`]: RateScheduler::run
//! [`on_deferred`]: RateScheduler::on_deferred

use std::{
    fmt::Display,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::{Duration, Instant},
};

use crate::{
    clock::{Clock, TimerId},
    policy::TimingPolicy,
};

/// Which edge policy a [`RateScheduler`] applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeMode {
    Debounce,
    Throttle,
}

type Func<A, R> = Arc<dyn Fn(A) -> R + Send + Sync>;
type Sink<R> = Arc<dyn Fn(R) + Send + Sync>;

struct Timer {
    id: TimerId,
    ticket: u64,
}

struct State<A> {
    policy: TimingPolicy,
    args: Option<A>,
    last_exec: Option<Instant>,
    // First call of the current debounce burst. A burst ends when its timer
    // fires, is cancelled or is flushed.
    burst_start: Option<Instant>,
    timer: Option<Timer>,
    next_ticket: u64,
}

impl<A> State<A> {
    fn clear_timer(&mut self, clock: &dyn Clock) {
        if let Some(timer) = self.timer.take() {
            clock.cancel(timer.id);
        }
    }
}

struct Shared<A, R> {
    mode: EdgeMode,
    clock: Arc<dyn Clock>,
    func: Mutex<Func<A, R>>,
    sink: Mutex<Option<Sink<R>>>,
    state: Mutex<State<A>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<A, R> Shared<A, R> {
    // The function is looked up at execution time so deferred executions
    // always see the one installed last.
    fn call(&self, args: A) -> R {
        let func = Arc::clone(&lock(&self.func));
        func(args)
    }
}

impl<A, R> Drop for Shared<A, R> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.clear_timer(self.clock.as_ref());
    }
}

/// A debounced or throttled function.
///
/// Handles are cheap to clone and share one scheduler. When the last handle is
/// dropped the outstanding timer, if any, is cancelled.
///
/// The wrapped function is never called while an internal lock is held, so it
/// may call back into the scheduler.
///
/// # Example
/// ```
/// # use std::{sync::{Arc, Mutex}, time::Duration};
/// # use pacer::{TimingPolicy, clock::ManualClock, scheduler::RateScheduler};
/// let clock = Arc::new(ManualClock::new());
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = Arc::clone(&seen);
/// let search = RateScheduler::debounce(
///     clock.clone(),
///     TimingPolicy::debounce().wait(Duration::from_millis(100)),
///     move |query: &'static str| sink.lock().unwrap().push(query),
/// );
///
/// search.run("r");
/// search.run("ru");
/// search.run("rust");
/// clock.advance(Duration::from_millis(100));
///
/// assert_eq!(*seen.lock().unwrap(), vec!["rust"]);
/// ```
pub struct RateScheduler<A, R> {
    shared: Arc<Shared<A, R>>,
}

impl<A, R> Clone for RateScheduler<A, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<A, R> RateScheduler<A, R>
where
    A: Clone + Send + 'static,
    R: Send + 'static,
{
    /// Creates a scheduler with the given edge mode.
    pub fn new(
        mode: EdgeMode,
        clock: Arc<dyn Clock>,
        policy: TimingPolicy,
        func: impl Fn(A) -> R + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                mode,
                clock,
                func: Mutex::new(Arc::new(func)),
                sink: Mutex::new(None),
                state: Mutex::new(State {
                    policy,
                    args: None,
                    last_exec: None,
                    burst_start: None,
                    timer: None,
                    next_ticket: 0,
                }),
            }),
        }
    }

    /// Creates a debounced function.
    ///
    /// Every call restarts the quiet period. With `leading` the first call of a
    /// burst executes immediately; with `trailing` the latest arguments execute
    /// once the quiet period elapses; with `max_wait` the trailing execution
    /// happens no later than `max_wait` after the first call of the burst.
    pub fn debounce(
        clock: Arc<dyn Clock>,
        policy: TimingPolicy,
        func: impl Fn(A) -> R + Send + Sync + 'static,
    ) -> Self {
        Self::new(EdgeMode::Debounce, clock, policy, func)
    }

    /// Creates a throttled function.
    ///
    /// At most one leading execution per `wait` window, plus at most one
    /// trailing execution with the latest arguments at the end of the window.
    pub fn throttle(
        clock: Arc<dyn Clock>,
        policy: TimingPolicy,
        func: impl Fn(A) -> R + Send + Sync + 'static,
    ) -> Self {
        Self::new(EdgeMode::Throttle, clock, policy, func)
    }

    /// Feeds a call into the policy.
    ///
    /// Returns `Some` with the function's result when the call triggered an
    /// immediate (leading edge) execution, and `None` when execution was
    /// deferred or suppressed. A panic inside an immediate execution unwinds
    /// into the caller.
    pub fn run(&self, args: A) -> Option<R> {
        let immediate = match self.shared.mode {
            EdgeMode::Debounce => self.run_debounce(args),
            EdgeMode::Throttle => self.run_throttle(args),
        };
        immediate.map(|args| self.shared.call(args))
    }

    fn run_debounce(&self, args: A) -> Option<A> {
        let clock = self.shared.clock.as_ref();
        let now = clock.now();
        let mut state = lock(&self.shared.state);
        let idle = state.timer.is_none();
        if idle {
            state.burst_start = Some(now);
        }
        state.args = Some(args.clone());

        let immediate = if state.policy.leading && idle {
            state.last_exec = Some(now);
            Some(args)
        } else {
            None
        };

        state.clear_timer(clock);
        let mut delay = state.policy.wait;
        if let (Some(max_wait), Some(start)) = (state.policy.max_wait, state.burst_start) {
            delay = delay.min(max_wait.saturating_sub(now.saturating_duration_since(start)));
        }
        self.arm(&mut state, delay);
        immediate
    }

    fn run_throttle(&self, args: A) -> Option<A> {
        let clock = self.shared.clock.as_ref();
        let now = clock.now();
        let mut state = lock(&self.shared.state);
        state.args = Some(args.clone());

        let wait = state.policy.wait;
        let since_exec = state.last_exec.map(|t| now.saturating_duration_since(t));
        let window_open = since_exec.is_none_or(|since| since >= wait);

        if state.policy.leading && window_open {
            state.last_exec = Some(now);
            return Some(args);
        }
        if state.timer.is_some() || !state.policy.trailing {
            return None;
        }
        // Before any execution the first call opens a full window.
        let remaining = since_exec.map_or(wait, |since| wait.saturating_sub(since));
        self.arm(&mut state, remaining);
        None
    }

    fn arm(&self, state: &mut State<A>, delay: Duration) {
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        let weak = Arc::downgrade(&self.shared);
        let id = self
            .shared
            .clock
            .schedule(delay, Box::new(move || Self::fire(&weak, ticket)));
        state.timer = Some(Timer { id, ticket });
    }

    fn fire(weak: &Weak<Shared<A, R>>, ticket: u64) {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let mut state = lock(&shared.state);
        // A real clock may fire a timer that was replaced in the meantime.
        if state.timer.as_ref().is_none_or(|t| t.ticket != ticket) {
            return;
        }
        state.timer = None;
        if !state.policy.trailing {
            return;
        }
        let Some(args) = state.args.clone() else {
            return;
        };
        state.last_exec = Some(shared.clock.now());
        drop(state);

        let result = shared.call(args);
        let sink = lock(&shared.sink).clone();
        match sink {
            Some(sink) => sink(result),
            None => tracing::debug!(
                mode = ?shared.mode,
                "deferred execution finished with no sink registered, result dropped"
            ),
        }
    }

    /// Cancels the pending deferred execution, if any, without executing it.
    ///
    /// The latest arguments are kept, so a later [`flush`](Self::flush) still
    /// executes with them.
    pub fn cancel(&self) {
        lock(&self.shared.state).clear_timer(self.shared.clock.as_ref());
    }

    /// Executes immediately with the latest arguments and cancels the pending
    /// deferred execution.
    ///
    /// When nothing is pending the function is re-invoked with the last known
    /// arguments. Returns `None` only if [`run`](Self::run) was never called.
    pub fn flush(&self) -> Option<R> {
        let clock = self.shared.clock.as_ref();
        let mut state = lock(&self.shared.state);
        state.clear_timer(clock);
        let args = state.args.clone()?;
        state.last_exec = Some(clock.now());
        drop(state);
        Some(self.shared.call(args))
    }

    /// Returns `true` while a deferred execution is scheduled.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        lock(&self.shared.state).timer.is_some()
    }

    /// Replaces the wrapped function.
    ///
    /// Already scheduled executions will call the new function.
    pub fn set_fn(&self, func: impl Fn(A) -> R + Send + Sync + 'static) {
        *lock(&self.shared.func) = Arc::new(func);
    }

    /// Swaps the timing policy for subsequent calls.
    ///
    /// A timer that is already scheduled keeps its deadline.
    pub fn set_policy(&self, policy: TimingPolicy) {
        lock(&self.shared.state).policy = policy;
    }

    #[must_use]
    pub fn policy(&self) -> TimingPolicy {
        lock(&self.shared.state).policy
    }

    /// Registers where results of deferred (timer fired) executions go.
    ///
    /// Without a sink those results are dropped and a `tracing::debug!` event
    /// is emitted. See [`log_errors`] for a ready-made sink.
    pub fn on_deferred(&self, sink: impl Fn(R) + Send + Sync + 'static) -> &Self {
        *lock(&self.shared.sink) = Some(Arc::new(sink));
        self
    }
}

/// A deferred-result sink that reports `Err` values with `tracing::warn!`.
pub fn log_errors<T: 'static, E: Display + 'static>()
-> impl Fn(Result<T, E>) + Send + Sync + 'static {
    |result: Result<T, E>| {
        if let Err(err) = result {
            tracing::warn!(error = %err, "deferred execution failed");
        }
    }
}
