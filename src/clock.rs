//! Time sources and deferred execution.
//!
//! Every scheduler and controller reads time and schedules deferred work
//! exclusively through the [`Clock`] trait, so the same code runs against real
//! time ([`SystemClock`]) or against virtual time ([`ManualClock`]) in tests.
use std::{
    collections::{BTreeMap, HashMap},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use futures::executor::{ThreadPool, ThreadPoolBuilder};

use crate::error::Error;

/// Work scheduled to run once a timer fires.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Opaque handle to one outstanding deferred execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// A monotonic time source that can also run callbacks after a delay.
pub trait Clock: Send + Sync {
    /// Monotonic "now".
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the Unix epoch, used for persisted
    /// timestamps.
    fn now_millis(&self) -> u64;

    /// Runs `callback` once `delay` has elapsed, unless cancelled first.
    fn schedule(&self, delay: Duration, callback: Callback) -> TimerId;

    /// Cancels a timer. Cancelling a timer that already fired is a no-op.
    fn cancel(&self, id: TimerId);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// Roughly thirty years; stands in for delays an `Instant` cannot represent.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

// Deadline-ordered timers. The id breaks ties so insertion order is kept.
struct TimerQueue<K> {
    entries: BTreeMap<(K, u64), Callback>,
    deadlines: HashMap<u64, K>,
}

impl<K: Ord + Copy> TimerQueue<K> {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    fn insert(&mut self, id: u64, deadline: K, callback: Callback) {
        self.entries.insert((deadline, id), callback);
        self.deadlines.insert(id, deadline);
    }

    fn remove(&mut self, id: u64) {
        if let Some(deadline) = self.deadlines.remove(&id) {
            self.entries.remove(&(deadline, id));
        }
    }

    fn next_deadline(&self) -> Option<K> {
        self.entries.first_key_value().map(|(&(deadline, _), _)| deadline)
    }

    fn pop_due(&mut self, now: K) -> Option<(K, Callback)> {
        let (&(deadline, id), _) = self.entries.first_key_value()?;
        if deadline > now {
            return None;
        }
        self.deadlines.remove(&id);
        self.entries
            .remove(&(deadline, id))
            .map(|callback| (deadline, callback))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct DriverState {
    queue: TimerQueue<Instant>,
    shutdown: bool,
}

struct Driver {
    state: Mutex<DriverState>,
    wakeup: Condvar,
}

impl Driver {
    // Sleeps until the earliest deadline, then hands due callbacks to the pool
    // so a slow callback never delays the next timer.
    fn run(&self, pool: &ThreadPool) {
        let mut state = lock(&self.state);
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            if let Some((_, callback)) = state.queue.pop_due(now) {
                drop(state);
                pool.spawn_ok(async move {
                    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                        tracing::error!("timer callback panicked");
                    }
                });
                state = lock(&self.state);
                continue;
            }
            state = match state.queue.next_deadline() {
                Some(deadline) => {
                    self.wakeup
                        .wait_timeout(state, deadline.saturating_duration_since(now))
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .wakeup
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

/// A real-time clock.
///
/// A dedicated driver thread waits for the earliest deadline and dispatches
/// due callbacks onto a thread pool. Callbacks therefore run on pool threads,
/// never on the thread that scheduled them. A panicking callback is caught
/// and reported with `tracing::error!`.
pub struct SystemClock {
    driver: Arc<Driver>,
    next_id: AtomicU64,
}

impl SystemClock {
    /// Creates a clock whose callbacks run on a pool of four threads.
    pub fn new() -> Result<Self, Error> {
        Self::with_pool_size(4)
    }

    /// Creates a clock whose callbacks run on a pool of `size` threads.
    pub fn with_pool_size(size: usize) -> Result<Self, Error> {
        let pool = ThreadPoolBuilder::new()
            .pool_size(size.max(1))
            .name_prefix("pacer-timer-")
            .create()
            .map_err(Error::Runtime)?;
        let driver = Arc::new(Driver {
            state: Mutex::new(DriverState {
                queue: TimerQueue::new(),
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });
        let thread_driver = Arc::clone(&driver);
        std::thread::Builder::new()
            .name("pacer-timer-driver".into())
            .spawn(move || thread_driver.run(&pool))
            .map_err(Error::Runtime)?;
        Ok(Self {
            driver,
            next_id: AtomicU64::new(0),
        })
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_millis(&self) -> u64 {
        unix_millis()
    }

    fn schedule(&self, delay: Duration, callback: Callback) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = lock(&self.driver.state);
        state.queue.insert(id, deadline_after(Instant::now(), delay), callback);
        drop(state);
        self.driver.wakeup.notify_one();
        TimerId(id)
    }

    fn cancel(&self, id: TimerId) {
        lock(&self.driver.state).queue.remove(id.0);
    }
}

impl Drop for SystemClock {
    fn drop(&mut self) {
        lock(&self.driver.state).shutdown = true;
        self.driver.wakeup.notify_one();
    }
}

struct ManualState {
    elapsed: Duration,
    next_id: u64,
    queue: TimerQueue<Duration>,
}

/// A virtual clock that only moves when told to.
///
/// Timers fire synchronously inside [`advance`](ManualClock::advance), in
/// deadline order, on the calling thread. Callbacks may schedule further
/// timers; those fire within the same `advance` if they fall inside the
/// window. A panicking callback unwinds into the caller of `advance`.
///
/// # Example
/// ```
/// # use std::{sync::{Arc, atomic::{AtomicBool, Ordering}}, time::Duration};
/// # use pacer::clock::{Clock, ManualClock};
/// let clock = ManualClock::new();
/// let fired = Arc::new(AtomicBool::new(false));
/// let flag = Arc::clone(&fired);
/// clock.schedule(Duration::from_millis(50), Box::new(move || flag.store(true, Ordering::SeqCst)));
///
/// clock.advance(Duration::from_millis(49));
/// assert!(!fired.load(Ordering::SeqCst));
/// clock.advance(Duration::from_millis(1));
/// assert!(fired.load(Ordering::SeqCst));
/// ```
pub struct ManualClock {
    origin: Instant,
    wall_origin_ms: u64,
    state: Mutex<ManualState>,
}

impl ManualClock {
    /// Creates a virtual clock anchored at the current wall-clock time.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at_millis(unix_millis())
    }

    /// Creates a virtual clock whose wall-clock reading starts at `millis`.
    #[must_use]
    pub fn starting_at_millis(millis: u64) -> Self {
        Self {
            origin: Instant::now(),
            wall_origin_ms: millis,
            state: Mutex::new(ManualState {
                elapsed: Duration::ZERO,
                next_id: 0,
                queue: TimerQueue::new(),
            }),
        }
    }

    /// Virtual time elapsed since creation.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        lock(&self.state).elapsed
    }

    /// Number of timers that have not fired or been cancelled.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Moves virtual time forward by `by`, firing every timer that falls due.
    pub fn advance(&self, by: Duration) {
        let target = lock(&self.state).elapsed.saturating_add(by);
        loop {
            let mut state = lock(&self.state);
            let Some((deadline, callback)) = state.queue.pop_due(target) else {
                state.elapsed = target;
                return;
            };
            state.elapsed = state.elapsed.max(deadline);
            // Never hold the lock while a callback runs; it may reschedule.
            drop(state);
            callback();
        }
    }

    /// Moves virtual time to `elapsed` since creation. Going backwards is a no-op.
    pub fn advance_to(&self, elapsed: Duration) {
        let current = self.elapsed();
        if elapsed > current {
            self.advance(elapsed - current);
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        deadline_after(self.origin, lock(&self.state).elapsed)
    }

    fn now_millis(&self) -> u64 {
        self.wall_origin_ms
            .saturating_add(lock(&self.state).elapsed.as_millis() as u64)
    }

    fn schedule(&self, delay: Duration, callback: Callback) -> TimerId {
        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        let deadline = state.elapsed.saturating_add(delay);
        state.queue.insert(id, deadline, callback);
        TimerId(id)
    }

    fn cancel(&self, id: TimerId) {
        lock(&self.state).queue.remove(id.0);
    }
}
