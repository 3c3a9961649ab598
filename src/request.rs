//! Latest-wins asynchronous request lifecycle.
//!
//! A [`RequestController`] owns one user supplied asynchronous operation and
//! exposes `run`, `cancel`, `refresh` and `reset` plus observable
//! [`RequestState`]. It guarantees that only the most recent `run` can ever
//! change the visible state:
//!
//! - every `run` mints a new epoch and a fresh [`CancellationToken`], and
//!   signals the token of the run it supersedes;
//! - a settling operation commits only if its epoch is still current and its
//!   token was not signalled, anything else is discarded untouched;
//! - results are cached through a [`CacheStore`] when a cache key is set, and
//!   a fresh entry short-circuits the operation entirely.
//!
//! Operations are spawned on the [`Spawn`] implementation given at
//! construction, so the controller works with any executor. The controller
//! itself lives on the host thread and is not `Send`.

use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::{
    FutureExt,
    channel::mpsc::{self, UnboundedReceiver},
    future::BoxFuture,
    task::{Spawn, SpawnExt},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    cache::{self, CacheStore},
    cancel::CancellationToken,
    host::{EventSource, Subscription},
};

/// Default time-to-live of cached results (5 minutes).
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_millis(300_000);

/// Coarse lifecycle position derived from a [`RequestState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Idle,
    Loading,
    Success,
    Error,
}

/// Observable state of a [`RequestController`].
///
/// After a settled execution exactly one of `data` and `error` is set.
/// `loading` is `true` strictly between an accepted `run` and its
/// settlement or cancellation.
#[derive(Debug)]
pub struct RequestState<T, E> {
    pub data: Option<T>,
    pub error: Option<Arc<E>>,
    pub loading: bool,
}

impl<T, E> RequestState<T, E> {
    #[must_use]
    pub fn status(&self) -> RequestStatus {
        if self.loading {
            RequestStatus::Loading
        } else if self.error.is_some() {
            RequestStatus::Error
        } else if self.data.is_some() {
            RequestStatus::Success
        } else {
            RequestStatus::Idle
        }
    }
}

impl<T, E> Default for RequestState<T, E> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            loading: false,
        }
    }
}

impl<T: Clone, E> Clone for RequestState<T, E> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            error: self.error.clone(),
            loading: self.loading,
        }
    }
}

/// Prefix of the cache key, fixed or computed from the call's params.
///
/// The full key is `<prefix>-<JSON params>`. An empty prefix disables caching
/// for that call.
pub enum CacheKey<P> {
    Static(String),
    Derived(Box<dyn Fn(&P) -> String>),
}

impl<P: Serialize> CacheKey<P> {
    pub fn derived(prefix: impl Fn(&P) -> String + 'static) -> Self {
        Self::Derived(Box::new(prefix))
    }

    fn resolve(&self, params: &P) -> Option<String> {
        let prefix = match self {
            CacheKey::Static(prefix) => prefix.clone(),
            CacheKey::Derived(prefix) => prefix(params),
        };
        if prefix.is_empty() {
            return None;
        }
        cache::cache_key(&prefix, params)
    }
}

impl<P> From<&str> for CacheKey<P> {
    fn from(prefix: &str) -> Self {
        Self::Static(prefix.to_owned())
    }
}

impl<P> From<String> for CacheKey<P> {
    fn from(prefix: String) -> Self {
        Self::Static(prefix)
    }
}

type SuccessCallback<P, T> = Arc<dyn Fn(&T, &P) + Send + Sync>;
type ErrorCallback<P, E> = Arc<dyn Fn(&E, &P) + Send + Sync>;
type FinallyCallback<P> = Arc<dyn Fn(&P) + Send + Sync>;

/// Configuration of a [`RequestController`].
pub struct RequestOptions<P, T, E> {
    manual: bool,
    default_params: P,
    refresh_deps: Value,
    cache: Option<CacheStore>,
    cache_key: Option<CacheKey<P>>,
    cache_time: Duration,
    on_success: Option<SuccessCallback<P, T>>,
    on_error: Option<ErrorCallback<P, E>>,
    on_finally: Option<FinallyCallback<P>>,
}

impl<P, T, E> RequestOptions<P, T, E> {
    /// Options that auto-run with `default_params` and do not cache.
    pub fn new(default_params: P) -> Self {
        Self {
            manual: false,
            default_params,
            refresh_deps: Value::Null,
            cache: None,
            cache_key: None,
            cache_time: DEFAULT_CACHE_TIME,
            on_success: None,
            on_error: None,
            on_finally: None,
        }
    }

    /// Suppresses the automatic run on construction.
    pub fn manual(mut self, manual: bool) -> Self {
        self.manual = manual;
        self
    }

    /// Initial dependency list. See [`RequestController::update_refresh_deps`].
    pub fn refresh_deps(mut self, deps: impl Serialize) -> Self {
        self.refresh_deps = deps_value(deps).unwrap_or(Value::Null);
        self
    }

    /// Store used for cached results. Share one `CacheStore` between
    /// controllers to share entries.
    pub fn cache(mut self, cache: CacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache_key(mut self, key: impl Into<CacheKey<P>>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn cache_time(mut self, ttl: Duration) -> Self {
        self.cache_time = ttl;
        self
    }

    pub fn on_success(mut self, callback: impl Fn(&T, &P) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&E, &P) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Called after every settled success or error, after the specific
    /// callback. Not called for cancelled runs.
    pub fn on_finally(mut self, callback: impl Fn(&P) + Send + Sync + 'static) -> Self {
        self.on_finally = Some(Arc::new(callback));
        self
    }
}

impl<P: Default, T, E> Default for RequestOptions<P, T, E> {
    fn default() -> Self {
        Self::new(P::default())
    }
}

fn deps_value(deps: impl Serialize) -> Option<Value> {
    match serde_json::to_value(deps) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(error = %err, "refresh dependencies not serializable, ignored");
            None
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// Sends a snapshot; returns `false` once the receiving side is gone.
type Watcher<T, E> = Box<dyn FnMut(&RequestState<T, E>) -> bool + Send>;

struct Inner<P, T, E> {
    state: RequestState<T, E>,
    epoch: u64,
    token: Option<CancellationToken>,
    params: Option<P>,
    watchers: Vec<Watcher<T, E>>,
}

impl<P, T, E> Inner<P, T, E> {
    fn publish(&mut self) {
        let state = &self.state;
        self.watchers.retain_mut(|watcher| watcher(state));
    }

    fn cancel_current(&mut self) {
        self.epoch += 1;
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

// State shared with spawned operations.
struct Core<P, T, E> {
    inner: Mutex<Inner<P, T, E>>,
    torn_down: AtomicBool,
    cache: Option<CacheStore>,
    cache_time: Duration,
    on_success: Option<SuccessCallback<P, T>>,
    on_error: Option<ErrorCallback<P, E>>,
    on_finally: Option<FinallyCallback<P>>,
}

impl<P, T, E> Core<P, T, E>
where
    T: Clone + Serialize,
{
    fn inner(&self) -> MutexGuard<'_, Inner<P, T, E>> {
        lock(&self.inner)
    }

    // Callbacks are suppressed after teardown regardless of what the epoch
    // check decided.
    fn notify_success(&self, data: &T, params: &P) {
        if self.torn_down.load(Ordering::Acquire) {
            return;
        }
        if let Some(on_success) = &self.on_success {
            on_success(data, params);
        }
        if let Some(on_finally) = &self.on_finally {
            on_finally(params);
        }
    }

    fn notify_error(&self, error: &E, params: &P) {
        if self.torn_down.load(Ordering::Acquire) {
            return;
        }
        if let Some(on_error) = &self.on_error {
            on_error(error, params);
        }
        if let Some(on_finally) = &self.on_finally {
            on_finally(params);
        }
    }

    fn settle(
        &self,
        epoch: u64,
        token: &CancellationToken,
        key: Option<String>,
        params: P,
        result: Result<T, E>,
    ) {
        let mut inner = self.inner();
        if inner.epoch != epoch || token.is_cancelled() {
            tracing::trace!(epoch, current = inner.epoch, "discarding superseded result");
            return;
        }
        inner.token = None;
        inner.state.loading = false;
        match result {
            Ok(data) => {
                inner.state.data = Some(data.clone());
                inner.state.error = None;
                inner.publish();
                drop(inner);
                if let (Some(key), Some(cache)) = (key, &self.cache) {
                    cache.set(&key, &data);
                }
                self.notify_success(&data, &params);
            }
            Err(error) => {
                let error = Arc::new(error);
                inner.state.data = None;
                inner.state.error = Some(Arc::clone(&error));
                inner.publish();
                drop(inner);
                self.notify_error(&error, &params);
            }
        }
    }
}

type Operation<P, T, E> = Box<dyn Fn(P, CancellationToken) -> BoxFuture<'static, Result<T, E>>>;

// Host-thread side: everything needed to start a run.
struct Driver<P, T, E> {
    core: Arc<Core<P, T, E>>,
    operation: Operation<P, T, E>,
    spawner: Box<dyn Spawn>,
    cache_key: Option<CacheKey<P>>,
    refresh_deps: RefCell<Value>,
}

impl<P, T, E> Driver<P, T, E>
where
    P: Clone + Serialize + Send + 'static,
    T: Clone + Serialize + DeserializeOwned + Send + 'static,
    E: Send + Sync + 'static,
{
    fn run(&self, params: P) {
        let core = &self.core;
        let token = CancellationToken::new();
        let epoch = {
            let mut inner = core.inner();
            inner.epoch += 1;
            inner.params = Some(params.clone());
            if let Some(previous) = inner.token.replace(token.clone()) {
                previous.cancel();
            }
            inner.state.loading = true;
            inner.state.error = None;
            inner.publish();
            inner.epoch
        };

        let key = self
            .cache_key
            .as_ref()
            .and_then(|cache_key| cache_key.resolve(&params));
        if let (Some(key), Some(cache)) = (&key, &core.cache) {
            if let Some(data) = cache.get::<T>(key, core.cache_time) {
                tracing::trace!(key, "serving request from cache");
                {
                    let mut inner = core.inner();
                    inner.token = None;
                    inner.state.data = Some(data.clone());
                    inner.state.loading = false;
                    inner.publish();
                }
                core.notify_success(&data, &params);
                return;
            }
        }

        let operation = (self.operation)(params.clone(), token.clone());
        let settle_core = Arc::clone(core);
        let task = async move {
            let result = operation.await;
            settle_core.settle(epoch, &token, key, params, result);
        };
        if let Err(err) = self.spawner.spawn(task) {
            tracing::error!(error = ?err, "failed to spawn request operation");
            let mut inner = core.inner();
            if inner.epoch == epoch {
                inner.token = None;
                inner.state.loading = false;
                inner.publish();
            }
        }
    }

    fn cancel(&self) {
        let mut inner = self.core.inner();
        inner.cancel_current();
        inner.state.loading = false;
        inner.publish();
    }

    fn reset(&self) {
        let mut inner = self.core.inner();
        inner.cancel_current();
        inner.state = RequestState::default();
        inner.publish();
    }

    fn refresh(&self) {
        let Some(params) = self.core.inner().params.clone() else {
            return;
        };
        self.reset();
        self.run(params);
    }
}

/// Drives one asynchronous operation with latest-wins semantics.
///
/// # Example
/// ```
/// # use std::sync::Arc;
/// # use futures::executor::LocalPool;
/// # use pacer::request::{RequestController, RequestOptions};
/// let mut pool = LocalPool::new();
/// let users = RequestController::new(
///     |id: u32, _token| async move { Ok::<_, String>(format!("user-{id}")) },
///     pool.spawner(),
///     RequestOptions::new(7),
/// );
///
/// assert!(users.loading());
/// pool.run_until_stalled();
/// assert_eq!(users.data().as_deref(), Some("user-7"));
/// assert!(!users.loading());
/// ```
pub struct RequestController<P, T, E> {
    driver: Rc<Driver<P, T, E>>,
    subscriptions: RefCell<Vec<Subscription>>,
}

impl<P, T, E> RequestController<P, T, E>
where
    P: Clone + Serialize + Send + 'static,
    T: Clone + Serialize + DeserializeOwned + Send + 'static,
    E: Send + Sync + 'static,
{
    /// Creates a controller and, unless `options.manual` is set, immediately
    /// runs the operation with the default params.
    ///
    /// `operation` receives the params and the run's cancellation token. It
    /// should stop early once the token is cancelled, but the controller
    /// never waits for it to do so.
    pub fn new<F, Fut>(
        operation: F,
        spawner: impl Spawn + 'static,
        options: RequestOptions<P, T, E>,
    ) -> Self
    where
        F: Fn(P, CancellationToken) -> Fut + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let RequestOptions {
            manual,
            default_params,
            refresh_deps,
            cache,
            cache_key,
            cache_time,
            on_success,
            on_error,
            on_finally,
        } = options;

        if cache_key.is_some() && cache.is_none() {
            tracing::debug!("cache key configured without a cache store, caching disabled");
        }

        let core = Arc::new(Core {
            inner: Mutex::new(Inner {
                state: RequestState::default(),
                epoch: 0,
                token: None,
                params: None,
                watchers: Vec::new(),
            }),
            torn_down: AtomicBool::new(false),
            cache,
            cache_time,
            on_success,
            on_error,
            on_finally,
        });
        let controller = Self {
            driver: Rc::new(Driver {
                core,
                operation: Box::new(move |params: P, token: CancellationToken| {
                    operation(params, token).boxed()
                }),
                spawner: Box::new(spawner),
                cache_key,
                refresh_deps: RefCell::new(refresh_deps),
            }),
            subscriptions: RefCell::new(Vec::new()),
        };
        if !manual {
            controller.run(default_params);
        }
        controller
    }

    /// Starts the operation with `params`, superseding any run in flight.
    ///
    /// If the spawner rejects the operation (for example because its
    /// executor shut down) the failure is logged with `tracing::error!` and
    /// the run ends like a cancelled one: `loading` is cleared, `data` and
    /// `error` keep their previous values and no callback fires.
    pub fn run(&self, params: P) {
        self.driver.run(params);
    }

    /// Signals the current run's token and clears `loading`. `data` and
    /// `error` are left as they are; a late result of the cancelled run is
    /// discarded.
    pub fn cancel(&self) {
        self.driver.cancel();
    }

    /// Resets, then re-runs with the params of the last run. Does nothing if
    /// the controller never ran.
    pub fn refresh(&self) {
        self.driver.refresh();
    }

    /// Cancels and returns the state to idle: no data, no error, not loading.
    pub fn reset(&self) {
        self.driver.reset();
    }

    /// Overwrites `data` locally without running the operation.
    pub fn mutate(&self, data: T) {
        let mut inner = self.driver.core.inner();
        inner.state.data = Some(data);
        inner.publish();
    }

    /// Compares `deps` with the previous dependency list and refreshes when
    /// they differ.
    pub fn update_refresh_deps(&self, deps: impl Serialize) {
        let Some(deps) = deps_value(deps) else {
            return;
        };
        let changed = {
            let mut current = self.driver.refresh_deps.borrow_mut();
            if *current == deps {
                false
            } else {
                *current = deps;
                true
            }
        };
        if changed {
            self.driver.refresh();
        }
    }

    /// Refreshes every time `source` emits `event`, until teardown.
    pub fn refresh_on(&self, source: &dyn EventSource, event: &str) {
        let driver: Weak<Driver<P, T, E>> = Rc::downgrade(&self.driver);
        let subscription = source.subscribe(
            event,
            Box::new(move || {
                if let Some(driver) = driver.upgrade() {
                    driver.refresh();
                }
            }),
        );
        self.subscriptions.borrow_mut().push(subscription);
    }

    /// A stream of state snapshots, starting with the current one and then
    /// one per change.
    pub fn watch(&self) -> UnboundedReceiver<RequestState<T, E>> {
        let (sender, receiver) = mpsc::unbounded();
        let mut inner = self.driver.core.inner();
        if sender.unbounded_send(inner.state.clone()).is_ok() {
            inner.watchers.push(Box::new(move |state: &RequestState<T, E>| {
                sender.unbounded_send(state.clone()).is_ok()
            }));
        }
        receiver
    }

    #[must_use]
    pub fn state(&self) -> RequestState<T, E> {
        self.driver.core.inner().state.clone()
    }

    #[must_use]
    pub fn data(&self) -> Option<T> {
        self.driver.core.inner().state.data.clone()
    }

    #[must_use]
    pub fn error(&self) -> Option<Arc<E>> {
        self.driver.core.inner().state.error.clone()
    }

    #[must_use]
    pub fn loading(&self) -> bool {
        self.driver.core.inner().state.loading
    }

    /// Params of the most recent run.
    #[must_use]
    pub fn params(&self) -> Option<P> {
        self.driver.core.inner().params.clone()
    }
}

impl<P, T, E> RequestController<P, T, E> {
    /// Stops all callbacks and cancels the in-flight run, clearing `loading`.
    ///
    /// The cancelled run never writes state. Runs started after teardown
    /// still update state, but no callback will fire. Called automatically on
    /// drop.
    pub fn teardown(&self) {
        let core = &self.driver.core;
        core.torn_down.store(true, Ordering::Release);
        {
            let mut inner = lock(&core.inner);
            if inner.token.is_some() {
                inner.cancel_current();
                inner.state.loading = false;
                inner.publish();
            }
        }
        self.subscriptions.borrow_mut().clear();
    }

    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.driver.core.torn_down.load(Ordering::Acquire)
    }
}

impl<P, T, E> Drop for RequestController<P, T, E> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<P, T: fmt::Debug, E: fmt::Debug> fmt::Debug for RequestController<P, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.driver.core.inner);
        f.debug_struct("RequestController")
            .field("state", &inner.state)
            .field("epoch", &inner.epoch)
            .finish()
    }
}
