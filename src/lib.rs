//! Rate-limited invocation and latest-wins asynchronous requests.
//!
//! `pacer` provides small behavioral primitives for interactive code that has
//! to cope with bursts of input and with asynchronous work that can be
//! superseded before it finishes.
//!
//! The crate is designed to work independently of any specific async runtime.
//! Time comes from an injectable [`Clock`](clock::Clock), and asynchronous
//! operations are spawned on any [`futures::task::Spawn`] implementation.
//!
//! Features include:
//! - A [`RateScheduler`] that debounces or throttles a function with
//!   leading, trailing and max-wait policies
//! - A [`RequestController`] that runs, cancels, refreshes and resets one
//!   asynchronous operation, commits only the most recent result and caches
//!   results with a TTL
//! - A cooperative [`CancellationToken`] and time-based futures such as
//!   [`Sleep`](timing::Sleep) and [`Cancellable`](timing::Cancellable)
//! - [`SystemClock`](clock::SystemClock) for real time and
//!   [`ManualClock`](clock::ManualClock) for deterministic tests
//!
//! Storage and host events are reached only through the
//! [`KeyValueStore`](store::KeyValueStore) and
//! [`EventSource`](host::EventSource) traits.

pub mod cache;
pub mod cancel;
pub mod clock;
pub mod error;
pub mod host;
pub mod policy;
pub mod request;
pub mod scheduler;
pub mod store;
pub mod task_ext;
pub mod timing;

pub use cancel::CancellationToken;
pub use error::{Cancelled, Error};
pub use policy::TimingPolicy;
pub use request::{RequestController, RequestOptions, RequestState};
pub use scheduler::{EdgeMode, RateScheduler};
