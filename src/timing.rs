//! Timing utilities for asynchronous workflows.
//!
//! Provides futures that tie asynchronous work to a [`Clock`] or to a
//! [`CancellationToken`]. Both are executor agnostic: they only rely on the
//! waker they are polled with.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::{FutureExt, channel::oneshot};
use pin_project_lite::pin_project;

use crate::{
    cancel::CancellationToken,
    clock::{Clock, TimerId},
    error::Cancelled,
};

/// A future that completes once `duration` has elapsed on the given clock.
///
/// Backed by a single clock timer, which is cancelled if the `Sleep` is
/// dropped early. Under a [`ManualClock`](crate::clock::ManualClock) it
/// completes when virtual time is advanced past its deadline.
#[must_use = "futures do nothing unless polled or .awaited"]
pub struct Sleep {
    clock: Arc<dyn Clock>,
    id: TimerId,
    receiver: oneshot::Receiver<()>,
}

impl Sleep {
    /// Starts the countdown immediately, not when first polled.
    pub fn new(clock: Arc<dyn Clock>, duration: Duration) -> Self {
        let (sender, receiver) = oneshot::channel();
        let id = clock.schedule(
            duration,
            Box::new(move || {
                let _ = sender.send(());
            }),
        );
        Sleep {
            clock,
            id,
            receiver,
        }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the clock discarded the timer; don't hang.
        self.receiver.poll_unpin(cx).map(|_| ())
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        self.clock.cancel(self.id);
    }
}

pin_project! {
    /// A future that races its inner future against a [`CancellationToken`].
    ///
    /// Resolves to `Ok(output)` if the inner future completes first, or to
    /// `Err(Cancelled)` as soon as the token is signalled. The inner future is
    /// not polled again after cancellation.
    ///
    /// A more convenient way to construct this is via the
    /// [`cancellable()`](crate::task_ext::TaskExt::cancellable) operator.
    #[must_use = "futures do nothing unless polled or .awaited"]
    pub struct Cancellable<F> {
        #[pin]
        future: F,
        token: CancellationToken,
    }
}

impl<F> Cancellable<F> {
    pub fn new(future: F, token: CancellationToken) -> Self {
        Cancellable { future, token }
    }

    /// Consumes the wrapper and returns the inner future.
    pub fn inner(self) -> F {
        self.future
    }
}

impl<F> Future for Cancellable<F>
where
    F: Future,
{
    type Output = Result<F::Output, Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if this.token.is_cancelled() {
            return Poll::Ready(Err(Cancelled));
        }
        this.token.register(cx.waker());
        if this.token.is_cancelled() {
            return Poll::Ready(Err(Cancelled));
        }
        this.future.poll(cx).map(Ok)
    }
}
