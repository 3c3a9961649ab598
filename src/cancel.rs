//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is handed to every user operation started by a
//! [`RequestController`](crate::request::RequestController). Signalling it is
//! advisory: the operation stops early only if it checks the flag, awaits
//! [`CancellationToken::cancelled`], or is wrapped with
//! [`TaskExt::cancellable`](crate::task_ext::TaskExt::cancellable).
use std::{
    pin::Pin,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll, Waker},
};

struct Signal {
    cancelled: AtomicBool,
    wakers: Mutex<Vec<Waker>>,
}

/// A shared, clonable cancellation flag.
///
/// All clones observe the same flag. Once cancelled a token stays cancelled;
/// a fresh token is minted for every new operation instead of resetting one.
#[derive(Clone)]
pub struct CancellationToken {
    signal: Arc<Signal>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            signal: Arc::new(Signal {
                cancelled: AtomicBool::new(false),
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Signals cancellation and wakes every task waiting in [`cancelled`].
    ///
    /// Calling this more than once has no further effect.
    ///
    /// [`cancelled`]: CancellationToken::cancelled
    pub fn cancel(&self) {
        if self.signal.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let wakers = std::mem::take(
            &mut *self
                .signal
                .wakers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for waker in wakers {
            waker.wake();
        }
    }

    /// Returns `true` if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.signal.cancelled.load(Ordering::Acquire)
    }

    /// Returns a future that resolves once the token is cancelled.
    pub fn cancelled(&self) -> WaitForCancellation {
        WaitForCancellation {
            token: self.clone(),
        }
    }

    pub(crate) fn register(&self, waker: &Waker) {
        let mut wakers = self
            .signal
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Future returned by [`CancellationToken::cancelled`].
#[must_use = "futures do nothing unless polled or .awaited"]
pub struct WaitForCancellation {
    token: CancellationToken,
}

impl Future for WaitForCancellation {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.token.is_cancelled() {
            return Poll::Ready(());
        }
        self.token.register(cx.waker());
        // Re-check after registering so a concurrent `cancel` is not missed.
        if self.token.is_cancelled() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}
