use crate::{cancel::CancellationToken, timing::Cancellable};

/// Extend `Future` with cancellation.
pub trait TaskExt: Future {
    /// Stops polling `self` once `token` is cancelled and resolves to
    /// `Err(Cancelled)` instead.
    fn cancellable(self, token: &CancellationToken) -> Cancellable<Self>
    where
        Self: Sized,
    {
        Cancellable::new(self, token.clone())
    }
}

impl<T> TaskExt for T where T: Future {}
