//! Resolve-once completion handles.

use crate::error::ClientError;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

type Outcome<T> = Result<T, ClientError>;

/// Settling side of a one-shot result.
///
/// The first `resolve` or `reject` wins; later attempts fail with
/// [`ClientError::AlreadySettled`] and leave the delivered outcome intact.
pub struct Completion<T> {
    tx: Mutex<Option<oneshot::Sender<Outcome<T>>>>,
}

/// Awaiting side of a [`Completion`].
///
/// Resolves to [`ClientError::Aborted`] if the completion is dropped unsettled.
pub struct Waiter<T> {
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T> Completion<T> {
    pub fn new() -> (Self, Waiter<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            Waiter { rx },
        )
    }

    pub fn resolve(&self, value: T) -> Result<(), ClientError> {
        self.settle(Ok(value))
    }

    pub fn reject(&self, error: ClientError) -> Result<(), ClientError> {
        self.settle(Err(error))
    }

    /// Rejects with [`ClientError::Aborted`].
    pub fn cancel(&self) -> Result<(), ClientError> {
        self.settle(Err(ClientError::Aborted))
    }

    pub fn is_settled(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Re-arms the completion and returns a waiter for the new outcome.
    ///
    /// A waiter still attached to the previous round resolves to `Aborted`.
    pub fn reset(&self) -> Waiter<T> {
        let (tx, rx) = oneshot::channel();
        *self.tx.lock() = Some(tx);
        Waiter { rx }
    }

    fn settle(&self, outcome: Outcome<T>) -> Result<(), ClientError> {
        let tx = self.tx.lock().take().ok_or(ClientError::AlreadySettled)?;
        // Nobody awaiting is fine; the outcome is simply dropped.
        let _ = tx.send(outcome);
        Ok(())
    }
}

impl<T> Future for Waiter<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::Aborted)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::task;
    use tokio_test::{assert_pending, assert_ready};

    #[test]
    fn test_resolve_once() {
        let (completion, waiter) = Completion::new();
        let mut waiter = task::spawn(waiter);
        assert_pending!(waiter.poll());
        assert!(!completion.is_settled());

        completion.resolve(7u32).unwrap();
        assert!(completion.is_settled());
        assert!(waiter.is_woken());
        assert_eq!(assert_ready!(waiter.poll()).unwrap(), 7);

        // Second settle fails and does not disturb the first outcome
        assert!(matches!(
            completion.resolve(8),
            Err(ClientError::AlreadySettled)
        ));
        assert!(matches!(
            completion.reject(ClientError::Timeout),
            Err(ClientError::AlreadySettled)
        ));
    }

    #[test]
    fn test_reject_and_cancel() {
        let (completion, waiter) = Completion::<u32>::new();
        let mut waiter = task::spawn(waiter);
        completion.reject(ClientError::ConnectionClosed).unwrap();
        assert!(matches!(
            assert_ready!(waiter.poll()),
            Err(ClientError::ConnectionClosed)
        ));

        let (completion, waiter) = Completion::<u32>::new();
        let mut waiter = task::spawn(waiter);
        completion.cancel().unwrap();
        assert!(matches!(
            assert_ready!(waiter.poll()),
            Err(ClientError::Aborted)
        ));
    }

    #[test]
    fn test_dropped_completion_aborts() {
        let (completion, waiter) = Completion::<u32>::new();
        let mut waiter = task::spawn(waiter);
        drop(completion);
        assert!(matches!(
            assert_ready!(waiter.poll()),
            Err(ClientError::Aborted)
        ));
    }

    #[test]
    fn test_reset() {
        let (completion, first) = Completion::new();
        completion.resolve("first").unwrap();

        let mut second = task::spawn(completion.reset());
        assert!(!completion.is_settled());
        assert_pending!(second.poll());

        completion.resolve("second").unwrap();
        assert_eq!(assert_ready!(second.poll()).unwrap(), "second");
        assert_eq!(tokio_test::block_on(first).unwrap(), "first");
    }
}
