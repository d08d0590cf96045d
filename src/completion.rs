//! Write and close completion handles
//!
//! A [`Promise`] is held by the multiplexer; the matching [`Completion`] is
//! returned to the caller and may be awaited or polled without a runtime
//! via [`Completion::try_result`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Producer half: resolved exactly once by the multiplexer
#[derive(Debug)]
pub struct Promise {
    tx: oneshot::Sender<Result<()>>,
}

impl Promise {
    /// Resolve successfully
    pub fn succeed(self) {
        // Receiver may have been dropped; nobody is waiting then.
        let _ = self.tx.send(Ok(()));
    }

    /// Resolve with an error
    pub fn fail(self, error: Error) {
        let _ = self.tx.send(Err(error));
    }

    /// Resolve with `result`
    pub fn complete(self, result: Result<()>) {
        let _ = self.tx.send(result);
    }
}

/// Consumer half: a future resolving to the outcome of a write or close
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<()>>,
    taken: bool,
}

impl Completion {
    /// Create a linked promise/completion pair
    pub fn pair() -> (Promise, Completion) {
        let (tx, rx) = oneshot::channel();
        (Promise { tx }, Completion { rx, taken: false })
    }

    /// A completion that is already resolved
    pub fn ready(result: Result<()>) -> Self {
        let (promise, completion) = Self::pair();
        promise.complete(result);
        completion
    }

    /// A completion that already failed
    pub fn failed(error: Error) -> Self {
        Self::ready(Err(error))
    }

    /// Non-blocking check; `None` while still pending
    ///
    /// Returns the outcome once. A promise dropped without being resolved
    /// reads as `Error::ChannelClosed`.
    pub fn try_result(&mut self) -> Option<Result<()>> {
        if self.taken {
            return None;
        }
        let out = match self.rx.try_recv() {
            Ok(result) => result,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Err(Error::ChannelClosed),
        };
        self.taken = true;
        Some(out)
    }
}

impl Future for Completion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.taken {
            return Poll::Ready(Err(Error::InvalidState("completion already consumed")));
        }
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                self.taken = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                self.taken = true;
                Poll::Ready(Err(Error::ChannelClosed))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_then_resolved() {
        let (promise, mut completion) = Completion::pair();
        assert!(completion.try_result().is_none());

        promise.succeed();
        assert_eq!(completion.try_result(), Some(Ok(())));
        assert!(completion.try_result().is_none());
    }

    #[test]
    fn test_dropped_promise_reads_closed() {
        let (promise, mut completion) = Completion::pair();
        drop(promise);
        assert_eq!(completion.try_result(), Some(Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_await_failed() {
        let completion = Completion::failed(Error::ConnectionClosed);
        assert_eq!(completion.await, Err(Error::ConnectionClosed));
    }
}
