use std::fmt;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_core::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::ReusableBoxFuture;

type Recv<T> = (Result<T, RecvError>, broadcast::Receiver<T>);

async fn recv<T: Clone>(mut rx: broadcast::Receiver<T>) -> Recv<T> {
    let result = rx.recv().await;
    (result, rx)
}

/// A broadcast receiver as a [`Stream`].
///
/// Each subscription observes every item sent after it was created, in send
/// order. A subscriber that falls behind skips the overwritten items with a
/// warning and keeps going. The stream ends when every sender is gone.
pub struct Subscription<T> {
    label: &'static str,
    inner: ReusableBoxFuture<'static, Recv<T>>,
}

impl<T> Subscription<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(label: &'static str, rx: broadcast::Receiver<T>) -> Self {
        Self {
            label,
            inner: ReusableBoxFuture::new(recv(rx)),
        }
    }
}

impl<T> Stream for Subscription<T>
where
    T: Clone + Send + 'static,
{
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        loop {
            let (result, rx) = ready!(self.inner.poll(cx));
            self.inner.set(recv(rx));
            match result {
                Ok(item) => return Poll::Ready(Some(item)),
                Err(RecvError::Closed) => return Poll::Ready(None),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(subscription = self.label, skipped, "subscriber lagged");
                }
            }
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("label", &self.label)
            .finish()
    }
}
