use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;

/// Body stream that owns a cleanup guard.
///
/// The guard is released as soon as the inner stream finishes or yields an
/// error, and otherwise when hyper drops the body (client gone). Either way it
/// is dropped exactly once and never while a read is in flight.
pub struct GuardedStream<S, G> {
    inner: S,
    guard: Option<G>,
}

impl<S, G> GuardedStream<S, G> {
    pub fn new(inner: S, guard: G) -> Self {
        Self {
            inner,
            guard: Some(guard),
        }
    }
}

impl<S, G, T, E> Stream for GuardedStream<S, G>
where
    S: Stream<Item = Result<T, E>> + Unpin,
    G: Unpin,
{
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_next(cx);
        if matches!(polled, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            this.guard.take();
        }
        polled
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use futures::{StreamExt, stream};

    use super::*;

    struct CountDrops(Arc<AtomicUsize>);

    impl Drop for CountDrops {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn guard_released_once_after_last_item() {
        let drops = Arc::new(AtomicUsize::new(0));
        let items = stream::iter(vec![Ok::<_, std::io::Error>(1), Ok(2)]);
        let mut guarded = GuardedStream::new(items, CountDrops(drops.clone()));

        assert_eq!(guarded.next().await.unwrap().unwrap(), 1);
        assert_eq!(guarded.next().await.unwrap().unwrap(), 2);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        assert!(guarded.next().await.is_none());
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        drop(guarded);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn guard_released_on_error() {
        let drops = Arc::new(AtomicUsize::new(0));
        let items = stream::iter(vec![Err::<u8, _>(std::io::Error::other("broken pipe"))]);
        let mut guarded = GuardedStream::new(items, CountDrops(drops.clone()));

        assert!(guarded.next().await.unwrap().is_err());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn guard_released_when_abandoned() {
        let drops = Arc::new(AtomicUsize::new(0));
        let items = stream::iter(vec![Ok::<_, std::io::Error>(1), Ok(2)]);
        let mut guarded = GuardedStream::new(items, CountDrops(drops.clone()));

        let _ = guarded.next().await;
        drop(guarded);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
