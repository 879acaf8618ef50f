//! Byte-counting stream wrapper for download accounting.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

/// Stream wrapper that adds every chunk's length to a shared counter
pub struct CountingStream<S> {
    inner: S,
    counter: Arc<AtomicU64>,
}

impl<S> CountingStream<S> {
    pub fn new(inner: S, counter: Arc<AtomicU64>) -> Self {
        Self { inner, counter }
    }
}

impl<S, E> Stream for CountingStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let inner = Pin::new(&mut self.inner);

        match inner.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.counter.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                Poll::Ready(Some(Ok(bytes)))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};

    #[tokio::test]
    async fn test_counts_chunks() {
        let counter = Arc::new(AtomicU64::new(0));
        let chunks = vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"defgh")),
        ];

        let collected: Vec<_> = CountingStream::new(stream::iter(chunks), Arc::clone(&counter))
            .collect()
            .await;

        assert_eq!(collected.len(), 2);
        assert_eq!(counter.load(Ordering::Relaxed), 8);
    }
}
