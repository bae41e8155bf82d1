//! Byte-counting stream wrapper that also feeds an optional digest.

use super::digest::{HashAlgorithm, Hasher};
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

/// Shared view of what a `MeteredStream` has seen so far.
#[derive(Clone)]
pub struct Meter {
    bytes: Arc<AtomicU64>,
    hasher: Arc<Mutex<Option<Hasher>>>,
}

impl Meter {
    pub fn new(algorithm: Option<HashAlgorithm>) -> Self {
        Self {
            bytes: Arc::new(AtomicU64::new(0)),
            hasher: Arc::new(Mutex::new(algorithm.map(Hasher::new))),
        }
    }

    /// Get total bytes transferred
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Finish the digest. Returns `None` when no algorithm was requested or the
    /// digest was already taken.
    pub fn take_digest(&self) -> Option<String> {
        let mut guard = match self.hasher.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take().map(Hasher::finalize)
    }

    fn record(&self, chunk: &[u8]) {
        self.bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        let mut guard = match self.hasher.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(hasher) = guard.as_mut() {
            hasher.update(chunk);
        }
    }
}

/// Stream wrapper that tracks bytes transferred
pub struct MeteredStream<S> {
    inner: S,
    meter: Meter,
}

impl<S> MeteredStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    pub fn new(inner: S, meter: Meter) -> Self {
        Self { inner, meter }
    }
}

impl<S> Stream for MeteredStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let inner = Pin::new(&mut self.inner);

        match inner.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.meter.record(&bytes);
                Poll::Ready(Some(Ok(bytes)))
            }
            other => other,
        }
    }
}
