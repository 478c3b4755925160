use crate::error::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::time::sleep;

/// A timed counting semaphore bounding the number of names in flight.
///
/// Permits are returned either explicitly on a request's terminal
/// disposition, or automatically: one permit per release interval. The
/// automatic release recovers permits tied to requests lost mid-pipeline, so
/// the engine cannot deadlock on a missing `release`.
pub struct FlowLimiter {
    inner: Arc<Inner>,
    stop_tx: watch::Sender<bool>,
}

struct Inner {
    sem: Semaphore,
    // permits currently held by callers; caps releases so the pool never
    // grows past its capacity
    outstanding: AtomicUsize,
}

impl Inner {
    fn release_one(&self) {
        let mut held = self.outstanding.load(Ordering::Acquire);
        loop {
            if held == 0 {
                return;
            }
            match self.outstanding.compare_exchange(
                held,
                held - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.sem.add_permits(1);
                    return;
                }
                Err(current) => held = current,
            }
        }
    }
}

impl FlowLimiter {
    /// Create a limiter with `capacity` permits, auto-releasing one every
    /// `interval`.
    pub fn new(capacity: usize, interval: Duration) -> Self {
        let inner = Arc::new(Inner {
            sem: Semaphore::new(capacity),
            outstanding: AtomicUsize::new(0),
        });
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let ticker = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(interval) => ticker.release_one(),
                    _ = stop_rx.changed() => return,
                }
            }
        });

        Self { inner, stop_tx }
    }

    /// Block until `n` permits are available. Fails with `Stopped` once
    /// `stop` was called.
    pub async fn acquire(&self, n: usize) -> Result<()> {
        let permit = self
            .inner
            .sem
            .acquire_many(n as u32)
            .await
            .map_err(|_| Error::Stopped)?;
        permit.forget();
        self.inner.outstanding.fetch_add(n, Ordering::AcqRel);
        Ok(())
    }

    /// Return `n` permits. Releasing more than is held is a no-op.
    pub fn release(&self, n: usize) {
        for _ in 0..n {
            self.inner.release_one();
        }
    }

    /// Stop the ticker and fail all pending and future acquires.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        self.inner.sem.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn in_flight_count_is_bounded() {
        let flow = FlowLimiter::new(2, Duration::from_secs(60));
        flow.acquire(1).await.unwrap();
        flow.acquire(1).await.unwrap();

        // the pool is exhausted, a third acquire must park
        let blocked = timeout(Duration::from_millis(50), flow.acquire(1)).await;
        assert!(blocked.is_err());

        flow.release(1);
        timeout(Duration::from_millis(50), flow.acquire(1))
            .await
            .expect("released permit should be reusable")
            .unwrap();
    }

    #[tokio::test]
    async fn lost_permits_are_recovered_over_time() {
        let flow = FlowLimiter::new(1, Duration::from_millis(10));
        flow.acquire(1).await.unwrap();

        // no explicit release: the ticker must hand the permit back
        timeout(Duration::from_millis(500), flow.acquire(1))
            .await
            .expect("auto-release should recover the permit")
            .unwrap();
    }

    #[tokio::test]
    async fn over_release_does_not_grow_the_pool() {
        let flow = FlowLimiter::new(1, Duration::from_secs(60));
        flow.acquire(1).await.unwrap();
        flow.release(5);

        flow.acquire(1).await.unwrap();
        let blocked = timeout(Duration::from_millis(50), flow.acquire(1)).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn acquire_fails_after_stop() {
        let flow = FlowLimiter::new(1, Duration::from_millis(10));
        flow.acquire(1).await.unwrap();
        flow.stop();

        match flow.acquire(1).await {
            Err(Error::Stopped) => {}
            other => panic!("expected Stopped, got {other:?}"),
        }
    }
}
