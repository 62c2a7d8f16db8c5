//! Trailing-edge send coalescing.
//!
//! Local cursor and selection movement arrives in bursts far faster
//! than peers need to see it. A [`Debouncer`] collapses each burst
//! into its single newest value, emitted once the input has been quiet
//! for the configured delay — one timer-coalescing buffer per stream
//! instead of timeout handles scattered across call sites. Backpressure
//! only; correctness never depends on it.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Coalesces a bursty input stream into its latest value.
pub struct Debouncer<T> {
    input: mpsc::Sender<T>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> Debouncer<T> {
    /// Start the coalescing task. Whatever survives a quiet window of
    /// `delay` is forwarded to `out`.
    pub fn new(delay: Duration, out: mpsc::Sender<T>) -> Self {
        let (input, mut rx) = mpsc::channel::<T>(64);
        let task = tokio::spawn(async move {
            while let Some(mut latest) = rx.recv().await {
                loop {
                    match tokio::time::timeout(delay, rx.recv()).await {
                        // Newer value within the window: keep it, restart the window.
                        Ok(Some(newer)) => latest = newer,
                        // Input closed: flush and stop.
                        Ok(None) => {
                            let _ = out.send(latest).await;
                            return;
                        }
                        // Quiet window elapsed: flush.
                        Err(_) => break,
                    }
                }
                if out.send(latest).await.is_err() {
                    return;
                }
            }
        });
        Self { input, task }
    }

    /// Offer a value. Returns `false` if the buffer is full or the
    /// debouncer is shut down — callers treat that as a dropped frame,
    /// never as an error.
    pub fn offer(&self, value: T) -> bool {
        self.input.try_send(value).is_ok()
    }

    /// Stop immediately, discarding any unflushed value.
    pub fn abort(self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_burst_collapses_to_newest() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let debouncer = Debouncer::new(Duration::from_millis(20), out_tx);

        for i in 0..10 {
            assert!(debouncer.offer(i));
        }

        let value = timeout(Duration::from_millis(500), out_rx.recv())
            .await
            .expect("flush within timeout")
            .unwrap();
        assert_eq!(value, 9);

        // Nothing else pending.
        assert!(timeout(Duration::from_millis(50), out_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_separate_bursts_emit_separately() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let debouncer = Debouncer::new(Duration::from_millis(10), out_tx);

        debouncer.offer("first");
        sleep(Duration::from_millis(40)).await;
        debouncer.offer("second");

        let a = timeout(Duration::from_millis(500), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let b = timeout(Duration::from_millis(500), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((a, b), ("first", "second"));
    }

    #[tokio::test]
    async fn test_drop_flushes_pending_value() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let debouncer = Debouncer::new(Duration::from_secs(60), out_tx);
        debouncer.offer(42);
        // Dropping the input closes the stream; the pending value still
        // comes out rather than vanishing.
        drop(debouncer.input);
        let value = timeout(Duration::from_millis(500), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_abort_discards() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let debouncer = Debouncer::new(Duration::from_millis(10), out_tx);
        debouncer.offer(1);
        debouncer.abort();
        assert!(timeout(Duration::from_millis(100), out_rx.recv())
            .await
            .map(|v| v.is_none())
            .unwrap_or(true));
    }
}
