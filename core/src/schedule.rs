//! Deferred timer actions
//!
//! Coordinators never sleep or spawn. They queue [`Deferred`] actions, and the
//! runtime loop that owns them arms each one on the tokio timer, posting the
//! payload back to the same loop when it fires.

use std::time::Duration;
use tokio::sync::mpsc;

/// A timer payload to deliver after `delay`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deferred<T> {
    pub delay: Duration,
    pub timer: T,
}

impl<T> Deferred<T> {
    pub fn new(delay: Duration, timer: T) -> Self {
        Self { delay, timer }
    }
}

/// Spawn a sleep that delivers `deferred.timer` into `sink`
pub fn arm<T: Send + 'static>(deferred: Deferred<T>, sink: mpsc::UnboundedSender<T>) {
    tokio::spawn(async move {
        tokio::time::sleep(deferred.delay).await;
        // Receiver gone means the owning loop has shut down
        let _ = sink.send(deferred.timer);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_armed_timer_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        arm(Deferred::new(Duration::from_secs(5), 42u32), tx);
        // Let the timer task register its sleep
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(rx.recv().await, Some(42));
    }

    #[tokio::test]
    async fn test_zero_delay_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        arm(Deferred::new(Duration::ZERO, "now"), tx);
        assert_eq!(rx.recv().await, Some("now"));
    }
}
