//! Cooperative stop signal shared by a runner and its stages.

use std::sync::Arc;
use tokio::sync::watch;

/// Level-triggered stop flag. Once stopped it stays stopped; every clone observes it.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`StopSignal::stop`] has been called on any clone.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in `self`, so this only returns once the flag flips.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_wakes_all_clones() {
        let signal = StopSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.stopped().await });

        assert!(!signal.is_stopped());
        signal.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should observe stop")
            .expect("waiter task panicked");
        assert!(signal.is_stopped());
    }

    #[tokio::test]
    async fn test_stopped_returns_immediately_when_already_stopped() {
        let signal = StopSignal::new();
        signal.stop();
        signal.clone().stopped().await;
    }
}
