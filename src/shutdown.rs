//! Cooperative shutdown signal
//!
//! Every suspension point in the engine waits on a bounded timer *and* this
//! signal, so an interrupt ends the owning loop at its next wait.

use std::time::Duration;
use tokio::sync::watch;

use crate::error::FeedError;

/// Sending half, held by whoever decides to stop the subscription
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving half, cloned into every loop and background task
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl Shutdown {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_, shutdown) = channel();
        shutdown
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested. A dropped trigger never fires.
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for `duration` unless shutdown arrives first
    pub async fn sleep(&mut self, duration: Duration) -> Result<(), FeedError> {
        if self.is_triggered() {
            return Err(FeedError::Interrupted);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.triggered() => Err(FeedError::Interrupted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_completes_without_trigger() {
        let (_trigger, mut shutdown) = channel();
        assert!(shutdown.sleep(Duration::from_millis(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_trigger_interrupts_sleep() {
        let (trigger, mut shutdown) = channel();
        let handle = tokio::spawn(async move { shutdown.sleep(Duration::from_secs(60)).await });
        trigger.trigger();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(FeedError::Interrupted)));
    }

    #[tokio::test]
    async fn test_never_does_not_interrupt() {
        let mut shutdown = Shutdown::never();
        assert!(shutdown.sleep(Duration::from_millis(5)).await.is_ok());
        assert!(!shutdown.is_triggered());
    }
}
